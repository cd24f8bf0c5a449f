//! Restore phase
//!
//! Reconciles on-disk cache layers with the cache store: stale and
//! malformed layers are purged, valid ones are re-extracted from their
//! cached tars. After this phase every `cache=true` layer on disk
//! matches the cache store's SHA for it, or is gone.

use crate::buildpack::Buildpack;
use crate::cache::Cache;
use crate::error::{KilnError, KilnResult, ResultExt};
use crate::layers::{recursive_chown, BuildpackLayers, CacheClass, Layer};
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct Restorer {
    pub layers_dir: PathBuf,
    pub buildpacks: Vec<Buildpack>,
    pub uid: u32,
    pub gid: u32,
    /// UID this process runs as; ownership is fixed up only for root
    pub process_uid: u32,
}

impl Restorer {
    pub async fn restore(&self, cache: &dyn Cache) -> KilnResult<()> {
        let cache_meta = cache
            .retrieve_metadata()
            .await
            .ctx("retrieving cache metadata")?;

        // Classification pass: decide per layer, queue extractions.
        let mut to_extract: Vec<(Layer, String)> = Vec::new();
        for buildpack in &self.buildpacks {
            let bp_layers = BuildpackLayers::read(&self.layers_dir, buildpack)
                .await
                .ctx("reading buildpack layer directory")?;
            let cached_layers = cache_meta.layers_for(&buildpack.id);

            for layer in bp_layers.layers() {
                match layer.classify(&cached_layers).await {
                    CacheClass::Malformed => {
                        warn!(
                            "Removing \"{}\", metadata is unreadable",
                            layer.identifier()
                        );
                        layer.remove().await?;
                    }
                    CacheClass::NotForLaunch => {
                        let meta = layer.read().await?;
                        if !meta.cache {
                            // build-only layer, not ours to manage
                            continue;
                        }
                        match cached_layers.get(layer.name()) {
                            Some(entry) if entry.cache && !entry.sha.is_empty() => {
                                debug!(
                                    "Restoring cache-only layer \"{}\" with SHA {}",
                                    layer.identifier(),
                                    entry.sha
                                );
                                layer.write_metadata(entry).await?;
                                layer.write_sha(&entry.sha).await?;
                                clear_contents(layer).await?;
                                to_extract.push((layer.clone(), entry.sha.clone()));
                            }
                            _ => {
                                info!(
                                    "Removing \"{}\", not in cache",
                                    layer.identifier()
                                );
                                layer.remove().await?;
                            }
                        }
                    }
                    CacheClass::StaleNoMetadata => {
                        let meta = layer.read().await?;
                        if !meta.cache {
                            continue;
                        }
                        info!(
                            "Removing \"{}\", cache has no metadata for it",
                            layer.identifier()
                        );
                        layer.remove().await?;
                    }
                    CacheClass::StaleWrongSha => {
                        let meta = layer.read().await?;
                        if !meta.cache {
                            continue;
                        }
                        info!("Removing \"{}\", wrong SHA", layer.identifier());
                        layer.remove().await?;
                    }
                    CacheClass::Valid => {
                        let meta = layer.read().await?;
                        if !meta.cache {
                            continue;
                        }
                        debug!(
                            "Restoring cached layer \"{}\" with SHA {}",
                            layer.identifier(),
                            meta.sha
                        );
                        clear_contents(layer).await?;
                        to_extract.push((layer.clone(), meta.sha.clone()));
                    }
                }
            }
        }

        // Extraction pass: layers land at disjoint paths, so the tar
        // streams can unpack concurrently.
        let mut join_set = JoinSet::new();
        for (layer, sha) in to_extract {
            let reader = cache
                .retrieve_layer(&sha)
                .await
                .ctx(format!("retrieving cached layer \"{}\"", layer.identifier()))?;
            let identifier = layer.identifier().to_string();
            join_set.spawn_blocking(move || {
                crate::archive::untar(reader, Path::new("/"))
                    .ctx(format!("extracting cached layer \"{identifier}\""))
            });
        }
        while let Some(joined) = join_set.join_next().await {
            joined.map_err(|e| KilnError::Internal(format!("extraction task panicked: {e}")))??;
        }

        if self.process_uid == 0 {
            recursive_chown(&self.layers_dir, self.uid, self.gid)
                .ctx(format!("chowning layers dir to '{}/{}'", self.uid, self.gid))?;
        }
        Ok(())
    }
}

/// Drop a layer's contents directory (sidecars stay) so extraction
/// starts from a clean slate.
async fn clear_contents(layer: &Layer) -> KilnResult<()> {
    match tokio::fs::remove_dir_all(layer.path()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KilnError::io(
            format!("clearing layer \"{}\"", layer.identifier()),
            e,
        )),
    }
}
