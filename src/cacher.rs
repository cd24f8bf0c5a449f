//! Cache phase
//!
//! Publishes every `cache=true` layer into the cache store. A layer
//! whose SHA matches the previous cache's metadata is carried forward
//! by pointer; everything else is tarred and copied in. The store
//! becomes visible atomically at commit.

use crate::buildpack::Buildpack;
use crate::cache::Cache;
use crate::error::{KilnError, KilnResult, ResultExt};
use crate::layers::BuildpackLayers;
use crate::metadata::{BuildpackLayersMetadata, CacheMetadata};
use std::path::{Path, PathBuf};
use tracing::info;

pub struct Cacher {
    pub buildpacks: Vec<Buildpack>,
    /// Scratch space for layer tars
    pub artifacts_dir: PathBuf,
    pub uid: u32,
    pub gid: u32,
}

impl Cacher {
    pub async fn cache(&self, layers_dir: &Path, cache: &mut dyn Cache) -> KilnResult<()> {
        let orig_metadata = cache
            .retrieve_metadata()
            .await
            .ctx("metadata for previous cache")?;

        let mut new_metadata = CacheMetadata::default();

        for buildpack in &self.buildpacks {
            let bp_layers = BuildpackLayers::read(layers_dir, buildpack)
                .await
                .ctx(format!("reading layers for buildpack '{}'", buildpack.id))?;
            let orig_layers = orig_metadata.layers_for(&buildpack.id);
            let mut bp_meta = BuildpackLayersMetadata {
                id: buildpack.id.clone(),
                version: buildpack.version.clone(),
                layers: Default::default(),
            };

            for layer in bp_layers.find_layers(|m| m.cache).await? {
                let mut layer_meta = layer
                    .read()
                    .await
                    .ctx(format!("reading '{}' metadata", layer.identifier()))?;
                let previous_sha = orig_layers
                    .get(layer.name())
                    .map(|l| l.sha.as_str())
                    .unwrap_or_default();

                // A fresh sidecar SHA matching the previous cache means
                // the tar is already in the store; skip re-archiving.
                if layer_meta.sha.is_empty() || layer_meta.sha != previous_sha {
                    let tar_path = self.tar_path(layer.identifier());
                    let src = layer.path().to_path_buf();
                    let dest = tar_path.clone();
                    let (uid, gid) = (self.uid, self.gid);
                    layer_meta.sha = tokio::task::spawn_blocking(move || {
                        crate::archive::write_tar_file(&src, &dest, uid, gid)
                    })
                    .await
                    .map_err(|e| KilnError::Internal(format!("tar task panicked: {e}")))?
                    .ctx(format!("caching layer '{}'", layer.identifier()))?;
                }

                if !previous_sha.is_empty() && layer_meta.sha == previous_sha {
                    info!(
                        "Reusing cached layer '{}' with SHA {}",
                        layer.identifier(),
                        layer_meta.sha
                    );
                    cache
                        .reuse_layer(&layer_meta.sha)
                        .await
                        .ctx(format!("reusing layer '{}'", layer.identifier()))?;
                } else {
                    info!(
                        "Caching layer '{}' with SHA {}",
                        layer.identifier(),
                        layer_meta.sha
                    );
                    cache
                        .add_layer_file(&self.tar_path(layer.identifier()), &layer_meta.sha)
                        .await
                        .ctx(format!("caching layer '{}'", layer.identifier()))?;
                }

                bp_meta
                    .layers
                    .insert(layer.name().to_string(), layer_meta);
            }
            new_metadata.buildpacks.push(bp_meta);
        }

        cache
            .set_metadata(&new_metadata)
            .await
            .ctx("setting cache metadata")?;
        cache.commit().await.ctx("committing cache")
    }

    fn tar_path(&self, identifier: &str) -> PathBuf {
        self.artifacts_dir
            .join(format!("{}.tar", identifier.replace(['/', ':'], "_")))
    }
}
