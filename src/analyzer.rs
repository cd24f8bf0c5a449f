//! Analyze phase
//!
//! Reads the previous app image's metadata label and the cache store's
//! metadata, and writes per-layer sidecars into the layers directory so
//! later phases (and buildpacks) know what existed before. Analysis
//! never deletes anything; destructive reconciliation belongs to the
//! restore phase.

use crate::buildpack::Buildpack;
use crate::cache::Cache;
use crate::error::{KilnResult, ResultExt};
use crate::image::Image;
use crate::layers::{recursive_chown, BuildpackLayers};
use crate::metadata::{self, AnalyzedMetadata, ImageIdentifier, LayerMetadata};
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub struct Analyzer {
    pub layers_dir: PathBuf,
    pub buildpacks: Vec<Buildpack>,
    pub uid: u32,
    pub gid: u32,
    /// UID this process runs as; ownership is fixed up only for root
    pub process_uid: u32,
    pub skip_layers: bool,
}

impl Analyzer {
    pub async fn analyze(
        &self,
        image: &dyn Image,
        cache: &dyn Cache,
    ) -> KilnResult<AnalyzedMetadata> {
        let image_id = self
            .image_identifier(image)
            .await
            .ctx("retrieving image identifier")?;

        let app_meta = metadata::layers_metadata_from_image(image)
            .await
            .ctx("getting app image metadata")?;

        if self.skip_layers {
            info!("Skipping buildpack layer analysis");
            return Ok(AnalyzedMetadata {
                image: image_id,
                metadata: app_meta,
            });
        }

        let cache_meta = cache
            .retrieve_metadata()
            .await
            .ctx("retrieving cache metadata")?;

        for buildpack in &self.buildpacks {
            let bp_layers = BuildpackLayers::read(&self.layers_dir, buildpack)
                .await
                .ctx("reading buildpack layer directory")?;

            // Launch layers come from the app image. The restore phase
            // will bring back the data for cache=true ones or delete them.
            for (name, layer) in app_meta.layers_for(&buildpack.id) {
                let identifier = format!("{}:{}", buildpack.id, name);
                if !layer.launch {
                    info!("Not restoring metadata for \"{identifier}\", marked as launch=false");
                    continue;
                }
                if layer.build && !layer.cache {
                    info!(
                        "Not restoring metadata for \"{identifier}\", marked as build=true, cache=false"
                    );
                    continue;
                }
                info!("Restoring metadata for \"{identifier}\" from app image");
                self.write_layer_metadata(&bp_layers, &name, &layer).await?;
            }

            // Cache-only layers come from the cache store's metadata.
            for (name, layer) in cache_meta.layers_for(&buildpack.id) {
                let identifier = format!("{}:{}", buildpack.id, name);
                if !layer.cache {
                    debug!("Not restoring \"{identifier}\" from cache, marked as cache=false");
                    continue;
                }
                if layer.launch {
                    debug!("Not restoring \"{identifier}\" from cache, marked as launch=true");
                    continue;
                }
                info!("Restoring metadata for \"{identifier}\" from cache");
                self.write_layer_metadata(&bp_layers, &name, &layer).await?;
            }
        }

        if self.process_uid == 0 {
            recursive_chown(&self.layers_dir, self.uid, self.gid)
                .ctx(format!("chowning layers dir to '{}/{}'", self.uid, self.gid))?;
        }

        Ok(AnalyzedMetadata {
            image: image_id,
            metadata: app_meta,
        })
    }

    async fn image_identifier(&self, image: &dyn Image) -> KilnResult<Option<ImageIdentifier>> {
        if !image.found().await? {
            warn!("Image \"{}\" not found", image.name());
            return Ok(None);
        }
        let reference = image.identifier().await?;
        debug!("Analyzing image \"{reference}\"");
        Ok(Some(ImageIdentifier { reference }))
    }

    async fn write_layer_metadata(
        &self,
        bp_layers: &BuildpackLayers,
        name: &str,
        meta: &LayerMetadata,
    ) -> KilnResult<()> {
        let layer = bp_layers.layer(name);
        debug!("Writing layer metadata for \"{}\"", layer.identifier());
        layer.write_metadata(meta).await?;
        layer.write_sha(&meta.sha).await
    }
}
