//! Export phase
//!
//! Assembles the app image: the `app`, `config`, and `launcher`
//! pseudo-layers in fixed order, then each buildpack's launch layers in
//! group order. A layer whose canonical tar SHA matches the previous
//! image's metadata is reused by pointer instead of re-added. Finishes
//! by stamping the metadata labels, env, and entrypoint, then saving
//! under every target name.

use crate::buildpack::Buildpack;
use crate::error::{KilnError, KilnResult, ResultExt};
use crate::image::{Image, SaveOutcome, SaveResult};
use crate::layers::BuildpackLayers;
use crate::metadata::{
    BuildMetadata, BuildTomlFile, BuildpackLayersMetadata, LauncherMetadata, LayerMetadata,
    LayersMetadata, StackMetadata, BUILD_METADATA_LABEL, LAYERS_METADATA_LABEL,
};
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variables stamped onto the exported image
pub const ENV_LAYERS_DIR: &str = "CNB_LAYERS_DIR";
pub const ENV_APP_DIR: &str = "CNB_APP_DIR";

pub struct Exporter {
    pub buildpacks: Vec<Buildpack>,
    /// Scratch space for layer tars
    pub artifacts_dir: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub launcher_version: String,
}

impl Exporter {
    #[allow(clippy::too_many_arguments)]
    pub async fn export(
        &self,
        layers_dir: &Path,
        app_dir: &Path,
        app_image: &mut dyn Image,
        orig_metadata: &LayersMetadata,
        additional_names: &[String],
        launcher: &Path,
        stack: StackMetadata,
    ) -> KilnResult<SaveResult> {
        let mut meta = LayersMetadata {
            stack,
            ..LayersMetadata::default()
        };

        meta.run_image.top_layer = app_image
            .top_layer()
            .await
            .ctx("get run image top layer SHA")?;
        meta.run_image.reference = app_image.identifier().await.ctx("get run image reference")?;

        meta.app = LayerMetadata::with_sha(
            self.add_or_reuse(app_image, "app", app_dir, &orig_metadata.app.sha)
                .await
                .ctx("exporting app layer")?,
        );
        meta.config = LayerMetadata::with_sha(
            self.add_or_reuse(
                app_image,
                "config",
                &layers_dir.join("config"),
                &orig_metadata.config.sha,
            )
            .await
            .ctx("exporting config layer")?,
        );
        meta.launcher = LayerMetadata::with_sha(
            self.add_or_reuse(app_image, "launcher", launcher, &orig_metadata.launcher.sha)
                .await
                .ctx("exporting launcher layer")?,
        );

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

            for layer in bp_layers.find_layers(|m| m.launch).await? {
                let mut layer_meta = layer
                    .read()
                    .await
                    .ctx(format!("reading '{}' metadata", layer.identifier()))?;

                if layer.has_contents() {
                    let prev_sha = orig_layers
                        .get(layer.name())
                        .map(|l| l.sha.as_str())
                        .unwrap_or_default();
                    layer_meta.sha = self
                        .add_or_reuse(app_image, layer.identifier(), layer.path(), prev_sha)
                        .await?;
                } else {
                    if layer_meta.cache {
                        return Err(KilnError::CacheMissingContents(
                            layer.identifier().to_string(),
                        ));
                    }
                    let prev = orig_layers.get(layer.name()).ok_or_else(|| {
                        KilnError::MissingReuseSource(layer.identifier().to_string())
                    })?;
                    info!(
                        "Reusing layer '{}' with SHA {}",
                        layer.identifier(),
                        prev.sha
                    );
                    app_image
                        .reuse_layer(&prev.sha)
                        .await
                        .ctx(format!("reusing layer '{}'", layer.identifier()))?;
                    layer_meta.sha = prev.sha.clone();
                }
                bp_meta
                    .layers
                    .insert(layer.name().to_string(), layer_meta);
            }

            // Cache-only layers never enter the app image, but cache
            // metadata without matching content is a buildpack bug.
            for layer in bp_layers.find_layers(|m| m.cache && !m.launch).await? {
                if !layer.has_contents() {
                    return Err(KilnError::CacheMissingContents(
                        layer.identifier().to_string(),
                    ));
                }
            }

            let malformed = bp_layers.malformed_layers().await;
            if !malformed.is_empty() {
                return Err(KilnError::MalformedLayers(
                    malformed.iter().map(|l| l.identifier().to_string()).collect(),
                ));
            }

            meta.buildpacks.push(bp_meta);
        }

        let label = serde_json::to_string(&meta)?;
        app_image
            .set_label(LAYERS_METADATA_LABEL, &label)
            .await
            .ctx("set app image metadata label")?;

        let build_file = BuildTomlFile::from_file(&BuildTomlFile::path(layers_dir)).await?;
        let build_meta = BuildMetadata {
            bom: build_file.bom,
            buildpacks: self.buildpacks.clone(),
            processes: build_file.processes,
            launcher: LauncherMetadata {
                version: self.launcher_version.clone(),
            },
        };
        app_image
            .set_label(BUILD_METADATA_LABEL, &serde_json::to_string(&build_meta)?)
            .await
            .ctx("set build metadata label")?;

        app_image
            .set_env(ENV_LAYERS_DIR, &layers_dir.to_string_lossy())
            .await
            .ctx(format!("set app image env {ENV_LAYERS_DIR}"))?;
        app_image
            .set_env(ENV_APP_DIR, &app_dir.to_string_lossy())
            .await
            .ctx(format!("set app image env {ENV_APP_DIR}"))?;
        app_image
            .set_entrypoint(&[launcher.to_string_lossy().into_owned()])
            .await
            .ctx("setting entrypoint")?;
        app_image.set_cmd(&[]).await.ctx("setting cmd")?;

        let result = app_image.save(additional_names).await?;

        if let Some(digest) = &result.digest {
            info!("*** Digest: {digest}");
        }
        info!("*** Images:");
        for (name, outcome) in &result.outcomes {
            match outcome {
                SaveOutcome::Succeeded => info!("      {name} - succeeded"),
                SaveOutcome::Failed(reason) => info!("      {name} - {reason}"),
            }
        }

        let failures = result.failures();
        if !failures.is_empty() {
            return Err(KilnError::FailedToSave { failures });
        }
        Ok(result)
    }

    /// Tar the directory, then add the layer or reuse the previous
    /// image's copy when the SHA is unchanged.
    async fn add_or_reuse(
        &self,
        image: &mut dyn Image,
        identifier: &str,
        dir: &Path,
        previous_sha: &str,
    ) -> KilnResult<String> {
        let tar_path = self
            .artifacts_dir
            .join(format!("{}.tar", escape_identifier(identifier)));

        let src = dir.to_path_buf();
        let dest = tar_path.clone();
        let (uid, gid) = (self.uid, self.gid);
        let sha = tokio::task::spawn_blocking(move || {
            crate::archive::write_tar_file(&src, &dest, uid, gid)
        })
        .await
        .map_err(|e| KilnError::Internal(format!("tar task panicked: {e}")))?
        .ctx(format!("exporting layer '{identifier}'"))?;

        if sha == previous_sha {
            info!("Reusing layer '{identifier}' with SHA {sha}");
            image
                .reuse_layer(previous_sha)
                .await
                .ctx(format!("reusing layer '{identifier}'"))?;
        } else {
            info!("Exporting layer '{identifier}' with SHA {sha}");
            image
                .add_layer(&tar_path)
                .await
                .ctx(format!("adding layer '{identifier}'"))?;
        }
        Ok(sha)
    }
}

/// Artifact tars live in one flat directory, so identifiers are
/// flattened too
fn escape_identifier(identifier: &str) -> String {
    identifier.replace(['/', ':'], "_")
}
