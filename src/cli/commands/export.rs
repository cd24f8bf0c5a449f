//! The export subcommand

use crate::buildpack::BuildpackGroup;
use crate::cli::args::ExportArgs;
use crate::error::{KilnError, KilnResult, ResultExt};
use crate::exporter::Exporter;
use crate::image::name::ImageReference;
use crate::image::oci::OciStore;
use crate::metadata::{AnalyzedMetadata, StackMetadata};
use tracing::debug;

pub async fn export(args: ExportArgs) -> KilnResult<()> {
    let (primary, additional) = args
        .images_to_save
        .split_first()
        .ok_or_else(|| KilnError::InvalidArgs("at least one image name is required".to_string()))?;

    let registry = ImageReference::parse(primary)?.registry().to_string();
    let mut foreign: Vec<String> = Vec::new();
    for name in additional {
        if ImageReference::parse(name)?.registry() != registry {
            foreign.push(name.clone());
        }
    }
    if !foreign.is_empty() {
        return Err(KilnError::MultipleRegistries(foreign));
    }

    let group = BuildpackGroup::from_file(&args.group)
        .await
        .ctx("reading group file")?;
    let analyzed = AnalyzedMetadata::from_file(&args.analyzed)
        .await
        .ctx("reading analyzed record")?;
    let stack = StackMetadata::from_file(&args.stack)
        .await
        .ctx("reading stack file")?;

    let run_image = match &args.run_image {
        Some(reference) => reference.clone(),
        None => stack.best_run_image_mirror(&registry)?,
    };
    debug!("Using run image {run_image}");

    let store = OciStore::new(&args.images);
    let mut image = store
        .new_image(primary, &run_image, Some(primary.as_str()))
        .await?;

    let artifacts = tempfile::tempdir()
        .map_err(|e| KilnError::io("creating artifacts directory", e))?;

    let exporter = Exporter {
        buildpacks: group.group,
        artifacts_dir: artifacts.path().to_path_buf(),
        uid: args.ownership.uid,
        gid: args.ownership.gid,
        launcher_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    exporter
        .export(
            &args.layers,
            &args.app,
            &mut image,
            &analyzed.metadata,
            additional,
            &args.launcher,
            stack,
        )
        .await?;
    Ok(())
}
