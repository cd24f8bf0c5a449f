//! The analyze subcommand

use crate::analyzer::Analyzer;
use crate::buildpack::BuildpackGroup;
use crate::cli::args::AnalyzeArgs;
use crate::cli::commands::{current_uid, open_cache};
use crate::error::{KilnResult, ResultExt};
use crate::image::oci::OciStore;

pub async fn analyze(args: AnalyzeArgs) -> KilnResult<()> {
    let cache = open_cache(&args.cache, &args.images).await?;

    let group = BuildpackGroup::from_file(&args.group)
        .await
        .ctx("reading group file")?;

    let store = OciStore::new(&args.images);
    let image = store.open(&args.image).await?;

    let analyzer = Analyzer {
        layers_dir: args.layers.clone(),
        buildpacks: group.group,
        uid: args.ownership.uid,
        gid: args.ownership.gid,
        process_uid: current_uid(),
        skip_layers: args.skip_layers,
    };

    let analyzed = analyzer.analyze(&image, cache.as_ref()).await?;
    analyzed
        .write_file(&args.analyzed)
        .await
        .ctx("writing analyzed record")?;
    Ok(())
}
