//! The detect subcommand

use crate::buildpack::BuildpackOrder;
use crate::cli::args::DetectArgs;
use crate::detector::Detector;
use crate::error::{KilnResult, ResultExt};
use tracing::info;

pub async fn detect(args: DetectArgs) -> KilnResult<()> {
    let order = BuildpackOrder::from_file(&args.order)
        .await
        .ctx("reading buildpack order")?;

    let detector = Detector::new(&args.app, &args.platform, &args.buildpacks);
    let (group, plan) = detector.detect(&order).await?;

    info!(
        "Detected group: {}",
        group
            .group
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );

    group
        .write_file(&args.group)
        .await
        .ctx("writing group file")?;
    plan.write_file(&args.plan).await.ctx("writing plan file")?;
    Ok(())
}
