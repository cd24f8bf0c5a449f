//! The restore subcommand

use crate::buildpack::BuildpackGroup;
use crate::cli::args::RestoreArgs;
use crate::cli::commands::{current_uid, open_cache};
use crate::error::{KilnResult, ResultExt};
use crate::restorer::Restorer;

pub async fn restore(args: RestoreArgs) -> KilnResult<()> {
    let cache = open_cache(&args.cache, &args.images).await?;

    let group = BuildpackGroup::from_file(&args.group)
        .await
        .ctx("reading group file")?;

    let restorer = Restorer {
        layers_dir: args.layers.clone(),
        buildpacks: group.group,
        uid: args.ownership.uid,
        gid: args.ownership.gid,
        process_uid: current_uid(),
    };

    restorer.restore(cache.as_ref()).await
}
