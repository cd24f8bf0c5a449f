//! The cache subcommand

use crate::buildpack::BuildpackGroup;
use crate::cacher::Cacher;
use crate::cli::args::CacheArgs;
use crate::cli::commands::open_cache;
use crate::error::{KilnError, KilnResult, ResultExt};

pub async fn cache(args: CacheArgs) -> KilnResult<()> {
    let mut cache = open_cache(&args.cache, &args.images).await?;

    let group = BuildpackGroup::from_file(&args.group)
        .await
        .ctx("reading group file")?;

    let artifacts = tempfile::tempdir()
        .map_err(|e| KilnError::io("creating artifacts directory", e))?;

    let cacher = Cacher {
        buildpacks: group.group,
        artifacts_dir: artifacts.path().to_path_buf(),
        uid: args.ownership.uid,
        gid: args.ownership.gid,
    };

    cacher.cache(&args.layers, cache.as_mut()).await
}
