//! Phase subcommand implementations

mod analyze;
mod cache;
mod detect;
mod export;
mod restore;

pub use analyze::analyze;
pub use cache::cache;
pub use detect::detect;
pub use export::export;
pub use restore::restore;

use crate::cache::{Cache, ImageCache, VolumeCache};
use crate::cli::args::CacheLocation;
use crate::error::{KilnError, KilnResult};
use crate::image::oci::OciStore;
use std::path::Path;

/// UID the lifecycle process runs as; phases chown the layers
/// directory only when this is 0.
pub(crate) fn current_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self")
        .map(|m| m.uid())
        .unwrap_or(u32::MAX)
}

/// Construct the cache store selected by the CLI flags
pub(crate) async fn open_cache(
    location: &CacheLocation,
    images: &Path,
) -> KilnResult<Box<dyn Cache>> {
    if let Some(dir) = &location.cache_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| KilnError::io(format!("creating cache directory {}", dir.display()), e))?;
        return Ok(Box::new(VolumeCache::new(dir).await?));
    }
    if let Some(reference) = &location.cache_image {
        let store = OciStore::new(images);
        let origin = store.open(reference).await?;
        let next = store
            .new_scratch_image(reference, Some(reference.as_str()))
            .await?;
        return Ok(Box::new(ImageCache::new(origin, next)));
    }
    Err(KilnError::InvalidArgs(
        "one of --cache-dir or --cache-image is required".to_string(),
    ))
}
