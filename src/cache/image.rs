//! Image-backed cache store
//!
//! Reads come from the previously committed cache image, writes go to a
//! fresh working image; `commit` saves the working image. Layer bytes
//! are read through [`LayerRetrieval`], which the export path never
//! needs but caches do.

use crate::cache::Cache;
use crate::error::{KilnError, KilnResult};
use crate::image::{Image, LayerRetrieval};
use crate::metadata::{CacheMetadata, CACHE_METADATA_LABEL};
use async_trait::async_trait;
use std::path::Path;

/// [`Cache`] implementation over a pair of images
pub struct ImageCache<O, N> {
    origin: O,
    next: N,
    committed: bool,
}

impl<O, N> ImageCache<O, N>
where
    O: Image + LayerRetrieval,
    N: Image,
{
    /// `origin` is the committed cache image from the previous build
    /// (possibly absent); `next` is the working image for this build.
    pub fn new(origin: O, next: N) -> Self {
        Self {
            origin,
            next,
            committed: false,
        }
    }

    fn guard_uncommitted(&self) -> KilnResult<()> {
        if self.committed {
            Err(KilnError::CacheCommitted)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<O, N> Cache for ImageCache<O, N>
where
    O: Image + LayerRetrieval,
    N: Image,
{
    fn name(&self) -> &str {
        self.next.name()
    }

    async fn retrieve_metadata(&self) -> KilnResult<CacheMetadata> {
        if !self.origin.found().await? {
            return Ok(CacheMetadata::default());
        }
        match self.origin.label(CACHE_METADATA_LABEL).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
            None => Ok(CacheMetadata::default()),
        }
    }

    async fn set_metadata(&mut self, metadata: &CacheMetadata) -> KilnResult<()> {
        self.guard_uncommitted()?;
        let raw = serde_json::to_string(metadata)?;
        self.next.set_label(CACHE_METADATA_LABEL, &raw).await
    }

    async fn add_layer_file(&mut self, tar_path: &Path, _diff_id: &str) -> KilnResult<()> {
        self.guard_uncommitted()?;
        self.next.add_layer(tar_path).await
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> KilnResult<()> {
        self.guard_uncommitted()?;
        self.next.reuse_layer(diff_id).await
    }

    async fn retrieve_layer(&self, diff_id: &str) -> KilnResult<Box<dyn std::io::Read + Send>> {
        if !self.origin.has_layer(diff_id).await? {
            return Err(KilnError::MissingCacheLayer(diff_id.to_string()));
        }
        self.origin.retrieve_layer(diff_id).await
    }

    async fn has_layer(&self, diff_id: &str) -> KilnResult<bool> {
        if !self.origin.found().await? {
            return Ok(false);
        }
        self.origin.has_layer(diff_id).await
    }

    async fn commit(&mut self) -> KilnResult<()> {
        self.guard_uncommitted()?;
        self.committed = true;
        let result = self.next.save(&[]).await?;
        let failures = result.failures();
        if !failures.is_empty() {
            return Err(KilnError::Cache {
                name: self.next.name().to_string(),
                reason: failures
                    .into_iter()
                    .map(|(name, reason)| format!("{name}: {reason}"))
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::fakes::FakeImage;
    use std::io::Read;

    fn image_cache() -> ImageCache<FakeImage, FakeImage> {
        let origin = FakeImage::new("cache-image", "sha256:top", "sha256:digest")
            .with_label(
                CACHE_METADATA_LABEL,
                r#"{"buildpacks":[{"key":"example/node","version":"1","layers":{}}]}"#,
            )
            .with_layer_data("sha256:abc", b"tar bytes".to_vec());
        let next = FakeImage::not_found("cache-image").with_previous_layer("sha256:abc");
        ImageCache::new(origin, next)
    }

    #[tokio::test]
    async fn metadata_comes_from_origin_label() {
        let cache = image_cache();
        let meta = cache.retrieve_metadata().await.unwrap();
        assert_eq!(meta.buildpacks[0].id, "example/node");
    }

    #[tokio::test]
    async fn absent_origin_has_empty_metadata() {
        let cache = ImageCache::new(
            FakeImage::not_found("cache-image"),
            FakeImage::not_found("cache-image"),
        );
        assert_eq!(
            cache.retrieve_metadata().await.unwrap(),
            CacheMetadata::default()
        );
        assert!(!cache.has_layer("sha256:abc").await.unwrap());
    }

    #[tokio::test]
    async fn retrieve_streams_origin_layer() {
        let cache = image_cache();
        let mut content = Vec::new();
        cache
            .retrieve_layer("sha256:abc")
            .await
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"tar bytes");

        let err = match cache.retrieve_layer("sha256:missing").await {
            Ok(_) => panic!("expected missing layer error"),
            Err(e) => e,
        };
        assert!(matches!(err, KilnError::MissingCacheLayer(_)));
    }

    #[tokio::test]
    async fn commit_saves_next_image_once() {
        let mut cache = image_cache();
        cache.reuse_layer("sha256:abc").await.unwrap();
        cache.commit().await.unwrap();
        assert!(matches!(
            cache.commit().await.unwrap_err(),
            KilnError::CacheCommitted
        ));
    }
}
