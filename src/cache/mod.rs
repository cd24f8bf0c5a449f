//! Cache store abstraction
//!
//! An auxiliary content-addressed store holding cache-layer tars
//! indexed by diff ID, plus one metadata document describing them.
//! Mutations land in a staging area and become visible atomically at
//! [`Cache::commit`].

pub mod image;
pub mod volume;

pub use image::ImageCache;
pub use volume::VolumeCache;

use crate::error::KilnResult;
use crate::metadata::CacheMetadata;
use async_trait::async_trait;
use std::path::Path;

/// Abstract cache store capability set
#[async_trait]
pub trait Cache: Send + Sync {
    /// Human-readable identity for log and error messages
    fn name(&self) -> &str;

    /// Metadata from the last committed state (empty when none)
    async fn retrieve_metadata(&self) -> KilnResult<CacheMetadata>;

    /// Stage the metadata document for the next commit
    async fn set_metadata(&mut self, metadata: &CacheMetadata) -> KilnResult<()>;

    /// Stage a layer tar by copying it in
    async fn add_layer_file(&mut self, tar_path: &Path, diff_id: &str) -> KilnResult<()>;

    /// Carry a committed layer forward into the next commit without
    /// rewriting its bytes
    async fn reuse_layer(&mut self, diff_id: &str) -> KilnResult<()>;

    /// Open the committed tar stream for a layer
    async fn retrieve_layer(&self, diff_id: &str) -> KilnResult<Box<dyn std::io::Read + Send>>;

    /// Whether the committed state holds a layer
    async fn has_layer(&self, diff_id: &str) -> KilnResult<bool>;

    /// Atomically publish the staged state
    async fn commit(&mut self) -> KilnResult<()>;
}
