//! Image store abstraction
//!
//! An image is an addressable stack of layers plus config metadata
//! (labels, env, entrypoint). The lifecycle phases are written against
//! the [`Image`] trait only; the concrete store (OCI layout, in-memory
//! fake) is selected at construction.

pub mod fakes;
pub mod name;
pub mod oci;

use crate::error::KilnResult;
use async_trait::async_trait;
use std::path::Path;

/// Abstract image capability set
#[async_trait]
pub trait Image: Send + Sync {
    /// Primary reference the image will be saved under
    fn name(&self) -> &str;

    /// Whether the image exists in its store
    async fn found(&self) -> KilnResult<bool>;

    async fn label(&self, key: &str) -> KilnResult<Option<String>>;

    async fn set_label(&mut self, key: &str, value: &str) -> KilnResult<()>;

    async fn env(&self, key: &str) -> KilnResult<Option<String>>;

    async fn set_env(&mut self, key: &str, value: &str) -> KilnResult<()>;

    async fn set_entrypoint(&mut self, entrypoint: &[String]) -> KilnResult<()>;

    async fn set_cmd(&mut self, cmd: &[String]) -> KilnResult<()>;

    /// Diff ID of the topmost layer
    async fn top_layer(&self) -> KilnResult<String>;

    /// Stable identity: `<name>@<digest>` for stored images
    async fn identifier(&self) -> KilnResult<String>;

    /// Append a layer from an uncompressed tar on disk
    async fn add_layer(&mut self, tar_path: &Path) -> KilnResult<()>;

    /// Append a layer by pointing at a previous-image layer's diff ID,
    /// without re-adding its bytes
    async fn reuse_layer(&mut self, diff_id: &str) -> KilnResult<()>;

    /// Persist under the primary name plus `additional_names`.
    /// Saving is atomic per name; failures are collected per name.
    async fn save(&mut self, additional_names: &[String]) -> KilnResult<SaveResult>;
}

/// Read-side access to layer bytes, needed by image-backed caches.
/// Deliberately separate from [`Image`]: the export path never reads
/// layer content back.
#[async_trait]
pub trait LayerRetrieval: Send + Sync {
    /// Open the uncompressed tar stream for a layer by diff ID
    async fn retrieve_layer(&self, diff_id: &str) -> KilnResult<Box<dyn std::io::Read + Send>>;

    async fn has_layer(&self, diff_id: &str) -> KilnResult<bool>;
}

/// Outcome of saving one image name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Succeeded,
    Failed(String),
}

/// Result of a multi-name save
#[derive(Debug, Clone, Default)]
pub struct SaveResult {
    /// Digest of the saved manifest, when at least one name succeeded
    pub digest: Option<String>,
    /// Per-name outcomes, in save order (primary name first)
    pub outcomes: Vec<(String, SaveOutcome)>,
}

impl SaveResult {
    /// The names that failed, with their error messages
    pub fn failures(&self) -> Vec<(String, String)> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                SaveOutcome::Failed(reason) => Some((name.clone(), reason.clone())),
                SaveOutcome::Succeeded => None,
            })
            .collect()
    }
}
