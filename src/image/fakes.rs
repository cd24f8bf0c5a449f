//! In-memory image store for tests
//!
//! Records every mutation so tests can assert on added layers, reused
//! layers, labels, and save outcomes without touching a real store.

use crate::error::{KilnError, KilnResult};
use crate::image::name::ImageReference;
use crate::image::{Image, LayerRetrieval, SaveOutcome, SaveResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A fake image, absent or pre-populated
#[derive(Debug, Default)]
pub struct FakeImage {
    name: String,
    found: bool,
    digest: String,
    top_layer: String,
    labels: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    entrypoint: Vec<String>,
    cmd: Vec<String>,
    /// Diff IDs the "previous image" still holds, reusable by pointer
    previous_layers: Vec<String>,
    /// Layer tar content by diff ID, for retrieval tests
    layer_data: BTreeMap<String, Vec<u8>>,
    added_layers: Vec<PathBuf>,
    reused_layers: Vec<String>,
    saved_names: Vec<String>,
    saved: bool,
}

impl FakeImage {
    /// An image that exists in its store
    pub fn new(name: &str, top_layer: &str, digest: &str) -> Self {
        Self {
            name: name.to_string(),
            found: true,
            digest: digest.to_string(),
            top_layer: top_layer.to_string(),
            ..Self::default()
        }
    }

    /// An image reference with nothing behind it
    pub fn not_found(name: &str) -> Self {
        Self {
            name: name.to_string(),
            found: false,
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Declare a diff ID as present in the previous image
    pub fn with_previous_layer(mut self, diff_id: &str) -> Self {
        self.previous_layers.push(diff_id.to_string());
        self
    }

    /// Stash layer bytes for retrieval by diff ID
    pub fn with_layer_data(mut self, diff_id: &str, data: Vec<u8>) -> Self {
        self.layer_data.insert(diff_id.to_string(), data);
        self
    }

    pub fn added_layers(&self) -> &[PathBuf] {
        &self.added_layers
    }

    pub fn reused_layers(&self) -> &[String] {
        &self.reused_layers
    }

    pub fn saved_names(&self) -> &[String] {
        &self.saved_names
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub fn entrypoint(&self) -> &[String] {
        &self.entrypoint
    }

    pub fn cmd(&self) -> &[String] {
        &self.cmd
    }

    pub fn label_sync(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn env_sync(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }
}

#[async_trait]
impl Image for FakeImage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn found(&self) -> KilnResult<bool> {
        Ok(self.found)
    }

    async fn label(&self, key: &str) -> KilnResult<Option<String>> {
        Ok(self.labels.get(key).cloned())
    }

    async fn set_label(&mut self, key: &str, value: &str) -> KilnResult<()> {
        self.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn env(&self, key: &str) -> KilnResult<Option<String>> {
        Ok(self.env.get(key).cloned())
    }

    async fn set_env(&mut self, key: &str, value: &str) -> KilnResult<()> {
        self.env.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_entrypoint(&mut self, entrypoint: &[String]) -> KilnResult<()> {
        self.entrypoint = entrypoint.to_vec();
        Ok(())
    }

    async fn set_cmd(&mut self, cmd: &[String]) -> KilnResult<()> {
        self.cmd = cmd.to_vec();
        Ok(())
    }

    async fn top_layer(&self) -> KilnResult<String> {
        Ok(self.top_layer.clone())
    }

    async fn identifier(&self) -> KilnResult<String> {
        Ok(format!("{}@{}", self.name, self.digest))
    }

    async fn add_layer(&mut self, tar_path: &Path) -> KilnResult<()> {
        self.added_layers.push(tar_path.to_path_buf());
        Ok(())
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> KilnResult<()> {
        if !self.previous_layers.iter().any(|l| l == diff_id) {
            return Err(KilnError::MissingImageLayer(diff_id.to_string()));
        }
        self.reused_layers.push(diff_id.to_string());
        Ok(())
    }

    async fn save(&mut self, additional_names: &[String]) -> KilnResult<SaveResult> {
        let mut result = SaveResult {
            digest: None,
            outcomes: Vec::new(),
        };
        let all_names = std::iter::once(self.name.clone()).chain(additional_names.iter().cloned());
        for name in all_names {
            match ImageReference::parse(&name) {
                Ok(_) => {
                    self.saved_names.push(name.clone());
                    result.outcomes.push((name, SaveOutcome::Succeeded));
                }
                Err(e) => {
                    result.outcomes.push((name, SaveOutcome::Failed(e.to_string())));
                }
            }
        }
        if result.outcomes.iter().any(|(_, o)| *o == SaveOutcome::Succeeded) {
            self.saved = true;
            self.found = true;
            result.digest = Some(self.digest.clone());
        }
        Ok(result)
    }
}

#[async_trait]
impl LayerRetrieval for FakeImage {
    async fn retrieve_layer(&self, diff_id: &str) -> KilnResult<Box<dyn std::io::Read + Send>> {
        match self.layer_data.get(diff_id) {
            Some(data) => Ok(Box::new(std::io::Cursor::new(data.clone()))),
            None => Err(KilnError::MissingImageLayer(diff_id.to_string())),
        }
    }

    async fn has_layer(&self, diff_id: &str) -> KilnResult<bool> {
        Ok(self.layer_data.contains_key(diff_id))
    }
}
