//! Volume-backed cache store
//!
//! Layout under the cache directory:
//!
//! | dir                 | role                                  |
//! |---------------------|---------------------------------------|
//! | `staging/`          | writes for the in-progress build      |
//! | `committed/`        | the last successfully committed state |
//! | `committed-backup/` | rollback window during commit         |
//!
//! Commit swaps `staging` into `committed` through a rename pair with a
//! backup, so a crash at any point leaves either the old or the new
//! snapshot intact, never a mix.

use crate::cache::Cache;
use crate::error::{KilnError, KilnResult};
use crate::metadata::{CacheMetadata, CACHE_METADATA_LABEL};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory-backed [`Cache`] implementation
#[derive(Debug)]
pub struct VolumeCache {
    dir: PathBuf,
    name: String,
    staging_dir: PathBuf,
    committed_dir: PathBuf,
    backup_dir: PathBuf,
    committed: bool,
}

impl VolumeCache {
    /// Open the cache at `dir`, resetting any leftover staging state
    /// from a previous crashed run.
    pub async fn new(dir: impl Into<PathBuf>) -> KilnResult<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(KilnError::Cache {
                name: dir.display().to_string(),
                reason: "cache directory does not exist".to_string(),
            });
        }

        let cache = Self {
            name: dir.display().to_string(),
            staging_dir: dir.join("staging"),
            committed_dir: dir.join("committed"),
            backup_dir: dir.join("committed-backup"),
            dir,
            committed: false,
        };

        if let Err(e) = tokio::fs::remove_dir_all(&cache.staging_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(KilnError::io("clearing staging directory", e));
            }
        }
        tokio::fs::create_dir_all(&cache.staging_dir)
            .await
            .map_err(|e| KilnError::io("creating staging directory", e))?;

        if let Err(e) = tokio::fs::remove_dir_all(&cache.backup_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(KilnError::io("clearing backup directory", e));
            }
        }
        tokio::fs::create_dir_all(&cache.committed_dir)
            .await
            .map_err(|e| KilnError::io("creating committed directory", e))?;

        Ok(cache)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn committed_tar(&self, diff_id: &str) -> PathBuf {
        self.committed_dir.join(format!("{diff_id}.tar"))
    }

    fn staged_tar(&self, diff_id: &str) -> PathBuf {
        self.staging_dir.join(format!("{diff_id}.tar"))
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
impl Cache for VolumeCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn retrieve_metadata(&self) -> KilnResult<CacheMetadata> {
        let path = self.committed_dir.join(CACHE_METADATA_LABEL);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CacheMetadata::default()),
            Err(e) => Err(KilnError::io(
                format!("reading cache metadata {}", path.display()),
                e,
            )),
        }
    }

    async fn set_metadata(&mut self, metadata: &CacheMetadata) -> KilnResult<()> {
        self.guard_uncommitted()?;
        let path = self.staging_dir.join(CACHE_METADATA_LABEL);
        let bytes = serde_json::to_vec(metadata)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| KilnError::io(format!("writing cache metadata {}", path.display()), e))
    }

    async fn add_layer_file(&mut self, tar_path: &Path, diff_id: &str) -> KilnResult<()> {
        self.guard_uncommitted()?;
        let dest = self.staged_tar(diff_id);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            // identical content, no point rewriting
            return Ok(());
        }
        debug!("Caching layer {diff_id}");
        tokio::fs::copy(tar_path, &dest)
            .await
            .map_err(|e| KilnError::io(format!("caching layer ({diff_id})"), e))?;
        Ok(())
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> KilnResult<()> {
        self.guard_uncommitted()?;
        debug!("Reusing cached layer {diff_id}");
        match std::fs::hard_link(self.committed_tar(diff_id), self.staged_tar(diff_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(KilnError::io(format!("reusing layer ({diff_id})"), e)),
        }
    }

    async fn retrieve_layer(&self, diff_id: &str) -> KilnResult<Box<dyn std::io::Read + Send>> {
        let path = self.committed_tar(diff_id);
        match std::fs::File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KilnError::MissingCacheLayer(diff_id.to_string()))
            }
            Err(e) => Err(KilnError::io(
                format!("opening cached layer {}", path.display()),
                e,
            )),
        }
    }

    async fn has_layer(&self, diff_id: &str) -> KilnResult<bool> {
        Ok(tokio::fs::try_exists(self.committed_tar(diff_id))
            .await
            .unwrap_or(false))
    }

    async fn commit(&mut self) -> KilnResult<()> {
        self.guard_uncommitted()?;
        self.committed = true;

        tokio::fs::rename(&self.committed_dir, &self.backup_dir)
            .await
            .map_err(|e| KilnError::io("backing up cache", e))?;

        if let Err(commit_err) = tokio::fs::rename(&self.staging_dir, &self.committed_dir).await {
            // restore the backup so the committed state survives
            if let Err(rollback_err) =
                tokio::fs::rename(&self.backup_dir, &self.committed_dir).await
            {
                return Err(KilnError::io("rolling back cache", rollback_err));
            }
            return Err(KilnError::io("committing cache", commit_err));
        }

        let _ = tokio::fs::remove_dir_all(&self.backup_dir).await;
        Ok(())
    }
}
