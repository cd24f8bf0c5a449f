//! The per-buildpack layers directory
//!
//! Each buildpack owns `<layersDir>/<escaped-id>/`. A layer named `n`
//! is the directory `n/` plus the sidecars `n.toml` (flags + opaque
//! metadata) and `n.sha` (authoritative diff ID). A layer exists as
//! soon as either the directory or the TOML does.

use crate::buildpack::Buildpack;
use crate::error::{KilnError, KilnResult};
use crate::metadata::LayerMetadata;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Cache state of a layer relative to the cache store's metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// Cache metadata has no entry for this layer
    StaleNoMetadata,
    /// On-disk SHA disagrees with the cache metadata
    StaleWrongSha,
    /// launch=false; staleness is decided by the cacher, not here
    NotForLaunch,
    /// SHA matches, safe to restore
    Valid,
    /// Sidecar TOML exists but does not parse
    Malformed,
}

/// Handle on the layers directory of one buildpack
#[derive(Debug)]
pub struct BuildpackLayers {
    path: PathBuf,
    buildpack: Buildpack,
    layers: BTreeMap<String, Layer>,
}

impl BuildpackLayers {
    /// Discover the buildpack's layers under `layers_dir`.
    ///
    /// Layer names come from subdirectories and from `*.toml` siblings,
    /// so metadata-only layers (no contents yet) are still visible.
    pub async fn read(layers_dir: &Path, buildpack: &Buildpack) -> KilnResult<Self> {
        let path = layers_dir.join(buildpack.escaped_id());
        let mut names = Vec::new();

        match tokio::fs::read_dir(&path).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await.map_err(|e| {
                    KilnError::io(format!("reading layers dir {}", path.display()), e)
                })? {
                    let entry_path = entry.path();
                    let file_type = entry.file_type().await.map_err(|e| {
                        KilnError::io(format!("inspecting {}", entry_path.display()), e)
                    })?;
                    if file_type.is_dir() {
                        if let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) {
                            names.push(name.to_string());
                        }
                    } else if entry_path.extension().is_some_and(|ext| ext == "toml") {
                        if let Some(stem) = entry_path.file_stem().and_then(|n| n.to_str()) {
                            names.push(stem.to_string());
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(KilnError::io(
                    format!("reading layers dir {}", path.display()),
                    e,
                ))
            }
        }

        let mut layers = BTreeMap::new();
        for name in names {
            layers.insert(name.clone(), Layer::new(&path, &buildpack.id, &name));
        }

        Ok(Self {
            path,
            buildpack: buildpack.clone(),
            layers,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn buildpack(&self) -> &Buildpack {
        &self.buildpack
    }

    /// Handle for a layer by name, discovered or not
    pub fn layer(&self, name: &str) -> Layer {
        Layer::new(&self.path, &self.buildpack.id, name)
    }

    /// Discovered layers in stable (lexicographic) order
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    /// Discovered layers whose metadata passes `pred` (malformed layers
    /// never match)
    pub async fn find_layers<F>(&self, pred: F) -> KilnResult<Vec<&Layer>>
    where
        F: Fn(&LayerMetadata) -> bool,
    {
        let mut selected = Vec::new();
        for layer in self.layers.values() {
            if let Ok(meta) = layer.read().await {
                if pred(&meta) {
                    selected.push(layer);
                }
            }
        }
        Ok(selected)
    }

    /// Discovered layers whose sidecar TOML fails to parse
    pub async fn malformed_layers(&self) -> Vec<&Layer> {
        let mut malformed = Vec::new();
        for layer in self.layers.values() {
            if layer.read().await.is_err() {
                malformed.push(layer);
            }
        }
        malformed
    }
}

/// Handle on one layer: `<bpDir>/<name>` plus its sidecars
#[derive(Debug, Clone)]
pub struct Layer {
    path: PathBuf,
    identifier: String,
}

impl Layer {
    fn new(bp_dir: &Path, buildpack_id: &str, name: &str) -> Self {
        Self {
            path: bp_dir.join(name),
            identifier: format!("{buildpack_id}:{name}"),
        }
    }

    /// `<buildpack-id>:<layer-name>`, with the unescaped ID
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    fn toml_path(&self) -> PathBuf {
        append_extension(&self.path, ".toml")
    }

    fn sha_path(&self) -> PathBuf {
        append_extension(&self.path, ".sha")
    }

    /// Read the sidecar metadata.
    ///
    /// Missing TOML yields the empty record. The `.sha` file, when
    /// present, overrides the TOML's mirrored `sha` field.
    pub async fn read(&self) -> KilnResult<LayerMetadata> {
        let mut meta: LayerMetadata = match tokio::fs::read_to_string(self.toml_path()).await {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LayerMetadata::default(),
            Err(e) => {
                return Err(KilnError::io(
                    format!("reading metadata for layer '{}'", self.identifier),
                    e,
                ))
            }
        };

        match tokio::fs::read_to_string(self.sha_path()).await {
            Ok(sha) => meta.sha = sha.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(KilnError::io(
                    format!("reading SHA for layer '{}'", self.identifier),
                    e,
                ))
            }
        }
        Ok(meta)
    }

    /// Write the sidecar TOML (creating the buildpack dir if needed)
    pub async fn write_metadata(&self, meta: &LayerMetadata) -> KilnResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io("creating buildpack layers dir", e))?;
        }
        let content = toml::to_string_pretty(meta)?;
        tokio::fs::write(self.toml_path(), content)
            .await
            .map_err(|e| {
                KilnError::io(format!("writing metadata for layer '{}'", self.identifier), e)
            })
    }

    /// Write the sidecar `.sha` file
    pub async fn write_sha(&self, sha: &str) -> KilnResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| KilnError::io("creating buildpack layers dir", e))?;
        }
        tokio::fs::write(self.sha_path(), sha).await.map_err(|e| {
            KilnError::io(format!("writing SHA for layer '{}'", self.identifier), e)
        })
    }

    /// Delete the layer directory and both sidecars; missing files are
    /// tolerated
    pub async fn remove(&self) -> KilnResult<()> {
        debug!("Removing layer '{}'", self.identifier);
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(KilnError::io(
                    format!("removing layer '{}'", self.identifier),
                    e,
                ))
            }
        }
        for sidecar in [self.toml_path(), self.sha_path()] {
            match tokio::fs::remove_file(&sidecar).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(KilnError::io(
                        format!("removing sidecar {}", sidecar.display()),
                        e,
                    ))
                }
            }
        }
        Ok(())
    }

    /// Whether the layer has on-disk contents
    pub fn has_contents(&self) -> bool {
        self.path.is_dir()
    }

    /// Classify this layer against the cache store's recorded layers
    pub async fn classify(
        &self,
        cached_layers: &BTreeMap<String, LayerMetadata>,
    ) -> CacheClass {
        let meta = match self.read().await {
            Ok(meta) => meta,
            Err(_) => return CacheClass::Malformed,
        };
        if !meta.launch {
            return CacheClass::NotForLaunch;
        }
        let Some(cached) = cached_layers.get(self.name()) else {
            return CacheClass::StaleNoMetadata;
        };
        if cached.sha != meta.sha {
            return CacheClass::StaleWrongSha;
        }
        CacheClass::Valid
    }
}

/// Sidecars append to the full layer name, so `node-4.5` maps to
/// `node-4.5.toml` rather than `node-4.toml`.
fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(ext);
    PathBuf::from(os)
}

/// Chown `path` and everything under it to `uid:gid`.
///
/// Symlinks are re-owned without following them.
pub fn recursive_chown(path: &Path, uid: u32, gid: u32) -> KilnResult<()> {
    use std::os::unix::fs::{chown, lchown};

    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| {
            KilnError::io(format!("walking {}", path.display()), std::io::Error::other(e))
        })?;
        let result = if entry.path_is_symlink() {
            lchown(entry.path(), Some(uid), Some(gid))
        } else {
            chown(entry.path(), Some(uid), Some(gid))
        };
        result.map_err(|e| KilnError::io(format!("chowning {}", entry.path().display()), e))?;
    }
    Ok(())
}
