//! OCI image-layout store
//!
//! Images live under a store root, one image-layout directory per
//! escaped reference: `blobs/sha256/*`, `oci-layout`, and an
//! `index.json` whose manifest entry is annotated with the reference.
//! Layer blobs are uncompressed tars, so a blob's digest is its diff ID.

use crate::error::{KilnError, KilnResult};
use crate::image::name::ImageReference;
use crate::image::{Image, LayerRetrieval, SaveOutcome, SaveResult};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
const MEDIA_TYPE_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// A directory of OCI image layouts keyed by escaped reference
#[derive(Debug, Clone)]
pub struct OciStore {
    root: PathBuf,
}

impl OciStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn layout_dir(&self, reference: &str) -> PathBuf {
        self.root.join(escape_reference(reference))
    }

    /// Open an existing image; a missing layout yields a not-found image
    pub async fn open(&self, reference: &str) -> KilnResult<OciImage> {
        ImageReference::parse(reference)?;
        let dir = self.layout_dir(reference);
        match Layout::load(&dir).await? {
            Some(layout) => {
                let identifier = format!("{reference}@{}", layout.manifest_digest);
                let layers = layout.layer_sources();
                Ok(OciImage {
                    store_root: self.root.clone(),
                    name: reference.to_string(),
                    found: true,
                    identifier: Some(identifier),
                    config: layout.config,
                    layers,
                    previous: None,
                })
            }
            None => Ok(OciImage {
                store_root: self.root.clone(),
                name: reference.to_string(),
                found: false,
                identifier: None,
                config: ConfigFile::default(),
                layers: Vec::new(),
                previous: None,
            }),
        }
    }

    /// Start an empty working image with no base, able to reuse layers
    /// from `previous` by diff ID. Cache images are built this way.
    pub async fn new_scratch_image(
        &self,
        reference: &str,
        previous: Option<&str>,
    ) -> KilnResult<OciImage> {
        ImageReference::parse(reference)?;
        let previous_layout = match previous {
            Some(prev) => Layout::load(&self.layout_dir(prev)).await?,
            None => None,
        };
        Ok(OciImage {
            store_root: self.root.clone(),
            name: reference.to_string(),
            found: false,
            identifier: None,
            config: ConfigFile::default(),
            layers: Vec::new(),
            previous: previous_layout,
        })
    }

    /// Start a working image on top of `base` (the run image), able to
    /// reuse layers from `previous` by diff ID.
    pub async fn new_image(
        &self,
        reference: &str,
        base: &str,
        previous: Option<&str>,
    ) -> KilnResult<OciImage> {
        ImageReference::parse(reference)?;
        let base_dir = self.layout_dir(base);
        let base_layout = Layout::load(&base_dir).await?.ok_or_else(|| KilnError::Image {
            name: base.to_string(),
            reason: "run image not found in store".to_string(),
        })?;

        let previous_layout = match previous {
            Some(prev) => Layout::load(&self.layout_dir(prev)).await?,
            None => None,
        };

        let identifier = format!("{base}@{}", base_layout.manifest_digest);
        let layers = base_layout.layer_sources();
        let mut config = base_layout.config;
        config.rootfs.diff_ids.clear();

        Ok(OciImage {
            store_root: self.root.clone(),
            name: reference.to_string(),
            found: false,
            identifier: Some(identifier),
            config,
            layers,
            previous: previous_layout,
        })
    }
}

/// Escape a reference for use as a layout directory name
pub fn escape_reference(reference: &str) -> String {
    reference.replace(['/', ':', '@'], "_")
}

/// One layer of the working image: its diff ID and the uncompressed tar
/// backing it
#[derive(Debug, Clone)]
struct LayerSource {
    diff_id: String,
    tar_path: PathBuf,
}

/// An image backed by (and saved to) an [`OciStore`]
#[derive(Debug)]
pub struct OciImage {
    store_root: PathBuf,
    name: String,
    found: bool,
    identifier: Option<String>,
    config: ConfigFile,
    layers: Vec<LayerSource>,
    previous: Option<Layout>,
}

#[async_trait]
impl Image for OciImage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn found(&self) -> KilnResult<bool> {
        Ok(self.found)
    }

    async fn label(&self, key: &str) -> KilnResult<Option<String>> {
        Ok(self.config.config.labels.get(key).cloned())
    }

    async fn set_label(&mut self, key: &str, value: &str) -> KilnResult<()> {
        self.config
            .config
            .labels
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn env(&self, key: &str) -> KilnResult<Option<String>> {
        let prefix = format!("{key}=");
        Ok(self
            .config
            .config
            .env
            .iter()
            .find_map(|kv| kv.strip_prefix(&prefix).map(str::to_string)))
    }

    async fn set_env(&mut self, key: &str, value: &str) -> KilnResult<()> {
        let prefix = format!("{key}=");
        self.config.config.env.retain(|kv| !kv.starts_with(&prefix));
        self.config.config.env.push(format!("{key}={value}"));
        Ok(())
    }

    async fn set_entrypoint(&mut self, entrypoint: &[String]) -> KilnResult<()> {
        self.config.config.entrypoint = entrypoint.to_vec();
        Ok(())
    }

    async fn set_cmd(&mut self, cmd: &[String]) -> KilnResult<()> {
        self.config.config.cmd = cmd.to_vec();
        Ok(())
    }

    async fn top_layer(&self) -> KilnResult<String> {
        self.layers
            .last()
            .map(|l| l.diff_id.clone())
            .ok_or_else(|| KilnError::Image {
                name: self.name.clone(),
                reason: "image has no layers".to_string(),
            })
    }

    async fn identifier(&self) -> KilnResult<String> {
        self.identifier.clone().ok_or_else(|| KilnError::Image {
            name: self.name.clone(),
            reason: "image has no identity".to_string(),
        })
    }

    async fn add_layer(&mut self, tar_path: &Path) -> KilnResult<()> {
        let tar_path = tar_path.to_path_buf();
        let digest_path = tar_path.clone();
        let diff_id = tokio::task::spawn_blocking(move || sha256_of_file(&digest_path))
            .await
            .map_err(|e| KilnError::Internal(format!("hashing task failed: {e}")))??;
        debug!("Adding layer {diff_id} from {}", tar_path.display());
        self.layers.push(LayerSource { diff_id, tar_path });
        Ok(())
    }

    async fn reuse_layer(&mut self, diff_id: &str) -> KilnResult<()> {
        let previous = self
            .previous
            .as_ref()
            .ok_or_else(|| KilnError::MissingImageLayer(diff_id.to_string()))?;
        let blob = previous.blob_path(diff_id);
        if !previous.config.rootfs.diff_ids.iter().any(|d| d == diff_id) || !blob.is_file() {
            return Err(KilnError::MissingImageLayer(diff_id.to_string()));
        }
        debug!("Reusing layer {diff_id}");
        self.layers.push(LayerSource {
            diff_id: diff_id.to_string(),
            tar_path: blob,
        });
        Ok(())
    }

    async fn save(&mut self, additional_names: &[String]) -> KilnResult<SaveResult> {
        self.config.rootfs.r#type = "layers".to_string();
        self.config.rootfs.diff_ids = self.layers.iter().map(|l| l.diff_id.clone()).collect();
        self.config.created = epoch_timestamp();

        let config_bytes = serde_json::to_vec(&self.config)?;
        let config_digest = format!("sha256:{}", hex::encode(Sha256::digest(&config_bytes)));

        let mut layer_descriptors = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let size = tokio::fs::metadata(&layer.tar_path)
                .await
                .map_err(|e| {
                    KilnError::io(format!("sizing layer blob {}", layer.tar_path.display()), e)
                })?
                .len();
            layer_descriptors.push(Descriptor {
                media_type: MEDIA_TYPE_LAYER.to_string(),
                digest: layer.diff_id.clone(),
                size,
                annotations: None,
            });
        }

        let manifest = Manifest {
            schema_version: 2,
            media_type: MEDIA_TYPE_MANIFEST.to_string(),
            config: Descriptor {
                media_type: MEDIA_TYPE_CONFIG.to_string(),
                digest: config_digest.clone(),
                size: config_bytes.len() as u64,
                annotations: None,
            },
            layers: layer_descriptors,
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_digest = format!("sha256:{}", hex::encode(Sha256::digest(&manifest_bytes)));

        let mut result = SaveResult::default();
        let all_names: Vec<String> = std::iter::once(self.name.clone())
            .chain(additional_names.iter().cloned())
            .collect();

        for name in all_names {
            let outcome = self
                .save_one(
                    &name,
                    &config_bytes,
                    &config_digest,
                    &manifest_bytes,
                    &manifest_digest,
                )
                .await;
            match outcome {
                Ok(()) => result.outcomes.push((name, SaveOutcome::Succeeded)),
                Err(e) => result.outcomes.push((name, SaveOutcome::Failed(e.to_string()))),
            }
        }

        if result
            .outcomes
            .iter()
            .any(|(_, o)| *o == SaveOutcome::Succeeded)
        {
            result.digest = Some(manifest_digest.clone());
            self.found = true;
            self.identifier = Some(format!("{}@{manifest_digest}", self.name));
        }
        Ok(result)
    }
}

impl OciImage {
    /// Write one complete layout into a staging dir, then swap it into
    /// place so a half-written save is never visible under the name.
    async fn save_one(
        &self,
        name: &str,
        config_bytes: &[u8],
        config_digest: &str,
        manifest_bytes: &[u8],
        manifest_digest: &str,
    ) -> KilnResult<()> {
        ImageReference::parse(name)?;

        let target = self.store_root.join(escape_reference(name));
        let staging = self
            .store_root
            .join(format!(".staging-{}", escape_reference(name)));

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(KilnError::io("clearing staging layout", e));
            }
        }

        let write = async {
            let blobs = staging.join("blobs").join("sha256");
            tokio::fs::create_dir_all(&blobs)
                .await
                .map_err(|e| KilnError::io("creating blob directory", e))?;

            for layer in &self.layers {
                let dest = blobs.join(hex_of(&layer.diff_id));
                if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
                    continue;
                }
                tokio::fs::copy(&layer.tar_path, &dest).await.map_err(|e| {
                    KilnError::io(
                        format!("copying layer blob {}", layer.tar_path.display()),
                        e,
                    )
                })?;
            }

            tokio::fs::write(blobs.join(hex_of(config_digest)), config_bytes)
                .await
                .map_err(|e| KilnError::io("writing config blob", e))?;
            tokio::fs::write(blobs.join(hex_of(manifest_digest)), manifest_bytes)
                .await
                .map_err(|e| KilnError::io("writing manifest blob", e))?;

            tokio::fs::write(
                staging.join("oci-layout"),
                serde_json::to_vec(&serde_json::json!({"imageLayoutVersion": "1.0.0"}))?,
            )
            .await
            .map_err(|e| KilnError::io("writing oci-layout", e))?;

            let index = Index {
                schema_version: 2,
                manifests: vec![Descriptor {
                    media_type: MEDIA_TYPE_MANIFEST.to_string(),
                    digest: manifest_digest.to_string(),
                    size: manifest_bytes.len() as u64,
                    annotations: Some(BTreeMap::from([(
                        REF_NAME_ANNOTATION.to_string(),
                        name.to_string(),
                    )])),
                }],
            };
            tokio::fs::write(staging.join("index.json"), serde_json::to_vec(&index)?)
                .await
                .map_err(|e| KilnError::io("writing index.json", e))?;
            Ok::<(), KilnError>(())
        }
        .await;

        if let Err(e) = write {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::remove_dir_all(&target).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(KilnError::io("clearing previous layout", e));
            }
        }
        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| KilnError::io(format!("publishing layout for '{name}'"), e))
    }
}

#[async_trait]
impl LayerRetrieval for OciImage {
    async fn retrieve_layer(&self, diff_id: &str) -> KilnResult<Box<dyn std::io::Read + Send>> {
        let layer = self
            .layers
            .iter()
            .find(|l| l.diff_id == diff_id)
            .ok_or_else(|| KilnError::MissingImageLayer(diff_id.to_string()))?;
        let file = std::fs::File::open(&layer.tar_path).map_err(|e| {
            KilnError::io(format!("opening layer blob {}", layer.tar_path.display()), e)
        })?;
        Ok(Box::new(file))
    }

    async fn has_layer(&self, diff_id: &str) -> KilnResult<bool> {
        Ok(self.layers.iter().any(|l| l.diff_id == diff_id))
    }
}

/// A parsed on-disk layout
#[derive(Debug)]
struct Layout {
    dir: PathBuf,
    manifest_digest: String,
    config: ConfigFile,
}

impl Layout {
    async fn load(dir: &Path) -> KilnResult<Option<Self>> {
        let index_path = dir.join("index.json");
        let index_bytes = match tokio::fs::read(&index_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KilnError::io(
                    format!("reading {}", index_path.display()),
                    e,
                ))
            }
        };
        let index: Index = serde_json::from_slice(&index_bytes)?;
        let manifest_desc = index.manifests.first().ok_or_else(|| KilnError::Image {
            name: dir.display().to_string(),
            reason: "layout index has no manifests".to_string(),
        })?;

        let manifest_path = dir.join("blobs").join("sha256").join(hex_of(&manifest_desc.digest));
        let manifest_bytes = tokio::fs::read(&manifest_path).await.map_err(|e| {
            KilnError::io(format!("reading manifest {}", manifest_path.display()), e)
        })?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;

        let config_path = dir.join("blobs").join("sha256").join(hex_of(&manifest.config.digest));
        let config_bytes = tokio::fs::read(&config_path).await.map_err(|e| {
            KilnError::io(format!("reading image config {}", config_path.display()), e)
        })?;
        let config: ConfigFile = serde_json::from_slice(&config_bytes)?;

        Ok(Some(Self {
            dir: dir.to_path_buf(),
            manifest_digest: manifest_desc.digest.clone(),
            config,
        }))
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.dir.join("blobs").join("sha256").join(hex_of(digest))
    }

    /// Layer sources in rootfs order, backed by this layout's blobs
    fn layer_sources(&self) -> Vec<LayerSource> {
        self.config
            .rootfs
            .diff_ids
            .iter()
            .map(|diff_id| LayerSource {
                diff_id: diff_id.clone(),
                tar_path: self.blob_path(diff_id),
            })
            .collect()
    }
}

fn hex_of(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

fn sha256_of_file(path: &Path) -> KilnResult<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| KilnError::io(format!("opening {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| KilnError::io(format!("hashing {}", path.display()), e))?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Fixed creation time keeps image digests reproducible
fn epoch_timestamp() -> String {
    DateTime::<Utc>::UNIX_EPOCH.to_rfc3339_opts(SecondsFormat::Secs, true)
}

// ---- OCI document shapes ----

#[derive(Debug, Serialize, Deserialize)]
struct Index {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    manifests: Vec<Descriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Descriptor {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    annotations: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: String,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    created: String,
    architecture: String,
    os: String,
    #[serde(default)]
    config: Config,
    rootfs: Rootfs,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            created: epoch_timestamp(),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: Config::default(),
            rootfs: Rootfs::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Config {
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    env: Vec<String>,
    #[serde(rename = "Labels", default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Vec::is_empty")]
    entrypoint: Vec<String>,
    #[serde(rename = "Cmd", default)]
    cmd: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Rootfs {
    #[serde(rename = "type", default)]
    r#type: String,
    #[serde(default)]
    diff_ids: Vec<String>,
}
