//! Layer and image metadata
//!
//! One unified [`LayerMetadata`] record serves every surface: the sidecar
//! TOML next to a layer directory, the app-image label, and the cache
//! store's metadata document. The label keys differ only at the IO
//! boundary.

use crate::buildpack::Buildpack;
use crate::error::{KilnError, KilnResult};
use crate::image::Image;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Label holding [`LayersMetadata`] on the exported app image
pub const LAYERS_METADATA_LABEL: &str = "io.buildpacks.lifecycle.metadata";

/// Label holding [`BuildMetadata`] on the exported app image
pub const BUILD_METADATA_LABEL: &str = "io.buildpacks.build.metadata";

/// Label holding the stack identifier
pub const STACK_ID_LABEL: &str = "io.buildpacks.stack.id";

/// Label (and volume-cache file name) holding [`CacheMetadata`]
pub const CACHE_METADATA_LABEL: &str = "io.buildpacks.lifecycle.cache.metadata";

/// Everything known about one layer: its diff ID, its flags, and the
/// opaque metadata the owning buildpack carries forward between builds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub build: bool,
    #[serde(default)]
    pub launch: bool,
    #[serde(default)]
    pub cache: bool,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl LayerMetadata {
    /// A pseudo-layer slot (app, config, launcher) carries only a SHA
    pub fn with_sha(sha: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            ..Self::default()
        }
    }
}

/// Per-buildpack layer metadata as recorded in a label
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackLayersMetadata {
    #[serde(rename = "key")]
    pub id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub layers: BTreeMap<String, LayerMetadata>,
}

/// Identity of the run image the app image was built on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunImageMetadata {
    #[serde(rename = "topLayer")]
    pub top_layer: String,
    pub reference: String,
}

/// The `io.buildpacks.lifecycle.metadata` label
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayersMetadata {
    #[serde(default)]
    pub app: LayerMetadata,
    #[serde(default)]
    pub config: LayerMetadata,
    #[serde(default)]
    pub launcher: LayerMetadata,
    #[serde(default)]
    pub buildpacks: Vec<BuildpackLayersMetadata>,
    #[serde(rename = "runImage", default)]
    pub run_image: RunImageMetadata,
    #[serde(default)]
    pub stack: StackMetadata,
}

impl LayersMetadata {
    /// Layer metadata recorded for the given buildpack ID, if any
    pub fn for_buildpack(&self, id: &str) -> Option<&BuildpackLayersMetadata> {
        self.buildpacks.iter().find(|bp| bp.id == id)
    }

    /// Recorded layers for the given buildpack ID (empty when absent)
    pub fn layers_for(&self, id: &str) -> BTreeMap<String, LayerMetadata> {
        self.for_buildpack(id)
            .map(|bp| bp.layers.clone())
            .unwrap_or_default()
    }
}

/// Metadata stored alongside tars in a cache store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    #[serde(default)]
    pub buildpacks: Vec<BuildpackLayersMetadata>,
}

impl CacheMetadata {
    pub fn layers_for(&self, id: &str) -> BTreeMap<String, LayerMetadata> {
        self.buildpacks
            .iter()
            .find(|bp| bp.id == id)
            .map(|bp| bp.layers.clone())
            .unwrap_or_default()
    }
}

/// Identity of the previous app image resolved during analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageIdentifier {
    pub reference: String,
}

/// Record handed from the analyze phase to the export phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzedMetadata {
    #[serde(default)]
    pub image: Option<ImageIdentifier>,
    #[serde(default)]
    pub metadata: LayersMetadata,
}

impl AnalyzedMetadata {
    /// Load `analyzed.toml`, tolerating absence
    pub async fn from_file(path: &Path) -> KilnResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(KilnError::io(
                format!("reading analyzed file {}", path.display()),
                e,
            )),
        }
    }

    /// Write `analyzed.toml`
    pub async fn write_file(&self, path: &Path) -> KilnResult<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await.map_err(|e| {
            KilnError::io(format!("writing analyzed file {}", path.display()), e)
        })
    }
}

/// Stack configuration (`stack.toml`) and label content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackMetadata {
    #[serde(rename = "runImage", alias = "run-image", default)]
    pub run_image: StackRunImageMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackRunImageMetadata {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
}

impl StackMetadata {
    pub async fn from_file(path: &Path) -> KilnResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(KilnError::io(
                format!("reading stack file {}", path.display()),
                e,
            )),
        }
    }

    /// Pick the run-image mirror living on `registry`, falling back to
    /// the primary image.
    pub fn best_run_image_mirror(&self, registry: &str) -> KilnResult<String> {
        if self.run_image.image.is_empty() {
            return Err(KilnError::ConfigInvalid {
                path: PathBuf::from("stack.toml"),
                reason: "missing run-image metadata".to_string(),
            });
        }
        let candidates =
            std::iter::once(&self.run_image.image).chain(self.run_image.mirrors.iter());
        for candidate in candidates {
            if let Ok(reference) = crate::image::name::ImageReference::parse(candidate) {
                if reference.registry() == registry {
                    return Ok(candidate.clone());
                }
            }
        }
        Ok(self.run_image.image.clone())
    }
}

/// One bill-of-materials entry from the build plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BomEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// A launchable process definition contributed by a buildpack
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Process {
    #[serde(rename = "type")]
    pub r#type: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Shape of `<layersDir>/config/metadata.toml`, written during the
/// build phase (external to kiln) and consumed by the exporter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildTomlFile {
    #[serde(default)]
    pub bom: Vec<BomEntry>,
    #[serde(default)]
    pub processes: Vec<Process>,
}

impl BuildTomlFile {
    /// Conventional location under the layers directory
    pub fn path(layers_dir: &Path) -> PathBuf {
        layers_dir.join("config").join("metadata.toml")
    }

    pub async fn from_file(path: &Path) -> KilnResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(KilnError::io(
                format!("reading build metadata {}", path.display()),
                e,
            )),
        }
    }
}

/// The `io.buildpacks.build.metadata` label
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildMetadata {
    #[serde(default)]
    pub bom: Vec<BomEntry>,
    #[serde(default)]
    pub buildpacks: Vec<Buildpack>,
    #[serde(default)]
    pub processes: Vec<Process>,
    #[serde(default)]
    pub launcher: LauncherMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LauncherMetadata {
    #[serde(default)]
    pub version: String,
}

/// Read and parse the layers-metadata label from an image.
///
/// An absent image, absent label, or garbage label all yield the empty
/// metadata: prior-image state is advisory, never load-bearing.
pub async fn layers_metadata_from_image(image: &dyn Image) -> KilnResult<LayersMetadata> {
    let contents = raw_label(image, LAYERS_METADATA_LABEL).await?;
    match contents {
        Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
        None => Ok(LayersMetadata::default()),
    }
}

/// Read a raw label from an image, `None` when the image is absent
pub async fn raw_label(image: &dyn Image, label: &str) -> KilnResult<Option<String>> {
    if !image.found().await? {
        return Ok(None);
    }
    image.label(label).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample() -> LayersMetadata {
        LayersMetadata {
            app: LayerMetadata::with_sha("sha256:aaa"),
            config: LayerMetadata::with_sha("sha256:ccc"),
            launcher: LayerMetadata::with_sha("sha256:lll"),
            buildpacks: vec![BuildpackLayersMetadata {
                id: "example/node".to_string(),
                version: "1.2.3".to_string(),
                layers: BTreeMap::from([(
                    "node-modules".to_string(),
                    LayerMetadata {
                        sha: "sha256:123".to_string(),
                        launch: true,
                        cache: true,
                        build: false,
                        metadata: json!({"node-version": "20.1.0"}),
                    },
                )]),
            }],
            run_image: RunImageMetadata {
                top_layer: "sha256:top".to_string(),
                reference: "run@sha256:digest".to_string(),
            },
            stack: StackMetadata::default(),
        }
    }

    #[test]
    fn label_json_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["app"]["sha"], "sha256:aaa");
        assert_eq!(json["buildpacks"][0]["key"], "example/node");
        assert_eq!(json["runImage"]["topLayer"], "sha256:top");
        assert_eq!(
            json["buildpacks"][0]["layers"]["node-modules"]["metadata"]["node-version"],
            "20.1.0"
        );
    }

    #[test]
    fn label_round_trip() {
        let meta = sample();
        let raw = serde_json::to_string(&meta).unwrap();
        let parsed: LayersMetadata = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn sidecar_toml_round_trip() {
        let layer = LayerMetadata {
            sha: "sha256:123".to_string(),
            launch: true,
            cache: false,
            build: true,
            metadata: json!({"version": "20.1.0"}),
        };
        let raw = toml::to_string_pretty(&layer).unwrap();
        let parsed: LayerMetadata = toml::from_str(&raw).unwrap();
        assert_eq!(parsed, layer);
    }

    #[test]
    fn for_buildpack_lookup() {
        let meta = sample();
        assert!(meta.for_buildpack("example/node").is_some());
        assert!(meta.for_buildpack("example/missing").is_none());
        assert!(meta.layers_for("example/missing").is_empty());
    }

    #[test]
    fn garbage_label_yields_default() {
        let parsed: LayersMetadata =
            serde_json::from_str("{not json").unwrap_or_default();
        assert_eq!(parsed, LayersMetadata::default());
    }

    #[tokio::test]
    async fn analyzed_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("analyzed.toml");

        let analyzed = AnalyzedMetadata {
            image: Some(ImageIdentifier {
                reference: "registry.example.com/app@sha256:abc".to_string(),
            }),
            metadata: sample(),
        };
        analyzed.write_file(&path).await.unwrap();

        let loaded = AnalyzedMetadata::from_file(&path).await.unwrap();
        assert_eq!(loaded.image, analyzed.image);
        assert_eq!(loaded.metadata, analyzed.metadata);
    }

    #[tokio::test]
    async fn analyzed_file_absent_is_default() {
        let temp = TempDir::new().unwrap();
        let loaded = AnalyzedMetadata::from_file(&temp.path().join("missing.toml"))
            .await
            .unwrap();
        assert!(loaded.image.is_none());
    }

    #[test]
    fn best_mirror_matches_registry() {
        let stack = StackMetadata {
            run_image: StackRunImageMetadata {
                image: "registry.example.com/stack/run".to_string(),
                mirrors: vec![
                    "mirror.example.org/stack/run".to_string(),
                    "docker.io/stack/run".to_string(),
                ],
            },
        };
        assert_eq!(
            stack.best_run_image_mirror("mirror.example.org").unwrap(),
            "mirror.example.org/stack/run"
        );
        assert_eq!(
            stack.best_run_image_mirror("unknown.example.net").unwrap(),
            "registry.example.com/stack/run"
        );
    }

    #[test]
    fn best_mirror_requires_run_image() {
        let stack = StackMetadata::default();
        assert!(stack.best_run_image_mirror("docker.io").is_err());
    }

    #[tokio::test]
    async fn build_toml_parses_bom_and_processes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("metadata.toml");
        tokio::fs::write(
            &path,
            r#"
[[bom]]
name = "node"
version = "20.1.0"

[bom.metadata]
source = "https://nodejs.org"

[[processes]]
type = "web"
command = "node server.js"
"#,
        )
        .await
        .unwrap();

        let build = BuildTomlFile::from_file(&path).await.unwrap();
        assert_eq!(build.bom.len(), 1);
        assert_eq!(build.bom[0].version.as_deref(), Some("20.1.0"));
        assert_eq!(build.processes[0].r#type, "web");
    }
}
