//! Buildpack identity and descriptor lookup
//!
//! A buildpack is identified by `(id, version)`. On disk it lives under
//! `<buildpacksDir>/<escaped-id>/<version>/` with a `buildpack.toml`
//! descriptor that either points at an executable root (`bin/detect`)
//! or declares a nested order (meta-buildpack).

use crate::error::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A buildpack reference as it appears in order and group files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buildpack {
    pub id: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
}

fn is_false(b: &bool) -> bool {
    !b
}

impl PartialEq for Buildpack {
    /// Two buildpacks are equal iff their (id, version) match
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.version == other.version
    }
}

impl Eq for Buildpack {}

impl fmt::Display for Buildpack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

impl Buildpack {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            optional: false,
        }
    }

    /// Filesystem-safe form of the ID (`/` becomes `_`)
    pub fn escaped_id(&self) -> String {
        escape_id(&self.id)
    }

    /// Memoization key for detect trials
    pub fn key(&self) -> (String, String) {
        (self.id.clone(), self.version.clone())
    }

    /// Locate and parse this buildpack's descriptor
    pub async fn lookup(&self, buildpacks_dir: &Path) -> KilnResult<BuildpackInfo> {
        let root = buildpacks_dir.join(self.escaped_id()).join(&self.version);
        let toml_path = root.join("buildpack.toml");
        let descriptor = BuildpackDescriptor::from_file(&toml_path)
            .await
            .map_err(|e| KilnError::BuildpackLookup {
                buildpack: self.to_string(),
                path: toml_path.clone(),
                reason: e.to_string(),
            })?;

        if descriptor.buildpack.id != self.id || descriptor.buildpack.version != self.version {
            return Err(KilnError::BuildpackLookup {
                buildpack: self.to_string(),
                path: toml_path,
                reason: format!(
                    "descriptor declares '{}@{}'",
                    descriptor.buildpack.id, descriptor.buildpack.version
                ),
            });
        }

        let order = descriptor.order.map(|groups| {
            BuildpackOrder(
                groups
                    .into_iter()
                    .map(|g| BuildpackGroup { group: g.group })
                    .collect(),
            )
        });

        Ok(BuildpackInfo {
            path: root.join(descriptor.buildpack.path.as_deref().unwrap_or(".")),
            toml_path,
            order,
        })
    }
}

/// Replace `/` with `_` so buildpack IDs can name directories
pub fn escape_id(id: &str) -> String {
    id.replace('/', "_")
}

/// Inverse of [`escape_id`]
pub fn unescape_id(escaped: &str) -> String {
    escaped.replace('_', "/")
}

/// Resolved descriptor for one buildpack reference
#[derive(Debug, Clone)]
pub struct BuildpackInfo {
    /// Executable root; `bin/detect` lives underneath
    pub path: PathBuf,
    /// Path to the descriptor file, exported as `BP_TOML`
    pub toml_path: PathBuf,
    /// Present for meta-buildpacks; spliced into the enclosing group
    pub order: Option<BuildpackOrder>,
}

/// Parsed `buildpack.toml`
#[derive(Debug, Clone, Deserialize)]
pub struct BuildpackDescriptor {
    pub buildpack: DescriptorInfo,
    #[serde(default)]
    pub order: Option<Vec<GroupConfig>>,
}

/// The `[buildpack]` table of a descriptor
#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorInfo {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Executable root relative to the buildpack directory
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group: Vec<Buildpack>,
}

impl BuildpackDescriptor {
    pub async fn from_file(path: &Path) -> KilnResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading descriptor {}", path.display()), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> KilnResult<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// An ordered set of buildpacks evaluated together during detection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildpackGroup {
    pub group: Vec<Buildpack>,
}

impl BuildpackGroup {
    /// Load a group file (`group.toml`)
    pub async fn from_file(path: &Path) -> KilnResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading group file {}", path.display()), e))?;
        Ok(toml::from_str(&content)?)
    }

    /// Write a group file
    pub async fn write_file(&self, path: &Path) -> KilnResult<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| KilnError::io(format!("writing group file {}", path.display()), e))
    }
}

/// Groups tried in order; the first satisfying group wins
#[derive(Debug, Clone, Default)]
pub struct BuildpackOrder(pub Vec<BuildpackGroup>);

#[derive(Debug, Deserialize, Serialize)]
struct OrderConfig {
    order: Vec<GroupConfig>,
}

impl BuildpackOrder {
    /// Load an order file (`order.toml`)
    pub async fn from_file(path: &Path) -> KilnResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading order file {}", path.display()), e))?;
        let config: OrderConfig = toml::from_str(&content)?;
        Ok(Self(
            config
                .order
                .into_iter()
                .map(|g| BuildpackGroup { group: g.group })
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NODE_DESCRIPTOR: &str = r#"
[buildpack]
id = "example/node"
version = "1.2.3"
name = "Node Engine"
"#;

    const META_DESCRIPTOR: &str = r#"
[buildpack]
id = "example/meta"
version = "0.0.1"

[[order]]
group = [
    { id = "example/node", version = "1.2.3" },
    { id = "example/npm", version = "0.2.0", optional = true },
]
"#;

    #[test]
    fn equality_ignores_optional() {
        let a = Buildpack::new("example/node", "1.2.3");
        let mut b = a.clone();
        b.optional = true;
        assert_eq!(a, b);
    }

    #[test]
    fn display_form() {
        assert_eq!(
            Buildpack::new("example/node", "1.2.3").to_string(),
            "example/node@1.2.3"
        );
    }

    #[test]
    fn escape_round_trip() {
        let id = "example/node/engine";
        assert_eq!(escape_id(id), "example_node_engine");
        assert_eq!(unescape_id(&escape_id(id)), id);
    }

    #[test]
    fn parse_executable_descriptor() {
        let d = BuildpackDescriptor::parse(NODE_DESCRIPTOR).unwrap();
        assert_eq!(d.buildpack.id, "example/node");
        assert_eq!(d.buildpack.name.as_deref(), Some("Node Engine"));
        assert!(d.order.is_none());
    }

    #[test]
    fn parse_meta_descriptor() {
        let d = BuildpackDescriptor::parse(META_DESCRIPTOR).unwrap();
        let order = d.order.unwrap();
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].group.len(), 2);
        assert!(order[0].group[1].optional);
    }

    #[tokio::test]
    async fn lookup_resolves_executable_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("example_node").join("1.2.3");
        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("buildpack.toml"), NODE_DESCRIPTOR)
            .await
            .unwrap();

        let bp = Buildpack::new("example/node", "1.2.3");
        let info = bp.lookup(temp.path()).await.unwrap();
        assert_eq!(info.path, root.join("."));
        assert!(info.order.is_none());
    }

    #[tokio::test]
    async fn lookup_rejects_mismatched_descriptor() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("example_node").join("9.9.9");
        tokio::fs::create_dir_all(&root).await.unwrap();
        tokio::fs::write(root.join("buildpack.toml"), NODE_DESCRIPTOR)
            .await
            .unwrap();

        let bp = Buildpack::new("example/node", "9.9.9");
        let err = bp.lookup(temp.path()).await.unwrap_err();
        assert!(err.to_string().contains("descriptor declares"));
    }

    #[tokio::test]
    async fn order_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("order.toml");
        tokio::fs::write(
            &path,
            r#"
[[order]]
group = [{ id = "a", version = "1" }]

[[order]]
group = [{ id = "b", version = "2", optional = true }]
"#,
        )
        .await
        .unwrap();

        let order = BuildpackOrder::from_file(&path).await.unwrap();
        assert_eq!(order.0.len(), 2);
        assert_eq!(order.0[0].group[0].id, "a");
        assert!(order.0[1].group[0].optional);
    }

    #[tokio::test]
    async fn group_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("group.toml");
        let group = BuildpackGroup {
            group: vec![Buildpack::new("a", "1"), Buildpack::new("b", "2")],
        };
        group.write_file(&path).await.unwrap();

        let loaded = BuildpackGroup::from_file(&path).await.unwrap();
        assert_eq!(loaded.group, group.group);
    }
}
