//! Error types for kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// All errors that can occur in kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Configuration errors
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Exporting to multiple registries is unsupported: {0:?}")]
    MultipleRegistries(Vec<String>),

    // Detection errors
    #[error("No buildpack group satisfied detection")]
    DetectionFailed,

    #[error("Buildpack order for '{0}' references itself")]
    CyclicOrder(String),

    #[error("Buildpack '{buildpack}' not found in {path}: {reason}")]
    BuildpackLookup {
        buildpack: String,
        path: PathBuf,
        reason: String,
    },

    // Layer errors
    #[error("Failed to parse metadata for layers {0:?}")]
    MalformedLayers(Vec<String>),

    #[error("Layer '{0}' is cache=true but has no contents")]
    CacheMissingContents(String),

    #[error("Cannot reuse '{0}': previous image has no metadata for this layer")]
    MissingReuseSource(String),

    // Image errors
    #[error("Could not parse reference: {0}")]
    InvalidImageReference(String),

    #[error("Image '{name}' error: {reason}")]
    Image { name: String, reason: String },

    #[error("Layer with diff ID '{0}' not found in previous image")]
    MissingImageLayer(String),

    #[error("One or more image names failed to save")]
    FailedToSave { failures: Vec<(String, String)> },

    // Cache errors
    #[error("Cache '{name}' error: {reason}")]
    Cache { name: String, reason: String },

    #[error("Layer with SHA '{0}' not found in cache")]
    MissingCacheLayer(String),

    #[error("Cache is already committed")]
    CacheCommitted,

    // Archive errors
    #[error("Tar entry '{0}' escapes the extraction root")]
    TarPathEscape(String),

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<KilnError>,
    },
}

/// CLI exit codes. `100` is reserved for the buildpack detect
/// subprocess "fail" result and never returned by kiln itself.
pub mod exit {
    pub const FAILED: u8 = 1;
    pub const INVALID_ARGS: u8 = 3;
    pub const FAILED_DETECT: u8 = 6;
    pub const FAILED_BUILD: u8 = 7;
    pub const FAILED_SAVE: u8 = 10;
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wrap the error with operation context
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Map the error to its CLI exit code
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            Self::InvalidArgs(_)
            | Self::ConfigInvalid { .. }
            | Self::MultipleRegistries(_)
            | Self::InvalidImageReference(_) => exit::INVALID_ARGS,
            Self::DetectionFailed | Self::CyclicOrder(_) => exit::FAILED_DETECT,
            Self::MalformedLayers(_)
            | Self::CacheMissingContents(_)
            | Self::MissingReuseSource(_)
            | Self::MissingImageLayer(_) => exit::FAILED_BUILD,
            Self::FailedToSave { .. } => exit::FAILED_SAVE,
            _ => exit::FAILED,
        }
    }

    /// Unwrap context layers down to the underlying error
    fn root(&self) -> &KilnError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Extension trait for wrapping results with operation context
pub trait ResultExt<T> {
    fn ctx(self, context: impl Into<String>) -> KilnResult<T>;
}

impl<T> ResultExt<T> for KilnResult<T> {
    fn ctx(self, context: impl Into<String>) -> KilnResult<T> {
        self.map_err(|e| e.context(context))
    }
}
