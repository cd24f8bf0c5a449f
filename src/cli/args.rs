//! CLI argument definitions using clap derive
//!
//! Every path flag falls back to the platform's `CNB_*` environment
//! variable, then to the conventional container path.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Kiln - Cloud Native Buildpacks lifecycle
///
/// Drives buildpacks through detect, analyze, restore, export, and
/// cache against a shared layers directory.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Lifecycle phases
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Select the buildpack group that matches the app
    Detect(DetectArgs),

    /// Restore layer metadata from the previous image and cache
    Analyze(AnalyzeArgs),

    /// Restore cached layer contents into the layers directory
    Restore(RestoreArgs),

    /// Assemble and publish the app image
    Export(ExportArgs),

    /// Publish cache layers into the cache store
    Cache(CacheArgs),
}

/// Arguments for the detect command
#[derive(Parser, Debug)]
pub struct DetectArgs {
    /// Path to the app directory
    #[arg(long, env = "CNB_APP_DIR", default_value = "/workspace")]
    pub app: PathBuf,

    /// Path to the buildpacks directory
    #[arg(long, env = "CNB_BUILDPACKS_DIR", default_value = "/cnb/buildpacks")]
    pub buildpacks: PathBuf,

    /// Path to the platform directory
    #[arg(long, env = "CNB_PLATFORM_DIR", default_value = "/platform")]
    pub platform: PathBuf,

    /// Path to order.toml
    #[arg(long, env = "CNB_ORDER_PATH", default_value = "/cnb/order.toml")]
    pub order: PathBuf,

    /// Where to write the selected group
    #[arg(long, env = "CNB_GROUP_PATH", default_value = "./group.toml")]
    pub group: PathBuf,

    /// Where to write the build plan
    #[arg(long, env = "CNB_PLAN_PATH", default_value = "./plan.toml")]
    pub plan: PathBuf,
}

/// Arguments for the analyze command
#[derive(Parser, Debug)]
pub struct AnalyzeArgs {
    /// Reference of the previous app image
    pub image: String,

    /// Path to the layers directory
    #[arg(long, env = "CNB_LAYERS_DIR", default_value = "/layers")]
    pub layers: PathBuf,

    /// Path to group.toml
    #[arg(long, env = "CNB_GROUP_PATH", default_value = "./group.toml")]
    pub group: PathBuf,

    /// Where to write the analyzed record
    #[arg(long, env = "CNB_ANALYZED_PATH", default_value = "./analyzed.toml")]
    pub analyzed: PathBuf,

    /// Root of the OCI image-layout store
    #[arg(long, env = "CNB_IMAGES_DIR", default_value = "/images")]
    pub images: PathBuf,

    #[command(flatten)]
    pub cache: CacheLocation,

    /// Do not restore layer metadata
    #[arg(long, env = "CNB_ANALYZE_SKIP_LAYERS")]
    pub skip_layers: bool,

    #[command(flatten)]
    pub ownership: Ownership,
}

/// Arguments for the restore command
#[derive(Parser, Debug)]
pub struct RestoreArgs {
    /// Path to the layers directory
    #[arg(long, env = "CNB_LAYERS_DIR", default_value = "/layers")]
    pub layers: PathBuf,

    /// Path to group.toml
    #[arg(long, env = "CNB_GROUP_PATH", default_value = "./group.toml")]
    pub group: PathBuf,

    /// Root of the OCI image-layout store
    #[arg(long, env = "CNB_IMAGES_DIR", default_value = "/images")]
    pub images: PathBuf,

    #[command(flatten)]
    pub cache: CacheLocation,

    #[command(flatten)]
    pub ownership: Ownership,
}

/// Arguments for the export command
#[derive(Parser, Debug)]
pub struct ExportArgs {
    /// Primary image name, then any additional names to save under
    #[arg(required = true)]
    pub images_to_save: Vec<String>,

    /// Path to the layers directory
    #[arg(long, env = "CNB_LAYERS_DIR", default_value = "/layers")]
    pub layers: PathBuf,

    /// Path to the app directory
    #[arg(long, env = "CNB_APP_DIR", default_value = "/workspace")]
    pub app: PathBuf,

    /// Path to group.toml
    #[arg(long, env = "CNB_GROUP_PATH", default_value = "./group.toml")]
    pub group: PathBuf,

    /// Path to the analyzed record
    #[arg(long, env = "CNB_ANALYZED_PATH", default_value = "./analyzed.toml")]
    pub analyzed: PathBuf,

    /// Path to stack.toml
    #[arg(long, env = "CNB_STACK_PATH", default_value = "/cnb/stack.toml")]
    pub stack: PathBuf,

    /// Reference of the run image; defaults to the stack's best mirror
    #[arg(long, env = "CNB_RUN_IMAGE")]
    pub run_image: Option<String>,

    /// Path to the launcher binary
    #[arg(long, default_value = "/cnb/lifecycle/launcher")]
    pub launcher: PathBuf,

    /// Root of the OCI image-layout store
    #[arg(long, env = "CNB_IMAGES_DIR", default_value = "/images")]
    pub images: PathBuf,

    #[command(flatten)]
    pub ownership: Ownership,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Path to the layers directory
    #[arg(long, env = "CNB_LAYERS_DIR", default_value = "/layers")]
    pub layers: PathBuf,

    /// Path to group.toml
    #[arg(long, env = "CNB_GROUP_PATH", default_value = "./group.toml")]
    pub group: PathBuf,

    /// Root of the OCI image-layout store
    #[arg(long, env = "CNB_IMAGES_DIR", default_value = "/images")]
    pub images: PathBuf,

    #[command(flatten)]
    pub cache: CacheLocation,

    #[command(flatten)]
    pub ownership: Ownership,
}

/// Where the cache store lives: a directory or a cache image
#[derive(Parser, Debug)]
pub struct CacheLocation {
    /// Path to a volume cache directory
    #[arg(long, env = "CNB_CACHE_DIR", conflicts_with = "cache_image")]
    pub cache_dir: Option<PathBuf>,

    /// Reference of a cache image in the image store
    #[arg(long, env = "CNB_CACHE_IMAGE")]
    pub cache_image: Option<String>,
}

/// Build-user ownership applied to the layers directory
#[derive(Parser, Debug)]
pub struct Ownership {
    /// UID of the user in the stack's build and run images
    #[arg(long, env = "CNB_USER_ID", default_value_t = 0)]
    pub uid: u32,

    /// GID of the user's group in the stack's build and run images
    #[arg(long, env = "CNB_GROUP_ID", default_value_t = 0)]
    pub gid: u32,
}
