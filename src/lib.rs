//! Kiln - Cloud Native Buildpacks lifecycle
//!
//! Transforms a source application directory into a runnable container
//! image by driving buildpacks through detect, analyze, restore,
//! export, and cache phases. Layer identity is the SHA-256 of the
//! canonical tar of the layer's content tree; every reuse decision
//! compares that SHA against metadata from prior runs.

pub mod analyzer;
pub mod archive;
pub mod buildpack;
pub mod cache;
pub mod cacher;
pub mod cli;
pub mod detector;
pub mod error;
pub mod exporter;
pub mod image;
pub mod layers;
pub mod metadata;
pub mod restorer;

pub use error::{KilnError, KilnResult};
