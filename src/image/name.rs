//! Image reference parsing
//!
//! `[registry/]repository[:tag][@sha256:digest]`, with docker.io
//! conventions: the first path segment is a registry only when it
//! contains a dot or a port, or is `localhost`.

use crate::error::{KilnError, KilnResult};
use std::fmt;

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// A validated image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    registry: Option<String>,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse and validate a reference string
    pub fn parse(raw: &str) -> KilnResult<Self> {
        if raw.is_empty() {
            return Err(KilnError::InvalidImageReference(raw.to_string()));
        }

        let (remainder, digest) = match raw.split_once('@') {
            Some((head, digest)) => {
                if !valid_digest(digest) {
                    return Err(KilnError::InvalidImageReference(raw.to_string()));
                }
                (head, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to a registry port.
        let (remainder, tag) = match remainder.rsplit_once(':') {
            Some((head, tail)) if !tail.contains('/') => {
                if !valid_tag(tail) {
                    return Err(KilnError::InvalidImageReference(raw.to_string()));
                }
                (head, Some(tail.to_string()))
            }
            _ => (remainder, None),
        };

        let (registry, repository) = match remainder.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest.to_string())
            }
            _ => (None, remainder.to_string()),
        };

        if repository.is_empty() || !repository.split('/').all(valid_repo_segment) {
            return Err(KilnError::InvalidImageReference(raw.to_string()));
        }
        if let Some(reg) = &registry {
            if !valid_registry(reg) {
                return Err(KilnError::InvalidImageReference(raw.to_string()));
            }
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The registry host, defaulting to docker.io
    pub fn registry(&self) -> &str {
        self.registry.as_deref().unwrap_or(DEFAULT_REGISTRY)
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(reg) = &self.registry {
            write!(f, "{reg}/")?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn valid_repo_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        && !segment.starts_with(['.', '_', '-'])
}

fn valid_registry(registry: &str) -> bool {
    let host = registry.split_once(':').map_or(registry, |(h, port)| {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return "";
        }
        h
    });
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag.chars().next().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

fn valid_digest(digest: &str) -> bool {
    digest
        .strip_prefix("sha256:")
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}
