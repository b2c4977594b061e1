//! Shared types for the app shell.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A cache generation identifier.
///
/// Generations number the versioned cache buckets. Exactly one generation
/// is current for a running worker; buckets belonging to other generations
/// are deleted when that worker activates.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The cache bucket name for this generation, e.g. `app-cache-v18`.
    pub fn bucket_name(&self, prefix: &str) -> String {
        format!("{}-cache-v{}", prefix, self.0)
    }

    /// Parse a bucket name produced by [`Generation::bucket_name`].
    ///
    /// Returns `None` for names with a different prefix or a malformed
    /// generation suffix.
    pub fn from_bucket_name(prefix: &str, name: &str) -> Option<Self> {
        let suffix = name.strip_prefix(prefix)?.strip_prefix("-cache-v")?;
        suffix.parse().ok().map(Self)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// An opaque application build identifier.
///
/// Distinct from [`Generation`]: the tag names the application build, not
/// the cache layout. Two tags are only ever compared for equality; no
/// ordering is defined or needed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTag(String);

impl VersionTag {
    /// Create a tag from any string-ish value.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// The fixed, ordered allow-list of same-origin resources cached at
/// install time, plus the offline shell document served when a navigation
/// request cannot reach the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceManifest {
    /// Paths fetched and stored during install. Install is all-or-nothing
    /// over this list.
    pub resources: Vec<String>,

    /// Path of the cached document returned for failed navigations. Must
    /// also appear in `resources`.
    pub offline_shell: String,
}

impl ResourceManifest {
    /// Create a manifest from a resource list and an offline shell path.
    pub fn new(resources: Vec<String>, offline_shell: impl Into<String>) -> Self {
        Self {
            resources,
            offline_shell: offline_shell.into(),
        }
    }

    /// Whether a path is part of the allow-list.
    pub fn contains(&self, path: &str) -> bool {
        self.resources.iter().any(|r| r == path)
    }

    /// Number of listed resources.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Whether the allow-list is empty.
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
