//! Note path — the stable, case-sensitive identity of a note.
//!
//! Paths use `/` as the separator regardless of platform. The path is the
//! sync key: renames are modeled as delete + create, so a path never changes
//! for the lifetime of a note.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A note's path within the collection, e.g. `notes/projects/roadmap.md`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotePath(String);

impl NotePath {
    /// Creates a note path, validating basic shape.
    ///
    /// Rejects empty paths, absolute paths, and `.`/`..` components. Does not
    /// touch case: paths are case-sensitive.
    pub fn new(path: impl Into<String>) -> Result<Self, Error> {
        let path = path.into();
        if path.is_empty() {
            return Err(Error::InvalidPath("path is empty".into()));
        }
        if path.starts_with('/') {
            return Err(Error::InvalidPath(format!("path is absolute: {path}")));
        }
        if path.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
            return Err(Error::InvalidPath(format!("path has invalid component: {path}")));
        }
        Ok(Self(path))
    }

    /// Returns the path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the parent folder, or `None` for notes at the collection root.
    #[must_use]
    pub fn folder(&self) -> Option<&str> {
        self.0.rsplit_once('/').map(|(parent, _)| parent)
    }

    /// Returns the file name, including any extension.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit_once('/').map_or(&self.0, |(_, name)| name)
    }

    /// Returns the file name without its extension.
    #[must_use]
    pub fn file_stem(&self) -> &str {
        let name = self.file_name();
        name.rsplit_once('.').map_or(name, |(stem, _)| stem)
    }
}

impl fmt::Display for NotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NotePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for NotePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
