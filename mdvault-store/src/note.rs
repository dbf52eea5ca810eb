//! The local note and its derived fields.
//!
//! Everything except `content` and the sync metadata is derived from the
//! content and path: title, folder, tags, outgoing links, word count. All
//! derivation is pure and synchronous.

use mdvault_types::{NotePath, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// A note in the client's local replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalNote {
    /// Stable identity within the collection.
    pub path: NotePath,
    /// First ATX heading in the content, or the path's file stem.
    pub title: String,
    /// Parent folder, `None` for notes at the collection root.
    pub folder: Option<String>,
    /// Inline `#tag` tokens parsed from the content.
    pub tags: BTreeSet<String>,
    /// Paths this note links to (derived from `[[wiki links]]`).
    pub links: BTreeSet<NotePath>,
    /// Paths that link to this note (derived reverse edges, filled on read).
    pub backlinks: BTreeSet<NotePath>,
    /// Raw markdown content.
    pub content: String,
    /// SHA-256 hex of the last-synced content, `None` if never synced.
    pub checksum: Option<String>,
    /// Number of whitespace-separated words in the content.
    pub word_count: usize,
    /// True iff the content diverges from the last-synced checksum.
    pub is_dirty: bool,
    /// User-toggled favorite flag.
    pub is_favorite: bool,
    /// When the note was first seen locally.
    pub created_at: Timestamp,
    /// Last local edit or applied remote write.
    pub updated_at: Timestamp,
    /// Server-assigned version, the optimistic-concurrency token.
    /// Zero until the first accepted write or pull.
    pub sync_version: u64,
}

impl LocalNote {
    /// Creates a note from a first local write.
    pub(crate) fn from_local_write(path: NotePath, content: String, now: Timestamp) -> Self {
        let derived = Derived::from_content(&path, &content);
        Self {
            path,
            title: derived.title,
            folder: derived.folder,
            tags: derived.tags,
            links: derived.links,
            backlinks: BTreeSet::new(),
            content,
            checksum: None,
            word_count: derived.word_count,
            is_dirty: true,
            is_favorite: false,
            created_at: now,
            updated_at: now,
            sync_version: 0,
        }
    }

    /// Applies a local edit: re-derives fields and recomputes dirtiness
    /// against the last-synced checksum.
    pub(crate) fn apply_local_edit(&mut self, content: String, now: Timestamp) {
        let derived = Derived::from_content(&self.path, &content);
        self.title = derived.title;
        self.tags = derived.tags;
        self.links = derived.links;
        self.word_count = derived.word_count;
        self.is_dirty = self.checksum.as_deref() != Some(content_checksum(&content).as_str());
        self.content = content;
        self.updated_at = now;
    }

    /// Overwrites with authoritative server state and clears dirtiness.
    pub(crate) fn apply_remote_write(
        &mut self,
        content: String,
        checksum: String,
        sync_version: u64,
        updated_at: Timestamp,
    ) {
        let derived = Derived::from_content(&self.path, &content);
        self.title = derived.title;
        self.tags = derived.tags;
        self.links = derived.links;
        self.word_count = derived.word_count;
        self.content = content;
        self.checksum = Some(checksum);
        self.sync_version = sync_version;
        self.updated_at = updated_at;
        self.is_dirty = false;
    }
}

/// SHA-256 hex digest of note content, the sync checksum.
#[must_use]
pub fn content_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fields derived from path + content.
pub(crate) struct Derived {
    pub title: String,
    pub folder: Option<String>,
    pub tags: BTreeSet<String>,
    pub links: BTreeSet<NotePath>,
    pub word_count: usize,
}

impl Derived {
    pub(crate) fn from_content(path: &NotePath, content: &str) -> Self {
        Self {
            title: derive_title(path, content),
            folder: path.folder().map(str::to_string),
            tags: parse_tags(content),
            links: parse_links(content),
            word_count: content.split_whitespace().count(),
        }
    }
}

/// First ATX heading, stripped of leading `#`s, else the file stem.
fn derive_title(path: &NotePath, content: &str) -> String {
    content
        .lines()
        .find_map(|line| {
            let trimmed = line.trim_start();
            let stripped = trimmed.trim_start_matches('#');
            if stripped.len() < trimmed.len() && stripped.starts_with(' ') {
                Some(stripped.trim().to_string())
            } else {
                None
            }
        })
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| path.file_stem().to_string())
}

/// Parses inline `#tag` tokens. A tag starts with a single `#` followed by
/// an alphanumeric character; heading markers (`# `, `## `) don't qualify.
fn parse_tags(content: &str) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    for token in content.split_whitespace() {
        if let Some(rest) = token.strip_prefix('#') {
            if rest.starts_with(|c: char| c.is_alphanumeric()) {
                let tag: String = rest
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '/')
                    .collect();
                if !tag.is_empty() {
                    tags.insert(tag);
                }
            }
        }
    }
    tags
}

/// Parses `[[wiki link]]` targets into note paths.
///
/// Aliases (`[[target|label]]`) and heading fragments (`[[target#Section]]`)
/// are stripped; a target without an extension resolves to `<target>.md`.
/// Targets that don't form a valid path are skipped.
fn parse_links(content: &str) -> BTreeSet<NotePath> {
    let mut links = BTreeSet::new();
    let bytes = content.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'[' && bytes[i + 1] == b'[' {
            if let Some(end) = content[i + 2..].find("]]") {
                let inner = &content[i + 2..i + 2 + end];
                if let Some(target) = link_target(inner) {
                    links.insert(target);
                }
                i += 2 + end + 2;
                continue;
            }
        }
        i += 1;
    }
    links
}

/// Resolves the inside of a `[[...]]` to a note path.
fn link_target(inner: &str) -> Option<NotePath> {
    let target = inner.split('|').next().unwrap_or(inner);
    let target = target.split('#').next().unwrap_or(target).trim();
    if target.is_empty() {
        return None;
    }
    let path = if target.rsplit('/').next().is_some_and(|name| name.contains('.')) {
        target.to_string()
    } else {
        format!("{target}.md")
    };
    NotePath::new(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> NotePath {
        NotePath::new(s).unwrap()
    }

    #[test]
    fn title_from_first_heading() {
        assert_eq!(derive_title(&path("a.md"), "## Weekly Plan\ntext"), "Weekly Plan");
    }

    #[test]
    fn title_falls_back_to_file_stem() {
        assert_eq!(derive_title(&path("notes/roadmap.md"), "no heading here"), "roadmap");
    }

    #[test]
    fn hash_without_space_is_not_a_heading_title() {
        assert_eq!(derive_title(&path("a.md"), "#tag only line"), "a");
    }

    #[test]
    fn tags_exclude_headings() {
        let tags = parse_tags("# Heading\nwork on #project-x and #rust today");
        assert_eq!(tags, BTreeSet::from(["project-x".into(), "rust".into()]));
    }

    #[test]
    fn links_resolve_md_extension() {
        let links = parse_links("see [[roadmap]] and [[notes/ideas.md]]");
        assert!(links.contains(&path("roadmap.md")));
        assert!(links.contains(&path("notes/ideas.md")));
    }

    #[test]
    fn link_alias_and_fragment_are_stripped() {
        let links = parse_links("see [[roadmap|the plan]] and [[ideas#Section]]");
        assert!(links.contains(&path("roadmap.md")));
        assert!(links.contains(&path("ideas.md")));
    }

    #[test]
    fn unclosed_link_is_ignored() {
        assert!(parse_links("broken [[link").is_empty());
    }

    #[test]
    fn checksum_is_stable_hex() {
        let a = content_checksum("hello");
        let b = content_checksum("hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }
}
