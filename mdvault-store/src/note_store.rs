//! The client's local note replica.
//!
//! An arena of notes indexed by path. Mutations are synchronous and appear
//! atomic to readers: every note sits behind its own lock, so edits to
//! different paths proceed concurrently while a reader never observes a note
//! mid-update.
//!
//! Links and backlinks are derived state. The store keeps a forward-adjacency
//! map plus a list of pending link deltas; the reverse index is patched
//! incrementally on the next read, touching only the affected paths. The link
//! graph may be cyclic — nothing here ever walks it recursively.

use crate::error::{StoreError, StoreResult};
use crate::note::{content_checksum, LocalNote};
use mdvault_types::{NotePath, Timestamp};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

/// In-memory store of the local note collection.
#[derive(Debug, Default)]
pub struct NoteStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    /// Arena of notes, one lock per path.
    notes: HashMap<NotePath, Arc<Mutex<LocalNote>>>,
    /// Forward adjacency: path -> paths it links to.
    forward: HashMap<NotePath, BTreeSet<NotePath>>,
    /// Reverse adjacency: path -> paths linking to it.
    backlinks: HashMap<NotePath, BTreeSet<NotePath>>,
    /// Link changes not yet folded into `backlinks`.
    pending: Vec<LinkDelta>,
    /// Last-known server versions of locally deleted notes, so a queued
    /// delete can still carry its optimistic-concurrency token.
    tombstones: HashMap<NotePath, u64>,
    /// Store-wide hybrid logical clock for note timestamps.
    clock: Timestamp,
}

#[derive(Debug)]
struct LinkDelta {
    source: NotePath,
    removed: Vec<NotePath>,
    added: Vec<NotePath>,
}

impl NoteStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Local mutations ──────────────────────────────────────────

    /// Creates or edits a note from a local write. Returns the updated note.
    ///
    /// Recomputes derived fields and word count, bumps `updated_at`, and sets
    /// `is_dirty` iff the new content hash differs from the last-synced
    /// checksum.
    pub fn upsert(&self, path: NotePath, content: impl Into<String>) -> LocalNote {
        let content = content.into();
        let mut inner = self.inner.write().unwrap();
        inner.clock = inner.clock.tick();
        let now = inner.clock;

        let slot = match inner.notes.get(&path) {
            Some(slot) => {
                let slot = Arc::clone(slot);
                slot.lock().unwrap().apply_local_edit(content, now);
                slot
            }
            None => {
                let note = LocalNote::from_local_write(path.clone(), content, now);
                let slot = Arc::new(Mutex::new(note));
                inner.notes.insert(path.clone(), Arc::clone(&slot));
                slot
            }
        };

        let new_links = slot.lock().unwrap().links.clone();
        inner.record_link_change(&path, new_links);
        inner.fold_links();
        inner.read_slot(&slot)
    }

    /// Deletes a note from the local replica, remembering its last-known
    /// server version until the delete is confirmed.
    pub fn delete(&self, path: &NotePath) -> StoreResult<()> {
        let mut inner = self.inner.write().unwrap();
        let Some(slot) = inner.notes.remove(path) else {
            return Err(StoreError::NotFound(path.clone()));
        };
        let version = slot.lock().unwrap().sync_version;
        inner.tombstones.insert(path.clone(), version);
        inner.record_link_change(path, BTreeSet::new());
        debug!(path = %path, "deleted local note");
        Ok(())
    }

    /// Toggles the favorite flag.
    pub fn set_favorite(&self, path: &NotePath, favorite: bool) -> StoreResult<()> {
        let inner = self.inner.read().unwrap();
        let slot = inner.notes.get(path).ok_or_else(|| StoreError::NotFound(path.clone()))?;
        slot.lock().unwrap().is_favorite = favorite;
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Returns a consistent snapshot of a note, backlinks included.
    pub fn get(&self, path: &NotePath) -> Option<LocalNote> {
        {
            let inner = self.inner.read().unwrap();
            if inner.pending.is_empty() {
                return inner.notes.get(path).map(|slot| inner.read_slot(slot));
            }
        }
        let mut inner = self.inner.write().unwrap();
        inner.fold_links();
        inner.notes.get(path).map(|slot| inner.read_slot(slot))
    }

    /// Returns snapshots of all dirty notes.
    pub fn list_dirty(&self) -> Vec<LocalNote> {
        let mut inner = self.inner.write().unwrap();
        inner.fold_links();
        let mut dirty: Vec<LocalNote> = inner
            .notes
            .values()
            .filter(|slot| slot.lock().unwrap().is_dirty)
            .map(|slot| inner.read_slot(slot))
            .collect();
        dirty.sort_by(|a, b| a.path.cmp(&b.path));
        dirty
    }

    /// Number of dirty notes, exposed to UI collaborators.
    pub fn dirty_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner
            .notes
            .values()
            .filter(|slot| slot.lock().unwrap().is_dirty)
            .count()
    }

    /// Total number of notes in the replica.
    pub fn note_count(&self) -> usize {
        self.inner.read().unwrap().notes.len()
    }

    /// All note paths, sorted.
    pub fn paths(&self) -> Vec<NotePath> {
        let inner = self.inner.read().unwrap();
        let mut paths: Vec<NotePath> = inner.notes.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Paths linking to the given path. Works for paths that don't (yet)
    /// exist locally: a link target is a valid backlink anchor either way.
    pub fn backlinks_of(&self, path: &NotePath) -> BTreeSet<NotePath> {
        let mut inner = self.inner.write().unwrap();
        inner.fold_links();
        inner.backlinks.get(path).cloned().unwrap_or_default()
    }

    // ── Reconciler-facing writes ─────────────────────────────────

    /// Overwrites a note with authoritative server state, creating it if it
    /// doesn't exist locally. Clears dirtiness and advances the store clock
    /// past the server timestamp.
    pub fn apply_remote(
        &self,
        path: NotePath,
        content: String,
        checksum: String,
        sync_version: u64,
        updated_at: Timestamp,
    ) -> LocalNote {
        let mut inner = self.inner.write().unwrap();
        inner.clock = inner.clock.receive(&updated_at);
        inner.tombstones.remove(&path);

        let slot = match inner.notes.get(&path) {
            Some(slot) => {
                let slot = Arc::clone(slot);
                slot.lock()
                    .unwrap()
                    .apply_remote_write(content, checksum, sync_version, updated_at);
                slot
            }
            None => {
                let mut note = LocalNote::from_local_write(path.clone(), String::new(), updated_at);
                note.apply_remote_write(content, checksum, sync_version, updated_at);
                let slot = Arc::new(Mutex::new(note));
                inner.notes.insert(path.clone(), Arc::clone(&slot));
                slot
            }
        };

        let new_links = slot.lock().unwrap().links.clone();
        inner.record_link_change(&path, new_links);
        inner.fold_links();
        inner.read_slot(&slot)
    }

    /// Records an accepted push: sets the synced checksum and version, then
    /// recomputes dirtiness against the *current* content, so an edit made
    /// while the push was in flight keeps the note dirty.
    pub fn mark_synced(
        &self,
        path: &NotePath,
        checksum: String,
        sync_version: u64,
    ) -> StoreResult<()> {
        let inner = self.inner.read().unwrap();
        let slot = inner.notes.get(path).ok_or_else(|| StoreError::NotFound(path.clone()))?;
        let mut note = slot.lock().unwrap();
        note.sync_version = sync_version;
        note.is_dirty = content_checksum(&note.content) != checksum;
        note.checksum = Some(checksum);
        Ok(())
    }

    /// Removes a note after a server-confirmed delete. Absent paths are fine;
    /// the delete already happened locally. Clears any tombstone for the path.
    pub fn remove_synced(&self, path: &NotePath) {
        let mut inner = self.inner.write().unwrap();
        if inner.notes.remove(path).is_some() {
            inner.record_link_change(path, BTreeSet::new());
        }
        inner.tombstones.remove(path);
    }

    /// Adopts the server's version token for a path without touching content
    /// or dirtiness — the conflict-policy re-tag. Works on tombstones too.
    pub fn set_sync_version(&self, path: &NotePath, sync_version: u64) {
        let mut inner = self.inner.write().unwrap();
        if let Some(slot) = inner.notes.get(path) {
            slot.lock().unwrap().sync_version = sync_version;
        } else if inner.tombstones.contains_key(path) {
            inner.tombstones.insert(path.clone(), sync_version);
        }
    }

    /// Last-known server version for a path, zero if never synced. Falls
    /// back to the tombstone of a locally deleted note.
    pub fn sync_version(&self, path: &NotePath) -> u64 {
        let inner = self.inner.read().unwrap();
        if let Some(slot) = inner.notes.get(path) {
            return slot.lock().unwrap().sync_version;
        }
        inner.tombstones.get(path).copied().unwrap_or(0)
    }
}

impl StoreInner {
    /// Snapshot a note with its backlinks attached.
    fn read_slot(&self, slot: &Arc<Mutex<LocalNote>>) -> LocalNote {
        let mut note = slot.lock().unwrap().clone();
        note.backlinks = self.backlinks.get(&note.path).cloned().unwrap_or_default();
        note
    }

    /// Records a link-set change for `source`, deferring the reverse-index
    /// patch to the next read.
    fn record_link_change(&mut self, source: &NotePath, new_links: BTreeSet<NotePath>) {
        let old_links = self.forward.get(source).cloned().unwrap_or_default();
        if old_links == new_links {
            return;
        }
        let removed: Vec<NotePath> = old_links.difference(&new_links).cloned().collect();
        let added: Vec<NotePath> = new_links.difference(&old_links).cloned().collect();
        if new_links.is_empty() {
            self.forward.remove(source);
        } else {
            self.forward.insert(source.clone(), new_links);
        }
        self.pending.push(LinkDelta {
            source: source.clone(),
            removed,
            added,
        });
    }

    /// Applies pending link deltas to the reverse index. Incremental: only
    /// the edges named in the deltas are touched.
    fn fold_links(&mut self) {
        for delta in self.pending.drain(..) {
            for target in &delta.removed {
                if let Some(sources) = self.backlinks.get_mut(target) {
                    sources.remove(&delta.source);
                    if sources.is_empty() {
                        self.backlinks.remove(target);
                    }
                }
            }
            for target in &delta.added {
                self.backlinks.entry(target.clone()).or_default().insert(delta.source.clone());
            }
        }
    }
}
