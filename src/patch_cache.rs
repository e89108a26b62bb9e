//! Identity-keyed container for [`Change`]s, resolvable by any of a
//! change's lookup aliases.
//!
//! Mirrors the teacher's `Waitlist` shape (a `DashMap`-backed side
//! table, cheap to clone/copy for process-local snapshots) but keyed on
//! the multi-alias scheme from spec.md §4.1 rather than pack offsets.

use std::sync::Arc;

use dashmap::DashMap;

use crate::change::{Change, ChangeAlias, ChangeKey};

/// Lookup container mapping every alias of a cached change to its
/// canonical [`ChangeKey`], plus the canonical key to the change itself.
///
/// Cheap to copy: `Copy` here means "snapshot the current alias/change
/// maps into a fresh, independently-mutable cache" (spec.md's `Copy()`
/// operation), used by `ApplyEngine` to save/restore the committed-cache
/// around a transaction.
#[derive(Debug, Default)]
pub struct PatchCache {
    aliases: DashMap<ChangeAlias, ChangeKey>,
    changes: DashMap<ChangeKey, Arc<Change>>,
}

impl PatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a change, indexing it under its own computed aliases.
    /// Idempotent: inserting the same change again is a no-op (by key).
    pub fn insert(&self, change: Change) {
        let key = change.key();
        let aliases = change.aliases();
        self.insert_aliases(aliases, change.clone());
        self.changes.entry(key).or_insert_with(|| Arc::new(change));
    }

    /// Insert a change under an explicit set of aliases (e.g. a
    /// server-supplied alias the caller discovered out of band), in
    /// addition to the change's own computed aliases.
    pub fn insert_aliases(&self, extra_aliases: Vec<ChangeAlias>, change: Change) {
        let key = change.key();
        for alias in change.aliases().into_iter().chain(extra_aliases) {
            self.aliases.insert(alias, key.clone());
        }
        self.changes.entry(key).or_insert_with(|| Arc::new(change));
    }

    /// Resolve a change by any of its aliases.
    pub fn get_by_alias(&self, alias: &ChangeAlias) -> Option<Arc<Change>> {
        let key = self.aliases.get(alias)?.clone();
        self.changes.get(&key).map(|entry| entry.clone())
    }

    /// Resolve a change directly by its canonical identity.
    pub fn get(&self, key: &ChangeKey) -> Option<Arc<Change>> {
        self.changes.get(key).map(|entry| entry.clone())
    }

    pub fn contains(&self, change: &Change) -> bool {
        self.changes.contains_key(&change.key())
    }

    pub fn contains_key(&self, key: &ChangeKey) -> bool {
        self.changes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Snapshot this cache into a new, independently-mutable instance.
    pub fn copy(&self) -> PatchCache {
        let copied = PatchCache::new();
        for entry in self.changes.iter() {
            copied.changes.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in self.aliases.iter() {
            copied.aliases.insert(entry.key().clone(), entry.value().clone());
        }
        copied
    }

    /// Restore this cache's contents from a previously taken snapshot,
    /// in place. Used by `ApplyEngine` to roll back the committed-cache
    /// after an inflight failure.
    pub fn restore_from(&self, snapshot: &PatchCache) {
        self.changes.clear();
        self.aliases.clear();
        for entry in snapshot.changes.iter() {
            self.changes.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in snapshot.aliases.iter() {
            self.aliases.insert(entry.key().clone(), entry.value().clone());
        }
    }

    pub fn all_keys(&self) -> Vec<ChangeKey> {
        self.changes.iter().map(|e| e.key().clone()).collect()
    }
}
