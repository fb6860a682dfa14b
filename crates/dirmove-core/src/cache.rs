// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Identity index and name-lookup cache

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{EntryKey, ObjectId};

/// Indirection from stable identity to current entry location.
///
/// The rename core re-keys an object in the same step that moves its entry.
pub trait IdentityIndex: Send + Sync {
    fn insert(&self, id: ObjectId, key: EntryKey);

    /// Move `id` from `old` to `new`. Returns false if `id` was not at `old`.
    fn rekey(&self, id: ObjectId, old: EntryKey, new: EntryKey) -> bool;

    fn remove(&self, id: ObjectId) -> Option<EntryKey>;

    fn location(&self, id: ObjectId) -> Option<EntryKey>;

    fn identity_at(&self, key: EntryKey) -> Option<ObjectId>;
}

#[derive(Default)]
struct LocationMaps {
    by_id: HashMap<ObjectId, EntryKey>,
    by_key: HashMap<EntryKey, ObjectId>,
}

/// Forward and reverse maps behind one short-held mutex
#[derive(Default)]
pub struct LocationTable {
    maps: Mutex<LocationMaps>,
}

impl LocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.maps.lock().unwrap().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentityIndex for LocationTable {
    fn insert(&self, id: ObjectId, key: EntryKey) {
        let mut maps = self.maps.lock().unwrap();
        if let Some(previous) = maps.by_id.insert(id, key) {
            maps.by_key.remove(&previous);
        }
        maps.by_key.insert(key, id);
    }

    fn rekey(&self, id: ObjectId, old: EntryKey, new: EntryKey) -> bool {
        let mut maps = self.maps.lock().unwrap();
        if maps.by_id.get(&id) != Some(&old) {
            tracing::warn!(object = %id, old = %old, new = %new, "rekey from unexpected location");
            return false;
        }
        maps.by_key.remove(&old);
        maps.by_key.insert(new, id);
        maps.by_id.insert(id, new);
        true
    }

    fn remove(&self, id: ObjectId) -> Option<EntryKey> {
        let mut maps = self.maps.lock().unwrap();
        let key = maps.by_id.remove(&id)?;
        maps.by_key.remove(&key);
        Some(key)
    }

    fn location(&self, id: ObjectId) -> Option<EntryKey> {
        self.maps.lock().unwrap().by_id.get(&id).copied()
    }

    fn identity_at(&self, key: EntryKey) -> Option<ObjectId> {
        self.maps.lock().unwrap().by_key.get(&key).copied()
    }
}

/// Positive name-lookup cache. The rename core only needs invalidation.
#[cfg_attr(test, mockall::automock)]
pub trait NameCache: Send + Sync {
    fn lookup(&self, dir: ObjectId, name: &str) -> Option<ObjectId>;

    fn insert(&self, dir: ObjectId, name: &str, id: ObjectId);

    fn invalidate(&self, dir: ObjectId, name: &str);
}

/// Plain map from (directory, name) to identity
#[derive(Default)]
pub struct LookupCache {
    entries: Mutex<HashMap<(ObjectId, String), ObjectId>>,
}

impl LookupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NameCache for LookupCache {
    fn lookup(&self, dir: ObjectId, name: &str) -> Option<ObjectId> {
        self.entries
            .lock()
            .unwrap()
            .get(&(dir, name.to_string()))
            .copied()
    }

    fn insert(&self, dir: ObjectId, name: &str, id: ObjectId) {
        self.entries.lock().unwrap().insert((dir, name.to_string()), id);
    }

    fn invalidate(&self, dir: ObjectId, name: &str) {
        self.entries.lock().unwrap().remove(&(dir, name.to_string()));
    }
}
