// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory-entry storage for dirmove

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::types::{
    EntryKey, EntryPayload, Extent, NewObject, ObjectId, ObjectKind, ObjectRecord, ObjectTimes,
    Owner, Slot,
};

/// Directory-entry storage consumed by the rename core.
///
/// `object`/`update_object` operate on in-core state. `allocate_entry`,
/// `write_entry` and `remove_entry` are the stable-storage writes the rename
/// core has to be able to undo.
pub trait DirectoryStore: Send + Sync {
    fn root(&self) -> ObjectId;

    fn object(&self, id: ObjectId) -> StoreResult<ObjectRecord>;

    fn update_object(&self, record: &ObjectRecord) -> StoreResult<()>;

    /// Allocate identity and in-core state for a new, not yet linked object
    fn create_object(&self, template: &NewObject) -> StoreResult<ObjectRecord>;

    fn lookup_child(&self, dir: ObjectId, name: &str) -> StoreResult<Option<ObjectRecord>>;

    /// True when `dir` holds zero live entries
    fn is_empty(&self, dir: ObjectId) -> StoreResult<bool>;

    /// Find the first free slot in `dir` without reserving it
    fn allocate_entry(&self, dir: ObjectId) -> StoreResult<Slot>;

    fn write_entry(&self, dir: ObjectId, slot: Slot, payload: &EntryPayload)
        -> StoreResult<EntryKey>;

    fn remove_entry(&self, dir: ObjectId, slot: Slot) -> StoreResult<()>;

    /// Free the data of an object that no longer has any links
    fn release_storage(&self, id: ObjectId) -> StoreResult<()>;

    /// Drop an object that was created but never linked, with its data
    fn discard_object(&self, id: ObjectId) -> StoreResult<()>;

    fn list_entries(&self, dir: ObjectId) -> StoreResult<Vec<(EntryKey, EntryPayload)>>;

    fn all_objects(&self) -> Vec<ObjectRecord>;
}

#[derive(Clone, Debug, Default)]
struct SlotState {
    payload: Option<EntryPayload>,
    generation: u64,
}

#[derive(Debug, Default)]
struct DirTable {
    slots: Vec<SlotState>,
}

impl DirTable {
    fn live(&self) -> impl Iterator<Item = (usize, &SlotState, &EntryPayload)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, state)| state.payload.as_ref().map(|p| (idx, state, p)))
    }
}

/// Bump allocator for file data with a running in-use total
#[derive(Debug, Default)]
struct ExtentPool {
    next_start: u64,
    in_use: u64,
}

impl ExtentPool {
    fn allocate(&mut self, len: u64) -> Extent {
        let extent = Extent {
            start: self.next_start,
            len,
        };
        self.next_start += len;
        self.in_use += len;
        extent
    }

    fn release(&mut self, extent: Extent) {
        self.in_use = self.in_use.saturating_sub(extent.len);
    }
}

/// In-memory directory store with fixed-capacity entry tables
pub struct MemoryStore {
    max_entries: usize,
    next_id: AtomicU64,
    objects: Mutex<HashMap<ObjectId, ObjectRecord>>,
    dirs: Mutex<HashMap<ObjectId, DirTable>>,
    extents: Mutex<ExtentPool>,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self::with_root(max_entries, Owner { uid: 0, gid: 0 }, 0o755)
    }

    pub fn with_root(max_entries: usize, owner: Owner, mode: u32) -> Self {
        let root = ObjectRecord {
            id: ObjectId::ROOT,
            kind: ObjectKind::Directory,
            name: String::new(),
            parent: ObjectId::ROOT,
            key: None,
            owner,
            mode,
            nlink: 2,
            unlinked: false,
            extent: None,
            times: ObjectTimes::now(),
        };
        let mut objects = HashMap::new();
        objects.insert(ObjectId::ROOT, root);
        let mut dirs = HashMap::new();
        dirs.insert(ObjectId::ROOT, DirTable::default());

        Self {
            max_entries,
            next_id: AtomicU64::new(ObjectId::ROOT.0 + 1),
            objects: Mutex::new(objects),
            dirs: Mutex::new(dirs),
            extents: Mutex::new(ExtentPool::default()),
        }
    }

    /// Total length of file data still allocated
    pub fn bytes_in_use(&self) -> u64 {
        self.extents.lock().unwrap().in_use
    }

    fn with_table<T>(
        &self,
        dir: ObjectId,
        f: impl FnOnce(&mut DirTable) -> StoreResult<T>,
    ) -> StoreResult<T> {
        {
            let mut dirs = self.dirs.lock().unwrap();
            if let Some(table) = dirs.get_mut(&dir) {
                return f(table);
            }
        }
        if self.objects.lock().unwrap().contains_key(&dir) {
            Err(StoreError::NotADirectory(dir))
        } else {
            Err(StoreError::NotFound(dir))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(crate::config::VolumeLimits::default().max_entries_per_dir)
    }
}

impl DirectoryStore for MemoryStore {
    fn root(&self) -> ObjectId {
        ObjectId::ROOT
    }

    fn object(&self, id: ObjectId) -> StoreResult<ObjectRecord> {
        let objects = self.objects.lock().unwrap();
        objects.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    fn update_object(&self, record: &ObjectRecord) -> StoreResult<()> {
        let mut objects = self.objects.lock().unwrap();
        let slot = objects.get_mut(&record.id).ok_or(StoreError::NotFound(record.id))?;
        *slot = record.clone();
        Ok(())
    }

    fn create_object(&self, template: &NewObject) -> StoreResult<ObjectRecord> {
        let id = ObjectId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (nlink, extent) = match template.kind {
            ObjectKind::Directory => (2, None),
            ObjectKind::File => (1, Some(self.extents.lock().unwrap().allocate(template.len))),
        };
        let record = ObjectRecord {
            id,
            kind: template.kind,
            name: template.name.clone(),
            parent: template.parent,
            key: None,
            owner: template.owner,
            mode: template.mode,
            nlink,
            unlinked: false,
            extent,
            times: ObjectTimes::now(),
        };
        if template.kind.is_dir() {
            self.dirs.lock().unwrap().insert(id, DirTable::default());
        }
        self.objects.lock().unwrap().insert(id, record.clone());
        Ok(record)
    }

    fn lookup_child(&self, dir: ObjectId, name: &str) -> StoreResult<Option<ObjectRecord>> {
        let child = self.with_table(dir, |table| {
            Ok(table.live().find(|(_, _, p)| p.name == name).map(|(_, _, p)| p.object))
        })?;
        match child {
            Some(id) => self.object(id).map(Some),
            None => Ok(None),
        }
    }

    fn is_empty(&self, dir: ObjectId) -> StoreResult<bool> {
        self.with_table(dir, |table| Ok(table.live().next().is_none()))
    }

    fn allocate_entry(&self, dir: ObjectId) -> StoreResult<Slot> {
        let max_entries = self.max_entries;
        self.with_table(dir, |table| {
            if let Some(idx) = table.slots.iter().position(|s| s.payload.is_none()) {
                return Ok(Slot(idx as u32));
            }
            if table.slots.len() < max_entries {
                Ok(Slot(table.slots.len() as u32))
            } else {
                Err(StoreError::NoSpace)
            }
        })
    }

    fn write_entry(
        &self,
        dir: ObjectId,
        slot: Slot,
        payload: &EntryPayload,
    ) -> StoreResult<EntryKey> {
        let max_entries = self.max_entries;
        self.with_table(dir, |table| {
            if table.live().any(|(_, _, p)| p.name == payload.name) {
                return Err(StoreError::AlreadyExists);
            }
            let idx = slot.0 as usize;
            if idx == table.slots.len() && idx < max_entries {
                table.slots.push(SlotState::default());
            }
            let state = table.slots.get_mut(idx).ok_or(StoreError::SlotState {
                dir,
                slot,
                detail: "beyond end of directory",
            })?;
            if state.payload.is_some() {
                return Err(StoreError::SlotState {
                    dir,
                    slot,
                    detail: "already occupied",
                });
            }
            state.generation += 1;
            state.payload = Some(payload.clone());
            Ok(EntryKey {
                parent: dir,
                slot,
                generation: state.generation,
            })
        })
    }

    fn remove_entry(&self, dir: ObjectId, slot: Slot) -> StoreResult<()> {
        self.with_table(dir, |table| {
            let state = table.slots.get_mut(slot.0 as usize).ok_or(StoreError::SlotState {
                dir,
                slot,
                detail: "beyond end of directory",
            })?;
            if state.payload.take().is_none() {
                return Err(StoreError::SlotState {
                    dir,
                    slot,
                    detail: "already free",
                });
            }
            Ok(())
        })
    }

    fn release_storage(&self, id: ObjectId) -> StoreResult<()> {
        let released = {
            let mut objects = self.objects.lock().unwrap();
            let record = objects.get_mut(&id).ok_or(StoreError::NotFound(id))?;
            if record.nlink > 0 {
                None
            } else {
                record.extent.take()
            }
        };
        if let Some(extent) = released {
            self.extents.lock().unwrap().release(extent);
        }
        Ok(())
    }

    fn discard_object(&self, id: ObjectId) -> StoreResult<()> {
        let record = {
            let mut objects = self.objects.lock().unwrap();
            if let Some(key) = objects.get(&id).and_then(|r| r.key) {
                return Err(StoreError::SlotState {
                    dir: key.parent,
                    slot: key.slot,
                    detail: "object still linked",
                });
            }
            objects.remove(&id).ok_or(StoreError::NotFound(id))?
        };
        self.dirs.lock().unwrap().remove(&id);
        if let Some(extent) = record.extent {
            self.extents.lock().unwrap().release(extent);
        }
        Ok(())
    }

    fn list_entries(&self, dir: ObjectId) -> StoreResult<Vec<(EntryKey, EntryPayload)>> {
        self.with_table(dir, |table| {
            Ok(table
                .live()
                .map(|(idx, state, payload)| {
                    (
                        EntryKey {
                            parent: dir,
                            slot: Slot(idx as u32),
                            generation: state.generation,
                        },
                        payload.clone(),
                    )
                })
                .collect())
        })
    }

    fn all_objects(&self) -> Vec<ObjectRecord> {
        let objects = self.objects.lock().unwrap();
        let mut records: Vec<_> = objects.values().cloned().collect();
        records.sort_by_key(|r| r.id);
        records
    }
}
