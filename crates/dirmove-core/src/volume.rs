// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Volume facade: owns the collaborators, the lock table and event sinks

use std::sync::Arc;
#[cfg(feature = "events")]
use std::collections::HashMap;
#[cfg(feature = "events")]
use std::sync::Mutex;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cache::{IdentityIndex, LocationTable, LookupCache, NameCache};
use crate::config::VolumeConfig;
use crate::error::{Participant, RenameError, RenameResult, RetryReason, Step};
use crate::locks::LockTable;
use crate::permissions::{PermissionOracle, PosixPermissions};
use crate::rename::{self, gate, RenameOperation};
use crate::storage::{DirectoryStore, MemoryStore};
#[cfg(feature = "events")]
use crate::types::{EventSink, SubscriptionId};
use crate::types::{
    current_timestamp, Action, Credential, EventKind, NewObject, ObjectId, ObjectKind,
    ObjectRecord,
};

/// A directory tree and everything needed to rename within it
pub struct Volume {
    pub(crate) config: VolumeConfig,
    pub(crate) store: Arc<dyn DirectoryStore>,
    pub(crate) permissions: Arc<dyn PermissionOracle>,
    pub(crate) identities: Arc<dyn IdentityIndex>,
    pub(crate) names: Arc<dyn NameCache>,
    pub(crate) locks: LockTable,
    #[cfg(feature = "events")]
    event_subscriptions: Mutex<HashMap<SubscriptionId, Arc<dyn EventSink>>>,
    #[cfg(feature = "events")]
    next_subscription_id: Mutex<u64>,
}

/// Builder for [`Volume`] that lets callers swap collaborators
pub struct VolumeBuilder {
    config: VolumeConfig,
    store: Option<Arc<dyn DirectoryStore>>,
    permissions: Option<Arc<dyn PermissionOracle>>,
    identities: Option<Arc<dyn IdentityIndex>>,
    names: Option<Arc<dyn NameCache>>,
    lock_history: bool,
}

impl VolumeBuilder {
    pub fn store(mut self, store: Arc<dyn DirectoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn permissions(mut self, oracle: Arc<dyn PermissionOracle>) -> Self {
        self.permissions = Some(oracle);
        self
    }

    pub fn identities(mut self, index: Arc<dyn IdentityIndex>) -> Self {
        self.identities = Some(index);
        self
    }

    pub fn name_cache(mut self, cache: Arc<dyn NameCache>) -> Self {
        self.names = Some(cache);
        self
    }

    /// Record directory-lock acquisitions; see [`LockTable::history`]
    pub fn lock_history(mut self, enabled: bool) -> Self {
        self.lock_history = enabled;
        self
    }

    pub fn build(self) -> Result<Volume> {
        self.config.validate()?;
        let config = self.config;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new(config.limits.max_entries_per_dir)));
        let permissions = self
            .permissions
            .unwrap_or_else(|| Arc::new(PosixPermissions::new(config.security.clone())));
        let identities = self.identities.unwrap_or_else(|| Arc::new(LocationTable::new()));
        let names = self.names.unwrap_or_else(|| Arc::new(LookupCache::new()));

        // Index whatever the store already holds
        for record in store.all_objects() {
            if let (Some(key), false) = (record.key, record.unlinked) {
                identities.insert(record.id, key);
            }
        }

        let mut locks = LockTable::new(config.locking.timeout());
        if self.lock_history {
            locks = locks.with_history();
        }

        Ok(Volume {
            config,
            store,
            permissions,
            identities,
            names,
            locks,
            #[cfg(feature = "events")]
            event_subscriptions: Mutex::new(HashMap::new()),
            #[cfg(feature = "events")]
            next_subscription_id: Mutex::new(1),
        })
    }
}

impl Volume {
    pub fn new(config: VolumeConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: VolumeConfig) -> VolumeBuilder {
        VolumeBuilder {
            config,
            store: None,
            permissions: None,
            identities: None,
            names: None,
            lock_history: false,
        }
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn root(&self) -> ObjectId {
        self.store.root()
    }

    pub fn store(&self) -> &Arc<dyn DirectoryStore> {
        &self.store
    }

    pub fn identities(&self) -> &Arc<dyn IdentityIndex> {
        &self.identities
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Atomically move `from_dir/from_name` to `to_dir/to_name`, replacing a
    /// compatible existing target
    pub fn rename(
        &self,
        from_dir: ObjectId,
        from_name: &str,
        to_dir: ObjectId,
        to_name: &str,
        cred: &Credential,
    ) -> RenameResult<()> {
        let op = RenameOperation {
            from_dir,
            from_name,
            to_dir,
            to_name,
            cred,
        };
        rename::execute(self, &op)
    }

    /// Create a directory
    pub fn mkdir(
        &self,
        dir: ObjectId,
        name: &str,
        cred: &Credential,
        mode: u32,
    ) -> RenameResult<ObjectId> {
        self.create_entry(dir, name, cred, ObjectKind::Directory, mode, 0)
    }

    /// Create a regular file with `len` bytes of data
    pub fn create(
        &self,
        dir: ObjectId,
        name: &str,
        cred: &Credential,
        mode: u32,
        len: u64,
    ) -> RenameResult<ObjectId> {
        self.create_entry(dir, name, cred, ObjectKind::File, mode, len)
    }

    fn create_entry(
        &self,
        dir: ObjectId,
        name: &str,
        cred: &Credential,
        kind: ObjectKind,
        mode: u32,
        len: u64,
    ) -> RenameResult<ObjectId> {
        gate::validate_name(name, self.config.limits.max_name_len)?;

        let _guard = self.locks.lock(dir)?;
        let mut parent = self.live_dir(dir, Step::Validate, Participant::ToDir)?;
        self.require(cred, &parent, Action::Write, Participant::ToDir)?;
        self.require(cred, &parent, Action::Search, Participant::ToDir)?;

        if gate::lookup(self, dir, name, Participant::ToDir)?.is_some() {
            return Err(RenameError::AlreadyExists {
                participant: Participant::ToObject,
            });
        }

        let slot = self
            .store
            .allocate_entry(dir)
            .map_err(|e| RenameError::from_store(Step::AssignLocation, Participant::ToDir, e))?;
        let mut record = self
            .store
            .create_object(&NewObject {
                kind,
                name: name.to_string(),
                parent: dir,
                owner: cred.owner(),
                mode: mode & 0o7777,
                len,
            })
            .map_err(|e| RenameError::from_store(Step::AssignLocation, Participant::ToObject, e))?;

        let key = match self.store.write_entry(dir, slot, &record.payload()) {
            Ok(key) => key,
            Err(e) => {
                if let Err(cleanup) = self.store.discard_object(record.id) {
                    warn!(
                        object = %record.id,
                        error = %cleanup,
                        "failed to discard unlinked object"
                    );
                }
                return Err(RenameError::from_store(Step::WriteNew, Participant::ToDir, e));
            }
        };
        record.key = Some(key);
        self.store
            .update_object(&record)
            .map_err(|e| RenameError::corrupt(Step::Commit, e.to_string()))?;
        self.identities.insert(record.id, key);

        if kind.is_dir() {
            parent.nlink += 1;
        }
        let now = current_timestamp();
        parent.times.mtime = now;
        parent.times.ctime = now;
        self.store
            .update_object(&parent)
            .map_err(|e| RenameError::corrupt(Step::Commit, e.to_string()))?;

        debug!(dir = %dir, name, object = %record.id, ?kind, "created entry");
        Ok(record.id)
    }

    /// Remove an empty directory
    pub fn rmdir(&self, dir: ObjectId, name: &str, cred: &Credential) -> RenameResult<()> {
        gate::validate_name(name, self.config.limits.max_name_len)?;

        self.live_dir(dir, Step::Validate, Participant::FromDir)?;
        let peeked = gate::lookup(self, dir, name, Participant::FromDir)?.ok_or(
            RenameError::NotFound {
                participant: Participant::FromObject,
            },
        )?;

        let locks = self.locks.lock_ordered(&[dir, peeked.id])?;
        let mut parent = self.live_dir(dir, Step::Validate, Participant::FromDir)?;
        let mut child = gate::lookup(self, dir, name, Participant::FromDir)?.ok_or(
            RenameError::NotFound {
                participant: Participant::FromObject,
            },
        )?;
        if child.id != peeked.id {
            return Err(RenameError::Retryable(RetryReason::TopologyChanged));
        }
        if !child.is_dir() {
            return Err(RenameError::NotADirectory {
                participant: Participant::FromObject,
            });
        }
        let empty = self
            .store
            .is_empty(child.id)
            .map_err(|e| RenameError::from_store(Step::CheckPossible, Participant::FromObject, e))?;
        if !empty {
            return Err(RenameError::DirectoryNotEmpty);
        }

        self.require(cred, &parent, Action::Write, Participant::FromDir)?;
        self.require(cred, &parent, Action::Search, Participant::FromDir)?;
        self.require(
            cred,
            &parent,
            Action::Unlink {
                entry_owner: child.owner.uid,
            },
            Participant::FromObject,
        )?;

        let key = child.key.ok_or_else(|| {
            RenameError::corrupt(Step::Lookup, format!("{} is linked without a key", child.id))
        })?;
        self.store
            .remove_entry(dir, key.slot)
            .map_err(|e| RenameError::from_store(Step::RemoveOld, Participant::FromDir, e))?;

        child.unlinked = true;
        child.nlink = 0;
        child.key = None;
        child.times.ctime = current_timestamp();
        parent.nlink = parent.nlink.saturating_sub(1);
        parent.times.mtime = child.times.ctime;
        parent.times.ctime = child.times.ctime;
        self.identities.remove(child.id);
        for record in [&child, &parent] {
            self.store
                .update_object(record)
                .map_err(|e| RenameError::corrupt(Step::Commit, e.to_string()))?;
        }
        self.store
            .release_storage(child.id)
            .map_err(|e| RenameError::corrupt(Step::Commit, e.to_string()))?;
        drop(locks);

        self.names.invalidate(dir, name);
        info!(dir = %dir, name, object = %child.id, "removed directory");
        self.emit_event(EventKind::Removed {
            dir,
            name: name.to_string(),
            object: child.id,
        });
        Ok(())
    }

    /// Resolve `name` in `dir`, consulting the name cache first
    pub fn lookup(&self, dir: ObjectId, name: &str) -> RenameResult<Option<ObjectId>> {
        if let Some(id) = self.names.lookup(dir, name) {
            return Ok(Some(id));
        }
        let _guard = self.locks.lock(dir)?;
        self.live_dir(dir, Step::Lookup, Participant::FromDir)?;
        let found = gate::lookup(self, dir, name, Participant::FromDir)?;
        if let Some(record) = &found {
            self.names.insert(dir, name, record.id);
        }
        Ok(found.map(|r| r.id))
    }

    pub fn object(&self, id: ObjectId) -> RenameResult<ObjectRecord> {
        self.store
            .object(id)
            .map_err(|e| RenameError::from_store(Step::Lookup, Participant::FromObject, e))
    }

    /// Names in `dir` with their identity and kind, in slot order
    pub fn readdir(&self, dir: ObjectId) -> RenameResult<Vec<(String, ObjectId, ObjectKind)>> {
        let _guard = self.locks.lock(dir)?;
        self.live_dir(dir, Step::Lookup, Participant::FromDir)?;
        let entries = self
            .store
            .list_entries(dir)
            .map_err(|e| RenameError::from_store(Step::Lookup, Participant::FromDir, e))?;
        Ok(entries
            .into_iter()
            .map(|(_, payload)| (payload.name, payload.object, payload.kind))
            .collect())
    }

    /// Fetch `id` and require it to be a directory that is still linked
    pub(crate) fn live_dir(
        &self,
        id: ObjectId,
        step: Step,
        participant: Participant,
    ) -> RenameResult<ObjectRecord> {
        let record = self
            .store
            .object(id)
            .map_err(|e| RenameError::from_store(step, participant, e))?;
        if record.unlinked {
            return Err(RenameError::NotFound { participant });
        }
        if !record.is_dir() {
            return Err(RenameError::NotADirectory { participant });
        }
        Ok(record)
    }

    fn require(
        &self,
        cred: &Credential,
        record: &ObjectRecord,
        action: Action,
        participant: Participant,
    ) -> RenameResult<()> {
        if self
            .permissions
            .check_permission(cred, record.mode, record.owner, action)
        {
            Ok(())
        } else {
            Err(RenameError::PermissionDenied {
                participant,
                action,
            })
        }
    }

    #[cfg(feature = "events")]
    pub fn subscribe_events(&self, sink: Arc<dyn EventSink>) -> SubscriptionId {
        let mut subscriptions = self.event_subscriptions.lock().unwrap();
        let mut next_id = self.next_subscription_id.lock().unwrap();
        let subscription_id = SubscriptionId::new(*next_id);
        *next_id += 1;
        subscriptions.insert(subscription_id, sink);
        subscription_id
    }

    /// Returns false if `sub` was not registered
    #[cfg(feature = "events")]
    pub fn unsubscribe_events(&self, sub: SubscriptionId) -> bool {
        self.event_subscriptions.lock().unwrap().remove(&sub).is_some()
    }

    #[cfg(feature = "events")]
    pub(crate) fn emit_event(&self, event: EventKind) {
        if !self.config.track_events {
            return;
        }
        // Sinks may call back into the volume
        let sinks: Vec<Arc<dyn EventSink>> =
            self.event_subscriptions.lock().unwrap().values().cloned().collect();
        for sink in sinks {
            sink.on_event(&event);
        }
    }

    #[cfg(not(feature = "events"))]
    pub(crate) fn emit_event(&self, _event: EventKind) {}
}
