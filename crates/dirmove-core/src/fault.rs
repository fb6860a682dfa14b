// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy, runtime controller, and a store decorator that
//! applies it

use crate::error::{StoreError, StoreResult};
use crate::storage::DirectoryStore;
use crate::types::{EntryKey, EntryPayload, NewObject, ObjectId, ObjectRecord, Slot};
use libc::EIO;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

/// Store operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    Lookup,
    Allocate,
    WriteEntry,
    RemoveEntry,
}

impl FaultOp {
    pub fn label(self) -> &'static str {
        match self {
            FaultOp::Lookup => "lookup",
            FaultOp::Allocate => "allocate",
            FaultOp::WriteEntry => "write_entry",
            FaultOp::RemoveEntry => "remove_entry",
        }
    }
}

/// Supported errno values for synthetic failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultErrno {
    Eio,
    Enospc,
}

impl FaultErrno {
    fn to_error(self) -> StoreError {
        match self {
            FaultErrno::Eio => StoreError::Io(io::Error::from_raw_os_error(EIO)),
            FaultErrno::Enospc => StoreError::NoSpace,
        }
    }
}

/// Individual rule describing which op should fail and how often.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FaultRule {
    pub op: FaultOp,
    pub errno: FaultErrno,
    /// Number of leading invocations to let through before injecting faults.
    #[serde(default)]
    pub start_after: u64,
    /// Maximum number of injected failures for this rule.
    #[serde(default)]
    pub max_faults: Option<u64>,
}

impl FaultRule {
    pub fn new(op: FaultOp, errno: FaultErrno) -> Self {
        Self {
            op,
            errno,
            start_after: 0,
            max_faults: None,
        }
    }

    pub fn after(mut self, start_after: u64) -> Self {
        self.start_after = start_after;
        self
    }

    pub fn times(mut self, max_faults: u64) -> Self {
        self.max_faults = Some(max_faults);
        self
    }
}

/// JSON-serializable fault policy.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn with_rules(rules: Vec<FaultRule>) -> Self {
        Self {
            enabled: true,
            rules,
        }
    }

    pub fn summary(&self) -> FaultPolicySummary {
        FaultPolicySummary {
            enabled: self.enabled,
            active: self.enabled && !self.rules.is_empty(),
            rule_count: self.rules.len(),
        }
    }
}

/// Lightweight summary returned to callers.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FaultPolicySummary {
    pub enabled: bool,
    pub active: bool,
    pub rule_count: usize,
}

#[derive(Clone, Debug, Default)]
struct RuleCounters {
    hits: u64,
    invocations: u64,
}

#[derive(Clone, Debug, Default)]
struct FaultState {
    policy: FaultPolicy,
    counters: Vec<RuleCounters>,
}

/// Runtime controller that tracks policy + hit counts.
pub struct FaultInjector {
    state: Mutex<FaultState>,
}

impl Default for FaultInjector {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultInjector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FaultState::default()),
        }
    }

    pub fn snapshot(&self) -> FaultPolicy {
        self.state.lock().unwrap().policy.clone()
    }

    pub fn summary(&self) -> FaultPolicySummary {
        self.snapshot().summary()
    }

    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut guard = self.state.lock().unwrap();
        guard.counters = vec![RuleCounters::default(); policy.rules.len()];
        guard.policy = policy;
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    /// Total number of faults injected so far
    pub fn injected(&self) -> u64 {
        self.state.lock().unwrap().counters.iter().map(|c| c.hits).sum()
    }

    pub fn should_fault(&self, op: FaultOp) -> Option<StoreError> {
        let mut guard = self.state.lock().unwrap();
        if !guard.policy.enabled {
            return None;
        }
        let FaultState { policy, counters } = &mut *guard;
        counters.resize(policy.rules.len(), RuleCounters::default());
        for (rule, counters) in policy.rules.iter().zip(counters.iter_mut()) {
            if rule.op != op {
                continue;
            }
            counters.invocations = counters.invocations.saturating_add(1);
            if counters.invocations <= rule.start_after {
                continue;
            }
            if let Some(max) = rule.max_faults {
                if counters.hits >= max {
                    continue;
                }
            }
            counters.hits = counters.hits.saturating_add(1);
            return Some(rule.errno.to_error());
        }
        None
    }
}

/// Store decorator that counts calls per operation and fails them according
/// to a [`FaultInjector`].
///
/// ```ignore
/// let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::default())));
/// store.injector().set_policy(FaultPolicy::with_rules(vec![
///     FaultRule::new(FaultOp::RemoveEntry, FaultErrno::Eio).times(1),
/// ]));
/// ```
pub struct FaultyStore {
    inner: Arc<dyn DirectoryStore>,
    injector: FaultInjector,
    call_counts: Mutex<HashMap<FaultOp, u64>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn DirectoryStore>) -> Self {
        Self {
            inner,
            injector: FaultInjector::new(),
            call_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(inner: Arc<dyn DirectoryStore>, policy: FaultPolicy) -> Self {
        let store = Self::new(inner);
        store.injector.set_policy(policy);
        store
    }

    pub fn injector(&self) -> &FaultInjector {
        &self.injector
    }

    /// Number of times `op` has been called, including failed calls
    pub fn call_count(&self, op: FaultOp) -> u64 {
        self.call_counts.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    /// Calls that would have modified stable storage
    pub fn storage_writes(&self) -> u64 {
        self.call_count(FaultOp::WriteEntry) + self.call_count(FaultOp::RemoveEntry)
    }

    pub fn reset_counters(&self) {
        self.call_counts.lock().unwrap().clear();
    }

    fn check_fault(&self, op: FaultOp) -> StoreResult<()> {
        *self.call_counts.lock().unwrap().entry(op).or_insert(0) += 1;
        match self.injector.should_fault(op) {
            Some(err) => {
                tracing::debug!(op = op.label(), error = %err, "injecting store fault");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

impl DirectoryStore for FaultyStore {
    fn root(&self) -> ObjectId {
        self.inner.root()
    }

    fn object(&self, id: ObjectId) -> StoreResult<ObjectRecord> {
        self.inner.object(id)
    }

    fn update_object(&self, record: &ObjectRecord) -> StoreResult<()> {
        self.inner.update_object(record)
    }

    fn create_object(&self, template: &NewObject) -> StoreResult<ObjectRecord> {
        self.inner.create_object(template)
    }

    fn lookup_child(&self, dir: ObjectId, name: &str) -> StoreResult<Option<ObjectRecord>> {
        self.check_fault(FaultOp::Lookup)?;
        self.inner.lookup_child(dir, name)
    }

    fn is_empty(&self, dir: ObjectId) -> StoreResult<bool> {
        self.inner.is_empty(dir)
    }

    fn allocate_entry(&self, dir: ObjectId) -> StoreResult<Slot> {
        self.check_fault(FaultOp::Allocate)?;
        self.inner.allocate_entry(dir)
    }

    fn write_entry(
        &self,
        dir: ObjectId,
        slot: Slot,
        payload: &EntryPayload,
    ) -> StoreResult<EntryKey> {
        self.check_fault(FaultOp::WriteEntry)?;
        self.inner.write_entry(dir, slot, payload)
    }

    fn remove_entry(&self, dir: ObjectId, slot: Slot) -> StoreResult<()> {
        self.check_fault(FaultOp::RemoveEntry)?;
        self.inner.remove_entry(dir, slot)
    }

    fn release_storage(&self, id: ObjectId) -> StoreResult<()> {
        self.inner.release_storage(id)
    }

    fn discard_object(&self, id: ObjectId) -> StoreResult<()> {
        self.inner.discard_object(id)
    }

    fn list_entries(&self, dir: ObjectId) -> StoreResult<Vec<(EntryKey, EntryPayload)>> {
        self.inner.list_entries(dir)
    }

    fn all_objects(&self) -> Vec<ObjectRecord> {
        self.inner.all_objects()
    }
}
