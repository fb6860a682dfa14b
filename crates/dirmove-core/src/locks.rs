// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Exclusive, directory-scoped locks

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::types::ObjectId;

/// Pseudo-directory held across a directory move between parents. It orders
/// before every real directory.
pub const TOPOLOGY_LOCK: ObjectId = ObjectId(0);

/// The lock manager gave up waiting for `dir`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTimeout {
    pub dir: ObjectId,
}

/// One entry of the acquisition history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Acquired(ObjectId),
    Released(ObjectId),
}

/// Table of currently held directory locks.
///
/// A lock is a membership in `held`; waiters park on the condvar and retry
/// after every release.
pub struct LockTable {
    held: Mutex<HashSet<ObjectId>>,
    released: Condvar,
    timeout: Duration,
    history: Option<Mutex<Vec<LockEvent>>>,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            timeout,
            history: None,
        }
    }

    /// Record every acquisition and release for later inspection
    pub fn with_history(mut self) -> Self {
        self.history = Some(Mutex::new(Vec::new()));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn lock(&self, dir: ObjectId) -> Result<DirLockGuard<'_>, LockTimeout> {
        let deadline = Instant::now() + self.timeout;
        let mut held = self.held.lock().unwrap();
        while held.contains(&dir) {
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(dir = %dir, "directory lock timed out");
                return Err(LockTimeout { dir });
            }
            let (guard, _) = self.released.wait_timeout(held, deadline - now).unwrap();
            held = guard;
        }
        held.insert(dir);
        drop(held);
        self.record(LockEvent::Acquired(dir));
        Ok(DirLockGuard { table: self, dir })
    }

    /// Lock every id in increasing order, skipping duplicates.
    ///
    /// On timeout the locks already taken are released before returning.
    pub fn lock_ordered(&self, ids: &[ObjectId]) -> Result<LockSet<'_>, LockTimeout> {
        let mut ordered = ids.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for id in ordered {
            guards.push(self.lock(id)?);
        }
        Ok(LockSet { guards })
    }

    pub fn is_locked(&self, dir: ObjectId) -> bool {
        self.held.lock().unwrap().contains(&dir)
    }

    pub fn history(&self) -> Vec<LockEvent> {
        match &self.history {
            Some(history) => history.lock().unwrap().clone(),
            None => Vec::new(),
        }
    }

    pub fn clear_history(&self) {
        if let Some(history) = &self.history {
            history.lock().unwrap().clear();
        }
    }

    fn unlock(&self, dir: ObjectId) {
        let removed = self.held.lock().unwrap().remove(&dir);
        debug_assert!(removed, "released {dir} which was not held");
        self.record(LockEvent::Released(dir));
        self.released.notify_all();
    }

    fn record(&self, event: LockEvent) {
        if let Some(history) = &self.history {
            history.lock().unwrap().push(event);
        }
    }
}

/// Held lock on one directory, released on drop
pub struct DirLockGuard<'a> {
    table: &'a LockTable,
    dir: ObjectId,
}

impl DirLockGuard<'_> {
    pub fn dir(&self) -> ObjectId {
        self.dir
    }
}

impl Drop for DirLockGuard<'_> {
    fn drop(&mut self) {
        self.table.unlock(self.dir);
    }
}

impl std::fmt::Debug for DirLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirLockGuard").field("dir", &self.dir).finish()
    }
}

/// Locks taken together by [`LockTable::lock_ordered`]
#[derive(Debug)]
pub struct LockSet<'a> {
    guards: Vec<DirLockGuard<'a>>,
}

impl LockSet<'_> {
    pub fn contains(&self, dir: ObjectId) -> bool {
        self.guards.iter().any(|g| g.dir == dir)
    }

    pub fn dirs(&self) -> Vec<ObjectId> {
        self.guards.iter().map(|g| g.dir).collect()
    }
}

impl Drop for LockSet<'_> {
    fn drop(&mut self) {
        // reverse acquisition order
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}
