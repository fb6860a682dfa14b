// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Entry relocation with step-wise rollback
//!
//! Every forward step that touches storage pushes its inverse onto an undo
//! log. A failed step replays the log newest-first; if an inverse fails too
//! the error is escalated to [`RenameError::Inconsistent`].

use tracing::{debug, error};

use super::RenameOperation;
use crate::error::{Participant, RenameError, RenameResult, Step, StoreError};
use crate::types::{current_timestamp, EntryKey, ObjectId, ObjectRecord, Slot};
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MutatorState {
    Idle,
    TargetRemoved,
    NameAssigned,
    LocationAssigned,
    WrittenNew,
    Committed,
    RolledBack,
}

/// Inverse of a completed forward step
#[derive(Debug, Clone)]
enum Undo {
    /// Write the removed target back into its original slot
    ReactivateTarget { record: ObjectRecord, key: EntryKey },
    /// Put the pre-rename snapshot of the source back
    RestoreSource { backup: ObjectRecord },
    RemoveNewEntry { key: EntryKey },
}

impl Undo {
    fn step(&self) -> Step {
        match self {
            Undo::ReactivateTarget { .. } => Step::ReactivateTarget,
            Undo::RestoreSource { .. } => Step::RestoreSource,
            Undo::RemoveNewEntry { .. } => Step::RemoveNewEntry,
        }
    }
}

/// Result of a committed mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Committed {
    pub object: ObjectId,
    pub new_key: EntryKey,
    pub replaced: Option<ObjectId>,
}

pub(crate) struct Mutator<'v, 'op> {
    vol: &'v Volume,
    op: &'op RenameOperation<'op>,
    source: ObjectRecord,
    target: Option<ObjectRecord>,
    state: MutatorState,
    undo: Vec<Undo>,
    slot: Option<Slot>,
    new_key: Option<EntryKey>,
}

impl<'v, 'op> Mutator<'v, 'op> {
    /// Callers hold the locks of every participating directory
    pub(crate) fn new(
        vol: &'v Volume,
        op: &'op RenameOperation<'op>,
        source: ObjectRecord,
        target: Option<ObjectRecord>,
    ) -> Self {
        Self {
            vol,
            op,
            source,
            target,
            state: MutatorState::Idle,
            undo: Vec::new(),
            slot: None,
            new_key: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> MutatorState {
        self.state
    }

    pub(crate) fn run(mut self) -> RenameResult<Committed> {
        if let Err(err) = self.forward() {
            return Err(self.rollback(err));
        }
        self.commit()
    }

    fn forward(&mut self) -> RenameResult<()> {
        loop {
            let next = match self.state {
                MutatorState::Idle => self.remove_target()?,
                MutatorState::TargetRemoved => self.assign_name()?,
                MutatorState::NameAssigned => self.assign_location()?,
                MutatorState::LocationAssigned => self.write_new()?,
                MutatorState::WrittenNew => {
                    self.remove_old()?;
                    return Ok(());
                }
                MutatorState::Committed | MutatorState::RolledBack => return Ok(()),
            };
            debug!(object = %self.source.id, from = ?self.state, to = ?next, "mutator step");
            self.state = next;
        }
    }

    fn remove_target(&mut self) -> RenameResult<MutatorState> {
        let Some(target) = &self.target else {
            return Ok(MutatorState::TargetRemoved);
        };
        let key = linked_key(target, Participant::ToObject)?;
        self.vol
            .store
            .remove_entry(self.op.to_dir, key.slot)
            .map_err(|e| RenameError::from_store(Step::RemoveTarget, Participant::ToObject, e))?;
        self.vol.identities.remove(target.id);
        self.undo.push(Undo::ReactivateTarget {
            record: target.clone(),
            key,
        });
        Ok(MutatorState::TargetRemoved)
    }

    fn assign_name(&mut self) -> RenameResult<MutatorState> {
        let backup = self.source.clone();
        let mut renamed = self.source.clone();
        renamed.name = self.op.to_name.to_string();
        self.vol
            .store
            .update_object(&renamed)
            .map_err(|e| RenameError::from_store(Step::AssignName, Participant::FromObject, e))?;
        self.undo.push(Undo::RestoreSource { backup });
        self.source = renamed;
        Ok(MutatorState::NameAssigned)
    }

    fn assign_location(&mut self) -> RenameResult<MutatorState> {
        let slot = self
            .vol
            .store
            .allocate_entry(self.op.to_dir)
            .map_err(|e| RenameError::from_store(Step::AssignLocation, Participant::ToDir, e))?;
        self.slot = Some(slot);
        Ok(MutatorState::LocationAssigned)
    }

    fn write_new(&mut self) -> RenameResult<MutatorState> {
        let slot = self.slot.ok_or_else(|| {
            RenameError::corrupt(Step::WriteNew, "no slot assigned before write")
        })?;
        let key = self
            .vol
            .store
            .write_entry(self.op.to_dir, slot, &self.source.payload())
            .map_err(|e| RenameError::from_store(Step::WriteNew, Participant::ToDir, e))?;
        self.undo.push(Undo::RemoveNewEntry { key });
        self.new_key = Some(key);
        Ok(MutatorState::WrittenNew)
    }

    fn remove_old(&mut self) -> RenameResult<()> {
        let old = linked_key(&self.source, Participant::FromObject)?;
        self.vol
            .store
            .remove_entry(self.op.from_dir, old.slot)
            .map_err(|e| RenameError::from_store(Step::RemoveOld, Participant::FromDir, e))
    }

    fn rollback(&mut self, err: RenameError) -> RenameError {
        debug!(object = %self.source.id, state = ?self.state, error = %err, "rolling back");
        self.state = MutatorState::RolledBack;
        while let Some(undo) = self.undo.pop() {
            let step = undo.step();
            if let Err(failure) = self.apply_undo(undo) {
                error!(object = %self.source.id, %step, error = %failure, "rollback step failed");
                return RenameError::inconsistent(step, err, failure.to_string());
            }
        }
        err
    }

    fn apply_undo(&self, undo: Undo) -> Result<(), StoreError> {
        let store = &self.vol.store;
        match undo {
            Undo::RemoveNewEntry { key } => store.remove_entry(key.parent, key.slot),
            Undo::RestoreSource { backup } => store.update_object(&backup),
            Undo::ReactivateTarget { mut record, key } => {
                let new_key = store.write_entry(key.parent, key.slot, &record.payload())?;
                record.key = Some(new_key);
                store.update_object(&record)?;
                self.vol.identities.insert(record.id, new_key);
                Ok(())
            }
        }
    }

    /// The old entry is gone; in-core bookkeeping can no longer be undone
    fn commit(mut self) -> RenameResult<Committed> {
        let vol = self.vol;
        let store = &vol.store;
        let fail = |e: StoreError| RenameError::corrupt(Step::Commit, e.to_string());
        let new_key = self
            .new_key
            .ok_or_else(|| RenameError::corrupt(Step::Commit, "no new entry recorded"))?;
        let old_key = linked_key(&self.source, Participant::FromObject)?;
        let now = current_timestamp();

        if !vol.identities.rekey(self.source.id, old_key, new_key) {
            vol.identities.insert(self.source.id, new_key);
        }

        let mut moved = store.object(self.source.id).map_err(fail)?;
        moved.name = self.op.to_name.to_string();
        moved.parent = self.op.to_dir;
        moved.key = Some(new_key);
        moved.times.ctime = now;
        store.update_object(&moved).map_err(fail)?;

        let crosses = self.op.from_dir != self.op.to_dir;
        let mut from = store.object(self.op.from_dir).map_err(fail)?;
        if moved.is_dir() && crosses {
            from.nlink = from.nlink.saturating_sub(1);
        }
        from.times.mtime = now;
        from.times.ctime = now;
        store.update_object(&from).map_err(fail)?;

        let replaced_dir = self.target.as_ref().is_some_and(|t| t.is_dir());
        let mut to = store.object(self.op.to_dir).map_err(fail)?;
        if moved.is_dir() && crosses {
            to.nlink += 1;
        }
        if replaced_dir {
            to.nlink = to.nlink.saturating_sub(1);
        }
        to.times.mtime = now;
        to.times.ctime = now;
        store.update_object(&to).map_err(fail)?;

        let replaced = match self.target.take() {
            Some(target) => {
                let mut target = store.object(target.id).map_err(fail)?;
                target.unlinked = true;
                target.nlink = 0;
                target.key = None;
                target.times.ctime = now;
                store.update_object(&target).map_err(fail)?;
                store.release_storage(target.id).map_err(fail)?;
                Some(target.id)
            }
            None => None,
        };

        self.undo.clear();
        self.state = MutatorState::Committed;
        debug!(object = %moved.id, new_key = %new_key, ?replaced, "mutation committed");
        Ok(Committed {
            object: moved.id,
            new_key,
            replaced,
        })
    }
}

fn linked_key(record: &ObjectRecord, participant: Participant) -> RenameResult<EntryKey> {
    record.key.ok_or_else(|| {
        RenameError::corrupt(
            Step::Lookup,
            format!("{} ({}) is linked without a key", record.id, participant),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::fault::{FaultErrno, FaultOp, FaultPolicy, FaultRule, FaultyStore};
    use crate::storage::{DirectoryStore, MemoryStore};
    use crate::types::Credential;
    use std::sync::Arc;

    struct Fixture {
        vol: Volume,
        store: Arc<FaultyStore>,
        a: ObjectId,
        b: ObjectId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::default())));
        let vol = Volume::builder(VolumeConfig::default())
            .store(Arc::clone(&store) as Arc<dyn DirectoryStore>)
            .build()
            .unwrap();
        let cred = Credential::root();
        let a = vol.mkdir(vol.root(), "a", &cred, 0o755).unwrap();
        let b = vol.mkdir(vol.root(), "b", &cred, 0o755).unwrap();
        vol.create(a, "f", &cred, 0o644, 16).unwrap();
        vol.create(b, "g", &cred, 0o644, 16).unwrap();
        Fixture { vol, store, a, b }
    }

    fn mutate(fx: &Fixture, to_name: &str) -> (RenameResult<Committed>, MutatorState) {
        let cred = Credential::root();
        let op = RenameOperation {
            from_dir: fx.a,
            from_name: "f",
            to_dir: fx.b,
            to_name,
            cred: &cred,
        };
        let source = fx.vol.store.lookup_child(fx.a, "f").unwrap().unwrap();
        let target = fx.vol.store.lookup_child(fx.b, to_name).unwrap();
        let mut mutator = Mutator::new(&fx.vol, &op, source, target);
        match mutator.forward() {
            Ok(()) => (mutator.commit(), MutatorState::Committed),
            Err(err) => {
                let err = mutator.rollback(err);
                (Err(err), mutator.state())
            }
        }
    }

    #[test]
    fn walks_every_state_to_commit() {
        let fx = fixture();
        let (result, state) = mutate(&fx, "g");
        let committed = result.unwrap();
        assert_eq!(state, MutatorState::Committed);
        assert!(committed.replaced.is_some());
        assert_eq!(
            fx.vol.store.lookup_child(fx.b, "g").unwrap().unwrap().id,
            committed.object
        );
        assert_eq!(fx.vol.identities.location(committed.object), Some(committed.new_key));
    }

    #[test]
    fn write_failure_reactivates_target() {
        let fx = fixture();
        let target = fx.vol.store.lookup_child(fx.b, "g").unwrap().unwrap();
        fx.store.injector().set_policy(FaultPolicy::with_rules(vec![
            FaultRule::new(FaultOp::WriteEntry, FaultErrno::Eio).times(1),
        ]));

        let (result, state) = mutate(&fx, "g");
        assert!(matches!(
            result,
            Err(RenameError::Io {
                step: Step::WriteNew,
                ..
            })
        ));
        assert_eq!(state, MutatorState::RolledBack);

        let back = fx.vol.store.lookup_child(fx.b, "g").unwrap().unwrap();
        assert_eq!(back.id, target.id);
        assert_eq!(back.nlink, 1);
        assert_eq!(fx.vol.identities.location(target.id), back.key);
        assert_eq!(fx.vol.store.lookup_child(fx.a, "f").unwrap().unwrap().name, "f");
    }

    #[test]
    fn failed_reactivation_is_inconsistent() {
        let fx = fixture();
        fx.store.injector().set_policy(FaultPolicy::with_rules(vec![
            FaultRule::new(FaultOp::WriteEntry, FaultErrno::Eio).times(2),
        ]));

        let (result, _) = mutate(&fx, "g");
        match result {
            Err(RenameError::Inconsistent { step, original, .. }) => {
                assert_eq!(step, Step::ReactivateTarget);
                assert!(matches!(
                    original.as_deref(),
                    Some(RenameError::Io {
                        step: Step::WriteNew,
                        ..
                    })
                ));
            }
            other => panic!("expected inconsistent, got {other:?}"),
        }
    }
}
