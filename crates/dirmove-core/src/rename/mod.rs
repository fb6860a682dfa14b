// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Rename orchestration
//!
//! A rename runs in three phases:
//!
//! 1. [`genealogy::analyze`] walks up from the destination holding one lock at
//!    a time and finds the child of the source directory on that path, if any.
//!    Directory moves between parents hold [`TOPOLOGY_LOCK`] from here to the
//!    end, so no other such move can change the ancestry it concluded.
//! 2. The participating directories are locked together in increasing
//!    [`ObjectId`] order, re-validated, and run through [`gate`].
//! 3. [`mutator::Mutator`] relocates the entry, undoing every step it took if
//!    a later one fails.
//!
//! Name-cache invalidation and events happen after all locks are released.

pub(crate) mod gate;
pub(crate) mod genealogy;
pub(crate) mod mutator;

use tracing::{debug, error, info, warn};

use crate::error::{Participant, RenameError, RenameResult, RetryReason, Step};
use crate::locks::TOPOLOGY_LOCK;
use crate::types::{Credential, EventKind, ObjectId};
use crate::volume::Volume;

use self::genealogy::IntermediateNode;
use self::mutator::{Committed, Mutator};

/// One rename request, consumed by a single call to [`execute`]
#[derive(Debug, Clone, Copy)]
pub(crate) struct RenameOperation<'a> {
    pub from_dir: ObjectId,
    pub from_name: &'a str,
    pub to_dir: ObjectId,
    pub to_name: &'a str,
    pub cred: &'a Credential,
}

impl RenameOperation<'_> {
    fn is_same_entry(&self) -> bool {
        self.from_dir == self.to_dir && self.from_name == self.to_name
    }
}

enum Outcome {
    Unchanged,
    Committed(Committed),
}

pub(crate) fn execute(vol: &Volume, op: &RenameOperation<'_>) -> RenameResult<()> {
    debug!(
        from_dir = %op.from_dir,
        from_name = op.from_name,
        to_dir = %op.to_dir,
        to_name = op.to_name,
        uid = op.cred.uid,
        "rename requested"
    );

    match run(vol, op) {
        Ok(Outcome::Unchanged) => Ok(()),
        Ok(Outcome::Committed(committed)) => {
            vol.names.invalidate(op.from_dir, op.from_name);
            vol.names.invalidate(op.to_dir, op.to_name);
            info!(
                object = %committed.object,
                new_key = %committed.new_key,
                from_dir = %op.from_dir,
                to_dir = %op.to_dir,
                replaced = ?committed.replaced,
                "rename committed"
            );
            vol.emit_event(EventKind::Renamed {
                object: committed.object,
                from_dir: op.from_dir,
                from_name: op.from_name.to_string(),
                to_dir: op.to_dir,
                to_name: op.to_name.to_string(),
                replaced: committed.replaced,
            });
            Ok(())
        }
        Err(err) => {
            if err.is_fatal() {
                error!(
                    from_dir = %op.from_dir,
                    to_dir = %op.to_dir,
                    error = %err,
                    "rename left inconsistent state"
                );
            } else {
                debug!(from_dir = %op.from_dir, to_dir = %op.to_dir, error = %err, "rename failed");
            }
            Err(err)
        }
    }
}

fn run(vol: &Volume, op: &RenameOperation<'_>) -> RenameResult<Outcome> {
    let max_name_len = vol.config.limits.max_name_len;
    gate::validate_name(op.from_name, max_name_len)?;
    gate::validate_name(op.to_name, max_name_len)?;

    if op.is_same_entry() {
        let _guard = vol.locks.lock(op.from_dir)?;
        vol.live_dir(op.from_dir, Step::Validate, Participant::FromDir)?;
        gate::lookup_source(vol, op.from_dir, op.from_name)?;
        return Ok(Outcome::Unchanged);
    }

    vol.live_dir(op.from_dir, Step::Validate, Participant::FromDir)?;
    vol.live_dir(op.to_dir, Step::Validate, Participant::ToDir)?;

    let crosses = op.from_dir != op.to_dir;
    let serialize = crosses && vol.config.locking.serialize_directory_moves;
    let peeked_source = gate::lookup_source(vol, op.from_dir, op.from_name)?;
    let topology = if serialize && peeked_source.is_dir() {
        Some(vol.locks.lock(TOPOLOGY_LOCK)?)
    } else {
        None
    };

    let intermediate = if crosses {
        genealogy::analyze(vol, op.from_dir, op.to_dir)?
    } else {
        None
    };
    vol.emit_event(EventKind::GenealogyResolved {
        from_dir: op.from_dir,
        to_dir: op.to_dir,
        intermediate: intermediate.map(|node| node.id),
    });

    // Directories among the participants are locked too; peek to find them
    let mut lock_set = vec![op.from_dir, op.to_dir];
    if peeked_source.is_dir() {
        lock_set.push(peeked_source.id);
    }
    if let Some(peeked_target) = gate::lookup_target(vol, op.to_dir, op.to_name)? {
        if peeked_target.is_dir() {
            lock_set.push(peeked_target.id);
        }
    }

    let locks = vol.locks.lock_ordered(&lock_set)?;
    debug!(locked = ?locks.dirs(), "destructive phase locks held");

    let from = vol.live_dir(op.from_dir, Step::Validate, Participant::FromDir)?;
    let to = vol.live_dir(op.to_dir, Step::Validate, Participant::ToDir)?;
    if let Some(node) = intermediate {
        revalidate_intermediate(vol, node, op.from_dir)?;
    }

    let source = gate::lookup_source(vol, op.from_dir, op.from_name)?;
    let target = gate::lookup_target(vol, op.to_dir, op.to_name)?;
    for record in std::iter::once(&source).chain(target.as_ref()) {
        if record.is_dir() && !locks.contains(record.id) {
            debug!(object = %record.id, "participant changed while unlocked");
            return Err(RenameError::Retryable(RetryReason::TopologyChanged));
        }
    }
    if serialize && source.is_dir() && topology.is_none() {
        return Err(RenameError::Retryable(RetryReason::TopologyChanged));
    }

    if source.id == op.to_dir || intermediate.is_some_and(|node| node.id == source.id) {
        return Err(RenameError::WouldCreateCycle {
            moved: source.id,
            destination: op.to_dir,
        });
    }
    if target.as_ref().is_some_and(|t| t.id == source.id) {
        return Ok(Outcome::Unchanged);
    }

    gate::check_possible(vol, &source, target.as_ref())?;
    gate::check_permitted(
        vol.permissions.as_ref(),
        op.cred,
        &from,
        &source,
        &to,
        target.as_ref(),
    )?;

    let source_id = source.id;
    let result = Mutator::new(vol, op, source, target).run();
    drop(locks);
    drop(topology);

    match result {
        Ok(committed) => Ok(Outcome::Committed(committed)),
        Err(err) => {
            if !err.is_fatal() {
                warn!(object = %source_id, error = %err, "rename rolled back");
            }
            vol.emit_event(EventKind::RolledBack {
                object: source_id,
                error: err.to_string(),
            });
            Err(err)
        }
    }
}

/// The intermediate node was only referenced across the unlocked gap
fn revalidate_intermediate(
    vol: &Volume,
    node: IntermediateNode,
    from_dir: ObjectId,
) -> RenameResult<()> {
    let participant = Participant::Ancestor(node.id);
    let record = vol
        .store
        .object(node.id)
        .map_err(|e| RenameError::from_store(Step::Genealogy, participant, e))?;
    if record.unlinked {
        return Err(RenameError::NotFound { participant });
    }
    if record.parent != from_dir {
        debug!(object = %node.id, parent = %record.parent, "intermediate node moved");
        return Err(RenameError::Retryable(RetryReason::TopologyChanged));
    }
    Ok(())
}
