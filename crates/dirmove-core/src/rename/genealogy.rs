// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Ancestor analysis between the source and destination directories

use std::collections::HashSet;

use tracing::debug;

use crate::error::{Participant, RenameError, RenameResult, Step};
use crate::types::ObjectId;
use crate::volume::Volume;

/// Child of the source directory on the path up from the destination.
///
/// Only a reference: no lock is held on it once [`analyze`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IntermediateNode {
    pub id: ObjectId,
}

/// Walk from `to_dir` toward the root.
///
/// Returns the intermediate node when `from_dir` is an ancestor of `to_dir`
/// (or `to_dir` itself is a child of `from_dir`), `None` when the walk reaches
/// the root first. At most `limits.max_walk_depth` directories above `to_dir`
/// are visited; a deeper tree fails with `TooDeep`, a parent chain that comes
/// back to a visited node with `Inconsistent`.
pub(crate) fn analyze(
    vol: &Volume,
    from_dir: ObjectId,
    to_dir: ObjectId,
) -> RenameResult<Option<IntermediateNode>> {
    debug_assert_ne!(from_dir, to_dir);
    let max_depth = vol.config.limits.max_walk_depth;

    let mut visited = HashSet::new();
    let mut current = to_dir;
    for depth in 0..=max_depth {
        if !visited.insert(current) {
            return Err(RenameError::corrupt(
                Step::Genealogy,
                format!("parent chain above {} loops back to {}", to_dir, current),
            ));
        }
        let participant = if current == to_dir {
            Participant::ToDir
        } else {
            Participant::Ancestor(current)
        };

        // one ancestor lock at a time; dropped at the end of the iteration
        let _guard = vol.locks.lock(current)?;
        let record = vol
            .store
            .object(current)
            .map_err(|e| RenameError::from_store(Step::Genealogy, participant, e))?;
        if record.unlinked {
            debug!(object = %current, depth, "ancestor removed during walk");
            return Err(RenameError::NotFound { participant });
        }
        if record.is_root() {
            debug!(from_dir = %from_dir, to_dir = %to_dir, depth, "no ancestry relation");
            return Ok(None);
        }
        if record.parent == from_dir {
            debug!(
                from_dir = %from_dir,
                to_dir = %to_dir,
                intermediate = %current,
                depth,
                "source is an ancestor of destination"
            );
            return Ok(Some(IntermediateNode { id: current }));
        }
        current = record.parent;
    }

    debug!(to_dir = %to_dir, max_depth, "walk depth exceeded");
    Err(RenameError::TooDeep {
        destination: to_dir,
        limit: max_depth,
    })
}
