// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Name validation, re-resolution and feasibility/permission checks

use crate::error::{Participant, RenameError, RenameResult, Step};
use crate::permissions::PermissionOracle;
use crate::types::{Action, Credential, ObjectId, ObjectRecord};
use crate::volume::Volume;

pub(crate) fn validate_name(name: &str, max_len: usize) -> RenameResult<()> {
    let reason = if name.is_empty() {
        Some("empty name")
    } else if name == "." || name == ".." {
        Some("reserved name")
    } else if name.contains('/') {
        Some("contains '/'")
    } else if name.contains('\0') {
        Some("contains NUL")
    } else if name.len() > max_len {
        Some("name too long")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(RenameError::InvalidArgument {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

pub(crate) fn lookup(
    vol: &Volume,
    dir: ObjectId,
    name: &str,
    participant: Participant,
) -> RenameResult<Option<ObjectRecord>> {
    vol.store
        .lookup_child(dir, name)
        .map_err(|e| RenameError::from_store(Step::Lookup, participant, e))
}

/// A missing source is an error
pub(crate) fn lookup_source(vol: &Volume, dir: ObjectId, name: &str) -> RenameResult<ObjectRecord> {
    lookup(vol, dir, name, Participant::FromDir)?.ok_or(RenameError::NotFound {
        participant: Participant::FromObject,
    })
}

/// A missing target is fine
pub(crate) fn lookup_target(
    vol: &Volume,
    dir: ObjectId,
    name: &str,
) -> RenameResult<Option<ObjectRecord>> {
    lookup(vol, dir, name, Participant::ToDir)
}

pub(crate) fn check_possible(
    vol: &Volume,
    source: &ObjectRecord,
    target: Option<&ObjectRecord>,
) -> RenameResult<()> {
    let Some(target) = target else {
        return Ok(());
    };
    match (source.is_dir(), target.is_dir()) {
        (true, false) => Err(RenameError::NotADirectory {
            participant: Participant::ToObject,
        }),
        (false, true) => Err(RenameError::IsADirectory {
            participant: Participant::ToObject,
        }),
        (true, true) => {
            let empty = vol.store.is_empty(target.id).map_err(|e| {
                RenameError::from_store(Step::CheckPossible, Participant::ToObject, e)
            })?;
            if empty {
                Ok(())
            } else {
                Err(RenameError::DirectoryNotEmpty)
            }
        }
        (false, false) => Ok(()),
    }
}

/// One evaluator for all four roles; the first denial wins
pub(crate) fn check_permitted(
    oracle: &dyn PermissionOracle,
    cred: &Credential,
    from_dir: &ObjectRecord,
    source: &ObjectRecord,
    to_dir: &ObjectRecord,
    target: Option<&ObjectRecord>,
) -> RenameResult<()> {
    let require = |record: &ObjectRecord, action: Action, participant: Participant| {
        if oracle.check_permission(cred, record.mode, record.owner, action) {
            Ok(())
        } else {
            tracing::debug!(
                object = %record.id,
                %participant,
                %action,
                uid = cred.uid,
                "permission denied"
            );
            Err(RenameError::PermissionDenied {
                participant,
                action,
            })
        }
    };

    require(from_dir, Action::Write, Participant::FromDir)?;
    require(from_dir, Action::Search, Participant::FromDir)?;
    require(
        from_dir,
        Action::Unlink {
            entry_owner: source.owner.uid,
        },
        Participant::FromObject,
    )?;
    // its ".." entry changes
    if source.is_dir() && from_dir.id != to_dir.id {
        require(source, Action::Write, Participant::FromObject)?;
    }

    require(to_dir, Action::Write, Participant::ToDir)?;
    require(to_dir, Action::Search, Participant::ToDir)?;
    if let Some(target) = target {
        require(
            to_dir,
            Action::Unlink {
                entry_owner: target.owner.uid,
            },
            Participant::ToObject,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::MockPermissionOracle;
    use crate::types::{ObjectKind, ObjectTimes, Owner};

    fn record(id: u64, kind: ObjectKind, uid: u32) -> ObjectRecord {
        ObjectRecord {
            id: ObjectId(id),
            kind,
            name: format!("n{id}"),
            parent: ObjectId::ROOT,
            key: None,
            owner: Owner { uid, gid: uid },
            mode: 0o755,
            nlink: 1,
            unlinked: false,
            extent: None,
            times: ObjectTimes::default(),
        }
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in ["", ".", "..", "a/b", "nul\0"] {
            assert!(matches!(
                validate_name(bad, 255),
                Err(RenameError::InvalidArgument { .. })
            ));
        }
        assert!(validate_name(&"x".repeat(9), 8).is_err());
        assert!(validate_name("...", 8).is_ok());
    }

    #[test]
    fn every_role_is_evaluated() {
        let mut oracle = MockPermissionOracle::new();
        // from-dir write+search, from-object unlink, moved dir write,
        // to-dir write+search, to-object unlink
        oracle.expect_check_permission().times(7).returning(|_, _, _, _| true);

        let from = record(2, ObjectKind::Directory, 0);
        let to = record(3, ObjectKind::Directory, 0);
        let source = record(4, ObjectKind::Directory, 1000);
        let target = record(5, ObjectKind::Directory, 2000);
        check_permitted(&oracle, &Credential::new(1000, 1000), &from, &source, &to, Some(&target))
            .unwrap();
    }

    #[test]
    fn target_owner_is_passed_to_unlink_check() {
        let mut oracle = MockPermissionOracle::new();
        oracle
            .expect_check_permission()
            .returning(|_, _, _, action| action != Action::Unlink { entry_owner: 2000 });

        let from = record(2, ObjectKind::Directory, 0);
        let to = record(3, ObjectKind::Directory, 0);
        let source = record(4, ObjectKind::File, 1000);
        let target = record(5, ObjectKind::File, 2000);
        let cred = Credential::new(1000, 1000);
        let err = check_permitted(&oracle, &cred, &from, &source, &to, Some(&target)).unwrap_err();
        assert!(matches!(
            err,
            RenameError::PermissionDenied {
                participant: Participant::ToObject,
                ..
            }
        ));
    }
}
