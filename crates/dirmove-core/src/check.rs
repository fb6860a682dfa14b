// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Whole-tree consistency checker

use std::collections::{HashSet, VecDeque};

use blake3::Hasher;
use serde::Serialize;

use crate::types::{EntryKey, ObjectId, ObjectKind};
use crate::volume::Volume;

/// Summary of a consistent tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeReport {
    pub directories: u64,
    pub files: u64,
    /// Hash over every (parent, name, identity, kind) entry
    pub digest: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    #[error("entry {name:?} in {dir} references missing {object}")]
    Dangling {
        dir: ObjectId,
        name: String,
        object: ObjectId,
    },
    #[error("{object} is reachable more than once")]
    MultiplyReachable { object: ObjectId },
    #[error("{object} is unlinked but still referenced from {dir}")]
    UnlinkedReachable { dir: ObjectId, object: ObjectId },
    #[error("record of {object} disagrees with its entry: {detail}")]
    RecordMismatch { object: ObjectId, detail: String },
    #[error("identity index places {object} at {indexed:?}, entry is at {actual}")]
    IndexMismatch {
        object: ObjectId,
        indexed: Option<EntryKey>,
        actual: EntryKey,
    },
    #[error("{dir} has nlink {nlink}, expected {expected}")]
    LinkCount {
        dir: ObjectId,
        nlink: u32,
        expected: u32,
    },
    #[error("{object} is live but unreachable from the root")]
    Orphan { object: ObjectId },
    #[error("store failure while checking {object}: {detail}")]
    Store { object: ObjectId, detail: String },
}

/// Walk the tree from the root and cross-check records, entries, link counts
/// and the identity index
pub fn verify(vol: &Volume) -> Result<TreeReport, Vec<Violation>> {
    let store = vol.store();
    let mut violations = Vec::new();
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    let mut lines = Vec::new();
    let (mut directories, mut files) = (1u64, 0u64);

    let root = store.root();
    visited.insert(root);
    queue.push_back(root);

    while let Some(dir) = queue.pop_front() {
        let entries = match store.list_entries(dir) {
            Ok(entries) => entries,
            Err(e) => {
                violations.push(Violation::Store {
                    object: dir,
                    detail: e.to_string(),
                });
                continue;
            }
        };

        let mut child_dirs = 0u32;
        for (key, payload) in entries {
            let record = match store.object(payload.object) {
                Ok(record) => record,
                Err(_) => {
                    violations.push(Violation::Dangling {
                        dir,
                        name: payload.name,
                        object: payload.object,
                    });
                    continue;
                }
            };
            if !visited.insert(record.id) {
                violations.push(Violation::MultiplyReachable { object: record.id });
                continue;
            }
            if record.unlinked {
                violations.push(Violation::UnlinkedReachable {
                    dir,
                    object: record.id,
                });
            }

            let mut mismatches = Vec::new();
            if record.parent != dir {
                mismatches.push(format!("parent {} != {}", record.parent, dir));
            }
            if record.name != payload.name {
                mismatches.push(format!("name {:?} != {:?}", record.name, payload.name));
            }
            if record.kind != payload.kind {
                mismatches.push(format!("kind {:?} != {:?}", record.kind, payload.kind));
            }
            if record.key != Some(key) {
                mismatches.push(format!("key {:?} != {}", record.key, key));
            }
            if !mismatches.is_empty() {
                violations.push(Violation::RecordMismatch {
                    object: record.id,
                    detail: mismatches.join(", "),
                });
            }

            let indexed = vol.identities().location(record.id);
            if indexed != Some(key) {
                violations.push(Violation::IndexMismatch {
                    object: record.id,
                    indexed,
                    actual: key,
                });
            }

            lines.push((dir, payload.name, record.id, record.kind));
            match record.kind {
                ObjectKind::Directory => {
                    directories += 1;
                    child_dirs += 1;
                    queue.push_back(record.id);
                }
                ObjectKind::File => files += 1,
            }
        }

        match store.object(dir) {
            Ok(record) if record.nlink != 2 + child_dirs => {
                violations.push(Violation::LinkCount {
                    dir,
                    nlink: record.nlink,
                    expected: 2 + child_dirs,
                });
            }
            Ok(_) => {}
            Err(e) => violations.push(Violation::Store {
                object: dir,
                detail: e.to_string(),
            }),
        }
    }

    for record in store.all_objects() {
        if !record.unlinked && !visited.contains(&record.id) {
            violations.push(Violation::Orphan { object: record.id });
        }
    }

    if !violations.is_empty() {
        return Err(violations);
    }

    lines.sort();
    let mut hasher = Hasher::new();
    for (dir, name, id, kind) in &lines {
        hasher.update(format!("{}/{}={}:{:?}\n", dir.0, name, id.0, kind).as_bytes());
    }
    Ok(TreeReport {
        directories,
        files,
        digest: format!("blake3:{}", hasher.finalize().to_hex()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfig;
    use crate::types::Credential;

    fn populated() -> Volume {
        let vol = Volume::new(VolumeConfig::default()).unwrap();
        let cred = Credential::root();
        let a = vol.mkdir(vol.root(), "a", &cred, 0o755).unwrap();
        vol.mkdir(a, "sub", &cred, 0o755).unwrap();
        vol.create(a, "f", &cred, 0o644, 8).unwrap();
        vol
    }

    #[test]
    fn consistent_tree_reports_counts() {
        let vol = populated();
        let report = verify(&vol).unwrap();
        assert_eq!(report.directories, 3);
        assert_eq!(report.files, 1);
        assert!(report.digest.starts_with("blake3:"));
        assert_eq!(verify(&vol).unwrap(), report);
    }

    #[test]
    fn digest_tracks_renames() {
        let vol = populated();
        let before = verify(&vol).unwrap();
        let a = vol.lookup(vol.root(), "a").unwrap().unwrap();
        vol.rename(a, "f", vol.root(), "f", &Credential::root()).unwrap();
        let after = verify(&vol).unwrap();
        assert_ne!(before.digest, after.digest);
        assert_eq!(after.files, 1);
    }

    #[test]
    fn detects_bad_link_count() {
        let vol = populated();
        let mut root = vol.object(vol.root()).unwrap();
        root.nlink = 7;
        vol.store().update_object(&root).unwrap();

        let violations = verify(&vol).unwrap_err();
        assert!(violations
            .iter()
            .any(|v| matches!(v, Violation::LinkCount { nlink: 7, expected: 3, .. })));
    }

    #[test]
    fn detects_stale_identity_index() {
        let vol = populated();
        let a = vol.lookup(vol.root(), "a").unwrap().unwrap();
        vol.identities().remove(a);

        let violations = verify(&vol).unwrap_err();
        assert!(violations.iter().any(|v| matches!(
            v,
            Violation::IndexMismatch { object, indexed: None, .. } if *object == a
        )));
    }
}
