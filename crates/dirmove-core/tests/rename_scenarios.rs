// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::sync::Arc;

use dirmove_core::*;

fn root_cred() -> Credential {
    Credential::root()
}

fn volume_over(store: Arc<dyn DirectoryStore>) -> Volume {
    Volume::builder(VolumeConfig::default())
        .store(store)
        .build()
        .expect("volume")
}

fn volume() -> Volume {
    Volume::new(VolumeConfig::default()).expect("volume")
}

/// Names resolvable in `dir`, with their identities
fn listing(vol: &Volume, dir: ObjectId) -> Vec<(String, ObjectId)> {
    let mut entries: Vec<_> = vol
        .readdir(dir)
        .unwrap()
        .into_iter()
        .map(|(name, id, _)| (name, id))
        .collect();
    entries.sort();
    entries
}

#[test]
fn test_scenario_a_move_file_between_directories() {
    let vol = volume();
    let cred = root_cred();
    let a = vol.mkdir(vol.root(), "a", &cred, 0o755).unwrap();
    let b = vol.mkdir(vol.root(), "b", &cred, 0o755).unwrap();
    let f = vol.create(a, "f", &cred, 0o644, 128).unwrap();

    vol.rename(a, "f", b, "g", &cred).unwrap();

    assert_eq!(vol.lookup(a, "f").unwrap(), None);
    assert_eq!(vol.lookup(b, "g").unwrap(), Some(f));
    let record = vol.object(f).unwrap();
    assert_eq!(record.parent, b);
    assert_eq!(record.name, "g");
    assert_eq!(vol.identities().location(f), record.key);
    verify(&vol).unwrap();
}

#[test]
fn test_scenario_b_move_into_own_descendant_is_a_cycle() {
    let vol = volume();
    let cred = root_cred();
    let a = vol.mkdir(vol.root(), "a", &cred, 0o755).unwrap();
    let sub = vol.mkdir(a, "sub", &cred, 0o755).unwrap();
    let before = verify(&vol).unwrap();

    let err = vol.rename(vol.root(), "a", sub, "x", &cred).unwrap_err();

    assert!(matches!(
        err,
        RenameError::WouldCreateCycle { moved, destination } if moved == a && destination == sub
    ));
    assert_eq!(err.to_errno(), libc::EINVAL);
    assert_eq!(verify(&vol).unwrap(), before);
}

#[test]
fn test_scenario_c_rename_onto_itself_writes_nothing() {
    let store = Arc::new(FaultyStore::new(Arc::new(MemoryStore::default())));
    let vol = volume_over(Arc::clone(&store) as Arc<dyn DirectoryStore>);
    let cred = root_cred();
    let a = vol.mkdir(vol.root(), "a", &cred, 0o755).unwrap();
    let f = vol.create(a, "f", &cred, 0o644, 1).unwrap();
    store.reset_counters();

    vol.rename(a, "f", a, "f", &cred).unwrap();

    assert_eq!(store.storage_writes(), 0);
    assert_eq!(store.call_count(FaultOp::Allocate), 0);
    assert_eq!(vol.lookup(a, "f").unwrap(), Some(f));
}

#[test]
fn test_scenario_c_missing_source_still_reported() {
    let vol = volume();
    let a = vol.mkdir(vol.root(), "a", &root_cred(), 0o755).unwrap();
    let err = vol.rename(a, "ghost", a, "ghost", &root_cred()).unwrap_err();
    assert!(matches!(
        err,
        RenameError::NotFound {
            participant: Participant::FromObject
        }
    ));
}

#[test]
fn test_scenario_d_replace_existing_file() {
    let store = Arc::new(MemoryStore::default());
    let vol = volume_over(Arc::clone(&store) as Arc<dyn DirectoryStore>);
    let cred = root_cred();
    let a = vol.mkdir(vol.root(), "a", &cred, 0o755).unwrap();
    let b = vol.mkdir(vol.root(), "b", &cred, 0o755).unwrap();
    let f = vol.create(a, "f", &cred, 0o644, 100).unwrap();
    let g = vol.create(b, "g", &cred, 0o644, 50).unwrap();
    assert_eq!(store.bytes_in_use(), 150);

    vol.rename(a, "f", b, "g", &cred).unwrap();

    assert_eq!(vol.lookup(b, "g").unwrap(), Some(f));
    assert_eq!(vol.lookup(a, "f").unwrap(), None);
    let replaced = vol.object(g).unwrap();
    assert_eq!(replaced.nlink, 0);
    assert!(replaced.unlinked);
    assert_eq!(vol.identities().location(g), None);
    assert_eq!(store.bytes_in_use(), 100);
    verify(&vol).unwrap();
}

#[test]
fn test_cycle_rejected_for_every_descendant() {
    let vol = volume();
    let cred = root_cred();
    let d = vol.mkdir(vol.root(), "d", &cred, 0o755).unwrap();
    let e1 = vol.mkdir(d, "e1", &cred, 0o755).unwrap();
    let e2 = vol.mkdir(e1, "e2", &cred, 0o755).unwrap();
    let e3 = vol.mkdir(e2, "e3", &cred, 0o755).unwrap();
    let before = verify(&vol).unwrap();

    for dest in [d, e1, e2, e3] {
        let err = vol.rename(vol.root(), "d", dest, "moved", &cred).unwrap_err();
        assert!(
            matches!(err, RenameError::WouldCreateCycle { .. }),
            "moving d under {dest}: {err:?}"
        );
    }
    assert_eq!(verify(&vol).unwrap(), before);
}

#[test]
fn test_move_directory_down_an_unrelated_branch() {
    let vol = volume();
    let cred = root_cred();
    let a = vol.mkdir(vol.root(), "a", &cred, 0o755).unwrap();
    let sub = vol.mkdir(a, "sub", &cred, 0o755).unwrap();
    let b = vol.mkdir(a, "b", &cred, 0o755).unwrap();
    vol.create(b, "inside", &cred, 0o644, 1).unwrap();

    // a is an ancestor of sub, but b is not on the path to sub
    vol.rename(a, "b", sub, "b", &cred).unwrap();

    assert_eq!(vol.object(b).unwrap().parent, sub);
    assert_eq!(vol.object(a).unwrap().nlink, 3);
    assert_eq!(vol.object(sub).unwrap().nlink, 3);
    assert!(vol.lookup(b, "inside").unwrap().is_some());
    verify(&vol).unwrap();
}

#[test]
fn test_move_directory_up_to_ancestor() {
    let vol = volume();
    let cred = root_cred();
    let a = vol.mkdir(vol.root(), "a", &cred, 0o755).unwrap();
    let sub = vol.mkdir(a, "sub", &cred, 0o755).unwrap();
    let deep = vol.mkdir(sub, "deep", &cred, 0o755).unwrap();

    vol.rename(sub, "deep", vol.root(), "deep", &cred).unwrap();

    assert_eq!(vol.lookup(vol.root(), "deep").unwrap(), Some(deep));
    assert_eq!(vol.object(sub).unwrap().nlink, 2);
    assert_eq!(vol.object(vol.root()).unwrap().nlink, 4);
    verify(&vol).unwrap();
}

#[test]
fn test_same_directory_rename_keeps_link_counts() {
    let vol = volume();
    let cred = root_cred();
    let a = vol.mkdir(vol.root(), "a", &cred, 0o755).unwrap();
    let sub = vol.mkdir(a, "sub", &cred, 0o755).unwrap();

    vol.rename(a, "sub", a, "renamed", &cred).unwrap();

    assert_eq!(listing(&vol, a), vec![("renamed".to_string(), sub)]);
    assert_eq!(vol.object(a).unwrap().nlink, 3);
    verify(&vol).unwrap();
}

#[test]
fn test_replace_empty_directory() {
    let vol = volume();
    let cred = root_cred();
    let src = vol.mkdir(vol.root(), "src", &cred, 0o755).unwrap();
    let dst = vol.mkdir(vol.root(), "dst", &cred, 0o755).unwrap();

    vol.rename(vol.root(), "src", vol.root(), "dst", &cred).unwrap();

    assert_eq!(vol.lookup(vol.root(), "dst").unwrap(), Some(src));
    assert!(vol.object(dst).unwrap().unlinked);
    assert_eq!(vol.object(vol.root()).unwrap().nlink, 3);
    verify(&vol).unwrap();
}

#[test]
fn test_overwrite_nonempty_directory_fails() {
    let vol = volume();
    let cred = root_cred();
    let src = vol.mkdir(vol.root(), "src", &cred, 0o755).unwrap();
    let dst = vol.mkdir(vol.root(), "dst", &cred, 0o755).unwrap();
    vol.create(dst, "keep", &cred, 0o644, 1).unwrap();
    let before = verify(&vol).unwrap();

    let err = vol.rename(vol.root(), "src", vol.root(), "dst", &cred).unwrap_err();

    assert!(matches!(err, RenameError::DirectoryNotEmpty));
    assert_eq!(err.to_errno(), libc::ENOTEMPTY);
    assert_eq!(vol.lookup(vol.root(), "src").unwrap(), Some(src));
    assert_eq!(verify(&vol).unwrap(), before);
}

#[test]
fn test_type_mismatch_is_reported_per_direction() {
    let vol = volume();
    let cred = root_cred();
    vol.mkdir(vol.root(), "dir", &cred, 0o755).unwrap();
    vol.create(vol.root(), "file", &cred, 0o644, 1).unwrap();

    let err = vol.rename(vol.root(), "dir", vol.root(), "file", &cred).unwrap_err();
    assert!(matches!(err, RenameError::NotADirectory { participant: Participant::ToObject }));

    let err = vol.rename(vol.root(), "file", vol.root(), "dir", &cred).unwrap_err();
    assert!(matches!(err, RenameError::IsADirectory { participant: Participant::ToObject }));
    assert_eq!(err.to_errno(), libc::EISDIR);
}

#[test]
fn test_invalid_names_are_rejected_before_locking() {
    let vol = volume();
    let cred = root_cred();
    vol.create(vol.root(), "f", &cred, 0o644, 1).unwrap();

    for bad in ["", ".", "..", "x/y"] {
        let err = vol.rename(vol.root(), "f", vol.root(), bad, &cred).unwrap_err();
        assert!(matches!(err, RenameError::InvalidArgument { .. }), "{bad:?}");
    }
    let long = "n".repeat(256);
    assert!(matches!(
        vol.rename(vol.root(), "f", vol.root(), &long, &cred),
        Err(RenameError::InvalidArgument { .. })
    ));
}

#[test]
fn test_non_directory_parent_is_rejected() {
    let vol = volume();
    let cred = root_cred();
    let f = vol.create(vol.root(), "f", &cred, 0o644, 1).unwrap();
    vol.create(vol.root(), "g", &cred, 0o644, 1).unwrap();

    let err = vol.rename(vol.root(), "g", f, "g", &cred).unwrap_err();
    assert!(matches!(err, RenameError::NotADirectory { participant: Participant::ToDir }));
}

#[test]
fn test_sticky_directory_protects_other_users_entries() {
    let vol = volume();
    let root = root_cred();
    let alice = Credential::new(1000, 1000);
    let bob = Credential::new(2000, 2000);

    let tmp = vol.mkdir(vol.root(), "tmp", &root, 0o1777).unwrap();
    vol.create(tmp, "alice.txt", &alice, 0o644, 1).unwrap();
    vol.create(tmp, "bob.txt", &bob, 0o644, 1).unwrap();

    let err = vol.rename(tmp, "alice.txt", tmp, "stolen", &bob).unwrap_err();
    assert!(matches!(
        err,
        RenameError::PermissionDenied {
            participant: Participant::FromObject,
            ..
        }
    ));
    assert_eq!(err.to_errno(), libc::EACCES);

    let err = vol.rename(tmp, "bob.txt", tmp, "alice.txt", &bob).unwrap_err();
    assert!(matches!(
        err,
        RenameError::PermissionDenied {
            participant: Participant::ToObject,
            ..
        }
    ));

    vol.rename(tmp, "bob.txt", tmp, "bob2.txt", &bob).unwrap();
}

#[test]
fn test_read_only_destination_denies_write() {
    let vol = volume();
    let root = root_cred();
    let user = Credential::new(1000, 1000);
    let home = vol.mkdir(vol.root(), "home", &root, 0o777).unwrap();
    let locked = vol.mkdir(vol.root(), "locked", &root, 0o555).unwrap();
    vol.create(home, "f", &user, 0o644, 1).unwrap();

    let err = vol.rename(home, "f", locked, "f", &user).unwrap_err();
    assert!(matches!(
        err,
        RenameError::PermissionDenied {
            participant: Participant::ToDir,
            action: Action::Write
        }
    ));
    assert!(vol.lookup(home, "f").unwrap().is_some());
}

#[test]
fn test_permissive_config_skips_checks() {
    let vol = Volume::new(VolumeConfig::permissive()).unwrap();
    let root = root_cred();
    let locked = vol.mkdir(vol.root(), "locked", &root, 0o500).unwrap();
    vol.create(vol.root(), "f", &root, 0o644, 1).unwrap();

    vol.rename(vol.root(), "f", locked, "f", &Credential::new(42, 42)).unwrap();
}

#[test]
fn test_full_destination_reports_no_space() {
    let mut config = VolumeConfig::default();
    config.limits.max_entries_per_dir = 2;
    let vol = Volume::new(config).unwrap();
    let cred = root_cred();
    let a = vol.mkdir(vol.root(), "a", &cred, 0o755).unwrap();
    let b = vol.mkdir(vol.root(), "b", &cred, 0o755).unwrap();
    vol.create(a, "f", &cred, 0o644, 1).unwrap();
    vol.create(b, "x", &cred, 0o644, 1).unwrap();
    vol.create(b, "y", &cred, 0o644, 1).unwrap();
    let before = verify(&vol).unwrap();

    let err = vol.rename(a, "f", b, "z", &cred).unwrap_err();

    assert!(matches!(err, RenameError::NoSpace { participant: Participant::ToDir }));
    assert_eq!(verify(&vol).unwrap(), before);
}

#[test]
fn test_walk_depth_limit_is_not_fatal() {
    let mut config = VolumeConfig::default();
    config.limits.max_walk_depth = 8;
    let vol = Volume::new(config).unwrap();
    let cred = root_cred();
    let side = vol.mkdir(vol.root(), "side", &cred, 0o755).unwrap();
    let f = vol.create(side, "f", &cred, 0o644, 4).unwrap();
    let g = vol.create(side, "g", &cred, 0o644, 4).unwrap();
    let mut deepest = vol.root();
    for i in 0..8 {
        deepest = vol.mkdir(deepest, &format!("l{i}"), &cred, 0o755).unwrap();
    }

    // eight levels fit the walk exactly
    vol.rename(side, "f", deepest, "f", &cred).unwrap();
    assert_eq!(vol.lookup(deepest, "f").unwrap(), Some(f));

    let too_deep = vol.mkdir(deepest, "l8", &cred, 0o755).unwrap();
    let err = vol.rename(side, "g", too_deep, "g", &cred).unwrap_err();
    assert!(
        matches!(err, RenameError::TooDeep { destination, limit: 8 } if destination == too_deep),
        "{err:?}"
    );
    assert!(!err.is_fatal());
    assert_eq!(err.to_errno(), libc::ELOOP);
    assert_eq!(vol.lookup(side, "g").unwrap(), Some(g));
    verify(&vol).unwrap();
}
