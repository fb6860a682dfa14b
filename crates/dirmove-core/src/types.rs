// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for dirmove

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Stable, location-independent object identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// The filesystem root. The root is its own parent.
    pub const ROOT: ObjectId = ObjectId(1);

    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// Index of an entry slot inside a directory's entry table
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot(pub u32);

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot:{}", self.0)
    }
}

/// Current on-disk position of an object: (parent, slot, generation).
///
/// The generation is bumped by the store on every write to a slot, so a key
/// taken before a slot was reused never compares equal to the new occupant's.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    pub parent: ObjectId,
    pub slot: Slot,
    pub generation: u64,
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}#{}", self.parent, self.slot, self.generation)
    }
}

/// Object types
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    File,
    Directory,
}

impl ObjectKind {
    pub fn is_dir(self) -> bool {
        matches!(self, ObjectKind::Directory)
    }
}

/// Data-extent descriptor of a regular file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub len: u64,
}

/// Object timestamps
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectTimes {
    pub mtime: i64,
    pub ctime: i64,
}

impl ObjectTimes {
    pub fn now() -> Self {
        let now = current_timestamp();
        Self {
            mtime: now,
            ctime: now,
        }
    }
}

pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Owning user and group of an object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Security identity of the caller (uid, gid, and supplementary groups)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Credential {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new(0, 0)
    }

    pub fn with_groups(mut self, groups: Vec<u32>) -> Self {
        self.groups = groups;
        self
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }

    pub fn owner(&self) -> Owner {
        Owner {
            uid: self.uid,
            gid: self.gid,
        }
    }
}

/// Actions the permission oracle is asked about
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Modify the object (add or remove entries for a directory)
    Write,
    /// Traverse the directory
    Search,
    /// Detach an entry owned by `entry_owner` from the directory being checked
    Unlink { entry_owner: u32 },
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Write => f.write_str("write"),
            Action::Search => f.write_str("search"),
            Action::Unlink { .. } => f.write_str("unlink"),
        }
    }
}

/// What a directory slot holds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPayload {
    pub name: String,
    pub object: ObjectId,
    pub kind: ObjectKind,
}

/// In-core state of a file or directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub name: String,
    pub parent: ObjectId,
    /// Current entry location; `None` only for the root
    pub key: Option<EntryKey>,
    pub owner: Owner,
    pub mode: u32,
    pub nlink: u32,
    /// Set once the object has been removed from its parent; holders of the
    /// id detect concurrent removal through it
    pub unlinked: bool,
    pub extent: Option<Extent>,
    pub times: ObjectTimes,
}

impl ObjectRecord {
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn is_root(&self) -> bool {
        self.id == self.parent
    }

    pub fn payload(&self) -> EntryPayload {
        EntryPayload {
            name: self.name.clone(),
            object: self.id,
            kind: self.kind,
        }
    }
}

/// Template for a new object handed to the store
#[derive(Clone, Debug)]
pub struct NewObject {
    pub kind: ObjectKind,
    pub name: String,
    pub parent: ObjectId,
    pub owner: Owner,
    pub mode: u32,
    /// Data length for files; ignored for directories
    pub len: u64,
}

/// Event kinds for rename notifications
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    GenealogyResolved {
        from_dir: ObjectId,
        to_dir: ObjectId,
        intermediate: Option<ObjectId>,
    },
    Renamed {
        object: ObjectId,
        from_dir: ObjectId,
        from_name: String,
        to_dir: ObjectId,
        to_name: String,
        replaced: Option<ObjectId>,
    },
    RolledBack {
        object: ObjectId,
        error: String,
    },
    Removed {
        dir: ObjectId,
        name: String,
        object: ObjectId,
    },
}

/// Event sink trait for receiving rename notifications
pub trait EventSink: Send + Sync {
    fn on_event(&self, evt: &EventKind);
}

/// Opaque event subscription identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl SubscriptionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}
