// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for dirmove
//!
//! Collaborators report [`StoreError`]. The rename pipeline never returns one
//! directly: every collaborator failure is wrapped with the [`Step`] and
//! [`Participant`] it happened at and mapped onto [`RenameError`].
//!
//! | Variant | errno |
//! |---------|-------|
//! | `NotFound` | `ENOENT` |
//! | `InvalidArgument` | `EINVAL` |
//! | `AlreadyExists` | `EEXIST` |
//! | `NotADirectory` | `ENOTDIR` |
//! | `IsADirectory` | `EISDIR` |
//! | `DirectoryNotEmpty` | `ENOTEMPTY` |
//! | `PermissionDenied` | `EACCES` |
//! | `WouldCreateCycle` | `EINVAL` |
//! | `TooDeep` | `ELOOP` |
//! | `Retryable` | `EAGAIN` |
//! | `NoSpace` | `ENOSPC` |
//! | `Io` | `EIO` |
//! | `Inconsistent` | `EIO` |

use std::io;

use crate::locks::LockTimeout;
use crate::types::{Action, ObjectId, Slot};

/// Role an object plays in a rename
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Participant {
    FromDir,
    FromObject,
    ToDir,
    ToObject,
    /// A directory examined while walking up from the destination
    Ancestor(ObjectId),
}

impl std::fmt::Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Participant::FromDir => f.write_str("source directory"),
            Participant::FromObject => f.write_str("source entry"),
            Participant::ToDir => f.write_str("destination directory"),
            Participant::ToObject => f.write_str("destination entry"),
            Participant::Ancestor(id) => write!(f, "ancestor {}", id),
        }
    }
}

/// Pipeline step an error is attributed to.
///
/// The forward steps of the mutator come first, then the inverse operations
/// replayed during rollback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Validate,
    Genealogy,
    Lookup,
    CheckPossible,
    CheckPermitted,
    RemoveTarget,
    AssignName,
    AssignLocation,
    WriteNew,
    RemoveOld,
    Commit,
    ReactivateTarget,
    RestoreSource,
    RemoveNewEntry,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Step::Validate => "validate",
            Step::Genealogy => "genealogy",
            Step::Lookup => "lookup",
            Step::CheckPossible => "check_possible",
            Step::CheckPermitted => "check_permitted",
            Step::RemoveTarget => "remove_target",
            Step::AssignName => "assign_name",
            Step::AssignLocation => "assign_location",
            Step::WriteNew => "write_new",
            Step::RemoveOld => "remove_old",
            Step::Commit => "commit",
            Step::ReactivateTarget => "reactivate_target",
            Step::RestoreSource => "restore_source",
            Step::RemoveNewEntry => "remove_new_entry",
        };
        f.write_str(label)
    }
}

/// Why a rename may succeed if simply issued again
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryReason {
    /// The lock manager gave up waiting for a directory lock
    LockTimeout(ObjectId),
    /// The tree changed between analysis and the destructive phase
    TopologyChanged,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::LockTimeout(id) => write!(f, "timed out locking {}", id),
            RetryReason::TopologyChanged => f.write_str("directory tree changed concurrently"),
        }
    }
}

/// Errors reported by directory-entry storage
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("object {0} not found")]
    NotFound(ObjectId),
    #[error("entry name already present")]
    AlreadyExists,
    #[error("no free entry slot")]
    NoSpace,
    #[error("{0} is not a directory")]
    NotADirectory(ObjectId),
    #[error("{slot} in {dir}: {detail}")]
    SlotState {
        dir: ObjectId,
        slot: Slot,
        detail: &'static str,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Rename error taxonomy
#[derive(thiserror::Error, Debug)]
pub enum RenameError {
    #[error("{participant} not found")]
    NotFound { participant: Participant },
    #[error("invalid name {name:?}: {reason}")]
    InvalidArgument { name: String, reason: &'static str },
    #[error("{participant} already exists")]
    AlreadyExists { participant: Participant },
    #[error("{participant} is not a directory")]
    NotADirectory { participant: Participant },
    #[error("{participant} is a directory")]
    IsADirectory { participant: Participant },
    #[error("destination directory is not empty")]
    DirectoryNotEmpty,
    #[error("{action} permission denied on {participant}")]
    PermissionDenied {
        participant: Participant,
        action: Action,
    },
    #[error("moving {moved} under {destination} would create a cycle")]
    WouldCreateCycle {
        moved: ObjectId,
        destination: ObjectId,
    },
    #[error("more than {limit} directories above {destination}")]
    TooDeep { destination: ObjectId, limit: usize },
    #[error("retryable: {0}")]
    Retryable(RetryReason),
    #[error("no space left in {participant}")]
    NoSpace { participant: Participant },
    #[error("storage failure at {step} on {participant}: {source}")]
    Io {
        step: Step,
        participant: Participant,
        #[source]
        source: StoreError,
    },
    /// A partial mutation could not be undone or completed; the tree may be
    /// inconsistent
    #[error("inconsistent state at {step}: {detail}{}", while_handling(.original))]
    Inconsistent {
        step: Step,
        original: Option<Box<RenameError>>,
        detail: String,
    },
}

pub type RenameResult<T> = Result<T, RenameError>;

fn while_handling(original: &Option<Box<RenameError>>) -> String {
    match original {
        Some(err) => format!(" (while handling: {})", err),
        None => String::new(),
    }
}

impl From<LockTimeout> for RenameError {
    fn from(timeout: LockTimeout) -> Self {
        RenameError::Retryable(RetryReason::LockTimeout(timeout.dir))
    }
}

impl RenameError {
    /// Wrap a collaborator error with the step and participant it occurred at
    pub fn from_store(step: Step, participant: Participant, err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => RenameError::NotFound { participant },
            StoreError::AlreadyExists => RenameError::AlreadyExists { participant },
            StoreError::NoSpace => RenameError::NoSpace { participant },
            StoreError::NotADirectory(_) => RenameError::NotADirectory { participant },
            other => RenameError::Io {
                step,
                participant,
                source: other,
            },
        }
    }

    /// Escalate a failed rollback step
    pub fn inconsistent(step: Step, original: RenameError, detail: impl Into<String>) -> Self {
        RenameError::Inconsistent {
            step,
            original: Some(Box::new(original)),
            detail: detail.into(),
        }
    }

    /// Report state found corrupt without a preceding failure
    pub fn corrupt(step: Step, detail: impl Into<String>) -> Self {
        RenameError::Inconsistent {
            step,
            original: None,
            detail: detail.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RenameError::Retryable(_))
    }

    /// True when all-or-nothing could not be guaranteed
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenameError::Inconsistent { .. })
    }

    /// POSIX errno for compatibility layers
    pub fn to_errno(&self) -> i32 {
        match self {
            RenameError::NotFound { .. } => libc::ENOENT,
            RenameError::InvalidArgument { .. } => libc::EINVAL,
            RenameError::AlreadyExists { .. } => libc::EEXIST,
            RenameError::NotADirectory { .. } => libc::ENOTDIR,
            RenameError::IsADirectory { .. } => libc::EISDIR,
            RenameError::DirectoryNotEmpty => libc::ENOTEMPTY,
            RenameError::PermissionDenied { .. } => libc::EACCES,
            RenameError::WouldCreateCycle { .. } => libc::EINVAL,
            RenameError::TooDeep { .. } => libc::ELOOP,
            RenameError::Retryable(_) => libc::EAGAIN,
            RenameError::NoSpace { .. } => libc::ENOSPC,
            RenameError::Io { .. } => libc::EIO,
            RenameError::Inconsistent { .. } => libc::EIO,
        }
    }

    /// Short stable label, used for tallies and event payloads
    pub fn label(&self) -> &'static str {
        match self {
            RenameError::NotFound { .. } => "not_found",
            RenameError::InvalidArgument { .. } => "invalid_argument",
            RenameError::AlreadyExists { .. } => "already_exists",
            RenameError::NotADirectory { .. } => "not_a_directory",
            RenameError::IsADirectory { .. } => "is_a_directory",
            RenameError::DirectoryNotEmpty => "directory_not_empty",
            RenameError::PermissionDenied { .. } => "permission_denied",
            RenameError::WouldCreateCycle { .. } => "would_create_cycle",
            RenameError::TooDeep { .. } => "too_deep",
            RenameError::Retryable(_) => "retryable",
            RenameError::NoSpace { .. } => "no_space",
            RenameError::Io { .. } => "io",
            RenameError::Inconsistent { .. } => "inconsistent",
        }
    }
}
