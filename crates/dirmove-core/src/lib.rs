// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! dirmove - filesystem-agnostic rename core
//!
//! [`Volume::rename`] moves a directory entry between parents under ordered
//! directory locks, rejects moves that would put a directory inside itself,
//! and undoes partial work when stable storage fails part way through.

pub mod cache;
pub mod check;
pub mod config;
pub mod error;
pub mod fault;
pub mod locks;
pub mod permissions;
mod rename;
pub mod storage;
pub mod types;
pub mod volume;

pub use cache::{IdentityIndex, LocationTable, LookupCache, NameCache};
pub use check::{verify, TreeReport, Violation};
pub use config::{LockPolicy, SecurityPolicy, VolumeConfig, VolumeLimits};
pub use error::{
    Participant, RenameError, RenameResult, RetryReason, Step, StoreError, StoreResult,
};
pub use fault::{
    FaultErrno, FaultInjector, FaultOp, FaultPolicy, FaultPolicySummary, FaultRule, FaultyStore,
};
pub use locks::{LockEvent, LockTable, LockTimeout, TOPOLOGY_LOCK};
pub use permissions::{PermissionOracle, PosixPermissions};
pub use storage::{DirectoryStore, MemoryStore};
pub use types::*;
pub use volume::{Volume, VolumeBuilder};
