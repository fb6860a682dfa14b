// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Owner/mode permission evaluation

use crate::config::SecurityPolicy;
use crate::types::{Action, Credential, Owner};

/// Decides whether `cred` may perform `action` on an object with the given
/// `mode` and `owner`. For [`Action::Unlink`] the object is the directory the
/// entry is detached from.
#[cfg_attr(test, mockall::automock)]
pub trait PermissionOracle: Send + Sync {
    fn check_permission(&self, cred: &Credential, mode: u32, owner: Owner, action: Action) -> bool;
}

/// POSIX owner/group/other bits plus the sticky-directory rule
#[derive(Clone, Debug, Default)]
pub struct PosixPermissions {
    policy: SecurityPolicy,
}

impl PosixPermissions {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self { policy }
    }

    fn allowed_bits(
        cred: &Credential,
        mode: u32,
        owner: Owner,
        want_write: bool,
        want_exec: bool,
    ) -> bool {
        let (w_bit, x_bit) = if cred.uid == owner.uid {
            (0o200, 0o100)
        } else if cred.in_group(owner.gid) {
            (0o020, 0o010)
        } else {
            (0o002, 0o001)
        };
        let allow_w = !want_write || (mode & w_bit) != 0;
        let allow_x = !want_exec || (mode & x_bit) != 0;
        allow_w && allow_x
    }
}

impl PermissionOracle for PosixPermissions {
    fn check_permission(&self, cred: &Credential, mode: u32, owner: Owner, action: Action) -> bool {
        if !self.policy.enforce_posix_permissions {
            return true;
        }
        if self.policy.root_bypass_permissions && cred.uid == 0 {
            return true;
        }
        match action {
            Action::Write => Self::allowed_bits(cred, mode, owner, true, false),
            Action::Search => Self::allowed_bits(cred, mode, owner, false, true),
            Action::Unlink { entry_owner } => {
                let sticky = (mode & libc::S_ISVTX as u32) != 0;
                let denied = sticky && cred.uid != owner.uid && cred.uid != entry_owner;
                if sticky {
                    tracing::debug!(
                        uid = cred.uid,
                        dir_owner = owner.uid,
                        entry_owner,
                        decision = if denied { "deny" } else { "allow" },
                        "sticky directory unlink check"
                    );
                }
                !denied
            }
        }
    }
}
