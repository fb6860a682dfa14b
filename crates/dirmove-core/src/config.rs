// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Volume configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Permission enforcement policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    pub enforce_posix_permissions: bool,
    pub root_bypass_permissions: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            enforce_posix_permissions: true,
            root_bypass_permissions: true,
        }
    }
}

/// Directory lock behavior
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockPolicy {
    /// How long a lock acquisition waits before reporting a timeout
    pub timeout_ms: u64,
    /// Take the volume-wide topology lock for directory moves across
    /// parents. Without it two such moves sharing no directory can form a
    /// detached loop.
    pub serialize_directory_moves: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            serialize_directory_moves: true,
        }
    }
}

impl LockPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Structural limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeLimits {
    pub max_name_len: usize,
    pub max_entries_per_dir: usize,
    /// Upper bound on parent-chain length during genealogy analysis
    pub max_walk_depth: usize,
}

impl Default for VolumeLimits {
    fn default() -> Self {
        Self {
            max_name_len: 255,
            max_entries_per_dir: 4096,
            max_walk_depth: 4096,
        }
    }
}

/// Complete volume configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    pub track_events: bool,
    pub security: SecurityPolicy,
    pub locking: LockPolicy,
    pub limits: VolumeLimits,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            track_events: true,
            security: SecurityPolicy::default(),
            locking: LockPolicy::default(),
            limits: VolumeLimits::default(),
        }
    }
}

impl VolumeConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: VolumeConfig = toml::from_str(s).context("parsing volume config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        Self::from_toml_str(&content).with_context(|| format!("loading config file {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        if self.limits.max_name_len == 0 {
            anyhow::bail!("limits.max_name_len must be positive");
        }
        if self.limits.max_entries_per_dir == 0 {
            anyhow::bail!("limits.max_entries_per_dir must be positive");
        }
        if self.limits.max_walk_depth == 0 {
            anyhow::bail!("limits.max_walk_depth must be positive");
        }
        Ok(())
    }

    /// Configuration with permission checks disabled, for tooling that runs as
    /// a single trusted user
    pub fn permissive() -> Self {
        Self {
            security: SecurityPolicy {
                enforce_posix_permissions: false,
                root_bypass_permissions: true,
            },
            ..Self::default()
        }
    }
}
