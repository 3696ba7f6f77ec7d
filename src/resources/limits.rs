//! Resource ceilings for one invocation

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SandboxError};
use crate::monitoring::ResourceUsage;
use crate::result::KillReason;
use crate::utils::parse_memory_size;

/// Tuning for the kernel rlimit backstop installed at spawn time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoarseLimits {
    /// Maximum core dump size in bytes (RLIMIT_CORE)
    pub max_core_bytes: u64,
    /// Maximum number of processes for the child's user (RLIMIT_NPROC)
    pub max_processes: u64,
    /// Maximum number of open descriptors (RLIMIT_NOFILE)
    pub max_open_files: u64,
}

impl Default for CoarseLimits {
    fn default() -> Self {
        Self {
            max_core_bytes: 0,
            max_processes: 16,
            max_open_files: 64,
        }
    }
}

/// Wall-time, CPU-time and memory ceilings.
///
/// A ceiling of `0` means unlimited on that dimension. A breach is a strict
/// excess: usage equal to a ceiling is still within bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitPolicy {
    /// CPU time ceiling in milliseconds (user + system)
    pub cpu_time_ms: u64,
    /// Wall-clock ceiling in milliseconds
    pub wall_time_ms: u64,
    /// Peak resident memory ceiling in bytes
    pub memory_bytes: u64,
    /// Install kernel rlimits as a coarse backstop
    pub coarse_limits: bool,
    /// Backstop tuning, only used when `coarse_limits` is set
    pub coarse: CoarseLimits,
}

impl LimitPolicy {
    /// No ceilings at all
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Set the wall-clock ceiling
    pub fn wall_time(mut self, limit: Duration) -> Self {
        self.wall_time_ms = limit.as_millis() as u64;
        self
    }

    /// Set the CPU time ceiling
    pub fn cpu_time(mut self, limit: Duration) -> Self {
        self.cpu_time_ms = limit.as_millis() as u64;
        self
    }

    /// Set the memory ceiling in bytes
    pub fn memory(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    /// Set the memory ceiling from a string like "256M"
    pub fn memory_str(self, limit: &str) -> Result<Self> {
        Ok(self.memory(parse_memory_size(limit)?))
    }

    /// Request the rlimit backstop with the given tuning
    pub fn with_coarse_limits(mut self, coarse: CoarseLimits) -> Self {
        self.coarse_limits = true;
        self.coarse = coarse;
        self
    }

    /// Wall-clock ceiling as a duration, `None` when unlimited
    pub fn wall_deadline(&self) -> Option<Duration> {
        (self.wall_time_ms > 0).then(|| Duration::from_millis(self.wall_time_ms))
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if self.coarse_limits && self.coarse.max_open_files < 3 {
            return Err(SandboxError::InvalidConfig(format!(
                "max_open_files must leave room for the standard streams (got {})",
                self.coarse.max_open_files
            )));
        }
        if self.coarse_limits && self.coarse.max_processes == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_processes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// First ceiling breached by `usage`, checked wall, then CPU, then memory
    pub fn breached_by(&self, usage: &ResourceUsage) -> Option<KillReason> {
        if exceeds(usage.wall_time_ms, self.wall_time_ms) {
            return Some(KillReason::WallTimeExceeded);
        }
        if exceeds(usage.cpu_time_ms, self.cpu_time_ms) {
            return Some(KillReason::CpuTimeExceeded);
        }
        if exceeds(usage.peak_memory_bytes, self.memory_bytes) {
            return Some(KillReason::MemoryExceeded);
        }
        None
    }
}

fn exceeds(value: u64, ceiling: u64) -> bool {
    ceiling > 0 && value > ceiling
}
