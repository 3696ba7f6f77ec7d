//! setrlimit-based coarse backstop
//!
//! The kernel enforces these limits on its own, independently of the
//! resource monitor. They are installed in the child after clone, so
//! [`RlimitConfig::apply`] performs no allocation and reports plain errnos.

use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};

use crate::resources::LimitPolicy;

/// Resource limits applied with setrlimit in the child
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RlimitConfig {
    /// Maximum CPU time in seconds (RLIMIT_CPU)
    pub max_cpu_seconds: Option<u64>,
    /// Maximum core dump size in bytes (RLIMIT_CORE)
    pub max_core_bytes: Option<u64>,
    /// Maximum number of processes (RLIMIT_NPROC)
    pub max_processes: Option<u64>,
    /// Maximum number of open files (RLIMIT_NOFILE)
    pub max_open_files: Option<u64>,
}

impl RlimitConfig {
    /// Derive the backstop from a limit policy.
    ///
    /// Returns an empty config when the policy does not request coarse
    /// limits. The CPU rlimit rounds the ceiling up to whole seconds and adds
    /// one second of slack so the monitor normally fires first.
    pub fn from_policy(policy: &LimitPolicy) -> Self {
        if !policy.coarse_limits {
            return Self::default();
        }

        let max_cpu_seconds =
            (policy.cpu_time_ms > 0).then(|| policy.cpu_time_ms.div_ceil(1000) + 1);

        Self {
            max_cpu_seconds,
            max_core_bytes: Some(policy.coarse.max_core_bytes),
            max_processes: Some(policy.coarse.max_processes),
            max_open_files: Some(policy.coarse.max_open_files),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply resource limits to the current process.
    /// This is called in the child process after clone.
    pub fn apply(&self) -> Result<(), Errno> {
        let entries = [
            (Resource::RLIMIT_CPU, self.max_cpu_seconds),
            (Resource::RLIMIT_CORE, self.max_core_bytes),
            (Resource::RLIMIT_NPROC, self.max_processes),
            (Resource::RLIMIT_NOFILE, self.max_open_files),
        ];

        for (resource, limit) in entries {
            if let Some(limit) = limit {
                setrlimit(resource, limit, limit)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::CoarseLimits;
    use std::time::Duration;

    #[test]
    fn test_rlimit_config_default() {
        let config = RlimitConfig::default();
        assert!(config.is_empty());
        assert!(config.apply().is_ok());
    }

    #[test]
    fn test_from_policy_without_coarse_limits_is_empty() {
        let policy = LimitPolicy::unlimited().cpu_time(Duration::from_millis(1500));
        assert!(RlimitConfig::from_policy(&policy).is_empty());
    }

    #[test]
    fn test_cpu_seconds_rounds_up_with_slack() {
        let base = LimitPolicy::unlimited().with_coarse_limits(CoarseLimits::default());

        let config = RlimitConfig::from_policy(&base.cpu_time(Duration::from_millis(1500)));
        assert_eq!(config.max_cpu_seconds, Some(3));

        let config = RlimitConfig::from_policy(&base.cpu_time(Duration::from_millis(2000)));
        assert_eq!(config.max_cpu_seconds, Some(3));

        let config = RlimitConfig::from_policy(&base);
        assert_eq!(config.max_cpu_seconds, None);
        assert_eq!(config.max_core_bytes, Some(0));
        assert_eq!(config.max_processes, Some(16));
        assert_eq!(config.max_open_files, Some(64));
    }

    #[test]
    fn test_apply_reports_errno() {
        // Above fs.nr_open even for root
        let config = RlimitConfig {
            max_open_files: Some(1 << 40),
            ..Default::default()
        };
        assert_eq!(config.apply(), Err(Errno::EPERM));
    }

    /// Forks a child, caps RLIMIT_NOFILE at 8 and checks opening stops there.
    #[test]
    fn test_nofile_is_enforced_in_child() {
        let _guard = crate::test_support::serial_guard();
        let config = RlimitConfig {
            max_open_files: Some(8),
            ..Default::default()
        };

        unsafe {
            let pid = libc::fork();
            assert!(pid >= 0, "fork failed: {}", std::io::Error::last_os_error());

            if pid == 0 {
                if config.apply().is_err() {
                    libc::_exit(99);
                }
                let path = b"/dev/null\0";
                let mut opened = 0;
                for _ in 0..20 {
                    if libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDONLY) < 0 {
                        break;
                    }
                    opened += 1;
                }
                libc::_exit(if opened < 20 { 0 } else { 1 });
            }

            let mut status: i32 = 0;
            libc::waitpid(pid, &mut status, 0);
            assert!(libc::WIFEXITED(status));
            assert_eq!(libc::WEXITSTATUS(status), 0);
        }
    }
}
