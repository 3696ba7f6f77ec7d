//! Namespace management for sandbox isolation

use std::fs;

use nix::sched::CloneFlags;
use nix::unistd::Pid;

use crate::errors::{Result, SandboxError};

/// Configuration for namespace isolation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NamespaceConfig {
    pub pid: bool,
    pub ipc: bool,
    pub net: bool,
    pub mount: bool,
    pub uts: bool,
    pub cgroup: bool,
    pub user: bool,
}

impl NamespaceConfig {
    /// No isolation
    pub fn none() -> Self {
        Self::default()
    }

    /// Mount, PID, IPC, UTS and cgroup namespaces
    pub fn common() -> Self {
        Self {
            pid: true,
            ipc: true,
            mount: true,
            uts: true,
            cgroup: true,
            ..Self::default()
        }
    }

    /// Network namespace only
    pub fn network() -> Self {
        Self {
            net: true,
            ..Self::default()
        }
    }

    /// Union of two configurations
    pub fn merge(self, other: Self) -> Self {
        Self {
            pid: self.pid || other.pid,
            ipc: self.ipc || other.ipc,
            net: self.net || other.net,
            mount: self.mount || other.mount,
            uts: self.uts || other.uts,
            cgroup: self.cgroup || other.cgroup,
            user: self.user || other.user,
        }
    }

    /// Add a user namespace when isolation is requested without root.
    ///
    /// Creating the other namespaces needs CAP_SYS_ADMIN, which an
    /// unprivileged caller only holds inside a fresh user namespace.
    pub fn for_caller(mut self, caller_is_root: bool) -> Self {
        if !caller_is_root && self.enabled_count() > 0 {
            self.user = true;
        }
        self
    }

    /// Convert to clone flags
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.cgroup {
            flags |= CloneFlags::CLONE_NEWCGROUP;
        }
        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        flags
    }

    pub fn enabled_count(&self) -> usize {
        [
            self.pid,
            self.ipc,
            self.net,
            self.mount,
            self.uts,
            self.cgroup,
            self.user,
        ]
        .iter()
        .filter(|&&x| x)
        .count()
    }
}

/// Write the UID/GID maps for a child created in a new user namespace.
///
/// The caller's ids are mapped onto themselves so the program keeps its
/// identity inside the namespace.
pub fn setup_user_namespace(child_pid: Pid, uid: u32, gid: u32) -> Result<()> {
    let pid = child_pid.as_raw();

    fs::write(format!("/proc/{}/uid_map", pid), format!("{} {} 1\n", uid, uid)).map_err(
        |e| SandboxError::GuardApplyFailed(format!("Failed to write uid_map for pid {}: {}", pid, e)),
    )?;

    // Required before an unprivileged writer may set gid_map
    fs::write(format!("/proc/{}/setgroups", pid), "deny\n").map_err(|e| {
        SandboxError::GuardApplyFailed(format!("Failed to write setgroups for pid {}: {}", pid, e))
    })?;

    fs::write(format!("/proc/{}/gid_map", pid), format!("{} {} 1\n", gid, gid)).map_err(
        |e| SandboxError::GuardApplyFailed(format!("Failed to write gid_map for pid {}: {}", pid, e)),
    )?;

    Ok(())
}
