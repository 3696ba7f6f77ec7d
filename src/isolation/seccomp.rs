//! Seccomp deny-list compilation and loading using seccompiler
//!
//! The filter allows every syscall by default and kills the whole process on
//! a denied one, so a violation surfaces to the supervisor as SIGSYS.

use std::collections::BTreeMap;
use std::convert::TryInto;

use seccompiler::{
    apply_filter, BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition,
    SeccompFilter as SeccompilerFilter, SeccompRule, TargetArch,
};

use crate::errors::{Result, SandboxError};

/// Syscalls a sandboxed program must not issue under the "deny common" preset.
///
/// Process creation, identity and privilege changes, per-process timers,
/// directory changes, permission and ownership changes, kernel modules and
/// mount manipulation.
pub fn deny_common_syscalls() -> Vec<(&'static str, i64)> {
    let mut list = vec![
        ("clone", libc::SYS_clone),
        ("clone3", libc::SYS_clone3),
        ("reboot", libc::SYS_reboot),
        ("kexec_load", libc::SYS_kexec_load),
        ("setuid", libc::SYS_setuid),
        ("setgid", libc::SYS_setgid),
        ("setreuid", libc::SYS_setreuid),
        ("setregid", libc::SYS_setregid),
        ("setresuid", libc::SYS_setresuid),
        ("setresgid", libc::SYS_setresgid),
        ("setgroups", libc::SYS_setgroups),
        ("prctl", libc::SYS_prctl),
        ("unshare", libc::SYS_unshare),
        ("setns", libc::SYS_setns),
        ("setrlimit", libc::SYS_setrlimit),
        ("ptrace", libc::SYS_ptrace),
        ("mount", libc::SYS_mount),
        ("umount2", libc::SYS_umount2),
        ("pivot_root", libc::SYS_pivot_root),
        ("timer_create", libc::SYS_timer_create),
        ("timer_gettime", libc::SYS_timer_gettime),
        ("timer_settime", libc::SYS_timer_settime),
        ("timer_delete", libc::SYS_timer_delete),
        ("timer_getoverrun", libc::SYS_timer_getoverrun),
        ("timerfd_create", libc::SYS_timerfd_create),
        ("timerfd_gettime", libc::SYS_timerfd_gettime),
        ("timerfd_settime", libc::SYS_timerfd_settime),
        ("chdir", libc::SYS_chdir),
        ("fchdir", libc::SYS_fchdir),
        ("fchmod", libc::SYS_fchmod),
        ("fchmodat", libc::SYS_fchmodat),
        ("fchown", libc::SYS_fchown),
        ("fchownat", libc::SYS_fchownat),
        ("init_module", libc::SYS_init_module),
        ("finit_module", libc::SYS_finit_module),
        ("delete_module", libc::SYS_delete_module),
    ];

    // Legacy entry points that newer architectures only expose through *at/clone
    #[cfg(target_arch = "x86_64")]
    list.extend([
        ("fork", libc::SYS_fork),
        ("vfork", libc::SYS_vfork),
        ("chmod", libc::SYS_chmod),
        ("chown", libc::SYS_chown),
        ("lchown", libc::SYS_lchown),
    ]);

    list
}

/// Seccomp filter built from a guard policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeccompFilter {
    denied: Vec<(&'static str, i64)>,
    deny_limit_writes: bool,
    deny_raw_sockets: bool,
}

impl SeccompFilter {
    /// Filter that only sets no-new-privs and denies nothing
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// The "deny common" preset
    pub fn deny_common() -> Self {
        Self {
            denied: deny_common_syscalls(),
            deny_limit_writes: true,
            deny_raw_sockets: false,
        }
    }

    /// Also kill on raw (`SOCK_RAW`) and packet (`AF_PACKET`) sockets
    pub fn with_raw_sockets_denied(mut self) -> Self {
        self.deny_raw_sockets = true;
        self
    }

    /// Names of unconditionally denied syscalls
    pub fn denied_syscalls(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.denied.iter().map(|(name, _)| *name)
    }

    pub fn denies_raw_sockets(&self) -> bool {
        self.deny_raw_sockets
    }

    /// True when the filter denies nothing at all
    pub fn is_empty(&self) -> bool {
        self.denied.is_empty() && !self.deny_limit_writes && !self.deny_raw_sockets
    }

    /// Compile to BPF for the host architecture.
    ///
    /// Returns `None` for an empty filter; loading then only sets no-new-privs.
    pub fn compile(&self) -> Result<Option<BpfProgram>> {
        if self.is_empty() {
            return Ok(None);
        }

        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        for (_, number) in &self.denied {
            rules.entry(*number).or_default();
        }

        if self.deny_limit_writes {
            rules.insert(libc::SYS_prlimit64, vec![limit_write_rule()?]);
        }
        if self.deny_raw_sockets {
            rules.insert(libc::SYS_socket, raw_socket_rules()?);
        }

        let arch: TargetArch = std::env::consts::ARCH.try_into().map_err(|e| {
            SandboxError::GuardApplyFailed(format!("Unsupported architecture: {}", e))
        })?;

        let filter = SeccompilerFilter::new(
            rules,
            SeccompAction::Allow,
            SeccompAction::KillProcess,
            arch,
        )
        .map_err(|e| SandboxError::GuardApplyFailed(format!("Failed to create filter: {}", e)))?;

        let program: BpfProgram = filter
            .try_into()
            .map_err(|e| SandboxError::GuardApplyFailed(format!("Failed to compile filter: {}", e)))?;

        Ok(Some(program))
    }
}

/// prlimit64 with a non-null `new_limit`; reading limits stays allowed
fn limit_write_rule() -> Result<SeccompRule> {
    SeccompCondition::new(2, SeccompCmpArgLen::Qword, SeccompCmpOp::Ne, 0)
        .and_then(|cond| SeccompRule::new(vec![cond]))
        .map_err(|e| SandboxError::GuardApplyFailed(format!("Failed to build prlimit rule: {}", e)))
}

fn raw_socket_rules() -> Result<Vec<SeccompRule>> {
    let build = || -> std::result::Result<Vec<SeccompRule>, seccompiler::Error> {
        // socket(domain, type, protocol): the low nibble of `type` is the socket kind
        let raw_type = SeccompRule::new(vec![SeccompCondition::new(
            1,
            SeccompCmpArgLen::Dword,
            SeccompCmpOp::MaskedEq(0xf),
            libc::SOCK_RAW as u64,
        )?])?;
        let packet_domain = SeccompRule::new(vec![SeccompCondition::new(
            0,
            SeccompCmpArgLen::Dword,
            SeccompCmpOp::Eq,
            libc::AF_PACKET as u64,
        )?])?;
        Ok(vec![raw_type, packet_domain])
    };

    build().map_err(|e| SandboxError::GuardApplyFailed(format!("Failed to build socket rule: {}", e)))
}

/// Why loading failed in the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailure {
    NoNewPrivs(i32),
    Install(i32),
}

impl LoadFailure {
    pub fn errno(&self) -> i32 {
        match self {
            LoadFailure::NoNewPrivs(errno) | LoadFailure::Install(errno) => *errno,
        }
    }
}

/// Install a compiled filter on the calling thread.
///
/// Runs in the child after clone: no allocation, errors carry the raw errno.
/// NOTE: This does NOT require root - only PR_SET_NO_NEW_PRIVS is needed.
pub fn load(program: Option<&BpfProgram>) -> std::result::Result<(), LoadFailure> {
    unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
            return Err(LoadFailure::NoNewPrivs(last_errno()));
        }
    }

    if let Some(program) = program {
        apply_filter(program).map_err(|_| LoadFailure::Install(last_errno()))?;
    }
    Ok(())
}

fn last_errno() -> i32 {
    nix::errno::Errno::last_raw()
}
