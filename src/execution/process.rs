//! Process creation within the requested namespaces
//!
//! Everything that can allocate or fail slowly happens in the parent: program
//! resolution, opening redirection targets, the user database lookup and
//! filter compilation. The cloned child only issues raw syscalls on data
//! prepared beforehand, which keeps cloning safe from a multi-threaded caller.
//!
//! Setup failures in the child are written to a close-on-exec error pipe as a
//! `(stage, errno)` pair. EOF on that pipe means the image was replaced.

use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{pipe2, Pid, User};
use seccompiler::BpfProgram;

use crate::errors::{Result, SandboxError};
use crate::execution::io::{IoPlan, RedirectTargets};
use crate::execution::program::{ProgramDescriptor, ResolvedProgram};
use crate::isolation::namespace::setup_user_namespace;
use crate::isolation::{seccomp, GuardPolicy, NamespaceConfig};
use crate::resources::{LimitPolicy, RlimitConfig};
use crate::utils::{get_gid, get_uid, is_root};

const CHILD_STACK_SIZE: usize = 256 * 1024;

/// Setup step the child was in when it gave up
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStage {
    UserNamespace = 1,
    Redirect = 2,
    Rlimit = 3,
    Chdir = 4,
    Identity = 5,
    Seccomp = 6,
    Exec = 7,
}

impl ChildStage {
    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => ChildStage::UserNamespace,
            2 => ChildStage::Redirect,
            3 => ChildStage::Rlimit,
            4 => ChildStage::Chdir,
            5 => ChildStage::Identity,
            6 => ChildStage::Seccomp,
            7 => ChildStage::Exec,
            _ => return None,
        })
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ChildStage::UserNamespace => "waiting for user namespace mapping",
            ChildStage::Redirect => "redirecting standard streams",
            ChildStage::Rlimit => "installing resource limits",
            ChildStage::Chdir => "changing working directory",
            ChildStage::Identity => "switching identity",
            ChildStage::Seccomp => "installing syscall filter",
            ChildStage::Exec => "executing program",
        }
    }

    /// Map a child-side failure to the error the caller sees
    pub fn into_error(self, errno: Errno, program: &str) -> SandboxError {
        let detail = format!("{}: {} failed: {}", program, self.describe(), errno.desc());
        match self {
            ChildStage::Redirect => SandboxError::IoRedirectFailed(detail),
            ChildStage::Identity => SandboxError::PermissionDenied(detail),
            ChildStage::UserNamespace | ChildStage::Seccomp => {
                SandboxError::GuardApplyFailed(detail)
            }
            ChildStage::Rlimit | ChildStage::Chdir | ChildStage::Exec => {
                SandboxError::SpawnFailed(detail)
            }
        }
    }
}

/// Target uid/gid for impersonation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Identity {
    uid: libc::uid_t,
    gid: libc::gid_t,
    drop_groups: bool,
}

/// Look up the impersonation target and check the caller may switch to it
fn resolve_identity(user: Option<&str>) -> Result<Option<Identity>> {
    let Some(name) = user else {
        return Ok(None);
    };

    let entry = User::from_name(name)
        .map_err(|e| SandboxError::PermissionDenied(format!("lookup of user {} failed: {}", name, e)))?
        .ok_or_else(|| SandboxError::PermissionDenied(format!("unknown user {}", name)))?;
    let (uid, gid) = (entry.uid.as_raw(), entry.gid.as_raw());

    if is_root() {
        return Ok(Some(Identity {
            uid,
            gid,
            drop_groups: true,
        }));
    }
    if uid == get_uid() && gid == get_gid() {
        return Ok(None);
    }
    Err(SandboxError::PermissionDenied(format!(
        "running as {} requires root privileges",
        name
    )))
}

/// Summary of how the child ended, as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    /// The child was reaped elsewhere; its status is unknown
    Vanished,
}

/// Reaped child status plus the kernel's accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub termination: Termination,
    /// User + system CPU of the child and its waited-for descendants
    pub cpu_time_ms: u64,
    /// Peak resident set size
    pub max_rss_bytes: u64,
    /// Time from launch until the exit was observed
    pub wall_time_ms: u64,
}

/// Running child owned by the supervisor
#[derive(Debug)]
pub struct LiveHandle {
    pid: Pid,
    pidfd: Option<OwnedFd>,
    started: Instant,
    exited_at: Option<Instant>,
    vanished: bool,
    reaped: bool,
}

impl LiveHandle {
    fn new(pid: Pid, started: Instant) -> Self {
        let pidfd = open_pidfd(pid);
        if pidfd.is_none() {
            debug!("pidfd unavailable for {}, falling back to polling", pid);
        }
        Self {
            pid,
            pidfd,
            started,
            exited_at: None,
            vanished: false,
            reaped: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Wait up to `timeout` for the child to exit without reaping it.
    ///
    /// Returns true once the child is a zombie (or was reaped elsewhere). The
    /// pid stays reserved until [`LiveHandle::reap`], so signalling the child
    /// or its group in between cannot hit a recycled pid.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<bool> {
        if self.has_exited()? {
            return Ok(true);
        }

        match &self.pidfd {
            Some(fd) => {
                let mut pfd = libc::pollfd {
                    fd: fd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                };
                let millis = timeout.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;
                // SAFETY: one valid pollfd
                let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
                if rc < 0 && Errno::last() != Errno::EINTR {
                    return Err(SandboxError::ProcessMonitoring(format!(
                        "poll on pidfd of {} failed: {}",
                        self.pid,
                        Errno::last()
                    )));
                }
            }
            None => std::thread::sleep(timeout),
        }

        self.has_exited()
    }

    /// Non-blocking, non-reaping exit check
    pub fn has_exited(&mut self) -> Result<bool> {
        self.peek(libc::WNOHANG)
    }

    /// Block until the child has exited, without reaping it
    pub fn wait_exit(&mut self) -> Result<()> {
        self.peek(0).map(|_| ())
    }

    fn peek(&mut self, extra_flags: libc::c_int) -> Result<bool> {
        if self.exited_at.is_some() {
            return Ok(true);
        }

        loop {
            // SAFETY: zeroed siginfo is the documented way to detect "no child" with WNOHANG
            let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
            let rc = unsafe {
                libc::waitid(
                    libc::P_PID,
                    self.pid.as_raw() as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::WNOWAIT | extra_flags,
                )
            };

            if rc == 0 {
                // SAFETY: waitid filled a SIGCHLD siginfo or left it zeroed
                if unsafe { info.si_pid() } == 0 {
                    return Ok(false);
                }
                self.exited_at = Some(Instant::now());
                return Ok(true);
            }

            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ECHILD => {
                    warn!("child {} was reaped outside the supervisor", self.pid);
                    self.vanished = true;
                    self.exited_at = Some(Instant::now());
                    return Ok(true);
                }
                errno => {
                    return Err(SandboxError::ProcessMonitoring(format!(
                        "waitid on {} failed: {}",
                        self.pid, errno
                    )))
                }
            }
        }
    }

    /// Collect the exit status and rusage, releasing the pid
    pub fn reap(&mut self) -> Result<ExitReport> {
        let exited_at = *self.exited_at.get_or_insert_with(Instant::now);
        let wall_time_ms = exited_at.duration_since(self.started).as_millis() as u64;

        if self.vanished || self.reaped {
            self.reaped = true;
            return Ok(ExitReport {
                termination: Termination::Vanished,
                cpu_time_ms: 0,
                max_rss_bytes: 0,
                wall_time_ms,
            });
        }

        let mut status: libc::c_int = 0;
        // SAFETY: rusage is plain data filled by the kernel
        let mut usage: libc::rusage = unsafe { mem::zeroed() };
        loop {
            let rc = unsafe { libc::wait4(self.pid.as_raw(), &mut status, 0, &mut usage) };
            if rc == self.pid.as_raw() {
                break;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::ECHILD => {
                    self.vanished = true;
                    return self.reap();
                }
                errno => {
                    return Err(SandboxError::ProcessMonitoring(format!(
                        "wait4 on {} failed: {}",
                        self.pid, errno
                    )))
                }
            }
        }
        self.reaped = true;

        let termination = if libc::WIFEXITED(status) {
            Termination::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            Termination::Signaled(libc::WTERMSIG(status))
        } else {
            Termination::Vanished
        };

        Ok(ExitReport {
            termination,
            cpu_time_ms: timeval_ms(usage.ru_utime) + timeval_ms(usage.ru_stime),
            max_rss_bytes: (usage.ru_maxrss.max(0) as u64) * 1024,
            wall_time_ms,
        })
    }

    /// Send `signal` to the child's process group and to the child itself.
    ///
    /// Does nothing once the child has been reaped. A missing target is not
    /// an error: the group may already be empty.
    pub fn signal(&self, signal: Signal) {
        if self.reaped || self.vanished {
            return;
        }
        for result in [killpg(self.pid, signal), kill(self.pid, signal)] {
            match result {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => debug!("sending {} to {} failed: {}", signal, self.pid, e),
            }
        }
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        if !self.reaped && !self.vanished {
            warn!("live handle for {} dropped before reaping, killing", self.pid);
            self.signal(Signal::SIGKILL);
            let _ = self.reap();
        }
    }
}

fn timeval_ms(tv: libc::timeval) -> u64 {
    (tv.tv_sec.max(0) as u64) * 1000 + (tv.tv_usec.max(0) as u64) / 1000
}

fn open_pidfd(pid: Pid) -> Option<OwnedFd> {
    // SAFETY: pidfd_open takes a pid and flags, returns a new descriptor
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd < 0 {
        return None;
    }
    // SAFETY: the kernel just handed us this descriptor
    Some(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Everything the child needs, prepared by the parent
struct ChildPlan<'a> {
    program: &'a ResolvedProgram,
    argv: Vec<*const libc::c_char>,
    envp: Vec<*const libc::c_char>,
    targets: &'a RedirectTargets,
    rlimits: RlimitConfig,
    identity: Option<Identity>,
    seccomp: Option<Option<BpfProgram>>,
    error_fd: RawFd,
    sync_fds: Option<(RawFd, RawFd)>,
    parent_pid: Option<libc::pid_t>,
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Report a setup failure to the parent and exit without running destructors
fn child_fail(error_fd: RawFd, stage: ChildStage, errno: i32) -> ! {
    let mut message = [0u8; 8];
    message[..4].copy_from_slice(&(stage as u32).to_le_bytes());
    message[4..].copy_from_slice(&errno.to_le_bytes());
    // SAFETY: write and _exit are async-signal-safe
    unsafe {
        libc::write(error_fd, message.as_ptr() as *const libc::c_void, message.len());
        libc::_exit(127)
    }
}

/// Child side of the launch.
///
/// Order of operations:
/// 1. Wait for the parent to write the user namespace maps (if any)
/// 2. Own process group, die with the supervising thread, default SIGPIPE
/// 3. Redirect standard streams
/// 4. Install rlimits
/// 5. Chdir
/// 6. Drop privileges (setgroups/setgid/setuid)
/// 7. Apply seccomp filter (last - the deny list covers the steps above)
/// 8. Execve
fn child_main(plan: &ChildPlan<'_>) -> ! {
    let error_fd = plan.error_fd;

    // SAFETY: raw syscalls only; nothing here allocates
    unsafe {
        if let Some((sync_read, sync_write)) = plan.sync_fds {
            libc::close(sync_write);
            let mut byte = 0u8;
            let n = libc::read(sync_read, &mut byte as *mut u8 as *mut libc::c_void, 1);
            if n != 1 {
                child_fail(error_fd, ChildStage::UserNamespace, libc::ECANCELED);
            }
            libc::close(sync_read);
        }

        libc::setpgid(0, 0);
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
        if let Some(parent) = plan.parent_pid {
            if libc::getppid() != parent {
                libc::_exit(127);
            }
        }
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut empty: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, ptr::null_mut());
    }

    if let Err(errno) = plan.targets.apply() {
        child_fail(error_fd, ChildStage::Redirect, errno as i32);
    }

    if let Err(errno) = plan.rlimits.apply() {
        child_fail(error_fd, ChildStage::Rlimit, errno as i32);
    }

    // SAFETY: working_dir is a valid C string prepared by the parent
    if unsafe { libc::chdir(plan.program.working_dir.as_ptr()) } != 0 {
        child_fail(error_fd, ChildStage::Chdir, Errno::last_raw());
    }

    if let Some(identity) = plan.identity {
        // SAFETY: plain identity syscalls
        unsafe {
            if identity.drop_groups && libc::setgroups(1, &identity.gid) != 0 {
                child_fail(error_fd, ChildStage::Identity, Errno::last_raw());
            }
            if libc::setgid(identity.gid) != 0 {
                child_fail(error_fd, ChildStage::Identity, Errno::last_raw());
            }
            if libc::setuid(identity.uid) != 0 {
                child_fail(error_fd, ChildStage::Identity, Errno::last_raw());
            }
        }
    }

    if let Some(program) = &plan.seccomp {
        if let Err(failure) = seccomp::load(program.as_ref()) {
            child_fail(error_fd, ChildStage::Seccomp, failure.errno());
        }
    }

    // SAFETY: argv and envp are null-terminated arrays of valid C strings
    unsafe {
        libc::execve(
            plan.program.executable.as_ptr(),
            plan.argv.as_ptr(),
            plan.envp.as_ptr(),
        );
    }
    child_fail(error_fd, ChildStage::Exec, Errno::last_raw())
}

/// Spawns programs under a guard and hands back a [`LiveHandle`]
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Validate inputs, create the child and wait until it has replaced its image.
    pub fn launch(
        program: &ProgramDescriptor,
        io: &IoPlan,
        limits: &LimitPolicy,
        guard: &GuardPolicy,
    ) -> Result<LiveHandle> {
        limits.validate()?;

        let resolved = program.resolve()?;
        let targets = io.open_targets()?;
        let identity = resolve_identity(program.identity())?;
        let seccomp = guard
            .seccomp_filter()
            .map(|filter| filter.compile())
            .transpose()?;
        let namespaces = guard.namespaces().for_caller(is_root());

        let (error_read, error_write) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| SandboxError::SpawnFailed(format!("error pipe: {}", e)))?;
        let sync = if namespaces.user {
            Some(
                pipe2(OFlag::O_CLOEXEC)
                    .map_err(|e| SandboxError::SpawnFailed(format!("sync pipe: {}", e)))?,
            )
        } else {
            None
        };

        let plan = ChildPlan {
            program: &resolved,
            argv: null_terminated(&resolved.argv),
            envp: null_terminated(&resolved.envp),
            targets: &targets,
            rlimits: RlimitConfig::from_policy(limits),
            identity,
            seccomp,
            error_fd: error_write.as_raw_fd(),
            sync_fds: sync
                .as_ref()
                .map(|(read, write)| (read.as_raw_fd(), write.as_raw_fd())),
            parent_pid: (!namespaces.pid).then(|| std::process::id() as libc::pid_t),
        };

        let flags = namespaces.to_clone_flags();
        let mut stack = vec![0u8; CHILD_STACK_SIZE];
        let started = Instant::now();
        // SAFETY: the child runs only child_main, which never returns
        let cloned = unsafe {
            clone(
                Box::new(|| -> isize { child_main(&plan) }),
                &mut stack,
                flags,
                Some(Signal::SIGCHLD as libc::c_int),
            )
        };
        drop(error_write);

        let pid = cloned.map_err(|errno| clone_error(errno, flags))?;
        let mut handle = LiveHandle::new(pid, started);
        debug!(
            "cloned {} as {} with {} namespace(s)",
            resolved.path().display(),
            pid,
            namespaces.enabled_count()
        );

        if let Some((sync_read, sync_write)) = sync {
            drop(sync_read);
            Self::release_child(&handle, &namespaces, sync_write)?;
        }

        let mut report = Vec::with_capacity(8);
        if let Err(e) = File::from(error_read).read_to_end(&mut report) {
            handle.signal(Signal::SIGKILL);
            let _ = handle.reap();
            return Err(SandboxError::SpawnFailed(format!(
                "{}: reading setup report failed: {}",
                resolved.name(),
                e
            )));
        }
        if report.is_empty() {
            return Ok(handle);
        }

        let _ = handle.reap();
        Err(decode_child_error(&report, resolved.name()))
    }

    /// Write the id maps for a child in a new user namespace, then let it run
    fn release_child(
        handle: &LiveHandle,
        namespaces: &NamespaceConfig,
        sync_write: OwnedFd,
    ) -> Result<()> {
        debug_assert!(namespaces.user);
        setup_user_namespace(handle.pid(), get_uid(), get_gid())?;
        File::from(sync_write)
            .write_all(&[1])
            .map_err(|e| SandboxError::GuardApplyFailed(format!("releasing child: {}", e)))
    }
}

fn clone_error(errno: Errno, flags: CloneFlags) -> SandboxError {
    let namespace_refusal = matches!(
        errno,
        Errno::EPERM | Errno::EINVAL | Errno::ENOSPC | Errno::EUSERS
    );
    if !flags.is_empty() && namespace_refusal {
        SandboxError::GuardApplyFailed(format!("creating namespaces {:?}: {}", flags, errno))
    } else {
        SandboxError::SpawnFailed(format!("clone failed: {}", errno))
    }
}

fn decode_child_error(report: &[u8], program: &str) -> SandboxError {
    if report.len() != 8 {
        return SandboxError::SpawnFailed(format!(
            "{}: malformed setup report ({} bytes)",
            program,
            report.len()
        ));
    }

    let mut stage = [0u8; 4];
    let mut errno = [0u8; 4];
    stage.copy_from_slice(&report[..4]);
    errno.copy_from_slice(&report[4..]);

    match ChildStage::from_code(u32::from_le_bytes(stage)) {
        Some(stage) => stage.into_error(Errno::from_raw(i32::from_le_bytes(errno)), program),
        None => SandboxError::SpawnFailed(format!("{}: unknown setup stage", program)),
    }
}
