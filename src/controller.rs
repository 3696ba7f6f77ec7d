//! Supervisor: races natural exit against limit breaches
//!
//! One supervisor owns one [`LiveHandle`]. It waits on the child with a
//! timeout equal to the sampling interval, takes a monitor sample after each
//! wait and settles the outcome in a single-assignment [`TerminalSlot`].
//! Only the supervisor reaps the child, and it reaps last, so every signal it
//! sends targets a process whose pid is still reserved.

use std::cell::OnceCell;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SandboxError};
use crate::execution::{
    ExitReport, IoPlan, LiveHandle, ProcessLauncher, ProgramDescriptor, Termination,
};
use crate::isolation::GuardPolicy;
use crate::monitoring::{MonitorEvent, ResourceMonitor, ResourceUsage, DEFAULT_SAMPLE_INTERVAL};
use crate::resources::{CoarseLimits, LimitPolicy};
use crate::result::{ExecutionResult, KillReason, ResultBuilder, TerminalState};

/// Default time a child gets between SIGTERM and SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// Supervisor pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time between two resource samples
    pub sample_interval_ms: u64,
    /// Time between SIGTERM and SIGKILL on a breach
    pub grace_period_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL.as_millis() as u64,
            grace_period_ms: DEFAULT_GRACE_PERIOD.as_millis() as u64,
        }
    }
}

impl SupervisorConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_interval_ms == 0 {
            return Err(SandboxError::InvalidConfig(
                "sample interval must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Supervisor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    Running,
    Exited,
    Signaled,
    Killed,
    Completed,
}

/// Who ended the run: the child itself or the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Natural,
    Killed(KillReason),
}

/// Single-assignment cell for the verdict; the first writer wins
#[derive(Debug, Default)]
pub struct TerminalSlot {
    cell: OnceCell<Verdict>,
}

impl TerminalSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `verdict` unless one is already set. Returns whether it was stored.
    pub fn settle(&self, verdict: Verdict) -> bool {
        match self.cell.set(verdict) {
            Ok(()) => true,
            Err(rejected) => {
                debug!(
                    "ignoring {:?}, already settled as {:?}",
                    rejected,
                    self.cell.get()
                );
                false
            }
        }
    }

    pub fn get(&self) -> Option<Verdict> {
        self.cell.get().copied()
    }
}

/// Drives one child from launch to result
pub struct Supervisor {
    handle: LiveHandle,
    limits: LimitPolicy,
    config: SupervisorConfig,
    state: SupervisorState,
    slot: TerminalSlot,
}

impl Supervisor {
    pub fn new(handle: LiveHandle, limits: LimitPolicy, config: SupervisorConfig) -> Self {
        let mut supervisor = Self {
            handle,
            limits,
            config,
            state: SupervisorState::NotStarted,
            slot: TerminalSlot::new(),
        };
        supervisor.transition(SupervisorState::Running);
        supervisor
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!("supervisor {}: {:?} -> {:?}", self.handle.pid(), self.state, next);
        self.state = next;
    }

    /// Supervise until the child is gone and build the result
    pub fn run(mut self) -> ExecutionResult {
        let last_sample = self.supervise();
        self.complete(last_sample)
    }

    fn supervise(&mut self) -> ResourceUsage {
        let mut monitor =
            ResourceMonitor::watch(&self.handle, self.limits, self.config.sample_interval());

        loop {
            match self.handle.wait_timeout(monitor.next_wait()) {
                Ok(true) => {
                    self.slot.settle(Verdict::Natural);
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("lost track of {}: {}", self.handle.pid(), e);
                    self.enforce(KillReason::ExternallyRequested);
                    break;
                }
            }

            if let Some(MonitorEvent::Breach { reason, usage }) = monitor.next() {
                debug!("{} breached: {} at {:?}", self.handle.pid(), reason, usage);
                self.enforce(reason);
                break;
            }
        }

        if monitor.failed_samples() > 0 {
            debug!(
                "{} of the samples for {} could not be read",
                monitor.failed_samples(),
                self.handle.pid()
            );
        }
        monitor.stop()
    }

    /// Terminate the child for `reason` unless it already exited on its own.
    ///
    /// SIGTERM to the group, a grace window, then SIGKILL.
    fn enforce(&mut self, reason: KillReason) {
        match self.handle.has_exited() {
            Ok(true) => {
                self.slot.settle(Verdict::Natural);
                return;
            }
            Ok(false) => {}
            Err(e) => debug!("exit check before kill failed: {}", e),
        }

        self.slot.settle(Verdict::Killed(reason));
        self.handle.signal(Signal::SIGTERM);
        if let Ok(true) = self.handle.wait_timeout(self.config.grace_period()) {
            return;
        }

        warn!(
            "{} still alive after {:?}, sending SIGKILL",
            self.handle.pid(),
            self.config.grace_period()
        );
        self.handle.signal(Signal::SIGKILL);
        if let Err(e) = self.handle.wait_exit() {
            warn!("waiting for {} after SIGKILL failed: {}", self.handle.pid(), e);
        }
    }

    /// Sweep the process group, reap, and build the result
    fn complete(&mut self, last_sample: ResourceUsage) -> ExecutionResult {
        // The child is at most a zombie here, so its pgid cannot be recycled
        self.handle.signal(Signal::SIGKILL);

        let report = match self.handle.reap() {
            Ok(report) => report,
            Err(e) => {
                warn!("reaping {} failed: {}", self.handle.pid(), e);
                ExitReport {
                    termination: Termination::Vanished,
                    cpu_time_ms: 0,
                    max_rss_bytes: 0,
                    wall_time_ms: last_sample.wall_time_ms,
                }
            }
        };

        let terminal = match (self.slot.get(), report.termination) {
            (Some(Verdict::Killed(reason)), _) => TerminalState::Killed { reason },
            (_, Termination::Exited(code)) => TerminalState::Exited { code: Some(code) },
            (_, Termination::Signaled(signal)) => TerminalState::Signaled { signal },
            (_, Termination::Vanished) => TerminalState::Exited { code: None },
        };
        self.transition(match terminal {
            TerminalState::Exited { .. } => SupervisorState::Exited,
            TerminalState::Signaled { .. } => SupervisorState::Signaled,
            TerminalState::Killed { .. } => SupervisorState::Killed,
        });

        let usage = last_sample.merge(ResourceUsage::from_exit(&report));
        let result = ResultBuilder::build(terminal, usage);
        self.transition(SupervisorState::Completed);
        result
    }
}

/// Run `program` under the given plan, limits and guard, blocking until it ends.
///
/// Setup failures are returned as errors. Anything that happens after the
/// program started is described by the [`ExecutionResult`].
pub fn execute(
    program: &ProgramDescriptor,
    io: &IoPlan,
    limits: &LimitPolicy,
    guard: &GuardPolicy,
) -> Result<ExecutionResult> {
    execute_with(program, io, limits, guard, &SupervisorConfig::default())
}

/// [`execute`] with explicit supervisor pacing
pub fn execute_with(
    program: &ProgramDescriptor,
    io: &IoPlan,
    limits: &LimitPolicy,
    guard: &GuardPolicy,
    config: &SupervisorConfig,
) -> Result<ExecutionResult> {
    config.validate()?;
    let handle = ProcessLauncher::launch(program, io, limits, guard)?;
    info!("supervising {} as pid {}", program.path, handle.pid());

    let result = Supervisor::new(handle, *limits, *config).run();
    info!("{}: {}", program.path, result.summary());
    Ok(result)
}

/// Everything needed for one execution, loadable from JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionRequest {
    pub program: ProgramDescriptor,
    pub io: IoPlan,
    pub limits: LimitPolicy,
    pub guard: GuardPolicy,
    pub supervisor: SupervisorConfig,
}

impl ExecutionRequest {
    pub fn new(program: ProgramDescriptor) -> Self {
        Self {
            program,
            ..Self::default()
        }
    }

    /// Parse a request from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SandboxError::InvalidConfig(format!("invalid request: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.program.path.trim().is_empty() {
            return Err(SandboxError::InvalidProgram(
                "program path is empty".to_string(),
            ));
        }
        self.limits.validate()?;
        self.supervisor.validate()
    }

    pub fn run(&self) -> Result<ExecutionResult> {
        self.validate()?;
        execute_with(
            &self.program,
            &self.io,
            &self.limits,
            &self.guard,
            &self.supervisor,
        )
    }
}

/// Builder pattern for execution requests
pub struct ExecutionBuilder {
    request: ExecutionRequest,
}

impl ExecutionBuilder {
    /// Create new builder for `program`
    pub fn new(program: &str) -> Self {
        Self {
            request: ExecutionRequest::new(ProgramDescriptor::new(program)),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.request.program = self.request.program.arg(arg);
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.request.program = self.request.program.args(args);
        self
    }

    /// Append whitespace-separated arguments
    pub fn arg_string(mut self, raw: &str) -> Self {
        self.request.program = self.request.program.arg_string(raw);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.request.program = self.request.program.working_dir(dir);
        self
    }

    pub fn run_as(mut self, user: &str) -> Self {
        self.request.program = self.request.program.run_as(user);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.request.program = self.request.program.env(key, value);
        self
    }

    pub fn stdin(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.request.io = self.request.io.stdin(path);
        self
    }

    pub fn stdout(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.request.io = self.request.io.stdout(path);
        self
    }

    pub fn stderr(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.request.io = self.request.io.stderr(path);
        self
    }

    pub fn merge_stderr(mut self) -> Self {
        self.request.io = self.request.io.merge_stderr();
        self
    }

    /// Set wall-clock limit
    pub fn wall_time(mut self, limit: Duration) -> Self {
        self.request.limits = self.request.limits.wall_time(limit);
        self
    }

    /// Set CPU time limit
    pub fn cpu_time(mut self, limit: Duration) -> Self {
        self.request.limits = self.request.limits.cpu_time(limit);
        self
    }

    /// Set memory limit
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.request.limits = self.request.limits.memory(bytes);
        self
    }

    /// Set memory limit from string (e.g., "100M")
    pub fn memory_limit_str(mut self, s: &str) -> Result<Self> {
        self.request.limits = self.request.limits.memory_str(s)?;
        Ok(self)
    }

    /// Also install kernel rlimits
    pub fn coarse_limits(mut self, coarse: CoarseLimits) -> Self {
        self.request.limits = self.request.limits.with_coarse_limits(coarse);
        self
    }

    pub fn guard(mut self, guard: GuardPolicy) -> Self {
        self.request.guard = guard;
        self
    }

    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.request.supervisor.sample_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.request.supervisor.grace_period_ms = grace.as_millis() as u64;
        self
    }

    /// Build the request
    pub fn build(self) -> Result<ExecutionRequest> {
        self.request.validate()?;
        Ok(self.request)
    }

    /// Build and run
    pub fn run(self) -> Result<ExecutionResult> {
        self.build()?.run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Outcome;
    use crate::test_support::serial_guard;
    use std::time::Instant;

    fn launch(program: ProgramDescriptor, limits: &LimitPolicy) -> LiveHandle {
        ProcessLauncher::launch(&program, &IoPlan::inherit(), limits, &GuardPolicy::disabled())
            .unwrap()
    }

    #[test]
    fn terminal_slot_first_writer_wins() {
        let slot = TerminalSlot::new();
        assert!(slot.get().is_none());
        assert!(slot.settle(Verdict::Natural));
        assert!(!slot.settle(Verdict::Killed(KillReason::WallTimeExceeded)));
        assert_eq!(slot.get(), Some(Verdict::Natural));
    }

    #[test]
    fn terminal_slot_keeps_first_kill_reason() {
        let slot = TerminalSlot::new();
        assert!(slot.settle(Verdict::Killed(KillReason::CpuTimeExceeded)));
        assert!(!slot.settle(Verdict::Natural));
        assert_eq!(
            slot.get(),
            Some(Verdict::Killed(KillReason::CpuTimeExceeded))
        );
    }

    #[test]
    fn test_supervisor_config_defaults() {
        let config = SupervisorConfig::default();
        assert_eq!(config.sample_interval(), Duration::from_millis(10));
        assert_eq!(config.grace_period(), Duration::from_millis(100));
        assert!(config.validate().is_ok());

        let bad = SupervisorConfig {
            sample_interval_ms: 0,
            ..config
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_builder_collects_request() {
        let request = ExecutionBuilder::new("/bin/echo")
            .arg("hello")
            .arg_string("big   world")
            .wall_time(Duration::from_secs(2))
            .cpu_time(Duration::from_millis(500))
            .memory_limit_str("64M")
            .unwrap()
            .merge_stderr()
            .guard(GuardPolicy::from_legacy(true, true, false))
            .sample_interval(Duration::from_millis(5))
            .build()
            .unwrap();

        assert_eq!(request.program.args, vec!["hello", "big", "world"]);
        assert_eq!(request.limits.wall_time_ms, 2000);
        assert_eq!(request.limits.cpu_time_ms, 500);
        assert_eq!(request.limits.memory_bytes, 64 * 1024 * 1024);
        assert!(request.io.redirect && request.io.merge_stderr);
        assert!(request.guard.seccomp_deny_common);
        assert_eq!(request.supervisor.sample_interval_ms, 5);
    }

    #[test]
    fn test_builder_rejects_empty_program() {
        let err = ExecutionBuilder::new("").build().unwrap_err();
        assert!(matches!(err, SandboxError::InvalidProgram(_)));
    }

    #[test]
    fn test_request_from_json() {
        let request = ExecutionRequest::from_json(
            r#"{
                "program": {"path": "/bin/echo", "args": ["hi"]},
                "limits": {"wall_time_ms": 1000, "memory_bytes": 1048576},
                "guard": {"seccomp_enabled": true}
            }"#,
        )
        .unwrap();
        assert_eq!(request.program.path, "/bin/echo");
        assert!(request.program.inherit_env);
        assert_eq!(request.limits.wall_time_ms, 1000);
        assert!(request.guard.seccomp_enabled);
        assert_eq!(request.supervisor, SupervisorConfig::default());

        assert!(matches!(
            ExecutionRequest::from_json("{not json"),
            Err(SandboxError::InvalidConfig(_))
        ));
    }

    #[test]
    fn supervisor_reports_natural_exit() {
        let _guard = serial_guard();
        let limits = LimitPolicy::unlimited();
        let handle = launch(ProgramDescriptor::new("/bin/sh").args(["-c", "exit 7"]), &limits);
        let supervisor = Supervisor::new(handle, limits, SupervisorConfig::default());
        assert_eq!(supervisor.state(), SupervisorState::Running);

        let result = supervisor.run();
        assert_eq!(result.outcome, Outcome::Exited);
        assert_eq!(result.exit_code, Some(7));
        assert!(!result.is_killed);
    }

    #[test]
    fn natural_exit_wins_over_late_breach() {
        let _guard = serial_guard();
        let limits = LimitPolicy::unlimited();
        let mut handle = launch(ProgramDescriptor::new("/bin/sh").args(["-c", "exit 0"]), &limits);
        handle.wait_exit().unwrap();

        let mut supervisor = Supervisor::new(handle, limits, SupervisorConfig::default());
        supervisor.enforce(KillReason::WallTimeExceeded);
        assert_eq!(supervisor.slot.get(), Some(Verdict::Natural));

        let result = supervisor.complete(ResourceUsage::default());
        assert_eq!(result.outcome, Outcome::Exited);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.kill_reason.is_none());
        assert_eq!(supervisor.state(), SupervisorState::Completed);
    }

    #[test]
    fn breach_kills_within_grace() {
        let _guard = serial_guard();
        let limits = LimitPolicy::unlimited().wall_time(Duration::from_millis(100));
        let handle = launch(ProgramDescriptor::new("/bin/sleep").arg("30"), &limits);

        let start = Instant::now();
        let result = Supervisor::new(handle, limits, SupervisorConfig::default()).run();
        assert_eq!(result.outcome, Outcome::Killed);
        assert_eq!(result.kill_reason, Some(KillReason::WallTimeExceeded));
        assert!(result.usage.wall_time_ms > 100);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn sigterm_ignoring_child_gets_sigkill() {
        let _guard = serial_guard();
        let limits = LimitPolicy::unlimited().wall_time(Duration::from_millis(50));
        let handle = launch(
            ProgramDescriptor::new("/bin/sh").args(["-c", "trap '' TERM; while :; do :; done"]),
            &limits,
        );
        let config = SupervisorConfig {
            grace_period_ms: 30,
            ..SupervisorConfig::default()
        };

        let result = Supervisor::new(handle, limits, config).run();
        assert_eq!(result.kill_reason, Some(KillReason::WallTimeExceeded));
        assert!(result.is_killed);
    }
}
