//! Execution results
//!
//! [`ResultBuilder::build`] is the single place where a terminal state and the
//! final usage become an [`ExecutionResult`]. It is pure and total: every
//! terminal state maps to exactly one outcome.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::monitoring::ResourceUsage;

/// Why the engine terminated the child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KillReason {
    WallTimeExceeded,
    CpuTimeExceeded,
    MemoryExceeded,
    /// The supervisor could no longer observe the child and stopped it
    ExternallyRequested,
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            KillReason::WallTimeExceeded => "wall time limit exceeded",
            KillReason::CpuTimeExceeded => "cpu time limit exceeded",
            KillReason::MemoryExceeded => "memory limit exceeded",
            KillReason::ExternallyRequested => "terminated by supervisor",
        };
        f.write_str(text)
    }
}

/// How the child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Exited,
    Signaled,
    Killed,
}

/// The state a supervisor settles on exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Normal exit; `None` when the status could not be collected
    Exited { code: Option<i32> },
    /// Terminated by a signal the engine did not send
    Signaled { signal: i32 },
    /// Terminated by the engine
    Killed { reason: KillReason },
}

/// Result of one sandboxed execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    /// Exit code, only for [`Outcome::Exited`] with a known status
    pub exit_code: Option<i32>,
    /// Terminating signal, only for [`Outcome::Signaled`]
    pub exit_signal: Option<i32>,
    pub is_killed: bool,
    pub kill_reason: Option<KillReason>,
    pub usage: ResourceUsage,
}

impl ExecutionResult {
    /// Exited with code 0
    pub fn success(&self) -> bool {
        self.outcome == Outcome::Exited && self.exit_code == Some(0)
    }

    /// Killed by the syscall filter (SIGSYS)
    pub fn guard_violation(&self) -> bool {
        self.outcome == Outcome::Signaled && self.exit_signal == Some(libc::SIGSYS)
    }

    /// Human-readable one-line summary
    pub fn summary(&self) -> String {
        match (self.outcome, self.kill_reason) {
            (Outcome::Killed, Some(reason)) => format!("killed: {}", reason),
            (Outcome::Signaled, _) if self.guard_violation() => {
                "killed by syscall filter (SIGSYS)".to_string()
            }
            (Outcome::Signaled, _) => format!(
                "terminated by signal {}",
                self.exit_signal.unwrap_or_default()
            ),
            _ => match self.exit_code {
                Some(code) => format!("exited with code {}", code),
                None => "exited with unknown status".to_string(),
            },
        }
    }
}

/// Assembles results from terminal states
pub struct ResultBuilder;

impl ResultBuilder {
    pub fn build(state: TerminalState, usage: ResourceUsage) -> ExecutionResult {
        match state {
            TerminalState::Exited { code } => ExecutionResult {
                outcome: Outcome::Exited,
                exit_code: code,
                exit_signal: None,
                is_killed: false,
                kill_reason: None,
                usage,
            },
            TerminalState::Signaled { signal } => ExecutionResult {
                outcome: Outcome::Signaled,
                exit_code: None,
                exit_signal: Some(signal),
                is_killed: false,
                kill_reason: None,
                usage,
            },
            TerminalState::Killed { reason } => ExecutionResult {
                outcome: Outcome::Killed,
                exit_code: None,
                exit_signal: None,
                is_killed: true,
                kill_reason: Some(reason),
                usage,
            },
        }
    }
}
