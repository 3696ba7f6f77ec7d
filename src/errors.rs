//! Error types for sandboxed execution
//!
//! Every variant except [`SandboxError::Io`] and
//! [`SandboxError::ProcessMonitoring`] describes a failure that happened before
//! the program image was replaced. Runtime outcomes (exit, signal, kill) are
//! never errors; they are reported through [`crate::ExecutionResult`].

use std::io;
use thiserror::Error;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors that can occur while preparing or launching a sandboxed program
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid program: {0}")]
    InvalidProgram(String),

    #[error("I/O redirection failed: {0}")]
    IoRedirectFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Guard could not be applied: {0}")]
    GuardApplyFailed(String),

    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Process monitoring error: {0}")]
    ProcessMonitoring(String),
}

impl SandboxError {
    /// True when the error was raised before the program started running.
    ///
    /// Setup errors are never retried by the engine.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            SandboxError::InvalidProgram(_)
                | SandboxError::IoRedirectFailed(_)
                | SandboxError::PermissionDenied(_)
                | SandboxError::GuardApplyFailed(_)
                | SandboxError::SpawnFailed(_)
                | SandboxError::InvalidConfig(_)
        )
    }
}
