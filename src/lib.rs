//! sandbox-exec: supervised program execution
//!
//! Runs one program at a time under wall-clock, CPU-time and peak-memory
//! ceilings, optionally inside fresh namespaces and behind a seccomp deny
//! list, and reports how it ended together with the resources it used.
//!
//! # Modules
//!
//! - **execution**: Program resolution, stream redirection and process launch
//! - **isolation**: Guard policy, namespaces and the seccomp filter
//! - **resources**: Limit policy and the rlimit backstop
//! - **monitoring**: /proc sampling and breach detection
//! - **result**: Terminal states and execution results
//! - **controller**: Supervisor, `execute` and the request builder
//!
//! # Example
//!
//! ```ignore
//! use sandbox_exec::ExecutionBuilder;
//! use std::time::Duration;
//!
//! let result = ExecutionBuilder::new("/bin/echo")
//!     .arg("hello world")
//!     .wall_time(Duration::from_secs(1))
//!     .memory_limit_str("64M")?
//!     .run()?;
//! println!("{}", result.summary());
//! ```

// Core modules
pub mod errors;
pub mod utils;

// Layered modules
pub mod execution;
pub mod isolation;
pub mod monitoring;
pub mod resources;
pub mod result;

// Main controller
pub mod controller;

// Public API
pub use controller::{
    execute, execute_with, ExecutionBuilder, ExecutionRequest, Supervisor, SupervisorConfig,
    SupervisorState,
};
pub use errors::{Result, SandboxError};
pub use execution::{IoPlan, ProgramDescriptor};
pub use isolation::GuardPolicy;
pub use monitoring::ResourceUsage;
pub use resources::{CoarseLimits, LimitPolicy};
pub use result::{ExecutionResult, KillReason, Outcome};
