//! Isolation layer: Namespace + Seccomp filtering
//!
//! This module turns a [`GuardPolicy`] into the clone flags and the syscall
//! filter a sandboxed child is created with.
//!
//! # Features
//!
//! - **Namespaces**: Mount, PID, IPC, UTS, cgroup, network, and a user
//!   namespace for unprivileged callers
//! - **Seccomp**: default-allow deny list that kills the process on violation
//!
//! # Examples
//!
//! ```ignore
//! use sandbox_exec::isolation::GuardPolicy;
//!
//! let guard = GuardPolicy::from_legacy(true, true, false);
//! let filter = guard.seccomp_filter();
//! ```

pub mod guard;
pub mod namespace;
pub mod seccomp;

pub use guard::GuardPolicy;
pub use namespace::NamespaceConfig;
pub use seccomp::SeccompFilter;
