//! Resource layer: ceilings and the kernel rlimit backstop

pub mod limits;
pub mod rlimit;

pub use limits::{CoarseLimits, LimitPolicy};
pub use rlimit::RlimitConfig;
