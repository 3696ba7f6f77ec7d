//! Monitoring layer: resource sampling of the sandboxed child
//!
//! # Features
//!
//! - **/proc-based sampling**: CPU time (including waited-for children) and
//!   peak resident memory
//! - **Wall clock**: measured from the launch timestamp, enforced even when
//!   /proc cannot be read
//! - **Breach detection**: wall, then CPU, then memory; first breach ends the stream
//!
//! # Examples
//!
//! ```ignore
//! use sandbox_exec::monitoring::{MonitorEvent, ResourceMonitor};
//!
//! let monitor = ResourceMonitor::watch(&handle, limits, interval);
//! for event in monitor {
//!     if let MonitorEvent::Breach { reason, .. } = event {
//!         println!("breached: {}", reason);
//!     }
//! }
//! ```

pub mod monitor;

pub use monitor::{
    MonitorEvent, ProcessStats, ResourceMonitor, ResourceUsage,
    DEFAULT_SAMPLE_INTERVAL,
};
