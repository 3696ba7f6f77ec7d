//! Process monitoring via /proc
//!
//! Samples wall time, CPU time and peak resident memory of a running child
//! and reports the first ceiling it breaches.

use std::fs;
use std::time::{Duration, Instant};

use log::debug;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SandboxError};
use crate::execution::{ExitReport, LiveHandle};
use crate::resources::LimitPolicy;
use crate::result::KillReason;

/// Default time between two samples
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(10);

/// Process statistics snapshot
#[derive(Debug, Clone)]
pub struct ProcessStats {
    /// CPU time in milliseconds, including waited-for children
    pub cpu_time_ms: u64,
    /// Resident set size in bytes
    pub rss_bytes: u64,
    /// Peak resident set size in bytes (VmHWM, or RSS when unavailable)
    pub peak_rss_bytes: u64,
}

impl ProcessStats {
    /// Read stats for `pid` from /proc
    pub fn from_proc(pid: i32) -> Result<Self> {
        let stat_path = format!("/proc/{}/stat", pid);
        let stat_content = fs::read_to_string(&stat_path).map_err(|e| {
            SandboxError::ProcessMonitoring(format!("Failed to read {}: {}", stat_path, e))
        })?;

        let mut stats = Self::parse_stat(pid, &stat_content)?;

        let status_content = fs::read_to_string(format!("/proc/{}/status", pid)).unwrap_or_default();
        stats.peak_rss_bytes = parse_status_kb(&status_content, "VmHWM:")
            .map(|kb| kb * 1024)
            .unwrap_or(stats.rss_bytes)
            .max(stats.rss_bytes);

        Ok(stats)
    }

    /// Parse the contents of /proc/<pid>/stat.
    ///
    /// The command name may contain spaces and parentheses, so fields are
    /// counted from the last `)`.
    fn parse_stat(pid: i32, content: &str) -> Result<Self> {
        let invalid = |what: &str| SandboxError::ProcessMonitoring(format!("Invalid {} in /proc/{}/stat", what, pid));

        let after_comm = content
            .rfind(')')
            .map(|idx| &content[idx + 1..])
            .ok_or_else(|| invalid("format"))?;
        // Index 0 is field 3 (state) of proc(5)
        let parts: Vec<&str> = after_comm.split_whitespace().collect();
        if parts.len() < 22 {
            return Err(invalid("format"));
        }

        let field = |idx: usize, name: &str| -> Result<u64> {
            parts[idx].parse().map_err(|_| invalid(name))
        };

        let ticks = field(11, "utime")? + field(12, "stime")? + field(13, "cutime")? + field(14, "cstime")?;
        let rss_pages = field(21, "rss")?;

        let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        let cpu_time_ms = if clk_tck > 0 {
            ticks * 1000 / clk_tck as u64
        } else {
            0
        };

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) }.max(0) as u64;
        let rss_bytes = rss_pages * page_size;

        Ok(ProcessStats {
            cpu_time_ms,
            rss_bytes,
            peak_rss_bytes: rss_bytes,
        })
    }
}

fn parse_status_kb(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// Resources consumed by one invocation.
///
/// Every field only ever grows while the child runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Elapsed wall-clock time in milliseconds
    pub wall_time_ms: u64,
    /// User + system CPU time in milliseconds
    pub cpu_time_ms: u64,
    /// Peak resident memory in bytes
    pub peak_memory_bytes: u64,
}

impl ResourceUsage {
    /// Field-wise maximum
    pub fn merge(self, other: ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            wall_time_ms: self.wall_time_ms.max(other.wall_time_ms),
            cpu_time_ms: self.cpu_time_ms.max(other.cpu_time_ms),
            peak_memory_bytes: self.peak_memory_bytes.max(other.peak_memory_bytes),
        }
    }

    /// Usage as the kernel reported it when the child was reaped
    pub fn from_exit(report: &ExitReport) -> ResourceUsage {
        ResourceUsage {
            wall_time_ms: report.wall_time_ms,
            cpu_time_ms: report.cpu_time_ms,
            peak_memory_bytes: report.max_rss_bytes,
        }
    }
}

/// One step of the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Usage within every ceiling
    Sample(ResourceUsage),
    /// A ceiling was exceeded; the stream ends here
    Breach {
        reason: KillReason,
        usage: ResourceUsage,
    },
}

/// Samples a child's usage against a [`LimitPolicy`].
///
/// Each call to `next` takes one sample. Sampling never blocks; the caller
/// paces calls using [`ResourceMonitor::next_wait`].
#[derive(Debug)]
pub struct ResourceMonitor {
    pid: Pid,
    started: Instant,
    limits: LimitPolicy,
    interval: Duration,
    last: ResourceUsage,
    failed_samples: u64,
    done: bool,
}

impl ResourceMonitor {
    /// Monitor a launched child
    pub fn watch(handle: &LiveHandle, limits: LimitPolicy, interval: Duration) -> Self {
        Self::new(handle.pid(), handle.started(), limits, interval)
    }

    pub fn new(pid: Pid, started: Instant, limits: LimitPolicy, interval: Duration) -> Self {
        Self {
            pid,
            started,
            limits,
            interval: interval.max(Duration::from_millis(1)),
            last: ResourceUsage::default(),
            failed_samples: 0,
            done: false,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// How long to wait before the next sample.
    ///
    /// Never longer than the interval, and shortened so the next sample lands
    /// just past the wall-time deadline.
    pub fn next_wait(&self) -> Duration {
        match self.limits.wall_deadline() {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(self.started.elapsed());
                self.interval
                    .min(remaining + Duration::from_millis(1))
            }
            None => self.interval,
        }
    }

    /// Last usage observed
    pub fn last_usage(&self) -> ResourceUsage {
        self.last
    }

    /// Number of /proc reads that failed so far
    pub fn failed_samples(&self) -> u64 {
        self.failed_samples
    }

    /// Stop sampling and return the last observed usage
    pub fn stop(mut self) -> ResourceUsage {
        self.done = true;
        self.last
    }

    fn sample(&mut self) -> ResourceUsage {
        let mut usage = self.last;
        usage.wall_time_ms = usage
            .wall_time_ms
            .max(self.started.elapsed().as_millis() as u64);

        match ProcessStats::from_proc(self.pid.as_raw()) {
            Ok(stats) => {
                usage.cpu_time_ms = usage.cpu_time_ms.max(stats.cpu_time_ms);
                usage.peak_memory_bytes = usage.peak_memory_bytes.max(stats.peak_rss_bytes);
            }
            Err(e) => {
                // Retried at the next tick; wall time is still enforced
                self.failed_samples += 1;
                debug!("sample {} of {} failed: {}", self.failed_samples, self.pid, e);
            }
        }

        self.last = usage;
        usage
    }
}

impl Iterator for ResourceMonitor {
    type Item = MonitorEvent;

    fn next(&mut self) -> Option<MonitorEvent> {
        if self.done {
            return None;
        }

        let usage = self.sample();
        match self.limits.breached_by(&usage) {
            Some(reason) => {
                self.done = true;
                Some(MonitorEvent::Breach { reason, usage })
            }
            None => Some(MonitorEvent::Sample(usage)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_with_spaces_in_comm() {
        let line = "1234 (my (odd) prog) R 1 1234 1234 0 -1 4194304 100 0 0 0 \
                    250 50 10 5 20 0 3 0 12345 1000000 256 18446744073709551615";
        let stats = ProcessStats::parse_stat(1234, line).unwrap();
        let clk = unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as u64;
        assert_eq!(stats.cpu_time_ms, 315 * 1000 / clk);
        assert!(stats.rss_bytes >= 256 * 4096);
    }

    #[test]
    fn test_parse_stat_rejects_garbage() {
        assert!(ProcessStats::parse_stat(1, "garbage").is_err());
        assert!(ProcessStats::parse_stat(1, "1 (x) R 1 2").is_err());
    }

    #[test]
    fn test_parse_status_kb() {
        let status = "Name:\tcat\nVmHWM:\t    2048 kB\nVmRSS:\t1024 kB\n";
        assert_eq!(parse_status_kb(status, "VmHWM:"), Some(2048));
        assert_eq!(parse_status_kb(status, "VmSwap:"), None);
    }

    #[test]
    fn test_process_stats_for_self() {
        let pid = std::process::id() as i32;
        let stats = ProcessStats::from_proc(pid).unwrap();
        assert!(stats.rss_bytes > 0);
        assert!(stats.peak_rss_bytes >= stats.rss_bytes);
    }

    #[test]
    fn test_usage_merge_is_fieldwise_max() {
        let a = ResourceUsage {
            wall_time_ms: 10,
            cpu_time_ms: 50,
            peak_memory_bytes: 1,
        };
        let b = ResourceUsage {
            wall_time_ms: 20,
            cpu_time_ms: 5,
            peak_memory_bytes: 7,
        };
        let merged = a.merge(b);
        assert_eq!(merged.wall_time_ms, 20);
        assert_eq!(merged.cpu_time_ms, 50);
        assert_eq!(merged.peak_memory_bytes, 7);
    }

    #[test]
    fn monitor_samples_are_monotonic() {
        let me = Pid::from_raw(std::process::id() as i32);
        let monitor = ResourceMonitor::new(
            me,
            Instant::now(),
            LimitPolicy::unlimited(),
            Duration::from_millis(1),
        );

        let mut previous = ResourceUsage::default();
        for event in monitor.take(20) {
            let MonitorEvent::Sample(usage) = event else {
                panic!("unlimited policy breached: {:?}", event);
            };
            assert_eq!(usage.merge(previous), usage);
            previous = usage;
        }
    }

    #[test]
    fn monitor_reports_wall_breach_even_when_proc_is_unreadable() {
        let gone = Pid::from_raw(999_999_999);
        let limits = LimitPolicy::unlimited().wall_time(Duration::from_millis(20));
        let mut monitor = ResourceMonitor::new(
            gone,
            Instant::now() - Duration::from_millis(50),
            limits,
            Duration::from_millis(5),
        );

        match monitor.next() {
            Some(MonitorEvent::Breach { reason, usage }) => {
                assert_eq!(reason, KillReason::WallTimeExceeded);
                assert!(usage.wall_time_ms > 20);
            }
            other => panic!("expected a breach, got {:?}", other),
        }
        assert_eq!(monitor.failed_samples(), 1);
        assert!(monitor.next().is_none());
    }

    #[test]
    fn memory_breach_on_own_process() {
        let me = Pid::from_raw(std::process::id() as i32);
        let limits = LimitPolicy::unlimited().memory(1);
        let mut monitor =
            ResourceMonitor::new(me, Instant::now(), limits, DEFAULT_SAMPLE_INTERVAL);
        assert!(matches!(
            monitor.next(),
            Some(MonitorEvent::Breach {
                reason: KillReason::MemoryExceeded,
                ..
            })
        ));
    }

    #[test]
    fn next_wait_is_clamped_to_deadline() {
        let me = Pid::from_raw(std::process::id() as i32);
        let limits = LimitPolicy::unlimited().wall_time(Duration::from_millis(100));
        let monitor = ResourceMonitor::new(
            me,
            Instant::now() - Duration::from_millis(98),
            limits,
            Duration::from_millis(50),
        );
        assert!(monitor.next_wait() <= Duration::from_millis(3));

        let unlimited = ResourceMonitor::new(
            me,
            Instant::now(),
            LimitPolicy::unlimited(),
            Duration::from_millis(50),
        );
        assert_eq!(unlimited.next_wait(), Duration::from_millis(50));
    }
}
