use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, System};

pub(crate) const MB: f64 = 1024.0 * 1024.0;

/// Point-in-time view of process and system memory. Never cached.
#[derive(Debug, Clone, Serialize)]
pub struct MemorySnapshot {
    pub process_rss_bytes: u64,
    /// Process RSS as a percentage of total system memory.
    pub process_percent: f64,
    pub system_total_bytes: u64,
    pub system_available_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

impl MemorySnapshot {
    pub fn new(process_rss_bytes: u64, system_total_bytes: u64, system_available_bytes: u64) -> Self {
        let process_percent = if system_total_bytes == 0 {
            0.0
        } else {
            process_rss_bytes as f64 / system_total_bytes as f64 * 100.0
        };
        Self {
            process_rss_bytes,
            process_percent,
            system_total_bytes,
            system_available_bytes: system_available_bytes.min(system_total_bytes),
            timestamp: Utc::now(),
        }
    }

    /// Share of system memory in use: `(total - available) / total`.
    pub fn system_used_percent(&self) -> f64 {
        if self.system_total_bytes == 0 {
            return 0.0;
        }
        let used = self.system_total_bytes - self.system_available_bytes;
        used as f64 / self.system_total_bytes as f64 * 100.0
    }

    pub fn process_rss_mb(&self) -> f64 {
        self.process_rss_bytes as f64 / MB
    }

    pub fn system_available_mb(&self) -> f64 {
        self.system_available_bytes as f64 / MB
    }
}

/// Source of memory readings. Swapped for a scripted probe in tests.
pub trait MemoryProbe: Send {
    fn snapshot(&mut self) -> MemorySnapshot;
}

/// Reads the live machine through `sysinfo`.
pub struct SystemProbe {
    system: System,
    pid: Option<Pid>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemProbe {
    fn snapshot(&mut self) -> MemorySnapshot {
        self.system.refresh_memory();
        let rss = match self.pid {
            Some(pid) => {
                self.system.refresh_process(pid);
                self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => 0,
        };
        MemorySnapshot::new(
            rss,
            self.system.total_memory(),
            self.system.available_memory(),
        )
    }
}

/// Probe that reports whatever its handle was last told.
///
/// Clones share state, so a test can keep one handle and move another
/// into the monitor.
#[derive(Debug, Clone)]
pub struct ManualProbe {
    state: Arc<Mutex<ManualReading>>,
}

#[derive(Debug, Clone, Copy)]
struct ManualReading {
    rss: u64,
    total: u64,
    available: u64,
}

impl ManualProbe {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualReading {
                rss: 0,
                total: total_bytes,
                available: total_bytes,
            })),
        }
    }

    pub fn set_used_percent(&self, percent: f64) {
        if let Ok(mut s) = self.state.lock() {
            let used = (s.total as f64 * percent.clamp(0.0, 100.0) / 100.0) as u64;
            s.available = s.total - used.min(s.total);
        }
    }

    pub fn set_rss(&self, bytes: u64) {
        if let Ok(mut s) = self.state.lock() {
            s.rss = bytes;
        }
    }
}

impl MemoryProbe for ManualProbe {
    fn snapshot(&mut self) -> MemorySnapshot {
        let r = self
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(ManualReading { rss: 0, total: 0, available: 0 });
        MemorySnapshot::new(r.rss, r.total, r.available)
    }
}
