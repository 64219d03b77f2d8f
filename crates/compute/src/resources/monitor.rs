use batchwise_core::config::MemoryConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BatchError, Result};
use crate::observer::{BatchEvent, SharedObserver, TracingObserver};

use super::probe::{MemoryProbe, MemorySnapshot, SystemProbe, MB};

/// Memory pressure level, classified on system memory usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

/// Classify a system-usage percentage against the configured thresholds.
pub fn assess_pressure(used_percent: f64, config: &MemoryConfig) -> PressureLevel {
    if used_percent >= config.critical_percent {
        PressureLevel::Critical
    } else if used_percent >= config.warning_percent {
        PressureLevel::Warning
    } else {
        PressureLevel::Normal
    }
}

/// Before/after figures of one cleanup pass. `freed_mb` may be negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CleanupReport {
    pub before_mb: f64,
    pub after_mb: f64,
    pub freed_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemorySummary {
    pub baseline_mb: f64,
    pub current_mb: f64,
    pub peak_mb: f64,
    pub delta_mb: f64,
    pub operations_tracked: u64,
    pub system_percent: f64,
    pub system_available_mb: f64,
}

/// Callback run on every cleanup pass, e.g. to drop in-memory caches.
pub type CleanupHook = Box<dyn Fn() + Send + Sync>;

/// Watches process and system memory for the batch collector.
///
/// Owned by the completion-collection loop: every counter is mutated
/// through `&mut self`, so there is exactly one writer.
pub struct MemoryMonitor {
    config: MemoryConfig,
    probe: Box<dyn MemoryProbe>,
    observer: SharedObserver,
    hooks: Vec<CleanupHook>,
    baseline_bytes: u64,
    peak_bytes: u64,
    operations: u64,
    last_level: PressureLevel,
}

impl MemoryMonitor {
    /// Monitor the live system.
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_probe(config, Box::new(SystemProbe::new()))
    }

    pub fn with_probe(config: MemoryConfig, mut probe: Box<dyn MemoryProbe>) -> Self {
        let baseline = probe.snapshot();
        debug!(
            baseline_mb = baseline.process_rss_mb(),
            system_percent = baseline.system_used_percent(),
            "Memory monitor initialized"
        );
        Self {
            config,
            probe,
            observer: TracingObserver::shared(),
            hooks: Vec::new(),
            baseline_bytes: baseline.process_rss_bytes,
            peak_bytes: baseline.process_rss_bytes,
            operations: 0,
            last_level: PressureLevel::Normal,
        }
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Register a callback run on every cleanup pass.
    pub fn add_cleanup_hook(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.push(Box::new(hook));
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn operations(&self) -> u64 {
        self.operations
    }

    /// Take a fresh reading and update the peak.
    pub fn snapshot(&mut self) -> MemorySnapshot {
        let snap = self.probe.snapshot();
        self.peak_bytes = self.peak_bytes.max(snap.process_rss_bytes);
        snap
    }

    pub fn classify(&self, snapshot: &MemorySnapshot) -> PressureLevel {
        assess_pressure(snapshot.system_used_percent(), &self.config)
    }

    /// Read and classify current memory.
    ///
    /// Reports pressure through the observer when the level rises, and
    /// with `raise_on_critical` turns `Critical` into a resource error.
    pub fn check(&mut self, raise_on_critical: bool) -> Result<(PressureLevel, MemorySnapshot)> {
        let snap = self.snapshot();
        let level = self.classify(&snap);
        let used_percent = snap.system_used_percent();

        if level > PressureLevel::Normal && level != self.last_level {
            self.observer.on_event(&BatchEvent::MemoryPressure { level, used_percent });
        }
        self.last_level = level;

        if raise_on_critical && level == PressureLevel::Critical {
            return Err(BatchError::ResourceExhausted { used_percent });
        }
        Ok((level, snap))
    }

    /// Count one completed operation; every `cleanup_frequency` operations
    /// a cleanup pass runs when auto-cleanup is on.
    pub fn track_operation(&mut self) -> Option<CleanupReport> {
        self.operations += 1;
        if self.config.auto_cleanup && self.operations % self.config.cleanup_frequency.max(1) as u64 == 0 {
            debug!(operations = self.operations, "Periodic memory cleanup");
            return Some(self.cleanup());
        }
        None
    }

    /// Run every registered cleanup hook and measure the effect.
    ///
    /// Safe to call at any time and any number of times.
    pub fn cleanup(&mut self) -> CleanupReport {
        let before = self.snapshot().process_rss_mb();
        for hook in &self.hooks {
            hook();
        }
        let after = self.snapshot().process_rss_mb();
        let report = CleanupReport {
            before_mb: before,
            after_mb: after,
            freed_mb: before - after,
        };
        self.observer.on_event(&BatchEvent::CleanupRan {
            before_mb: report.before_mb,
            after_mb: report.after_mb,
            freed_mb: report.freed_mb,
        });
        report
    }

    pub fn summary(&mut self) -> MemorySummary {
        let snap = self.snapshot();
        let current_mb = snap.process_rss_mb();
        let baseline_mb = self.baseline_bytes as f64 / MB;
        MemorySummary {
            baseline_mb,
            current_mb,
            peak_mb: self.peak_bytes as f64 / MB,
            delta_mb: current_mb - baseline_mb,
            operations_tracked: self.operations,
            system_percent: snap.system_used_percent(),
            system_available_mb: snap.system_available_mb(),
        }
    }

    pub fn log_summary(&mut self) {
        let s = self.summary();
        info!("Memory usage summary:");
        info!("  baseline: {:.1} MB", s.baseline_mb);
        info!("  current:  {:.1} MB", s.current_mb);
        info!("  peak:     {:.1} MB", s.peak_mb);
        info!("  delta:    {:+.1} MB", s.delta_mb);
        info!("  operations tracked: {}", s.operations_tracked);
        info!(
            "  system: {:.1}% used, {:.1} MB available",
            s.system_percent, s.system_available_mb
        );
    }
}
