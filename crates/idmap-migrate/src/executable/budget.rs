//! Memory and wall-clock budgets checked between rows.

use std::time::{Duration, Instant};

use sysinfo::{Pid, System};

use crate::config::{LimitsConfig, SystemResources};

/// Reports the memory used by the running process.
pub trait ResourceMonitor: Send {
    /// Resident memory in bytes.
    fn memory_usage(&mut self) -> u64;
}

/// Monitor backed by `sysinfo` for the current process.
pub struct SystemMonitor {
    system: System,
    pid: Option<Pid>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor for SystemMonitor {
    fn memory_usage(&mut self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        self.system.refresh_process(pid);
        self.system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Resolved budget settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Memory ceiling in bytes.
    pub memory_limit: u64,
    /// Fraction of the ceiling that triggers a reclaim.
    pub memory_threshold: f64,
    /// After reclaiming, usage must drop below
    /// `memory_threshold * memory_reclaim_ratio` to continue.
    pub memory_reclaim_ratio: f64,
    pub max_execution: Option<Duration>,
    /// Fraction of `max_execution` after which the run yields.
    pub time_threshold: f64,
}

impl Limits {
    /// Resolve configured limits, taking total system memory as the ceiling
    /// when none is configured.
    pub fn resolve(config: &LimitsConfig, resources: &SystemResources) -> Self {
        let memory_limit = match config.memory_limit_mb {
            Some(mb) => mb.saturating_mul(1024 * 1024),
            None => resources.total_memory_bytes,
        };
        Self {
            memory_limit,
            memory_threshold: config.memory_threshold,
            memory_reclaim_ratio: config.memory_reclaim_ratio,
            max_execution: config.max_execution_secs.map(Duration::from_secs),
            time_threshold: config.time_threshold,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::resolve(&LimitsConfig::default(), &SystemResources::detect())
    }
}

/// Outcome of a memory check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemoryCheck {
    /// Below the threshold.
    Within,
    /// Was above the threshold, reclaiming brought it back down.
    Reclaimed { before: u64, after: u64 },
    /// Still too high after reclaiming.
    Exceeded { before: u64, after: u64 },
}

/// Budget tracker for one run.
pub struct Budget {
    limits: Limits,
    monitor: Box<dyn ResourceMonitor>,
    started: Instant,
}

impl Budget {
    pub fn new(limits: Limits, monitor: Box<dyn ResourceMonitor>) -> Self {
        Self {
            limits,
            monitor,
            started: Instant::now(),
        }
    }

    /// Budget measuring the current process.
    pub fn system(limits: Limits) -> Self {
        Self::new(limits, Box::new(SystemMonitor::new()))
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Restart the wall clock.
    pub fn restart(&mut self) {
        self.started = Instant::now();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fraction of the memory ceiling in use.
    pub fn memory_fraction(&self, usage: u64) -> f64 {
        if self.limits.memory_limit == 0 {
            return 0.0;
        }
        usage as f64 / self.limits.memory_limit as f64
    }

    /// Two-stage memory check: above the threshold, run `reclaim` and
    /// measure again against the lowered threshold.
    pub fn check_memory<F: FnOnce()>(&mut self, reclaim: F) -> MemoryCheck {
        let before = self.monitor.memory_usage();
        if self.memory_fraction(before) < self.limits.memory_threshold {
            return MemoryCheck::Within;
        }

        reclaim();
        let after = self.monitor.memory_usage();
        let lowered = self.limits.memory_threshold * self.limits.memory_reclaim_ratio;
        if self.memory_fraction(after) < lowered {
            MemoryCheck::Reclaimed { before, after }
        } else {
            MemoryCheck::Exceeded { before, after }
        }
    }

    /// Whether the run has used up its share of the execution time.
    pub fn time_exceeded(&self) -> bool {
        match self.limits.max_execution {
            Some(max) => {
                self.elapsed().as_secs_f64() > max.as_secs_f64() * self.limits.time_threshold
            }
            None => false,
        }
    }
}

/// Human-readable byte size.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Replays a fixed sequence of readings, repeating the last.
    struct Scripted(Vec<u64>, usize);

    impl ResourceMonitor for Scripted {
        fn memory_usage(&mut self) -> u64 {
            let reading = self.0[self.1.min(self.0.len() - 1)];
            self.1 += 1;
            reading
        }
    }

    fn limits() -> Limits {
        Limits {
            memory_limit: 1000,
            memory_threshold: 0.85,
            memory_reclaim_ratio: 0.90,
            max_execution: None,
            time_threshold: 0.90,
        }
    }

    #[test]
    fn test_below_threshold_skips_reclaim() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut budget = Budget::new(limits(), Box::new(Scripted(vec![500], 0)));
        let c = calls.clone();
        assert_eq!(
            budget.check_memory(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            MemoryCheck::Within
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reclaim_must_reach_lowered_threshold() {
        // 0.85 * 0.90 = 0.765 of 1000
        let mut budget = Budget::new(limits(), Box::new(Scripted(vec![900, 700], 0)));
        assert_eq!(
            budget.check_memory(|| {}),
            MemoryCheck::Reclaimed { before: 900, after: 700 }
        );

        let mut budget = Budget::new(limits(), Box::new(Scripted(vec![900, 800], 0)));
        assert_eq!(
            budget.check_memory(|| {}),
            MemoryCheck::Exceeded { before: 900, after: 800 }
        );
    }

    #[test]
    fn test_time_budget() {
        let mut l = limits();
        l.max_execution = Some(Duration::from_secs(0));
        let budget = Budget::new(l, Box::new(Scripted(vec![0], 0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(budget.time_exceeded());

        let budget = Budget::new(limits(), Box::new(Scripted(vec![0], 0)));
        assert!(!budget.time_exceeded());
    }

    #[test]
    fn test_resolve_limits() {
        let resources = SystemResources {
            total_memory_bytes: 8 * 1024 * 1024 * 1024,
            total_memory_gb: 8.0,
            cpu_cores: 4,
        };
        let resolved = Limits::resolve(&LimitsConfig::default(), &resources);
        assert_eq!(resolved.memory_limit, 8 * 1024 * 1024 * 1024);
        assert_eq!(resolved.memory_threshold, 0.85);

        let config = LimitsConfig {
            memory_limit_mb: Some(256),
            max_execution_secs: Some(60),
            ..Default::default()
        };
        let resolved = Limits::resolve(&config, &resources);
        assert_eq!(resolved.memory_limit, 256 * 1024 * 1024);
        assert_eq!(resolved.max_execution, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }
}
