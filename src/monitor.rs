//! Process metrics sampled at reporting time
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};

/// Snapshot of this process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessStats {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub elapsed: Duration,
}

/// Reads CPU and resident memory for the current process on demand
pub struct PerformanceMonitor {
    system: System,
    pid: Option<Pid>,
    started: Instant,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = sysinfo::get_current_pid().ok();
        if let Some(pid) = pid {
            // Prime the CPU counters so the first reading has a baseline
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        }
        Self {
            system,
            pid,
            started: Instant::now(),
        }
    }

    pub fn sample(&mut self) -> ProcessStats {
        let elapsed = self.started.elapsed();
        let Some(pid) = self.pid else {
            return ProcessStats {
                cpu_percent: 0.0,
                memory_mb: 0.0,
                elapsed,
            };
        };

        self.system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match self.system.process(pid) {
            Some(process) => ProcessStats {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
                elapsed,
            },
            None => ProcessStats {
                cpu_percent: 0.0,
                memory_mb: 0.0,
                elapsed,
            },
        }
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
