use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::System;

/// Host load gate consulted during admission; protects the fleet, not a
/// single tenant.
pub trait LoadProbe: Send + Sync + 'static {
    /// `Some(reason)` when the host is too loaded to admit more work.
    fn overloaded(&self) -> Option<String>;
}

/// Never sheds; used when the load check is disabled and in tests.
#[derive(Default)]
pub struct NoopLoadProbe;

impl LoadProbe for NoopLoadProbe {
    fn overloaded(&self) -> Option<String> {
        None
    }
}

struct Sampled {
    at: Instant,
    cpu_pct: f32,
    mem_pct: f32,
}

/// sysinfo-backed probe with a refresh floor so admission bursts do not
/// hammer /proc.
pub struct SystemLoadMonitor {
    system: Mutex<(System, Option<Sampled>)>,
    min_refresh: Duration,
    cpu_threshold_pct: f32,
    mem_threshold_pct: f32,
}

impl SystemLoadMonitor {
    #[must_use]
    pub fn new(cpu_threshold_pct: f32, mem_threshold_pct: f32, min_refresh: Duration) -> Self {
        Self {
            system: Mutex::new((System::new(), None)),
            min_refresh,
            cpu_threshold_pct,
            mem_threshold_pct,
        }
    }

    fn sample(&self) -> (f32, f32) {
        let mut guard = match self.system.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let needs_refresh = guard
            .1
            .as_ref()
            .is_none_or(|s| s.at.elapsed() >= self.min_refresh);
        if needs_refresh {
            guard.0.refresh_cpu_usage();
            guard.0.refresh_memory();
            let cpu_pct = guard.0.global_cpu_usage();
            let total = guard.0.total_memory();
            let mem_pct = if total == 0 {
                0.0
            } else {
                (guard.0.used_memory() as f32 / total as f32) * 100.0
            };
            guard.1 = Some(Sampled {
                at: Instant::now(),
                cpu_pct,
                mem_pct,
            });
        }
        guard
            .1
            .as_ref()
            .map_or((0.0, 0.0), |s| (s.cpu_pct, s.mem_pct))
    }
}

impl LoadProbe for SystemLoadMonitor {
    fn overloaded(&self) -> Option<String> {
        let (cpu_pct, mem_pct) = self.sample();
        if cpu_pct > self.cpu_threshold_pct {
            return Some(format!("cpu utilization {cpu_pct:.0}% over threshold"));
        }
        if mem_pct > self.mem_threshold_pct {
            return Some(format!("memory utilization {mem_pct:.0}% over threshold"));
        }
        None
    }
}

/// Fixed-answer probe for tests and drills.
pub struct StaticLoadProbe {
    pub reason: Option<String>,
}

impl LoadProbe for StaticLoadProbe {
    fn overloaded(&self) -> Option<String> {
        self.reason.clone()
    }
}
