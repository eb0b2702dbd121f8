//! Admission control: decides how much of the host a job may claim, and
//! whether a new job may start at all.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::activity::ActivityProbe;
use crate::config::ResourceMode;

/// Ceiling for the current tick. Recomputed, never accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_percent: u8,
    pub mem_percent: u8,
}

/// Conservative fallback when the activity probe cannot answer.
const PROBE_FAILURE_LIMITS: ResourceLimits = ResourceLimits {
    cpu_percent: 10,
    mem_percent: 10,
};

const CACHE_TTL: Duration = Duration::from_secs(5);

struct CachedLimits {
    computed_at: Instant,
    limits: ResourceLimits,
}

/// Maps the user's resource mode and the host's activity level to a usage
/// ceiling. Pure apart from the probe call; results are cached briefly to
/// bound probe overhead.
pub struct AdmissionController {
    mode: ResourceMode,
    probe: Box<dyn ActivityProbe>,
    total_cores: usize,
    cache: Mutex<Option<CachedLimits>>,
}

impl AdmissionController {
    pub fn new(mode: ResourceMode, probe: Box<dyn ActivityProbe>) -> Self {
        Self::with_core_count(mode, probe, num_cpus::get())
    }

    pub fn with_core_count(
        mode: ResourceMode,
        probe: Box<dyn ActivityProbe>,
        total_cores: usize,
    ) -> Self {
        Self {
            mode,
            probe,
            total_cores: total_cores.max(1),
            cache: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> ResourceMode {
        self.mode
    }

    /// Current ceiling, recomputed at most every five seconds.
    pub fn current_limits(&self) -> ResourceLimits {
        let mut cache = self.cache.lock().expect("limits cache poisoned");
        if let Some(cached) = cache.as_ref() {
            if cached.computed_at.elapsed() < CACHE_TTL {
                return cached.limits;
            }
        }

        let limits = self.compute_limits();
        *cache = Some(CachedLimits {
            computed_at: Instant::now(),
            limits,
        });
        limits
    }

    fn compute_limits(&self) -> ResourceLimits {
        let Some(activity) = self.probe.activity_level() else {
            return self.clamp(PROBE_FAILURE_LIMITS);
        };
        self.clamp(tier_limits(self.mode, activity))
    }

    fn clamp(&self, limits: ResourceLimits) -> ResourceLimits {
        let (max_cpu, max_mem) = self.platform_cap();
        ResourceLimits {
            cpu_percent: limits.cpu_percent.min(max_cpu),
            mem_percent: limits.mem_percent.min(max_mem),
        }
    }

    /// Cap applied regardless of mode. Low-core hosts are assumed to be
    /// battery-powered or otherwise fragile and get a tighter ceiling.
    fn platform_cap(&self) -> (u8, u8) {
        if self.total_cores <= 8 {
            (60, 40)
        } else {
            (80, 60)
        }
    }

    /// Whether a new job may start this tick.
    pub fn should_run_job(&self) -> bool {
        self.current_limits().cpu_percent > 0
    }

    /// Core allowance derived from the CPU ceiling. Never advertises zero
    /// cores while work is still permitted.
    pub fn allowed_cores(&self) -> usize {
        let cpu = self.current_limits().cpu_percent as usize;
        let cores = (self.total_cores * cpu) / 100;
        if cores == 0 && cpu > 0 {
            1
        } else {
            cores
        }
    }
}

/// The per-mode step function from activity level to ceiling. Each table is
/// monotonically non-decreasing in the idle level; ties resolve to the lower
/// tier.
fn tier_limits(mode: ResourceMode, activity: u8) -> ResourceLimits {
    let (cpu, mem) = match mode {
        ResourceMode::Aggressive => {
            if activity > 80 {
                (80, 60)
            } else if activity > 50 {
                (50, 40)
            } else {
                (30, 25)
            }
        }
        ResourceMode::Balanced => {
            if activity > 90 {
                (70, 50)
            } else if activity > 60 {
                (40, 30)
            } else if activity > 30 {
                (20, 15)
            } else {
                (10, 10)
            }
        }
        ResourceMode::Conservative => {
            if activity > 95 {
                (50, 30)
            } else if activity > 80 {
                (25, 20)
            } else {
                (5, 5)
            }
        }
        ResourceMode::IdleOnly => {
            if activity > 95 {
                (60, 40)
            } else {
                (0, 0)
            }
        }
    };
    ResourceLimits {
        cpu_percent: cpu,
        mem_percent: mem,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{FixedProbe, UnavailableProbe};

    fn controller(mode: ResourceMode, activity: u8, cores: usize) -> AdmissionController {
        AdmissionController::with_core_count(mode, Box::new(FixedProbe(activity)), cores)
    }

    #[test]
    fn balanced_tiers() {
        assert_eq!(tier_limits(ResourceMode::Balanced, 95).cpu_percent, 70);
        assert_eq!(tier_limits(ResourceMode::Balanced, 61).cpu_percent, 40);
        assert_eq!(tier_limits(ResourceMode::Balanced, 60).cpu_percent, 20);
        assert_eq!(tier_limits(ResourceMode::Balanced, 20).cpu_percent, 10);
    }

    #[test]
    fn idle_only_blocks_below_threshold() {
        let ctl = controller(ResourceMode::IdleOnly, 50, 16);
        assert_eq!(
            ctl.current_limits(),
            ResourceLimits {
                cpu_percent: 0,
                mem_percent: 0
            }
        );
        assert!(!ctl.should_run_job());
        assert_eq!(ctl.allowed_cores(), 0);
    }

    #[test]
    fn laptop_cap_clamps_aggressive_mode() {
        let ctl = controller(ResourceMode::Aggressive, 95, 4);
        let limits = ctl.current_limits();
        assert_eq!(limits.cpu_percent, 60);
        assert_eq!(limits.mem_percent, 40);
    }

    #[test]
    fn probe_failure_falls_back_to_conservative_defaults() {
        let ctl = AdmissionController::with_core_count(
            ResourceMode::Aggressive,
            Box::new(UnavailableProbe),
            16,
        );
        assert_eq!(ctl.current_limits(), PROBE_FAILURE_LIMITS);
        assert!(ctl.should_run_job());
    }

    #[test]
    fn single_core_host_still_gets_one_core() {
        let ctl = controller(ResourceMode::Balanced, 20, 1);
        assert_eq!(ctl.current_limits().cpu_percent, 10);
        assert_eq!(ctl.allowed_cores(), 1);
    }

    #[test]
    fn cached_limits_survive_probe_changes_within_ttl() {
        // Two lookups in quick succession hit the cache, so the second read
        // returns the same value even though the tables would not change
        // anyway; this just pins the caching behavior.
        let ctl = controller(ResourceMode::Balanced, 95, 16);
        let first = ctl.current_limits();
        let second = ctl.current_limits();
        assert_eq!(first, second);
    }
}
