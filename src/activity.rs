//! Host activity probing.
//!
//! The agent only needs one capability from the platform: "how active is the
//! user right now", as a 0-100 level where 0 means fully active and 100 means
//! fully idle. Concrete probes are selected at startup and injected into the
//! [`AdmissionController`](crate::admission::AdmissionController).

use std::time::Duration;

/// Reports the current user-activity level.
///
/// Returns `None` when the platform cannot answer; callers must treat that as
/// "assume fully active".
pub trait ActivityProbe: Send + Sync {
    fn activity_level(&self) -> Option<u8>;
}

/// Scale an idle duration to an activity level.
///
/// Under one second of idle time the host counts as fully active; past five
/// minutes it counts as fully idle; in between the level grows linearly.
pub fn scale_idle_time(idle: Duration) -> u8 {
    const MAX_IDLE_SECS: u64 = 300;

    if idle < Duration::from_secs(1) {
        return 0;
    }
    if idle > Duration::from_secs(MAX_IDLE_SECS) {
        return 100;
    }
    ((idle.as_secs() * 100) / MAX_IDLE_SECS) as u8
}

/// Probe backed by any source of "time since last user input".
pub struct IdleTimeProbe<F> {
    source: F,
}

impl<F> IdleTimeProbe<F>
where
    F: Fn() -> Option<Duration> + Send + Sync,
{
    pub fn new(source: F) -> Self {
        Self { source }
    }
}

impl<F> ActivityProbe for IdleTimeProbe<F>
where
    F: Fn() -> Option<Duration> + Send + Sync,
{
    fn activity_level(&self) -> Option<u8> {
        (self.source)().map(scale_idle_time)
    }
}

/// Fallback for platforms without a native idle source, and for tests.
pub struct FixedProbe(pub u8);

impl ActivityProbe for FixedProbe {
    fn activity_level(&self) -> Option<u8> {
        Some(self.0.min(100))
    }
}

/// Probe that always fails, exercising the conservative-default path.
pub struct UnavailableProbe;

impl ActivityProbe for UnavailableProbe {
    fn activity_level(&self) -> Option<u8> {
        None
    }
}

/// Default probe for this build. Platforms with a real idle source plug in an
/// [`IdleTimeProbe`] here; everything else reports a middling level so the
/// agent stays usable without claiming the host is idle.
pub fn platform_probe() -> Box<dyn ActivityProbe> {
    Box::new(FixedProbe(50))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_scaling_bounds() {
        assert_eq!(scale_idle_time(Duration::from_millis(200)), 0);
        assert_eq!(scale_idle_time(Duration::from_secs(600)), 100);
    }

    #[test]
    fn idle_scaling_is_linear_between_bounds() {
        assert_eq!(scale_idle_time(Duration::from_secs(30)), 10);
        assert_eq!(scale_idle_time(Duration::from_secs(150)), 50);
        assert_eq!(scale_idle_time(Duration::from_secs(300)), 100);
    }

    #[test]
    fn idle_probe_uses_source() {
        let probe = IdleTimeProbe::new(|| Some(Duration::from_secs(150)));
        assert_eq!(probe.activity_level(), Some(50));

        let broken = IdleTimeProbe::new(|| None);
        assert_eq!(broken.activity_level(), None);
    }
}
