use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::gateway::ProbeError;

pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    elapsed_nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .elapsed_nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_add(nanos))
            });
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_nanos.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSpec {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Satisfied { probes: u32, waited: Duration },
    TimedOut { probes: u32, waited: Duration },
}

impl PollOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PollOutcome::Satisfied { .. })
    }

    pub fn probes(&self) -> u32 {
        match self {
            PollOutcome::Satisfied { probes, .. } | PollOutcome::TimedOut { probes, .. } => *probes,
        }
    }

    pub fn waited(&self) -> Duration {
        match self {
            PollOutcome::Satisfied { waited, .. } | PollOutcome::TimedOut { waited, .. } => *waited,
        }
    }
}

/// Probe until `probe` reports `Ok(true)` or `spec.timeout` has elapsed.
///
/// The first probe runs immediately. A probe error is a transient failure and
/// counts as "not yet satisfied"; only running out of budget yields
/// [`PollOutcome::TimedOut`]. Sleeps are clamped to the remaining budget so the
/// last probe lands on the deadline.
pub fn await_condition<F>(clock: &dyn Clock, spec: PollSpec, mut probe: F) -> PollOutcome
where
    F: FnMut() -> Result<bool, ProbeError>,
{
    let start = clock.now();
    let mut probes: u32 = 0;
    loop {
        probes += 1;
        match probe() {
            Ok(true) => {
                return PollOutcome::Satisfied {
                    probes,
                    waited: clock.now().saturating_sub(start),
                };
            }
            Ok(false) => {}
            Err(err) => {
                tracing::debug!(probe = probes, error = %err, "probe failed, treating as not ready");
            }
        }
        let waited = clock.now().saturating_sub(start);
        if waited >= spec.timeout {
            return PollOutcome::TimedOut { probes, waited };
        }
        let remaining = spec.timeout - waited;
        clock.sleep(spec.interval.min(remaining));
    }
}
