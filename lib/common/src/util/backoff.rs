use rand::Rng;
use std::time::Duration;

/// Exponential backoff with an interval cap and optional ±20% jitter.
/// Every retry loop in the workspace (phase-2 dispatch, lock acquisition)
/// draws its delays from here so the growth curve stays uniform.
#[derive(Debug, Clone)]
pub struct Backoff {
    current_ms: f64,
    multiplier: f64,
    max_ms: u64,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            current_ms: initial.as_millis() as f64,
            multiplier,
            max_ms: max.as_millis() as u64,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// The delay to sleep before the next attempt. Each call advances the
    /// schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = (self.current_ms as u64).min(self.max_ms);
        self.current_ms = (self.current_ms * self.multiplier).min(self.max_ms as f64);

        let millis = if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.8..=1.2);
            ((base as f64) * factor) as u64
        } else {
            base
        };
        Duration::from_millis(millis.max(1))
    }
}
