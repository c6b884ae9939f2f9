use crate::config::LinkConfig;
use std::time::Duration;

/// Multiplicative delay with a ceiling, reset on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    factor: u32,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, factor: u32, max: Duration) -> Self {
        Self {
            initial,
            factor: factor.max(1),
            max,
            current: initial.min(max),
        }
    }

    /// Delay to apply now; the following call returns the grown delay
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(self.factor).min(self.max);
        delay
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }
}

/// Timing rules of the link maintainer and sampler for one camera.
#[derive(Debug, Clone)]
pub struct LinkPolicy {
    /// Wait after a failed open
    pub open_backoff: Backoff,
    /// Window in which an opened link must deliver its first frame
    pub verify_timeout: Backoff,
    pub max_consecutive_read_failures: u32,
    /// Latest frames older than this are not sampled
    pub stale_after: Duration,
}

impl From<&LinkConfig> for LinkPolicy {
    fn from(config: &LinkConfig) -> Self {
        Self {
            open_backoff: Backoff::new(
                Duration::from_secs(config.open_backoff_initial_secs),
                config.open_backoff_factor,
                Duration::from_secs(config.open_backoff_max_secs),
            ),
            verify_timeout: Backoff::new(
                Duration::from_secs(config.verify_timeout_initial_secs),
                config.verify_timeout_factor,
                Duration::from_secs(config.verify_timeout_max_secs),
            ),
            max_consecutive_read_failures: config.max_consecutive_read_failures.max(1),
            stale_after: Duration::from_millis(config.stale_frame_ms),
        }
    }
}
