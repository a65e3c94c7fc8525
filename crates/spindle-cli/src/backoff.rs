//! Poll backoff for idle workers.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff between empty `nexttask` polls.
///
/// delay = min(base * multiplier^(idle_polls - 1), max), then up to
/// `jitter` of that delay is added so that many runners started together
/// spread out.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay, in `[0, 1]`.
    pub jitter: f64,
}

impl PollBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// Delay before the next poll after `idle_polls` empty answers in a row.
    /// Zero idle polls means work was just found: poll again right away.
    pub fn next_delay(&self, idle_polls: u32) -> Duration {
        if idle_polls == 0 {
            return Duration::ZERO;
        }
        let exponent = idle_polls.saturating_sub(1).min(32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max.as_secs_f64());
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter) * capped
        } else {
            0.0
        };
        Duration::from_secs_f64(capped + jitter)
    }
}
