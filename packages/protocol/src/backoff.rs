//! Exponential backoff calculator for job retries.

use std::time::Duration;

/// Exponential backoff with a cap and symmetric jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Growth factor per retry.
    pub factor: f64,
    /// Ceiling on the computed delay.
    pub cap: Duration,
    /// Jitter fraction (0.0 - 1.0) applied as ±jitter around the delay.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            factor: 2.0,
            cap: Duration::from_secs(600),
            jitter: 0.2,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, factor: f64, cap: Duration) -> Self {
        Self {
            base,
            factor,
            cap,
            jitter: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry_count` (1-indexed).
    pub fn delay(&self, retry_count: u32) -> Duration {
        let capped = self.raw_delay(retry_count);

        if self.jitter <= 0.0 {
            return capped;
        }

        let secs = capped.as_secs_f64();
        let spread = secs * self.jitter;
        let jittered = {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            secs + rng.gen_range(-spread..=spread)
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// The un-jittered delay, exposed for boundary assertions.
    pub fn raw_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1) as f64;
        let secs = self.base.as_secs_f64() * self.factor.powf(exponent);
        Duration::from_secs_f64(secs.min(self.cap.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_retry_uses_base_delay() {
        let backoff = Backoff::default().with_jitter(0.0);
        assert_eq!(backoff.delay(1), Duration::from_secs(30));
    }

    #[test]
    fn delay_doubles_per_retry() {
        let backoff = Backoff::default().with_jitter(0.0);
        assert_eq!(backoff.delay(2), Duration::from_secs(60));
        assert_eq!(backoff.delay(3), Duration::from_secs(120));
    }

    #[test]
    fn delay_is_capped() {
        let backoff = Backoff::default().with_jitter(0.0);
        assert_eq!(backoff.delay(10), Duration::from_secs(600));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::default();
        for retry in 1..=6 {
            let raw = backoff.raw_delay(retry).as_secs_f64();
            for _ in 0..50 {
                let jittered = backoff.delay(retry).as_secs_f64();
                assert!(jittered >= raw * 0.79, "jitter below -20%: {jittered} vs {raw}");
                assert!(jittered <= raw * 1.21, "jitter above +20%: {jittered} vs {raw}");
            }
        }
    }
}
