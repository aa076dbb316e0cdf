use std::time::Duration;

use rand::Rng;

/// Retry schedule for failed processing jobs.
///
/// The delay before attempt `n + 1` is `min(initial × 2^(n-1), max)` with
/// symmetric jitter, where `n` is the number of attempts already made.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: i32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or subtracted (0.0 = none).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(900),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn unjittered(&self, failed_attempts: i32) -> f64 {
        let exponent = failed_attempts.saturating_sub(1).clamp(0, 30);
        let base = self.initial_delay.as_secs_f64() * 2f64.powi(exponent);
        base.min(self.max_delay.as_secs_f64())
    }

    /// Delay before the next attempt, given how many attempts have already failed.
    /// Jitter never pulls a delay below the previous step's un-jittered value.
    pub fn delay_for_attempt(&self, failed_attempts: i32) -> Duration {
        let capped = self.unjittered(failed_attempts);

        let delayed = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            let floor = if failed_attempts > 1 {
                self.unjittered(failed_attempts - 1)
            } else {
                0.0
            };
            (capped + offset).max(floor)
        } else {
            capped
        };

        Duration::from_secs_f64(delayed)
    }

    /// `delay_for_attempt` as a chrono duration for timestamp arithmetic.
    pub fn backoff(&self, failed_attempts: i32) -> chrono::Duration {
        chrono::Duration::from_std(self.delay_for_attempt(failed_attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(100),
            ..Default::default()
        }
        .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(100));
        assert_eq!(policy.delay_for_attempt(50), Duration::from_secs(100));
    }

    #[test]
    fn test_delay_is_monotonic_without_jitter() {
        let policy = RetryPolicy::default().with_jitter(0.0);
        let delays: Vec<_> = (1..=8).map(|n| policy.delay_for_attempt(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let secs = policy.delay_for_attempt(1).as_secs_f64();
            assert!((24.0..=36.0).contains(&secs), "delay {secs} out of range");
        }
    }

    #[test]
    fn test_jittered_delay_never_drops_below_previous_step() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        for _ in 0..100 {
            assert!(policy.delay_for_attempt(3) >= Duration::from_secs(60));
            assert!(policy.delay_for_attempt(2) >= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_backoff_converts_to_chrono() {
        let policy = RetryPolicy::default().with_jitter(0.0);
        assert_eq!(policy.backoff(2), chrono::Duration::seconds(60));
    }
}
