//! # Retry Policy
//!
//! Pure computation of the backoff schedule and the retry/DLQ decision.
//! Attempts are 1-based: attempt `n` is the n-th invocation.
//!
//! The delay after attempt `n` is `initial * multiplier^(n-1)`, clamped to
//! `max_delay`. The schedule is derived from the attempt number alone, so
//! it is non-decreasing whenever `multiplier >= 1`.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::domain::subject::DlqSubjects;

/// Retry schedule shared by the publisher and the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    dlq_subjects: DlqSubjects,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            dlq_subjects: DlqSubjects::default(),
        }
    }

    /// Route dead letters through `subjects` instead of the default mapping.
    #[must_use]
    pub fn with_dlq_subjects(mut self, subjects: DlqSubjects) -> Self {
        self.dlq_subjects = subjects;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after attempt `attempt` failed.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs < 0.0 || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs).min(self.max_delay)
        }
    }

    /// Whether another attempt may follow attempt `attempt`.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// DLQ subject for `original`.
    #[must_use]
    pub fn dlq_subject(&self, original: &str) -> String {
        self.dlq_subjects.dlq_subject(original)
    }

    #[must_use]
    pub fn dlq_subjects(&self) -> &DlqSubjects {
        &self.dlq_subjects
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, initial_ms: u64, max_ms: u64, multiplier: f64) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_multiplier: multiplier,
        })
    }

    #[test]
    fn test_exponential_schedule() {
        let p = policy(5, 100, 10_000, 2.0);
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(400));
        assert_eq!(p.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_clamped_to_max() {
        let p = policy(10, 1_000, 5_000, 3.0);
        assert_eq!(p.delay(3), Duration::from_millis(5_000));
        assert_eq!(p.delay(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn test_delay_matches_formula_and_is_monotonic() {
        for multiplier in [1.0, 1.5, 2.0, 3.7] {
            let p = policy(12, 50, 20_000, multiplier);
            let mut previous = Duration::ZERO;
            for n in 1..=12u32 {
                let expected = (0.05 * multiplier.powi(n as i32 - 1)).min(20.0);
                let actual = p.delay(n).as_secs_f64();
                assert!((actual - expected).abs() < 1e-6, "n={n} m={multiplier}");
                assert!(p.delay(n) >= previous);
                previous = p.delay(n);
            }
        }
    }

    #[test]
    fn test_constant_multiplier() {
        let p = policy(4, 500, 30_000, 1.0);
        for n in 1..=4 {
            assert_eq!(p.delay(n), Duration::from_millis(500));
        }
    }

    #[test]
    fn test_should_retry_boundary() {
        let p = policy(3, 10, 100, 2.0);
        assert!(p.should_retry(1));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
        assert!(!p.should_retry(4));

        let single = policy(1, 10, 100, 2.0);
        assert!(!single.should_retry(1));
    }

    #[test]
    fn test_dlq_subject() {
        assert_eq!(RetryPolicy::default().dlq_subject("ns.field.created"), "ns.dlq.field.created");

        let custom = RetryPolicy::default().with_dlq_subjects(DlqSubjects::new("app", "events.dlq"));
        assert_eq!(custom.dlq_subject("app.field.created"), "events.dlq.field.created");
    }
}
