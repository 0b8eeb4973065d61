use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::classifier::{ClassifiedError, ErrorCategory};
use crate::error::{ResilienceError, ResilienceResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    Linear,
    Exponential,
    #[default]
    ExponentialJitter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Spread applied by `ExponentialJitter`, in `[0, 1]`.
    pub jitter_factor: f64,
    /// Attempt cap for failures nobody could classify.
    pub unknown_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::ExponentialJitter,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.25,
            unknown_max_attempts: 2,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32, strategy: RetryStrategy, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            strategy,
            base_delay,
            max_delay: base_delay.max(Self::default().max_delay),
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    pub fn with_unknown_max_attempts(mut self, attempts: u32) -> Self {
        self.unknown_max_attempts = attempts;
        self
    }

    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self::new(1, RetryStrategy::Fixed, Duration::ZERO)
    }

    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(ResilienceError::InvalidConfig(format!(
                "max_delay ({:?}) must be >= base_delay ({:?})",
                self.max_delay, self.base_delay
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ResilienceError::InvalidConfig(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }
}

/// Per-invocation bookkeeping for one `ResilientExecutor` run. Never persisted.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub attempts: u32,
    pub last_error: Option<ClassifiedError>,
    pub total_delay: Duration,
    started: Instant,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempts: 0,
            last_error: None,
            total_delay: Duration::ZERO,
            started: Instant::now(),
        }
    }

    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn record_failure(&mut self, err: ClassifiedError) {
        self.last_error = Some(err);
    }

    pub fn record_delay(&mut self, delay: Duration) {
        self.total_delay += delay;
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RetryCalculator;

impl RetryCalculator {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn next_delay(config: &RetryConfig, attempt: u32) -> ResilienceResult<Duration> {
        Self::next_delay_with_rng(config, attempt, &mut rand::rng())
    }

    pub fn next_delay_with_rng<R: Rng>(
        config: &RetryConfig,
        attempt: u32,
        rng: &mut R,
    ) -> ResilienceResult<Duration> {
        if attempt == 0 {
            return Err(ResilienceError::InvalidConfig(
                "attempt numbers start at 1".into(),
            ));
        }
        config.validate()?;

        let base = config.base_delay.as_secs_f64();
        let max = config.max_delay.as_secs_f64();

        let secs = match config.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Linear => base * f64::from(attempt),
            RetryStrategy::Exponential => exponential(base, attempt),
            RetryStrategy::ExponentialJitter => {
                let capped = exponential(base, attempt).min(max);
                let j = config.jitter_factor;
                if j > 0.0 {
                    capped * rng.random_range((1.0 - j)..=(1.0 + j))
                } else {
                    capped
                }
            }
        };

        Ok(seconds(secs.clamp(0.0, max)))
    }

    /// Computed backoff, unless the failure carried a longer server hint.
    pub fn delay_for(
        config: &RetryConfig,
        attempt: u32,
        err: &ClassifiedError,
    ) -> ResilienceResult<Duration> {
        let computed = Self::next_delay(config, attempt)?;
        Ok(match err.retry_after() {
            Some(hint) if hint > computed => hint,
            _ => computed,
        })
    }

    /// Whether a failure on `attempt` earns another try.
    pub fn should_retry(config: &RetryConfig, attempt: u32, err: &ClassifiedError) -> bool {
        if !err.is_retryable() || attempt >= config.max_attempts {
            return false;
        }
        if err.category() == ErrorCategory::Unknown {
            return attempt < config.unknown_max_attempts.max(1);
        }
        true
    }
}

fn exponential(base: f64, attempt: u32) -> f64 {
    let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX).min(1023);
    base * 2f64.powi(exp)
}

fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ErrorClassifier;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn config(strategy: RetryStrategy) -> RetryConfig {
        RetryConfig::new(10, strategy, Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(30))
    }

    #[test]
    fn test_fixed() {
        let cfg = config(RetryStrategy::Fixed);
        for attempt in 1..=5 {
            assert_eq!(
                RetryCalculator::next_delay(&cfg, attempt).unwrap(),
                Duration::from_secs(1)
            );
        }
    }

    #[test]
    fn test_linear() {
        let cfg = config(RetryStrategy::Linear);
        assert_eq!(
            RetryCalculator::next_delay(&cfg, 3).unwrap(),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_exponential_monotonic_until_cap() {
        let cfg = config(RetryStrategy::Exponential);
        let delays: Vec<_> = (1..=10)
            .map(|a| RetryCalculator::next_delay(&cfg, a).unwrap())
            .collect();

        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[4], Duration::from_secs(16));
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(delays[5..].iter().all(|d| *d == Duration::from_secs(30)));
    }

    #[test]
    fn test_exponential_huge_attempt_saturates_at_cap() {
        let cfg = config(RetryStrategy::Exponential);
        assert_eq!(
            RetryCalculator::next_delay(&cfg, u32::MAX).unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let cfg = config(RetryStrategy::ExponentialJitter).with_jitter(0.5);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let d = RetryCalculator::next_delay_with_rng(&cfg, 3, &mut rng).unwrap();
            assert!(d >= Duration::from_secs(2), "{d:?}");
            assert!(d <= Duration::from_secs(6), "{d:?}");
        }
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let cfg = config(RetryStrategy::ExponentialJitter).with_jitter(1.0);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let d = RetryCalculator::next_delay_with_rng(&cfg, 8, &mut rng).unwrap();
            assert!(d <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_attempt_zero_rejected() {
        let cfg = config(RetryStrategy::Fixed);
        assert!(matches!(
            RetryCalculator::next_delay(&cfg, 0),
            Err(ResilienceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let cfg = RetryConfig::new(3, RetryStrategy::Fixed, Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(1));
        assert!(cfg.validate().is_err());
        assert!(config(RetryStrategy::Fixed).with_jitter(1.5).validate().is_err());
        assert!(RetryConfig::new(0, RetryStrategy::Fixed, Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_retry_after_hint_wins_when_longer() {
        let cfg = config(RetryStrategy::Fixed);
        let err = ErrorClassifier::classify_message("429 rate limited, retry after 12");
        assert_eq!(
            RetryCalculator::delay_for(&cfg, 1, &err).unwrap(),
            Duration::from_secs(12)
        );

        let short = ErrorClassifier::classify_message("429 rate limited, retry_after=0");
        assert_eq!(
            RetryCalculator::delay_for(&cfg, 1, &short).unwrap(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_should_retry_rules() {
        let cfg = config(RetryStrategy::Fixed);
        let transient = ErrorClassifier::classify_message("connection reset by peer");
        let auth = ErrorClassifier::classify_message("401 Unauthorized");
        let unknown = ErrorClassifier::classify_message("the flux capacitor broke");

        assert!(RetryCalculator::should_retry(&cfg, 1, &transient));
        assert!(!RetryCalculator::should_retry(&cfg, 10, &transient));
        assert!(!RetryCalculator::should_retry(&cfg, 1, &auth));
        assert!(RetryCalculator::should_retry(&cfg, 1, &unknown));
        assert!(!RetryCalculator::should_retry(&cfg, 2, &unknown));
    }
}
