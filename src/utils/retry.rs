use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;
use crate::core::{Result, TransferError};

/// Backoff between attempts
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    /// Fixed delay
    Fixed(Duration),
    /// Exponential backoff
    Exponential {
        initial: Duration,
        multiplier: f64,
        max_delay: Duration,
    },
    /// Linear backoff
    Linear {
        initial: Duration,
        increment: Duration,
        max_delay: Duration,
    },
}

impl RetryStrategy {
    /// Delay after the n-th failed attempt (0-based)
    pub fn get_delay(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential { initial, multiplier, max_delay } => {
                let delay = initial.as_secs_f64() * multiplier.powf(attempt as f64);
                let delay = Duration::from_secs_f64(delay.min(max_delay.as_secs_f64()));
                std::cmp::min(delay, *max_delay)
            }
            RetryStrategy::Linear { initial, increment, max_delay } => {
                let delay = *initial + (*increment * attempt);
                std::cmp::min(delay, *max_delay)
            }
        }
    }

    /// No wait at all, used by tests
    pub fn none() -> Self {
        RetryStrategy::Fixed(Duration::ZERO)
    }
}

/// Retry configuration
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    pub strategy: RetryStrategy,
    /// Errors for which this returns false are surfaced immediately
    pub should_retry: Box<dyn Fn(&TransferError) -> bool + Send + Sync>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: RetryStrategy::Exponential {
                initial: Duration::from_secs(1),
                multiplier: 2.0,
                max_delay: Duration::from_secs(10),
            },
            should_retry: Box::new(TransferError::is_retryable),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the attempt cap is hit
pub async fn retry_with_config<F, Fut, T>(
    config: &RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                if !(config.should_retry)(&error) {
                    debug!(attempt = attempt + 1, %error, "permanent error, not retrying");
                    return Err(error);
                }

                debug!(attempt = attempt + 1, max_attempts = config.max_attempts, %error, "attempt failed");
                last_error = Some(error);

                if attempt + 1 < config.max_attempts {
                    let delay = config.strategy.get_delay(attempt);
                    sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or(TransferError::RetryLimitExceeded))
}

/// Retry builder
pub struct RetryBuilder {
    config: RetryConfig,
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn should_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&TransferError) -> bool + Send + Sync + 'static,
    {
        self.config.should_retry = Box::new(f);
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }

    pub async fn run<F, Fut, T>(self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_with_config(&self.config, operation).await
    }
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn timeout() -> TransferError {
        TransferError::remote(Some(400), "RequestTimeout", "Request timed out")
    }

    #[tokio::test]
    async fn test_retry_success() {
        let count = AtomicU32::new(0);
        let result = RetryBuilder::new()
            .strategy(RetryStrategy::none())
            .run(|| async {
                let n = count.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(timeout()) } else { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_failure() {
        let count = AtomicU32::new(0);
        let result = RetryBuilder::new()
            .strategy(RetryStrategy::none())
            .run(|| async {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(timeout())
            })
            .await;

        assert_eq!(result.unwrap_err().code(), Some("RequestTimeout"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_short_circuits() {
        let count = AtomicU32::new(0);
        let result = RetryBuilder::new()
            .strategy(RetryStrategy::none())
            .run(|| async {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(TransferError::remote(Some(403), "AccessDenied", "Access denied"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_delays() {
        let strategy = RetryStrategy::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(strategy.get_delay(0), Duration::from_secs(1));
        assert_eq!(strategy.get_delay(1), Duration::from_secs(2));
        assert_eq!(strategy.get_delay(2), Duration::from_secs(4));
        assert_eq!(strategy.get_delay(3), Duration::from_secs(5));

        let linear = RetryStrategy::Linear {
            initial: Duration::from_millis(100),
            increment: Duration::from_millis(50),
            max_delay: Duration::from_millis(180),
        };
        assert_eq!(linear.get_delay(1), Duration::from_millis(150));
        assert_eq!(linear.get_delay(4), Duration::from_millis(180));
    }
}
