//! Bounded retry with fixed backoff for dial and session-open loops.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Retry strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Single attempt.
    None,
    /// Fixed delay between attempts.
    Fixed {
        /// Delay between attempts.
        delay: Duration,
        /// Maximum attempts, including the first one.
        max_attempts: u32,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Fixed {
            delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryStrategy {
    /// Create no retry strategy.
    #[must_use]
    pub const fn none() -> Self {
        Self::None
    }

    /// Create fixed delay strategy.
    #[must_use]
    pub const fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self::Fixed {
            delay,
            max_attempts,
        }
    }

    /// Delay before attempt number `attempt` (0-based), `None` when exhausted.
    #[must_use]
    pub const fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed {
                delay,
                max_attempts,
            } => {
                if attempt < *max_attempts {
                    Some(*delay)
                } else {
                    None
                }
            }
        }
    }

    /// Get max attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => *max_attempts,
        }
    }

    /// Run `op` until it succeeds or the attempts run out.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => match self.delay_for_attempt(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            what,
                            attempt,
                            max_attempts = self.max_attempts(),
                            error = %e,
                            "Attempt failed, retrying in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fixed_delays() {
        let s = RetryStrategy::fixed(Duration::from_millis(10), 3);
        assert_eq!(s.delay_for_attempt(1), Some(Duration::from_millis(10)));
        assert_eq!(s.delay_for_attempt(2), Some(Duration::from_millis(10)));
        assert_eq!(s.delay_for_attempt(3), None);
        assert_eq!(RetryStrategy::none().delay_for_attempt(1), None);
        assert_eq!(RetryStrategy::none().max_attempts(), 1);
    }

    #[tokio::test]
    async fn run_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let s = RetryStrategy::fixed(Duration::from_millis(1), 3);
        let result: Result<()> = s
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NodeError::config("nope")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_returns_first_success() {
        let s = RetryStrategy::fixed(Duration::from_millis(1), 5);
        let value = s
            .run("test", |attempt| async move {
                if attempt < 2 {
                    Err(NodeError::config("not yet"))
                } else {
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }
}
