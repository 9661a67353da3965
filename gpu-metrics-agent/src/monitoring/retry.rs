use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::sink::SinkError;

/// Exponential backoff between retries, doubling up to a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self { current: initial, max: max.max(initial) }
    }

    /// Delay to wait now; the following one is doubled.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Bounded retry of transient backend failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails for good, or attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, SinkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut backoff = Backoff::new(self.initial_backoff, self.max_backoff);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if attempt >= attempts {
                        if attempts == 1 {
                            return Err(e);
                        }
                        return Err(SinkError::RetryExhausted { attempts, last: Box::new(e) });
                    }
                    let delay = backoff.next_delay();
                    warn!("{} failed (attempt {}/{}): {}. Retrying in {:?}", what, attempt, attempts, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = Cell::new(0);
        let result = policy(3)
            .run("write", || {
                calls.set(calls.get() + 1);
                let n = calls.get();
                async move {
                    if n < 3 {
                        Err(SinkError::from_status(503, "unavailable".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = policy(2)
            .run("write", || {
                calls.set(calls.get() + 1);
                async { Err(SinkError::from_status(429, "quota".into())) }
            })
            .await;
        assert!(matches!(result, Err(SinkError::RetryExhausted { attempts: 2, .. })));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = policy(5)
            .run("write", || {
                calls.set(calls.get() + 1);
                async { Err(SinkError::from_status(400, "bad".into())) }
            })
            .await;
        assert!(matches!(result, Err(SinkError::Api { status: 400, .. })));
        assert_eq!(calls.get(), 1);
    }
}
