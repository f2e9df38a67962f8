use crate::RuntimeError;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Delay between attempts, computed from the number of failures so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    Linear(Duration),
    Exponential(Duration),
}

impl Backoff {
    /// Delay after the `failures`-th failed attempt (1-based).
    pub fn delay(self, failures: u32) -> Duration {
        let n = failures.max(1);
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(d) => d,
            Backoff::Linear(d) => d.saturating_mul(n),
            Backoff::Exponential(d) => d.saturating_mul(1u32 << (n - 1).min(16)),
        }
    }
}

/// Bounded retry shared by mount preparation, hive load/unload, and setting writes.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    is_retryable: fn(&RuntimeError) -> bool,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            is_retryable: RuntimeError::is_retryable,
        }
    }

    /// Replace the retryability predicate.
    #[must_use]
    pub fn retry_if(mut self, predicate: fn(&RuntimeError) -> bool) -> Self {
        self.is_retryable = predicate;
        self
    }

    #[must_use]
    pub fn without_delay(mut self) -> Self {
        self.backoff = Backoff::None;
        self
    }

    pub fn should_retry(&self, err: &RuntimeError) -> bool {
        (self.is_retryable)(err)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` is reached.
    ///
    /// `between(attempt, &err)` runs after each retryable failure and before
    /// the backoff sleep. Exhaustion yields `RuntimeError::RetriesExhausted`
    /// wrapping the last error.
    pub fn run<T>(
        &self,
        operation: &str,
        mut op: impl FnMut(u32) -> Result<T, RuntimeError>,
        mut between: impl FnMut(u32, &RuntimeError),
    ) -> Result<T, RuntimeError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{operation} succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(e) if !self.should_retry(&e) => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    return Err(RuntimeError::RetriesExhausted {
                        operation: operation.to_owned(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    debug!(
                        "{operation}: attempt {attempt}/{} failed: {e}",
                        self.max_attempts
                    );
                    between(attempt, &e);
                    let delay = self.backoff.delay(attempt);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_shapes() {
        let base = Duration::from_millis(200);
        assert_eq!(Backoff::Fixed(base).delay(3), base);
        assert_eq!(Backoff::Linear(base).delay(3), Duration::from_millis(600));
        assert_eq!(Backoff::Exponential(Duration::from_secs(1)).delay(1), Duration::from_secs(1));
        assert_eq!(Backoff::Exponential(Duration::from_secs(1)).delay(3), Duration::from_secs(4));
        assert_eq!(Backoff::None.delay(9), Duration::ZERO);
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Backoff::None);
        let mut hooks = Vec::new();
        let result = policy.run(
            "load",
            |attempt| {
                if attempt < 3 {
                    Err(RuntimeError::ResourceBusy("in use".into()))
                } else {
                    Ok(attempt)
                }
            },
            |attempt, _| hooks.push(attempt),
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(hooks, vec![1, 2]);
    }

    #[test]
    fn exhaustion_wraps_last_error() {
        let policy = RetryPolicy::new(2, Backoff::None);
        let mut calls = 0;
        let err = policy
            .run::<()>(
                "unload zSOFTWARE",
                |_| {
                    calls += 1;
                    Err(RuntimeError::ResourceBusy("handle open".into()))
                },
                |_, _| {},
            )
            .unwrap_err();
        assert_eq!(calls, 2);
        match err {
            RuntimeError::RetriesExhausted { operation, attempts, last } => {
                assert_eq!(operation, "unload zSOFTWARE");
                assert_eq!(attempts, 2);
                assert!(matches!(*last, RuntimeError::ResourceBusy(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fatal_errors_stop_immediately() {
        let policy = RetryPolicy::new(5, Backoff::None);
        let mut calls = 0;
        let err = policy
            .run::<()>(
                "set value",
                |_| {
                    calls += 1;
                    Err(RuntimeError::StoreCorrupt("bad hive".into()))
                },
                |_, _| {},
            )
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, RuntimeError::StoreCorrupt(_)));
    }

    #[test]
    fn custom_predicate() {
        let policy = RetryPolicy::new(3, Backoff::None).retry_if(|_| true);
        let mut calls = 0;
        let _ = policy.run::<()>(
            "x",
            |_| {
                calls += 1;
                Err(RuntimeError::NotFound("x".into()))
            },
            |_, _| {},
        );
        assert_eq!(calls, 3);
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::new(0, Backoff::None).max_attempts, 1);
    }
}
