//! Exponential backoff around transient failures.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::utils::errors::{ErrorKind, Result, SyncError};

/// Which allow-list applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    Network,
    Filesystem,
}

impl OperationClass {
    /// Integrity failures are handled separately: retried exactly once.
    fn retries(self, kind: ErrorKind) -> bool {
        match self {
            OperationClass::Network => matches!(
                kind,
                ErrorKind::Network | ErrorKind::ConnectionTimeout | ErrorKind::Transfer
            ),
            OperationClass::Filesystem => {
                matches!(kind, ErrorKind::Io | ErrorKind::ConnectionTimeout)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub class: OperationClass,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fractional jitter applied around the computed delay (0.1 = ±10%)
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(class: OperationClass, config: &RetryConfig) -> Self {
        let max_attempts = match class {
            OperationClass::Network => config.network_attempts,
            OperationClass::Filesystem => config.filesystem_attempts,
        };
        Self {
            class,
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: 0.1,
        }
    }

    pub fn network(config: &RetryConfig) -> Self {
        Self::from_config(OperationClass::Network, config)
    }

    pub fn filesystem(config: &RetryConfig) -> Self {
        Self::from_config(OperationClass::Filesystem, config)
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let factor = if self.jitter > 0.0 {
            1.0 + rng.gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * factor).max(0.0))
    }

    fn should_retry(&self, error: &SyncError, integrity_failures: u32) -> bool {
        match error.kind() {
            ErrorKind::Integrity => integrity_failures <= 1,
            kind => self.class.retries(kind),
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. The final error is returned unchanged.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut integrity_failures = 0u32;
        let mut attempt = 1u32;

        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if err.kind() == ErrorKind::Integrity {
                        integrity_failures += 1;
                    }
                    if attempt >= self.max_attempts || !self.should_retry(&err, integrity_failures) {
                        return Err(err);
                    }

                    let delay = self.delay(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient error, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::cell::Cell;

    fn policy(class: OperationClass, attempts: u32) -> RetryPolicy {
        RetryPolicy {
            class,
            max_attempts: attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(4),
            jitter: 0.1,
        }
    }

    fn network_error() -> SyncError {
        SyncError::Network {
            operation: "upload".into(),
            message: "connection reset".into(),
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::network(&RetryConfig::default())
        };
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(policy.delay_with_rng(1, &mut rng), Duration::from_millis(500));
        assert_eq!(policy.delay_with_rng(2, &mut rng), Duration::from_millis(1000));
        assert_eq!(policy.delay_with_rng(3, &mut rng), Duration::from_millis(2000));
        assert_eq!(policy.delay_with_rng(20, &mut rng), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::network(&RetryConfig::default());
        let mut rng = StdRng::seed_from_u64(42);
        for attempt in 1..8 {
            let nominal = RetryPolicy { jitter: 0.0, ..policy }
                .delay_with_rng(attempt, &mut rng)
                .as_secs_f64();
            let jittered = policy.delay_with_rng(attempt, &mut rng).as_secs_f64();
            assert!(jittered >= nominal * 0.9 - 1e-9 && jittered <= nominal * 1.1 + 1e-9);
        }
    }

    #[test]
    fn transient_errors_are_retried() {
        let calls = Cell::new(0);
        let result = policy(OperationClass::Network, 5).run("upload", |attempt| {
            calls.set(attempt);
            if attempt < 3 {
                Err(network_error())
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn exhaustion_returns_last_error_unchanged() {
        let calls = Cell::new(0);
        let err = policy(OperationClass::Network, 3)
            .run::<(), _>("upload", |attempt| {
                calls.set(attempt);
                Err(SyncError::ConnectionTimeout {
                    operation: format!("attempt {attempt}"),
                })
            })
            .unwrap_err();
        assert_eq!(calls.get(), 3);
        assert_eq!(err.to_string(), "Connection timed out during attempt 3");
    }

    #[test]
    fn authentication_and_permission_are_not_retried() {
        for err in [
            SyncError::Authentication("bad key".into()),
            SyncError::PermissionDenied("/remote".into()),
        ] {
            let calls = Cell::new(0);
            let mut err = Some(err);
            let result = policy(OperationClass::Network, 5).run::<(), _>("op", |_| {
                calls.set(calls.get() + 1);
                Err(err.take().unwrap())
            });
            assert!(result.is_err());
            assert_eq!(calls.get(), 1);
        }
    }

    #[test]
    fn integrity_is_retried_exactly_once() {
        let calls = Cell::new(0);
        let result = policy(OperationClass::Network, 5).run::<(), _>("download", |_| {
            calls.set(calls.get() + 1);
            Err(SyncError::Integrity {
                path: "a".into(),
                expected: "x".into(),
                actual: "y".into(),
            })
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Integrity);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn filesystem_class_does_not_retry_network_errors() {
        let calls = Cell::new(0);
        let _ = policy(OperationClass::Filesystem, 3).run::<(), _>("rename", |_| {
            calls.set(calls.get() + 1);
            Err(network_error())
        });
        assert_eq!(calls.get(), 1);
    }
}
