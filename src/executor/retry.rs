use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::types::{RetryConfig, RetryProfile};
use crate::provider::service::ServiceError;
use crate::state::models::ResourceKind;

/// Result of a retried call, with the number of attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ServiceError>,
    pub attempts: u32,
}

/// Exponential backoff with jitter over typed service errors.
#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
    preserve_existing: bool,
}

impl RetryManager {
    pub fn new(config: RetryConfig, preserve_existing: bool) -> Self {
        Self {
            config,
            preserve_existing,
        }
    }

    pub fn profile_for(&self, kind: ResourceKind) -> RetryProfile {
        self.config.profile_for(kind)
    }

    /// Transient errors are retried. A conflict is retried only when existing
    /// resources are not preserved. Everything else is final.
    pub fn should_retry(&self, err: &ServiceError) -> bool {
        if err.is_transient() {
            return true;
        }
        if err.is_conflict() {
            return !self.preserve_existing;
        }
        false
    }

    /// `min(base * 2^n * (1 + jitter), max_delay)` with jitter uniform in
    /// `[0, max_jitter]`. `retry` counts from zero.
    pub fn calculate_delay(profile: &RetryProfile, retry: u32) -> Duration {
        let jitter = if profile.max_jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=profile.max_jitter)
        } else {
            0.0
        };
        Self::delay_with_jitter(profile, retry, jitter)
    }

    fn delay_with_jitter(profile: &RetryProfile, retry: u32, jitter: f64) -> Duration {
        let exponential = profile.base_delay_ms as f64 * 2f64.powi(retry.min(32) as i32);
        let delay = (exponential * (1.0 + jitter)).min(profile.max_delay_ms as f64);
        Duration::from_millis(delay.max(0.0) as u64)
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts or would exceed the wall-clock ceiling of the profile.
    ///
    /// `on_retry` is told about each retry before the backoff sleep.
    pub async fn execute_with_retry<F, Fut, T, R>(
        &self,
        kind: ResourceKind,
        operation_name: &str,
        token: &CancellationToken,
        mut f: F,
        mut on_retry: R,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
        R: FnMut(u32, &ServiceError, Duration),
    {
        let profile = self.profile_for(kind);
        let max_attempts = profile.max_attempts.max(1);
        let started = Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let err = match f().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    }
                }
                Err(e) => e,
            };

            if !self.should_retry(&err) {
                tracing::debug!(operation = operation_name, attempt = attempts, error = %err, "Error is not retryable");
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                };
            }
            if attempts >= max_attempts {
                tracing::error!(
                    operation = operation_name,
                    attempts,
                    error = %err,
                    "All retry attempts exhausted"
                );
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                };
            }

            let delay = Self::calculate_delay(&profile, attempts - 1);
            if started.elapsed() + delay > profile.max_elapsed() {
                tracing::error!(
                    operation = operation_name,
                    attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Retry time budget exhausted"
                );
                return RetryOutcome {
                    result: Err(err),
                    attempts,
                };
            }

            tracing::warn!(
                operation = operation_name,
                attempt = attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );
            on_retry(attempts, &err, delay);

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return RetryOutcome {
                        result: Err(ServiceError::Cancelled),
                        attempts,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
