use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::{Duration, Instant};

use super::classify::ErrorClassifier;
use super::policy::RetryPolicy;
use crate::error::{CanonicalError, RawFailure};
use crate::ui::prelude::*;

/// Result of running an operation under a [`RetryPolicy`]
#[derive(Debug)]
pub struct OperationOutcome<T> {
    pub result: Result<T, CanonicalError>,
    pub attempts: u32,
    pub elapsed: Duration,
    pub finished_at: DateTime<Utc>,
}

impl<T> OperationOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&CanonicalError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, CanonicalError> {
        self.result
    }
}

/// Runs fallible async operations with bounded exponential backoff.
///
/// The executor knows nothing about the operation; it only looks at the failure
/// (through the policy predicate or the classifier) to decide whether to go again.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    classifier: ErrorClassifier,
}

impl RetryExecutor {
    pub fn new(classifier: ErrorClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub async fn run<T, E, F, Fut>(
        &self,
        mut operation: F,
        policy: &RetryPolicy,
    ) -> OperationOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<RawFailure>,
    {
        let started = Instant::now();
        let max_attempts = policy.effective_attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let failure: RawFailure = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        emit(
                            Level::Debug,
                            "retry.recovered",
                            &format!("Operation succeeded on attempt {attempt}"),
                            Some(serde_json::json!({ "attempts": attempt })),
                        );
                    }
                    return OperationOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                        finished_at: Utc::now(),
                    };
                }
                Err(err) => err.into(),
            };

            let error = self.classifier.classify(&failure);
            let should_retry = match policy.predicate() {
                Some(predicate) => predicate(&failure, attempt),
                None => error.retryable,
            };

            if attempt >= max_attempts || !should_retry {
                if let Some(callback) = policy.exhausted_callback() {
                    callback(&error, attempt);
                }
                emit(
                    Level::Debug,
                    "retry.gave_up",
                    &format!(
                        "Giving up after {attempt} attempt(s): {} ({})",
                        error.code, error.detail
                    ),
                    Some(serde_json::json!({
                        "attempts": attempt,
                        "code": error.code.as_str(),
                        "retryable": should_retry,
                    })),
                );
                return OperationOutcome {
                    result: Err(error),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    finished_at: Utc::now(),
                };
            }

            let delay = next_delay(policy, attempt);

            if let Some(callback) = policy.attempt_callback() {
                callback(&error, attempt, delay);
            }
            emit(
                Level::Debug,
                "retry.attempt_failed",
                &format!(
                    "Attempt {attempt}/{max_attempts} failed with {}, retrying in {}ms",
                    error.code,
                    delay.as_millis()
                ),
                Some(serde_json::json!({
                    "attempt": attempt,
                    "max_attempts": max_attempts,
                    "delay_ms": delay.as_millis() as u64,
                    "code": error.code.as_str(),
                })),
            );

            tokio::time::sleep(delay).await;
        }
    }
}

// ThreadRng is not Send, keep it out of the async state machine
fn next_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    if policy.jitter {
        policy.jittered_delay(attempt, &mut rand::thread_rng())
    } else {
        policy.delay_for_attempt(attempt)
    }
}
