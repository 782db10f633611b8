//! Bounded retry loop with a fixed backoff schedule.
//!
//! The schedule is not exponential: each retry waits the duration at its
//! index (defaults 5 s then 10 s). The wait fully suspends the loop, so at
//! most one attempt is ever in flight. The loop is an explicit counter, not
//! recursion, so the bound holds even if a policy is misconfigured.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::ApiError;

/// Backoff schedule for one logical request. `delays.len()` is the retry
/// budget; three total attempts under the default schedule.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: vec![Duration::from_secs(5), Duration::from_secs(10)],
        }
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// A policy that never retries; every failure is terminal.
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    pub fn max_retries(&self) -> usize {
        self.delays.len()
    }

    fn delay(&self, retry_index: usize) -> Duration {
        self.delays[retry_index]
    }
}

/// Drive `attempt` until it succeeds, fails fatally, or exhausts the budget.
///
/// Only [`ApiError::is_retryable`] failures consume budget; the first fatal
/// failure is returned unchanged, as is the final attempt's error on
/// exhaustion. One warning diagnostic is emitted per retry (path, error,
/// attempt number, delay); first-attempt success emits nothing.
pub(crate) async fn run_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    path: &str,
    mut attempt: F,
) -> Result<T, ApiError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt_index = 0usize;
    loop {
        match attempt(attempt_index).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt_index < policy.max_retries() => {
                let delay = policy.delay(attempt_index);
                warn!(
                    path,
                    error = %error,
                    attempt = attempt_index + 1,
                    delay_secs = delay.as_secs_f64(),
                    "request failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt_index += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tokio::time::Instant;

    fn cold_start(status: u16, body: impl Into<String>) -> ApiError {
        ApiError::Status {
            path: "/flux/run".into(),
            status,
            body: body.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_awaited_in_order() {
        let observed: RefCell<Vec<Instant>> = RefCell::new(Vec::new());
        let result = run_with_backoff(&RetryPolicy::default(), "/flux/run", |attempt| {
            observed.borrow_mut().push(Instant::now());
            async move {
                if attempt < 2 {
                    Err(cold_start(502, "cold start"))
                } else {
                    Ok("half image")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "half image");
        let observed = observed.borrow();
        assert_eq!(observed.len(), 3);
        assert_eq!(observed[1] - observed[0], Duration::from_secs(5));
        assert_eq!(observed[2] - observed[1], Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_status_fails_immediately_without_delay() {
        let started = Instant::now();
        let mut attempts = 0u32;
        let result: Result<(), _> =
            run_with_backoff(&RetryPolicy::default(), "/flux/run", |_| {
                attempts += 1;
                async { Err(cold_start(401, "unauthorized")) }
            })
            .await;

        assert_eq!(attempts, 1);
        assert_eq!(result.unwrap_err().status(), Some(401));
        assert_eq!(Instant::now() - started, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_final_attempt_error() {
        let result: Result<(), _> =
            run_with_backoff(&RetryPolicy::default(), "/nano/process", |attempt| async move {
                Err(cold_start(503, format!("attempt {}", attempt)))
            })
            .await;

        match result.unwrap_err() {
            ApiError::Status { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "attempt 2");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn connectivity_failures_share_the_status_budget() {
        // 502 on the first attempt, a genuine connect failure on the second,
        // success on the third: one budget covers both retryable kinds.
        let policy = RetryPolicy::new(vec![Duration::from_millis(1), Duration::from_millis(1)]);
        let result = run_with_backoff(&policy, "/flux/run", |attempt| async move {
            match attempt {
                0 => Err(cold_start(502, "cold start")),
                1 => {
                    let source = reqwest::Client::new()
                        .get("http://127.0.0.1:1/")
                        .send()
                        .await
                        .expect_err("connect should fail");
                    Err(ApiError::transport("/flux/run", source))
                }
                _ => Ok("done"),
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_policy_never_sleeps() {
        let mut attempts = 0u32;
        let result: Result<(), _> = run_with_backoff(&RetryPolicy::none(), "/flux/run", |_| {
            attempts += 1;
            async { Err(cold_start(503, "still cold")) }
        })
        .await;

        assert_eq!(attempts, 1);
        assert!(result.is_err());
    }
}
