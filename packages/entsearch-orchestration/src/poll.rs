use crate::error::{PipelineError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of a single readiness probe evaluation.
///
/// `TransientError` (connection refused, index not created yet) is retried
/// exactly like `NotYet`: early probes against a service mid-startup are
/// expected to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    NotYet,
    TransientError(String),
}

/// Fixed-interval polling budget. The interval never grows: the wait
/// windows here are tens of seconds to a few minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollBudget {
    fn default() -> Self {
        // 120 s window at a 2 s cadence.
        Self {
            max_attempts: 60,
            interval: Duration::from_secs(2),
        }
    }
}

impl PollBudget {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Budget covering `window` at `interval` cadence, rounding attempts up
    /// so the full window is always observed.
    pub fn from_window(window: Duration, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(200));
        let attempts = (window.as_secs_f64() / interval.as_secs_f64()).ceil() as u32;
        Self::new(attempts.max(1), interval)
    }
}

/// Evaluate `probe` until it reports `Ready`, sleeping `budget.interval`
/// between attempts. At most `budget.max_attempts` evaluations occur; on
/// exhaustion the last observed state is carried in the `PollTimeout`.
pub async fn poll<T, F, Fut>(condition: &str, budget: PollBudget, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollOutcome<T>>,
{
    let mut last_state = String::from("never evaluated");

    for attempt in 1..=budget.max_attempts {
        match probe().await {
            PollOutcome::Ready(value) => {
                info!(
                    "'{}' ready after {} attempt{}",
                    condition,
                    attempt,
                    if attempt == 1 { "" } else { "s" }
                );
                return Ok(value);
            }
            PollOutcome::NotYet => {
                debug!("'{}' not yet ready (attempt {})", condition, attempt);
                last_state = format!("not yet ready at attempt {attempt}");
            }
            PollOutcome::TransientError(detail) => {
                debug!("'{}' transient error (attempt {}): {}", condition, attempt, detail);
                last_state = detail;
            }
        }

        if attempt < budget.max_attempts {
            tokio::time::sleep(budget.interval).await;
        }
    }

    Err(PipelineError::PollTimeout {
        condition: condition.to_string(),
        attempts: budget.max_attempts,
        last_state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ready_on_attempt_j_takes_exactly_j_evaluations() {
        for ready_at in [1u32, 3, 5] {
            let calls = Arc::new(AtomicU32::new(0));
            let calls_ref = calls.clone();

            let result = poll("test condition", PollBudget::new(5, Duration::from_secs(1)), {
                move || {
                    let calls = calls_ref.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        if n >= ready_at {
                            PollOutcome::Ready(n)
                        } else {
                            PollOutcome::NotYet
                        }
                    }
                }
            })
            .await;

            assert_eq!(result.unwrap(), ready_at);
            assert_eq!(calls.load(Ordering::SeqCst), ready_at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_ready_times_out_with_poll_timeout() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = calls.clone();

        let result: Result<()> = poll(
            "stuck condition",
            PollBudget::new(4, Duration::from_secs(2)),
            move || {
                let calls = calls_ref.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    PollOutcome::NotYet
                }
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(PipelineError::PollTimeout {
                condition,
                attempts,
                ..
            }) => {
                assert_eq!(condition, "stuck condition");
                assert_eq!(attempts, 4);
            }
            other => panic!("expected PollTimeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_is_retried_not_fatal() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_ref = calls.clone();

        let result = poll(
            "flaky condition",
            PollBudget::new(3, Duration::from_millis(500)),
            move || {
                let calls = calls_ref.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        PollOutcome::TransientError("connection refused".to_string())
                    } else {
                        PollOutcome::Ready("up")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "up");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_carries_last_transient_state() {
        let result: Result<()> = poll(
            "index visible",
            PollBudget::new(2, Duration::from_secs(1)),
            || async { PollOutcome::TransientError("index 'entities-x' does not exist".to_string()) },
        )
        .await;

        match result {
            Err(PipelineError::PollTimeout { last_state, .. }) => {
                assert_eq!(last_state, "index 'entities-x' does not exist");
            }
            other => panic!("expected PollTimeout, got {other:?}"),
        }
    }

    #[test]
    fn test_budget_from_window_rounds_up() {
        let budget = PollBudget::from_window(Duration::from_secs(120), Duration::from_secs(2));
        assert_eq!(budget.max_attempts, 60);

        let uneven = PollBudget::from_window(Duration::from_secs(5), Duration::from_secs(2));
        assert_eq!(uneven.max_attempts, 3);
    }

    #[test]
    fn test_budget_floors_interval_and_attempts() {
        let budget = PollBudget::from_window(Duration::from_secs(0), Duration::from_millis(0));
        assert_eq!(budget.max_attempts, 1);
        assert_eq!(budget.interval, Duration::from_millis(200));
    }
}
