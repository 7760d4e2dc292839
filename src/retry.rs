//! Bounded retry machinery shared by the phase engine and the integration
//! pipeline.
//!
//! Retrying is expressed once, as a policy value plus a generic attempt
//! runner, instead of nested loops with shared mutable counters.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// What happens when the attempt budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// Halt the run; state on disk stays exactly as last detected.
    Fatal,
    /// Mark the step complete anyway and proceed (iterative phases only).
    ForceAdvance,
}

/// Delay inserted between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    /// `base × attempt_number`.
    Linear(Duration),
    /// `base × 2^(attempt_number - 1)`.
    Exponential(Duration),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear(base) => *base * attempt,
            Backoff::Exponential(base) => *base * 2u32.saturating_pow(attempt.saturating_sub(1)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub on_exhaustion: Exhaustion,
}

impl RetryPolicy {
    pub fn fatal(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::None,
            on_exhaustion: Exhaustion::Fatal,
        }
    }

    pub fn force_advance(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::None,
            on_exhaustion: Exhaustion::ForceAdvance,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// What one attempt reports back to the runner.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The step finished; stop retrying.
    Done(T),
    /// No forward progress; retry with the policy's backoff.
    Retry,
    /// Retry after an attempt-specific delay (rate limiting).
    RetryAfter(Duration),
}

/// Terminal outcome of a bounded attempt loop.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome<T> {
    Completed(T),
    /// Budget exhausted; carries the policy's exhaustion decision.
    Exhausted(Exhaustion),
}

impl<T> RunOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            RunOutcome::Completed(value) => Some(value),
            RunOutcome::Exhausted(_) => None,
        }
    }
}

/// Run `attempt` up to `policy.max_attempts` times, 1-indexed. Errors from an
/// attempt propagate immediately; they are not retried (callers convert
/// retryable failures into `Attempt::Retry`).
pub async fn run_attempts<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut attempt: F,
) -> anyhow::Result<RunOutcome<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<Attempt<T>>>,
{
    for number in 1..=policy.max_attempts {
        match attempt(number).await? {
            Attempt::Done(value) => {
                debug!(step = label, attempt = number, "step completed");
                return Ok(RunOutcome::Completed(value));
            }
            Attempt::Retry => {
                let delay = policy.backoff.delay(number);
                debug!(step = label, attempt = number, delay_secs = delay.as_secs(), "retrying");
                if number < policy.max_attempts && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Attempt::RetryAfter(delay) => {
                warn!(step = label, attempt = number, delay_secs = delay.as_secs(), "backing off");
                if number < policy.max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    warn!(step = label, max_attempts = policy.max_attempts, "attempt budget exhausted");
    Ok(RunOutcome::Exhausted(policy.on_exhaustion))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_completes_on_first_success() {
        let calls = AtomicU32::new(0);
        let outcome = run_attempts(&RetryPolicy::fatal(3), "step", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Attempt::Done(42)) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Completed(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_done() {
        let calls = AtomicU32::new(0);
        let outcome = run_attempts(&RetryPolicy::fatal(5), "step", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Ok(Attempt::Retry)
                } else {
                    Ok(Attempt::Done("ok"))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Completed("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_fatal_after_exact_budget() {
        let calls = AtomicU32::new(0);
        let outcome: RunOutcome<()> = run_attempts(&RetryPolicy::fatal(4), "step", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Attempt::Retry) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, RunOutcome::Exhausted(Exhaustion::Fatal));
        // Exactly the configured budget, never fewer, never more.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_exhaustion_force_advance() {
        let outcome: RunOutcome<()> =
            run_attempts(&RetryPolicy::force_advance(2), "step", |_| async {
                Ok(Attempt::Retry)
            })
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Exhausted(Exhaustion::ForceAdvance));
    }

    #[tokio::test]
    async fn test_error_propagates_immediately() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<RunOutcome<()>> =
            run_attempts(&RetryPolicy::fatal(5), "step", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("broken precondition")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_sleeps_requested_delay() {
        let outcome = run_attempts(&RetryPolicy::fatal(2), "step", |attempt| async move {
            if attempt == 1 {
                Ok(Attempt::RetryAfter(Duration::from_secs(30)))
            } else {
                Ok(Attempt::Done(attempt))
            }
        })
        .await
        .unwrap();
        // Paused clock: the sleep auto-advances, proving it was awaited.
        assert_eq!(outcome, RunOutcome::Completed(2));
    }

    #[test]
    fn test_backoff_delays() {
        assert_eq!(Backoff::None.delay(3), Duration::ZERO);
        assert_eq!(
            Backoff::Linear(Duration::from_secs(30)).delay(3),
            Duration::from_secs(90)
        );
        assert_eq!(
            Backoff::Exponential(Duration::from_secs(2)).delay(1),
            Duration::from_secs(2)
        );
        assert_eq!(
            Backoff::Exponential(Duration::from_secs(2)).delay(4),
            Duration::from_secs(16)
        );
    }
}
