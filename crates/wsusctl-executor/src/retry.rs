//! Retry executor: exponential backoff with jitter behind a circuit breaker.
//!
//! This is the single place that decides retry vs. terminal. Callers see
//! either the operation's value or one terminal error: `CircuitOpen`,
//! `RetryLimitExceeded` (wrapping the last failure), `Cancelled`, or the
//! non-retryable error itself.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use wsusctl_core::config::OperationsConfig;
use wsusctl_core::error::{Result, WsusError};
use wsusctl_core::traits::executor::OperationExecutor;
use wsusctl_core::types::{OperationOutput, OperationParams};

use crate::circuit::{Admission, CircuitRegistry, CircuitState};

/// Upper bound for a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Jitter is drawn from `[0, JITTER_RATIO * exponential delay]`.
const JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt (0 = try once).
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: MAX_BACKOFF,
        }
    }

    pub fn from_config(config: &OperationsConfig) -> Self {
        Self::new(
            config.max_retry_attempts,
            Duration::from_millis(config.initial_retry_delay_ms),
        )
    }

    fn exponential_ms(&self, attempt: u32) -> u64 {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        (self.initial_delay.as_millis() as u64).saturating_mul(factor)
    }

    /// Pre-jitter delay before retry number `attempt` (1-based):
    /// `min(initial * 2^(attempt-1), max_delay)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.exponential_ms(attempt)).min(self.max_delay)
    }

    /// Delay with jitter; `jitter_fraction` in `[0, 1]` picks the point in the
    /// jitter window.
    pub fn delay_for(&self, attempt: u32, jitter_fraction: f64) -> Duration {
        let exp = self.exponential_ms(attempt) as f64;
        let jitter = exp * JITTER_RATIO * jitter_fraction.clamp(0.0, 1.0);
        Duration::from_millis((exp + jitter) as u64).min(self.max_delay)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let fraction = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_for(attempt, fraction)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OperationsConfig::default())
    }
}

/// Wraps fallible async work with retry and per-operation circuit breaking.
pub struct RetryExecutor {
    policy: RetryPolicy,
    circuits: Arc<CircuitRegistry>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, circuits: Arc<CircuitRegistry>) -> Self {
        Self { policy, circuits }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    pub fn circuit_state(&self, operation_name: &str) -> CircuitState {
        self.circuits.state(operation_name)
    }

    pub fn reset_circuit(&self, operation_name: &str) {
        self.circuits.reset(operation_name);
    }

    /// Run `operation` until it succeeds, fails terminally, or the retry
    /// budget is spent. The operation must be safe to repeat.
    pub async fn execute<T, F, Fut>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if cancel.is_cancelled() {
            return Err(WsusError::Cancelled);
        }

        let permit = self.circuits.admit(operation_name)?;
        let max_retries = match permit.admission() {
            Admission::Normal => self.policy.max_retries,
            Admission::Trial => 0,
        };
        let mut attempt: u32 = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(WsusError::Cancelled),
                r = operation(cancel.child_token()) => r,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(
                            "✅ '{}' succeeded after {} retries",
                            operation_name,
                            attempt
                        );
                    }
                    permit.succeed();
                    return Ok(value);
                }
                // Cancellation and terminal errors say nothing about backend
                // health; dropping the permit releases a trial slot.
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            attempt += 1;
            if attempt > max_retries {
                let state = permit.fail();
                tracing::warn!(
                    "⚠️ '{}' failed after {} attempts (circuit {}): {}",
                    operation_name,
                    attempt,
                    state,
                    err
                );
                return Err(WsusError::RetryLimitExceeded {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.jittered_delay(attempt);
            tracing::debug!(
                "🔁 '{}' attempt {} failed ({}), retrying in {}ms",
                operation_name,
                attempt,
                err,
                delay.as_millis()
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WsusError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run a named script operation through the retry loop.
    pub async fn run_operation(
        &self,
        executor: &dyn OperationExecutor,
        name: &str,
        params: &OperationParams,
        cancel: &CancellationToken,
    ) -> Result<OperationOutput> {
        self.execute(name, cancel, |token| async move {
            executor.run(name, params, &token).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn executor(max_retries: u32, initial_ms: u64) -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy::new(max_retries, Duration::from_millis(initial_ms)),
            Arc::new(CircuitRegistry::new()),
        )
    }

    #[test]
    fn test_backoff_monotonic_until_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000));
        let delays: Vec<u64> = (1..=7).map(|a| policy.base_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_jitter_window() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        assert_eq!(policy.delay_for(2, 0.0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2, 1.0), Duration::from_millis(1100));
        // Jitter never pushes past the cap.
        assert_eq!(policy.delay_for(20, 1.0), MAX_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_fourth_call() {
        let exec = executor(3, 500);
        let observer = &exec;
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let result = exec
            .execute("Approve-WsusUpdate", &cancel, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    assert_eq!(observer.circuit_state("Approve-WsusUpdate"), CircuitState::Closed);
                    if n <= 3 {
                        Err(WsusError::Timeout(format!("call {n}")))
                    } else {
                        Ok("approved")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "approved");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3500), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(3850), "elapsed {elapsed:?}");
        assert_eq!(exec.circuit_state("Approve-WsusUpdate"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_passes_through() {
        let exec = executor(3, 100);
        let calls = AtomicU32::new(0);
        let result: Result<()> = exec
            .execute("Deny-WsusUpdate", &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(WsusError::Unauthorized("no rights".into())) }
            })
            .await;

        assert!(matches!(result, Err(WsusError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(exec.circuits().snapshot("Deny-WsusUpdate").unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_limit_records_one_circuit_failure() {
        let exec = executor(2, 100);
        let calls = AtomicU32::new(0);
        let result: Result<()> = exec
            .execute("Start-WsusSync", &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(WsusError::Unavailable("down".into())) }
            })
            .await;

        match result {
            Err(WsusError::RetryLimitExceeded { attempts, source, .. }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, WsusError::Unavailable(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(exec.circuits().snapshot("Start-WsusSync").unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_and_fails_fast() {
        let exec = executor(0, 100);
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let _: Result<()> = exec
                .execute("Invoke-WsusCleanup", &cancel, |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(WsusError::Timeout("slow".into())) }
                })
                .await;
        }
        assert_eq!(exec.circuit_state("Invoke-WsusCleanup"), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let result: Result<()> = exec
            .execute("Invoke-WsusCleanup", &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        // After cooldown one trial goes through and closes the circuit.
        tokio::time::advance(Duration::from_secs(61)).await;
        let result: Result<()> = exec
            .execute("Invoke-WsusCleanup", &cancel, |_| async { Ok(()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(exec.circuit_state("Invoke-WsusCleanup"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_is_not_a_failure() {
        let exec = executor(5, 10_000);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let result: Result<()> = exec
            .execute("Start-WsusSync", &cancel, |_| async {
                Err(WsusError::Conflict("sync already running".into()))
            })
            .await;

        assert!(matches!(result, Err(WsusError::Cancelled)));
        assert_eq!(exec.circuits().snapshot("Start-WsusSync").unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_abandoned_by_caller_timeout_does_not_wedge_circuit() {
        let exec = executor(0, 100);
        let cancel = CancellationToken::new();
        for _ in 0..5 {
            let _: Result<()> = exec
                .execute("Start-WsusSync", &cancel, |_| async {
                    Err(WsusError::Unavailable("down".into()))
                })
                .await;
        }
        assert_eq!(exec.circuit_state("Start-WsusSync"), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(61)).await;

        // The caller gives up on the trial and drops the future mid-call.
        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            exec.execute("Start-WsusSync", &cancel, |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, WsusError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(exec.circuit_state("Start-WsusSync"), CircuitState::HalfOpen);

        let result: Result<()> = exec
            .execute("Start-WsusSync", &cancel, |_| async { Ok(()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(exec.circuit_state("Start-WsusSync"), CircuitState::Closed);
    }
}
