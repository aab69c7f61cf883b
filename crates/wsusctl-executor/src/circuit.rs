//! Per-operation circuit breaker.
//!
//! Each operation name owns one circuit:
//!
//! ```text
//! Closed ──(5 consecutive failures)──▶ Open ──(60s cooldown)──▶ HalfOpen
//!    ▲                                   ▲                         │
//!    └──────────── trial succeeds ───────┼──────── trial fails ────┘
//! ```
//!
//! The registry is an injected component (no statics) so every
//! `RetryExecutor` and every test can own an isolated set of circuits.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use wsusctl_core::error::{Result, WsusError};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of one circuit, for dashboards.
#[derive(Debug, Clone, Copy)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure: Option<Instant>,
    /// Remaining cooldown while Open.
    pub retry_after: Option<Duration>,
}

/// What an admitted call is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed: the normal retry budget applies.
    Normal,
    /// Circuit half-open: exactly one attempt, its outcome decides the state.
    Trial,
}

#[derive(Debug)]
struct CircuitEntry {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl Default for CircuitEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }
}

/// An admitted call. Settle it with [`CircuitPermit::succeed`] or
/// [`CircuitPermit::fail`]; dropping an unsettled trial permit gives the
/// half-open slot back without judging the backend.
#[must_use]
pub struct CircuitPermit<'a> {
    circuits: &'a CircuitRegistry,
    operation: String,
    admission: Admission,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.circuits.record_success(&self.operation);
    }

    pub fn fail(mut self) -> CircuitState {
        self.settled = true;
        self.circuits.record_failure(&self.operation)
    }
}

impl std::fmt::Debug for CircuitPermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("operation", &self.operation)
            .field("admission", &self.admission)
            .finish()
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            tracing::debug!("🔌 Trial for '{}' abandoned, slot released", self.operation);
            self.circuits.release_trial(&self.operation);
        }
    }
}

/// Circuit states keyed by operation name.
pub struct CircuitRegistry {
    circuits: Mutex<HashMap<String, CircuitEntry>>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitRegistry {
    /// 5 consecutive failures, 1 minute cooldown.
    pub fn new() -> Self {
        Self::with_params(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }

    pub fn with_params(threshold: u32, cooldown: Duration) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    fn circuits(&self) -> MutexGuard<'_, HashMap<String, CircuitEntry>> {
        // A panic while holding the lock cannot leave an entry half-written.
        self.circuits.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide whether a call for `operation` may proceed.
    ///
    /// Creates a Closed circuit on first use. An Open circuit whose cooldown
    /// has elapsed moves to HalfOpen and admits a single trial.
    pub fn admit(&self, operation: &str) -> Result<CircuitPermit<'_>> {
        let admission = self.admit_raw(operation)?;
        Ok(CircuitPermit {
            circuits: self,
            operation: operation.to_string(),
            admission,
            settled: false,
        })
    }

    fn admit_raw(&self, operation: &str) -> Result<Admission> {
        let mut circuits = self.circuits();
        let entry = circuits.entry(operation.to_string()).or_default();

        match entry.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = entry
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(self.cooldown);
                if elapsed < self.cooldown {
                    let remaining = self.cooldown - elapsed;
                    return Err(WsusError::CircuitOpen {
                        operation: operation.to_string(),
                        retry_after_secs: remaining.as_secs().max(1),
                    });
                }
                tracing::info!("🔌 Circuit '{}' half-open, allowing trial call", operation);
                entry.state = CircuitState::HalfOpen;
                entry.trial_in_flight = true;
                Ok(Admission::Trial)
            }
            CircuitState::HalfOpen => {
                if entry.trial_in_flight {
                    return Err(WsusError::CircuitOpen {
                        operation: operation.to_string(),
                        retry_after_secs: 1,
                    });
                }
                entry.trial_in_flight = true;
                Ok(Admission::Trial)
            }
        }
    }

    /// A call succeeded: the failure streak ends, a half-open circuit closes.
    pub fn record_success(&self, operation: &str) {
        let mut circuits = self.circuits();
        let entry = circuits.entry(operation.to_string()).or_default();
        if entry.state == CircuitState::HalfOpen {
            tracing::info!("✅ Circuit '{}' closed after successful trial", operation);
            entry.state = CircuitState::Closed;
        }
        entry.failure_count = 0;
        entry.trial_in_flight = false;
    }

    /// A call exhausted its retries. Returns the resulting state.
    pub fn record_failure(&self, operation: &str) -> CircuitState {
        let mut circuits = self.circuits();
        let entry = circuits.entry(operation.to_string()).or_default();
        entry.failure_count = entry.failure_count.saturating_add(1);
        entry.last_failure = Some(Instant::now());
        entry.trial_in_flight = false;

        let opens = match entry.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => entry.failure_count >= self.threshold,
            CircuitState::Open => false,
        };
        if opens {
            tracing::warn!(
                "⛔ Circuit '{}' opened after {} consecutive failures (cooldown {}s)",
                operation,
                entry.failure_count,
                self.cooldown.as_secs()
            );
            entry.state = CircuitState::Open;
        }
        entry.state
    }

    /// Give back a trial slot without judging the backend (cancellation,
    /// non-retryable errors).
    pub fn release_trial(&self, operation: &str) {
        if let Some(entry) = self.circuits().get_mut(operation) {
            entry.trial_in_flight = false;
        }
    }

    /// Operator escape hatch: force the circuit back to Closed.
    pub fn reset(&self, operation: &str) {
        let mut circuits = self.circuits();
        if let Some(entry) = circuits.get_mut(operation) {
            *entry = CircuitEntry::default();
            tracing::info!("🔄 Circuit '{}' reset", operation);
        }
    }

    /// Current state. Never mutates: an Open circuit past its cooldown still
    /// reads as Open until a call is admitted.
    pub fn state(&self, operation: &str) -> CircuitState {
        self.circuits()
            .get(operation)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, operation: &str) -> Option<CircuitSnapshot> {
        self.circuits().get(operation).map(|e| self.to_snapshot(e))
    }

    /// All known circuits, sorted by operation name.
    pub fn snapshots(&self) -> Vec<(String, CircuitSnapshot)> {
        let circuits = self.circuits();
        let mut all: Vec<_> = circuits
            .iter()
            .map(|(name, e)| (name.clone(), self.to_snapshot(e)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn to_snapshot(&self, entry: &CircuitEntry) -> CircuitSnapshot {
        let retry_after = match (entry.state, entry.last_failure) {
            (CircuitState::Open, Some(t)) => Some(self.cooldown.saturating_sub(t.elapsed())),
            _ => None,
        };
        CircuitSnapshot {
            state: entry.state,
            failure_count: entry.failure_count,
            last_failure: entry.last_failure,
            retry_after,
        }
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_exactly_at_threshold() {
        let circuits = CircuitRegistry::new();
        for i in 1..=4 {
            let permit = circuits.admit("sync").unwrap();
            assert_eq!(permit.fail(), CircuitState::Closed, "failure {i}");
        }
        let permit = circuits.admit("sync").unwrap();
        assert_eq!(permit.fail(), CircuitState::Open);
        assert!(circuits.admit("sync").unwrap_err().is_circuit_open());
    }

    #[test]
    fn test_success_breaks_failure_streak() {
        let circuits = CircuitRegistry::new();
        for _ in 0..4 {
            circuits.record_failure("approve");
        }
        circuits.record_success("approve");
        for _ in 0..4 {
            circuits.record_failure("approve");
        }
        assert_eq!(circuits.state("approve"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_then_single_trial() {
        let circuits = CircuitRegistry::new();
        for _ in 0..5 {
            circuits.record_failure("cleanup");
        }

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(circuits.admit("cleanup").is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        // Reading the state never performs the Open -> HalfOpen move.
        assert_eq!(circuits.state("cleanup"), CircuitState::Open);

        let trial = circuits.admit("cleanup").unwrap();
        assert_eq!(trial.admission(), Admission::Trial);
        assert_eq!(circuits.state("cleanup"), CircuitState::HalfOpen);
        // A second caller is refused while the trial is in flight.
        assert!(circuits.admit("cleanup").unwrap_err().is_circuit_open());

        trial.succeed();
        assert_eq!(circuits.state("cleanup"), CircuitState::Closed);
        assert_eq!(circuits.snapshot("cleanup").unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let circuits = CircuitRegistry::new();
        for _ in 0..5 {
            circuits.record_failure("sync");
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        let trial = circuits.admit("sync").unwrap();
        assert_eq!(trial.admission(), Admission::Trial);
        assert_eq!(trial.fail(), CircuitState::Open);

        let snap = circuits.snapshot("sync").unwrap();
        assert_eq!(snap.retry_after, Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_the_slot() {
        let circuits = CircuitRegistry::new();
        for _ in 0..5 {
            circuits.record_failure("sync");
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let trial = circuits.admit("sync").unwrap();
        drop(trial);
        assert_eq!(circuits.state("sync"), CircuitState::HalfOpen);

        let next = circuits.admit("sync").unwrap();
        assert_eq!(next.admission(), Admission::Trial);
        next.succeed();
        assert_eq!(circuits.state("sync"), CircuitState::Closed);
    }

    #[test]
    fn test_reset_and_pure_reads() {
        let circuits = CircuitRegistry::new();
        assert_eq!(circuits.state("unknown"), CircuitState::Closed);
        assert!(circuits.snapshot("unknown").is_none());
        assert!(circuits.snapshots().is_empty());

        for _ in 0..5 {
            circuits.record_failure("decline");
        }
        assert_eq!(circuits.state("decline"), CircuitState::Open);
        circuits.reset("decline");
        assert_eq!(circuits.state("decline"), CircuitState::Closed);
        assert_eq!(circuits.admit("decline").unwrap().admission(), Admission::Normal);
    }
}
