//! Bulk operation coordinator: bounded fan-out with per-item isolation.
//!
//! "Approve 500 updates" or "move 2000 computers" against a backend that
//! only tolerates a handful of concurrent requests:
//!
//! ```text
//! items ──▶ one task per item ──▶ Semaphore(max parallelism) ──▶ action
//!                                        │
//!             atomic completed/failed ◀──┘──▶ progress sink
//!                                        │
//!                       join all ──▶ BulkOperationResult
//! ```
//!
//! A failing item is recorded and never cancels its siblings.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wsusctl_core::config::OperationsConfig;
use wsusctl_core::error::{Result, WsusError};
use wsusctl_core::traits::executor::OperationExecutor;
use wsusctl_core::types::OperationParams;

use crate::retry::RetryExecutor;

pub const DEFAULT_PARALLELISM: usize = 5;

/// Snapshot handed to the progress sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Item about to run; `None` on the final report.
    pub current_item: Option<String>,
}

pub type ProgressSink = Arc<dyn Fn(BulkProgress) + Send + Sync>;

/// One failed item.
#[derive(Debug)]
pub struct BulkItemError {
    pub item_id: String,
    pub message: String,
    pub cause: WsusError,
}

/// Aggregate outcome of one batch. Built fresh per call, never persisted.
#[derive(Debug)]
pub struct BulkOperationResult {
    /// No item failed. Cancelled batches may still report success for the
    /// items they ran; check `cancelled` and `not_started()`.
    pub success: bool,
    pub total_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    /// Ids of the items whose action completed, in completion order.
    pub succeeded: Vec<String>,
    pub errors: Vec<BulkItemError>,
    pub duration: Duration,
    pub cancelled: bool,
}

impl BulkOperationResult {
    /// Items that never began executing.
    pub fn not_started(&self) -> usize {
        self.total_count
            .saturating_sub(self.success_count + self.failed_count)
    }

    /// "498 succeeded, 2 failed of 500" style line for status displays.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} succeeded, {} failed of {} in {:.1}s",
            self.success_count,
            self.failed_count,
            self.total_count,
            self.duration.as_secs_f64()
        );
        if self.cancelled {
            line.push_str(&format!(" (cancelled, {} not started)", self.not_started()));
        }
        line
    }
}

/// A named script operation applied to every item of a batch.
#[derive(Debug, Clone)]
pub struct NamedBatch {
    pub operation: String,
    /// Parameter that receives the item id.
    pub item_param: String,
    /// Parameters shared by every item.
    pub params: OperationParams,
}

enum ItemOutcome {
    NotStarted,
    Completed(String),
    Failed(BulkItemError),
}

struct BatchState {
    total: usize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    sink: Option<ProgressSink>,
    report_lock: Mutex<()>,
}

impl BatchState {
    fn report(&self, current_item: Option<String>) {
        let Some(sink) = &self.sink else { return };
        // Counters only grow; reading them under the lock keeps the
        // sequence of reports monotonic.
        let _guard = self.report_lock.lock().unwrap_or_else(|e| e.into_inner());
        sink(BulkProgress {
            total: self.total,
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            current_item,
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BulkOperationCoordinator {
    max_parallelism: usize,
}

impl BulkOperationCoordinator {
    pub fn new(max_parallelism: usize) -> Self {
        Self {
            max_parallelism: max_parallelism.max(1),
        }
    }

    pub fn from_config(config: &OperationsConfig) -> Self {
        Self::new(config.max_concurrent_operations)
    }

    pub fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Run `action` for every item with at most `max_parallelism` in flight.
    ///
    /// Cancellation stops items that have not started; started items get a
    /// child token and either finish or observe it. Item errors never
    /// propagate: they end up in the returned aggregate.
    pub async fn run<F, Fut>(
        &self,
        items: Vec<String>,
        cancel: &CancellationToken,
        progress: Option<ProgressSink>,
        action: F,
    ) -> BulkOperationResult
    where
        F: Fn(String, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let start = Instant::now();
        let state = Arc::new(BatchState {
            total: items.len(),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            sink: progress,
            report_lock: Mutex::new(()),
        });
        let semaphore = Arc::new(Semaphore::new(self.max_parallelism));
        let action = Arc::new(action);
        let mut tasks = JoinSet::new();

        tracing::info!(
            "📦 Bulk operation: {} items, parallelism {}",
            state.total,
            self.max_parallelism
        );

        for item_id in items {
            if cancel.is_cancelled() {
                break;
            }
            let state = state.clone();
            let semaphore = semaphore.clone();
            let action = action.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return ItemOutcome::NotStarted,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return ItemOutcome::NotStarted,
                    },
                };
                if cancel.is_cancelled() {
                    return ItemOutcome::NotStarted;
                }

                state.report(Some(item_id.clone()));

                let outcome = AssertUnwindSafe((*action)(item_id.clone(), cancel.child_token()))
                    .catch_unwind()
                    .await;

                let cause = match outcome {
                    Ok(Ok(())) => {
                        state.completed.fetch_add(1, Ordering::SeqCst);
                        return ItemOutcome::Completed(item_id);
                    }
                    Ok(Err(e)) => e,
                    Err(panic) => WsusError::Internal(format!(
                        "item action panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                };

                state.failed.fetch_add(1, Ordering::SeqCst);
                if cause.is_cancelled() {
                    tracing::debug!("Bulk item '{}' observed cancellation", item_id);
                } else {
                    tracing::warn!("⚠️ Bulk item '{}' failed: {}", item_id, cause);
                }
                ItemOutcome::Failed(BulkItemError {
                    item_id,
                    message: cause.to_string(),
                    cause,
                })
            });
        }

        let mut errors = Vec::new();
        let mut succeeded = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ItemOutcome::Failed(err)) => errors.push(err),
                Ok(ItemOutcome::Completed(item_id)) => succeeded.push(item_id),
                Ok(ItemOutcome::NotStarted) => {}
                Err(e) => tracing::error!("Bulk worker task died: {e}"),
            }
        }

        state.report(None);

        let success_count = state.completed.load(Ordering::SeqCst);
        let failed_count = state.failed.load(Ordering::SeqCst);
        let result = BulkOperationResult {
            success: failed_count == 0,
            total_count: state.total,
            success_count,
            failed_count,
            succeeded,
            errors,
            duration: start.elapsed(),
            cancelled: cancel.is_cancelled(),
        };
        tracing::info!("📦 Bulk operation finished: {}", result.summary());
        result
    }

    /// Apply one named script operation to every item, optionally through
    /// the retry executor.
    pub async fn run_named(
        &self,
        executor: Arc<dyn OperationExecutor>,
        retry: Option<Arc<RetryExecutor>>,
        batch: NamedBatch,
        items: Vec<String>,
        cancel: &CancellationToken,
        progress: Option<ProgressSink>,
    ) -> BulkOperationResult {
        let batch = Arc::new(batch);
        self.run(items, cancel, progress, move |item, token| {
            let executor = executor.clone();
            let retry = retry.clone();
            let batch = batch.clone();
            async move {
                let mut params = batch.params.clone();
                params.insert(batch.item_param.clone(), serde_json::Value::String(item));
                match retry {
                    Some(retry) => retry
                        .run_operation(executor.as_ref(), &batch.operation, &params, &token)
                        .await
                        .map(|_| ()),
                    None => executor
                        .run(&batch.operation, &params, &token)
                        .await
                        .map(|_| ()),
                }
            }
        })
        .await
    }
}

impl Default for BulkOperationCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_PARALLELISM)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
