//! Task handlers: what actually happens when a scheduled task runs.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use wsusctl_core::config::EvaluationPolicy;
use wsusctl_core::error::{Result, WsusError};
use wsusctl_core::traits::executor::OperationExecutor;
use wsusctl_core::types::{InstallationCounts, OperationOutput, OperationParams, UpdateInfo};
use wsusctl_executor::bulk::{BulkOperationCoordinator, BulkOperationResult, NamedBatch};
use wsusctl_executor::retry::RetryExecutor;

use crate::staged::{PromotionTracker, TrackingEntry, TrackingStatus};
use crate::tasks::{OperationType, RunStatus, ScheduledTask, StagedApprovalConfig};

pub const OP_CLEANUP: &str = "Invoke-WsusCleanup";
pub const OP_SYNC: &str = "Start-WsusSync";
pub const OP_GET_UPDATES: &str = "Get-WsusUpdates";
pub const OP_GET_INSTALL_COUNTS: &str = "Get-WsusInstallationCounts";
pub const OP_APPROVE: &str = "Approve-WsusUpdate";
pub const OP_DECLINE: &str = "Deny-WsusUpdate";

/// Result of one task execution.
#[derive(Debug, Clone)]
pub struct TaskRunOutcome {
    pub status: RunStatus,
    pub message: String,
    /// The task's tracking entries after the run, including any progress
    /// made before a failure.
    pub tracking: Vec<TrackingEntry>,
    /// The run stopped on cancellation. `tracking` still holds what was done.
    pub cancelled: bool,
}

impl TaskRunOutcome {
    pub fn new(status: RunStatus, message: impl Into<String>, tracking: Vec<TrackingEntry>) -> Self {
        Self {
            status,
            message: message.into(),
            tracking,
            cancelled: false,
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        task: &ScheduledTask,
        tracking: Vec<TrackingEntry>,
        cancel: &CancellationToken,
    ) -> Result<TaskRunOutcome>;

    /// Re-evaluate tracking entries against fresh telemetry without running
    /// the task.
    async fn evaluate(
        &self,
        _task: &ScheduledTask,
        tracking: Vec<TrackingEntry>,
        _cancel: &CancellationToken,
    ) -> Result<Vec<TrackingEntry>> {
        Ok(tracking)
    }
}

/// Runs tasks through the script executor, with retries and bounded
/// fan-out for per-update work.
pub struct ScriptTaskHandler {
    executor: Arc<dyn OperationExecutor>,
    retry: Arc<RetryExecutor>,
    bulk: BulkOperationCoordinator,
    evaluation: EvaluationPolicy,
}

impl ScriptTaskHandler {
    pub fn new(
        executor: Arc<dyn OperationExecutor>,
        retry: Arc<RetryExecutor>,
        bulk: BulkOperationCoordinator,
        evaluation: EvaluationPolicy,
    ) -> Self {
        Self {
            executor,
            retry,
            bulk,
            evaluation,
        }
    }

    async fn call(
        &self,
        name: &str,
        params: &OperationParams,
        cancel: &CancellationToken,
    ) -> Result<OperationOutput> {
        self.retry
            .run_operation(self.executor.as_ref(), name, params, cancel)
            .await
    }

    async fn per_update(
        &self,
        operation: &str,
        update_ids: Vec<String>,
        groups: &[String],
        cancel: &CancellationToken,
    ) -> BulkOperationResult {
        let mut params = OperationParams::new();
        if !groups.is_empty() {
            params.insert("targetGroups".into(), serde_json::json!(groups));
        }
        let batch = NamedBatch {
            operation: operation.to_string(),
            item_param: "updateId".into(),
            params,
        };
        self.bulk
            .run_named(
                self.executor.clone(),
                Some(self.retry.clone()),
                batch,
                update_ids,
                cancel,
                None,
            )
            .await
    }

    /// Re-evaluate non-terminal entries in place. Entries already evaluated
    /// keep their new status if a later call is cancelled.
    async fn refresh(
        &self,
        config: &StagedApprovalConfig,
        tracking: &mut [TrackingEntry],
        cancel: &CancellationToken,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let tracker = PromotionTracker::new(config);
        let now = Utc::now();
        for entry in tracking.iter_mut().filter(|e| !e.status.is_terminal()) {
            let mut params = OperationParams::new();
            params.insert("updateId".into(), serde_json::json!(entry.update_id));
            params.insert("targetGroups".into(), serde_json::json!(config.test_groups));
            let output = match self.call(OP_GET_INSTALL_COUNTS, &params, cancel).await {
                Ok(output) => output,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warnings.push(format!("no telemetry for {}: {e}", entry.update_id));
                    continue;
                }
            };
            let counts = match output.parse::<InstallationCounts>() {
                Ok(counts) => counts,
                Err(e) => {
                    warnings.push(format!("bad telemetry for {}: {e}", entry.update_id));
                    continue;
                }
            };
            let before = entry.status;
            let after = tracker.evaluate(entry, counts, now);
            if before != after {
                tracing::info!(
                    "🧪 {} ({}) {} -> {}",
                    entry.update_title,
                    entry.kb_article,
                    before,
                    after
                );
            }
        }
        Ok(())
    }

    /// Staged run. Whatever the stages managed before an error or
    /// cancellation is kept in the outcome's tracking.
    async fn run_staged(
        &self,
        task: &ScheduledTask,
        config: &StagedApprovalConfig,
        mut tracking: Vec<TrackingEntry>,
        cancel: &CancellationToken,
    ) -> TaskRunOutcome {
        let mut warnings = Vec::new();
        match self
            .advance_stages(task, config, &mut tracking, cancel, &mut warnings)
            .await
        {
            Ok(mut message) => {
                let status = if warnings.is_empty() {
                    RunStatus::Success
                } else {
                    message.push_str(&format!("; {}", warnings.join("; ")));
                    RunStatus::Warning
                };
                TaskRunOutcome::new(status, message, tracking)
            }
            Err(e) => {
                let mut message = e.to_string();
                if !warnings.is_empty() {
                    message.push_str(&format!("; {}", warnings.join("; ")));
                }
                TaskRunOutcome {
                    cancelled: e.is_cancelled(),
                    ..TaskRunOutcome::new(RunStatus::Failed, message, tracking)
                }
            }
        }
    }

    async fn advance_stages(
        &self,
        task: &ScheduledTask,
        config: &StagedApprovalConfig,
        tracking: &mut Vec<TrackingEntry>,
        cancel: &CancellationToken,
        warnings: &mut Vec<String>,
    ) -> Result<String> {
        if self.evaluation == EvaluationPolicy::OnTaskRun {
            self.refresh(config, tracking, cancel, warnings).await?;
        }

        // Promote entries that passed testing.
        let ready: Vec<String> = tracking
            .iter()
            .filter(|e| e.status == TrackingStatus::ReadyForPromotion)
            .map(|e| e.update_id.clone())
            .collect();
        let mut promoted = 0;
        if !ready.is_empty() {
            let result = self
                .per_update(OP_APPROVE, ready, &config.production_groups, cancel)
                .await;
            let now = Utc::now();
            for entry in tracking
                .iter_mut()
                .filter(|e| {
                    e.status == TrackingStatus::ReadyForPromotion
                        && result.succeeded.contains(&e.update_id)
                })
            {
                entry.mark_promoted(now)?;
                promoted += 1;
            }
            warnings.extend(item_warnings("promotion", &result));
            if result.cancelled {
                return Err(WsusError::Cancelled);
            }
        }

        // Bring new updates into testing.
        let mut params = OperationParams::new();
        params.insert("includeDeclined".into(), serde_json::json!(false));
        let updates: Vec<UpdateInfo> = self.call(OP_GET_UPDATES, &params, cancel).await?.parse()?;
        let tracker = PromotionTracker::new(config);
        let tracked: HashSet<String> = tracking.iter().map(|e| e.update_id.clone()).collect();
        let candidates: Vec<&UpdateInfo> = updates
            .iter()
            .filter(|u| !tracked.contains(&u.id) && tracker.accepts(u))
            .collect();

        let mut started = 0;
        if !candidates.is_empty() {
            let ids = candidates.iter().map(|u| u.id.clone()).collect();
            let result = self
                .per_update(OP_APPROVE, ids, &config.test_groups, cancel)
                .await;
            let now = Utc::now();
            for update in candidates.iter().filter(|u| result.succeeded.contains(&u.id)) {
                tracking.push(TrackingEntry::new(&task.id, update, now, config));
                started += 1;
            }
            warnings.extend(item_warnings("test approval", &result));
            if result.cancelled {
                return Err(WsusError::Cancelled);
            }
        }

        // Superseded updates are declined independently of promotion.
        let superseded: Vec<String> = tracker
            .superseded_to_decline(&updates)
            .iter()
            .map(|u| u.id.clone())
            .collect();
        let mut declined = 0;
        if !superseded.is_empty() {
            let result = self.per_update(OP_DECLINE, superseded, &[], cancel).await;
            declined = result.success_count;
            warnings.extend(item_warnings("decline", &result));
            if result.cancelled {
                return Err(WsusError::Cancelled);
            }
        }

        Ok(format!(
            "Promoted {promoted}, started testing {started}, declined {declined} superseded"
        ))
    }

    async fn run_simple<S: Serialize + Sync>(
        &self,
        operation: &str,
        settings: &S,
        cancel: &CancellationToken,
    ) -> Result<(RunStatus, String)> {
        let params: OperationParams = serde_json::from_value(serde_json::to_value(settings)?)?;
        let output = self.call(operation, &params, cancel).await?;
        let message = match &output.data {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => format!("{operation} completed"),
            other => other.to_string(),
        };
        let status = if output.messages.iter().any(|m| m.to_lowercase().contains("warning")) {
            RunStatus::Warning
        } else {
            RunStatus::Success
        };
        Ok((status, message))
    }
}

fn item_warnings(stage: &str, result: &BulkOperationResult) -> Vec<String> {
    if result.failed_count == 0 {
        return Vec::new();
    }
    vec![format!(
        "{stage}: {} of {} failed ({})",
        result.failed_count,
        result.total_count,
        result
            .errors
            .iter()
            .map(|e| e.item_id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    )]
}

fn missing_settings(task: &ScheduledTask) -> WsusError {
    WsusError::Validation(format!(
        "Task '{}' has no {} settings",
        task.name, task.operation_type
    ))
}

#[async_trait]
impl TaskHandler for ScriptTaskHandler {
    async fn run(
        &self,
        task: &ScheduledTask,
        tracking: Vec<TrackingEntry>,
        cancel: &CancellationToken,
    ) -> Result<TaskRunOutcome> {
        match task.operation_type {
            OperationType::StagedApproval => {
                let config = task
                    .staged_approval_settings
                    .as_ref()
                    .ok_or_else(|| missing_settings(task))?;
                Ok(self.run_staged(task, config, tracking, cancel).await)
            }
            OperationType::Cleanup => {
                let settings = task
                    .cleanup_settings
                    .as_ref()
                    .ok_or_else(|| missing_settings(task))?;
                let (status, message) = self.run_simple(OP_CLEANUP, settings, cancel).await?;
                Ok(TaskRunOutcome::new(status, message, tracking))
            }
            OperationType::Synchronization => {
                let settings = task
                    .sync_settings
                    .as_ref()
                    .ok_or_else(|| missing_settings(task))?;
                let (status, message) = self.run_simple(OP_SYNC, settings, cancel).await?;
                Ok(TaskRunOutcome::new(status, message, tracking))
            }
        }
    }

    async fn evaluate(
        &self,
        task: &ScheduledTask,
        tracking: Vec<TrackingEntry>,
        cancel: &CancellationToken,
    ) -> Result<Vec<TrackingEntry>> {
        let Some(config) = &task.staged_approval_settings else {
            return Ok(tracking);
        };
        let mut tracking = tracking;
        let mut warnings = Vec::new();
        self.refresh(config, &mut tracking, cancel, &mut warnings).await?;
        for warning in warnings {
            tracing::warn!("⚠️ Evaluating '{}': {}", task.name, warning);
        }
        Ok(tracking)
    }
}
