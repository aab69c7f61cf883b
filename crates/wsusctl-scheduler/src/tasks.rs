//! Scheduled task definitions: the durable data model for maintenance work.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use wsusctl_core::error::{Result, WsusError};

/// What a scheduled task does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    StagedApproval,
    Cleanup,
    Synchronization,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::StagedApproval => write!(f, "staged approval"),
            OperationType::Cleanup => write!(f, "cleanup"),
            OperationType::Synchronization => write!(f, "synchronization"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Once,
    Daily,
    Weekly,
    Monthly,
    /// Every `interval_minutes` (1 hour when unset).
    Interval,
}

/// Recurrence rule. Times are UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSchedule {
    pub frequency: Frequency,
    pub time_of_day: NaiveTime,
    /// Weekly only. Empty means the weekday of `start_date`.
    #[serde(default)]
    pub days_of_week: Vec<Weekday>,
    /// Monthly only, 1..=31; clamped to short months.
    #[serde(default)]
    pub day_of_month: Option<u32>,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
}

impl TaskSchedule {
    pub fn validate(&self) -> Result<()> {
        if let Some(end) = self.end_date
            && end < self.start_date
        {
            return Err(WsusError::Validation(format!(
                "End date {end} is before start date {}",
                self.start_date
            )));
        }
        if self.frequency == Frequency::Monthly
            && let Some(day) = self.day_of_month
            && !(1..=31).contains(&day)
        {
            return Err(WsusError::Validation(format!(
                "Day of month must be 1-31, got {day}"
            )));
        }
        if self.frequency == Frequency::Interval && self.interval_minutes == Some(0) {
            return Err(WsusError::Validation("Interval must be at least 1 minute".into()));
        }
        Ok(())
    }
}

/// Settings for a staged approval run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedApprovalConfig {
    pub test_groups: Vec<String>,
    pub production_groups: Vec<String>,
    /// Only updates of these classifications enter testing. Empty = all.
    #[serde(default)]
    pub classifications: Vec<String>,
    pub promotion_delay_days: u32,
    #[serde(default)]
    pub require_successful_installations: bool,
    #[serde(default)]
    pub minimum_successful_installations: u32,
    #[serde(default)]
    pub abort_on_failures: bool,
    #[serde(default)]
    pub max_allowed_failures: u32,
    #[serde(default)]
    pub decline_superseded_updates: bool,
}

impl Default for StagedApprovalConfig {
    fn default() -> Self {
        Self {
            test_groups: vec!["Pilot".into()],
            production_groups: vec!["Production".into()],
            classifications: Vec::new(),
            promotion_delay_days: 7,
            require_successful_installations: true,
            minimum_successful_installations: 1,
            abort_on_failures: true,
            max_allowed_failures: 0,
            decline_superseded_updates: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSettings {
    #[serde(default = "yes")]
    pub remove_obsolete_updates: bool,
    #[serde(default = "yes")]
    pub remove_obsolete_computers: bool,
    #[serde(default = "yes")]
    pub compress_update_revisions: bool,
    #[serde(default = "yes")]
    pub cleanup_unneeded_content_files: bool,
    #[serde(default)]
    pub decline_expired_updates: bool,
    #[serde(default)]
    pub decline_superseded_updates: bool,
}

fn yes() -> bool {
    true
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            remove_obsolete_updates: true,
            remove_obsolete_computers: true,
            compress_update_revisions: true,
            cleanup_unneeded_content_files: true,
            decline_expired_updates: false,
            decline_superseded_updates: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default = "yes")]
    pub wait_for_completion: bool,
    #[serde(default = "default_sync_timeout")]
    pub timeout_minutes: u32,
}

fn default_sync_timeout() -> u32 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            wait_for_completion: true,
            timeout_minutes: default_sync_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    NeverRun,
    Success,
    Warning,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::NeverRun => write!(f, "never run"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Warning => write!(f, "warning"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A durable, recurring unit of maintenance work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    /// Empty until first save.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub operation_type: OperationType,
    pub is_enabled: bool,
    pub schedule: TaskSchedule,

    #[serde(default)]
    pub staged_approval_settings: Option<StagedApprovalConfig>,
    #[serde(default)]
    pub cleanup_settings: Option<CleanupSettings>,
    #[serde(default)]
    pub sync_settings: Option<SyncSettings>,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_run_status: RunStatus,
    #[serde(default)]
    pub last_run_message: Option<String>,

    /// Name of the OS task-runner entry mirroring this task.
    #[serde(default)]
    pub external_task_handle: Option<String>,
}

impl ScheduledTask {
    /// Unsaved task with default settings for `operation_type`.
    pub fn new(name: &str, operation_type: OperationType, schedule: TaskSchedule) -> Self {
        let now = Utc::now();
        let mut task = Self {
            id: String::new(),
            name: name.to_string(),
            description: String::new(),
            operation_type,
            is_enabled: true,
            schedule,
            staged_approval_settings: None,
            cleanup_settings: None,
            sync_settings: None,
            created_at: now,
            modified_at: now,
            last_run_at: None,
            next_run_at: None,
            last_run_status: RunStatus::NeverRun,
            last_run_message: None,
            external_task_handle: None,
        };
        match operation_type {
            OperationType::StagedApproval => {
                task.staged_approval_settings = Some(StagedApprovalConfig::default())
            }
            OperationType::Cleanup => task.cleanup_settings = Some(CleanupSettings::default()),
            OperationType::Synchronization => task.sync_settings = Some(SyncSettings::default()),
        }
        task
    }

    /// Exactly the settings block matching `operation_type` must be present.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WsusError::Validation("Task name must not be empty".into()));
        }
        let present = (
            self.staged_approval_settings.is_some(),
            self.cleanup_settings.is_some(),
            self.sync_settings.is_some(),
        );
        let expected = match self.operation_type {
            OperationType::StagedApproval => (true, false, false),
            OperationType::Cleanup => (false, true, false),
            OperationType::Synchronization => (false, false, true),
        };
        if present != expected {
            return Err(WsusError::Validation(format!(
                "Task '{}' is a {} task but carries mismatched operation settings",
                self.name, self.operation_type
            )));
        }
        if let Some(staged) = &self.staged_approval_settings
            && (staged.test_groups.is_empty() || staged.production_groups.is_empty())
        {
            return Err(WsusError::Validation(
                "Staged approval needs at least one test and one production group".into(),
            ));
        }
        self.schedule.validate()
    }

    /// Deterministic OS task-runner name for this task.
    pub fn default_handle(&self) -> String {
        format!("WsusCtl_{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weekly() -> TaskSchedule {
        TaskSchedule {
            frequency: Frequency::Weekly,
            time_of_day: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
            days_of_week: vec![Weekday::Tue],
            day_of_month: None,
            start_date: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            end_date: None,
            interval_minutes: None,
        }
    }

    #[test]
    fn test_new_task_carries_matching_settings() {
        let task = ScheduledTask::new("cleanup", OperationType::Cleanup, weekly());
        assert!(task.cleanup_settings.is_some());
        assert!(task.validate().is_ok());
        assert_eq!(task.last_run_status, RunStatus::NeverRun);
    }

    #[test]
    fn test_mismatched_settings_rejected() {
        let mut task = ScheduledTask::new("sync", OperationType::Synchronization, weekly());
        task.cleanup_settings = Some(CleanupSettings::default());
        assert!(matches!(task.validate(), Err(WsusError::Validation(_))));

        task.cleanup_settings = None;
        task.sync_settings = None;
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_schedule_validation() {
        let mut schedule = weekly();
        schedule.end_date = NaiveDate::from_ymd_opt(2025, 12, 31);
        assert!(schedule.validate().is_err());

        let mut schedule = weekly();
        schedule.frequency = Frequency::Monthly;
        schedule.day_of_month = Some(32);
        assert!(schedule.validate().is_err());
    }

    #[test]
    fn test_serde_round_trip_keeps_camel_case() {
        let mut task = ScheduledTask::new("staged", OperationType::StagedApproval, weekly());
        task.id = "abc".into();
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("stagedApprovalSettings").is_some());
        assert_eq!(json["schedule"]["daysOfWeek"][0], "Tue");
        let back: ScheduledTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
