//! Built-in task templates.

use chrono::{NaiveTime, Utc, Weekday};

use crate::tasks::{
    CleanupSettings, Frequency, OperationType, ScheduledTask, StagedApprovalConfig,
    SyncSettings, TaskSchedule,
};

/// A default schedule plus settings bundle.
#[derive(Debug, Clone)]
pub struct TaskTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub operation_type: OperationType,
    pub schedule: TaskSchedule,
    pub staged_approval_settings: Option<StagedApprovalConfig>,
    pub cleanup_settings: Option<CleanupSettings>,
    pub sync_settings: Option<SyncSettings>,
}

impl TaskTemplate {
    /// New unsaved task. Every nested setting is an owned copy, so edits to
    /// the task never reach the template or its siblings.
    pub fn instantiate(&self, name: Option<&str>) -> ScheduledTask {
        let mut task = ScheduledTask::new(
            name.unwrap_or(self.name),
            self.operation_type,
            self.schedule.clone(),
        );
        task.description = self.description.to_string();
        task.staged_approval_settings = self.staged_approval_settings.clone();
        task.cleanup_settings = self.cleanup_settings.clone();
        task.sync_settings = self.sync_settings.clone();
        task
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

/// The templates shipped with the console.
pub fn builtin_templates() -> Vec<TaskTemplate> {
    let today = Utc::now().date_naive();
    vec![
        TaskTemplate {
            id: "weekly-security-staged",
            name: "Weekly security staged approval",
            description: "Approve new security and critical updates for the pilot group \
                          every Tuesday, promote to production after 7 days without failures",
            operation_type: OperationType::StagedApproval,
            schedule: TaskSchedule {
                frequency: Frequency::Weekly,
                time_of_day: hm(2, 0),
                days_of_week: vec![Weekday::Tue],
                day_of_month: None,
                start_date: today,
                end_date: None,
                interval_minutes: None,
            },
            staged_approval_settings: Some(StagedApprovalConfig {
                classifications: vec!["Security Updates".into(), "Critical Updates".into()],
                decline_superseded_updates: true,
                ..StagedApprovalConfig::default()
            }),
            cleanup_settings: None,
            sync_settings: None,
        },
        TaskTemplate {
            id: "monthly-cleanup",
            name: "Monthly server cleanup",
            description: "Run the WSUS cleanup wizard on the first day of every month",
            operation_type: OperationType::Cleanup,
            schedule: TaskSchedule {
                frequency: Frequency::Monthly,
                time_of_day: hm(1, 0),
                days_of_week: Vec::new(),
                day_of_month: Some(1),
                start_date: today,
                end_date: None,
                interval_minutes: None,
            },
            staged_approval_settings: None,
            cleanup_settings: Some(CleanupSettings {
                decline_expired_updates: true,
                ..CleanupSettings::default()
            }),
            sync_settings: None,
        },
        TaskTemplate {
            id: "daily-sync",
            name: "Daily synchronization",
            description: "Synchronize with the upstream server every night",
            operation_type: OperationType::Synchronization,
            schedule: TaskSchedule {
                frequency: Frequency::Daily,
                time_of_day: hm(0, 30),
                days_of_week: Vec::new(),
                day_of_month: None,
                start_date: today,
                end_date: None,
                interval_minutes: None,
            },
            staged_approval_settings: None,
            cleanup_settings: None,
            sync_settings: Some(SyncSettings::default()),
        },
    ]
}

pub fn find_template(id: &str) -> Option<TaskTemplate> {
    builtin_templates().into_iter().find(|t| t.id == id)
}
