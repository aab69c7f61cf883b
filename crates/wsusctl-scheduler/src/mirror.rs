//! OS task-runner mirror.
//!
//! Each saved task is mirrored into the Windows Task Scheduler so it also
//! runs when the console is not open. The in-app schedule stays
//! authoritative: the engine logs mirror failures and carries on.

use async_trait::async_trait;
use chrono::Weekday;
use serde::Serialize;
use wsusctl_core::config::SchedulerConfig;
use wsusctl_core::error::{Result, WsusError};

use crate::recurrence::DEFAULT_INTERVAL_MINUTES;
use crate::tasks::{Frequency, ScheduledTask};

/// What the OS runner reports about a mirrored entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorInfo {
    pub handle: String,
    pub status: String,
    pub next_run_time: Option<String>,
}

#[async_trait]
pub trait TaskRunnerMirror: Send + Sync {
    /// Create or replace the entry for `task` (keyed by its handle).
    async fn create_or_update(&self, task: &ScheduledTask) -> Result<()>;
    async fn delete(&self, handle: &str) -> Result<()>;
    async fn set_enabled(&self, handle: &str, enabled: bool) -> Result<()>;
    async fn run_now(&self, handle: &str) -> Result<()>;
    async fn get_info(&self, handle: &str) -> Result<Option<MirrorInfo>>;
}

/// Mirror that does nothing, for hosts without an OS task runner.
pub struct NoopMirror;

#[async_trait]
impl TaskRunnerMirror for NoopMirror {
    async fn create_or_update(&self, _task: &ScheduledTask) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _handle: &str) -> Result<()> {
        Ok(())
    }
    async fn set_enabled(&self, _handle: &str, _enabled: bool) -> Result<()> {
        Ok(())
    }
    async fn run_now(&self, _handle: &str) -> Result<()> {
        Ok(())
    }
    async fn get_info(&self, _handle: &str) -> Result<Option<MirrorInfo>> {
        Ok(None)
    }
}

/// Drives `schtasks.exe`.
pub struct SchtasksMirror {
    program: String,
    folder: String,
    launcher: String,
}

impl SchtasksMirror {
    pub fn new(folder: &str, launcher: &str) -> Self {
        Self {
            program: "schtasks.exe".into(),
            folder: folder.trim_end_matches('\\').to_string(),
            launcher: launcher.to_string(),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(&config.mirror_folder, &config.launcher)
    }

    pub fn task_name(&self, handle: &str) -> String {
        format!("{}\\{}", self.folder, handle)
    }

    /// Arguments for `schtasks /Create`.
    pub fn create_args(&self, task: &ScheduledTask) -> Vec<String> {
        let handle = task
            .external_task_handle
            .clone()
            .unwrap_or_else(|| task.default_handle());
        let schedule = &task.schedule;

        let mut args: Vec<String> = vec![
            "/Create".into(),
            "/F".into(),
            "/TN".into(),
            self.task_name(&handle),
            "/TR".into(),
            format!("\"{}\" run-task {}", self.launcher, task.id),
        ];

        match schedule.frequency {
            Frequency::Once => args.extend(["/SC".into(), "ONCE".into()]),
            Frequency::Daily => args.extend(["/SC".into(), "DAILY".into()]),
            Frequency::Weekly => {
                let days = if schedule.days_of_week.is_empty() {
                    vec![chrono::Datelike::weekday(&schedule.start_date)]
                } else {
                    schedule.days_of_week.clone()
                };
                let days: Vec<&str> = days.iter().map(day_code).collect();
                args.extend(["/SC".into(), "WEEKLY".into(), "/D".into(), days.join(",")]);
            }
            Frequency::Monthly => {
                let day = schedule
                    .day_of_month
                    .unwrap_or_else(|| chrono::Datelike::day(&schedule.start_date));
                args.extend(["/SC".into(), "MONTHLY".into(), "/D".into(), day.to_string()]);
            }
            Frequency::Interval => {
                let minutes = schedule
                    .interval_minutes
                    .unwrap_or(DEFAULT_INTERVAL_MINUTES)
                    .clamp(1, 1439);
                args.extend(["/SC".into(), "MINUTE".into(), "/MO".into(), minutes.to_string()]);
            }
        }

        args.extend([
            "/ST".into(),
            schedule.time_of_day.format("%H:%M").to_string(),
            "/SD".into(),
            schedule.start_date.format("%m/%d/%Y").to_string(),
        ]);
        if let Some(end) = schedule.end_date {
            args.extend(["/ED".into(), end.format("%m/%d/%Y").to_string()]);
        }
        args
    }

    async fn schtasks(&self, args: &[String]) -> Result<String> {
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| WsusError::TaskRunner(format!("Failed to launch {}: {e}", self.program)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WsusError::TaskRunner(format!(
                "{} {} failed: {}",
                self.program,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn day_code(day: &Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MON",
        Weekday::Tue => "TUE",
        Weekday::Wed => "WED",
        Weekday::Thu => "THU",
        Weekday::Fri => "FRI",
        Weekday::Sat => "SAT",
        Weekday::Sun => "SUN",
    }
}

/// Parse `schtasks /Query /FO LIST` output.
fn parse_query(handle: &str, stdout: &str) -> MirrorInfo {
    let field = |key: &str| {
        stdout.lines().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k.trim() == key).then(|| v.trim().to_string())
        })
    };
    MirrorInfo {
        handle: handle.to_string(),
        status: field("Status").unwrap_or_else(|| "Unknown".into()),
        next_run_time: field("Next Run Time").filter(|v| !v.is_empty() && v != "N/A"),
    }
}

#[async_trait]
impl TaskRunnerMirror for SchtasksMirror {
    async fn create_or_update(&self, task: &ScheduledTask) -> Result<()> {
        self.schtasks(&self.create_args(task)).await?;
        if !task.is_enabled {
            let handle = task
                .external_task_handle
                .clone()
                .unwrap_or_else(|| task.default_handle());
            self.set_enabled(&handle, false).await?;
        }
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        let args = ["/Delete".into(), "/F".into(), "/TN".into(), self.task_name(handle)];
        self.schtasks(&args).await.map(|_| ())
    }

    async fn set_enabled(&self, handle: &str, enabled: bool) -> Result<()> {
        let toggle = if enabled { "/ENABLE" } else { "/DISABLE" };
        let args = ["/Change".into(), "/TN".into(), self.task_name(handle), toggle.into()];
        self.schtasks(&args).await.map(|_| ())
    }

    async fn run_now(&self, handle: &str) -> Result<()> {
        let args = ["/Run".into(), "/TN".into(), self.task_name(handle)];
        self.schtasks(&args).await.map(|_| ())
    }

    async fn get_info(&self, handle: &str) -> Result<Option<MirrorInfo>> {
        let args = [
            "/Query".into(),
            "/TN".into(),
            self.task_name(handle),
            "/FO".into(),
            "LIST".into(),
            "/V".into(),
        ];
        match self.schtasks(&args).await {
            Ok(stdout) => Ok(Some(parse_query(handle, &stdout))),
            Err(WsusError::TaskRunner(msg)) if msg.to_lowercase().contains("cannot find") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{OperationType, TaskSchedule};
    use chrono::{NaiveDate, NaiveTime};

    fn task(frequency: Frequency) -> ScheduledTask {
        let schedule = TaskSchedule {
            frequency,
            time_of_day: NaiveTime::from_hms_opt(3, 5, 0).unwrap(),
            days_of_week: vec![Weekday::Mon, Weekday::Thu],
            day_of_month: Some(15),
            start_date: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2026, 12, 31),
            interval_minutes: Some(90),
        };
        let mut task = ScheduledTask::new("t", OperationType::Cleanup, schedule);
        task.id = "42".into();
        task
    }

    #[test]
    fn test_weekly_create_args() {
        let mirror = SchtasksMirror::new("\\WsusCtl\\", "C:\\wsusctl.exe");
        let args = mirror.create_args(&task(Frequency::Weekly));
        assert_eq!(
            args,
            vec![
                "/Create", "/F", "/TN", "\\WsusCtl\\WsusCtl_42", "/TR",
                "\"C:\\wsusctl.exe\" run-task 42", "/SC", "WEEKLY", "/D", "MON,THU",
                "/ST", "03:05", "/SD", "02/01/2026", "/ED", "12/31/2026",
            ]
        );
    }

    #[test]
    fn test_monthly_and_interval_args() {
        let mirror = SchtasksMirror::new("\\WsusCtl", "wsusctl.exe");

        let args = mirror.create_args(&task(Frequency::Monthly));
        let sc = args.iter().position(|a| a == "/SC").unwrap();
        assert_eq!(&args[sc..sc + 4], ["/SC", "MONTHLY", "/D", "15"]);

        let mut interval = task(Frequency::Interval);
        interval.external_task_handle = Some("custom".into());
        let args = mirror.create_args(&interval);
        assert_eq!(args[3], "\\WsusCtl\\custom");
        let sc = args.iter().position(|a| a == "/SC").unwrap();
        assert_eq!(&args[sc..sc + 4], ["/SC", "MINUTE", "/MO", "90"]);
    }

    #[test]
    fn test_parse_query_output() {
        let out = "\r\nFolder: \\WsusCtl\r\nHostName: WSUS01\r\nTaskName: \\WsusCtl\\WsusCtl_42\r\n\
                   Next Run Time: 3/2/2026 3:05:00 AM\r\nStatus: Ready\r\n";
        let info = parse_query("WsusCtl_42", out);
        assert_eq!(info.status, "Ready");
        assert_eq!(info.next_run_time.as_deref(), Some("3/2/2026 3:05:00 AM"));

        let disabled = parse_query("x", "Next Run Time: N/A\nStatus: Disabled\n");
        assert_eq!(disabled.status, "Disabled");
        assert!(disabled.next_run_time.is_none());
    }
}
