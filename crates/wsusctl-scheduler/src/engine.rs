//! Task schedule engine: owns the durable task set and arms one timer per
//! enabled task.
//!
//! ```text
//!  save / enable / load ──▶ arm(task, due) ──▶ one-shot timer
//!                                                  │ Fire { task, due }
//!                                                  ▼
//!                      dispatcher loop (mpsc) ──▶ running? ──yes──▶ defer
//!                                                  │ no
//!                                                  ▼
//!                                     run handler ──▶ bookkeeping + persist
//!                                                  │
//!                                     advance schedule ──▶ arm(task, next)
//! ```
//!
//! The next timer is armed only after a run completes, so runs of one task
//! never overlap. Other processes (the CLI, the OS task runner) share the
//! data directory:
//!
//! - every write is load-modify-save on the on-disk collections under the
//!   store lock, then published to readers;
//! - a run holds the task's run lock, and a scheduled run only goes ahead if
//!   the occurrence is still pending on disk;
//! - a started engine re-reads the store every 30s and re-arms to match.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wsusctl_core::error::{Result, WsusError};

use crate::handler::{TaskHandler, TaskRunOutcome};
use crate::mirror::{MirrorInfo, TaskRunnerMirror};
use crate::recurrence;
use crate::staged::{TrackingEntry, TrackingStatus};
use crate::store::{JsonStore, TASKS_COLLECTION, TRACKING_COLLECTION};
use crate::tasks::{Frequency, OperationType, RunStatus, ScheduledTask};
use crate::templates;

const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// How early the OS task runner may start an occurrence.
const OCCURRENCE_GRACE_SECS: i64 = 120;

/// A timer elapsed for `task_id`'s occurrence at `due`.
#[derive(Debug, Clone)]
struct Fire {
    task_id: String,
    due: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
enum RunTrigger {
    /// Occurrence at this due time; the schedule advances afterwards.
    Schedule(DateTime<Utc>),
    /// Operator request; the schedule is left alone.
    Manual,
}

#[derive(Default)]
struct EngineState {
    tasks: Vec<ScheduledTask>,
    tracking: Vec<TrackingEntry>,
}

#[derive(Default)]
struct Flights {
    running: HashSet<String>,
    /// Fires that arrived while the task was running.
    deferred: HashMap<String, DateTime<Utc>>,
}

struct Inner {
    store: JsonStore,
    mirror: Arc<dyn TaskRunnerMirror>,
    handler: Arc<dyn TaskHandler>,
    state: RwLock<EngineState>,
    write_lock: tokio::sync::Mutex<()>,
    timers: Mutex<HashMap<String, (DateTime<Utc>, JoinHandle<()>)>>,
    flights: Mutex<Flights>,
    events: mpsc::UnboundedSender<Fire>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Fire>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Durable scheduled-task engine.
#[derive(Clone)]
pub struct TaskScheduleEngine {
    inner: Arc<Inner>,
}

impl TaskScheduleEngine {
    pub fn new(
        store: JsonStore,
        mirror: Arc<dyn TaskRunnerMirror>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                store,
                mirror,
                handler,
                state: RwLock::new(EngineState::default()),
                write_lock: tokio::sync::Mutex::new(()),
                timers: Mutex::new(HashMap::new()),
                flights: Mutex::new(Flights::default()),
                events,
                receiver: Mutex::new(Some(receiver)),
                dispatcher: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Read tasks and tracking entries from disk. Returns the task count.
    pub async fn load(&self) -> Result<usize> {
        let (tasks, tracking) = self.inner.reload().await?;
        tracing::info!(
            "📂 Loaded {} scheduled tasks, {} tracking entries",
            tasks.len(),
            tracking.len()
        );
        Ok(tasks.len())
    }

    /// Pick up changes other processes made to the store. On a started
    /// engine, timers follow: new or rescheduled tasks are armed, deleted or
    /// disabled ones disarmed.
    pub async fn refresh(&self) -> Result<usize> {
        self.inner.resync().await
    }

    /// Start the dispatcher and arm every enabled task.
    /// Overdue tasks fire immediately, once.
    pub async fn start(&self) -> Result<()> {
        let receiver = guard(&self.inner.receiver)
            .take()
            .ok_or_else(|| WsusError::Conflict("Scheduler already started".into()))?;

        let inner = self.inner.clone();
        *guard(&self.inner.dispatcher) = Some(tokio::spawn(dispatch_loop(inner, receiver)));

        let now = Utc::now();
        let to_arm = self
            .inner
            .mutate(|tasks, _| {
                for task in tasks.iter_mut().filter(|t| t.is_enabled && t.next_run_at.is_none()) {
                    task.next_run_at = recurrence::first_run(&task.schedule, now);
                }
                Ok(tasks
                    .iter()
                    .filter(|t| t.is_enabled)
                    .filter_map(|t| t.next_run_at.map(|due| (t.id.clone(), due)))
                    .collect::<Vec<_>>())
            })
            .await?;

        for (id, due) in &to_arm {
            if *due <= now {
                tracing::info!("⏩ Task {} is overdue (was due {}), running now", id, due);
            }
            self.inner.arm(id, *due);
        }
        tracing::info!("⏰ Scheduler started, {} tasks armed", to_arm.len());
        Ok(())
    }

    /// Stop timers and the dispatcher; in-flight runs see cancellation.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for (_, (_, handle)) in guard(&self.inner.timers).drain() {
            handle.abort();
        }
        let dispatcher = guard(&self.inner.dispatcher).take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }
        tracing::info!("🛑 Scheduler stopped");
    }

    pub async fn get_tasks(&self) -> Vec<ScheduledTask> {
        self.inner.state.read().await.tasks.clone()
    }

    pub async fn get_task(&self, id: &str) -> Result<ScheduledTask> {
        self.inner
            .state
            .read()
            .await
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    /// Create or replace a task, mirror it, and arm or disarm its timer.
    pub async fn save_task(&self, mut task: ScheduledTask) -> Result<ScheduledTask> {
        task.validate()?;
        let now = Utc::now();

        let saved = self
            .inner
            .mutate(|tasks, _| {
                if task.id.is_empty() {
                    task.id = uuid::Uuid::new_v4().to_string();
                }
                let existing = tasks.iter().position(|t| t.id == task.id);
                match existing {
                    Some(i) => {
                        let stored = &tasks[i];
                        task.created_at = stored.created_at;
                        task.last_run_at = stored.last_run_at;
                        task.last_run_status = stored.last_run_status;
                        task.last_run_message = stored.last_run_message.clone();
                    }
                    None => {
                        task.created_at = now;
                        task.last_run_at = None;
                        task.last_run_status = RunStatus::NeverRun;
                        task.last_run_message = None;
                    }
                }
                task.modified_at = now;
                if task.external_task_handle.is_none() {
                    task.external_task_handle = Some(task.default_handle());
                }
                task.next_run_at = if task.is_enabled {
                    recurrence::first_run(&task.schedule, now)
                } else {
                    None
                };

                match existing {
                    Some(i) => tasks[i] = task.clone(),
                    None => tasks.push(task.clone()),
                }
                Ok(task)
            })
            .await?;

        if let Err(e) = self.inner.mirror.create_or_update(&saved).await {
            tracing::warn!("⚠️ Could not mirror task '{}': {e}", saved.name);
        }
        match saved.next_run_at {
            Some(due) if saved.is_enabled => self.inner.arm(&saved.id, due),
            _ => self.inner.disarm(&saved.id),
        }
        tracing::info!("📅 Task saved: '{}' ({})", saved.name, saved.id);
        Ok(saved)
    }

    /// Remove a task, its mirror entry and its tracking entries.
    pub async fn delete_task(&self, id: &str) -> Result<ScheduledTask> {
        self.inner.disarm(id);
        let (removed, cascaded) = self
            .inner
            .mutate(|tasks, tracking| {
                let index = tasks
                    .iter()
                    .position(|t| t.id == id)
                    .ok_or_else(|| not_found(id))?;
                let removed = tasks.remove(index);
                let before = tracking.len();
                tracking.retain(|e| e.task_id != id);
                Ok((removed, before - tracking.len()))
            })
            .await?;

        let handle = removed
            .external_task_handle
            .clone()
            .unwrap_or_else(|| removed.default_handle());
        if let Err(e) = self.inner.mirror.delete(&handle).await {
            tracing::warn!("⚠️ Could not remove mirror '{}': {e}", handle);
        }
        tracing::info!(
            "🗑️ Task deleted: '{}' ({} tracking entries removed)",
            removed.name,
            cascaded
        );
        Ok(removed)
    }

    /// Toggle a task; takes effect on its timer and mirror immediately.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<ScheduledTask> {
        let (updated, changed) = self
            .inner
            .mutate(|tasks, _| {
                let task = tasks
                    .iter_mut()
                    .find(|t| t.id == id)
                    .ok_or_else(|| not_found(id))?;
                if task.is_enabled == enabled {
                    return Ok((task.clone(), false));
                }
                task.is_enabled = enabled;
                task.modified_at = Utc::now();
                task.next_run_at = if enabled {
                    recurrence::first_run(&task.schedule, Utc::now())
                } else {
                    None
                };
                Ok((task.clone(), true))
            })
            .await?;
        if !changed {
            return Ok(updated);
        }

        let handle = updated
            .external_task_handle
            .clone()
            .unwrap_or_else(|| updated.default_handle());
        if let Err(e) = self.inner.mirror.set_enabled(&handle, enabled).await {
            tracing::warn!("⚠️ Could not update mirror '{}': {e}", handle);
        }
        match updated.next_run_at {
            Some(due) if enabled => self.inner.arm(id, due),
            _ => self.inner.disarm(id),
        }
        tracing::info!(
            "{} Task '{}' {}",
            if enabled { "▶️" } else { "⏸️" },
            updated.name,
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(updated)
    }

    /// Run a task immediately without moving its schedule.
    pub async fn run_now(&self, id: &str) -> Result<TaskRunOutcome> {
        self.get_task(id).await?;
        self.inner.run_exclusive(id, RunTrigger::Manual).await
    }

    /// Run the task's current occurrence, as the OS task runner does, and
    /// advance its schedule. `AlreadyInState` when no occurrence is due,
    /// which is the case after another process ran it.
    pub async fn run_scheduled(&self, id: &str) -> Result<TaskRunOutcome> {
        let (tasks, _) = self.inner.reload().await?;
        let task = tasks
            .into_iter()
            .find(|t| t.id == id)
            .ok_or_else(|| not_found(id))?;
        if !task.is_enabled {
            return Err(WsusError::Validation(format!("Task '{}' is disabled", task.name)));
        }
        let due = task.next_run_at.ok_or_else(|| {
            WsusError::AlreadyInState(format!("Task '{}' has no pending occurrence", task.name))
        })?;
        if due > Utc::now() + chrono::Duration::seconds(OCCURRENCE_GRACE_SECS) {
            return Err(WsusError::AlreadyInState(format!(
                "Next occurrence of '{}' is not due until {}",
                task.name, due
            )));
        }
        self.inner.run_exclusive(id, RunTrigger::Schedule(due)).await
    }

    /// Ask the OS task runner to start the mirrored entry.
    pub async fn run_via_mirror(&self, id: &str) -> Result<()> {
        let task = self.get_task(id).await?;
        let handle = task
            .external_task_handle
            .clone()
            .unwrap_or_else(|| task.default_handle());
        self.inner.mirror.run_now(&handle).await
    }

    pub async fn mirror_info(&self, id: &str) -> Result<Option<MirrorInfo>> {
        let task = self.get_task(id).await?;
        let handle = task
            .external_task_handle
            .clone()
            .unwrap_or_else(|| task.default_handle());
        self.inner.mirror.get_info(&handle).await
    }

    /// Create and save a task from a built-in template.
    pub async fn create_from_template(
        &self,
        template_id: &str,
        name: Option<&str>,
    ) -> Result<ScheduledTask> {
        let template = templates::find_template(template_id)
            .ok_or_else(|| WsusError::NotFound(format!("Template '{template_id}'")))?;
        self.save_task(template.instantiate(name)).await
    }

    pub async fn tracking_entries(&self, task_id: &str) -> Vec<TrackingEntry> {
        self.inner
            .state
            .read()
            .await
            .tracking
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Manually skip one tracked update.
    pub async fn skip_tracking_entry(&self, task_id: &str, update_id: &str) -> Result<TrackingEntry> {
        let skipped = self
            .inner
            .mutate(|_, tracking| {
                let entry = tracking
                    .iter_mut()
                    .find(|e| e.task_id == task_id && e.update_id == update_id)
                    .ok_or_else(|| {
                        WsusError::NotFound(format!(
                            "Update {update_id} is not tracked by task {task_id}"
                        ))
                    })?;
                entry.skip()?;
                Ok(entry.clone())
            })
            .await?;
        tracing::info!("⏭️ Skipped {} in task {}", update_id, task_id);
        Ok(skipped)
    }

    /// Refresh a staged-approval task's entries against live telemetry
    /// without running the task.
    pub async fn evaluate_tracking(&self, task_id: &str) -> Result<Vec<TrackingEntry>> {
        let task = self.get_task(task_id).await?;
        if task.operation_type != OperationType::StagedApproval {
            return Err(WsusError::Validation(format!(
                "Task '{}' is not a staged approval task",
                task.name
            )));
        }
        let entries = self.tracking_entries(task_id).await;
        let cancel = self.inner.shutdown.child_token();
        let updated = self.inner.handler.evaluate(&task, entries, &cancel).await?;
        self.inner
            .mutate(|tasks, tracking| {
                if tasks.iter().any(|t| t.id == task_id) {
                    merge_tracking(tracking, task_id, updated);
                }
                Ok(())
            })
            .await?;
        Ok(self.tracking_entries(task_id).await)
    }

    /// Ids of tasks with a live timer, sorted.
    pub fn armed_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = guard(&self.inner.timers)
            .iter()
            .filter(|(_, (_, handle))| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

fn not_found(id: &str) -> WsusError {
    WsusError::NotFound(format!("Scheduled task '{id}'"))
}

/// Fold a run's entries into the stored collection. An entry the operator
/// skipped while the run was in flight stays skipped.
fn merge_tracking(all: &mut Vec<TrackingEntry>, task_id: &str, updated: Vec<TrackingEntry>) {
    for mut entry in updated {
        entry.task_id = task_id.to_string();
        match all
            .iter_mut()
            .find(|e| e.task_id == task_id && e.update_id == entry.update_id)
        {
            Some(current) if current.status == TrackingStatus::Skipped => {}
            Some(current) => *current = entry,
            None => all.push(entry),
        }
    }
}

impl Inner {
    /// Apply `change` to the collections as they are on disk, save them and
    /// publish the result. Nothing is saved if `change` fails.
    async fn mutate<R>(
        &self,
        change: impl FnOnce(&mut Vec<ScheduledTask>, &mut Vec<TrackingEntry>) -> Result<R>,
    ) -> Result<R> {
        let _w = self.write_lock.lock().await;
        let (tasks, tracking, out) = self.store.locked(|| {
            let mut tasks: Vec<ScheduledTask> = self.store.load(TASKS_COLLECTION)?;
            let mut tracking: Vec<TrackingEntry> = self.store.load(TRACKING_COLLECTION)?;
            let out = change(&mut tasks, &mut tracking)?;
            self.store.save(TASKS_COLLECTION, &tasks)?;
            self.store.save(TRACKING_COLLECTION, &tracking)?;
            Ok((tasks, tracking, out))
        })?;
        self.publish(tasks, tracking).await;
        Ok(out)
    }

    /// Re-read both collections from disk and publish them.
    async fn reload(&self) -> Result<(Vec<ScheduledTask>, Vec<TrackingEntry>)> {
        let _w = self.write_lock.lock().await;
        let (tasks, tracking) = self.store.locked(|| {
            let tasks: Vec<ScheduledTask> = self.store.load(TASKS_COLLECTION)?;
            let tracking: Vec<TrackingEntry> = self.store.load(TRACKING_COLLECTION)?;
            Ok((tasks, tracking))
        })?;
        self.publish(tasks.clone(), tracking.clone()).await;
        Ok((tasks, tracking))
    }

    async fn publish(&self, tasks: Vec<ScheduledTask>, tracking: Vec<TrackingEntry>) {
        let mut state = self.state.write().await;
        state.tasks = tasks;
        state.tracking = tracking;
    }

    fn is_started(&self) -> bool {
        guard(&self.dispatcher).is_some() && !self.shutdown.is_cancelled()
    }

    async fn resync(&self) -> Result<usize> {
        let (tasks, _) = self.reload().await?;
        if self.is_started() {
            self.sync_timers(&tasks);
        }
        Ok(tasks.len())
    }

    /// Make the armed timers match `tasks`. Running tasks are left alone;
    /// their run re-arms them.
    fn sync_timers(&self, tasks: &[ScheduledTask]) {
        let wanted: HashMap<&str, DateTime<Utc>> = tasks
            .iter()
            .filter(|t| t.is_enabled)
            .filter_map(|t| t.next_run_at.map(|due| (t.id.as_str(), due)))
            .collect();
        let gone: Vec<String> = guard(&self.timers)
            .keys()
            .filter(|id| !wanted.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in &gone {
            self.disarm(id);
        }

        let running = guard(&self.flights).running.clone();
        let mut armed = 0;
        for (id, due) in wanted {
            if running.contains(id) {
                continue;
            }
            let current = guard(&self.timers).get(id).map(|(at, _)| *at);
            if current != Some(due) {
                self.arm(id, due);
                armed += 1;
            }
        }
        if armed > 0 || !gone.is_empty() {
            tracing::info!(
                "🔄 Picked up external changes: {} armed, {} disarmed",
                armed,
                gone.len()
            );
        }
    }

    fn arm(&self, task_id: &str, due: DateTime<Utc>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let delay = (due - Utc::now()).to_std().unwrap_or_default();
        let events = self.events.clone();
        let shutdown = self.shutdown.clone();
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(Fire { task_id: id, due });
                }
            }
        });
        if let Some((_, old)) = guard(&self.timers).insert(task_id.to_string(), (due, handle)) {
            old.abort();
        }
        tracing::debug!("⏰ Armed {} for {} (in {}s)", task_id, due, delay.as_secs());
    }

    fn disarm(&self, task_id: &str) {
        if let Some((_, handle)) = guard(&self.timers).remove(task_id) {
            handle.abort();
            tracing::debug!("⏰ Disarmed {}", task_id);
        }
    }

    fn begin(&self, task_id: &str) -> bool {
        guard(&self.flights).running.insert(task_id.to_string())
    }

    /// Clear the running mark and re-queue a fire that arrived meanwhile.
    fn finish(&self, task_id: &str) {
        let deferred = {
            let mut flights = guard(&self.flights);
            flights.running.remove(task_id);
            flights.deferred.remove(task_id)
        };
        if let Some(due) = deferred {
            tracing::debug!("⏰ Dispatching deferred fire for {}", task_id);
            let _ = self.events.send(Fire {
                task_id: task_id.to_string(),
                due,
            });
        }
    }

    async fn run_exclusive(&self, task_id: &str, trigger: RunTrigger) -> Result<TaskRunOutcome> {
        if !self.begin(task_id) {
            return Err(WsusError::Conflict(format!("Task {task_id} is already running")));
        }
        let result = self.run_task(task_id, trigger).await;
        self.finish(task_id);
        result
    }

    async fn on_fire(self: &Arc<Self>, fire: Fire) {
        {
            let mut timers = guard(&self.timers);
            if timers.get(&fire.task_id).is_some_and(|(due, _)| *due == fire.due) {
                timers.remove(&fire.task_id);
            }
        }

        let current = {
            let state = self.state.read().await;
            state
                .tasks
                .iter()
                .find(|t| t.id == fire.task_id)
                .map(|t| (t.is_enabled, t.next_run_at))
        };
        match current {
            Some((true, Some(next))) if next == fire.due => {}
            _ => {
                tracing::debug!("⏰ Ignoring stale fire for {}", fire.task_id);
                return;
            }
        }

        {
            let mut flights = guard(&self.flights);
            if flights.running.contains(&fire.task_id) {
                tracing::debug!("⏰ {} is running, deferring its fire", fire.task_id);
                flights.deferred.insert(fire.task_id, fire.due);
                return;
            }
            flights.running.insert(fire.task_id.clone());
        }

        let inner = self.clone();
        tokio::spawn(async move {
            let id = fire.task_id;
            if let Err(e) = inner.run_task(&id, RunTrigger::Schedule(fire.due)).await {
                tracing::debug!("Scheduled run of {} did not complete: {e}", id);
            }
            inner.finish(&id);
        });
    }

    async fn run_task(&self, task_id: &str, trigger: RunTrigger) -> Result<TaskRunOutcome> {
        let mut run_lock = self.store.run_lock(task_id)?;
        let _running = run_lock.try_write().map_err(|_| {
            WsusError::Conflict(format!("Task {task_id} is already running in another process"))
        })?;

        // The cached copy may predate a run or edit by another process.
        let (tasks, tracking) = self.reload().await?;
        let task = tasks
            .into_iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| not_found(task_id))?;
        let entries: Vec<TrackingEntry> = tracking
            .into_iter()
            .filter(|e| e.task_id == task_id)
            .collect();
        if let RunTrigger::Schedule(due) = trigger {
            if !task.is_enabled {
                return Err(WsusError::Validation(format!("Task '{}' is disabled", task.name)));
            }
            if task.next_run_at != Some(due) {
                if let Some(next) = task.next_run_at
                    && self.is_started()
                {
                    self.arm(task_id, next);
                }
                return Err(WsusError::AlreadyInState(format!(
                    "Occurrence of '{}' due {} was already run",
                    task.name, due
                )));
            }
        }

        tracing::info!("▶️ Running task '{}' ({})", task.name, task.operation_type);
        let started = Utc::now();
        let cancel = self.shutdown.child_token();
        let result = AssertUnwindSafe(self.handler.run(&task, entries, &cancel))
            .catch_unwind()
            .await;

        let (status, message, tracking) = match result {
            Ok(Ok(outcome)) if outcome.cancelled => {
                tracing::info!("Run of '{}' cancelled, keeping its partial progress", task.name);
                self.mutate(|tasks, all_tracking| {
                    if tasks.iter().any(|t| t.id == task_id) {
                        merge_tracking(all_tracking, task_id, outcome.tracking);
                    }
                    Ok(())
                })
                .await?;
                return Err(WsusError::Cancelled);
            }
            Ok(Ok(outcome)) => (outcome.status, outcome.message, Some(outcome.tracking)),
            Ok(Err(e)) if e.is_cancelled() && self.shutdown.is_cancelled() => {
                tracing::info!("Run of '{}' interrupted by shutdown", task.name);
                return Err(e);
            }
            Ok(Err(e)) => (RunStatus::Failed, e.to_string(), None),
            Err(_) => (RunStatus::Failed, "Task handler panicked".to_string(), None),
        };
        match status {
            RunStatus::Failed => tracing::error!("❌ Task '{}' failed: {}", task.name, message),
            RunStatus::Warning => tracing::warn!("⚠️ Task '{}' finished with warnings: {}", task.name, message),
            _ => tracing::info!("✅ Task '{}' finished: {}", task.name, message),
        }

        let persisted = self
            .mutate(|tasks, all_tracking| {
                let Some(stored) = tasks.iter_mut().find(|t| t.id == task_id) else {
                    return Ok(None);
                };
                stored.last_run_at = Some(started);
                stored.last_run_status = status;
                stored.last_run_message = Some(message.clone());

                let mut rearm = None;
                if let RunTrigger::Schedule(due) = trigger {
                    if stored.schedule.frequency == Frequency::Once {
                        stored.is_enabled = false;
                        stored.next_run_at = None;
                    } else if !stored.is_enabled {
                        // Disabled while running.
                        stored.next_run_at = None;
                    } else {
                        stored.next_run_at =
                            recurrence::advance_past(&stored.schedule, due, Utc::now());
                        if stored.next_run_at.is_none() {
                            tracing::info!("📅 Schedule of '{}' has ended", stored.name);
                        }
                    }
                    if stored.is_enabled {
                        rearm = stored.next_run_at;
                    }
                }

                if let Some(updated) = tracking {
                    merge_tracking(all_tracking, task_id, updated);
                }
                Ok(Some(rearm))
            })
            .await?;
        let Some(rearm) = persisted else {
            tracing::info!("Task {} was deleted during its run", task_id);
            return Ok(TaskRunOutcome::new(status, message, Vec::new()));
        };

        if let Some(due) = rearm {
            self.arm(task_id, due);
        }

        let tracking = self
            .state
            .read()
            .await
            .tracking
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect();
        Ok(TaskRunOutcome::new(status, message, tracking))
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut receiver: mpsc::UnboundedReceiver<Fire>) {
    let mut resync = tokio::time::interval_at(
        tokio::time::Instant::now() + RESYNC_INTERVAL,
        RESYNC_INTERVAL,
    );
    resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            fire = receiver.recv() => match fire {
                Some(fire) => inner.on_fire(fire).await,
                None => break,
            },
            _ = resync.tick() => {
                if let Err(e) = inner.resync().await {
                    tracing::warn!("⚠️ Could not re-read scheduled tasks: {e}");
                }
            }
        }
    }
    tracing::debug!("Scheduler dispatcher exited");
}
