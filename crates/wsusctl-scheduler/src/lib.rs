//! # wsusctl scheduler
//!
//! Durable scheduled tasks for the WSUS console: cleanup, synchronization
//! and staged approval (test groups first, production after a soak period).
//!
//! ```text
//! TaskScheduleEngine
//!   ├── JsonStore            scheduled_tasks.json, staged_approval_tracking.json
//!   ├── recurrence           next due time per schedule
//!   ├── TaskRunnerMirror     schtasks.exe copy of every task
//!   └── TaskHandler          ScriptTaskHandler → executor crate
//!         └── PromotionTracker   InTesting → ReadyForPromotion → Promoted
//! ```

pub mod engine;
pub mod handler;
pub mod mirror;
pub mod recurrence;
pub mod staged;
pub mod store;
pub mod tasks;
pub mod templates;

pub use engine::TaskScheduleEngine;
pub use handler::{ScriptTaskHandler, TaskHandler, TaskRunOutcome};
pub use mirror::{MirrorInfo, NoopMirror, SchtasksMirror, TaskRunnerMirror};
pub use staged::{PromotionTracker, TrackingEntry, TrackingStatus};
pub use store::JsonStore;
pub use tasks::{Frequency, OperationType, RunStatus, ScheduledTask, TaskSchedule};
pub use templates::{TaskTemplate, builtin_templates, find_template};
