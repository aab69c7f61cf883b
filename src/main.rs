//! # wsusctl: WSUS administration console
//!
//! Runs WSUS scripts with retries and circuit breaking, applies bulk
//! approvals and declines, and keeps scheduled maintenance tasks.
//!
//! Usage:
//!   wsusctl daemon                              # Run the task scheduler
//!   wsusctl tasks list                          # Show scheduled tasks
//!   wsusctl tasks create --template daily-sync  # Create a task from a template
//!   wsusctl run-task <id>                       # Entry point for the OS task runner
//!   wsusctl approve <update>... --group Pilot   # Bulk approval

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime, Utc, Weekday};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wsusctl_core::config::{WsusConfig, expand_path};
use wsusctl_core::error::WsusError;
use wsusctl_core::traits::executor::OperationExecutor;
use wsusctl_core::types::{OperationParams, UpdateInfo, UpdateSortField, sort_updates};
use wsusctl_executor::bulk::{BulkOperationCoordinator, BulkProgress, NamedBatch, ProgressSink};
use wsusctl_executor::circuit::CircuitRegistry;
use wsusctl_executor::retry::{RetryExecutor, RetryPolicy};
use wsusctl_executor::script::ScriptExecutor;
use wsusctl_scheduler::handler::{OP_APPROVE, OP_DECLINE, OP_GET_UPDATES, ScriptTaskHandler};
use wsusctl_scheduler::mirror::{NoopMirror, SchtasksMirror, TaskRunnerMirror};
use wsusctl_scheduler::store::JsonStore;
use wsusctl_scheduler::tasks::{Frequency, OperationType, RunStatus, ScheduledTask, TaskSchedule};
use wsusctl_scheduler::{TaskScheduleEngine, builtin_templates};

#[derive(Parser)]
#[command(name = "wsusctl", version, about = "🛡️ wsusctl: WSUS administration console")]
struct Cli {
    /// Config file (default: ~/.wsusctl/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C
    Daemon,
    /// Manage scheduled tasks
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Run a task's current occurrence and advance its schedule
    RunTask { id: String },
    /// Approve updates for target groups
    Approve {
        #[arg(required = true)]
        updates: Vec<String>,
        /// Target group (repeatable)
        #[arg(short, long = "group", required = true)]
        groups: Vec<String>,
    },
    /// Decline updates
    Decline {
        #[arg(required = true)]
        updates: Vec<String>,
    },
    /// Show staged-approval tracking for a task
    Tracking {
        task: String,
        /// Refresh entries against installation telemetry first
        #[arg(long)]
        evaluate: bool,
    },
    /// Exclude an update from staged promotion
    Skip { task: String, update: String },
    /// List updates known to the server
    Updates {
        /// title | kb | classification | date
        #[arg(long, default_value = "title")]
        sort: String,
        #[arg(long)]
        desc: bool,
        #[arg(long)]
        include_declined: bool,
    },
    /// Probe operations and show their circuit state
    Circuits {
        /// Operation to call once (repeatable)
        #[arg(long = "probe")]
        probes: Vec<String>,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    List,
    Templates,
    Create(CreateArgs),
    Enable { id: String },
    Disable { id: String },
    Delete { id: String },
    /// Run immediately without moving the schedule
    Run {
        id: String,
        /// Start the mirrored OS task instead of running in-process
        #[arg(long)]
        detached: bool,
    },
}

#[derive(clap::Args)]
struct CreateArgs {
    /// Built-in template id
    #[arg(long, conflicts_with = "kind")]
    template: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, value_enum)]
    kind: Option<KindArg>,
    #[arg(long, value_enum, default_value = "weekly")]
    frequency: FrequencyArg,
    /// HH:MM, UTC
    #[arg(long, default_value = "02:00")]
    time: String,
    /// Weekdays for weekly tasks, e.g. tue,thu
    #[arg(long, value_delimiter = ',')]
    days: Vec<String>,
    #[arg(long)]
    day_of_month: Option<u32>,
    #[arg(long)]
    interval_minutes: Option<u32>,
    /// YYYY-MM-DD (default: today)
    #[arg(long)]
    start: Option<String>,
    #[arg(long)]
    end: Option<String>,
    #[arg(long)]
    disabled: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Staged,
    Cleanup,
    Sync,
}

#[derive(Clone, Copy, ValueEnum)]
enum FrequencyArg {
    Once,
    Daily,
    Weekly,
    Monthly,
    Interval,
}

/// Everything the commands need, built once from config.
struct Services {
    config: WsusConfig,
    executor: Arc<dyn OperationExecutor>,
    retry: Arc<RetryExecutor>,
    bulk: BulkOperationCoordinator,
}

impl Services {
    fn new(config: WsusConfig) -> Self {
        let executor: Arc<dyn OperationExecutor> = Arc::new(ScriptExecutor::from_config(&config));
        let retry = Arc::new(RetryExecutor::new(
            RetryPolicy::from_config(&config.operations),
            Arc::new(CircuitRegistry::new()),
        ));
        let bulk = BulkOperationCoordinator::from_config(&config.operations);
        Self {
            config,
            executor,
            retry,
            bulk,
        }
    }

    async fn engine(&self) -> Result<TaskScheduleEngine> {
        let scheduler = &self.config.scheduler;
        let store = JsonStore::from_config_dir(&scheduler.data_dir);
        let mirror: Arc<dyn TaskRunnerMirror> = if scheduler.mirror_enabled {
            Arc::new(SchtasksMirror::from_config(scheduler))
        } else {
            Arc::new(NoopMirror)
        };
        let handler = Arc::new(ScriptTaskHandler::new(
            self.executor.clone(),
            self.retry.clone(),
            self.bulk.clone(),
            scheduler.evaluation,
        ));
        let engine = TaskScheduleEngine::new(store, mirror, handler);
        engine.load().await?;
        Ok(engine)
    }
}

fn init_logging(verbose: bool, config: &WsusConfig) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let directives = format!("wsusctl={level},wsusctl_executor={level},wsusctl_scheduler={level}");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling remaining work");
            trigger.cancel();
        }
    });
    token
}

fn progress_printer() -> ProgressSink {
    Arc::new(|p: BulkProgress| match p.current_item {
        Some(item) => println!("   [{}/{}] {item}", p.completed + p.failed + 1, p.total),
        None => println!("   done: {} ok, {} failed", p.completed, p.failed),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => WsusConfig::load_from(&expand_path(path))?,
        None => WsusConfig::load()?,
    };
    init_logging(cli.verbose, &config);
    let services = Services::new(config);

    match cli.command {
        Command::Daemon => daemon(&services).await,
        Command::Tasks { action } => tasks(&services, action).await,
        Command::RunTask { id } => {
            let engine = services.engine().await?;
            let outcome = match engine.run_scheduled(&id).await {
                Ok(outcome) => outcome,
                // Another process already ran or is running this occurrence.
                Err(e @ (WsusError::AlreadyInState(_) | WsusError::Conflict(_))) => {
                    tracing::info!("⏭️ Nothing to run for {id}: {e}");
                    println!("{e}");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            println!("{}", outcome.message);
            if outcome.status == RunStatus::Failed {
                anyhow::bail!("task {id} failed");
            }
            Ok(())
        }
        Command::Approve { updates, groups } => {
            let mut params = OperationParams::new();
            params.insert("targetGroups".into(), serde_json::json!(groups));
            bulk(&services, OP_APPROVE, params, updates).await
        }
        Command::Decline { updates } => {
            bulk(&services, OP_DECLINE, OperationParams::new(), updates).await
        }
        Command::Tracking { task, evaluate } => {
            let engine = services.engine().await?;
            let entries = if evaluate {
                engine.evaluate_tracking(&task).await?
            } else {
                engine.get_task(&task).await?;
                engine.tracking_entries(&task).await
            };
            if entries.is_empty() {
                println!("No tracked updates.");
            }
            for e in entries {
                println!(
                    "{:<38} {:<20} ok={} failed={} pending={}  {}",
                    e.update_id,
                    e.status.to_string(),
                    e.successful_installations,
                    e.failed_installations,
                    e.pending_installations,
                    e.status_message
                );
            }
            Ok(())
        }
        Command::Skip { task, update } => {
            let engine = services.engine().await?;
            let entry = engine.skip_tracking_entry(&task, &update).await?;
            println!("⏭️  {} ({}) skipped", entry.update_title, entry.update_id);
            Ok(())
        }
        Command::Updates {
            sort,
            desc,
            include_declined,
        } => {
            let field: UpdateSortField = sort.parse()?;
            let mut params = OperationParams::new();
            params.insert("includeDeclined".into(), serde_json::json!(include_declined));
            let output = services
                .retry
                .run_operation(services.executor.as_ref(), OP_GET_UPDATES, &params, &interrupt_token())
                .await?;
            let mut updates: Vec<UpdateInfo> = output.parse()?;
            sort_updates(&mut updates, field, desc);
            for u in &updates {
                let flags = [
                    (u.is_approved, "approved"),
                    (u.is_declined, "declined"),
                    (u.is_superseded, "superseded"),
                ]
                .iter()
                .filter(|(on, _)| *on)
                .map(|(_, name)| *name)
                .collect::<Vec<_>>()
                .join(",");
                println!("{:<10} {:<24} {} [{}]", u.kb_article, u.classification, u.title, flags);
            }
            println!("{} updates", updates.len());
            Ok(())
        }
        Command::Circuits { probes } => {
            let cancel = interrupt_token();
            for name in &probes {
                let result = services
                    .retry
                    .run_operation(services.executor.as_ref(), name, &OperationParams::new(), &cancel)
                    .await;
                if let Err(e) = result {
                    println!("❌ {name}: {e}");
                }
            }
            let policy = services.retry.policy();
            println!(
                "Retry policy: {} retries, initial delay {:?}, circuit cooldown {:?}",
                policy.max_retries,
                policy.initial_delay,
                services.retry.circuits().cooldown()
            );
            for (name, snap) in services.retry.circuits().snapshots() {
                let retry_after = snap
                    .retry_after
                    .map(|d| format!(", retry in {}s", d.as_secs()))
                    .unwrap_or_default();
                println!("{name}: {} ({} failures{retry_after})", snap.state, snap.failure_count);
            }
            Ok(())
        }
    }
}

async fn daemon(services: &Services) -> Result<()> {
    let engine = services.engine().await?;
    println!("🛡️ wsusctl v{}", env!("CARGO_PKG_VERSION"));
    println!("   🖥️  Server:   {}:{}", services.config.server.name, services.config.server.port);
    println!("   📂 Data Dir: {}", expand_path(&services.config.scheduler.data_dir).display());
    println!("   📜 Scripts:  {}", expand_path(&services.config.scripts.directory).display());
    println!();

    engine.start().await?;
    for task in engine.get_tasks().await.iter().filter(|t| t.is_enabled) {
        if let Some(next) = task.next_run_at {
            println!("   ⏰ {} → {}", task.name, next.format("%Y-%m-%d %H:%M UTC"));
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    engine.shutdown().await;
    Ok(())
}

async fn bulk(
    services: &Services,
    operation: &str,
    params: OperationParams,
    items: Vec<String>,
) -> Result<()> {
    let batch = NamedBatch {
        operation: operation.to_string(),
        item_param: "updateId".into(),
        params,
    };
    println!("📦 {operation} × {}", items.len());
    let result = services
        .bulk
        .run_named(
            services.executor.clone(),
            Some(services.retry.clone()),
            batch,
            items,
            &interrupt_token(),
            Some(progress_printer()),
        )
        .await;

    for error in &result.errors {
        println!("   ❌ {}: {}", error.item_id, error.message);
    }
    println!("{}", result.summary());
    if !result.success || result.cancelled {
        anyhow::bail!("{operation} did not complete for every update");
    }
    Ok(())
}

async fn tasks(services: &Services, action: TaskAction) -> Result<()> {
    if let TaskAction::Templates = action {
        for t in builtin_templates() {
            println!("{:<24} {:<18} {}", t.id, t.operation_type.to_string(), t.description);
        }
        return Ok(());
    }

    let engine = services.engine().await?;
    match action {
        TaskAction::Templates => {}
        TaskAction::List => {
            let tasks = engine.get_tasks().await;
            if tasks.is_empty() {
                println!("No scheduled tasks.");
            }
            for t in tasks {
                let next = t
                    .next_run_at
                    .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".into());
                let mirror = match engine.mirror_info(&t.id).await {
                    Ok(Some(info)) => info.status,
                    Ok(None) => "not mirrored".into(),
                    Err(_) => "unknown".into(),
                };
                println!(
                    "{} {:<36} {:<28} {:<18} next {}  last {:?}  os: {}",
                    if t.is_enabled { "●" } else { "○" },
                    t.id,
                    t.name,
                    t.operation_type.to_string(),
                    next,
                    t.last_run_status,
                    mirror
                );
            }
        }
        TaskAction::Create(args) => {
            let task = match &args.template {
                Some(template) => {
                    engine
                        .create_from_template(template, args.name.as_deref())
                        .await?
                }
                None => engine.save_task(task_from_args(&args)?).await?,
            };
            println!("📅 Created '{}' ({})", task.name, task.id);
        }
        TaskAction::Enable { id } => {
            let task = engine.set_enabled(&id, true).await?;
            println!("▶️  '{}' enabled", task.name);
        }
        TaskAction::Disable { id } => {
            let task = engine.set_enabled(&id, false).await?;
            println!("⏸️  '{}' disabled", task.name);
        }
        TaskAction::Delete { id } => {
            let task = engine.delete_task(&id).await?;
            println!("🗑️  '{}' deleted", task.name);
        }
        TaskAction::Run { id, detached } => {
            if detached {
                engine.run_via_mirror(&id).await?;
                println!("🚀 Started OS task for {id}");
            } else {
                let outcome = engine.run_now(&id).await?;
                println!("{:?}: {}", outcome.status, outcome.message);
            }
        }
    }
    Ok(())
}

fn task_from_args(args: &CreateArgs) -> Result<ScheduledTask> {
    let kind = args
        .kind
        .context("either --template or --kind is required")?;
    let operation_type = match kind {
        KindArg::Staged => OperationType::StagedApproval,
        KindArg::Cleanup => OperationType::Cleanup,
        KindArg::Sync => OperationType::Synchronization,
    };
    let frequency = match args.frequency {
        FrequencyArg::Once => Frequency::Once,
        FrequencyArg::Daily => Frequency::Daily,
        FrequencyArg::Weekly => Frequency::Weekly,
        FrequencyArg::Monthly => Frequency::Monthly,
        FrequencyArg::Interval => Frequency::Interval,
    };
    let parse_date = |s: &str| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
    };
    let days_of_week = args
        .days
        .iter()
        .map(|d| {
            d.parse::<Weekday>()
                .map_err(|_| anyhow::anyhow!("invalid weekday '{d}'"))
        })
        .collect::<Result<Vec<_>>>()?;

    let schedule = TaskSchedule {
        frequency,
        time_of_day: NaiveTime::parse_from_str(&args.time, "%H:%M")
            .with_context(|| format!("invalid time '{}'", args.time))?,
        days_of_week,
        day_of_month: args.day_of_month,
        start_date: match &args.start {
            Some(s) => parse_date(s)?,
            None => Utc::now().date_naive(),
        },
        end_date: args.end.as_deref().map(parse_date).transpose()?,
        interval_minutes: args.interval_minutes,
    };

    let name = args
        .name
        .clone()
        .unwrap_or_else(|| format!("{operation_type} ({})", args.frequency_label()));
    let mut task = ScheduledTask::new(&name, operation_type, schedule);
    task.is_enabled = !args.disabled;
    Ok(task)
}

impl CreateArgs {
    fn frequency_label(&self) -> &'static str {
        match self.frequency {
            FrequencyArg::Once => "once",
            FrequencyArg::Daily => "daily",
            FrequencyArg::Weekly => "weekly",
            FrequencyArg::Monthly => "monthly",
            FrequencyArg::Interval => "interval",
        }
    }
}
