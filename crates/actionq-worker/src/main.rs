use std::sync::Arc;
use std::time::Duration;

use actionq_core::{ActionArgs, QueueConfig};
use actionq_hooks::HookRegistry;
use actionq_scheduler::{
    ActionId, ActionQueue, ActionStore, EnqueueOptions, Outcome, QueueRunner,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

mod handlers;
mod housekeeping;

use housekeeping::Housekeeper;

#[derive(Parser)]
#[command(name = "actionq-worker", version, about = "Run and inspect an actionq queue")]
struct Cli {
    /// Config file (defaults to $ACTIONQ_CONFIG, then ~/.actionq/actionq.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work the queue until interrupted
    Run {
        /// Process due actions once and exit
        #[arg(long)]
        once: bool,
    },
    /// Print how many actions are due for this worker's filters
    CountDue,
    /// Execute one action by id, due or not
    Process { id: i64 },
    /// Add an action to the queue
    Enqueue {
        hook: String,
        /// Arguments as a JSON object, or an array for positional arguments
        #[arg(long, default_value = "{}")]
        args: String,
        /// First run (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// Repeat every N seconds
        #[arg(long, conflicts_with = "cron")]
        every: Option<i64>,
        /// Repeat on a 5-field cron expression
        #[arg(long)]
        cron: Option<String>,
        /// IANA timezone for --cron
        #[arg(long, requires = "cron")]
        timezone: Option<String>,
        #[arg(long, default_value = "")]
        group: String,
        #[arg(long, default_value_t = actionq_scheduler::types::DEFAULT_PRIORITY)]
        priority: u8,
        /// Skip if a matching action is already pending or running
        #[arg(long)]
        unique: bool,
    },
    /// Print action counts by status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "actionq_worker=info,actionq_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > ACTIONQ_CONFIG env > ~/.actionq/actionq.toml
    let config_path = cli.config.or_else(|| std::env::var("ACTIONQ_CONFIG").ok());
    let config = QueueConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        QueueConfig::default()
    });
    config.ensure_database_dir()?;
    info!(path = %config.database.path, "opening SQLite database");

    let registry = Arc::new(HookRegistry::new());
    handlers::register_builtin(&registry);

    match cli.command {
        Command::Run { once: true } => {
            let runner = build_runner(&config, &registry)?;
            let processed = tokio::task::spawn_blocking(move || runner.run()).await??;
            println!("processed {processed} action(s)");
        }
        Command::Run { once: false } => serve(&config, &registry).await?,
        Command::CountDue => {
            let runner = build_runner(&config, &registry)?;
            println!("{}", runner.count_due()?);
        }
        Command::Process { id } => {
            let runner = build_runner(&config, &registry)?;
            let report = runner.process_one(ActionId(id))?;
            match &report.outcome {
                Outcome::Completed => println!("action {id} completed"),
                Outcome::Failed(e) => println!("action {id} failed: {e}"),
                Outcome::Skipped(status) => println!("action {id} skipped ({status})"),
                Outcome::Interrupted(status) => println!("action {id} interrupted ({status})"),
            }
            if let Some(next) = report.successor {
                println!("next occurrence: action {next}");
            }
        }
        Command::Enqueue {
            hook,
            args,
            at,
            every,
            cron,
            timezone,
            group,
            priority,
            unique,
        } => {
            let queue =
                ActionQueue::with_timezone_name(open_store(&config)?, &config.schedule.timezone)?;
            let args = ActionArgs::from_json(&args).context("--args must be JSON")?;
            let mut opts = EnqueueOptions::default().group(group).priority(priority);
            if unique {
                opts = opts.unique();
            }
            let first = at.unwrap_or_else(Utc::now);
            let id = match (every, cron) {
                (Some(secs), _) => queue.schedule_recurring(first, secs, &hook, args, &opts)?,
                (None, Some(expr)) => {
                    queue.schedule_cron(first, &expr, timezone.as_deref(), &hook, args, &opts)?
                }
                (None, None) if at.is_some() => queue.schedule_single(first, &hook, args, &opts)?,
                (None, None) => queue.enqueue_async(&hook, args, &opts)?,
            };
            match id {
                Some(id) => println!("enqueued action {id}"),
                None => println!("skipped: a matching action is already queued"),
            }
        }
        Command::Status => {
            let store = open_store(&config)?;
            for (status, count) in store.action_counts()? {
                println!("{status:<12} {count}");
            }
        }
    }
    Ok(())
}

/// Runner loops plus housekeeping until ctrl-c.
async fn serve(config: &QueueConfig, registry: &Arc<HookRegistry>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = Vec::new();

    // each runner gets its own connection; they coordinate through claims
    for _ in 0..config.runner.workers.max(1) {
        let runner = Arc::new(build_runner(config, registry)?);
        tasks.push(tokio::spawn(runner.run_loop(shutdown_rx.clone())));
    }
    let housekeeper = Arc::new(Housekeeper::open(config)?);
    tasks.push(tokio::spawn(housekeeper.run(shutdown_rx)));
    info!(workers = config.runner.workers.max(1), "actionq worker running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, finishing in-flight batches");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!("worker task ended abnormally: {e}");
        }
    }
    Ok(())
}

fn open_store(config: &QueueConfig) -> anyhow::Result<Arc<ActionStore>> {
    let busy = Duration::from_millis(config.database.busy_timeout_ms);
    let store = ActionStore::open(&config.database.path, busy)
        .with_context(|| format!("opening {}", config.database.path))?;
    Ok(Arc::new(store))
}

fn build_runner(config: &QueueConfig, registry: &Arc<HookRegistry>) -> anyhow::Result<QueueRunner> {
    Ok(QueueRunner::new(
        open_store(config)?,
        Arc::clone(registry) as Arc<dyn actionq_hooks::Dispatcher>,
        &config.runner,
        &config.failure,
    ))
}
