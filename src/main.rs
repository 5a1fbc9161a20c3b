use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ai_autopilot::clock;
use ai_autopilot::config::AutopilotConfig;
use ai_autopilot::orchestrator::{Orchestrator, PAUSE_FILE};
use ai_autopilot::queue::{Task, TaskId, TaskQueue, TaskType};
use ai_autopilot::session::{SessionRegistry, TmuxSession};

#[derive(Parser, Debug)]
#[command(name = "ai-autopilot")]
#[command(about = "Keep an AI coding assistant working through a task queue")]
struct Cli {
    /// Project directory (defaults to the current directory).
    #[arg(long, global = true, env = "AUTOPILOT_PROJECT_DIR")]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestration loop until interrupted.
    Run {
        #[arg(long)]
        max_cycles: Option<u64>,
    },
    /// Submit a task.
    Add {
        prompt: String,
        #[arg(long, default_value_t = 5)]
        priority: i64,
        #[arg(long, value_enum, default_value_t = Kind::Custom)]
        kind: Kind,
        /// Keep the conversation after this task.
        #[arg(long, conflicts_with = "clear_context")]
        keep_context: bool,
        /// Clear the conversation after this task.
        #[arg(long)]
        clear_context: bool,
    },
    /// Show queue counts and tasks.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Reopen a finished task.
    Requeue { id: String },
    /// Snapshot the queue.
    Backup {
        #[arg(long, default_value = "manual")]
        label: String,
    },
    /// Restore the queue from a snapshot (the newest when omitted).
    Restore { path: Option<PathBuf> },
    /// Remove old finished tasks and snapshots.
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
    /// Stop claiming new tasks.
    Pause,
    /// Resume claiming tasks.
    Resume,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Custom,
    GithubIssue,
    GithubPr,
}

impl From<Kind> for TaskType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Custom => TaskType::Custom,
            Kind::GithubIssue => TaskType::GithubIssue,
            Kind::GithubPr => TaskType::GithubPr,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging()?;

    let mut config = AutopilotConfig::from_env().context("invalid configuration")?;
    if let Some(project) = cli.project {
        config.project_dir = project;
    }

    let queue = TaskQueue::from_config(&config);

    match cli.command {
        Command::Run { max_cycles } => {
            if max_cycles.is_some() {
                config.max_cycles = max_cycles;
            }
            run(config, queue).await?;
        }
        Command::Add {
            prompt,
            priority,
            kind,
            keep_context,
            clear_context,
        } => {
            let mut task = Task::new(
                kind.into(),
                priority,
                serde_json::Value::from(prompt),
                chrono::Utc::now(),
            );
            if keep_context {
                task = task.with_clear_context(false);
            } else if clear_context {
                task = task.with_clear_context(true);
            }
            let id = queue.add(task).await?;
            println!("{id}");
        }
        Command::Status { json } => {
            let tasks = queue.list_tasks(None).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                let counts = queue.counts().await?;
                println!(
                    "total {}  pending {}  in_progress {}  completed {}  failed {}  timeout {}",
                    counts.total,
                    counts.pending,
                    counts.in_progress,
                    counts.completed,
                    counts.failed,
                    counts.timeout
                );
                for task in tasks.iter().filter(|t| !t.status.is_terminal()) {
                    let prompt = task.prompt();
                    let title: String = prompt
                        .lines()
                        .next()
                        .unwrap_or_default()
                        .chars()
                        .take(60)
                        .collect();
                    println!(
                        "{:<12} {:>3}  {:<24} {}",
                        task.status.to_string(),
                        task.priority,
                        task.id.as_str(),
                        title
                    );
                }
            }
        }
        Command::Requeue { id } => {
            let id = TaskId::parse(id)?;
            queue.requeue(&id, "requeued from command line").await?;
            let task = queue.get_task(&id).await?;
            println!("{} {}", task.id, task.status);
        }
        Command::Backup { label } => {
            let path = queue.backup(&label).await?;
            println!("{}", path.display());
        }
        Command::Restore { path } => {
            let path = match path {
                Some(path) => path,
                None => queue
                    .latest_backup()
                    .await?
                    .context("no backups to restore from")?,
            };
            let doc = queue.recover_from_backup(&path).await?;
            println!("restored {} tasks from {}", doc.tasks.len(), path.display());
        }
        Command::Cleanup { days } => {
            let removed = queue
                .cleanup_old(days.unwrap_or(config.task_retention_days))
                .await?;
            let pruned = queue.prune_backups(config.backup_retention_days).await?;
            println!("removed {removed} tasks, {pruned} snapshots");
        }
        Command::Pause => {
            let marker = config.state_dir().join(PAUSE_FILE);
            tokio::fs::create_dir_all(config.state_dir()).await?;
            tokio::fs::write(&marker, b"").await?;
            println!("paused");
        }
        Command::Resume => {
            let marker = config.state_dir().join(PAUSE_FILE);
            match tokio::fs::remove_file(&marker).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            println!("resumed");
        }
    }

    Ok(())
}

async fn run(config: AutopilotConfig, queue: TaskQueue) -> anyhow::Result<()> {
    let clock = clock::system();
    let registry = SessionRegistry::load_from_dir(
        &config.sessions_dir,
        config.max_tracked_sessions,
        clock.clone(),
    )
    .await?;
    let tmux = Arc::new(TmuxSession::new(config.assistant_command.clone()));

    let mut orchestrator = Orchestrator::new(&config, queue, registry, tmux.clone(), tmux, clock);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, stopping");
        on_signal.cancel();
    });

    let summary = orchestrator.run(cancel).await?;
    eprintln!(
        "cycles {}  completed {}  failed {}  limit waits {}  ({})",
        summary.cycles, summary.completed, summary.failed, summary.limit_waits, summary.stop_reason
    );
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM where the platform has it.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Console logging, plus a daily log file when `AUTOPILOT_LOG_DIR` is set.
fn init_logging() -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let Ok(dir) = std::env::var("AUTOPILOT_LOG_DIR") else {
        tracing_subscriber::registry().with(filter).with(console).init();
        return Ok(None);
    };

    std::fs::create_dir_all(&dir).with_context(|| format!("creating log directory {dir}"))?;
    let appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("autopilot")
        .filename_suffix("log")
        .build(&dir)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(Some(guard))
}
