//! Hearken CLI entry point.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use hearken::config::Config;
use hearken::conversation::{ContextCache, ConversationRepository as _, SqliteConversationStore};
use hearken::db::Db;
use hearken::messaging::{ChatPlatform as _, StdioPlatform};
use hearken::relevance::{Capabilities, RelevanceEngine, scorer};
use hearken::tasks::{SqliteTaskStore, TaskRepository as _, TaskScheduler};
use hearken::{ConversationKey, ConversationKind};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Parser)]
#[command(name = "hearken")]
#[command(about = "Decides when a chat assistant should speak, and schedules the work")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Also write daily log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate JSON-line messages from stdin and write actions to stdout
    Run,
    /// Show persisted task counts and the next due task
    Status,
    /// Delete finished tasks and idle conversations
    Cleanup,
    /// Share a conversation with a user
    Share {
        #[command(flatten)]
        conversation: ConversationArgs,
        /// User to share with
        user: String,
    },
    /// List conversations shared with a user
    Shared {
        user: String,
    },
    /// Delete a conversation's stored history
    Forget {
        #[command(flatten)]
        conversation: ConversationArgs,
    },
}

#[derive(clap::Args)]
struct ConversationArgs {
    /// Channel id
    channel: String,

    /// Guild id, for guild channels
    #[arg(long)]
    guild: Option<String>,
}

impl ConversationArgs {
    fn key(&self) -> ConversationKey {
        ConversationKey::new(self.channel.clone(), self.guild.clone())
    }

    fn kind(&self) -> ConversationKind {
        if self.guild.is_some() {
            ConversationKind::Guild
        } else {
            ConversationKind::Direct
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.debug, cli.log_dir.as_deref());

    let config = load_config(cli.config.as_deref())?;
    tracing::debug!(data_dir = %config.data_dir().display(), "configuration loaded");

    let db = Db::connect(&config.data_dir())
        .await
        .context("failed to connect to database")?;

    let outcome = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config, cli.config, &db).await,
        Command::Status => status(&db).await,
        Command::Cleanup => cleanup(&config, &db).await,
        Command::Share { conversation, user } => share(&db, &conversation, &user).await,
        Command::Shared { user } => shared(&db, &user).await,
        Command::Forget { conversation } => forget(&config, &db, &conversation).await,
    };

    db.close().await;
    outcome
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load().context("failed to load configuration"),
    }
}

/// Logs go to stderr, since stdout carries platform actions.
fn init_logging(debug: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, "hearken.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .compact(),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

async fn run(config: &Config, config_path: Option<PathBuf>, db: &Db) -> anyhow::Result<()> {
    let tasks = Arc::new(SqliteTaskStore::new(db.sqlite.clone()));
    let conversations = Arc::new(SqliteConversationStore::new(db.sqlite.clone()));
    let platform = Arc::new(StdioPlatform::new(config.assistant.id.clone()));

    let capabilities = Capabilities {
        scorer: scorer::build_scorer(&config.scorer, config.policy.neutral_score)
            .context("failed to build scorer")?,
        responder: platform.clone(),
    };

    let (scheduler, fired_rx) = TaskScheduler::new(tasks, config.scheduler);
    let engine = Arc::new(RelevanceEngine::new(
        config,
        Arc::new(scheduler),
        conversations,
        capabilities,
        platform.clone(),
    ));

    #[cfg(unix)]
    spawn_policy_reload(engine.clone(), config_path);
    #[cfg(not(unix))]
    drop(config_path);

    let inbound = platform.start().await.context("failed to start stdio platform")?;
    tracing::info!(assistant = %config.assistant.id, "hearken started");

    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    engine
        .run(fired_rx, inbound, shutdown, config.context.sweep_interval())
        .await
        .context("engine stopped with an error")?;

    tracing::info!("hearken stopped");
    Ok(())
}

/// Re-read the config file on SIGHUP and swap in its relevance policy.
#[cfg(unix)]
fn spawn_policy_reload(engine: Arc<RelevanceEngine>, config_path: Option<PathBuf>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(error) => {
            tracing::warn!(%error, "failed to listen for SIGHUP, policy reload disabled");
            return;
        }
    };

    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match load_config(config_path.as_deref()) {
                Ok(config) => engine.runtime_config().reload_config(&config),
                Err(error) => tracing::warn!(%error, "config reload failed, keeping current policy"),
            }
        }
    });
}

#[derive(Serialize)]
struct StatusReport {
    counts: Vec<hearken::tasks::TaskCount>,
    next_task: Option<hearken::tasks::TaskSummary>,
}

async fn status(db: &Db) -> anyhow::Result<()> {
    let tasks = SqliteTaskStore::new(db.sqlite.clone());
    let report = StatusReport {
        counts: tasks.counts().await.context("failed to count tasks")?,
        next_task: tasks
            .next_pending()
            .await
            .context("failed to read next task")?
            .as_ref()
            .map(Into::into),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn cleanup(config: &Config, db: &Db) -> anyhow::Result<()> {
    let tasks = Arc::new(SqliteTaskStore::new(db.sqlite.clone()));
    let conversations = SqliteConversationStore::new(db.sqlite.clone());

    // No timers are armed here, so every overdue row counts as orphaned.
    let (scheduler, _fired_rx) = TaskScheduler::new(tasks, config.scheduler);
    let tasks_removed = scheduler.cleanup().await.context("failed to clean up tasks")?;
    let conversations_removed = conversations
        .delete_inactive(chrono::Utc::now() - config.context.inactivity())
        .await
        .context("failed to delete idle conversations")?;

    tracing::info!(tasks_removed, conversations_removed, "cleanup finished");
    println!("removed {tasks_removed} tasks and {conversations_removed} conversations");
    Ok(())
}

async fn share(db: &Db, conversation: &ConversationArgs, user: &str) -> anyhow::Result<()> {
    let conversations = SqliteConversationStore::new(db.sqlite.clone());
    let key = conversation.key();

    if conversations
        .share(&key, user)
        .await
        .context("failed to share conversation")?
    {
        println!("shared {key} with {user}");
    } else {
        anyhow::bail!("no stored conversation {key}");
    }
    Ok(())
}

async fn shared(db: &Db, user: &str) -> anyhow::Result<()> {
    let conversations = SqliteConversationStore::new(db.sqlite.clone())
        .shared_with(user)
        .await
        .context("failed to list shared conversations")?;

    println!("{}", serde_json::to_string_pretty(&conversations)?);
    Ok(())
}

async fn forget(config: &Config, db: &Db, conversation: &ConversationArgs) -> anyhow::Result<()> {
    let store = Arc::new(SqliteConversationStore::new(db.sqlite.clone()));
    let cache = ContextCache::new(store, config.context);
    let key = conversation.key();

    let deleted = cache
        .reset(conversation.kind(), &key)
        .await
        .context("failed to delete conversation")?;
    tracing::info!(conversation = %key, deleted, "conversation forgotten");
    println!("{}", if deleted { "deleted" } else { "nothing stored" });
    Ok(())
}
