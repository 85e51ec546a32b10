use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use taskbot::channels::{ConnectorManager, TerminalConnector};
use taskbot::config::{RobotConfig, TaskFile};
use taskbot::engine::{Engine, EngineDeps, NoopPrivilege};
use taskbot::pipeline::history::{Brain, FileBrain, FileHistory, HistoryProvider, MemBrain, MemHistory};
use taskbot::tasks::{DefaultInvoker, TaskRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; keep the guard so the file writer flushes on exit
    let _log_guard = init_tracing();

    let config = RobotConfig::from_env().context("reading TASKBOT_* configuration")?;

    eprintln!("🤖 taskbot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Name: {} (alias '{}')", config.name, config.alias);
    eprintln!(
        "   Type a message and press Enter. |c<channel> and |u<user> switch identity.\n"
    );

    // ── Tasks ────────────────────────────────────────────────────────────
    let task_file = match &config.task_file {
        Some(path) => TaskFile::load(path)
            .await
            .with_context(|| format!("loading task file {}", path.display()))?,
        None => {
            tracing::warn!("TASKBOT_TASKS not set, starting with builtin tasks only");
            TaskFile::default()
        }
    };
    let registry = TaskRegistry::from_config(&task_file)?;

    // ── Storage ──────────────────────────────────────────────────────────
    let brain: Arc<dyn Brain> = match &config.brain_dir {
        Some(dir) => Arc::new(FileBrain::new(dir).await?),
        None => Arc::new(MemBrain::new()),
    };
    let history: Arc<dyn HistoryProvider> = match &config.history_dir {
        Some(dir) => Arc::new(FileHistory::new(dir).await?),
        None => Arc::new(MemHistory::new()),
    };

    // ── Connectors ───────────────────────────────────────────────────────
    let mut connectors = ConnectorManager::new();
    connectors.add(Arc::new(TerminalConnector::new(
        &config.terminal_user,
        &config.terminal_channel,
    )));

    let deps = EngineDeps {
        invoker: Arc::new(DefaultInvoker::new()),
        brain,
        history,
        privilege: Arc::new(NoopPrivilege),
    };
    let engine = Engine::new(config, registry, connectors, deps)?;
    engine.run().await?;

    Ok(())
}

/// stderr logging filtered by `RUST_LOG` (default `info`), plus a daily log
/// file under `TASKBOT_LOG_DIR` when set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match std::env::var("TASKBOT_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "taskbot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
