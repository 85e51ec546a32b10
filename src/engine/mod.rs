//! Engine: the process-wide collaborators every worker shares.
//!
//! One `Engine` is built at startup. It owns the task registry, short-term
//! memory, reply waiters, run queues, identity maps and the connectors, and
//! runs the main message loop.

pub mod dispatch;
pub mod jobs;
pub mod lifecycle;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use regex::Regex;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;

use crate::builtins;
use crate::channels::ConnectorManager;
use crate::config::RobotConfig;
use crate::error::{ConfigError, Error};
use crate::events::{Event, EventSink};
use crate::identity::IdentityMaps;
use crate::pipeline::exclusive::RunQueues;
use crate::pipeline::history::{Brain, HistoryProvider, JobHistoryRecorder, MemBrain, MemHistory};
use crate::tasks::{TaskHandler, TaskInvoker, TaskRegistry, TaskRetVal};
use crate::worker::{ReplyRegistry, ShortTermMemory};

pub use lifecycle::{Lifecycle, PipelineGuard, Refusal};

/// Raises OS privilege for privileged pipelines.
pub trait PrivilegeHook: Send + Sync {
    fn raise(&self, pipeline: &str);
}

/// Privilege hook for processes that never drop privilege.
pub struct NoopPrivilege;

impl PrivilegeHook for NoopPrivilege {
    fn raise(&self, pipeline: &str) {
        tracing::trace!(pipeline, "Privilege raise requested, nothing to do");
    }
}

/// Pluggable dependencies of the engine.
///
/// Bundles the shared components to reduce argument count.
pub struct EngineDeps {
    pub invoker: Arc<dyn TaskInvoker>,
    pub brain: Arc<dyn Brain>,
    pub history: Arc<dyn HistoryProvider>,
    pub privilege: Arc<dyn PrivilegeHook>,
}

impl EngineDeps {
    /// Dependencies that keep everything in memory.
    pub fn in_memory(invoker: Arc<dyn TaskInvoker>) -> Self {
        Self {
            invoker,
            brain: Arc::new(MemBrain::new()),
            history: Arc::new(MemHistory::new()),
            privilege: Arc::new(NoopPrivilege),
        }
    }
}

pub struct Engine {
    pub(crate) config: RobotConfig,
    pub(crate) deps: EngineDeps,
    registry: RwLock<Arc<TaskRegistry>>,
    pub(crate) builtins: HashMap<String, Arc<dyn TaskHandler>>,
    pub(crate) recorder: JobHistoryRecorder,
    pub(crate) memories: ShortTermMemory,
    pub(crate) replies: ReplyRegistry,
    pub(crate) run_queues: RunQueues,
    pub(crate) identities: IdentityMaps,
    pub(crate) connectors: ConnectorManager,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) events: EventSink,
    /// `<name>[:,\s]<rest>` with the name matched case-insensitively.
    name_prefix: Regex,
    next_worker: AtomicU64,
}

impl Engine {
    /// Build the engine. Builtin plugins are added to `registry`.
    pub fn new(
        config: RobotConfig,
        mut registry: TaskRegistry,
        connectors: ConnectorManager,
        deps: EngineDeps,
    ) -> Result<Arc<Self>, ConfigError> {
        builtins::register(&mut registry)?;
        let pattern = format!(r"(?is)^@?{}(?:[:,\s]\s*(.*))?$", regex::escape(&config.name));
        let name_prefix = Regex::new(&pattern).map_err(|e| ConfigError::InvalidRegex {
            task: config.name.clone(),
            pattern: pattern.clone(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            name = %config.name,
            alias = %config.alias,
            tasks = registry.count(),
            "Engine configured"
        );

        Ok(Arc::new(Self {
            recorder: JobHistoryRecorder::new(Arc::clone(&deps.brain)),
            builtins: builtins::handlers(),
            config,
            deps,
            registry: RwLock::new(Arc::new(registry)),
            memories: ShortTermMemory::new(),
            replies: ReplyRegistry::new(),
            run_queues: RunQueues::new(),
            identities: IdentityMaps::new(),
            connectors,
            lifecycle: Lifecycle::new(),
            events: EventSink::new(),
            name_prefix,
            next_worker: AtomicU64::new(1),
        }))
    }

    pub fn config(&self) -> &RobotConfig {
        &self.config
    }

    /// Snapshot of the current task registry.
    pub async fn registry(&self) -> Arc<TaskRegistry> {
        Arc::clone(&*self.registry.read().await)
    }

    /// Swap in a new set of tasks. Running pipelines keep the tasks they
    /// already hold.
    pub async fn reload(&self, mut registry: TaskRegistry) -> Result<(), ConfigError> {
        builtins::register(&mut registry)?;
        let count = registry.count();
        *self.registry.write().await = Arc::new(registry);
        tracing::info!(tasks = count, "Task registry reloaded");
        Ok(())
    }

    pub fn identities(&self) -> &IdentityMaps {
        &self.identities
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub(crate) fn next_worker_id(&self) -> u64 {
        self.next_worker.fetch_add(1, Ordering::Relaxed)
    }

    // ── Main loop ───────────────────────────────────────────────────

    /// Run until Ctrl+C, an abort, or every connector stream ends.
    pub async fn run(self: Arc<Self>) -> Result<(), Error> {
        let mut message_stream = self.connectors.start_all().await?;

        // Spawn memory pruning task
        let engine = Arc::clone(&self);
        let pruning_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await; // Skip immediate first tick
            loop {
                interval.tick().await;
                let dropped = engine.memories.prune(engine.config.memory_ttl).await;
                if dropped > 0 {
                    tracing::debug!(dropped, "Pruned short-term memories");
                }
            }
        });
        let scheduler_handle = scheduler::spawn_scheduler(Arc::clone(&self), Duration::from_secs(1));

        tracing::info!("Robot {} ready and listening", self.config.name);

        let mut aborted = false;
        loop {
            let message = tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Ctrl+C received, shutting down...");
                    break;
                }
                _ = self.lifecycle.stop_requested() => {
                    tracing::warn!("Abort requested, stopping now");
                    aborted = true;
                    break;
                }
                msg = message_stream.next() => {
                    match msg {
                        Some(m) => m,
                        None => {
                            tracing::info!("All connector streams ended, shutting down...");
                            break;
                        }
                    }
                }
            };
            // Pipelines run on their own tasks; the loop only dispatches.
            for handle in self.handle_message(message).await {
                tokio::spawn(reap_pipeline(handle));
            }
        }

        // Cleanup
        pruning_handle.abort();
        scheduler_handle.abort();
        self.lifecycle.begin_shutdown();
        if !aborted {
            let running = self.lifecycle.running();
            if running > 0 {
                tracing::info!(running, "Waiting for running pipelines to finish");
            }
            self.lifecycle.drain().await;
        }
        self.connectors.shutdown_all().await;
        tracing::info!("Robot {} stopped", self.config.name);
        Ok(())
    }

    /// Refuse new pipelines and wait for the running ones.
    pub async fn shutdown(&self) {
        self.lifecycle.begin_shutdown();
        self.lifecycle.drain().await;
        self.connectors.shutdown_all().await;
    }
}

/// Wait for a pipeline started by the main loop. A pipeline task that died
/// outside the executor's panic capture is logged and yields `None`.
async fn reap_pipeline(handle: JoinHandle<TaskRetVal>) -> Option<TaskRetVal> {
    match handle.await {
        Ok(ret) => Some(ret),
        Err(e) => {
            tracing::warn!("Pipeline task failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn crash() -> TaskRetVal {
        panic!("pipeline crashed")
    }

    #[tokio::test]
    async fn reaped_pipelines_report_their_outcome() {
        let done = tokio::spawn(async { TaskRetVal::Fail });
        assert_eq!(reap_pipeline(done).await, Some(TaskRetVal::Fail));

        assert_eq!(reap_pipeline(tokio::spawn(crash())).await, None);
    }
}
