//! Worker: the state of one running pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::channels::{ConnectorMessage, MessageFormat};
use crate::engine::Engine;
use crate::pipeline::history::HistoryLogger;
use crate::pipeline::types::{PipeStage, PipelineType, TaskSpec};

/// Mutable pipeline state. Guarded by the worker's mutex, which is never held
/// while a task runs.
pub struct PipeState {
    // ── Identity ─────────────────────────────────────────────────────
    /// Random per-pipeline id handed to external tasks as `GOPHER_CALLER_ID`.
    pub eid: String,
    pub user: String,
    pub user_id: String,
    /// Channel name; empty for a direct message.
    pub channel: String,
    pub channel_id: String,
    pub protocol: String,
    pub thread_id: String,
    pub threaded_message: bool,
    pub msg: String,
    pub is_command: bool,
    pub format: MessageFormat,

    // ── Task lists ───────────────────────────────────────────────────
    pub next_tasks: Vec<TaskSpec>,
    pub final_tasks: Vec<TaskSpec>,
    pub fail_tasks: Vec<TaskSpec>,
    pub stage: PipeStage,

    pub environment: HashMap<String, String>,

    // ── Exclusivity ──────────────────────────────────────────────────
    pub exclusive_tag: String,
    pub exclusive: bool,
    pub queue_task: bool,
    pub abort_pipeline: bool,

    // ── Security ─────────────────────────────────────────────────────
    pub elevated: bool,
    pub privileged: bool,
    /// Triggered and scheduled pipelines skip the security gate.
    pub automatic_task: bool,
    /// Set once the first task's checks were already done by the caller.
    pub bypass_security_checks: bool,

    // ── History ──────────────────────────────────────────────────────
    pub run_index: Option<u64>,
    pub logger: Option<Arc<dyn HistoryLogger>>,

    pub failed_task: String,
    pub failed_task_args: Vec<String>,
    pub failed_task_description: String,

    // ── Pipeline metadata ────────────────────────────────────────────
    pub pipe_name: String,
    pub pipe_desc: String,
    pub parent_pipe_name: String,
    pub parent_pipe_desc: String,
    pub pipeline_type: Option<PipelineType>,
    pub verbose: bool,
    pub job_name: Option<String>,
    pub job_channel: String,
    /// Namespace a job pipeline shares with the plain tasks it runs.
    pub namespace: Option<String>,
    /// The task running now, or the last one that ran.
    pub current_task: Option<TaskSpec>,
}

impl PipeState {
    fn blank() -> Self {
        Self {
            eid: Uuid::new_v4().simple().to_string(),
            user: String::new(),
            user_id: String::new(),
            channel: String::new(),
            channel_id: String::new(),
            protocol: String::new(),
            thread_id: String::new(),
            threaded_message: false,
            msg: String::new(),
            is_command: false,
            format: MessageFormat::default(),
            next_tasks: Vec::new(),
            final_tasks: Vec::new(),
            fail_tasks: Vec::new(),
            stage: PipeStage::Primary,
            environment: HashMap::new(),
            exclusive_tag: String::new(),
            exclusive: false,
            queue_task: false,
            abort_pipeline: false,
            elevated: false,
            privileged: false,
            automatic_task: false,
            bypass_security_checks: false,
            run_index: None,
            logger: None,
            failed_task: String::new(),
            failed_task_args: Vec::new(),
            failed_task_description: String::new(),
            pipe_name: String::new(),
            pipe_desc: String::new(),
            parent_pipe_name: String::new(),
            parent_pipe_desc: String::new(),
            pipeline_type: None,
            verbose: false,
            job_name: None,
            job_channel: String::new(),
            namespace: None,
            current_task: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::blank()
    }
}

/// One pipeline's context. Tasks reach it through a [`crate::worker::Robot`].
pub struct Worker {
    pub id: u64,
    pub(crate) engine: Arc<Engine>,
    pub(crate) state: Mutex<PipeState>,
}

impl Worker {
    /// A worker for a message heard from a connector. `msg` is the text the
    /// matcher sees, with any robot-name prefix already stripped.
    pub fn for_message(
        engine: Arc<Engine>,
        incoming: &ConnectorMessage,
        msg: String,
        is_command: bool,
    ) -> Arc<Self> {
        let mut state = PipeState::blank();
        state.user = incoming.user.clone();
        state.user_id = incoming.user_id.clone();
        state.channel = incoming.channel.clone();
        state.channel_id = incoming.channel_id.clone();
        state.protocol = incoming.protocol.clone();
        state.thread_id = incoming.thread_id.clone();
        state.threaded_message = incoming.threaded_message;
        state.format = incoming.format;
        state.msg = msg;
        state.is_command = is_command;
        Self::with_state(engine, state)
    }

    /// A worker with no originating user, for scheduled pipelines.
    pub fn automatic(engine: Arc<Engine>, protocol: &str, channel: &str) -> Arc<Self> {
        let mut state = PipeState::blank();
        state.protocol = protocol.to_string();
        state.channel = channel.to_string();
        state.automatic_task = true;
        Self::with_state(engine, state)
    }

    fn with_state(engine: Arc<Engine>, state: PipeState) -> Arc<Self> {
        let id = engine.next_worker_id();
        Arc::new(Self {
            id,
            engine,
            state: Mutex::new(state),
        })
    }

    /// A fresh worker for a sub-job, trigger or spawned pipeline: same
    /// originator and security status, none of the pipeline's own state.
    pub async fn clone_for_child(&self) -> Arc<Self> {
        let s = self.state.lock().await;
        let mut state = PipeState::blank();
        state.user = s.user.clone();
        state.user_id = s.user_id.clone();
        state.channel = s.channel.clone();
        state.channel_id = s.channel_id.clone();
        state.protocol = s.protocol.clone();
        state.thread_id = s.thread_id.clone();
        state.threaded_message = s.threaded_message;
        state.msg = s.msg.clone();
        state.is_command = s.is_command;
        state.format = s.format;
        state.pipe_name = s.pipe_name.clone();
        state.pipe_desc = s.pipe_desc.clone();
        state.automatic_task = s.automatic_task;
        state.elevated = s.elevated;
        drop(s);
        Self::with_state(Arc::clone(&self.engine), state)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub(crate) async fn current_stage(&self) -> PipeStage {
        self.state.lock().await.stage
    }

    /// Append a line to the pipeline's run log, if it has one.
    pub(crate) async fn log_line(&self, line: &str) {
        let logger = self.state.lock().await.logger.clone();
        if let Some(logger) = logger {
            logger.log(line).await;
        }
    }

    pub(crate) async fn section(&self, name: &str, info: &str) {
        let logger = self.state.lock().await.logger.clone();
        if let Some(logger) = logger {
            logger.section(name, info).await;
        }
    }
}
