//! Robot: the capability object handed to running tasks.
//!
//! A `Robot` is cheap to clone. It ties a task to the worker running it, and
//! every call goes through the worker's state: pipeline edits, messages,
//! prompts, memories and the exclusive-run claim.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::channels::MessageFormat;
use crate::engine::Engine;
use crate::events::Event;
use crate::pipeline::executor;
use crate::pipeline::security;
use crate::pipeline::types::{PipeStage, PipelineType, TaskSpec};
use crate::tasks::{ReplyMatcher, RetVal, Task, TaskKind, TaskRetVal};
use crate::worker::replies::ReplyStatus;
use crate::worker::state::Worker;

/// Prompts are retried this many times when the user's answer doesn't fit.
const PROMPT_ATTEMPTS: usize = 3;

static STOCK_REPLIES: LazyLock<HashMap<&'static str, ReplyMatcher>> = LazyLock::new(|| {
    const OCTET: &str = r"(?:0|1[0-9]{0,2}|2[0-9]?|2[0-4][0-9]|25[0-5]|[3-9][0-9]?)";
    let ip = format!(r"(?:{OCTET}\.){{3}}{OCTET}");
    [
        ("Email", r"[\w\-.]+@(?:[\w\-]+\.)+[\w\-]{2,4}".to_string()),
        ("Domain", r"(?:[\w\-]+\.)+[\w\-]{2,4}".to_string()),
        ("OTP", r"\d{6}".to_string()),
        ("IPaddr", ip),
        ("SimpleString", r#"[-\w .,_'"?!]+"#.to_string()),
        ("YesNo", "(?i:yes|no|Y|N)".to_string()),
    ]
    .into_iter()
    .map(|(label, re)| {
        let m = ReplyMatcher::new(label, &re).expect("stock reply regex");
        (label, m)
    })
    .collect()
});

/// Which list a pipeline edit targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeOp {
    Add,
    Final,
    Fail,
    Spawn,
}

/// What kind of task an edit expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wanted {
    Plain,
    Job,
    Command,
}

/// Where a message goes.
struct Destination {
    protocol: String,
    /// User name and known ID; the ID is resolved from the name when empty.
    user: Option<(String, String)>,
    /// Channel name and known ID; an empty name means a direct message.
    channel: (String, String),
    thread: String,
}

#[derive(Clone)]
pub struct Robot {
    worker: Arc<Worker>,
    task: Option<Arc<Task>>,
    format: Option<MessageFormat>,
}

impl Robot {
    pub(crate) fn new(worker: Arc<Worker>, task: Option<Arc<Task>>) -> Self {
        Self {
            worker,
            task,
            format: None,
        }
    }

    /// A copy that sends fixed-width messages.
    pub fn fixed(&self) -> Self {
        self.with_format(MessageFormat::Fixed)
    }

    pub fn with_format(&self, format: MessageFormat) -> Self {
        Self {
            format: Some(format),
            ..self.clone()
        }
    }

    fn engine(&self) -> &Arc<Engine> {
        &self.worker.engine
    }

    pub(crate) fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// The task this robot was handed to.
    pub fn task(&self) -> Option<&Arc<Task>> {
        self.task.as_ref()
    }

    pub fn worker_id(&self) -> u64 {
        self.worker.id
    }

    pub async fn user(&self) -> String {
        self.worker.state.lock().await.user.clone()
    }

    pub async fn channel(&self) -> String {
        self.worker.state.lock().await.channel.clone()
    }

    pub async fn protocol(&self) -> String {
        self.worker.state.lock().await.protocol.clone()
    }

    /// Text of the message that started the pipeline.
    pub async fn message(&self) -> String {
        self.worker.state.lock().await.msg.clone()
    }

    // ── Messaging ────────────────────────────────────────────────────

    async fn here(&self, to_user: bool, force_thread: bool) -> (Destination, MessageFormat) {
        let s = self.worker.state.lock().await;
        let thread = if force_thread || s.threaded_message {
            s.thread_id.clone()
        } else {
            String::new()
        };
        let dest = Destination {
            protocol: s.protocol.clone(),
            user: (to_user || s.channel.is_empty()).then(|| (s.user.clone(), s.user_id.clone())),
            channel: (s.channel.clone(), s.channel_id.clone()),
            thread,
        };
        (dest, self.format.unwrap_or(s.format))
    }

    async fn elsewhere(
        &self,
        protocol: Option<&str>,
        user: Option<&str>,
        channel: &str,
        thread: &str,
    ) -> (Destination, MessageFormat) {
        let s = self.worker.state.lock().await;
        let dest = Destination {
            protocol: protocol.map_or_else(|| s.protocol.clone(), str::to_string),
            user: user.map(|u| (u.to_string(), String::new())),
            channel: (channel.to_string(), String::new()),
            thread: thread.to_string(),
        };
        (dest, self.format.unwrap_or(s.format))
    }

    async fn deliver(&self, dest: Destination, format: MessageFormat, msg: &str) -> RetVal {
        if msg.trim().is_empty() {
            tracing::warn!(worker = self.worker.id, "Ignoring attempt to send an empty message");
            return RetVal::FailedMessageSend;
        }
        let engine = self.engine();
        let protocol = if dest.protocol.is_empty() {
            engine.connectors.default_protocol().to_string()
        } else {
            dest.protocol
        };
        let Some(connector) = engine.connectors.get(&protocol) else {
            tracing::error!(%protocol, "No connector for protocol, message dropped");
            return RetVal::FailedMessageSend;
        };
        let ids = engine.identities.snapshot(&protocol).await;

        let user_id = dest.user.as_ref().map(|(name, id)| {
            if id.is_empty() {
                ids.user_id(name).unwrap_or(name).to_string()
            } else {
                id.clone()
            }
        });
        let (channel, known_channel_id) = dest.channel;
        let result = if channel.is_empty() && known_channel_id.is_empty() {
            let Some(user_id) = user_id else {
                tracing::error!("Direct message with no user, message dropped");
                return RetVal::UserNotFound;
            };
            connector
                .send_protocol_user_message(&user_id, msg, format)
                .await
        } else {
            let channel_id = if known_channel_id.is_empty() {
                ids.channel_id(&channel).unwrap_or(&channel).to_string()
            } else {
                known_channel_id
            };
            match (user_id, dest.user) {
                (Some(user_id), Some((user_name, _))) => {
                    connector
                        .send_protocol_user_channel_thread_message(
                            &user_id,
                            &user_name,
                            &channel_id,
                            &dest.thread,
                            msg,
                            format,
                        )
                        .await
                }
                _ => {
                    connector
                        .send_protocol_channel_thread_message(&channel_id, &dest.thread, msg, format)
                        .await
                }
            }
        };
        match result {
            Ok(()) => RetVal::Ok,
            Err(e) => {
                tracing::warn!(%protocol, "Message send failed: {}", e);
                RetVal::FailedMessageSend
            }
        }
    }

    /// Post to the pipeline's channel (the user, for a direct message).
    pub async fn say(&self, msg: impl AsRef<str>) -> RetVal {
        let (dest, format) = self.here(false, false).await;
        self.deliver(dest, format, msg.as_ref()).await
    }

    /// Post to the pipeline's thread.
    pub async fn say_thread(&self, msg: impl AsRef<str>) -> RetVal {
        let (dest, format) = self.here(false, true).await;
        self.deliver(dest, format, msg.as_ref()).await
    }

    /// Post to the pipeline's channel, addressed to the user.
    pub async fn reply(&self, msg: impl AsRef<str>) -> RetVal {
        let (dest, format) = self.here(true, false).await;
        self.deliver(dest, format, msg.as_ref()).await
    }

    pub async fn reply_thread(&self, msg: impl AsRef<str>) -> RetVal {
        let (dest, format) = self.here(true, true).await;
        self.deliver(dest, format, msg.as_ref()).await
    }

    pub async fn send_channel_message(&self, channel: &str, msg: impl AsRef<str>) -> RetVal {
        self.send_channel_thread_message(channel, "", msg).await
    }

    pub async fn send_channel_thread_message(
        &self,
        channel: &str,
        thread: &str,
        msg: impl AsRef<str>,
    ) -> RetVal {
        if channel.is_empty() {
            return RetVal::ChannelNotFound;
        }
        let (dest, format) = self.elsewhere(None, None, channel, thread).await;
        self.deliver(dest, format, msg.as_ref()).await
    }

    /// Direct message to a user.
    pub async fn send_user_message(&self, user: &str, msg: impl AsRef<str>) -> RetVal {
        if user.is_empty() {
            return RetVal::UserNotFound;
        }
        let (dest, format) = self.elsewhere(None, Some(user), "", "").await;
        self.deliver(dest, format, msg.as_ref()).await
    }

    pub async fn send_user_channel_message(
        &self,
        user: &str,
        channel: &str,
        msg: impl AsRef<str>,
    ) -> RetVal {
        self.send_user_channel_thread_message(user, channel, "", msg)
            .await
    }

    pub async fn send_user_channel_thread_message(
        &self,
        user: &str,
        channel: &str,
        thread: &str,
        msg: impl AsRef<str>,
    ) -> RetVal {
        if user.is_empty() {
            return RetVal::UserNotFound;
        }
        let (dest, format) = self.elsewhere(None, Some(user), channel, thread).await;
        self.deliver(dest, format, msg.as_ref()).await
    }

    /// Send on another protocol. An empty user posts to the channel; an
    /// empty channel sends a direct message.
    pub async fn send_protocol_user_channel_message(
        &self,
        protocol: &str,
        user: &str,
        channel: &str,
        msg: impl AsRef<str>,
    ) -> RetVal {
        if user.is_empty() && channel.is_empty() {
            return RetVal::ChannelNotFound;
        }
        let user = (!user.is_empty()).then_some(user);
        let (dest, format) = self.elsewhere(Some(protocol), user, channel, "").await;
        self.deliver(dest, format, msg.as_ref()).await
    }

    // ── Pipeline edits ───────────────────────────────────────────────

    /// Append a plain task to the running pipeline.
    pub async fn add_task(&self, name: &str, args: Vec<String>) -> RetVal {
        self.pipe_task(PipeOp::Add, Wanted::Plain, name, args).await
    }

    /// Append a job; it runs as its own sub-pipeline.
    pub async fn add_job(&self, name: &str, args: Vec<String>) -> RetVal {
        self.pipe_task(PipeOp::Add, Wanted::Job, name, args).await
    }

    /// Append a plugin command; `command` is matched against the plugin's
    /// command matchers.
    pub async fn add_command(&self, plugin: &str, command: &str) -> RetVal {
        self.pipe_task(PipeOp::Add, Wanted::Command, plugin, vec![command.to_string()])
            .await
    }

    /// Run a plain task when the pipeline ends. Final tasks run in reverse
    /// order of adding.
    pub async fn final_task(&self, name: &str, args: Vec<String>) -> RetVal {
        self.pipe_task(PipeOp::Final, Wanted::Plain, name, args).await
    }

    pub async fn final_command(&self, plugin: &str, command: &str) -> RetVal {
        self.pipe_task(PipeOp::Final, Wanted::Command, plugin, vec![command.to_string()])
            .await
    }

    /// Run a plain task if the pipeline fails.
    pub async fn fail_task(&self, name: &str, args: Vec<String>) -> RetVal {
        self.pipe_task(PipeOp::Fail, Wanted::Plain, name, args).await
    }

    pub async fn fail_command(&self, plugin: &str, command: &str) -> RetVal {
        self.pipe_task(PipeOp::Fail, Wanted::Command, plugin, vec![command.to_string()])
            .await
    }

    /// Start a job in a new, independent pipeline.
    pub async fn spawn_job(&self, name: &str, args: Vec<String>) -> RetVal {
        self.pipe_task(PipeOp::Spawn, Wanted::Job, name, args).await
    }

    async fn pipe_task(&self, op: PipeOp, wanted: Wanted, name: &str, args: Vec<String>) -> RetVal {
        let registry = self.engine().registry().await;
        let mut state = self.worker.state.lock().await;

        let refuse = |ret: RetVal, why: &str| {
            tracing::error!(
                worker = self.worker.id,
                task = name,
                op = ?op,
                "Pipeline edit refused: {}",
                why
            );
            ret
        };

        if state.stage != PipeStage::Primary {
            return refuse(RetVal::InvalidStage, "pipeline is past the primary stage");
        }
        let Some(task) = registry.get(name) else {
            return refuse(RetVal::TaskNotFound, "no such task");
        };
        if task.disabled {
            return refuse(RetVal::TaskDisabled, "task is disabled");
        }
        if task.privileged && !state.privileged {
            return refuse(
                RetVal::PrivilegeViolation,
                "unprivileged pipeline can't run a privileged task",
            );
        }
        let type_ok = match wanted {
            Wanted::Plain => matches!(task.kind, TaskKind::Plain),
            Wanted::Job => task.is_job(),
            Wanted::Command => task.is_plugin(),
        };
        if !type_ok {
            return refuse(RetVal::InvalidTaskType, "wrong kind of task");
        }

        let spec = match (wanted, task.as_plugin()) {
            (Wanted::Command, Some(plugin)) => {
                let text = match args.first() {
                    Some(text) if !text.trim().is_empty() => text.clone(),
                    _ => return refuse(RetVal::MissingArguments, "no command text"),
                };
                let hit = plugin
                    .commands
                    .iter()
                    .find_map(|m| m.captures(&text).map(|caps| (m.command.clone(), caps)));
                let Some((command, caps)) = hit else {
                    return refuse(RetVal::CommandNotMatched, "command didn't match the plugin");
                };
                TaskSpec::new(Arc::clone(&task), command, caps)
            }
            _ => TaskSpec::new(Arc::clone(&task), "run", args),
        };

        match op {
            PipeOp::Add => state.next_tasks.push(spec),
            PipeOp::Final => state.final_tasks.insert(0, spec),
            PipeOp::Fail => state.fail_tasks.push(spec),
            PipeOp::Spawn => {
                drop(state);
                let child = self.worker.clone_for_child().await;
                tracing::debug!(
                    worker = self.worker.id,
                    child = child.id,
                    job = %spec.name(),
                    "Spawning job"
                );
                tokio::spawn(executor::start_pipeline(
                    child,
                    spec.task,
                    PipelineType::SpawnedTask,
                    spec.command,
                    spec.args,
                ));
            }
        }
        RetVal::Ok
    }

    // ── Prompting ────────────────────────────────────────────────────

    fn reply_matcher(&self, label: &str) -> Option<ReplyMatcher> {
        if label.starts_with(|c: char| c.is_ascii_uppercase()) {
            return STOCK_REPLIES.get(label).cloned();
        }
        let task = self.task.as_ref()?;
        let matchers = match &task.kind {
            TaskKind::Plugin(p) => &p.reply_matchers,
            TaskKind::Job(j) => &j.arguments,
            TaskKind::Plain => return None,
        };
        matchers.iter().find(|m| m.label == label).cloned()
    }

    /// Ask the user a question and wait for an answer matching `label`.
    /// Labels starting with an uppercase letter name stock patterns (`Email`,
    /// `Domain`, `OTP`, `IPaddr`, `SimpleString`, `YesNo`); others name the
    /// calling task's reply matchers or job arguments.
    pub async fn prompt_for_reply(&self, label: &str, prompt: &str) -> (String, RetVal) {
        let Some(matcher) = self.reply_matcher(label) else {
            tracing::error!(
                task = self.task.as_ref().map(|t| t.name.as_str()).unwrap_or_default(),
                label,
                "No reply matcher for prompt"
            );
            return (String::new(), RetVal::MatcherNotFound);
        };
        let mut ret = RetVal::Ok;
        for _ in 0..PROMPT_ATTEMPTS {
            let (reply, r) = self.prompt_once(&matcher, prompt).await;
            ret = r;
            if !matches!(ret, RetVal::ReplyNotMatched | RetVal::RetryPrompt) {
                return (reply, ret);
            }
        }
        if ret == RetVal::RetryPrompt {
            ret = RetVal::Interrupted;
        }
        (String::new(), ret)
    }

    async fn prompt_once(&self, matcher: &ReplyMatcher, prompt: &str) -> (String, RetVal) {
        let engine = self.engine();
        let (user, channel) = {
            let s = self.worker.state.lock().await;
            (s.user.clone(), s.channel.clone())
        };
        let pending = engine
            .replies
            .register(&user, &channel, matcher.regex.clone())
            .await;
        if pending.first {
            let sent = self.reply(prompt).await;
            if !sent.is_ok() {
                engine.replies.cancel(pending).await;
                return (String::new(), sent);
            }
        } else {
            tracing::debug!(user, channel, "Prompt delayed behind another waiter");
        }

        let reply = engine
            .replies
            .wait(pending, engine.config.reply_timeout)
            .await;
        match reply.status {
            ReplyStatus::Timeout => (String::new(), RetVal::TimeoutExpired),
            ReplyStatus::Interrupted => (String::new(), RetVal::Interrupted),
            ReplyStatus::RetryPrompt => (String::new(), RetVal::RetryPrompt),
            ReplyStatus::Replied if reply.matched => (reply.text.trim().to_string(), RetVal::Ok),
            ReplyStatus::Replied if reply.text.trim() == "-" => (String::new(), RetVal::Interrupted),
            ReplyStatus::Replied => (String::new(), RetVal::ReplyNotMatched),
        }
    }

    // ── Exclusivity ──────────────────────────────────────────────────

    /// Claim the job's exclusive tag (`<job>` or `<job>:<tag>`). Returns true
    /// when held. Otherwise the pipeline queues after this task returns when
    /// `queue` is set, or aborts.
    pub async fn exclusive(&self, tag: &str, queue: bool) -> bool {
        let mut state = self.worker.state.lock().await;
        if state.exclusive {
            return true;
        }
        let Some(job) = state.job_name.clone() else {
            tracing::error!(worker = self.worker.id, "Exclusive called outside of a job");
            return false;
        };
        let full_tag = if tag.is_empty() {
            job
        } else {
            format!("{job}:{tag}")
        };
        state.exclusive_tag = full_tag.clone();
        if self.engine().run_queues.try_claim(&full_tag).await {
            state.exclusive = true;
            tracing::debug!(worker = self.worker.id, tag = %full_tag, "Exclusive lock acquired");
            return true;
        }
        if queue {
            state.queue_task = true;
        } else {
            state.abort_pipeline = true;
        }
        false
    }

    // ── Memory and parameters ────────────────────────────────────────

    /// Remember a value for this user in this channel.
    pub async fn remember(&self, key: &str, value: impl Into<String>) {
        let (user, channel) = {
            let s = self.worker.state.lock().await;
            (s.user.clone(), s.channel.clone())
        };
        self.engine()
            .memories
            .remember(key, &user, &channel, value)
            .await;
    }

    pub async fn recall(&self, key: &str) -> Option<String> {
        let (user, channel) = {
            let s = self.worker.state.lock().await;
            (s.user.clone(), s.channel.clone())
        };
        let engine = self.engine();
        engine
            .memories
            .recall(key, &user, &channel, engine.config.memory_ttl)
            .await
    }

    /// Set a pipeline parameter visible to later tasks. Primary stage only.
    pub async fn set_parameter(&self, name: &str, value: impl Into<String>) -> bool {
        let mut state = self.worker.state.lock().await;
        if state.stage != PipeStage::Primary {
            tracing::error!(worker = self.worker.id, name, "set_parameter after the primary stage");
            return false;
        }
        state.environment.insert(name.to_string(), value.into());
        true
    }

    /// A pipeline parameter, falling back to the calling task's own.
    pub async fn get_parameter(&self, name: &str) -> Option<String> {
        if let Some(v) = self.worker.state.lock().await.environment.get(name) {
            return Some(v.clone());
        }
        self.task
            .as_ref()?
            .parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.clone())
    }

    // ── Security ─────────────────────────────────────────────────────

    /// Whether the user is a robot administrator.
    pub async fn check_admin(&self) -> bool {
        let user = self.user().await;
        let engine = self.engine();
        if engine.config.is_admin(&user) {
            engine.events.emit(Event::AdminCheckPassed);
            true
        } else {
            engine.events.emit(Event::AdminCheckFailed);
            false
        }
    }

    /// Run the task's elevator now. Succeeds at once if the pipeline is
    /// already elevated and `immediate` isn't set.
    pub async fn elevate(&self, immediate: bool) -> bool {
        let Some(task) = self.task.clone() else {
            return false;
        };
        if !immediate && self.worker.state.lock().await.elevated {
            return true;
        }
        security::elevate(self, &task, immediate).await == TaskRetVal::Success
    }

    // ── Logging ──────────────────────────────────────────────────────

    /// Log through tracing and into the run log.
    pub async fn log(&self, level: tracing::Level, msg: &str) {
        let task = self.task.as_ref().map(|t| t.name.as_str()).unwrap_or_default();
        match level {
            tracing::Level::ERROR => tracing::error!(task, "{}", msg),
            tracing::Level::WARN => tracing::warn!(task, "{}", msg),
            tracing::Level::INFO => tracing::info!(task, "{}", msg),
            tracing::Level::DEBUG => tracing::debug!(task, "{}", msg),
            _ => tracing::trace!(task, "{}", msg),
        }
        self.worker.log_line(msg).await;
    }

    pub(crate) async fn log_line(&self, line: &str) {
        self.worker.log_line(line).await;
    }
}
