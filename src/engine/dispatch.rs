//! Inbound message dispatch.
//!
//! Each message is matched at most once: plugin commands, then the `run job`
//! command, then any waiting prompt, then ambient matchers, then the
//! catch-all. Job triggers are checked for every message on their own.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::channels::ConnectorMessage;
use crate::engine::{Engine, jobs};
use crate::events::Event;
use crate::pipeline::executor::start_pipeline;
use crate::pipeline::matcher::{self, Candidate, MatchOutcome, MatcherClass};
use crate::pipeline::types::PipelineType;
use crate::tasks::{TaskRegistry, TaskRetVal};
use crate::worker::memory::LAST_MSG_KEY;
use crate::worker::{Robot, Worker};

pub const MULTIPLE_MATCHES: &str =
    "Yikes! Your command matched multiple plugins, so I'm not doing ANYTHING";
pub const LAST_HEARD_PROMPT: &str = "Yes?";

fn forgotten_context(label: &str) -> String {
    format!(
        "Sorry, I don't remember which {label} we were talking about - please re-enter your command and be more specific"
    )
}

/// Collapse runs of whitespace to single spaces.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl Engine {
    /// Whether `text` is addressed to the robot, and the text with any alias
    /// or name prefix removed.
    pub(crate) fn detect_command(&self, text: &str, flagged: bool, direct: bool) -> (bool, String) {
        let trimmed = text.trim();
        if let Some(rest) = trimmed.strip_prefix(self.config.alias) {
            return (true, collapse_whitespace(rest));
        }
        if let Some(caps) = self.name_prefix.captures(trimmed) {
            let rest = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            return (true, collapse_whitespace(rest));
        }
        if flagged || direct {
            (true, collapse_whitespace(trimmed))
        } else {
            (false, trimmed.to_string())
        }
    }

    /// Fill in user and channel names for connectors that only sent IDs.
    async fn resolve_names(&self, incoming: &mut ConnectorMessage) {
        let ids = self.identities.snapshot(&incoming.protocol).await;
        if incoming.user.is_empty() && !incoming.user_id.is_empty() {
            incoming.user = ids
                .user_name(&incoming.user_id)
                .map(str::to_string)
                .unwrap_or_else(|| format!("<{}>", incoming.user_id));
        }
        if incoming.channel.is_empty() && !incoming.channel_id.is_empty() {
            incoming.channel = ids
                .channel_name(&incoming.channel_id)
                .map(str::to_string)
                .unwrap_or_else(|| format!("<{}>", incoming.channel_id));
        }
    }

    /// Dispatch one inbound message. Returns the pipelines it started.
    pub async fn handle_message(
        self: &Arc<Self>,
        mut incoming: ConnectorMessage,
    ) -> Vec<JoinHandle<TaskRetVal>> {
        self.resolve_names(&mut incoming).await;
        let (is_command, mut msg) =
            self.detect_command(&incoming.text, incoming.is_command, incoming.is_direct());
        let (user, channel) = (incoming.user.clone(), incoming.channel.clone());

        tracing::debug!(
            protocol = %incoming.protocol,
            %user,
            %channel,
            is_command,
            "Received message ({} chars)",
            msg.len()
        );

        if is_command
            && let Some(connector) = self.connectors.get(&incoming.protocol)
        {
            connector
                .message_heard(&incoming.user_id, &incoming.channel_id)
                .await;
        }

        let registry = self.registry().await;
        let mut handles = Vec::new();

        handles.extend(self.fire_triggers(&registry, &incoming, &msg).await);

        if is_command && msg.is_empty() {
            match self
                .memories
                .recall(LAST_MSG_KEY, &user, &channel, self.config.keep_listening)
                .await
            {
                Some(last) => {
                    tracing::debug!(%user, %channel, "Blank command, using last message heard");
                    self.memories.forget(LAST_MSG_KEY, &user, &channel).await;
                    msg = last;
                }
                None => {
                    let worker = Worker::for_message(Arc::clone(self), &incoming, msg, is_command);
                    Robot::new(worker, None).say(LAST_HEARD_PROMPT).await;
                    return handles;
                }
            }
        }

        let worker = Worker::for_message(Arc::clone(self), &incoming, msg.clone(), is_command);
        let mut matched = false;

        if is_command {
            let outcome =
                matcher::match_plugins(&registry, &user, &channel, &msg, MatcherClass::Command);
            if let Some(started) = self
                .run_outcome(&worker, outcome, PipelineType::PlugCommand)
                .await
            {
                matched = true;
                handles.extend(started);
            }
        }

        if !matched
            && is_command
            && let Some(handle) = jobs::match_run_job(&worker, &msg)
        {
            self.replies.interrupt(&user, &channel).await;
            matched = true;
            handles.push(handle);
        }

        if !matched && self.replies.deliver(&user, &channel, &msg).await {
            tracing::debug!(%user, %channel, "Message delivered to a waiting prompt");
            matched = true;
        }

        if !matched {
            let outcome =
                matcher::match_plugins(&registry, &user, &channel, &msg, MatcherClass::Message);
            if let Some(started) = self
                .run_outcome(&worker, outcome, PipelineType::PlugMessage)
                .await
            {
                matched = true;
                handles.extend(started);
            }
        }

        if !matched && is_command {
            match matcher::catch_all(&registry, &user, &channel) {
                MatchOutcome::Matched(c) => {
                    matched = true;
                    tracing::debug!(task = %c.task.name, "Running catch-all");
                    handles.push(tokio::spawn(start_pipeline(
                        Arc::clone(&worker),
                        c.task,
                        PipelineType::CatchAll,
                        c.command,
                        vec![msg.clone()],
                    )));
                }
                MatchOutcome::Multiple(names) => {
                    tracing::error!(?names, "More than one catch-all plugin, running none");
                    self.events.emit(Event::CatchAllsMultiple);
                }
                MatchOutcome::NoMatch => {
                    tracing::debug!(%user, %channel, "Unmatched command");
                }
            }
        }

        if !matched && !is_command && handles.is_empty() {
            self.memories
                .remember(LAST_MSG_KEY, &user, &channel, msg)
                .await;
        }
        handles
    }

    /// Run a plugin match. `None` when nothing matched; otherwise whatever
    /// was started (possibly nothing, after a refusal).
    async fn run_outcome(
        &self,
        worker: &Arc<Worker>,
        outcome: MatchOutcome,
        ptype: PipelineType,
    ) -> Option<Vec<JoinHandle<TaskRetVal>>> {
        let (user, channel) = {
            let s = worker.state.lock().await;
            (s.user.clone(), s.channel.clone())
        };
        match outcome {
            MatchOutcome::NoMatch => None,
            MatchOutcome::Multiple(names) => {
                tracing::warn!(?names, %user, %channel, "Message matched multiple plugins");
                self.events.emit(Event::MultipleMatchesNoAction);
                Robot::new(Arc::clone(worker), None)
                    .say(MULTIPLE_MATCHES)
                    .await;
                Some(Vec::new())
            }
            MatchOutcome::Matched(mut candidate) => {
                if ptype == PipelineType::PlugCommand {
                    self.replies.interrupt(&user, &channel).await;
                }
                if let Err(label) = matcher::resolve_contexts(
                    &self.memories,
                    &mut candidate,
                    &user,
                    &channel,
                    self.config.keep_listening,
                )
                .await
                {
                    Robot::new(Arc::clone(worker), None)
                        .say(forgotten_context(&label))
                        .await;
                    return Some(Vec::new());
                }
                let Candidate {
                    task,
                    command,
                    args,
                    ..
                } = candidate;
                tracing::debug!(task = %task.name, %command, %ptype, "Starting pipeline");
                Some(vec![tokio::spawn(start_pipeline(
                    Arc::clone(worker),
                    task,
                    ptype,
                    command,
                    args,
                ))])
            }
        }
    }

    /// Start a pipeline for every job whose trigger matches. Each runs in
    /// its own worker with no security gate.
    async fn fire_triggers(
        self: &Arc<Self>,
        registry: &TaskRegistry,
        incoming: &ConnectorMessage,
        text: &str,
    ) -> Vec<JoinHandle<TaskRetVal>> {
        let mut handles = Vec::new();
        for (task, args) in matcher::match_triggers(registry, &incoming.user, &incoming.channel, text) {
            let worker = Worker::for_message(Arc::clone(self), incoming, text.to_string(), false);
            worker.state.lock().await.automatic_task = true;
            handles.push(tokio::spawn(start_pipeline(
                worker,
                task,
                PipelineType::JobTrigger,
                "run".to_string(),
                args,
            )));
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_collapsed() {
        assert_eq!(collapse_whitespace("  run   job\tbuild  "), "run job build");
    }

    #[test]
    fn forgotten_context_names_the_label() {
        assert!(forgotten_context("location").starts_with("Sorry, I don't remember which location"));
    }
}
