//! Message matching: plugin commands, ambient messages and job triggers.

use std::sync::Arc;
use std::time::Duration;

use crate::tasks::{InputMatcher, Task, TaskRegistry};
use crate::worker::memory::{ShortTermMemory, context_key};

/// Which plugin matchers to scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherClass {
    /// Commands addressed to the robot.
    Command,
    /// Anything said in a channel.
    Message,
}

/// A plugin matcher that hit.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub task: Arc<Task>,
    pub class: MatcherClass,
    pub command: String,
    pub args: Vec<String>,
    pub contexts: Vec<String>,
}

#[derive(Debug)]
pub enum MatchOutcome {
    NoMatch,
    Matched(Candidate),
    /// More than one task matched; nothing should run.
    Multiple(Vec<String>),
}

fn first_hit(matchers: &[InputMatcher], text: &str) -> Option<(String, Vec<String>, Vec<String>)> {
    matchers.iter().find_map(|m| {
        m.captures(text)
            .map(|caps| (m.command.clone(), caps, m.contexts.clone()))
    })
}

/// Scan every plugin visible to `user` in `channel`. At most one task may
/// match; the whole registry is checked before deciding.
pub fn match_plugins(
    registry: &TaskRegistry,
    user: &str,
    channel: &str,
    text: &str,
    class: MatcherClass,
) -> MatchOutcome {
    let mut found: Option<Candidate> = None;
    let mut names = Vec::new();
    for task in registry.available(user, channel) {
        let Some(plugin) = task.as_plugin() else {
            continue;
        };
        let matchers = match class {
            MatcherClass::Command => &plugin.commands,
            MatcherClass::Message => &plugin.message_matchers,
        };
        let Some((command, args, contexts)) = first_hit(matchers, text) else {
            continue;
        };
        tracing::debug!(task = %task.name, %command, ?class, "Message matched");
        names.push(task.name.clone());
        if found.is_none() {
            found = Some(Candidate {
                task: Arc::clone(task),
                class,
                command,
                args,
                contexts,
            });
        }
    }
    match (found, names.len()) {
        (Some(c), 1) => MatchOutcome::Matched(c),
        (Some(_), _) => MatchOutcome::Multiple(names),
        (None, _) => MatchOutcome::NoMatch,
    }
}

/// The single catch-all plugin visible here, if there is exactly one.
pub fn catch_all(registry: &TaskRegistry, user: &str, channel: &str) -> MatchOutcome {
    let all: Vec<_> = registry
        .available(user, channel)
        .filter(|t| t.as_plugin().is_some_and(|p| p.catch_all))
        .collect();
    match all.as_slice() {
        [] => MatchOutcome::NoMatch,
        [task] => MatchOutcome::Matched(Candidate {
            task: Arc::clone(task),
            class: MatcherClass::Command,
            command: "catchall".to_string(),
            args: Vec::new(),
            contexts: Vec::new(),
        }),
        many => MatchOutcome::Multiple(many.iter().map(|t| t.name.clone()).collect()),
    }
}

/// Fill in context arguments. An empty argument or "it" is replaced with the
/// remembered value for its context label; any other value becomes the new
/// memory. Returns the label that couldn't be resolved.
pub async fn resolve_contexts(
    memories: &ShortTermMemory,
    candidate: &mut Candidate,
    user: &str,
    channel: &str,
    horizon: Duration,
) -> Result<(), String> {
    for (i, label) in candidate.contexts.iter().enumerate() {
        if label.is_empty() || i >= candidate.args.len() {
            continue;
        }
        let key = context_key(label);
        let arg = &mut candidate.args[i];
        if arg.is_empty() || arg.eq_ignore_ascii_case("it") {
            match memories.recall_fresh(&key, user, channel, horizon).await {
                Some(value) => *arg = value,
                None => return Err(label.clone()),
            }
        } else {
            memories.remember(&key, user, channel, arg.clone()).await;
        }
    }
    Ok(())
}

/// Jobs whose triggers match: the user and channel must be exactly the
/// trigger's, and the regex must hit. Each job fires at most once.
pub fn match_triggers(
    registry: &TaskRegistry,
    user: &str,
    channel: &str,
    text: &str,
) -> Vec<(Arc<Task>, Vec<String>)> {
    let mut fired = Vec::new();
    for task in registry.all() {
        let Some(job) = task.as_job() else {
            continue;
        };
        if task.disabled {
            tracing::trace!(job = %task.name, "Skipping disabled job");
            continue;
        }
        let hit = job
            .triggers
            .iter()
            .filter(|t| t.user == user && t.channel == channel)
            .find_map(|t| {
                t.regex.captures(text).map(|caps| {
                    caps.iter()
                        .skip(1)
                        .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                        .collect::<Vec<_>>()
                })
            });
        if let Some(args) = hit {
            tracing::debug!(job = %task.name, user, channel, "Job trigger matched");
            fired.push((Arc::clone(task), args));
        }
    }
    fired
}
