//! Task data model: the common task record and its Plugin / Job / Plain variants.

use std::collections::HashSet;
use std::path::PathBuf;

use regex::Regex;

use crate::config::Parameter;

/// A compiled command or message matcher.
#[derive(Debug, Clone)]
pub struct InputMatcher {
    pub regex: Regex,
    /// Command name handed to the plugin when this matcher hits.
    pub command: String,
    /// Context label per capture group; empty for groups without context.
    pub contexts: Vec<String>,
}

impl InputMatcher {
    /// Compile a command matcher, anchored to the whole (trimmed) command.
    pub fn command(
        pattern: &str,
        command: impl Into<String>,
        contexts: Vec<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(&format!(r"(?i:^\s*{pattern}\s*$)"))?,
            command: command.into(),
            contexts,
        })
    }

    /// Compile an ambient message matcher; matches anywhere in the message.
    pub fn message(
        pattern: &str,
        command: impl Into<String>,
        contexts: Vec<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(&format!("(?i:{pattern})"))?,
            command: command.into(),
            contexts,
        })
    }

    /// Capture groups of a hit, with unmatched optional groups as "".
    pub fn captures(&self, text: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(text)?;
        Some(
            caps.iter()
                .skip(1)
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }
}

/// A labelled, anchored regex used for reply prompts and job arguments.
#[derive(Debug, Clone)]
pub struct ReplyMatcher {
    pub label: String,
    pub regex: Regex,
}

impl ReplyMatcher {
    pub fn new(label: impl Into<String>, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            label: label.into(),
            regex: Regex::new(&format!(r"^\s*(?:{pattern})\s*$"))?,
        })
    }
}

/// Fires a job when `user` says something matching `regex` in `channel`.
#[derive(Debug, Clone)]
pub struct JobTrigger {
    pub user: String,
    pub channel: String,
    pub regex: Regex,
}

#[derive(Debug, Clone, Default)]
pub struct Plugin {
    pub commands: Vec<InputMatcher>,
    pub message_matchers: Vec<InputMatcher>,
    pub reply_matchers: Vec<ReplyMatcher>,
    pub catch_all: bool,
    pub admin_commands: HashSet<String>,
    pub authorized_commands: HashSet<String>,
    pub authorize_all_commands: bool,
    pub elevated_commands: HashSet<String>,
    pub elevate_immediate_commands: HashSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Job {
    pub triggers: Vec<JobTrigger>,
    pub arguments: Vec<ReplyMatcher>,
    /// Number of run logs to keep; at least one is always kept.
    pub history_logs: usize,
    pub quiet: bool,
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    Plugin(Plugin),
    Job(Job),
    Plain,
}

/// A runnable unit of work.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub description: String,
    /// Default channel; job notifications go here.
    pub channel: Option<String>,
    /// Channels the task is visible in; empty means all channels.
    pub channels: Vec<String>,
    pub all_channels: bool,
    /// Allowed users, `*` wildcards permitted; empty means everyone.
    pub users: Vec<String>,
    pub elevator: Option<String>,
    pub authorizer: Option<String>,
    pub auth_require: String,
    pub parameters: Vec<Parameter>,
    pub disabled: bool,
    pub disabled_reason: Option<String>,
    pub privileged: bool,
    pub namespace: Option<String>,
    pub path: Option<PathBuf>,
    pub require_admin: bool,
    pub disallow_direct: bool,
    pub direct_only: bool,
    pub kind: TaskKind,
}

impl Task {
    /// A task with default attributes, visible everywhere.
    pub fn new(name: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            channel: None,
            channels: Vec::new(),
            all_channels: true,
            users: Vec::new(),
            elevator: None,
            authorizer: None,
            auth_require: String::new(),
            parameters: Vec::new(),
            disabled: false,
            disabled_reason: None,
            privileged: false,
            namespace: None,
            path: None,
            require_admin: false,
            disallow_direct: false,
            direct_only: false,
            kind,
        }
    }

    pub fn as_plugin(&self) -> Option<&Plugin> {
        match &self.kind {
            TaskKind::Plugin(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&Job> {
        match &self.kind {
            TaskKind::Job(j) => Some(j),
            _ => None,
        }
    }

    pub fn is_plugin(&self) -> bool {
        matches!(self.kind, TaskKind::Plugin(_))
    }

    pub fn is_job(&self) -> bool {
        matches!(self.kind, TaskKind::Job(_))
    }

    /// "plugin", "job" or "task".
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TaskKind::Plugin(_) => "plugin",
            TaskKind::Job(_) => "job",
            TaskKind::Plain => "task",
        }
    }

    /// Whether `user` in `channel` may see this task. An empty channel is a
    /// direct message.
    pub fn available(&self, user: &str, channel: &str) -> bool {
        if self.disabled {
            tracing::trace!(task = %self.name, "not available: disabled");
            return false;
        }
        let direct = channel.is_empty();
        if direct && self.disallow_direct {
            return false;
        }
        if !direct && self.direct_only {
            return false;
        }
        if !self.users.is_empty() && !self.users.iter().any(|u| wildcard_match(u, user)) {
            tracing::trace!(task = %self.name, user, "not available: user not allowed");
            return false;
        }
        if direct || self.all_channels {
            return true;
        }
        self.channels.iter().any(|c| c == channel)
    }
}

/// Shell-style matching where `*` matches any run of characters.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}
