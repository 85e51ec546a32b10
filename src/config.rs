//! Configuration types.
//!
//! Robot-wide settings come from `TASKBOT_*` environment variables.
//! Task definitions come from a JSON task file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Robot configuration.
#[derive(Debug, Clone)]
pub struct RobotConfig {
    /// Name the robot answers to ("floyd, ping").
    pub name: String,
    /// Single-character alias that marks a message as a command (";ping").
    pub alias: char,
    /// Users allowed to run admin commands.
    pub admins: Vec<String>,
    /// Authorizer plugin used when a task doesn't name one.
    pub default_authorizer: Option<String>,
    /// Elevator plugin used when a task doesn't name one.
    pub default_elevator: Option<String>,
    /// How long the matcher trusts short-term context and last-heard memories.
    pub keep_listening: Duration,
    /// Age after which general memories are pruned.
    pub memory_ttl: Duration,
    /// How long `prompt_for_reply` waits for the user.
    pub reply_timeout: Duration,
    /// JSON task file.
    pub task_file: Option<PathBuf>,
    /// Directory for job run logs; in-memory when unset.
    pub history_dir: Option<PathBuf>,
    /// Directory for the key/value brain; in-memory when unset.
    pub brain_dir: Option<PathBuf>,
    /// User name the terminal connector starts as.
    pub terminal_user: String,
    /// Channel the terminal connector starts in.
    pub terminal_channel: String,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            name: "floyd".to_string(),
            alias: ';',
            admins: Vec::new(),
            default_authorizer: None,
            default_elevator: None,
            keep_listening: Duration::from_secs(77),
            memory_ttl: Duration::from_secs(7 * 60),
            reply_timeout: Duration::from_secs(120),
            task_file: None,
            history_dir: None,
            brain_dir: None,
            terminal_user: "alice".to_string(),
            terminal_channel: "general".to_string(),
        }
    }
}

impl RobotConfig {
    /// Build from `TASKBOT_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let alias = match std::env::var("TASKBOT_ALIAS") {
            Ok(s) => {
                let mut chars = s.trim().chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => c,
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            key: "TASKBOT_ALIAS".to_string(),
                            message: format!("expected a single character, got '{s}'"),
                        });
                    }
                }
            }
            Err(_) => defaults.alias,
        };

        Ok(Self {
            name: std::env::var("TASKBOT_NAME").unwrap_or(defaults.name),
            alias,
            admins: std::env::var("TASKBOT_ADMINS")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            default_authorizer: non_empty_var("TASKBOT_DEFAULT_AUTHORIZER"),
            default_elevator: non_empty_var("TASKBOT_DEFAULT_ELEVATOR"),
            keep_listening: secs_var("TASKBOT_KEEP_LISTENING_SECS", defaults.keep_listening)?,
            memory_ttl: secs_var("TASKBOT_MEMORY_TTL_SECS", defaults.memory_ttl)?,
            reply_timeout: secs_var("TASKBOT_REPLY_TIMEOUT_SECS", defaults.reply_timeout)?,
            task_file: non_empty_var("TASKBOT_TASKS").map(PathBuf::from),
            history_dir: non_empty_var("TASKBOT_HISTORY_DIR").map(PathBuf::from),
            brain_dir: non_empty_var("TASKBOT_BRAIN_DIR").map(PathBuf::from),
            terminal_user: std::env::var("TASKBOT_TERMINAL_USER").unwrap_or(defaults.terminal_user),
            terminal_channel: std::env::var("TASKBOT_TERMINAL_CHANNEL")
                .unwrap_or(defaults.terminal_channel),
        })
    }

    /// Whether `user` is listed as an admin.
    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.iter().any(|a| a == user)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn secs_var(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(s) => s
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(default),
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ── Task file ────────────────────────────────────────────────────────

/// Top-level task file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub namespaces: HashMap<String, NamespaceConfig>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

impl TaskFile {
    /// Parse a task file from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Read and parse a task file.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_json(&raw)
    }
}

/// A name/value parameter handed to tasks through their environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

/// Parameters shared by every task in a namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

/// One task definition. Common attributes plus a `type`-tagged variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Default channel; jobs post their notifications here.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub all_channels: bool,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub elevator: Option<String>,
    #[serde(default)]
    pub authorizer: Option<String>,
    #[serde(default)]
    pub auth_require: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub namespace: Option<String>,
    /// External executable; tasks without one need an in-process handler.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub require_admin: bool,
    #[serde(default)]
    pub disallow_direct: bool,
    #[serde(default)]
    pub direct_only: bool,
    #[serde(flatten)]
    pub kind: TaskKindConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKindConfig {
    Plugin(PluginConfig),
    Job(JobConfig),
    Task,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub commands: Vec<MatcherConfig>,
    #[serde(default)]
    pub message_matchers: Vec<MatcherConfig>,
    #[serde(default)]
    pub reply_matchers: Vec<ReplyMatcherConfig>,
    #[serde(default)]
    pub catch_all: bool,
    #[serde(default)]
    pub admin_commands: Vec<String>,
    #[serde(default)]
    pub authorized_commands: Vec<String>,
    #[serde(default)]
    pub authorize_all_commands: bool,
    #[serde(default)]
    pub elevated_commands: Vec<String>,
    #[serde(default)]
    pub elevate_immediate_commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    pub regex: String,
    pub command: String,
    /// Context label per capture group; empty string for none.
    #[serde(default)]
    pub contexts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyMatcherConfig {
    pub label: String,
    pub regex: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub arguments: Vec<ReplyMatcherConfig>,
    #[serde(default)]
    pub history_logs: usize,
    #[serde(default)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub user: String,
    pub channel: String,
    pub regex: String,
}

/// A cron schedule that starts a job or task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub schedule: String,
    pub task: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}
