//! Error types for taskbot.
//!
//! Task outcomes are not errors: they travel as [`crate::tasks::TaskRetVal`]
//! and [`crate::tasks::RetVal`]. The types here cover the library's own
//! failures (configuration, connectors, history storage, task launch).

/// Top-level error type for the robot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Task {task} has an invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        task: String,
        pattern: String,
        reason: String,
    },

    #[error("Task {0} is defined more than once")]
    DuplicateTask(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connector-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Connector {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send message on connector {name}: {reason}")]
    SendFailed { name: String, reason: String },
}

/// Job history and brain storage errors.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No history for job {job} run {index}")]
    NotFound { job: String, index: u64 },
}

impl From<serde_json::Error> for HistoryError {
    fn from(e: serde_json::Error) -> Self {
        HistoryError::Serialization(e.to_string())
    }
}

/// Task invocation errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {name} has no handler and no external path")]
    NoHandler { name: String },

    #[error("Task {name} failed to launch: {reason}")]
    LaunchFailed { name: String, reason: String },
}

/// Result type alias for the robot.
pub type Result<T> = std::result::Result<T, Error>;
