//! Pipeline types.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::events::Event;
use crate::tasks::Task;

/// How a pipeline was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PipelineType {
    PlugCommand,
    PlugMessage,
    CatchAll,
    JobTrigger,
    SpawnedTask,
    Scheduled,
    JobCommand,
}

impl PipelineType {
    /// Event emitted when the first task of a pipeline of this type runs.
    pub fn ran_event(self, command: &str) -> Option<Event> {
        match self {
            Self::PlugCommand if command == "init" => None,
            Self::PlugCommand => Some(Event::CommandTaskRan),
            Self::PlugMessage => Some(Event::AmbientTaskRan),
            Self::CatchAll => Some(Event::CatchAllTaskRan),
            Self::JobTrigger => Some(Event::TriggeredTaskRan),
            Self::SpawnedTask => Some(Event::SpawnedTaskRan),
            Self::Scheduled => Some(Event::ScheduledTaskRan),
            Self::JobCommand => Some(Event::JobTaskRan),
        }
    }

    /// Whether the pipeline was started by a user asking for it directly.
    pub fn is_user_command(self) -> bool {
        matches!(self, Self::PlugCommand | Self::CatchAll | Self::JobCommand)
    }
}

impl std::fmt::Display for PipelineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PlugCommand => "plugCommand",
            Self::PlugMessage => "plugMessage",
            Self::CatchAll => "catchAll",
            Self::JobTrigger => "jobTrigger",
            Self::SpawnedTask => "spawnedTask",
            Self::Scheduled => "scheduled",
            Self::JobCommand => "jobCmd",
        };
        write!(f, "{s}")
    }
}

/// Which of a pipeline's task lists is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PipeStage {
    #[default]
    Primary,
    Fail,
    Final,
}

impl std::fmt::Display for PipeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Primary => "primary",
            Self::Fail => "fail",
            Self::Final => "final",
        };
        write!(f, "{s}")
    }
}

/// A unit of work queued in a pipeline.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task: Arc<Task>,
    pub command: String,
    pub args: Vec<String>,
}

impl TaskSpec {
    pub fn new(task: Arc<Task>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            task,
            command: command.into(),
            args,
        }
    }

    pub fn name(&self) -> &str {
        &self.task.name
    }
}
