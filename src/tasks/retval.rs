//! Return values for task runs and pipeline edits.

use serde::{Deserialize, Serialize};

/// Outcome of running a single task. Numeric values double as the exit
/// codes external tasks use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRetVal {
    Normal = 0,
    Success = 1,
    Fail = 2,
    MechanismFail = 3,
    ConfigurationError = 4,
    PipelineAborted = 5,
    RobotStopping = 6,
}

impl TaskRetVal {
    /// Map a process exit code; anything unknown is a mechanism failure.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::Normal,
            1 => Self::Success,
            2 => Self::Fail,
            3 => Self::MechanismFail,
            4 => Self::ConfigurationError,
            5 => Self::PipelineAborted,
            6 => Self::RobotStopping,
            _ => Self::MechanismFail,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

impl std::fmt::Display for TaskRetVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "Normal",
            Self::Success => "Success",
            Self::Fail => "Fail",
            Self::MechanismFail => "MechanismFail",
            Self::ConfigurationError => "ConfigurationError",
            Self::PipelineAborted => "PipelineAborted",
            Self::RobotStopping => "RobotStopping",
        };
        write!(f, "{s}")
    }
}

/// Result of a Robot call: pipeline edits, messaging and prompting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetVal {
    Ok,
    TaskNotFound,
    TaskDisabled,
    InvalidTaskType,
    InvalidStage,
    PrivilegeViolation,
    MissingArguments,
    CommandNotMatched,
    Failed,
    ReplyNotMatched,
    RetryPrompt,
    TimeoutExpired,
    Interrupted,
    MatcherNotFound,
    FailedMessageSend,
    UserNotFound,
    ChannelNotFound,
}

impl RetVal {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl std::fmt::Display for RetVal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_round_trip_through_code() {
        for rv in [
            TaskRetVal::Normal,
            TaskRetVal::Success,
            TaskRetVal::Fail,
            TaskRetVal::MechanismFail,
            TaskRetVal::ConfigurationError,
            TaskRetVal::PipelineAborted,
        ] {
            assert_eq!(TaskRetVal::from_exit_code(rv.code()), rv);
        }
    }

    #[test]
    fn unknown_exit_code_is_mechanism_fail() {
        assert_eq!(TaskRetVal::from_exit_code(42), TaskRetVal::MechanismFail);
        assert_eq!(TaskRetVal::from_exit_code(-1), TaskRetVal::MechanismFail);
    }
}
