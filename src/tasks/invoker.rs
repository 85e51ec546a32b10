//! Task invocation: in-process handlers and external executables.

use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::tasks::model::Task;
use crate::tasks::retval::TaskRetVal;
use crate::worker::Robot;

/// An in-process task implementation.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, robot: Robot, command: String, args: Vec<String>) -> TaskRetVal;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Robot, String, Vec<String>) -> Fut + Send + Sync,
    Fut: Future<Output = TaskRetVal> + Send + 'static,
{
    async fn handle(&self, robot: Robot, command: String, args: Vec<String>) -> TaskRetVal {
        (self.0)(robot, command, args).await
    }
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Robot, String, Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskRetVal> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Runs a task's code. Returns the task's result and, on failure, a message
/// for the user.
#[async_trait]
pub trait TaskInvoker: Send + Sync {
    async fn call_task(
        &self,
        robot: Robot,
        task: Arc<Task>,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> (TaskRetVal, String);
}

/// Looks up a registered handler by task name, falling back to running the
/// task's `path` as an external process.
#[derive(Default)]
pub struct DefaultInvoker {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl DefaultInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `name`, replacing any earlier one.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(name, handler);
        self
    }

    async fn run_external(
        &self,
        robot: &Robot,
        task: &Task,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<TaskRetVal, TaskError> {
        let Some(path) = &task.path else {
            return Err(TaskError::NoHandler {
                name: task.name.clone(),
            });
        };

        let output = tokio::process::Command::new(path)
            .arg(command)
            .args(args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| TaskError::LaunchFailed {
                name: task.name.clone(),
                reason: e.to_string(),
            })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            robot.log_line(line).await;
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            robot.log_line(&format!("(stderr) {line}")).await;
        }

        // Killed by a signal: no exit code.
        let ret = output
            .status
            .code()
            .map_or(TaskRetVal::MechanismFail, TaskRetVal::from_exit_code);
        tracing::debug!(task = %task.name, command, ret = %ret, "External task finished");
        Ok(ret)
    }
}

#[async_trait]
impl TaskInvoker for DefaultInvoker {
    async fn call_task(
        &self,
        robot: Robot,
        task: Arc<Task>,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> (TaskRetVal, String) {
        if let Some(handler) = self.handlers.get(&task.name) {
            return (handler.handle(robot, command, args).await, String::new());
        }
        match self.run_external(&robot, &task, &command, &args, &env).await {
            Ok(ret) => (ret, String::new()),
            Err(e @ TaskError::NoHandler { .. }) => {
                tracing::error!(task = %task.name, "{}", e);
                (
                    TaskRetVal::ConfigurationError,
                    format!("There's no code configured for task '{}'", task.name),
                )
            }
            Err(e) => {
                tracing::error!(task = %task.name, "{}", e);
                (
                    TaskRetVal::MechanismFail,
                    format!("There was a problem running task '{}'", task.name),
                )
            }
        }
    }
}
