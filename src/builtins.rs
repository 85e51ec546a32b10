//! Built-in plugins.
//!
//! `builtin-jobs` lists jobs and shows their run history. `builtin-admin`
//! holds the admin commands; its pipelines start even while the robot is
//! paused or stopping.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::tasks::{
    InputMatcher, Plugin, Task, TaskHandler, TaskKind, TaskRegistry, TaskRetVal, handler_fn,
};
use crate::worker::Robot;

pub const BUILTIN_ADMIN: &str = "builtin-admin";
pub const BUILTIN_JOBS: &str = "builtin-jobs";

fn matcher(pattern: &str, command: &str) -> Result<InputMatcher, ConfigError> {
    InputMatcher::command(pattern, command, Vec::new()).map_err(|e| ConfigError::InvalidRegex {
        task: command.to_string(),
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Add the builtin plugins to `registry`.
pub fn register(registry: &mut TaskRegistry) -> Result<(), ConfigError> {
    let jobs = Plugin {
        commands: vec![
            matcher(r"(?:list )?jobs", "jobs")?,
            matcher(r"history +([A-Za-z][\w-]*)(?: +(\d+))?", "history")?,
        ],
        ..Default::default()
    };
    let mut task = Task::new(BUILTIN_JOBS, TaskKind::Plugin(jobs));
    task.description = "List jobs and show their run history".to_string();
    registry.register(task)?;

    let admin = Plugin {
        commands: vec![
            matcher("abort", "abort")?,
            matcher("pause", "pause")?,
            matcher("resume", "resume")?,
            matcher("info", "info")?,
        ],
        admin_commands: ["abort", "pause", "resume"]
            .into_iter()
            .map(String::from)
            .collect(),
        ..Default::default()
    };
    let mut task = Task::new(BUILTIN_ADMIN, TaskKind::Plugin(admin));
    task.description = "Robot administration".to_string();
    registry.register(task)
}

/// In-process handlers for the builtin plugins, by task name.
pub fn handlers() -> HashMap<String, Arc<dyn TaskHandler>> {
    let mut handlers: HashMap<String, Arc<dyn TaskHandler>> = HashMap::new();
    handlers.insert(
        BUILTIN_JOBS.to_string(),
        handler_fn(|robot, command, args| async move {
            match command.as_str() {
                "jobs" => list_jobs(&robot).await,
                "history" => history(&robot, &args).await,
                _ => TaskRetVal::Fail,
            }
        }),
    );
    handlers.insert(
        BUILTIN_ADMIN.to_string(),
        handler_fn(|robot, command, _args| async move { admin(&robot, &command).await }),
    );
    handlers
}

// ── Jobs ─────────────────────────────────────────────────────────────

async fn list_jobs(robot: &Robot) -> TaskRetVal {
    let engine = Arc::clone(robot.worker().engine());
    let (user, channel) = (robot.user().await, robot.channel().await);
    let registry = engine.registry().await;
    let jobs: Vec<String> = registry
        .all()
        .iter()
        .filter(|t| t.is_job() && !t.disabled)
        .filter(|t| t.channel.as_deref().is_none_or(|c| c == channel) && t.available(&user, &channel))
        .map(|t| {
            if t.description.is_empty() {
                t.name.clone()
            } else {
                format!("{} - {}", t.name, t.description)
            }
        })
        .collect();
    if jobs.is_empty() {
        robot
            .say("I don't see any jobs configured for this channel")
            .await;
    } else {
        robot.fixed().say(jobs.join("\n")).await;
    }
    TaskRetVal::Normal
}

async fn history(robot: &Robot, args: &[String]) -> TaskRetVal {
    let engine = Arc::clone(robot.worker().engine());
    let Some(name) = args.first().filter(|n| !n.is_empty()) else {
        return TaskRetVal::Fail;
    };
    match engine.registry().await.get(name) {
        None => {
            robot
                .say(format!("Sorry, I don't have a task named '{name}' configured"))
                .await;
            return TaskRetVal::Normal;
        }
        Some(t) if !t.is_job() => {
            robot.say(format!("Sorry, '{name}' isn't a job")).await;
            return TaskRetVal::Normal;
        }
        Some(_) => {}
    }

    let index = args.get(1).filter(|s| !s.is_empty());
    if let Some(index) = index {
        let Ok(index) = index.parse::<u64>() else {
            robot
                .say(format!("History {index} for '{name}' not available"))
                .await;
            return TaskRetVal::Normal;
        };
        match engine.deps.history.get_log(name, index).await {
            Ok(log) if !log.is_empty() => {
                robot.fixed().say(log).await;
            }
            Ok(_) | Err(_) => {
                robot
                    .say(format!("History {index} for '{name}' not available"))
                    .await;
            }
        }
        return TaskRetVal::Normal;
    }

    match engine.recorder.get(name).await {
        Ok(Some(h)) if !h.histories.is_empty() => {
            let mut lines = vec![format!("History of job runs for '{name}':")];
            lines.extend(
                h.histories
                    .iter()
                    .map(|e| format!("Run {} - {}", e.log_index, e.create_time)),
            );
            robot.fixed().say(lines.join("\n")).await;
            TaskRetVal::Normal
        }
        Ok(_) => {
            robot.say(format!("No history found for '{name}'")).await;
            TaskRetVal::Normal
        }
        Err(e) => {
            tracing::error!(job = %name, "Reading job history failed: {}", e);
            robot
                .reply("There was a problem reading the history, check with an administrator")
                .await;
            TaskRetVal::MechanismFail
        }
    }
}

// ── Admin ────────────────────────────────────────────────────────────

async fn admin(robot: &Robot, command: &str) -> TaskRetVal {
    let engine = Arc::clone(robot.worker().engine());
    let lifecycle = &engine.lifecycle;
    match command {
        "abort" => {
            let user = robot.user().await;
            tracing::warn!(%user, "Abort requested");
            robot.say("Ok, I'll shut down immediately").await;
            lifecycle.abort();
        }
        "pause" => {
            lifecycle.pause();
            robot
                .say("Ok, I've been paused; I won't start new tasks until 'resume'")
                .await;
        }
        "resume" => {
            lifecycle.resume();
            robot.say("Ok, I'm accepting new tasks again").await;
        }
        "info" => {
            let cfg = &engine.config;
            let state = if lifecycle.is_paused() { "paused" } else { "running" };
            robot
                .fixed()
                .say(format!(
                    "I'm {}, alias '{}', {state} with {} pipeline(s) active (including this one)",
                    cfg.name,
                    cfg.alias,
                    lifecycle.running()
                ))
                .await;
        }
        _ => return TaskRetVal::Fail,
    }
    TaskRetVal::Normal
}
