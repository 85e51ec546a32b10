//! The `run job <name> [args]` command.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::task::JoinHandle;

use crate::pipeline::executor::start_pipeline;
use crate::pipeline::security;
use crate::pipeline::types::PipelineType;
use crate::tasks::{RetVal, Task, TaskRetVal};
use crate::worker::memory::context_key;
use crate::worker::{Robot, Worker};

static RUN_JOB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i:^\s*run +job +([A-Za-z][\w-]*)(?: (.*))?\s*$)").expect("run job regex")
});

/// Start `run job` handling if `msg` asks for it.
pub(crate) fn match_run_job(worker: &Arc<Worker>, msg: &str) -> Option<JoinHandle<TaskRetVal>> {
    let caps = RUN_JOB.captures(msg)?;
    let name = caps.get(1)?.as_str().to_string();
    let args: Vec<String> = caps
        .get(2)
        .map(|m| m.as_str().split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    tracing::debug!(job = %name, ?args, "Run job requested");
    Some(tokio::spawn(run_job(Arc::clone(worker), name, args)))
}

/// Look the job up, check it's visible and allowed, collect its arguments,
/// then run it as a job-command pipeline.
async fn run_job(worker: Arc<Worker>, name: String, mut args: Vec<String>) -> TaskRetVal {
    let engine = Arc::clone(worker.engine());
    let say = Robot::new(Arc::clone(&worker), None);

    let Some(task) = engine.registry().await.get(&name) else {
        say.say(format!("Sorry, I don't have a task named '{name}' configured"))
            .await;
        return TaskRetVal::Fail;
    };
    let Some(job) = task.as_job() else {
        say.say(format!("Sorry, '{name}' isn't a job")).await;
        return TaskRetVal::Fail;
    };

    let (user, channel) = {
        let s = worker.state.lock().await;
        (s.user.clone(), s.channel.clone())
    };
    if let Some(jchan) = &task.channel
        && *jchan != channel
    {
        say.say(format!("Job not available in this channel; try: {jchan}"))
            .await;
        return TaskRetVal::Fail;
    }
    if !task.available(&user, &channel) && !task.disabled {
        say.say("Sorry, that job isn't available").await;
        return TaskRetVal::Fail;
    }
    if task.disabled {
        let reason = task.disabled_reason.as_deref().unwrap_or("disabled in configuration");
        say.say(format!("Job '{name}' is disabled: {reason}")).await;
        return TaskRetVal::Fail;
    }

    {
        let mut s = worker.state.lock().await;
        s.pipe_name = task.name.clone();
        s.pipe_desc = task.description.clone();
    }
    let robot = Robot::new(Arc::clone(&worker), Some(Arc::clone(&task)));
    if security::check(&robot, &task, "run", &args).await != TaskRetVal::Success {
        return TaskRetVal::Fail;
    }

    engine
        .memories
        .remember(&context_key("task"), &user, &channel, name.clone())
        .await;

    if !args.is_empty() {
        if args.len() < job.arguments.len() {
            say.say(format!(
                "Too few arguments to job '{name}', {} required but {} given",
                job.arguments.len(),
                args.len()
            ))
            .await;
            return TaskRetVal::Fail;
        }
        for (arg, spec) in args.iter().zip(&job.arguments) {
            if !spec.regex.is_match(arg) {
                say.say(format!(
                    "'{arg}' doesn't match the pattern for argument '{}'",
                    spec.label
                ))
                .await;
                return TaskRetVal::Fail;
            }
        }
    } else if !job.arguments.is_empty() {
        match prompt_arguments(&robot, &task).await {
            Some(prompted) => args = prompted,
            None => return TaskRetVal::Fail,
        }
    }

    {
        let mut s = worker.state.lock().await;
        s.pipe_name.clear();
        s.pipe_desc.clear();
        s.verbose = true;
        // Checks for the job itself were just done.
        s.bypass_security_checks = true;
    }
    start_pipeline(worker, task, PipelineType::JobCommand, "run".to_string(), args).await
}

/// Ask for each of the job's arguments in turn. `None` when the user gave
/// up or never answered.
async fn prompt_arguments(robot: &Robot, task: &Arc<Task>) -> Option<Vec<String>> {
    let job = task.as_job()?;
    let mut args = Vec::with_capacity(job.arguments.len());
    for spec in &job.arguments {
        let (arg, ret) = robot
            .prompt_for_reply(&spec.label, &format!("What's the value for '{}'?", spec.label))
            .await;
        match ret {
            RetVal::Ok => args.push(arg),
            RetVal::ReplyNotMatched => {
                robot
                    .say(format!(
                        "That doesn't match the pattern for argument '{}'",
                        spec.label
                    ))
                    .await;
                robot.say("(giving up)").await;
                return None;
            }
            other => {
                tracing::warn!(job = %task.name, ret = ?other, "Failed getting job arguments");
                robot
                    .say(format!("(not running job '{}')", task.name))
                    .await;
                return None;
            }
        }
    }
    Some(args)
}
