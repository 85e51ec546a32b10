//! Pipeline executor.
//!
//! A pipeline runs its primary task list, then its fail list if the primary
//! stage failed, then its final list. Tasks may grow the primary list while
//! it runs, claim an exclusive tag, or queue behind another pipeline holding
//! one. Jobs appearing after the first task run as sub-pipelines of their
//! own so each keeps its own history and environment.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::builtins::BUILTIN_ADMIN;
use crate::engine::Refusal;
use crate::pipeline::env;
use crate::pipeline::exclusive::Claim;
use crate::pipeline::security;
use crate::pipeline::types::{PipeStage, PipelineType, TaskSpec};
use crate::tasks::{Task, TaskRetVal};
use crate::worker::{Robot, Worker};

pub const SHUTTING_DOWN: &str = "Sorry, I'm shutting down and can't start any new tasks";
pub const PAUSED: &str = "Sorry, I've been paused and can't start any new tasks";
const ABORTED_ERROR: &str = "Pipeline aborted, exclusive lock failed";

/// Start a new pipeline on `worker` with `task` as its first task.
pub fn start_pipeline(
    worker: Arc<Worker>,
    task: Arc<Task>,
    ptype: PipelineType,
    command: String,
    args: Vec<String>,
) -> BoxFuture<'static, TaskRetVal> {
    async move {
        let engine = Arc::clone(worker.engine());
        let _guard = match engine.lifecycle.enter(task.name == BUILTIN_ADMIN) {
            Ok(guard) => guard,
            Err(refusal) => {
                tracing::warn!(task = %task.name, ?refusal, "Not starting new pipeline");
                if ptype.is_user_command() {
                    let msg = match refusal {
                        Refusal::ShuttingDown => SHUTTING_DOWN,
                        Refusal::Paused => PAUSED,
                    };
                    Robot::new(Arc::clone(&worker), None).say(msg).await;
                }
                return TaskRetVal::RobotStopping;
            }
        };

        let job = task.as_job();
        let init_channel = {
            let mut s = worker.state.lock().await;
            s.parent_pipe_name = std::mem::take(&mut s.pipe_name);
            s.parent_pipe_desc = std::mem::take(&mut s.pipe_desc);
            s.pipe_name = task.name.clone();
            s.pipe_desc = task.description.clone();
            s.privileged = task.privileged;
            if s.pipeline_type.is_none() {
                s.pipeline_type = Some(ptype);
            }
            s.stage = PipeStage::Primary;
            s.environment
                .insert("GOPHER_PIPE_NAME".to_string(), task.name.clone());
            let init_channel = s.channel.clone();
            if job.is_some() {
                for p in &task.parameters {
                    if !s.environment.contains_key(&p.name) {
                        s.environment.insert(p.name.clone(), p.value.clone());
                    }
                }
                s.job_name = Some(task.name.clone());
                s.namespace = task.namespace.clone();
                s.environment
                    .insert("GOPHER_JOB_NAME".to_string(), task.name.clone());
                s.environment
                    .insert("GOPHER_START_CHANNEL".to_string(), init_channel.clone());
                if let Some(channel) = &task.channel {
                    s.channel = channel.clone();
                    s.channel_id.clear();
                    s.thread_id.clear();
                    s.threaded_message = false;
                }
                s.job_channel = s.channel.clone();
            }
            init_channel
        };

        if task.privileged {
            engine.deps.privilege.raise(&task.name);
        }

        if let Some(job) = job {
            let run_index = match engine.recorder.start_run(&task.name, job.history_logs).await {
                Ok(index) => Some(index),
                Err(e) => {
                    tracing::error!(job = %task.name, "Failed recording job run: {}", e);
                    None
                }
            };
            let logger = match run_index {
                Some(index) if job.history_logs > 0 => {
                    match engine
                        .deps
                        .history
                        .new_log(&task.name, index, job.history_logs)
                        .await
                    {
                        Ok(logger) => Some(logger),
                        Err(e) => {
                            tracing::error!(job = %task.name, "Failed opening run log: {}", e);
                            None
                        }
                    }
                }
                _ => None,
            };

            let mut s = worker.state.lock().await;
            s.run_index = run_index;
            s.logger = logger;
            if !job.quiet || s.verbose || ptype == PipelineType::JobCommand {
                let mut info = task.name.clone();
                if !args.is_empty() {
                    info.push(' ');
                    info.push_str(&args.join(" "));
                }
                let run = run_index.unwrap_or_default();
                let from = if init_channel.is_empty() {
                    "(direct message)".to_string()
                } else {
                    init_channel
                };
                let msg = match ptype {
                    PipelineType::JobTrigger => format!(
                        "Starting job '{info}', run {run} - triggered by app '{}' in channel '{from}'",
                        s.user
                    ),
                    PipelineType::JobCommand => format!(
                        "Starting job '{info}', run {run} - requested by user '{}' in channel '{from}'",
                        s.user
                    ),
                    PipelineType::SpawnedTask => format!(
                        "Starting job '{info}', run {run} - spawned by pipeline '{}': {}",
                        s.parent_pipe_name, s.parent_pipe_desc
                    ),
                    PipelineType::Scheduled => format!("Starting scheduled job '{info}', run {run}"),
                    _ => format!("Starting job '{info}', run {run}"),
                };
                s.verbose = true;
                drop(s);
                Robot::new(Arc::clone(&worker), Some(Arc::clone(&task)))
                    .say(msg)
                    .await;
            }
        }

        worker.state.lock().await.next_tasks =
            vec![TaskSpec::new(Arc::clone(&task), command, args)];

        let (ret, err_string) = run_pipeline(Arc::clone(&worker), PipeStage::Primary, ptype, true).await;
        finish_pipeline(&worker, &task, ptype, ret, err_string).await;
        ret
    }
    .boxed()
}

/// Everything after the primary stage: summary environment, fail and final
/// stages, user notification and releasing the exclusive tag.
async fn finish_pipeline(
    worker: &Arc<Worker>,
    task: &Arc<Task>,
    ptype: PipelineType,
    ret: TaskRetVal,
    err_string: String,
) {
    let engine = worker.engine();
    let job = task.as_job();

    let (last, fail_count, final_count, logger) = {
        let mut s = worker.state.lock().await;
        let last = s.current_task.clone();
        if let Some(last) = &last {
            s.environment
                .insert("GOPHER_FINAL_TASK".to_string(), last.name().to_string());
            s.environment
                .insert("GOPHER_FINAL_TYPE".to_string(), last.task.kind_name().to_string());
            if last.task.is_plugin() {
                s.environment
                    .insert("GOPHER_FINAL_COMMAND".to_string(), last.command.clone());
            }
            s.environment
                .insert("GOPHER_FINAL_ARGS".to_string(), last.args.join(" "));
            s.environment
                .insert("GOPHER_FINAL_DESC".to_string(), last.task.description.clone());
        }
        if ret != TaskRetVal::Normal {
            s.environment
                .insert("GOPHER_FAIL_CODE".to_string(), ret.code().to_string());
            s.environment
                .insert("GOPHER_FAIL_STRING".to_string(), ret.to_string());
        }
        (last, s.fail_tasks.len(), s.final_tasks.len(), s.logger.clone())
    };

    let (final_name, final_type, final_desc) = last
        .as_ref()
        .map(|l| {
            (
                l.name().to_string(),
                l.task.kind_name(),
                l.task.description.clone(),
            )
        })
        .unwrap_or_else(|| (task.name.clone(), task.kind_name(), task.description.clone()));

    if let Some(logger) = &logger {
        if ret != TaskRetVal::Normal {
            let why = format!(
                "pipeline failed in task {final_name} with exit code {} ({ret})",
                ret.code()
            );
            if job.is_some_and(|j| !j.quiet) && fail_count == 0 {
                logger.log(&why).await;
            }
            logger.section("failed", &why).await;
        } else {
            logger.section("done", "primary pipeline has completed").await;
        }
    }

    if ret != TaskRetVal::Normal && fail_count > 0 {
        run_pipeline(Arc::clone(worker), PipeStage::Fail, ptype, false).await;
    }
    if final_count > 0 {
        run_pipeline(Arc::clone(worker), PipeStage::Final, ptype, false).await;
    }
    if let Some(logger) = &logger {
        logger.close().await;
    }

    let (automatic, verbose, run_index, exclusive, tag) = {
        let s = worker.state.lock().await;
        (
            s.automatic_task,
            s.verbose,
            s.run_index.unwrap_or_default(),
            s.exclusive,
            s.exclusive_tag.clone(),
        )
    };

    let robot = Robot::new(Arc::clone(worker), Some(Arc::clone(task)));
    if ret != TaskRetVal::Normal && !automatic && !err_string.is_empty() {
        robot.reply(&err_string).await;
    }

    if let Some(job) = job
        && (!job.quiet || verbose)
    {
        let msg = match ret {
            TaskRetVal::Normal => format!(
                "Finished job '{}', run {run_index}, final task '{final_name}', status: normal",
                task.name
            ),
            TaskRetVal::PipelineAborted => format!(
                "Job '{}', run number {run_index} aborted, job '{tag}' already in progress",
                task.name
            ),
            _ => {
                let td = if final_desc.is_empty() {
                    String::new()
                } else {
                    format!(" - {final_desc}")
                };
                format!(
                    "Job '{}', run number {run_index} failed in {final_type}: '{final_name}'{td}, exit code: {} ({ret})",
                    task.name,
                    ret.code()
                )
            }
        };
        robot.say(msg).await;
    }

    if exclusive {
        engine.run_queues.release(&tag).await;
    }
    tracing::debug!(worker = worker.id, pipeline = %task.name, ret = %ret, "Pipeline finished");
}

/// Run one stage's task list. Returns the stage's result and the message
/// for the user if a task failed with one.
pub fn run_pipeline(
    worker: Arc<Worker>,
    stage: PipeStage,
    ptype: PipelineType,
    initial_run: bool,
) -> BoxFuture<'static, (TaskRetVal, String)> {
    async move {
        let engine = Arc::clone(worker.engine());
        let mut p: Vec<TaskSpec> = {
            let mut s = worker.state.lock().await;
            s.stage = stage;
            match stage {
                PipeStage::Primary => std::mem::take(&mut s.next_tasks),
                PipeStage::Fail => s.fail_tasks.clone(),
                PipeStage::Final => s.final_tasks.clone(),
            }
        };

        let mut ret = TaskRetVal::Normal;
        let mut err_string = String::new();
        let mut event_emitted = false;
        let mut i = 0;
        while i < p.len() {
            let spec = p[i].clone();
            let task = Arc::clone(&spec.task);

            let gate = {
                let mut s = worker.state.lock().await;
                s.current_task = Some(spec.clone());
                let bypass = std::mem::take(&mut s.bypass_security_checks);
                stage == PipeStage::Primary
                    && (task.is_job() || task.is_plugin())
                    && !s.automatic_task
                    && !bypass
            };
            worker
                .section(
                    "task",
                    &format!("{} {} {} {}", task.kind_name(), spec.name(), spec.command, spec.args.join(" "))
                        .trim_end()
                        .to_string(),
                )
                .await;

            if gate {
                let robot = Robot::new(Arc::clone(&worker), Some(Arc::clone(&task)));
                if security::check(&robot, &task, &spec.command, &spec.args).await
                    != TaskRetVal::Success
                {
                    ret = TaskRetVal::Fail;
                    break;
                }
            }

            if initial_run && !event_emitted {
                event_emitted = true;
                if let Some(event) = ptype.ran_event(&spec.command) {
                    engine.events.emit(event);
                }
            }

            if task.is_job() && !(initial_run && i == 0) {
                let child = worker.clone_for_child().await;
                ret = start_pipeline(
                    child,
                    Arc::clone(&task),
                    ptype,
                    spec.command.clone(),
                    spec.args.clone(),
                )
                .await;
            } else {
                (ret, err_string) = invoke(&worker, &task, &spec.command, spec.args.clone()).await;
            }

            // Primary and fail stages stop at the first failure; every final
            // task runs.
            if ret != TaskRetVal::Normal && stage != PipeStage::Final {
                let mut s = worker.state.lock().await;
                s.failed_task = task.name.clone();
                s.failed_task_args = spec.args.clone();
                s.failed_task_description = task.description.clone();
                break;
            }

            // Exclusive claims made by the task that just ran.
            let mut s = worker.state.lock().await;
            if !s.exclusive {
                if s.abort_pipeline {
                    ret = TaskRetVal::PipelineAborted;
                    if !task.is_plugin() {
                        err_string = ABORTED_ERROR.to_string();
                    }
                    break;
                }
                if s.queue_task {
                    s.queue_task = false;
                    s.exclusive = true;
                    let tag = s.exclusive_tag.clone();
                    match engine.run_queues.claim_or_enqueue(&tag).await {
                        Claim::Acquired => {
                            tracing::debug!(worker = worker.id, %tag, "Exclusive lock acquired");
                        }
                        Claim::Queued(wake) => {
                            let pipe_name = s.pipe_name.clone();
                            drop(s);
                            let chatty = task.as_job().is_some_and(|j| !j.quiet)
                                || ptype == PipelineType::JobCommand;
                            let robot = Robot::new(Arc::clone(&worker), Some(Arc::clone(&task)));
                            if chatty {
                                robot
                                    .say(format!(
                                        "Queueing task '{}' in pipeline '{pipe_name}'",
                                        task.name
                                    ))
                                    .await;
                            }
                            if wake.await.is_err() {
                                tracing::error!(worker = worker.id, %tag, "Run queue dropped while waiting");
                                ret = TaskRetVal::MechanismFail;
                                break;
                            }
                            tracing::debug!(worker = worker.id, task = %task.name, "Woke from run queue, re-running task");
                            if chatty {
                                robot
                                    .say(format!(
                                        "Re-starting queued task '{}' in pipeline '{pipe_name}'",
                                        task.name
                                    ))
                                    .await;
                            }
                            worker.state.lock().await.next_tasks.clear();
                            continue;
                        }
                    }
                }
            }

            if stage == PipeStage::Primary {
                let added = std::mem::take(&mut s.next_tasks);
                if !added.is_empty() {
                    if i == p.len() - 1 {
                        p.extend(added);
                    } else {
                        s.next_tasks = added;
                        drop(s);
                        (ret, err_string) =
                            run_pipeline(Arc::clone(&worker), stage, ptype, false).await;
                        s = worker.state.lock().await;
                        s.next_tasks.clear();
                    }
                    if s.abort_pipeline && !s.exclusive {
                        ret = TaskRetVal::PipelineAborted;
                        if !task.is_plugin() {
                            err_string = ABORTED_ERROR.to_string();
                        }
                        break;
                    }
                    if ret != TaskRetVal::Normal {
                        break;
                    }
                }
            }
            drop(s);
            i += 1;
        }
        (ret, err_string)
    }
    .boxed()
}

/// Call a task's code with the pipeline's environment. Panics are caught
/// and reported as a mechanism failure.
pub async fn invoke(
    worker: &Arc<Worker>,
    task: &Arc<Task>,
    command: &str,
    args: Vec<String>,
) -> (TaskRetVal, String) {
    let engine = worker.engine();
    let registry = engine.registry().await;
    let (env, msg) = {
        let s = worker.state.lock().await;
        (env::build(&s, task, &registry), s.msg.clone())
    };
    drop(registry);

    let robot = Robot::new(Arc::clone(worker), Some(Arc::clone(task)));
    let command = command.to_string();
    let call = async {
        match engine.builtins.get(&task.name) {
            Some(handler) => (handler.handle(robot, command, args).await, String::new()),
            None => {
                engine
                    .deps
                    .invoker
                    .call_task(robot, Arc::clone(task), command, args, env)
                    .await
            }
        }
    };

    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(
                worker = worker.id,
                task = %task.name,
                message = %msg,
                "Task panicked: {}",
                reason
            );
            (TaskRetVal::MechanismFail, String::new())
        }
    }
}
