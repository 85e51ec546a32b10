//! Environment handed to each task run.

use std::collections::HashMap;

use crate::config::Parameter;
use crate::tasks::{Task, TaskRegistry};
use crate::worker::state::PipeState;

/// Host variables passed through to external tasks.
pub const PASSTHROUGH: &[&str] = &["HOME", "HOSTNAME", "LANG", "PATH", "USER"];

fn set_default(env: &mut HashMap<String, String>, key: &str, value: &str) {
    if !env.contains_key(key) {
        env.insert(key.to_string(), value.to_string());
    }
}

fn add_parameters(env: &mut HashMap<String, String>, params: &[Parameter]) {
    for p in params {
        set_default(env, &p.name, &p.value);
    }
}

/// Build the environment for running `task` in the pipeline described by
/// `state`. Earlier sources win:
///
/// 1. the robot's `GOPHER_*` values for this run
/// 2. the pipeline environment (jobs, `set_parameter`), withheld from
///    unprivileged plugins
/// 3. the task's own parameters
/// 4. its namespace's parameters, or the pipeline's namespace for
///    privileged tasks without one
/// 5. host pass-through variables
pub fn build(state: &PipeState, task: &Task, registry: &TaskRegistry) -> HashMap<String, String> {
    let mut env = HashMap::new();

    env.insert("GOPHER_CHANNEL".to_string(), state.channel.clone());
    env.insert("GOPHER_CHANNEL_ID".to_string(), state.channel_id.clone());
    env.insert("GOPHER_USER".to_string(), state.user.clone());
    env.insert("GOPHER_USER_ID".to_string(), state.user_id.clone());
    env.insert("GOPHER_PROTOCOL".to_string(), state.protocol.to_lowercase());
    env.insert("GOPHER_TASK_NAME".to_string(), task.name.clone());
    if let Some(ptype) = state.pipeline_type {
        env.insert("GOPHER_PIPELINE_TYPE".to_string(), ptype.to_string());
    }
    if let Some(job) = &state.job_name {
        env.insert("GOPHER_JOB_NAME".to_string(), job.clone());
    }
    if let Some(index) = state.run_index {
        env.insert("GOPHER_RUN_INDEX".to_string(), index.to_string());
    }
    env.insert("GOPHER_CALLER_ID".to_string(), state.eid.clone());
    env.insert("GOPHER_THREAD_ID".to_string(), state.thread_id.clone());
    if state.threaded_message {
        env.insert("GOPHER_THREADED_MESSAGE".to_string(), "true".to_string());
    }

    if !task.is_plugin() || task.privileged {
        for (k, v) in &state.environment {
            set_default(&mut env, k, v);
        }
    }

    add_parameters(&mut env, &task.parameters);

    match &task.namespace {
        Some(ns) => add_parameters(&mut env, registry.namespace_parameters(ns)),
        None if task.privileged => {
            if let Some(ns) = &state.namespace {
                add_parameters(&mut env, registry.namespace_parameters(ns));
            }
        }
        None => {}
    }

    for key in PASSTHROUGH {
        if !env.contains_key(*key)
            && let Ok(value) = std::env::var(key)
        {
            env.insert(key.to_string(), value);
        }
    }
    env
}
