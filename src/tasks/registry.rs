//! Task registry: plugins, jobs and plain tasks by name, in registration order.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{
    JobConfig, MatcherConfig, Parameter, PluginConfig, ScheduleConfig, TaskConfig, TaskFile,
    TaskKindConfig,
};
use crate::error::ConfigError;
use crate::tasks::model::{InputMatcher, Job, JobTrigger, Plugin, ReplyMatcher, Task, TaskKind};

/// An immutable set of tasks. The engine swaps whole registries, so readers
/// hold an `Arc` snapshot for the length of a dispatch.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<Arc<Task>>,
    by_name: HashMap<String, usize>,
    namespaces: HashMap<String, Vec<Parameter>>,
    schedules: Vec<ScheduleConfig>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a parsed task file.
    ///
    /// A task with a bad regex is kept but disabled, with the compile error
    /// as its reason. Duplicate names and unknown namespaces are hard errors.
    pub fn from_config(file: &TaskFile) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for (name, ns) in &file.namespaces {
            registry
                .namespaces
                .insert(name.clone(), ns.parameters.clone());
        }
        for cfg in &file.tasks {
            if let Some(ns) = &cfg.namespace
                && !registry.namespaces.contains_key(ns)
            {
                return Err(ConfigError::InvalidValue {
                    key: format!("tasks.{}.namespace", cfg.name),
                    message: format!("unknown namespace '{ns}'"),
                });
            }
            registry.register(compile_task(cfg))?;
        }
        registry.schedules = file.schedules.clone();
        Ok(registry)
    }

    /// Register a task. Names are unique.
    pub fn register(&mut self, task: Task) -> Result<(), ConfigError> {
        if self.by_name.contains_key(&task.name) {
            return Err(ConfigError::DuplicateTask(task.name));
        }
        tracing::debug!(task = %task.name, kind = task.kind_name(), "Registered task");
        self.by_name.insert(task.name.clone(), self.tasks.len());
        self.tasks.push(Arc::new(task));
        Ok(())
    }

    /// Get a task by name.
    pub fn get(&self, name: &str) -> Option<Arc<Task>> {
        self.by_name.get(name).map(|&i| Arc::clone(&self.tasks[i]))
    }

    /// All tasks in registration order.
    pub fn all(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    /// Tasks visible to `user` in `channel`, in registration order.
    pub fn available<'a>(
        &'a self,
        user: &'a str,
        channel: &'a str,
    ) -> impl Iterator<Item = &'a Arc<Task>> + 'a {
        self.tasks.iter().filter(move |t| t.available(user, channel))
    }

    /// Parameters configured for a namespace.
    pub fn namespace_parameters(&self, namespace: &str) -> &[Parameter] {
        self.namespaces
            .get(namespace)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn schedules(&self) -> &[ScheduleConfig] {
        &self.schedules
    }

    /// Get the number of registered tasks.
    pub fn count(&self) -> usize {
        self.tasks.len()
    }
}

fn compile_task(cfg: &TaskConfig) -> Task {
    let mut errors = Vec::new();

    let kind = match &cfg.kind {
        TaskKindConfig::Plugin(p) => TaskKind::Plugin(compile_plugin(&cfg.name, p, &mut errors)),
        TaskKindConfig::Job(j) => TaskKind::Job(compile_job(&cfg.name, j, &mut errors)),
        TaskKindConfig::Task => TaskKind::Plain,
    };

    let mut channels = cfg.channels.clone();
    if let Some(ch) = &cfg.channel
        && !channels.contains(ch)
    {
        channels.push(ch.clone());
    }
    let all_channels = cfg.all_channels || channels.is_empty();

    let mut task = Task::new(cfg.name.clone(), kind);
    task.description = cfg.description.clone();
    task.channel = cfg.channel.clone();
    task.channels = channels;
    task.all_channels = all_channels;
    task.users = cfg.users.clone();
    task.elevator = cfg.elevator.clone();
    task.authorizer = cfg.authorizer.clone();
    task.auth_require = cfg.auth_require.clone();
    task.parameters = cfg.parameters.clone();
    task.disabled = cfg.disabled;
    task.privileged = cfg.privileged;
    task.namespace = cfg.namespace.clone();
    task.path = cfg.path.clone();
    task.require_admin = cfg.require_admin;
    task.disallow_direct = cfg.disallow_direct;
    task.direct_only = cfg.direct_only;

    if !errors.is_empty() {
        let reason = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        tracing::warn!(task = %cfg.name, %reason, "Disabling task with invalid configuration");
        task.disabled = true;
        task.disabled_reason = Some(reason);
    } else if cfg.disabled {
        task.disabled_reason = Some("disabled in configuration".to_string());
    }
    task
}

fn compile_matchers(
    task: &str,
    configs: &[MatcherConfig],
    compile: fn(&str, String, Vec<String>) -> Result<InputMatcher, regex::Error>,
    errors: &mut Vec<ConfigError>,
) -> Vec<InputMatcher> {
    configs
        .iter()
        .filter_map(|m| {
            compile(&m.regex, m.command.clone(), m.contexts.clone())
                .map_err(|e| errors.push(invalid_regex(task, &m.regex, e)))
                .ok()
        })
        .collect()
}

fn compile_plugin(task: &str, cfg: &PluginConfig, errors: &mut Vec<ConfigError>) -> Plugin {
    Plugin {
        commands: compile_matchers(
            task,
            &cfg.commands,
            |p, c, ctx| InputMatcher::command(p, c, ctx),
            errors,
        ),
        message_matchers: compile_matchers(
            task,
            &cfg.message_matchers,
            |p, c, ctx| InputMatcher::message(p, c, ctx),
            errors,
        ),
        reply_matchers: cfg
            .reply_matchers
            .iter()
            .filter_map(|r| {
                ReplyMatcher::new(r.label.clone(), &r.regex)
                    .map_err(|e| errors.push(invalid_regex(task, &r.regex, e)))
                    .ok()
            })
            .collect(),
        catch_all: cfg.catch_all,
        admin_commands: cfg.admin_commands.iter().cloned().collect(),
        authorized_commands: cfg.authorized_commands.iter().cloned().collect(),
        authorize_all_commands: cfg.authorize_all_commands,
        elevated_commands: cfg.elevated_commands.iter().cloned().collect(),
        elevate_immediate_commands: cfg.elevate_immediate_commands.iter().cloned().collect(),
    }
}

fn compile_job(task: &str, cfg: &JobConfig, errors: &mut Vec<ConfigError>) -> Job {
    Job {
        triggers: cfg
            .triggers
            .iter()
            .filter_map(|t| {
                regex::Regex::new(&format!("(?i:{})", t.regex))
                    .map(|regex| JobTrigger {
                        user: t.user.clone(),
                        channel: t.channel.clone(),
                        regex,
                    })
                    .map_err(|e| errors.push(invalid_regex(task, &t.regex, e)))
                    .ok()
            })
            .collect(),
        arguments: cfg
            .arguments
            .iter()
            .filter_map(|a| {
                ReplyMatcher::new(a.label.clone(), &a.regex)
                    .map_err(|e| errors.push(invalid_regex(task, &a.regex, e)))
                    .ok()
            })
            .collect(),
        history_logs: cfg.history_logs,
        quiet: cfg.quiet,
    }
}

fn invalid_regex(task: &str, pattern: &str, e: regex::Error) -> ConfigError {
    ConfigError::InvalidRegex {
        task: task.to_string(),
        pattern: pattern.to_string(),
        reason: e.to_string(),
    }
}
