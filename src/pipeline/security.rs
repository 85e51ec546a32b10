//! Security gate: admin check, authorization and elevation.
//!
//! Authorizers and elevators are ordinary plugins, called with the
//! `authorize` / `elevate` commands. They answer with a return code:
//! `Success` lets the command through, `Fail` refuses it, anything else is a
//! fault in the plugin.

use std::sync::Arc;

use crate::events::Event;
use crate::pipeline::executor;
use crate::tasks::{Task, TaskKind, TaskRetVal};
use crate::worker::Robot;

pub const TECHNICAL_AUTH_ERROR: &str =
    "Sorry, authorization failed due to a problem with the authorization plugin";
pub const CONFIG_AUTH_ERROR: &str = "Sorry, authorization failed due to a configuration error";
pub const TECHNICAL_ELEV_ERROR: &str =
    "Sorry, elevation failed due to a problem with the elevation service";
pub const CONFIG_ELEV_ERROR: &str = "Sorry, elevation failed due to a configuration error";
pub const NOT_AUTHORIZED: &str = "Sorry, you're not authorized for that command";
pub const ELEVATION_REQUIRED: &str = "Sorry, this command requires elevation";

/// Who asked for what, for the audit log.
struct AuditCtx {
    user: String,
    channel: String,
    task: String,
    command: String,
    auth_require: String,
}

impl AuditCtx {
    async fn new(robot: &Robot, task: &Task, command: &str) -> Self {
        Self {
            user: robot.user().await,
            channel: robot.channel().await,
            task: task.name.clone(),
            command: command.to_string(),
            auth_require: task.auth_require.clone(),
        }
    }

    fn record(&self, outcome: &str, detail: &str) {
        tracing::info!(
            target: "audit",
            user = %self.user,
            channel = %self.channel,
            task = %self.task,
            command = %self.command,
            auth_require = %self.auth_require,
            outcome,
            "{}",
            detail
        );
    }
}

/// Run all three checks for `task`/`command`. Returns `Success` to proceed
/// and `Fail` otherwise; the user has already been told why.
pub async fn check(robot: &Robot, task: &Arc<Task>, command: &str, args: &[String]) -> TaskRetVal {
    let admin_required = task.require_admin
        || task
            .as_plugin()
            .is_some_and(|p| p.admin_commands.contains(command));
    if admin_required && !robot.check_admin().await {
        AuditCtx::new(robot, task, command)
            .await
            .record("admin_refused", "admin-only command refused");
        robot
            .say(format!(
                "Sorry, '{}/{}' is only available to bot administrators",
                task.name, command
            ))
            .await;
        return TaskRetVal::Fail;
    }

    if check_authorization(robot, task, command, args).await != TaskRetVal::Success {
        return TaskRetVal::Fail;
    }

    let elevated = robot.worker().state.lock().await.elevated;
    if !elevated && check_elevation(robot, task, command).await != TaskRetVal::Success {
        return TaskRetVal::Fail;
    }
    TaskRetVal::Success
}

fn authorization_needed(task: &Task, command: &str) -> bool {
    match &task.kind {
        TaskKind::Plugin(p) => p.authorize_all_commands || p.authorized_commands.contains(command),
        _ => task.authorizer.is_some(),
    }
}

/// Call the task's authorizer if the command needs one.
pub async fn check_authorization(
    robot: &Robot,
    task: &Arc<Task>,
    command: &str,
    args: &[String],
) -> TaskRetVal {
    if !authorization_needed(task, command) {
        return TaskRetVal::Success;
    }
    let engine = robot.worker().engine();
    let audit = AuditCtx::new(robot, task, command).await;

    let Some(name) = task
        .authorizer
        .clone()
        .or_else(|| engine.config.default_authorizer.clone())
    else {
        audit.record("misconfigured", "authorization required but no authorizer configured");
        robot.say(CONFIG_AUTH_ERROR).await;
        engine.events.emit(Event::AuthNoRunMisconfigured);
        return TaskRetVal::ConfigurationError;
    };
    let authorizer = engine
        .registry()
        .await
        .get(&name)
        .filter(|t| t.is_plugin());
    let Some(authorizer) = authorizer else {
        audit.record("not_found", &format!("authorizer '{name}' not found"));
        robot.say(TECHNICAL_AUTH_ERROR).await;
        engine.events.emit(Event::AuthNoRunNotFound);
        return TaskRetVal::ConfigurationError;
    };

    let mut auth_args = vec![
        task.name.clone(),
        task.auth_require.clone(),
        command.to_string(),
    ];
    auth_args.extend_from_slice(args);
    let (ret, _) = executor::invoke(robot.worker(), &authorizer, "authorize", auth_args).await;

    match ret {
        TaskRetVal::Success => {
            audit.record("authorized", &format!("authorization succeeded by '{name}'"));
            engine.events.emit(Event::AuthRanSuccess);
            TaskRetVal::Success
        }
        TaskRetVal::Fail => {
            audit.record("denied", &format!("authorization FAILED by '{name}'"));
            robot.say(NOT_AUTHORIZED).await;
            engine.events.emit(Event::AuthRanFail);
            TaskRetVal::Fail
        }
        TaskRetVal::MechanismFail => {
            audit.record("mechanism_fail", &format!("authorizer '{name}' mechanism failure"));
            robot.say(TECHNICAL_AUTH_ERROR).await;
            engine.events.emit(Event::AuthRanMechanismFailed);
            TaskRetVal::MechanismFail
        }
        TaskRetVal::Normal => {
            audit.record(
                "mechanism_fail",
                &format!("authorizer '{name}' returned Normal instead of Success"),
            );
            robot.say(TECHNICAL_AUTH_ERROR).await;
            engine.events.emit(Event::AuthRanFailNormal);
            TaskRetVal::MechanismFail
        }
        other => {
            audit.record(
                "mechanism_fail",
                &format!("authorizer '{name}' returned {other}"),
            );
            robot.say(TECHNICAL_AUTH_ERROR).await;
            engine.events.emit(Event::AuthRanFailOther);
            TaskRetVal::MechanismFail
        }
    }
}

/// Whether `command` needs elevation, and whether it must be immediate.
fn elevation_needed(task: &Task, command: &str) -> Option<bool> {
    match &task.kind {
        TaskKind::Plugin(p) => {
            if p.elevate_immediate_commands.contains(command) {
                Some(true)
            } else if p.elevated_commands.contains(command) {
                Some(false)
            } else {
                None
            }
        }
        _ => task.elevator.is_some().then_some(false),
    }
}

/// Call the task's elevator if the command needs one.
pub async fn check_elevation(robot: &Robot, task: &Arc<Task>, command: &str) -> TaskRetVal {
    match elevation_needed(task, command) {
        Some(immediate) => elevate_for(robot, task, command, immediate).await,
        None => TaskRetVal::Success,
    }
}

/// Run the elevator for `task` unconditionally.
pub async fn elevate(robot: &Robot, task: &Arc<Task>, immediate: bool) -> TaskRetVal {
    elevate_for(robot, task, "", immediate).await
}

async fn elevate_for(robot: &Robot, task: &Arc<Task>, command: &str, immediate: bool) -> TaskRetVal {
    let engine = robot.worker().engine();
    let audit = AuditCtx::new(robot, task, command).await;

    let Some(name) = task
        .elevator
        .clone()
        .or_else(|| engine.config.default_elevator.clone())
    else {
        audit.record("misconfigured", "elevation required but no elevator configured");
        robot.say(CONFIG_ELEV_ERROR).await;
        engine.events.emit(Event::ElevNoRunMisconfigured);
        return TaskRetVal::ConfigurationError;
    };
    let elevator = engine
        .registry()
        .await
        .get(&name)
        .filter(|t| t.is_plugin());
    let Some(elevator) = elevator else {
        audit.record("not_found", &format!("elevator '{name}' not found"));
        robot.say(TECHNICAL_ELEV_ERROR).await;
        engine.events.emit(Event::ElevNoRunNotFound);
        return TaskRetVal::ConfigurationError;
    };

    let (ret, _) = executor::invoke(
        robot.worker(),
        &elevator,
        "elevate",
        vec![immediate.to_string()],
    )
    .await;

    match ret {
        TaskRetVal::Success => {
            robot.worker().state.lock().await.elevated = true;
            audit.record("elevated", &format!("elevation succeeded by '{name}'"));
            engine.events.emit(Event::ElevRanSuccess);
            TaskRetVal::Success
        }
        TaskRetVal::Fail => {
            audit.record("denied", &format!("elevation FAILED by '{name}'"));
            robot.say(ELEVATION_REQUIRED).await;
            engine.events.emit(Event::ElevRanFail);
            TaskRetVal::Fail
        }
        TaskRetVal::MechanismFail => {
            audit.record("mechanism_fail", &format!("elevator '{name}' mechanism failure"));
            robot.say(TECHNICAL_ELEV_ERROR).await;
            engine.events.emit(Event::ElevRanMechanismFailed);
            TaskRetVal::MechanismFail
        }
        TaskRetVal::Normal => {
            audit.record(
                "mechanism_fail",
                &format!("elevator '{name}' returned Normal instead of Success"),
            );
            robot.say(TECHNICAL_ELEV_ERROR).await;
            engine.events.emit(Event::ElevRanFailNormal);
            TaskRetVal::MechanismFail
        }
        other => {
            audit.record("mechanism_fail", &format!("elevator '{name}' returned {other}"));
            robot.say(TECHNICAL_ELEV_ERROR).await;
            engine.events.emit(Event::ElevRanFailOther);
            TaskRetVal::MechanismFail
        }
    }
}
