//! Integration tests for dispatch and pipelines.
//!
//! Each test builds a full `Engine` from a JSON task file, wires in-process
//! handlers for the tasks, and talks to it through a recording connector.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};
use tokio::time::timeout;

use taskbot::channels::{Connector, ConnectorManager, ConnectorMessage, MessageFormat, MessageStream};
use taskbot::config::{RobotConfig, TaskFile};
use taskbot::engine::{Engine, EngineDeps};
use taskbot::error::ChannelError;
use taskbot::events::Event;
use taskbot::pipeline::executor::{PAUSED, SHUTTING_DOWN};
use taskbot::pipeline::history::{Brain, JobHistory, MemBrain, MemHistory};
use taskbot::pipeline::security::{ELEVATION_REQUIRED, NOT_AUTHORIZED, TECHNICAL_ELEV_ERROR};
use taskbot::tasks::{DefaultInvoker, RetVal, TaskRegistry, TaskRetVal, handler_fn};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const PROTOCOL: &str = "test";

/// Connector that records everything the robot sends.
#[derive(Default)]
struct RecordingConnector {
    sent: Mutex<Vec<String>>,
}

impl RecordingConnector {
    fn texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    fn count(&self, needle: &str) -> usize {
        self.texts().iter().filter(|t| t.contains(needle)).count()
    }

    fn push(&self, text: &str) {
        self.sent.lock().unwrap().push(text.to_string());
    }
}

#[async_trait]
impl Connector for RecordingConnector {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn send_protocol_channel_thread_message(
        &self,
        _channel_id: &str,
        _thread_id: &str,
        msg: &str,
        _format: MessageFormat,
    ) -> Result<(), ChannelError> {
        self.push(msg);
        Ok(())
    }

    async fn send_protocol_user_channel_thread_message(
        &self,
        _user_id: &str,
        _user_name: &str,
        _channel_id: &str,
        _thread_id: &str,
        msg: &str,
        _format: MessageFormat,
    ) -> Result<(), ChannelError> {
        self.push(msg);
        Ok(())
    }

    async fn send_protocol_user_message(
        &self,
        _user_id: &str,
        msg: &str,
        _format: MessageFormat,
    ) -> Result<(), ChannelError> {
        self.push(msg);
        Ok(())
    }
}

struct Harness {
    engine: Arc<Engine>,
    conn: Arc<RecordingConnector>,
    brain: Arc<MemBrain>,
}

fn harness_with(tasks: &str, invoker: DefaultInvoker, config: RobotConfig) -> Harness {
    let file = TaskFile::from_json(tasks).unwrap();
    let registry = TaskRegistry::from_config(&file).unwrap();
    let conn = Arc::new(RecordingConnector::default());
    let mut connectors = ConnectorManager::new();
    connectors.add(Arc::clone(&conn) as Arc<dyn Connector>);
    let brain = Arc::new(MemBrain::new());
    let deps = EngineDeps {
        brain: Arc::clone(&brain) as Arc<dyn Brain>,
        history: Arc::new(MemHistory::new()),
        ..EngineDeps::in_memory(Arc::new(invoker))
    };
    let engine = Engine::new(config, registry, connectors, deps).unwrap();
    Harness { engine, conn, brain }
}

fn harness(tasks: &str, invoker: DefaultInvoker) -> Harness {
    let config = RobotConfig {
        admins: vec!["alice".to_string()],
        ..Default::default()
    };
    harness_with(tasks, invoker, config)
}

impl Harness {
    /// Dispatch a message and wait for every pipeline it started.
    async fn send(&self, user: &str, channel: &str, text: &str) -> Vec<TaskRetVal> {
        let handles = self
            .engine
            .handle_message(ConnectorMessage::new(PROTOCOL, user, channel, text))
            .await;
        let mut rets = Vec::new();
        for h in handles {
            rets.push(h.await.unwrap());
        }
        rets
    }

    /// Dispatch without waiting.
    async fn spawn(&self, user: &str, channel: &str, text: &str) -> Vec<tokio::task::JoinHandle<TaskRetVal>> {
        self.engine
            .handle_message(ConnectorMessage::new(PROTOCOL, user, channel, text))
            .await
    }

    async fn wait_for_text(&self, needle: &str) {
        while self.conn.count(needle) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

/// Handler that appends `name` plus its args to `log` and returns `ret`.
fn recording(log: &Log, name: &'static str, ret: TaskRetVal) -> Arc<dyn taskbot::tasks::TaskHandler> {
    let log = Arc::clone(log);
    handler_fn(move |_robot, _command, args| {
        let log = Arc::clone(&log);
        async move {
            let entry = if args.is_empty() {
                name.to_string()
            } else {
                format!("{name}:{}", args.join(","))
            };
            log.lock().unwrap().push(entry);
            ret
        }
    })
}

// ── Matching ─────────────────────────────────────────────────────────

const WEATHER: &str = r#"{
    "tasks": [{
        "name": "weather",
        "type": "plugin",
        "commands": [{"regex": "weather(?: in (.+))?", "command": "weather", "contexts": ["location"]}]
    }]
}"#;

#[tokio::test]
async fn context_is_remembered_and_expires() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let invoker = DefaultInvoker::new().with_handler("weather", recording(&log, "weather", TaskRetVal::Normal));
        let config = RobotConfig {
            keep_listening: Duration::from_millis(200),
            ..Default::default()
        };
        let h = harness_with(WEATHER, invoker, config);

        assert_eq!(h.send("alice", "general", ";weather in Paris").await, vec![TaskRetVal::Normal]);
        assert_eq!(h.send("alice", "general", "floyd, weather").await, vec![TaskRetVal::Normal]);
        assert_eq!(*log.lock().unwrap(), vec!["weather:Paris", "weather:Paris"]);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.send("alice", "general", ";weather").await.is_empty());
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(h.conn.count("Sorry, I don't remember which location"), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn multiple_matches_run_nothing() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let tasks = r#"{
            "tasks": [
                {"name": "hello1", "type": "plugin", "commands": [{"regex": "hello", "command": "hello"}]},
                {"name": "hello2", "type": "plugin", "commands": [{"regex": "hel+o", "command": "hello"}]}
            ]
        }"#;
        let invoker = DefaultInvoker::new()
            .with_handler("hello1", recording(&log, "hello1", TaskRetVal::Normal))
            .with_handler("hello2", recording(&log, "hello2", TaskRetVal::Normal));
        let h = harness(tasks, invoker);
        let mut events = h.engine.subscribe_events();

        assert!(h.send("alice", "general", ";hello").await.is_empty());
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(h.conn.count("Yikes! Your command matched multiple plugins"), 1);
        assert!(drain_events(&mut events).contains(&Event::MultipleMatchesNoAction));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn blank_command_recalls_last_message() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let invoker = DefaultInvoker::new().with_handler("weather", recording(&log, "weather", TaskRetVal::Normal));
        let h = harness(WEATHER, invoker);

        assert!(h.send("alice", "general", ";").await.is_empty());
        assert_eq!(h.conn.count("Yes?"), 1);

        // Not a command, so nothing matches and it is remembered.
        assert!(h.send("alice", "general", "weather in Oslo").await.is_empty());
        assert_eq!(h.send("alice", "general", ";").await, vec![TaskRetVal::Normal]);
        assert_eq!(*log.lock().unwrap(), vec!["weather:Oslo"]);
    })
    .await
    .expect("test timed out");
}

// ── Security ─────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_authorization_blocks_the_command() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let tasks = r#"{
            "tasks": [
                {"name": "gate", "type": "plugin"},
                {
                    "name": "deploy",
                    "type": "plugin",
                    "authorizer": "gate",
                    "authorize_all_commands": true,
                    "commands": [{"regex": "deploy", "command": "deploy"}]
                }
            ]
        }"#;
        let invoker = DefaultInvoker::new()
            .with_handler("gate", recording(&log, "gate", TaskRetVal::Fail))
            .with_handler("deploy", recording(&log, "deploy", TaskRetVal::Normal));
        let h = harness(tasks, invoker);
        let mut events = h.engine.subscribe_events();

        assert_eq!(h.send("bob", "general", ";deploy").await, vec![TaskRetVal::Fail]);
        assert_eq!(*log.lock().unwrap(), vec!["gate:deploy,,deploy"]);
        assert_eq!(h.conn.count(NOT_AUTHORIZED), 1);
        assert!(drain_events(&mut events).contains(&Event::AuthRanFail));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn admin_commands_need_an_admin() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(r#"{"tasks": []}"#, DefaultInvoker::new());

        assert_eq!(h.send("bob", "general", ";pause").await, vec![TaskRetVal::Fail]);
        assert!(!h.engine.lifecycle().is_paused());
        assert_eq!(h.conn.count("only available to bot administrators"), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn paused_robot_refuses_all_but_admin_commands() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let invoker = DefaultInvoker::new().with_handler("weather", recording(&log, "weather", TaskRetVal::Normal));
        let h = harness(WEATHER, invoker);

        assert_eq!(h.send("alice", "general", ";pause").await, vec![TaskRetVal::Normal]);
        assert_eq!(
            h.send("alice", "general", ";weather in Rome").await,
            vec![TaskRetVal::RobotStopping]
        );
        assert_eq!(h.conn.count(PAUSED), 1);

        assert_eq!(h.send("alice", "general", ";resume").await, vec![TaskRetVal::Normal]);
        assert_eq!(h.send("alice", "general", ";weather in Rome").await, vec![TaskRetVal::Normal]);
        assert_eq!(*log.lock().unwrap(), vec!["weather:Rome"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn abort_stops_the_robot() {
    timeout(TEST_TIMEOUT, async {
        let h = harness(r#"{"tasks": []}"#, DefaultInvoker::new());

        assert_eq!(h.send("alice", "general", ";abort").await, vec![TaskRetVal::Normal]);
        assert_eq!(h.conn.count("Ok, I'll shut down immediately"), 1);
        assert!(h.engine.lifecycle().is_shutting_down());
        h.engine.lifecycle().stop_requested().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shutting_down_refuses_new_pipelines() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let invoker = DefaultInvoker::new().with_handler("weather", recording(&log, "weather", TaskRetVal::Normal));
        let h = harness(WEATHER, invoker);

        h.engine.lifecycle().begin_shutdown();
        assert_eq!(
            h.send("alice", "general", ";weather in Rome").await,
            vec![TaskRetVal::RobotStopping]
        );
        assert_eq!(h.conn.count(SHUTTING_DOWN), 1);
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(h.send("alice", "general", ";info").await, vec![TaskRetVal::Normal]);
    })
    .await
    .expect("test timed out");
}

const ELEVATED: &str = r#"{
    "tasks": [
        {"name": "elev", "type": "plugin"},
        {
            "name": "secure",
            "type": "plugin",
            "elevator": "elev",
            "elevated_commands": ["ship"],
            "commands": [{"regex": "ship", "command": "ship"}]
        }
    ]
}"#;

#[tokio::test]
async fn elevation_outcomes() {
    timeout(TEST_TIMEOUT, async {
        let cases = [
            (TaskRetVal::Success, TaskRetVal::Normal, None, Event::ElevRanSuccess),
            (TaskRetVal::Fail, TaskRetVal::Fail, Some(ELEVATION_REQUIRED), Event::ElevRanFail),
            (
                TaskRetVal::MechanismFail,
                TaskRetVal::Fail,
                Some(TECHNICAL_ELEV_ERROR),
                Event::ElevRanMechanismFailed,
            ),
        ];
        for (elevator_ret, want, message, event) in cases {
            let log = new_log();
            let ship = {
                let log = Arc::clone(&log);
                handler_fn(move |robot, _command, _args| {
                    let log = Arc::clone(&log);
                    async move {
                        // Already elevated by the gate, so the elevator isn't called again.
                        let elevated = robot.elevate(false).await;
                        log.lock().unwrap().push(format!("ship:{elevated}"));
                        TaskRetVal::Normal
                    }
                })
            };
            let invoker = DefaultInvoker::new()
                .with_handler("elev", recording(&log, "elev", elevator_ret))
                .with_handler("secure", ship);
            let h = harness(ELEVATED, invoker);
            let mut events = h.engine.subscribe_events();

            assert_eq!(h.send("bob", "general", ";ship").await, vec![want]);
            if want == TaskRetVal::Normal {
                assert_eq!(*log.lock().unwrap(), vec!["elev:false", "ship:true"]);
            } else {
                assert_eq!(*log.lock().unwrap(), vec!["elev:false"]);
            }
            if let Some(message) = message {
                assert_eq!(h.conn.count(message), 1);
            }
            assert!(drain_events(&mut events).contains(&event));
        }
    })
    .await
    .expect("test timed out");
}

// ── Pipelines ────────────────────────────────────────────────────────

const STAGES: &str = r#"{
    "tasks": [
        {"name": "work", "type": "plugin", "commands": [{"regex": "work", "command": "work"}]},
        {"name": "chain", "type": "plugin", "commands": [{"regex": "chain", "command": "chain"}]},
        {"name": "a", "type": "task"},
        {"name": "b", "type": "task"},
        {"name": "x", "type": "task"},
        {"name": "step", "type": "task"},
        {"name": "late", "type": "task"}
    ]
}"#;

#[tokio::test]
async fn fail_then_final_in_reverse_order() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let work = handler_fn(|robot, _command, _args| async move {
            assert_eq!(robot.final_task("a", vec![]).await, RetVal::Ok);
            assert_eq!(robot.final_task("b", vec![]).await, RetVal::Ok);
            assert_eq!(robot.fail_task("x", vec![]).await, RetVal::Ok);
            TaskRetVal::Fail
        });
        let invoker = DefaultInvoker::new()
            .with_handler("work", work)
            .with_handler("a", recording(&log, "a", TaskRetVal::Normal))
            .with_handler("b", recording(&log, "b", TaskRetVal::Normal))
            .with_handler("x", recording(&log, "x", TaskRetVal::Normal));
        let h = harness(STAGES, invoker);

        assert_eq!(h.send("alice", "general", ";work").await, vec![TaskRetVal::Fail]);
        assert_eq!(*log.lock().unwrap(), vec!["x", "b", "a"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn added_tasks_run_before_final_and_late_edits_are_refused() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let chain = handler_fn(|robot, _command, _args| async move {
            assert_eq!(robot.add_task("step", vec!["1".to_string()]).await, RetVal::Ok);
            assert_eq!(robot.final_task("late", vec![]).await, RetVal::Ok);
            assert_eq!(robot.add_task("missing", vec![]).await, RetVal::TaskNotFound);
            assert_eq!(robot.add_job("step", vec![]).await, RetVal::InvalidTaskType);
            TaskRetVal::Normal
        });
        let late = {
            let log = Arc::clone(&log);
            handler_fn(move |robot, _command, _args| {
                let log = Arc::clone(&log);
                async move {
                    let ret = robot.add_task("step", vec!["2".to_string()]).await;
                    log.lock().unwrap().push(format!("late:{ret}"));
                    TaskRetVal::Normal
                }
            })
        };
        let invoker = DefaultInvoker::new()
            .with_handler("chain", chain)
            .with_handler("late", late)
            .with_handler("step", recording(&log, "step", TaskRetVal::Normal));
        let h = harness(STAGES, invoker);

        assert_eq!(h.send("alice", "general", ";chain").await, vec![TaskRetVal::Normal]);
        assert_eq!(*log.lock().unwrap(), vec!["step:1", "late:InvalidStage"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn prompt_receives_the_next_message() {
    timeout(TEST_TIMEOUT, async {
        let tasks = r#"{
            "tasks": [{
                "name": "ask",
                "type": "plugin",
                "commands": [{"regex": "ask", "command": "ask"}],
                "reply_matchers": [{"label": "color", "regex": "red|blue"}]
            }]
        }"#;
        let log = new_log();
        let ask = {
            let log = Arc::clone(&log);
            handler_fn(move |robot, _command, _args| {
                let log = Arc::clone(&log);
                async move {
                    let (reply, ret) = robot.prompt_for_reply("color", "Which color?").await;
                    log.lock().unwrap().push(format!("{reply}:{ret}"));
                    TaskRetVal::Normal
                }
            })
        };
        let h = harness(tasks, DefaultInvoker::new().with_handler("ask", ask));

        let handles = h.spawn("alice", "general", ";ask").await;
        h.wait_for_text("Which color?").await;
        assert!(h.send("alice", "general", "blue").await.is_empty());
        for handle in handles {
            assert_eq!(handle.await.unwrap(), TaskRetVal::Normal);
        }
        assert_eq!(*log.lock().unwrap(), vec!["blue:Ok"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn new_command_interrupts_a_prompt() {
    timeout(TEST_TIMEOUT, async {
        let tasks = r#"{
            "tasks": [
                {
                    "name": "ask",
                    "type": "plugin",
                    "commands": [{"regex": "ask", "command": "ask"}],
                    "reply_matchers": [{"label": "color", "regex": "red|blue"}]
                },
                {"name": "ping", "type": "plugin", "commands": [{"regex": "ping", "command": "ping"}]}
            ]
        }"#;
        let log = new_log();
        let ask = {
            let log = Arc::clone(&log);
            handler_fn(move |robot, _command, _args| {
                let log = Arc::clone(&log);
                async move {
                    let (reply, ret) = robot.prompt_for_reply("color", "Which color?").await;
                    log.lock().unwrap().push(format!("{reply}:{ret}"));
                    TaskRetVal::Normal
                }
            })
        };
        let invoker = DefaultInvoker::new()
            .with_handler("ask", ask)
            .with_handler("ping", recording(&log, "ping", TaskRetVal::Normal));
        let h = harness(tasks, invoker);

        let handles = h.spawn("alice", "general", ";ask").await;
        h.wait_for_text("Which color?").await;
        assert_eq!(h.send("alice", "general", ";ping").await, vec![TaskRetVal::Normal]);
        for handle in handles {
            assert_eq!(handle.await.unwrap(), TaskRetVal::Normal);
        }
        let log = log.lock().unwrap().clone();
        assert!(log.contains(&":Interrupted".to_string()));
        assert!(log.contains(&"ping".to_string()));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn refused_pipeline_edits_never_run() {
    timeout(TEST_TIMEOUT, async {
        let tasks = r#"{
            "tasks": [
                {"name": "edit", "type": "plugin", "commands": [{"regex": "edit", "command": "edit"}]},
                {"name": "weather", "type": "plugin", "commands": [{"regex": "weather(?: in (.+))?", "command": "weather"}]},
                {"name": "vault", "type": "task", "privileged": true},
                {"name": "late", "type": "task"}
            ]
        }"#;
        let log = new_log();
        let edit = handler_fn(|robot, _command, _args| async move {
            assert_eq!(robot.add_task("vault", vec![]).await, RetVal::PrivilegeViolation);
            assert_eq!(robot.add_command("weather", "").await, RetVal::MissingArguments);
            assert_eq!(robot.add_command("weather", "  ").await, RetVal::MissingArguments);
            assert_eq!(robot.add_command("weather", "forecast").await, RetVal::CommandNotMatched);
            assert_eq!(robot.final_task("late", vec![]).await, RetVal::Ok);
            TaskRetVal::Normal
        });
        let late = {
            let log = Arc::clone(&log);
            handler_fn(move |robot, _command, _args| {
                let log = Arc::clone(&log);
                async move {
                    let ret = robot.add_command("weather", "weather in Oslo").await;
                    log.lock().unwrap().push(format!("late:{ret}"));
                    TaskRetVal::Normal
                }
            })
        };
        let invoker = DefaultInvoker::new()
            .with_handler("edit", edit)
            .with_handler("late", late)
            .with_handler("vault", recording(&log, "vault", TaskRetVal::Normal))
            .with_handler("weather", recording(&log, "weather", TaskRetVal::Normal));
        let h = harness(tasks, invoker);

        assert_eq!(h.send("alice", "general", ";edit").await, vec![TaskRetVal::Normal]);
        assert_eq!(*log.lock().unwrap(), vec!["late:InvalidStage"]);
    })
    .await
    .expect("test timed out");
}

fn blow_up() -> TaskRetVal {
    panic!("work blew up")
}

#[tokio::test]
async fn panicking_task_still_runs_fail_and_final() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let work = handler_fn(|robot, _command, _args| async move {
            assert_eq!(robot.final_task("a", vec![]).await, RetVal::Ok);
            assert_eq!(robot.fail_task("x", vec![]).await, RetVal::Ok);
            blow_up()
        });
        let invoker = DefaultInvoker::new()
            .with_handler("work", work)
            .with_handler("a", recording(&log, "a", TaskRetVal::Normal))
            .with_handler("x", recording(&log, "x", TaskRetVal::Normal));
        let h = harness(STAGES, invoker);

        assert_eq!(h.send("alice", "general", ";work").await, vec![TaskRetVal::MechanismFail]);
        assert_eq!(*log.lock().unwrap(), vec!["x", "a"]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn fail_stage_stops_at_its_first_failure() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let work = handler_fn(|robot, _command, _args| async move {
            assert_eq!(robot.fail_task("x", vec![]).await, RetVal::Ok);
            assert_eq!(robot.fail_task("b", vec![]).await, RetVal::Ok);
            assert_eq!(robot.final_task("a", vec![]).await, RetVal::Ok);
            TaskRetVal::Fail
        });
        let invoker = DefaultInvoker::new()
            .with_handler("work", work)
            .with_handler("x", recording(&log, "x", TaskRetVal::Fail))
            .with_handler("b", recording(&log, "b", TaskRetVal::Normal))
            .with_handler("a", recording(&log, "a", TaskRetVal::Normal));
        let h = harness(STAGES, invoker);

        assert_eq!(h.send("alice", "general", ";work").await, vec![TaskRetVal::Fail]);
        assert_eq!(*log.lock().unwrap(), vec!["x", "a"]);
    })
    .await
    .expect("test timed out");
}

// ── Jobs ─────────────────────────────────────────────────────────────

fn exclusive_job(name: &'static str, queue: bool, log: &Log, started: Arc<Notify>) -> Arc<dyn taskbot::tasks::TaskHandler> {
    let log = Arc::clone(log);
    handler_fn(move |robot, _command, _args| {
        let log = Arc::clone(&log);
        let started = Arc::clone(&started);
        async move {
            if robot.exclusive("", queue).await {
                let id = robot.worker_id();
                log.lock().unwrap().push(format!("{name}-start-{id}"));
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(100)).await;
                log.lock().unwrap().push(format!("{name}-end-{id}"));
            }
            TaskRetVal::Normal
        }
    })
}

#[tokio::test]
async fn exclusive_jobs_queue_one_after_another() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let started = Arc::new(Notify::new());
        let tasks = r#"{"tasks": [{"name": "build", "type": "job"}]}"#;
        let invoker = DefaultInvoker::new().with_handler("build", exclusive_job("build", true, &log, Arc::clone(&started)));
        let h = harness(tasks, invoker);

        let mut handles = h.spawn("alice", "general", ";run job build").await;
        started.notified().await;
        handles.extend(h.spawn("alice", "general", ";run job build").await);
        for handle in handles {
            assert_eq!(handle.await.unwrap(), TaskRetVal::Normal);
        }

        let log = log.lock().unwrap().clone();
        assert_eq!(log.len(), 4);
        let kinds: Vec<&str> = log.iter().map(|e| e.rsplitn(2, '-').nth(1).unwrap_or_default()).collect();
        assert_eq!(kinds, vec!["build-start", "build-end", "build-start", "build-end"]);
        assert_ne!(log[0], log[2]);
        assert_eq!(h.conn.count("Queueing task 'build' in pipeline 'build'"), 1);
        assert_eq!(h.conn.count("Re-starting queued task 'build'"), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn busy_exclusive_job_aborts() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let started = Arc::new(Notify::new());
        let tasks = r#"{"tasks": [{"name": "deploy", "type": "job"}]}"#;
        let invoker = DefaultInvoker::new().with_handler("deploy", exclusive_job("deploy", false, &log, Arc::clone(&started)));
        let h = harness(tasks, invoker);

        let first = h.spawn("alice", "general", ";run job deploy").await;
        started.notified().await;
        assert_eq!(
            h.send("alice", "general", ";run job deploy").await,
            vec![TaskRetVal::PipelineAborted]
        );
        for handle in first {
            assert_eq!(handle.await.unwrap(), TaskRetVal::Normal);
        }
        assert_eq!(
            h.conn.count("Job 'deploy', run number 1 aborted, job 'deploy' already in progress"),
            1
        );
        assert_eq!(log.lock().unwrap().len(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn job_history_keeps_the_newest_runs() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let tasks = r#"{"tasks": [{"name": "nightly", "type": "job", "history_logs": 2}]}"#;
        let invoker = DefaultInvoker::new().with_handler("nightly", recording(&log, "nightly", TaskRetVal::Normal));
        let h = harness(tasks, invoker);

        for _ in 0..3 {
            assert_eq!(h.send("alice", "general", ";run job nightly").await, vec![TaskRetVal::Normal]);
        }
        let blob = h.brain.retrieve("histories:nightly").await.unwrap().unwrap();
        let history: JobHistory = serde_json::from_slice(&blob).unwrap();
        assert_eq!(history.next_index, 3);
        let indexes: Vec<u64> = history.histories.iter().map(|e| e.log_index).collect();
        assert_eq!(indexes, vec![1, 2]);

        assert_eq!(h.send("alice", "general", ";history nightly").await, vec![TaskRetVal::Normal]);
        let listing = h.conn.texts().into_iter().find(|t| t.starts_with("History of job runs")).unwrap();
        assert!(listing.contains("Run 1 - "));
        assert!(listing.contains("Run 2 - "));
        assert!(!listing.contains("Run 0 - "));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn run_job_checks_argument_patterns() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let tasks = r#"{
            "tasks": [{
                "name": "greet",
                "type": "job",
                "arguments": [{"label": "name", "regex": "[a-z]+"}]
            }]
        }"#;
        let invoker = DefaultInvoker::new().with_handler("greet", recording(&log, "greet", TaskRetVal::Normal));
        let h = harness(tasks, invoker);

        assert_eq!(h.send("alice", "general", ";run job greet 123").await, vec![TaskRetVal::Fail]);
        assert_eq!(h.conn.count("'123' doesn't match the pattern for argument 'name'"), 1);
        assert!(log.lock().unwrap().is_empty());

        assert_eq!(h.send("alice", "general", ";run job greet bob").await, vec![TaskRetVal::Normal]);
        assert_eq!(*log.lock().unwrap(), vec!["greet:bob"]);
        assert_eq!(h.conn.count("Starting job 'greet bob', run 0"), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn triggers_start_jobs_without_the_security_gate() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let tasks = r#"{
            "tasks": [{
                "name": "deploy",
                "type": "job",
                "require_admin": true,
                "triggers": [{"user": "ci-bot", "channel": "builds", "regex": "build (\\w+) finished"}]
            }]
        }"#;
        let invoker = DefaultInvoker::new().with_handler("deploy", recording(&log, "deploy", TaskRetVal::Normal));
        let h = harness(tasks, invoker);
        let mut events = h.engine.subscribe_events();

        assert_eq!(
            h.send("ci-bot", "builds", "Build web finished").await,
            vec![TaskRetVal::Normal]
        );
        assert!(h.send("mallory", "builds", "build web finished").await.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["deploy:web"]);
        assert!(drain_events(&mut events).contains(&Event::TriggeredTaskRan));
    })
    .await
    .expect("test timed out");
}

const SUB_JOBS: &str = r#"{
    "tasks": [
        {"name": "work", "type": "plugin", "commands": [{"regex": "work", "command": "work"}]},
        {"name": "weather", "type": "plugin", "commands": [{"regex": "weather(?: in (.+))?", "command": "weather"}]},
        {"name": "sub", "type": "job"}
    ]
}"#;

async fn next_run_index(brain: &MemBrain, job: &str) -> u64 {
    let blob = brain.retrieve(&format!("histories:{job}")).await.unwrap().unwrap();
    let history: JobHistory = serde_json::from_slice(&blob).unwrap();
    history.next_index
}

#[tokio::test]
async fn spawned_jobs_get_their_own_runs() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let work = handler_fn(|robot, _command, _args| async move {
            assert_eq!(robot.spawn_job("sub", vec![]).await, RetVal::Ok);
            TaskRetVal::Normal
        });
        let invoker = DefaultInvoker::new()
            .with_handler("work", work)
            .with_handler("sub", recording(&log, "sub", TaskRetVal::Normal));
        let h = harness(SUB_JOBS, invoker);

        assert_eq!(h.send("alice", "general", ";work").await, vec![TaskRetVal::Normal]);
        h.wait_for_text("Finished job 'sub', run 0").await;
        assert_eq!(h.send("alice", "general", ";work").await, vec![TaskRetVal::Normal]);
        h.wait_for_text("Finished job 'sub', run 1").await;

        assert_eq!(h.conn.count("Starting job 'sub', run 0 - spawned by pipeline 'work': "), 1);
        assert_eq!(h.conn.count("Starting job 'sub', run 1 - spawned by pipeline 'work': "), 1);
        assert_eq!(*log.lock().unwrap(), vec!["sub", "sub"]);
        assert_eq!(next_run_index(&h.brain, "sub").await, 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn added_jobs_and_commands_join_the_pipeline() {
    timeout(TEST_TIMEOUT, async {
        let log = new_log();
        let work = handler_fn(|robot, _command, _args| async move {
            assert_eq!(robot.add_job("sub", vec!["x".to_string()]).await, RetVal::Ok);
            assert_eq!(robot.add_command("weather", "weather in Oslo").await, RetVal::Ok);
            TaskRetVal::Normal
        });
        let invoker = DefaultInvoker::new()
            .with_handler("work", work)
            .with_handler("sub", recording(&log, "sub", TaskRetVal::Normal))
            .with_handler("weather", recording(&log, "weather", TaskRetVal::Normal));
        let h = harness(SUB_JOBS, invoker);

        assert_eq!(h.send("alice", "general", ";work").await, vec![TaskRetVal::Normal]);
        assert_eq!(*log.lock().unwrap(), vec!["sub:x", "weather:Oslo"]);
        assert_eq!(h.conn.count("Starting job 'sub x', run 0"), 1);
        assert_eq!(h.conn.count("Finished job 'sub', run 0"), 1);
        assert_eq!(next_run_index(&h.brain, "sub").await, 1);
    })
    .await
    .expect("test timed out");
}
