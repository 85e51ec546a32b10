//! Cron-scheduled jobs.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::ScheduleConfig;
use crate::engine::Engine;
use crate::pipeline::executor::start_pipeline;
use crate::pipeline::types::PipelineType;
use crate::worker::Worker;

/// Parse a cron expression. Five-field expressions get a leading seconds
/// field of `0`.
pub fn parse_schedule(schedule: &str) -> Result<cron::Schedule, String> {
    let fields = schedule.split_whitespace().count();
    let expr = if fields == 5 {
        format!("0 {schedule}")
    } else {
        schedule.to_string()
    };
    cron::Schedule::from_str(&expr).map_err(|e| format!("invalid cron: {e}"))
}

/// Next fire time after `after`.
pub fn next_fire(schedule: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, String> {
    Ok(parse_schedule(schedule)?.after(&after).next())
}

fn schedule_key(s: &ScheduleConfig) -> String {
    format!("{}|{}|{}", s.schedule, s.task, s.arguments.join(" "))
}

/// Poll the registry's schedules every `interval` and start any that are due.
pub fn spawn_scheduler(engine: Arc<Engine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        let mut due: HashMap<String, DateTime<Utc>> = HashMap::new();
        loop {
            ticker.tick().await;
            check_schedules(&engine, &mut due, Utc::now()).await;
        }
    })
}

/// Start every schedule due at `now`, then compute its next fire time.
/// Schedules seen for the first time only get a fire time.
async fn check_schedules(
    engine: &Arc<Engine>,
    due: &mut HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> usize {
    let registry = engine.registry().await;
    let mut fired = 0;
    let mut seen = Vec::with_capacity(registry.schedules().len());

    for sched in registry.schedules() {
        let key = schedule_key(sched);
        seen.push(key.clone());
        let Some(&next) = due.get(&key) else {
            match next_fire(&sched.schedule, now) {
                Ok(Some(next)) => {
                    tracing::info!(task = %sched.task, schedule = %sched.schedule, %next, "Job scheduled");
                    due.insert(key, next);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(task = %sched.task, schedule = %sched.schedule, "Bad schedule: {}", e);
                    // Keep it out of the way until the config changes.
                    due.insert(key, DateTime::<Utc>::MAX_UTC);
                }
            }
            continue;
        };
        if next > now {
            continue;
        }

        match next_fire(&sched.schedule, now) {
            Ok(Some(following)) => due.insert(key, following),
            _ => due.insert(key, DateTime::<Utc>::MAX_UTC),
        };

        let Some(task) = registry.get(&sched.task) else {
            tracing::error!(task = %sched.task, "Scheduled task not found");
            continue;
        };
        if task.disabled {
            tracing::warn!(task = %task.name, "Not running disabled scheduled task");
            continue;
        }
        let channel = task.channel.clone().unwrap_or_default();
        let worker = Worker::automatic(
            Arc::clone(engine),
            engine.connectors.default_protocol(),
            &channel,
        );
        tracing::info!(task = %task.name, "Starting scheduled task");
        tokio::spawn(start_pipeline(
            worker,
            task,
            PipelineType::Scheduled,
            "run".to_string(),
            sched.arguments.clone(),
        ));
        fired += 1;
    }
    due.retain(|k, _| seen.contains(k));
    fired
}
