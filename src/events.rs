//! Disposition events.
//!
//! Every dispatch and security decision emits one of these. They carry no
//! payload; they exist so tests and diagnostics can observe what the robot
//! decided without scraping log output.

use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    CommandTaskRan,
    AmbientTaskRan,
    CatchAllTaskRan,
    TriggeredTaskRan,
    SpawnedTaskRan,
    ScheduledTaskRan,
    JobTaskRan,
    MultipleMatchesNoAction,
    CatchAllsMultiple,
    AdminCheckPassed,
    AdminCheckFailed,
    AuthNoRunMisconfigured,
    AuthNoRunNotFound,
    AuthRanSuccess,
    AuthRanFail,
    AuthRanMechanismFailed,
    AuthRanFailNormal,
    AuthRanFailOther,
    ElevNoRunMisconfigured,
    ElevNoRunNotFound,
    ElevRanSuccess,
    ElevRanFail,
    ElevRanMechanismFailed,
    ElevRanFailNormal,
    ElevRanFailOther,
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Broadcasts events to any number of subscribers. Emitting with no
/// subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<Event>,
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        tracing::trace!(%event, "event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let sink = EventSink::new();
        let mut rx = sink.subscribe();
        sink.emit(Event::AuthRanSuccess);
        sink.emit(Event::CommandTaskRan);
        assert_eq!(rx.recv().await.unwrap(), Event::AuthRanSuccess);
        assert_eq!(rx.recv().await.unwrap(), Event::CommandTaskRan);
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        EventSink::new().emit(Event::AdminCheckFailed);
    }
}
