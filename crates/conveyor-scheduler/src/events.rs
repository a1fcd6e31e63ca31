//! Lifecycle notifications emitted by the scheduler.

use conveyor_core::queue::QueueEntry;
use serde::Serialize;
use tokio::sync::broadcast;

/// Event emitted during queue processing.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobStarted { entry: QueueEntry },
    JobCompleted { entry: QueueEntry },
    JobFailed { entry: QueueEntry, error: String },
    JobRetry { entry: QueueEntry, error: String },
    JobCancelled { entry: QueueEntry },
}

impl SchedulerEvent {
    pub fn entry(&self) -> &QueueEntry {
        match self {
            SchedulerEvent::JobStarted { entry }
            | SchedulerEvent::JobCompleted { entry }
            | SchedulerEvent::JobFailed { entry, .. }
            | SchedulerEvent::JobRetry { entry, .. }
            | SchedulerEvent::JobCancelled { entry } => entry,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::JobStarted { .. } => "started",
            SchedulerEvent::JobCompleted { .. } => "completed",
            SchedulerEvent::JobFailed { .. } => "failed",
            SchedulerEvent::JobRetry { .. } => "retry",
            SchedulerEvent::JobCancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerEvent::JobCompleted { .. }
                | SchedulerEvent::JobFailed { .. }
                | SchedulerEvent::JobCancelled { .. }
        )
    }
}

/// Fire-and-forget broadcast of scheduler events.
///
/// Sending never waits: subscribers that fall behind lose the oldest events
/// and see `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SchedulerEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::queue::NewJob;
    use tokio::sync::broadcast::error::RecvError;

    fn started() -> SchedulerEvent {
        SchedulerEvent::JobStarted {
            entry: QueueEntry::admit(NewJob::new("build")).unwrap(),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(started());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.emit(started());
        }

        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(rx.recv().await.unwrap().kind(), "started");
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(started()).unwrap();
        assert_eq!(json["type"], "job_started");
        assert_eq!(json["entry"]["jobId"], "build");
    }
}
