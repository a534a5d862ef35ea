use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{BatchItemStatus, BatchReport};

/// Progress notifications for one job, fanned out to any number of SSE
/// subscribers. Slow subscribers lag and drop; emitters never block.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PhaseStarted {
        phase: String,
    },
    Status {
        message: String,
    },
    ExtractionFinished {
        attempts: u32,
        product_count: usize,
    },
    RefineScored {
        iteration: u32,
        passed: usize,
        failed: usize,
    },
    RefineFinished {
        status: String,
        iterations: u32,
        recipe_version: u32,
    },
    BatchStarted {
        total: usize,
    },
    ItemStarted {
        product_id: String,
    },
    ItemRetrying {
        product_id: String,
        issues: Vec<String>,
    },
    ItemCompleted {
        product_id: String,
        status: BatchItemStatus,
        score: Option<u8>,
        completed: usize,
        total: usize,
    },
    BatchCompleted {
        report: BatchReport,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Stamp and publish an event. A send with no live subscribers is fine;
    /// progress must not depend on anyone watching.
    pub fn emit(&self, job_id: &str, kind: EventKind) {
        let event = ProgressEvent {
            job_id: job_id.to_string(),
            timestamp: Utc::now(),
            kind,
        };
        tracing::debug!(target = "listwright.events", job_id, event = ?event.kind, "emit");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_stamped_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(
            "job-1",
            EventKind::PhaseStarted {
                phase: "testing".into(),
            },
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, "job-1");
        assert!(matches!(event.kind, EventKind::PhaseStarted { .. }));
    }

    #[test]
    fn emitting_without_subscribers_does_not_panic() {
        let bus = EventBus::new(8);
        bus.emit(
            "job-2",
            EventKind::Status {
                message: "hello".into(),
            },
        );
    }

    #[test]
    fn events_serialize_with_type_tags() {
        let event = ProgressEvent {
            job_id: "job-3".into(),
            timestamp: Utc::now(),
            kind: EventKind::ItemCompleted {
                product_id: "p1".into(),
                status: BatchItemStatus::Ok,
                score: Some(88),
                completed: 3,
                total: 10,
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "item_completed");
        assert_eq!(value["score"], 88);
    }
}
