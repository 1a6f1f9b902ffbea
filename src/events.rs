//! Metadata-change notifications.
//!
//! Every durable task mutation emits a [`TaskEvent`] carrying the task id and
//! its current full record (`None` on deletion). This is the sole mechanism
//! by which a UI layer or any other observer learns of lifecycle changes; no
//! polling contract is offered.

use crate::types::TaskRecord;
use tokio::sync::broadcast;

/// A durable task mutation. `record` is `None` when the task was deleted.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task_id: String,
    pub record: Option<TaskRecord>,
}

/// Typed broadcast channel for task events.
///
/// Slow or absent subscribers never block the engine: events to a lagging
/// receiver are dropped by the broadcast channel, and sends with no
/// subscribers are discarded.
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, task_id: &str, record: Option<TaskRecord>) {
        let _ = self.tx.send(TaskEvent {
            task_id: task_id.to_string(),
            record,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
