use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::{OperationResultSummary, OperationStatus, TaskStatus};

/// Default per-subscriber buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Lifecycle and progress notifications for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationEvent {
    StatusChanged {
        operation_id: Uuid,
        status: OperationStatus,
    },
    TaskStatusChanged {
        operation_id: Uuid,
        task_id: Uuid,
        task_name: String,
        status: TaskStatus,
    },
    /// A task finished and the operation advanced one step.
    Progress {
        operation_id: Uuid,
        completed_steps: usize,
        total_steps: usize,
        message: String,
    },
    /// Item-level progress inside a running task.
    TaskProgress {
        operation_id: Uuid,
        task_name: String,
        completed: usize,
        total: usize,
        message: String,
    },
    /// Last event for an operation; per-operation subscriptions close after it.
    Finished {
        operation_id: Uuid,
        status: OperationStatus,
        summary: Option<OperationResultSummary>,
    },
}

impl OperationEvent {
    pub fn operation_id(&self) -> Uuid {
        match self {
            OperationEvent::StatusChanged { operation_id, .. }
            | OperationEvent::TaskStatusChanged { operation_id, .. }
            | OperationEvent::Progress { operation_id, .. }
            | OperationEvent::TaskProgress { operation_id, .. }
            | OperationEvent::Finished { operation_id, .. } => *operation_id,
        }
    }
}

struct Subscriber {
    /// `None` receives every operation's events.
    operation: Option<Uuid>,
    tx: flume::Sender<OperationEvent>,
}

/// Fan-out of [`OperationEvent`]s over bounded flume channels.
///
/// A subscriber whose buffer is full misses the event instead of blocking
/// the publisher. Dropped receivers are pruned on publish, and
/// [`close`](Self::close) deregisters everything tied to a finished
/// operation.
#[derive(Clone)]
pub struct OperationEventBus {
    inner: Arc<Mutex<Vec<Subscriber>>>,
    capacity: usize,
}

impl OperationEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
        }
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Events of one operation.
    pub fn subscribe(&self, operation_id: Uuid) -> flume::Receiver<OperationEvent> {
        self.add(Some(operation_id))
    }

    /// Events of every operation.
    pub fn subscribe_all(&self) -> flume::Receiver<OperationEvent> {
        self.add(None)
    }

    fn add(&self, operation: Option<Uuid>) -> flume::Receiver<OperationEvent> {
        let (tx, rx) = flume::bounded(self.capacity);
        self.subscribers().push(Subscriber { operation, tx });
        rx
    }

    pub fn publish(&self, event: OperationEvent) {
        let id = event.operation_id();
        self.subscribers().retain(|sub| {
            if sub.operation.is_some_and(|op| op != id) {
                return true;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) | Err(flume::TrySendError::Full(_)) => true,
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Drop the subscriptions of `operation_id`; their receivers end once
    /// drained.
    pub fn close(&self, operation_id: Uuid) {
        self.subscribers()
            .retain(|sub| sub.operation != Some(operation_id));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }
}

impl Default for OperationEventBus {
    fn default() -> Self {
        Self::new()
    }
}
