use tokio::sync::broadcast;

use crate::rm::node::NodeState;
use crate::scheduler::job::{JobId, JobStatus};
use crate::scheduler::task::{TaskId, TaskStatus};

/// Events emitted synchronously with the state transition that causes them.
///
/// Per node, BUSY is always observable before the matching FREE; per job and
/// task, events are ordered by the job's own serialization scope.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    NodeStateChanged {
        node_url: String,
        new_state: NodeState,
    },
    TaskStatusChanged {
        job_id: JobId,
        task_id: TaskId,
        new_status: TaskStatus,
    },
    JobStatusChanged {
        job_id: JobId,
        new_status: JobStatus,
    },
}

/// Fan-out sink for monitoring/CLI layers.
///
/// Emission never blocks and never fails the state transition: an event with
/// no live subscriber is dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SchedulerEvent) {
        // A send error only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn node_state_changed(&self, node_url: &str, new_state: NodeState) {
        self.emit(SchedulerEvent::NodeStateChanged {
            node_url: node_url.to_string(),
            new_state,
        });
    }

    pub fn task_status_changed(&self, job_id: JobId, task_id: TaskId, new_status: TaskStatus) {
        self.emit(SchedulerEvent::TaskStatusChanged {
            job_id,
            task_id,
            new_status,
        });
    }

    pub fn job_status_changed(&self, job_id: JobId, new_status: JobStatus) {
        self.emit(SchedulerEvent::JobStatusChanged { job_id, new_status });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(256)
    }
}
