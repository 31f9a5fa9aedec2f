//! Scheduling engine: job/task state machines, dependency ordering, the
//! store contract, crash recovery, and the decision loop.

pub mod core;
pub mod job;
pub mod recovery;
pub mod sorter;
pub mod store;
pub mod task;

pub use core::{JobSnapshot, Scheduler, SchedulerHandle};
pub use job::{InternalJob, JobId, JobStatus};
pub use task::{InternalTask, TaskId, TaskStatus};
