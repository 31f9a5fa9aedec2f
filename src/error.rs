use thiserror::Error;

use crate::scheduler::job::JobId;
use crate::scheduler::task::TaskId;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The task body (user script or native command) threw. Recorded in the
    /// task result; the job continues according to its retry policy.
    #[error("task execution failed: {0}")]
    UserTask(String),

    /// A pre/post/flow script stage failed. Same handling as a user error,
    /// with the failing stage attributed.
    #[error("{stage} script failed: {message}")]
    Pipeline { stage: PipelineStage, message: String },

    /// Persisted state violates a scheduling invariant. The affected job is
    /// excised to CANCELED; recovery continues for the other jobs.
    #[error("inconsistent persisted state for job {0}: {1}")]
    RecoveryInconsistency(JobId, String),

    /// The selector could not satisfy a node request. The caller retries or
    /// backs off; this never crashes the scheduler.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The store could not confirm a mutation. Fatal to the affected
    /// operation; the mutation is never assumed committed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The task graph is not a DAG. Validated at submission; hitting this
    /// inside the sorter is an internal-consistency failure.
    #[error("cyclic dependency involving task {0}")]
    CyclicDependency(TaskId),

    /// The node pool itself is unreachable.
    #[error("no connection to node pool: {0}")]
    NoConnection(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("task {1} not found in job {0}")]
    TaskNotFound(JobId, TaskId),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Pipeline stage attribution for script failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Pre,
    Body,
    Post,
    Flow,
    Dataspace,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStage::Pre => write!(f, "pre"),
            PipelineStage::Body => write!(f, "body"),
            PipelineStage::Post => write!(f, "post"),
            PipelineStage::Flow => write!(f, "flow"),
            PipelineStage::Dataspace => write!(f, "dataspace"),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
