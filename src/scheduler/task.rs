use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::ForkEnvironment;
use crate::executor::script::Script;

/// Task identifier, scoped to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[default]
    Submitted,
    Pending,
    Running,
    WaitingOnError,
    Faulty,
    Failed,
    Finished,
    Aborted,
    Skipped,
    Paused,
}

impl TaskStatus {
    /// Terminal statuses. A parent in any of these no longer blocks its
    /// children; a job is finished once every task is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Finished
                | TaskStatus::Faulty
                | TaskStatus::Failed
                | TaskStatus::Aborted
                | TaskStatus::Skipped
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Submitted => write!(f, "submitted"),
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::WaitingOnError => write!(f, "waiting_on_error"),
            TaskStatus::Faulty => write!(f, "faulty"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Finished => write!(f, "finished"),
            TaskStatus::Aborted => write!(f, "aborted"),
            TaskStatus::Skipped => write!(f, "skipped"),
            TaskStatus::Paused => write!(f, "paused"),
        }
    }
}

/// Control-flow directive computed by a task's flow script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    Continue,
    /// Re-enable the block from `target` up to the emitting task.
    Loop { target: TaskId },
    /// Stamp direct children with replication indices 0..runs.
    Replicate { runs: u32 },
    /// Keep only the chosen branch child; the others are skipped unrun.
    IfBranch { chosen: TaskId },
}

impl FlowAction {
    /// Default action applied when the flow script itself fails.
    pub fn default_action() -> Self {
        FlowAction::Continue
    }
}

/// The task payload, dispatched through one executor interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutableContainer {
    /// A user script run through the script handler.
    Script { script: Script },
    /// A native command with its argument vector. Iteration/replication
    /// macro tokens are substituted in the arguments before execution.
    Native { command: String, args: Vec<String> },
}

/// Internal task model owned by its job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalTask {
    pub id: TaskId,
    /// Human-readable name, unique within the job.
    pub name: String,
    pub status: TaskStatus,
    /// Parent task ids. Order matters: later parents override earlier ones
    /// when propagated variables are merged.
    pub dependences: Vec<TaskId>,
    pub iteration_index: u32,
    pub replication_index: u32,
    pub executable: ExecutableContainer,
    pub fork_environment: Option<ForkEnvironment>,
    pub pre_script: Option<Script>,
    pub post_script: Option<Script>,
    pub flow_script: Option<Script>,
    /// Per-task selection script for node matching; `None` takes any node.
    pub selection_script: Option<Script>,
    /// Whether the selection script is evaluated fresh on each candidate
    /// node (dynamic) or once per node with a cacheable result (static).
    pub dynamic_selection: bool,
    /// Number of nodes this task reserves (multi-host execution).
    pub node_count: u32,
    /// Statically declared task variables, the base layer of the merge.
    pub variables: HashMap<String, String>,
    pub max_executions: u32,
    pub executions_left: u32,
    /// Remaining loop-action budget; bounds Loop flow actions.
    pub loop_budget: u32,
    pub start_time: Option<DateTime<Utc>>,
    /// Immutable once set; the sole ordering key for recovery replay.
    finished_time: Option<DateTime<Utc>>,
}

impl InternalTask {
    pub fn new(id: TaskId, name: impl Into<String>, executable: ExecutableContainer) -> Self {
        Self {
            id,
            name: name.into(),
            status: TaskStatus::Submitted,
            dependences: Vec::new(),
            iteration_index: 0,
            replication_index: 0,
            executable,
            fork_environment: None,
            pre_script: None,
            post_script: None,
            flow_script: None,
            selection_script: None,
            dynamic_selection: false,
            node_count: 1,
            variables: HashMap::new(),
            max_executions: 1,
            executions_left: 1,
            loop_budget: 0,
            start_time: None,
            finished_time: None,
        }
    }

    pub fn with_dependences(mut self, parents: Vec<TaskId>) -> Self {
        self.dependences = parents;
        self
    }

    pub fn with_max_executions(mut self, max: u32) -> Self {
        self.max_executions = max;
        self.executions_left = max;
        self
    }

    pub fn finished_time(&self) -> Option<DateTime<Utc>> {
        self.finished_time
    }

    /// Records the finished timestamp. The first write wins: the timestamp
    /// keys recovery replay ordering and must never move.
    pub fn set_finished_time(&mut self, at: DateTime<Utc>) {
        if self.finished_time.is_none() {
            self.finished_time = Some(at);
        }
    }

    /// Restores a persisted timestamp verbatim (recovery load path).
    pub fn restore_finished_time(&mut self, at: Option<DateTime<Utc>>) {
        self.finished_time = at;
    }
}
