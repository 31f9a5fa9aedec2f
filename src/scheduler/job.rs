use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::executor::context::TaskResultData;
use crate::scheduler::task::{FlowAction, InternalTask, TaskId, TaskStatus};

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonic job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl JobId {
    pub fn next() -> Self {
        JobId(NEXT_JOB_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Keeps the factory ahead of ids loaded from the store at recovery.
    pub fn ensure_above(id: JobId) {
        NEXT_JOB_ID.fetch_max(id.0 + 1, Ordering::SeqCst);
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    /// Was RUNNING before a restart; dispatch not yet resumed.
    Stalled,
    Paused,
    Finished,
    Canceled,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Canceled | JobStatus::Failed | JobStatus::Killed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Stalled => write!(f, "stalled"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Canceled => write!(f, "canceled"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Killed => write!(f, "killed"),
        }
    }
}

/// What a task termination did to the job, for event emission and worker
/// bookkeeping by the scheduling loop.
#[derive(Debug, Clone, Default)]
pub struct TerminateOutcome {
    pub task_status: TaskStatus,
    /// The task failed with retry budget left and waits for its restart
    /// delay before going back to PENDING.
    pub retry: bool,
    /// Children pruned by an if-branch action.
    pub skipped: Vec<TaskId>,
    /// Tasks re-enabled by a loop action.
    pub reset: Vec<TaskId>,
    /// Tasks aborted unrun: descendants blocked by this task's failure, plus
    /// everything live when the job's cancel-on-error policy fired.
    pub aborted: Vec<TaskId>,
    pub job_finished: bool,
}

/// One job's task DAG, aggregate status, and transition rules.
///
/// All mutation goes through this type, under the job's own lock; two
/// concurrent task completions for the same job never interleave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalJob {
    pub id: JobId,
    pub name: String,
    pub owner: String,
    pub status: JobStatus,
    /// Generic job environment variables, seeded into every task.
    pub generic_variables: HashMap<String, String>,
    pub input_space: Option<String>,
    pub output_space: Option<String>,
    pub global_space: Option<String>,
    pub user_space: Option<String>,
    /// Any FAULTY/FAILED task cancels the whole job when set.
    pub cancel_on_error: bool,
    tasks: BTreeMap<TaskId, InternalTask>,
    /// Results of terminal tasks, kept for downstream variable propagation
    /// and persisted with the job.
    results: HashMap<TaskId, TaskResultData>,
    pending_count: usize,
    running_count: usize,
    finished_count: usize,
    pub submitted_time: DateTime<Utc>,
    next_task_id: u64,
}

impl InternalJob {
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            id: JobId::next(),
            name: name.into(),
            owner: owner.into(),
            status: JobStatus::Pending,
            generic_variables: HashMap::new(),
            input_space: None,
            output_space: None,
            global_space: None,
            user_space: None,
            cancel_on_error: false,
            tasks: BTreeMap::new(),
            results: HashMap::new(),
            pending_count: 0,
            running_count: 0,
            finished_count: 0,
            submitted_time: Utc::now(),
            next_task_id: 1,
        }
    }

    pub fn next_task_id(&mut self) -> TaskId {
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;
        id
    }

    /// Adds a task. Names must be unique within the job.
    pub fn add_task(&mut self, task: InternalTask) -> Result<()> {
        if self.tasks.values().any(|t| t.name == task.name) {
            return Err(SchedulerError::Internal(format!(
                "duplicate task name in job {}: {}",
                self.id, task.name
            )));
        }
        self.tasks.insert(task.id, task);
        Ok(())
    }

    pub fn task(&self, id: TaskId) -> Result<&InternalTask> {
        self.tasks
            .get(&id)
            .ok_or(SchedulerError::TaskNotFound(self.id, id))
    }

    pub fn task_mut(&mut self, id: TaskId) -> Result<&mut InternalTask> {
        let job_id = self.id;
        self.tasks
            .get_mut(&id)
            .ok_or(SchedulerError::TaskNotFound(job_id, id))
    }

    pub fn task_by_name(&self, name: &str) -> Option<&InternalTask> {
        self.tasks.values().find(|t| t.name == name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &InternalTask> {
        self.tasks.values()
    }

    pub fn tasks_mut(&mut self) -> impl Iterator<Item = &mut InternalTask> {
        self.tasks.values_mut()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn result(&self, id: TaskId) -> Option<&TaskResultData> {
        self.results.get(&id)
    }

    pub fn number_of_pending_tasks(&self) -> usize {
        self.pending_count
    }

    pub fn number_of_running_tasks(&self) -> usize {
        self.running_count
    }

    pub fn number_of_finished_tasks(&self) -> usize {
        self.finished_count
    }

    /// Flow-script target resolution table.
    pub fn flow_targets(&self) -> HashMap<String, TaskId> {
        self.tasks
            .values()
            .map(|t| (t.name.clone(), t.id))
            .collect()
    }

    /// Validates the dependency structure at submission: every declared
    /// parent exists and the graph is a DAG.
    pub fn validate(&self) -> Result<()> {
        for task in self.tasks.values() {
            for parent in &task.dependences {
                if !self.tasks.contains_key(parent) {
                    return Err(SchedulerError::TaskNotFound(self.id, *parent));
                }
            }
        }
        let tasks: Vec<&InternalTask> = self.tasks.values().collect();
        crate::scheduler::sorter::sort(&tasks)?;
        Ok(())
    }

    /// Moves every task SUBMITTED -> PENDING when the job enters the queue.
    pub fn submit_action(&mut self) {
        for task in self.tasks.values_mut() {
            if task.status == TaskStatus::Submitted {
                task.status = TaskStatus::Pending;
            }
        }
        self.pending_count = self.tasks.len();
        self.running_count = 0;
        self.finished_count = 0;
    }

    /// Ready tasks in submission order, after propagating branch prunes.
    ///
    /// A PENDING task is ready when every parent is terminal and at least
    /// one parent survived pruning. A task whose parents are all SKIPPED is
    /// itself skipped without running; the cascade is folded here so prune
    /// chains resolve in one pass.
    pub fn collect_ready_tasks(&mut self) -> Vec<TaskId> {
        self.resolve_pruned_tasks();

        if !matches!(self.status, JobStatus::Pending | JobStatus::Running) {
            return Vec::new();
        }

        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && self.parents_terminal(t))
            .map(|t| t.id)
            .collect()
    }

    /// Folds prune chains to a fixpoint: a PENDING task whose parents are
    /// all terminal and all SKIPPED is itself skipped without running.
    /// Returns the tasks skipped by this sweep.
    pub fn resolve_pruned_tasks(&mut self) -> Vec<TaskId> {
        let mut all_skipped = Vec::new();
        loop {
            let to_skip: Vec<TaskId> = self
                .tasks
                .values()
                .filter(|t| {
                    t.status == TaskStatus::Pending
                        && !t.dependences.is_empty()
                        && self.parents_terminal(t)
                        && t.dependences
                            .iter()
                            .all(|p| self.tasks[p].status == TaskStatus::Skipped)
                })
                .map(|t| t.id)
                .collect();
            if to_skip.is_empty() {
                break;
            }
            for id in to_skip {
                self.mark_skipped(id);
                all_skipped.push(id);
            }
        }
        all_skipped
    }

    fn parents_terminal(&self, task: &InternalTask) -> bool {
        task.dependences
            .iter()
            .all(|p| self.tasks.get(p).map(|t| t.status.is_terminal()).unwrap_or(false))
    }

    fn mark_skipped(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Skipped;
                task.set_finished_time(Utc::now());
                self.pending_count = self.pending_count.saturating_sub(1);
                self.finished_count += 1;
            }
        }
    }

    /// Results of a task's direct parents, in declared dependency order.
    pub fn parent_results(&self, id: TaskId) -> Result<Vec<TaskResultData>> {
        let task = self.task(id)?;
        Ok(task
            .dependences
            .iter()
            .filter_map(|p| self.results.get(p).cloned())
            .collect())
    }

    /// PENDING -> RUNNING. The first started task moves the job to RUNNING.
    pub fn start_task(&mut self, id: TaskId, at: DateTime<Utc>) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Pending {
            return Err(SchedulerError::Internal(format!(
                "cannot start task {id} in status {}",
                task.status
            )));
        }
        task.status = TaskStatus::Running;
        task.start_time = Some(at);
        self.pending_count = self.pending_count.saturating_sub(1);
        self.running_count += 1;
        if self.status == JobStatus::Pending || self.status == JobStatus::Stalled {
            self.status = JobStatus::Running;
        }
        Ok(())
    }

    /// Folds one task result into the DAG state machine.
    pub fn terminate_task(
        &mut self,
        id: TaskId,
        result: TaskResultData,
        at: DateTime<Utc>,
    ) -> Result<TerminateOutcome> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(SchedulerError::Internal(format!(
                "cannot terminate task {id} in status {}",
                task.status
            )));
        }

        let mut outcome = TerminateOutcome::default();

        if result.was_killed() {
            task.status = TaskStatus::Aborted;
        } else if result.had_exception() {
            if task.executions_left > 1 {
                task.executions_left -= 1;
                task.status = TaskStatus::WaitingOnError;
                self.running_count = self.running_count.saturating_sub(1);
                self.pending_count += 1;
                outcome.task_status = TaskStatus::WaitingOnError;
                outcome.retry = true;
                self.results.insert(id, result);
                return Ok(outcome);
            }
            task.status = TaskStatus::Faulty;
        } else {
            task.status = TaskStatus::Finished;
        }

        task.set_finished_time(at);
        let task_status = task.status;
        let flow_action = result.flow_action.clone();
        self.running_count = self.running_count.saturating_sub(1);
        self.finished_count += 1;
        self.results.insert(id, result);
        outcome.task_status = task_status;

        if task_status == TaskStatus::Finished {
            self.apply_flow_action(id, flow_action.as_ref(), &mut outcome);
        } else {
            // A faulty/failed/aborted parent is a blocking outcome: its
            // descendants can never become ready and are aborted unrun.
            outcome.aborted = self.abort_blocked_descendants(id);
        }

        if self.cancel_on_error
            && matches!(task_status, TaskStatus::Faulty | TaskStatus::Failed)
        {
            outcome.aborted.extend(self.abort_live_tasks());
            self.status = JobStatus::Failed;
            outcome.job_finished = true;
            return Ok(outcome);
        }

        if self.pending_count == 0 && self.running_count == 0 {
            self.status = if self
                .tasks
                .values()
                .any(|t| matches!(t.status, TaskStatus::Faulty | TaskStatus::Failed))
                && self.cancel_on_error
            {
                JobStatus::Failed
            } else {
                JobStatus::Finished
            };
            outcome.job_finished = true;
        }

        Ok(outcome)
    }

    fn apply_flow_action(
        &mut self,
        id: TaskId,
        action: Option<&FlowAction>,
        outcome: &mut TerminateOutcome,
    ) {
        match action {
            None | Some(FlowAction::Continue) => {}
            Some(FlowAction::IfBranch { chosen }) => {
                let to_skip: Vec<TaskId> = self
                    .tasks
                    .values()
                    .filter(|t| {
                        t.dependences.contains(&id)
                            && t.id != *chosen
                            && t.status == TaskStatus::Pending
                    })
                    .map(|t| t.id)
                    .collect();
                for child in to_skip {
                    self.mark_skipped(child);
                    outcome.skipped.push(child);
                }
            }
            Some(FlowAction::Loop { target }) => {
                let budget_left = {
                    let task = match self.tasks.get_mut(&id) {
                        Some(t) => t,
                        None => return,
                    };
                    if task.loop_budget == 0 {
                        false
                    } else {
                        task.loop_budget -= 1;
                        true
                    }
                };
                if budget_left {
                    outcome.reset = self.reset_loop_block(*target, id);
                }
            }
            Some(FlowAction::Replicate { runs }) => {
                // The DAG is fixed at submission; replication stamps the
                // direct children with their run ordinal instead of
                // duplicating tasks.
                let children: Vec<TaskId> = self
                    .tasks
                    .values()
                    .filter(|t| t.dependences.contains(&id))
                    .map(|t| t.id)
                    .collect();
                for (ordinal, child) in children.into_iter().enumerate() {
                    if (ordinal as u32) < *runs {
                        if let Some(t) = self.tasks.get_mut(&child) {
                            t.replication_index = ordinal as u32;
                        }
                    }
                }
            }
        }
    }

    /// Re-enables the block between `target` and `source` inclusive: the
    /// target, the source, and every task on a dependency path between
    /// them. Each reset task gets a fresh activation with a bumped
    /// iteration index.
    fn reset_loop_block(&mut self, target: TaskId, source: TaskId) -> Vec<TaskId> {
        let descendants = self.reachable_from(target);
        let ancestors = self.reaching_to(source);
        let mut block: Vec<TaskId> = descendants
            .intersection(&ancestors)
            .copied()
            .collect();
        block.sort();

        for id in &block {
            let Some(task) = self.tasks.get_mut(id) else {
                continue;
            };
            if task.status == TaskStatus::Running {
                continue;
            }
            let was_terminal = task.status.is_terminal();
            task.status = TaskStatus::Pending;
            task.iteration_index += 1;
            task.executions_left = task.max_executions;
            task.start_time = None;
            task.restore_finished_time(None);
            if was_terminal {
                // Tasks on the looped path move from the finished count back
                // to the pending count; already-pending ones stay counted.
                self.finished_count = self.finished_count.saturating_sub(1);
                self.pending_count += 1;
                self.results.remove(id);
            }
        }
        block
    }

    /// Aborts every not-yet-started transitive descendant of `source`.
    fn abort_blocked_descendants(&mut self, source: TaskId) -> Vec<TaskId> {
        let mut descendants: Vec<TaskId> = self
            .reachable_from(source)
            .into_iter()
            .filter(|d| *d != source)
            .collect();
        descendants.sort();

        let mut aborted = Vec::new();
        for id in descendants {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Paused) {
                task.status = TaskStatus::Aborted;
                task.set_finished_time(Utc::now());
                self.pending_count = self.pending_count.saturating_sub(1);
                self.finished_count += 1;
                aborted.push(id);
            }
        }
        aborted
    }

    fn reachable_from(&self, start: TaskId) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            for t in self.tasks.values() {
                if t.dependences.contains(&id) {
                    stack.push(t.id);
                }
            }
        }
        seen
    }

    fn reaching_to(&self, end: TaskId) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let mut stack = vec![end];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(t) = self.tasks.get(&id) {
                stack.extend(t.dependences.iter().copied());
            }
        }
        seen
    }

    fn abort_live_tasks(&mut self) -> Vec<TaskId> {
        let mut aborted = Vec::new();
        for task in self.tasks.values_mut() {
            if matches!(
                task.status,
                TaskStatus::Pending
                    | TaskStatus::Running
                    | TaskStatus::Paused
                    | TaskStatus::WaitingOnError
            ) {
                task.status = TaskStatus::Aborted;
                task.set_finished_time(Utc::now());
                aborted.push(task.id);
            }
        }
        self.finished_count += self.pending_count + self.running_count;
        self.pending_count = 0;
        self.running_count = 0;
        aborted
    }

    /// WAITING_ON_ERROR -> PENDING after the restart delay has elapsed.
    pub fn restart_waiting_task(&mut self, id: TaskId) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::WaitingOnError {
            return Err(SchedulerError::Internal(format!(
                "cannot restart task {id} in status {}",
                task.status
            )));
        }
        task.status = TaskStatus::Pending;
        self.results.remove(&id);
        Ok(())
    }

    /// Replays one terminal task during recovery, rebuilding the live
    /// dependency-resolution state without re-running anything. Parents are
    /// replayed first (the recovery coordinator sorts by finished time), so
    /// a non-terminal parent here means the persisted state is inconsistent.
    pub fn recover_task(&mut self, id: TaskId) -> Result<()> {
        let job_id = self.id;
        let task = self.task(id)?;
        if !task.status.is_terminal() {
            return Err(SchedulerError::RecoveryInconsistency(
                job_id,
                format!("replayed task {id} has non-terminal status {}", task.status),
            ));
        }
        if task.finished_time().is_none() {
            return Err(SchedulerError::RecoveryInconsistency(
                job_id,
                format!("terminal task {id} has no finished timestamp"),
            ));
        }
        // Aborted/Skipped tasks never ran, so a live parent next to them is
        // a legal shape: the abort cascade after a faulty parent (or a
        // branch prune) fires while a co-parent is still pending. The
        // dependency-order check only applies to tasks that executed.
        if !matches!(task.status, TaskStatus::Aborted | TaskStatus::Skipped) {
            for parent in task.dependences.clone() {
                let parent_status = self.task(parent)?.status;
                if !parent_status.is_terminal() {
                    return Err(SchedulerError::RecoveryInconsistency(
                        job_id,
                        format!("task {id} finished before its parent {parent} ({parent_status})"),
                    ));
                }
            }
        }
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Running;
        }
        Ok(())
    }

    /// Recomputes counters from task statuses (recovery load path).
    pub fn refresh_counters(&mut self) {
        self.pending_count = 0;
        self.running_count = 0;
        self.finished_count = 0;
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Running => self.running_count += 1,
                s if s.is_terminal() => self.finished_count += 1,
                _ => self.pending_count += 1,
            }
        }
    }

    /// Folds running counts into pending after recovery: nothing is actually
    /// executing until the scheduler is started.
    pub fn fold_running_into_pending(&mut self) {
        self.pending_count += self.running_count;
        self.running_count = 0;
    }

    /// Pauses the job: only tasks still PENDING are held.
    pub fn set_paused(&mut self) {
        self.status = JobStatus::Paused;
        for task in self.tasks.values_mut() {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Paused;
            }
        }
    }

    pub fn set_unpaused(&mut self) {
        for task in self.tasks.values_mut() {
            if task.status == TaskStatus::Paused {
                task.status = TaskStatus::Pending;
            }
        }
        self.status = if self.running_count > 0 || self.finished_count > 0 {
            JobStatus::Running
        } else {
            JobStatus::Pending
        };
    }

    /// Kills the job: every live task is aborted.
    pub fn kill(&mut self) -> Vec<TaskId> {
        let aborted = self.abort_live_tasks();
        self.status = JobStatus::Killed;
        aborted
    }
}
