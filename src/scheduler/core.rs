//! The scheduling loop: a single decision task that consumes submissions,
//! completion events, and administrative commands from one channel, matches
//! ready tasks to nodes, and hands them to executor workers.
//!
//! Only this task evaluates "what is ready to run next", so the shared DAG
//! state sees no races. Task execution itself is parallel: each dispatched
//! task runs on its own spawned worker, and only the per-job state
//! transitions are serialized (by the job's own lock).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::events::EventSink;
use crate::executor::context::TaskContext;
use crate::executor::{Dataspace, TaskExecutor};
use crate::rm::node::NodeClient;
use crate::rm::selection::{NodeSet, ResourceSelector, SelectionPolicy};
use crate::scheduler::job::{InternalJob, JobId, JobStatus};
use crate::scheduler::recovery::RecoveryCoordinator;
use crate::scheduler::store::SchedulerStore;
use crate::scheduler::task::{TaskId, TaskStatus};

/// Wake-up causes processed by the decision loop.
enum SchedulerCommand {
    Submit {
        job: InternalJob,
        reply: oneshot::Sender<Result<JobId>>,
    },
    KillJob {
        job_id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    PauseJob {
        job_id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    ResumeJob {
        job_id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveJob {
        job_id: JobId,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Enables dispatch (the scheduler starts stopped after recovery).
    Start,
    Stop,
    TaskTerminated {
        job_id: JobId,
        task_id: TaskId,
        result: crate::executor::context::TaskResultData,
        nodes: NodeSet,
    },
    /// A WAITING_ON_ERROR task whose restart delay elapsed.
    RestartTask { job_id: JobId, task_id: TaskId },
    JobSnapshot {
        job_id: JobId,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    Shutdown,
}

/// Point-in-time view of one job, for monitoring and tests.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub task_statuses: HashMap<TaskId, TaskStatus>,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub finished_tasks: usize,
}

/// Client handle to a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    async fn send(&self, command: SchedulerCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| SchedulerError::Internal("scheduler loop has shut down".into()))
    }

    pub async fn submit_job(&self, job: InternalJob) -> Result<JobId> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::Submit { job, reply }).await?;
        rx.await
            .map_err(|_| SchedulerError::Internal("scheduler loop has shut down".into()))?
    }

    pub async fn kill_job(&self, job_id: JobId) -> Result<()> {
        self.admin(|reply| SchedulerCommand::KillJob { job_id, reply }).await
    }

    pub async fn pause_job(&self, job_id: JobId) -> Result<()> {
        self.admin(|reply| SchedulerCommand::PauseJob { job_id, reply }).await
    }

    pub async fn resume_job(&self, job_id: JobId) -> Result<()> {
        self.admin(|reply| SchedulerCommand::ResumeJob { job_id, reply }).await
    }

    pub async fn remove_job(&self, job_id: JobId) -> Result<()> {
        self.admin(|reply| SchedulerCommand::RemoveJob { job_id, reply }).await
    }

    async fn admin(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> SchedulerCommand,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await
            .map_err(|_| SchedulerError::Internal("scheduler loop has shut down".into()))?
    }

    /// Starts dispatching. After recovery the loop holds every job stalled
    /// until this is called.
    pub async fn start(&self) -> Result<()> {
        self.send(SchedulerCommand::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(SchedulerCommand::Stop).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(SchedulerCommand::Shutdown).await
    }

    pub async fn job_snapshot(&self, job_id: JobId) -> Result<Option<JobSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(SchedulerCommand::JobSnapshot { job_id, reply }).await?;
        rx.await
            .map_err(|_| SchedulerError::Internal("scheduler loop has shut down".into()))
    }
}

/// The scheduler service: recovery at startup, then the decision loop.
pub struct Scheduler<C: NodeClient> {
    config: SchedulerConfig,
    store: Arc<dyn SchedulerStore>,
    selector: Arc<ResourceSelector<C>>,
    executor: TaskExecutor,
    events: EventSink,
    dataspace: Option<Arc<dyn Dataspace>>,
    jobs: HashMap<JobId, Arc<Mutex<InternalJob>>>,
    finished_jobs: Vec<JobId>,
    /// Kill tokens, one per live job; task workers get child tokens.
    kill_tokens: HashMap<JobId, CancellationToken>,
    task_tokens: HashMap<(JobId, TaskId), CancellationToken>,
    dispatch_enabled: bool,
    /// Set when a store write could not be confirmed; halts dispatch until
    /// a later write succeeds.
    store_degraded: bool,
    rx: mpsc::Receiver<SchedulerCommand>,
    tx: mpsc::Sender<SchedulerCommand>,
}

impl<C: NodeClient> Scheduler<C> {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn SchedulerStore>,
        selector: Arc<ResourceSelector<C>>,
        events: EventSink,
        dataspace: Option<Arc<dyn Dataspace>>,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(config.command_queue_depth);
        let handle = SchedulerHandle { tx: tx.clone() };
        let scheduler = Self {
            config,
            store,
            selector,
            executor: TaskExecutor::new(),
            events,
            dataspace,
            jobs: HashMap::new(),
            finished_jobs: Vec::new(),
            kill_tokens: HashMap::new(),
            task_tokens: HashMap::new(),
            dispatch_enabled: false,
            store_degraded: false,
            rx,
            tx,
        };
        (scheduler, handle)
    }

    /// Recovers persisted state, then runs the decision loop until
    /// `Shutdown`. Intended to be `tokio::spawn`ed.
    pub async fn run(mut self) -> Result<()> {
        self.recover()?;
        tracing::info!(jobs = self.jobs.len(), "Scheduler loop started (dispatch stopped)");

        while let Some(command) = self.rx.recv().await {
            let shutdown = self.handle_command(command).await;
            if shutdown {
                break;
            }
            if self.dispatch_enabled && !self.store_degraded {
                self.dispatch().await;
            }
        }
        tracing::info!("Scheduler loop exited");
        Ok(())
    }

    fn recover(&mut self) -> Result<()> {
        let coordinator = RecoveryCoordinator::new(self.store.clone());
        let recovered = coordinator.recover(self.config.finished_job_retention)?;
        for job in recovered.pending.into_iter().chain(recovered.running) {
            let id = job.id;
            self.kill_tokens.insert(id, CancellationToken::new());
            self.jobs.insert(id, Arc::new(Mutex::new(job)));
        }
        self.finished_jobs = recovered.finished.iter().map(|j| j.id).collect();
        Ok(())
    }

    async fn handle_command(&mut self, command: SchedulerCommand) -> bool {
        match command {
            SchedulerCommand::Submit { job, reply } => {
                let _ = reply.send(self.submit(job).await);
            }
            SchedulerCommand::KillJob { job_id, reply } => {
                let _ = reply.send(self.kill_job(job_id).await);
            }
            SchedulerCommand::PauseJob { job_id, reply } => {
                let _ = reply.send(self.pause_job(job_id).await);
            }
            SchedulerCommand::ResumeJob { job_id, reply } => {
                let _ = reply.send(self.resume_job(job_id).await);
            }
            SchedulerCommand::RemoveJob { job_id, reply } => {
                let _ = reply.send(self.remove_job(job_id).await);
            }
            SchedulerCommand::Start => {
                self.dispatch_enabled = true;
                tracing::info!("Dispatch started");
            }
            SchedulerCommand::Stop => {
                self.dispatch_enabled = false;
                tracing::info!("Dispatch stopped");
            }
            SchedulerCommand::TaskTerminated {
                job_id,
                task_id,
                result,
                nodes,
            } => {
                self.task_terminated(job_id, task_id, result, nodes).await;
            }
            SchedulerCommand::RestartTask { job_id, task_id } => {
                self.restart_task(job_id, task_id).await;
            }
            SchedulerCommand::JobSnapshot { job_id, reply } => {
                let snapshot = match self.jobs.get(&job_id) {
                    Some(job) => {
                        let job = job.lock().await;
                        Some(JobSnapshot {
                            status: job.status,
                            task_statuses: job.tasks().map(|t| (t.id, t.status)).collect(),
                            pending_tasks: job.number_of_pending_tasks(),
                            running_tasks: job.number_of_running_tasks(),
                            finished_tasks: job.number_of_finished_tasks(),
                        })
                    }
                    None => None,
                };
                let _ = reply.send(snapshot);
            }
            SchedulerCommand::Shutdown => {
                for token in self.kill_tokens.values() {
                    token.cancel();
                }
                return true;
            }
        }
        false
    }

    async fn submit(&mut self, mut job: InternalJob) -> Result<JobId> {
        job.validate()?;
        job.submit_action();
        self.persist(&job)?;

        let id = job.id;
        tracing::info!(job_id = %id, job_name = %job.name, tasks = job.task_count(), "Job submitted");
        self.events.job_status_changed(id, job.status);
        self.kill_tokens.insert(id, CancellationToken::new());
        self.jobs.insert(id, Arc::new(Mutex::new(job)));
        Ok(id)
    }

    async fn kill_job(&mut self, job_id: JobId) -> Result<()> {
        let job = self
            .jobs
            .get(&job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?
            .clone();
        let mut job = job.lock().await;
        if job.status.is_terminal() {
            return Ok(());
        }
        let aborted = job.kill();
        self.persist(&job)?;
        if let Some(token) = self.kill_tokens.get(&job_id) {
            token.cancel();
        }
        for task_id in &aborted {
            self.events
                .task_status_changed(job_id, *task_id, TaskStatus::Aborted);
        }
        self.events.job_status_changed(job_id, JobStatus::Killed);
        self.finished_jobs.push(job_id);
        tracing::info!(job_id = %job_id, "Job killed");
        Ok(())
    }

    async fn pause_job(&mut self, job_id: JobId) -> Result<()> {
        let job = self
            .jobs
            .get(&job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?
            .clone();
        let mut job = job.lock().await;
        if job.status.is_terminal() || job.status == JobStatus::Paused {
            return Ok(());
        }
        job.set_paused();
        self.persist(&job)?;
        self.events.job_status_changed(job_id, JobStatus::Paused);
        Ok(())
    }

    async fn resume_job(&mut self, job_id: JobId) -> Result<()> {
        let job = self
            .jobs
            .get(&job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?
            .clone();
        let mut job = job.lock().await;
        if job.status != JobStatus::Paused {
            return Ok(());
        }
        job.set_unpaused();
        self.persist(&job)?;
        self.events.job_status_changed(job_id, job.status);
        Ok(())
    }

    /// Removes a terminal job. The job leaves live memory only after the
    /// store confirms the removal.
    async fn remove_job(&mut self, job_id: JobId) -> Result<()> {
        if let Some(job) = self.jobs.get(&job_id) {
            let job = job.lock().await;
            if !job.status.is_terminal() {
                return Err(SchedulerError::Internal(format!(
                    "cannot remove job {job_id} in status {}",
                    job.status
                )));
            }
        }
        self.store.remove_job(job_id)?;
        self.jobs.remove(&job_id);
        self.kill_tokens.remove(&job_id);
        self.finished_jobs.retain(|id| *id != job_id);
        tracing::info!(job_id = %job_id, "Job removed");
        Ok(())
    }

    /// One dispatch cycle: collect ready tasks per job, reserve nodes, and
    /// spawn workers. Runs to completion before the loop sleeps again.
    async fn dispatch(&mut self) {
        let mut job_ids: Vec<JobId> = self.jobs.keys().copied().collect();
        job_ids.sort();

        for job_id in job_ids {
            let Some(job_arc) = self.jobs.get(&job_id).cloned() else {
                continue;
            };

            let (ready, skipped, status_change) = {
                let mut job = job_arc.lock().await;
                if job.status == JobStatus::Stalled {
                    // Dispatch resumed: stalled jobs go back to running.
                    job.status = JobStatus::Running;
                    let skipped = job.resolve_pruned_tasks();
                    (job.collect_ready_tasks(), skipped, Some(JobStatus::Running))
                } else if matches!(job.status, JobStatus::Pending | JobStatus::Running) {
                    let skipped = job.resolve_pruned_tasks();
                    (job.collect_ready_tasks(), skipped, None)
                } else {
                    continue;
                }
            };

            if let Some(new_status) = status_change {
                self.events.job_status_changed(job_id, new_status);
            }
            for task_id in &skipped {
                self.events
                    .task_status_changed(job_id, *task_id, TaskStatus::Skipped);
            }
            if !skipped.is_empty() {
                let job = job_arc.lock().await;
                if self.persist(&job).is_err() {
                    return;
                }
            }

            for task_id in ready {
                if self.store_degraded {
                    return;
                }
                self.dispatch_task(job_id, &job_arc, task_id).await;
            }
        }
    }

    async fn dispatch_task(&mut self, job_id: JobId, job_arc: &Arc<Mutex<InternalJob>>, task_id: TaskId) {
        // Node reservation happens without holding the job lock; the task
        // is started (or the nodes released) afterwards.
        let (policy, node_count) = {
            let job = job_arc.lock().await;
            let Ok(task) = job.task(task_id) else { return };
            let policy = match &task.selection_script {
                None => SelectionPolicy::NoFilter,
                Some(script) if task.dynamic_selection => SelectionPolicy::Dynamic(script.clone()),
                Some(script) => SelectionPolicy::Static(script.clone()),
            };
            (policy, task.node_count as usize)
        };

        let nodes = match self
            .selector
            .select_nodes(node_count, &policy, &HashSet::new())
            .await
        {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(job_id = %job_id, task_id = %task_id, error = %e, "Node selection failed");
                return;
            }
        };
        if nodes.len() < node_count {
            // Partial multi-host satisfaction is unusable; give the whole
            // reservation back and retry on a later wake-up.
            if let Err(e) = self.selector.release_nodes(&nodes) {
                tracing::error!(error = %e, "Failed to release partial reservation");
            }
            return;
        }

        let context = {
            let mut job = job_arc.lock().await;
            let previous = match job.parent_results(task_id) {
                Ok(results) => results,
                Err(e) => {
                    tracing::error!(job_id = %job_id, task_id = %task_id, error = %e, "Missing parent results");
                    let _ = self.selector.release_nodes(&nodes);
                    return;
                }
            };
            let now = Utc::now();
            if job.start_task(task_id, now).is_err() {
                // The task changed state while nodes were being reserved
                // (killed or paused meanwhile); put the nodes back.
                let _ = self.selector.release_nodes(&nodes);
                return;
            }
            if self.persist(&job).is_err() {
                let _ = self.selector.release_nodes(&nodes);
                return;
            }

            let flow_targets = job.flow_targets();
            let Ok(task) = job.task(task_id) else {
                let _ = self.selector.release_nodes(&nodes);
                return;
            };
            let mut variables = job.generic_variables.clone();
            variables.extend(task.variables.clone());
            TaskContext {
                job_id,
                job_name: job.name.clone(),
                task_id,
                task_name: task.name.clone(),
                iteration_index: task.iteration_index,
                replication_index: task.replication_index,
                variables,
                executable: task.executable.clone(),
                fork_environment: task.fork_environment.clone(),
                pre_script: task.pre_script.clone(),
                post_script: task.post_script.clone(),
                flow_script: task.flow_script.clone(),
                previous_results: previous,
                credentials: HashMap::new(),
                flow_targets,
                walltime: self.config.task_walltime,
            }
        };

        self.events
            .task_status_changed(job_id, task_id, TaskStatus::Running);

        let token = self
            .kill_tokens
            .get(&job_id)
            .map(|t| t.child_token())
            .unwrap_or_default();
        self.task_tokens.insert((job_id, task_id), token.clone());

        let executor = self.executor.clone();
        let dataspace = self.dataspace.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = executor
                .execute(context, dataspace.as_deref(), &token)
                .await;
            let _ = tx
                .send(SchedulerCommand::TaskTerminated {
                    job_id,
                    task_id,
                    result,
                    nodes,
                })
                .await;
        });
    }

    async fn task_terminated(
        &mut self,
        job_id: JobId,
        task_id: TaskId,
        result: crate::executor::context::TaskResultData,
        nodes: NodeSet,
    ) {
        if let Err(e) = self.selector.release_nodes(&nodes) {
            tracing::error!(error = %e, "Failed to release nodes after task termination");
        }
        self.task_tokens.remove(&(job_id, task_id));

        let Some(job_arc) = self.jobs.get(&job_id).cloned() else {
            return;
        };
        let mut job = job_arc.lock().await;
        let outcome = match job.terminate_task(task_id, result, Utc::now()) {
            Ok(outcome) => outcome,
            Err(e) => {
                // A worker of an already-killed job reporting in; its task
                // was aborted out from under it.
                tracing::debug!(job_id = %job_id, task_id = %task_id, error = %e, "Late task termination ignored");
                return;
            }
        };
        if self.persist(&job).is_err() {
            return;
        }

        self.events
            .task_status_changed(job_id, task_id, outcome.task_status);
        for skipped in &outcome.skipped {
            self.events
                .task_status_changed(job_id, *skipped, TaskStatus::Skipped);
        }
        for reset in &outcome.reset {
            self.events
                .task_status_changed(job_id, *reset, TaskStatus::Pending);
        }
        for aborted in &outcome.aborted {
            self.events
                .task_status_changed(job_id, *aborted, TaskStatus::Aborted);
        }

        if outcome.retry {
            let delay = self.restart_delay();
            let tx = self.tx.clone();
            tracing::info!(job_id = %job_id, task_id = %task_id, ?delay, "Task failed, scheduling restart");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx
                    .send(SchedulerCommand::RestartTask { job_id, task_id })
                    .await;
            });
        }

        if outcome.job_finished {
            self.events.job_status_changed(job_id, job.status);
            self.finished_jobs.push(job_id);
            if let Some(token) = self.kill_tokens.get(&job_id) {
                token.cancel();
            }
            tracing::info!(job_id = %job_id, status = %job.status, "Job completed");
        }
    }

    async fn restart_task(&mut self, job_id: JobId, task_id: TaskId) {
        let Some(job_arc) = self.jobs.get(&job_id).cloned() else {
            return;
        };
        let mut job = job_arc.lock().await;
        match job.restart_waiting_task(task_id) {
            Ok(()) => {
                if self.persist(&job).is_err() {
                    return;
                }
                self.events
                    .task_status_changed(job_id, task_id, TaskStatus::Pending);
            }
            Err(e) => {
                tracing::debug!(job_id = %job_id, task_id = %task_id, error = %e, "Restart skipped");
            }
        }
    }

    fn restart_delay(&self) -> Duration {
        let jitter_ms = self.config.task_restart_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.config.task_restart_delay + jitter
    }

    /// Hands the mutation to the store. On failure dispatch halts: the
    /// scheduler never proceeds on an update it cannot confirm persisted.
    fn persist(&mut self, job: &InternalJob) -> Result<()> {
        match self.store.update_job_and_tasks_state(job) {
            Ok(()) => {
                self.store_degraded = false;
                Ok(())
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Store update failed, halting dispatch");
                self.store_degraded = true;
                Err(e)
            }
        }
    }
}

/// Spawns a scheduler onto the current runtime and returns its handle and
/// join handle.
pub fn spawn<C: NodeClient>(
    config: SchedulerConfig,
    store: Arc<dyn SchedulerStore>,
    selector: Arc<ResourceSelector<C>>,
    events: EventSink,
    dataspace: Option<Arc<dyn Dataspace>>,
) -> (SchedulerHandle, JoinHandle<Result<()>>) {
    let (scheduler, handle) = Scheduler::new(config, store, selector, events, dataspace);
    let join = tokio::spawn(scheduler.run());
    (handle, join)
}
