//! Startup recovery: rebuilds in-memory scheduling state from the store.
//!
//! Finished/aborted tasks are replayed through the job state machine in
//! finished-time order, so the dependency-resolution state ends up exactly
//! as it would have been had the scheduler never stopped. Tasks that were
//! RUNNING at crash time are treated as never started. Recovery is
//! idempotent over an unchanged store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{InternalJob, JobId, JobStatus};
use crate::scheduler::sorter;
use crate::scheduler::store::SchedulerStore;
use crate::scheduler::task::{InternalTask, TaskId, TaskStatus};

/// The three buckets a scheduler restart reconstructs.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub pending: Vec<InternalJob>,
    pub running: Vec<InternalJob>,
    pub finished: Vec<InternalJob>,
}

pub struct RecoveryCoordinator {
    store: Arc<dyn SchedulerStore>,
}

impl RecoveryCoordinator {
    pub fn new(store: Arc<dyn SchedulerStore>) -> Self {
        Self { store }
    }

    /// Loads and reclassifies all jobs. `retention` bounds how much
    /// finished-job history is brought back.
    pub fn recover(&self, retention: Option<Duration>) -> Result<RecoveredState> {
        let not_finished = self.store.load_not_finished_jobs()?;

        let mut pending: Vec<InternalJob> = Vec::new();
        let mut running: Vec<InternalJob> = Vec::new();
        let mut finished: Vec<InternalJob> = Vec::new();

        for mut job in not_finished {
            JobId::ensure_above(job.id);
            match job.status {
                JobStatus::Pending => pending.push(job),
                JobStatus::Running | JobStatus::Stalled => {
                    running_tasks_to_pending(&mut job);
                    running.push(job);
                }
                JobStatus::Paused => {
                    // A paused job that never started goes back to the
                    // pending bucket; one with any task history is treated
                    // as running so its terminal tasks get replayed.
                    let touched = job.number_of_pending_tasks()
                        + job.number_of_running_tasks()
                        + job.number_of_finished_tasks();
                    if touched == 0 {
                        pending.push(job);
                    } else {
                        running_tasks_to_pending(&mut job);
                        running.push(job);
                    }
                }
                other => {
                    return Err(SchedulerError::RecoveryInconsistency(
                        job.id,
                        format!("unexpected not-finished job status: {other}"),
                    ));
                }
            }
        }

        let mut recovered_running = Vec::with_capacity(running.len());
        for mut job in running {
            match replay_job(&mut job) {
                Ok(()) => {
                    if job.status == JobStatus::Running || job.status == JobStatus::Paused {
                        // The scheduler starts in stopped mode; nothing is
                        // dispatched until it is explicitly started. The
                        // single status field cannot carry "paused over
                        // stalled", so a paused job stays Paused (re-pausing
                        // the demoted tasks) and only running jobs surface
                        // as Stalled.
                        if job.status == JobStatus::Paused {
                            job.set_paused();
                        } else {
                            job.status = JobStatus::Stalled;
                        }
                        job.refresh_counters();
                        job.fold_running_into_pending();
                    }
                    recovered_running.push(job);
                }
                Err(e) => {
                    tracing::error!(
                        job_id = %job.id,
                        job_name = %job.name,
                        error = %e,
                        "Failed to recover job, job might be in an inconsistent state"
                    );
                    // Excise the corrupt job rather than aborting recovery.
                    job.status = JobStatus::Canceled;
                    self.store.update_job_and_tasks_state(&job)?;
                    finished.push(job);
                }
            }
        }

        for job in &mut pending {
            if job.status == JobStatus::Paused {
                job.set_paused();
            }
        }

        let since = retention.and_then(|window| {
            chrono::Duration::from_std(window)
                .ok()
                .map(|w| Utc::now() - w)
        });
        // Jobs canceled by this very pass are already terminal in the store;
        // don't load them a second time.
        let excised: Vec<JobId> = finished.iter().map(|j| j.id).collect();
        finished.extend(
            self.store
                .load_finished_jobs(since)?
                .into_iter()
                .filter(|j| !excised.contains(&j.id)),
        );

        Ok(RecoveredState {
            pending,
            running: recovered_running,
            finished,
        })
    }
}

/// No executor survived the restart: anything RUNNING never really started.
fn running_tasks_to_pending(job: &mut InternalJob) {
    for task in job.tasks_mut() {
        if task.status == TaskStatus::Running {
            task.status = TaskStatus::Pending;
        }
    }
}

/// Replays the job's terminal tasks in finished-time order to rebuild the
/// dependency state machine.
fn replay_job(job: &mut InternalJob) -> Result<()> {
    let terminal: Vec<&InternalTask> = job
        .tasks()
        .filter(|t| {
            matches!(
                t.status,
                TaskStatus::Aborted
                    | TaskStatus::Failed
                    | TaskStatus::Finished
                    | TaskStatus::Faulty
                    | TaskStatus::Skipped
            )
        })
        .collect();
    let replay_order: Vec<TaskId> = sorter::sort(&terminal)?;

    for id in replay_order {
        job.recover_task(id)?;
    }
    Ok(())
}
