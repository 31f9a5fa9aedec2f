//! Store contract consumed by the scheduler core.
//!
//! Persistence mechanics are opaque: the scheduler only needs the four
//! operations below, with read-your-writes consistency per job. A mutation
//! is committed only once the store call returns; on `StoreUnavailable` the
//! scheduler must not proceed as if the update had been persisted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{InternalJob, JobId};

pub trait SchedulerStore: Send + Sync {
    /// Jobs whose status is not terminal, with their full task state.
    fn load_not_finished_jobs(&self) -> Result<Vec<InternalJob>>;

    /// Terminal jobs whose last task finished within the window. `None`
    /// loads all of history.
    fn load_finished_jobs(&self, since: Option<DateTime<Utc>>) -> Result<Vec<InternalJob>>;

    /// Durably records the job and all of its tasks.
    fn update_job_and_tasks_state(&self, job: &InternalJob) -> Result<()>;

    fn remove_job(&self, id: JobId) -> Result<()>;
}

/// Latest finished timestamp across a job's tasks; keys the retention window.
fn job_finished_time(job: &InternalJob) -> Option<DateTime<Utc>> {
    job.tasks().filter_map(|t| t.finished_time()).max()
}

/// In-memory store. The default backing for tests and embedded use.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: Mutex<HashMap<JobId, InternalJob>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        match self.jobs.lock() {
            Ok(jobs) => jobs.len(),
            Err(_) => 0,
        }
    }
}

impl SchedulerStore for InMemoryStore {
    fn load_not_finished_jobs(&self) -> Result<Vec<InternalJob>> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("store lock poisoned".into()))?;
        let mut result: Vec<InternalJob> = jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect();
        result.sort_by_key(|j| j.id);
        Ok(result)
    }

    fn load_finished_jobs(&self, since: Option<DateTime<Utc>>) -> Result<Vec<InternalJob>> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("store lock poisoned".into()))?;
        let mut result: Vec<InternalJob> = jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .filter(|j| match (since, job_finished_time(j)) {
                (Some(cutoff), Some(finished)) => finished >= cutoff,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect();
        result.sort_by_key(|j| j.id);
        Ok(result)
    }

    fn update_job_and_tasks_state(&self, job: &InternalJob) -> Result<()> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("store lock poisoned".into()))?;
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn remove_job(&self, id: JobId) -> Result<()> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("store lock poisoned".into()))?;
        jobs.remove(&id);
        Ok(())
    }
}

/// JSON-file store: one file holding every job, rewritten on each update.
/// Good enough for small deployments and crash-recovery testing.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<HashMap<JobId, InternalJob>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SchedulerError::StoreUnavailable(format!("corrupt store file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(SchedulerError::StoreUnavailable(format!(
                "cannot read store file: {e}"
            ))),
        }
    }

    fn write_all(&self, jobs: &HashMap<JobId, InternalJob>) -> Result<()> {
        let bytes = serde_json::to_vec(jobs)
            .map_err(|e| SchedulerError::StoreUnavailable(format!("cannot encode store: {e}")))?;
        std::fs::write(&self.path, bytes)
            .map_err(|e| SchedulerError::StoreUnavailable(format!("cannot write store file: {e}")))
    }
}

impl SchedulerStore for JsonFileStore {
    fn load_not_finished_jobs(&self) -> Result<Vec<InternalJob>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("store lock poisoned".into()))?;
        let mut result: Vec<InternalJob> = self
            .read_all()?
            .into_values()
            .filter(|j| !j.status.is_terminal())
            .collect();
        result.sort_by_key(|j| j.id);
        Ok(result)
    }

    fn load_finished_jobs(&self, since: Option<DateTime<Utc>>) -> Result<Vec<InternalJob>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("store lock poisoned".into()))?;
        let mut result: Vec<InternalJob> = self
            .read_all()?
            .into_values()
            .filter(|j| j.status.is_terminal())
            .filter(|j| match (since, job_finished_time(j)) {
                (Some(cutoff), Some(finished)) => finished >= cutoff,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();
        result.sort_by_key(|j| j.id);
        Ok(result)
    }

    fn update_job_and_tasks_state(&self, job: &InternalJob) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("store lock poisoned".into()))?;
        let mut jobs = self.read_all()?;
        jobs.insert(job.id, job.clone());
        self.write_all(&jobs)
    }

    fn remove_job(&self, id: JobId) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| SchedulerError::StoreUnavailable("store lock poisoned".into()))?;
        let mut jobs = self.read_all()?;
        jobs.remove(&id);
        self.write_all(&jobs)
    }
}
