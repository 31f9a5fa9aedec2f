//! Crash-recovery tests: bucketing, replay, excision, and retention,
//! exercised against both store backends.


use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gridsched::executor::context::TaskResultData;
use gridsched::scheduler::job::{InternalJob, JobStatus};
use gridsched::scheduler::recovery::RecoveryCoordinator;
use gridsched::scheduler::store::{InMemoryStore, JsonFileStore, SchedulerStore};
use gridsched::scheduler::task::{TaskId, TaskStatus};
use test_harness::{empty_store, script_task};

fn finish(job: &mut InternalJob, id: TaskId) {
    job.start_task(id, Utc::now()).unwrap();
    let result = TaskResultData::with_value(id, "ok", Duration::from_millis(1));
    job.terminate_task(id, result, Utc::now()).unwrap();
}

/// A RUNNING job persisted mid-flight: `a` finished, `b` caught executing.
fn half_done_job() -> (InternalJob, TaskId, TaskId) {
    let mut job = InternalJob::new("half-done", "admin");
    let a = script_task(&mut job, "a", "true", &[]);
    let b = script_task(&mut job, "b", "true", &[a]);
    job.submit_action();
    finish(&mut job, a);
    job.start_task(b, Utc::now()).unwrap();
    (job, a, b)
}

#[test]
fn pending_jobs_land_in_the_pending_bucket() {
    let store = empty_store();
    let mut job = InternalJob::new("fresh", "admin");
    script_task(&mut job, "a", "true", &[]);
    job.submit_action();
    store.update_job_and_tasks_state(&job).unwrap();

    let state = RecoveryCoordinator::new(store).recover(None).unwrap();
    assert_eq!(state.pending.len(), 1);
    assert!(state.running.is_empty());
    assert!(state.finished.is_empty());
    assert_eq!(state.pending[0].status, JobStatus::Pending);
}

#[test]
fn running_tasks_are_demoted_to_pending() {
    let store = empty_store();
    let (job, a, b) = half_done_job();
    store.update_job_and_tasks_state(&job).unwrap();

    let state = RecoveryCoordinator::new(store).recover(None).unwrap();
    assert_eq!(state.running.len(), 1);
    let recovered = &state.running[0];

    // No executor survived the restart: b never really started.
    assert_eq!(recovered.task(b).unwrap().status, TaskStatus::Pending);
    assert_eq!(recovered.task(a).unwrap().status, TaskStatus::Finished);
    // Dispatch has not resumed yet.
    assert_eq!(recovered.status, JobStatus::Stalled);
    assert_eq!(recovered.number_of_pending_tasks(), 1);
    assert_eq!(recovered.number_of_running_tasks(), 0);
    assert_eq!(recovered.number_of_finished_tasks(), 1);
}

#[test]
fn replay_preserves_finished_timestamps() {
    let store = empty_store();
    let (job, a, _) = half_done_job();
    let finished_at = job.task(a).unwrap().finished_time();
    store.update_job_and_tasks_state(&job).unwrap();

    let state = RecoveryCoordinator::new(store).recover(None).unwrap();
    assert_eq!(state.running[0].task(a).unwrap().finished_time(), finished_at);
}

#[test]
fn recovery_is_idempotent_over_an_unchanged_store() {
    let store = empty_store();
    let (job, _, _) = half_done_job();
    store.update_job_and_tasks_state(&job).unwrap();

    let first = RecoveryCoordinator::new(store.clone()).recover(None).unwrap();
    let second = RecoveryCoordinator::new(store).recover(None).unwrap();

    assert_eq!(first.pending.len(), second.pending.len());
    assert_eq!(first.running.len(), second.running.len());
    assert_eq!(first.finished.len(), second.finished.len());
    for (x, y) in first.running.iter().zip(&second.running) {
        assert_eq!(x.id, y.id);
        assert_eq!(x.status, y.status);
        for task in x.tasks() {
            assert_eq!(task.status, y.task(task.id).unwrap().status);
        }
    }
}

#[test]
fn paused_job_with_history_stays_paused() {
    let store = empty_store();
    let mut job = InternalJob::new("paused", "admin");
    let a = script_task(&mut job, "a", "true", &[]);
    let b = script_task(&mut job, "b", "true", &[a]);
    job.submit_action();
    finish(&mut job, a);
    job.set_paused();
    store.update_job_and_tasks_state(&job).unwrap();

    let state = RecoveryCoordinator::new(store).recover(None).unwrap();
    assert_eq!(state.running.len(), 1);
    let recovered = &state.running[0];
    assert_eq!(recovered.status, JobStatus::Paused);
    assert_eq!(recovered.task(a).unwrap().status, TaskStatus::Finished);
    assert_eq!(recovered.task(b).unwrap().status, TaskStatus::Paused);
}

#[test]
fn untouched_paused_job_goes_through_the_pending_bucket() {
    let store = empty_store();
    // Paused before the submit action ever ran: no task history at all.
    let mut job = InternalJob::new("paused-early", "admin");
    script_task(&mut job, "a", "true", &[]);
    job.status = JobStatus::Paused;
    store.update_job_and_tasks_state(&job).unwrap();

    let state = RecoveryCoordinator::new(store).recover(None).unwrap();
    assert_eq!(state.pending.len(), 1);
    assert!(state.running.is_empty());
    assert_eq!(state.pending[0].status, JobStatus::Paused);
}

#[test]
fn corrupt_job_is_excised_to_canceled() {
    let store = empty_store();

    // b recorded as finished while its parent a never ran: the persisted
    // state contradicts the dependency order.
    let mut corrupt = InternalJob::new("corrupt", "admin");
    let a = script_task(&mut corrupt, "a", "true", &[]);
    let b = script_task(&mut corrupt, "b", "true", &[a]);
    corrupt.submit_action();
    finish(&mut corrupt, b);
    assert_eq!(corrupt.task(a).unwrap().status, TaskStatus::Pending);
    let corrupt_id = corrupt.id;
    store.update_job_and_tasks_state(&corrupt).unwrap();

    let (healthy, _, _) = half_done_job();
    let healthy_id = healthy.id;
    store.update_job_and_tasks_state(&healthy).unwrap();

    let state = RecoveryCoordinator::new(store.clone()).recover(None).unwrap();

    // One bad job never aborts recovery of the others.
    assert_eq!(state.running.len(), 1);
    assert_eq!(state.running[0].id, healthy_id);

    assert_eq!(state.finished.len(), 1);
    assert_eq!(state.finished[0].id, corrupt_id);
    assert_eq!(state.finished[0].status, JobStatus::Canceled);

    // The cancellation was persisted, not just held in memory.
    let persisted = store.load_finished_jobs(None).unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].status, JobStatus::Canceled);
}

#[test]
fn abort_cascade_beside_a_pending_co_parent_recovers_cleanly() {
    let store = empty_store();

    // d has two parents. When f turns faulty, d is aborted unrun while p
    // has not even started; the scheduler persists exactly this shape, so
    // replay must accept an aborted task with a live co-parent.
    let mut job = InternalJob::new("co-parent", "admin");
    let f = script_task(&mut job, "f", "false", &[]);
    let p = script_task(&mut job, "p", "true", &[]);
    let d = script_task(&mut job, "d", "true", &[f, p]);
    job.submit_action();
    job.start_task(f, Utc::now()).unwrap();
    let failure = TaskResultData::with_exception(f, "boom", Duration::from_millis(1));
    job.terminate_task(f, failure, Utc::now()).unwrap();
    assert_eq!(job.task(d).unwrap().status, TaskStatus::Aborted);
    assert_eq!(job.task(p).unwrap().status, TaskStatus::Pending);
    assert_eq!(job.status, JobStatus::Running);
    store.update_job_and_tasks_state(&job).unwrap();

    let state = RecoveryCoordinator::new(store.clone()).recover(None).unwrap();

    // The job is healthy and lands in the running bucket, not excised.
    assert!(state.finished.is_empty());
    assert_eq!(state.running.len(), 1);
    let recovered = &state.running[0];
    assert_eq!(recovered.status, JobStatus::Stalled);
    assert_eq!(recovered.task(f).unwrap().status, TaskStatus::Faulty);
    assert_eq!(recovered.task(d).unwrap().status, TaskStatus::Aborted);
    assert_eq!(recovered.task(p).unwrap().status, TaskStatus::Pending);
    assert!(store.load_not_finished_jobs().unwrap().iter().any(|j| j.id == job.id));
}

#[test]
fn retention_window_bounds_finished_history() {
    let store = empty_store();

    let mut old = InternalJob::new("old", "admin");
    let t = script_task(&mut old, "a", "true", &[]);
    old.submit_action();
    finish(&mut old, t);
    assert_eq!(old.status, JobStatus::Finished);
    old.task_mut(t)
        .unwrap()
        .restore_finished_time(Some(Utc::now() - chrono::Duration::days(30)));
    store.update_job_and_tasks_state(&old).unwrap();

    let mut recent = InternalJob::new("recent", "admin");
    let t = script_task(&mut recent, "a", "true", &[]);
    recent.submit_action();
    finish(&mut recent, t);
    let recent_id = recent.id;
    store.update_job_and_tasks_state(&recent).unwrap();

    let bounded = RecoveryCoordinator::new(store.clone())
        .recover(Some(Duration::from_secs(24 * 3600)))
        .unwrap();
    assert_eq!(bounded.finished.len(), 1);
    assert_eq!(bounded.finished[0].id, recent_id);

    let unbounded = RecoveryCoordinator::new(store).recover(None).unwrap();
    assert_eq!(unbounded.finished.len(), 2);
}

#[test]
fn json_file_store_survives_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.json");

    {
        let store = JsonFileStore::new(path.clone());
        let (job, _, _) = half_done_job();
        store.update_job_and_tasks_state(&job).unwrap();

        let mut done = InternalJob::new("done", "admin");
        let t = script_task(&mut done, "a", "true", &[]);
        done.submit_action();
        finish(&mut done, t);
        store.update_job_and_tasks_state(&done).unwrap();
    }

    // A fresh handle on the same file sees everything.
    let reopened = Arc::new(JsonFileStore::new(path));
    let state = RecoveryCoordinator::new(reopened).recover(None).unwrap();
    assert_eq!(state.running.len(), 1);
    assert_eq!(state.finished.len(), 1);
    assert_eq!(state.running[0].name, "half-done");
    assert_eq!(state.finished[0].name, "done");
}

#[test]
fn json_file_store_starts_empty_on_a_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("absent.json"));
    assert!(store.load_not_finished_jobs().unwrap().is_empty());
    assert!(store.load_finished_jobs(None).unwrap().is_empty());
}

#[test]
fn in_memory_store_backs_recovery() {
    let store = Arc::new(InMemoryStore::new());
    let (job, _, _) = half_done_job();
    store.update_job_and_tasks_state(&job).unwrap();
    assert_eq!(store.job_count(), 1);

    let state = RecoveryCoordinator::new(store).recover(None).unwrap();
    assert_eq!(state.running.len(), 1);
}
