//! Dependency-order sorting of task sets.
//!
//! Used by the live scheduling loop (submission-order tie-break) and by
//! recovery replay (finished-time tie-break). The tie-break is never
//! arbitrary so that replaying the same store state twice yields the same
//! order.

use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::scheduler::task::{InternalTask, TaskId};

/// Sort key: finished time ascending when present, then task id (submission
/// order). Wrapped for the max-heap so `pop` yields the minimum.
#[derive(PartialEq, Eq)]
struct ReadyEntry {
    finished: Option<DateTime<Utc>>,
    id: TaskId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap. Tasks without a finished time
        // sort after all timestamped ones.
        let this = (self.finished.is_none(), self.finished, self.id);
        let that = (other.finished.is_none(), other.finished, other.id);
        that.cmp(&this)
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Orders the given tasks so every task appears after all of its
/// dependencies. Dependencies pointing outside the given set are ignored
/// (recovery sorts the terminal subset only).
///
/// Cycles are validated away at submission; a cycle here is an
/// internal-consistency failure, not a user error.
pub fn sort(tasks: &[&InternalTask]) -> Result<Vec<TaskId>> {
    let in_set: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();

    let mut remaining_deps: HashMap<TaskId, usize> = HashMap::new();
    let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for task in tasks {
        let deps = task
            .dependences
            .iter()
            .filter(|d| in_set.contains(d))
            .count();
        remaining_deps.insert(task.id, deps);
        for dep in &task.dependences {
            if in_set.contains(dep) {
                dependents.entry(*dep).or_default().push(task.id);
            }
        }
    }

    let by_id: HashMap<TaskId, &InternalTask> = tasks.iter().map(|t| (t.id, *t)).collect();
    let mut ready: BinaryHeap<ReadyEntry> = tasks
        .iter()
        .filter(|t| remaining_deps[&t.id] == 0)
        .map(|t| ReadyEntry {
            finished: t.finished_time(),
            id: t.id,
        })
        .collect();

    let mut ordered = Vec::with_capacity(tasks.len());
    while let Some(entry) = ready.pop() {
        ordered.push(entry.id);
        if let Some(children) = dependents.get(&entry.id) {
            for child in children.clone() {
                let remaining = remaining_deps
                    .get_mut(&child)
                    .ok_or_else(|| SchedulerError::Internal(format!("unknown task {child}")))?;
                *remaining -= 1;
                if *remaining == 0 {
                    let task = by_id[&child];
                    ready.push(ReadyEntry {
                        finished: task.finished_time(),
                        id: child,
                    });
                }
            }
        }
    }

    if ordered.len() != tasks.len() {
        let stuck = tasks
            .iter()
            .map(|t| t.id)
            .find(|id| !ordered.contains(id))
            .unwrap_or(TaskId(0));
        return Err(SchedulerError::CyclicDependency(stuck));
    }

    Ok(ordered)
}
