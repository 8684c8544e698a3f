//! Bounded, priority-ordered task queue.
//!
//! Tasks accumulate as Pending until [`TaskQueue::drain_and_execute`] takes the
//! whole pending set, orders it by priority (highest first, admission order on
//! ties) and dispatches it through the [`ChildSpawner`] worker pool.
//!
//! **Concurrency model:** all bookkeeping sits behind one `Mutex` that is never
//! held across an `.await`. The queue is private to its process; nothing here
//! is shared with other instances.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::spawner::ChildSpawner;
use super::types::{ChildResult, QueueStatus, Task, TaskId, TaskSpec, TaskStatus};
use crate::error::{BatchEnqueueError, DelegationError};

#[derive(Default)]
struct QueueState {
    next_id: TaskId,
    /// Pending task ids in admission order.
    pending: Vec<TaskId>,
    /// Every task admitted since the last `forget_finished`, for result lookup.
    tasks: BTreeMap<TaskId, Task>,
}

pub struct TaskQueue {
    state: Mutex<QueueState>,
    spawner: Arc<ChildSpawner>,
    max_queued: usize,
}

impl TaskQueue {
    pub fn new(spawner: Arc<ChildSpawner>, max_queued: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_id: 1,
                ..Default::default()
            }),
            spawner,
            max_queued,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit one task as Pending, or refuse if the pending set is full.
    pub fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, DelegationError> {
        let mut state = self.state();
        if state.pending.len() >= self.max_queued {
            tracing::warn!(max_queued = self.max_queued, "Task queue full, rejecting enqueue");
            return Err(DelegationError::Capacity {
                max: self.max_queued,
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        tracing::info!(task_id = id, agent = %spec.agent_kind, priority = spec.priority, "Task queued");
        state.pending.push(id);
        state.tasks.insert(id, Task::new(id, spec));
        Ok(id)
    }

    /// Enqueue each spec in order. Not transactional: on a capacity failure
    /// the tasks admitted so far stay queued and are reported in the error.
    pub fn enqueue_batch(&self, specs: Vec<TaskSpec>) -> Result<Vec<TaskId>, BatchEnqueueError> {
        let attempted = specs.len();
        let mut enqueued = Vec::with_capacity(attempted);
        for spec in specs {
            match self.enqueue(spec) {
                Ok(id) => enqueued.push(id),
                Err(error) => {
                    return Err(BatchEnqueueError {
                        enqueued,
                        attempted,
                        error,
                    });
                }
            }
        }
        Ok(enqueued)
    }

    /// Take every Pending task, run them in priority order with the spawner's
    /// parallelism, and return results in dispatch order.
    ///
    /// Tasks enqueued while this runs form the next batch.
    pub async fn drain_and_execute(&self, timeout: Duration) -> Vec<ChildResult> {
        let (ids, specs) = {
            let mut state = self.state();
            let mut ids = std::mem::take(&mut state.pending);
            // sort_by_key is stable: equal priorities keep admission order.
            ids.sort_by_key(|id| Reverse(state.tasks.get(id).map_or(i64::MIN, |t| t.spec.priority)));

            let mut specs = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(task) = state.tasks.get_mut(id) {
                    if let Err(e) = task.transition(TaskStatus::Running) {
                        tracing::error!(task_id = id, "{}", e);
                    }
                    specs.push(task.spec.clone());
                }
            }
            (ids, specs)
        };

        if specs.is_empty() {
            return Vec::new();
        }
        tracing::info!(count = specs.len(), "Dispatching queued tasks");

        self.spawner
            .run_parallel_with(&specs, timeout, |idx, result| {
                let id = ids[idx];
                let mut state = self.state();
                if let Some(task) = state.tasks.get_mut(&id) {
                    let next = if result.success {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Failed
                    };
                    if let Err(e) = task.transition(next) {
                        tracing::error!(task_id = id, "{}", e);
                    }
                    task.result = Some(result.clone());
                }
            })
            .await
    }

    /// Snapshot of queue occupancy and recursion budget.
    pub fn status(&self) -> QueueStatus {
        let pending_count = self.state().pending.len();
        let ctx = self.spawner.context();
        QueueStatus {
            pending_count,
            max_queued: self.max_queued,
            max_parallel: self.spawner.max_parallel(),
            current_depth: ctx.current_depth,
            max_depth: ctx.max_depth,
            can_spawn: ctx.can_spawn(),
        }
    }

    /// Cancel every Pending task. Running tasks are unaffected.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.pending);
        let mut cancelled = 0;
        for id in pending {
            if let Some(task) = state.tasks.get_mut(&id) {
                if task.transition(TaskStatus::Cancelled).is_ok() {
                    cancelled += 1;
                }
            }
        }
        tracing::info!(cancelled, "Cleared pending tasks");
        cancelled
    }

    /// Look up a task admitted to this queue.
    pub fn get(&self, id: TaskId) -> Result<Task, DelegationError> {
        self.state()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(DelegationError::UnknownTask(id))
    }

    /// Drop retained records of tasks that reached a terminal state.
    pub fn forget_finished(&self) -> usize {
        let mut state = self.state();
        let before = state.tasks.len();
        state.tasks.retain(|_, t| !t.status.is_terminal());
        before - state.tasks.len()
    }
}
