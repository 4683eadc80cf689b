//! Task registry and lifecycle state machine.
//!
//! The manager is the sole mutator of scheduling state: arena-style maps
//! keyed by task id, dependency edges in both directions, and the stored
//! results. Workers get cloned snapshots and report outcomes back here.
//! All operations take one short critical section; the lock is never held
//! across a task execution.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::{SchedulerError, ValidationError};
use crate::graph::DependencyGraph;
use crate::task::{Priority, Task, TaskId, TaskResult, TaskStatus};

#[derive(Default)]
struct ManagerState {
    tasks: HashMap<TaskId, Task>,
    results: HashMap<TaskId, TaskResult>,
    graph: DependencyGraph,
    /// Terminal task ids in completion order; drives eviction.
    recent: VecDeque<TaskId>,
}

impl ManagerState {
    /// Pending with every dependency result completed.
    fn ready(&self, id: TaskId) -> bool {
        let Some(task) = self.tasks.get(&id) else {
            return false;
        };
        if task.status != TaskStatus::Pending {
            return false;
        }
        self.graph.dependencies(id).all(|dep| {
            self.results
                .get(&dep)
                .map(|r| r.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Record a terminal id and evict the oldest entries beyond the limit.
    ///
    /// Eviction removes the task from every map, so a later submission may
    /// only depend on results still inside the history window.
    fn push_recent(&mut self, id: TaskId, limit: usize) {
        self.recent.push_back(id);
        while self.recent.len() > limit {
            if let Some(old) = self.recent.pop_front() {
                self.tasks.remove(&old);
                self.results.remove(&old);
                self.graph.remove(old);
            }
        }
    }
}

/// Owner of all submitted tasks and their results.
pub struct TaskManager {
    state: Mutex<ManagerState>,
    /// Woken on every terminal transition; `wait_for` listens here.
    completion: Notify,
    history_limit: usize,
}

impl TaskManager {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
            completion: Notify::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Store a task and its dependency edges.
    ///
    /// Rejects duplicate ids, edges to unknown tasks, and edges that would
    /// close a dependency cycle.
    pub async fn register(&self, task: Task) -> Result<(), ValidationError> {
        let mut st = self.state.lock().await;

        if st.tasks.contains_key(&task.id) || st.results.contains_key(&task.id) {
            return Err(ValidationError::DuplicateTask(task.id));
        }
        for dep in &task.depends_on {
            if !st.tasks.contains_key(dep) {
                return Err(ValidationError::UnknownDependency {
                    task: task.id,
                    missing: *dep,
                });
            }
        }
        if let Some(cycle) = st.graph.find_cycle(task.id, &task.depends_on) {
            return Err(ValidationError::CircularDependency(cycle));
        }

        debug!(task = %task.id, kind = %task.kind, deps = task.depends_on.len(), "registered task");
        st.graph.insert(task.id, &task.depends_on);
        st.tasks.insert(task.id, task);
        Ok(())
    }

    /// Whether the task could be dequeued right now.
    pub async fn is_ready(&self, id: TaskId) -> bool {
        self.state.lock().await.ready(id)
    }

    /// `Pending → Running` transition, claiming the task for `worker`.
    /// Returns a snapshot to execute, or `None` when the task is no longer
    /// pending (cancelled while queued, already claimed, evicted).
    pub async fn start(&self, id: TaskId, worker: &str) -> Option<Task> {
        let mut st = self.state.lock().await;
        let task = st.tasks.get_mut(&id)?;
        if task.status != TaskStatus::Pending {
            return None;
        }
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.worker = Some(worker.to_string());
        Some(task.clone())
    }

    /// `Running → Pending` for another attempt, if the budget allows.
    /// Returns the new attempt count.
    pub async fn retry(&self, id: TaskId) -> Option<u32> {
        let mut st = self.state.lock().await;
        let task = st.tasks.get_mut(&id)?;
        if task.status != TaskStatus::Running || task.retry_count >= task.max_retries {
            return None;
        }
        task.retry_count += 1;
        task.status = TaskStatus::Pending;
        task.started_at = None;
        task.worker = None;
        Some(task.retry_count)
    }

    /// Record a terminal result and return the dependents that just became
    /// ready, with their priorities for re-enqueueing.
    ///
    /// Exactly-once: if the task already reached a terminal state (e.g. a
    /// cancellation raced the worker), the stored result stands and no
    /// dependents are returned. Atomic with respect to concurrent
    /// completions of sibling dependencies — a dependent is returned by
    /// precisely the completion that satisfied its last edge.
    pub async fn complete(&self, id: TaskId, result: TaskResult) -> Vec<(TaskId, Priority)> {
        let mut ready = Vec::new();
        {
            let mut st = self.state.lock().await;
            let Some(task) = st.tasks.get_mut(&id) else {
                return ready;
            };
            if task.status.is_terminal() {
                return ready;
            }
            task.status = result.status;
            task.completed_at = Some(result.completed_at);

            let completed = result.status == TaskStatus::Completed;
            st.results.insert(id, result);
            st.push_recent(id, self.history_limit);

            if completed {
                let dependents: Vec<TaskId> = st.graph.dependents(id).collect();
                for dep_id in dependents {
                    if st.ready(dep_id) {
                        let priority = st.tasks[&dep_id].priority;
                        ready.push((dep_id, priority));
                    }
                }
            }
        }
        self.completion.notify_waiters();
        ready
    }

    /// Cancel `id` and its full transitive-dependent closure, skipping
    /// entries already terminal. The closure is walked through terminal
    /// nodes too: a pending grandchild behind a completed child is still
    /// cancelled. Returns the ids actually changed.
    pub async fn cancel(&self, id: TaskId) -> Vec<TaskId> {
        let mut changed = Vec::new();
        {
            let mut st = self.state.lock().await;
            if !st.tasks.contains_key(&id) {
                return changed;
            }

            let mut targets = vec![id];
            targets.extend(st.graph.transitive_dependents(id));

            for target in targets {
                let skip = match st.tasks.get(&target) {
                    Some(task) => task.status.is_terminal(),
                    None => true,
                };
                if skip {
                    continue;
                }

                let reason = if target == id {
                    "cancelled".to_string()
                } else {
                    format!("cancelled: upstream task {id} was cancelled")
                };
                if let Some(task) = st.tasks.get_mut(&target) {
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(Utc::now());
                }
                st.results.insert(target, TaskResult::cancelled(target, reason));
                st.push_recent(target, self.history_limit);
                changed.push(target);
            }
        }
        if !changed.is_empty() {
            debug!(task = %id, cascade = changed.len(), "cancelled task(s)");
            self.completion.notify_waiters();
        }
        changed
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(&id).cloned()
    }

    pub async fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.state.lock().await.tasks.get(&id).map(|t| t.status)
    }

    pub async fn get_result(&self, id: TaskId) -> Option<TaskResult> {
        self.state.lock().await.results.get(&id).cloned()
    }

    /// Await the task's terminal result. `timeout = None` waits
    /// indefinitely. Reads after completion are idempotent — the stored
    /// result is returned as-is, however many times it is asked for.
    pub async fn wait_for(
        &self,
        id: TaskId,
        timeout: Option<Duration>,
    ) -> Result<TaskResult, SchedulerError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        {
            let st = self.state.lock().await;
            if !st.tasks.contains_key(&id) && !st.results.contains_key(&id) {
                return Err(SchedulerError::NotFound(id));
            }
        }

        loop {
            // Arm the listener before checking, so a completion landing
            // between the check and the await cannot be missed.
            let notified = self.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.get_result(id).await {
                return Ok(result);
            }

            match deadline {
                Some(deadline) => {
                    tokio::time::timeout_at(deadline, notified)
                        .await
                        .map_err(|_| SchedulerError::WaitTimeout {
                            task: id,
                            timeout: timeout.unwrap_or_default(),
                        })?;
                }
                None => notified.await,
            }
        }
    }
}
