use crate::types::{FailureReason, Task, TaskStatus};
use chrono::{DateTime, Utc};
use conductor_core::{AgentId, AllocationId, ConductorError, ConductorResult, TaskId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Ordering key of a pending task: priority descending, then earliest
/// deadline (tasks without a deadline last), then submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueKey {
    priority: i32,
    deadline: Option<DateTime<Utc>>,
    seq: u64,
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| match (self.deadline, other.deadline) {
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct QueueState {
    /// Every known task, pending, active or terminal.
    tasks: HashMap<TaskId, Task>,
    /// Pending tasks in dispatch order.
    pending: BTreeMap<QueueKey, TaskId>,
    /// Keys are kept for a task's whole life so a requeued task returns to
    /// its original FIFO position.
    keys: HashMap<TaskId, QueueKey>,
    next_seq: u64,
}

impl QueueState {
    fn is_ready(&self, task: &Task, now: DateTime<Utc>) -> bool {
        task.status == TaskStatus::Pending
            && task.not_before.map_or(true, |t| t <= now)
            && task.dependencies.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|d| d.status == TaskStatus::Completed)
            })
    }

    fn ready_iter(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Task> + '_ {
        self.pending
            .values()
            .filter_map(|id| self.tasks.get(id))
            .filter(move |t| self.is_ready(t, now))
    }

    fn unlink_pending(&mut self, id: TaskId) -> bool {
        match self.keys.get(&id) {
            Some(key) => self.pending.remove(key).is_some(),
            None => false,
        }
    }
}

/// Counters returned by `get_queue_stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Non-terminal tasks waiting for an agent.
    pub pending: usize,
    /// Pending tasks whose dependencies and backoff allow assignment now.
    pub ready: usize,
    /// Tasks bound to an agent, not yet started.
    pub assigned: usize,
    /// Tasks the agent acknowledged.
    pub running: usize,
    /// Tasks that finished successfully.
    pub completed: usize,
    /// Tasks that failed terminally.
    pub failed: usize,
    /// All tasks still on record.
    pub total: usize,
    /// Limit on non-terminal tasks.
    pub capacity: usize,
}

/// Priority-ordered holding area for submitted work, and the book of record
/// for every task's status until it is purged.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    ready_signal: Arc<Notify>,
}

impl TaskQueue {
    /// Create a queue that holds at most `capacity` pending tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            ready_signal: Arc::new(Notify::new()),
        }
    }

    /// Signal fired whenever work may have become ready.
    pub fn ready_signal(&self) -> Arc<Notify> {
        self.ready_signal.clone()
    }

    /// Insert a task by priority.
    ///
    /// Fails with `InvalidDependency` if a dependency id is unknown, and with
    /// `QueueFull` when the pending set is at capacity. A task whose
    /// dependency already failed is stored as Failed (`DependencyFailed`).
    pub fn enqueue(&self, mut task: Task) -> ConductorResult<TaskId> {
        let id = task.id;
        {
            let mut state = self.state.lock();
            if state.tasks.contains_key(&id) {
                return Err(ConductorError::DuplicateTask(id));
            }
            if let Some(dep) = task
                .dependencies
                .iter()
                .find(|dep| !state.tasks.contains_key(dep))
            {
                return Err(ConductorError::InvalidDependency {
                    task: id,
                    dependency: *dep,
                });
            }
            let failed_dep = task.dependencies.iter().copied().find(|dep| {
                state
                    .tasks
                    .get(dep)
                    .is_some_and(|d| matches!(d.status, TaskStatus::Failed { .. }))
            });
            if let Some(dependency) = failed_dep {
                // Can never run; recorded as failed instead of parked forever.
                task.status = TaskStatus::Failed {
                    reason: FailureReason::DependencyFailed { dependency },
                };
                task.finished_at = Some(task.submitted_at);
                warn!(task_id = %id, dependency = %dependency, "Dependency already failed");
                state.tasks.insert(id, task);
                return Ok(id);
            }
            if state.pending.len() >= self.capacity {
                return Err(ConductorError::QueueFull {
                    capacity: self.capacity,
                });
            }

            task.status = TaskStatus::Pending;
            let key = QueueKey {
                priority: task.priority,
                deadline: task.deadline,
                seq: state.next_seq,
            };
            state.next_seq += 1;
            state.pending.insert(key, id);
            state.keys.insert(id, key);
            state.tasks.insert(id, task);
        }
        debug!(task_id = %id, "Task enqueued");
        self.ready_signal.notify_one();
        Ok(id)
    }

    /// Highest-priority ready task whose required capabilities are a subset
    /// of `capabilities`. Does not remove it.
    pub fn peek_ready(&self, capabilities: &BTreeSet<String>, now: DateTime<Utc>) -> Option<Task> {
        let state = self.state.lock();
        let found = state
            .ready_iter(now)
            .find(|t| t.required_capabilities.is_subset(capabilities))
            .cloned();
        found
    }

    /// All ready tasks in dispatch order.
    pub fn ready_tasks(&self, now: DateTime<Utc>) -> Vec<Task> {
        let state = self.state.lock();
        let ready = state.ready_iter(now).cloned().collect();
        ready
    }

    /// Atomically remove a pending task and mark it Assigned.
    ///
    /// Exactly one of several concurrent callers succeeds; the rest get
    /// `TaskNotFound`.
    pub fn take(&self, id: TaskId) -> ConductorResult<Task> {
        let mut state = self.state.lock();
        if !state.unlink_pending(id) {
            return Err(ConductorError::TaskNotFound(id));
        }
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(ConductorError::TaskNotFound(id))?;
        task.status = TaskStatus::Assigned;
        task.attempts += 1;
        Ok(task.clone())
    }

    /// Record which agent and allocation a taken task is bound to.
    pub fn record_assignment(
        &self,
        id: TaskId,
        agent: &AgentId,
        allocation: AllocationId,
        now: DateTime<Utc>,
    ) -> ConductorResult<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(ConductorError::TaskNotFound(id))?;
        task.assigned_agent = Some(agent.clone());
        task.allocation = Some(allocation);
        task.assigned_at = Some(now);
        Ok(())
    }

    /// Assigned → Running.
    pub fn mark_running(&self, id: TaskId) -> ConductorResult<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(ConductorError::TaskNotFound(id))?;
        match task.status {
            TaskStatus::Running => Ok(()),
            TaskStatus::Assigned => {
                task.status = TaskStatus::Running;
                Ok(())
            }
            _ => Err(ConductorError::InvalidTransition(format!(
                "task {id}: {} -> running",
                task.status.label()
            ))),
        }
    }

    /// Mark an active task Completed. Returns `false` if it was not active.
    pub fn complete(&self, id: TaskId, now: DateTime<Utc>) -> ConductorResult<bool> {
        let completed = {
            let mut state = self.state.lock();
            let task = state
                .tasks
                .get_mut(&id)
                .ok_or(ConductorError::TaskNotFound(id))?;
            if !task.status.is_active() {
                false
            } else {
                task.status = TaskStatus::Completed;
                task.finished_at = Some(now);
                true
            }
        };
        if completed {
            // Dependents may have become ready.
            self.ready_signal.notify_one();
        }
        Ok(completed)
    }

    /// Return a task to the pending set at its original position.
    ///
    /// `refund_attempt` undoes the attempt counted by [`TaskQueue::take`]
    /// (used for preemption and graceful unregistration). Requeues bypass the
    /// capacity check: work is never dropped.
    pub fn requeue(
        &self,
        id: TaskId,
        not_before: Option<DateTime<Utc>>,
        error: Option<String>,
        refund_attempt: bool,
    ) -> ConductorResult<()> {
        {
            let mut state = self.state.lock();
            let key = *state
                .keys
                .get(&id)
                .ok_or(ConductorError::TaskNotFound(id))?;
            let task = state
                .tasks
                .get_mut(&id)
                .ok_or(ConductorError::TaskNotFound(id))?;
            if !task.status.is_active() {
                return Err(ConductorError::InvalidTransition(format!(
                    "task {id}: {} -> pending",
                    task.status.label()
                )));
            }
            task.status = TaskStatus::Pending;
            task.assigned_agent = None;
            task.allocation = None;
            task.assigned_at = None;
            task.not_before = not_before;
            if error.is_some() {
                task.last_error = error;
            }
            if refund_attempt {
                task.attempts = task.attempts.saturating_sub(1);
            }
            state.pending.insert(key, id);
        }
        info!(task_id = %id, "Task requeued");
        self.ready_signal.notify_one();
        Ok(())
    }

    /// Move a pending or active task to Failed and fail every pending task
    /// that (transitively) depends on it. Returns the ids of all tasks that
    /// became Failed, starting with `id`; empty if `id` was already terminal.
    pub fn fail(
        &self,
        id: TaskId,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> ConductorResult<Vec<TaskId>> {
        let mut state = self.state.lock();
        match state.tasks.get(&id) {
            None => return Err(ConductorError::TaskNotFound(id)),
            Some(task) if task.status.is_terminal() => return Ok(Vec::new()),
            Some(_) => {}
        }

        let mut failed = Vec::new();
        let mut frontier = vec![(id, reason)];
        while let Some((tid, reason)) = frontier.pop() {
            state.unlink_pending(tid);
            if let Some(task) = state.tasks.get_mut(&tid) {
                if let FailureReason::AttemptsExhausted { last_error } = &reason {
                    task.last_error = Some(last_error.clone());
                }
                task.status = TaskStatus::Failed { reason };
                task.finished_at = Some(now);
            }
            failed.push(tid);

            let dependents: Vec<TaskId> = state
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Pending && t.dependencies.contains(&tid))
                .map(|t| t.id)
                .collect();
            for dep_id in dependents {
                frontier.push((dep_id, FailureReason::DependencyFailed { dependency: tid }));
            }
        }

        if failed.len() > 1 {
            warn!(task_id = %id, cascaded = failed.len() - 1, "Dependent tasks failed");
        }
        Ok(failed)
    }

    /// Flag an active task for cancellation. Returns the instant recorded.
    pub fn request_cancel(&self, id: TaskId, now: DateTime<Utc>) -> ConductorResult<DateTime<Utc>> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(ConductorError::TaskNotFound(id))?;
        Ok(*task.cancel_requested_at.get_or_insert(now))
    }

    /// Active tasks whose cancellation request is older than `timeout`.
    pub fn cancel_timeouts(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<Task> {
        let state = self.state.lock();
        let expired = state
            .tasks
            .values()
            .filter(|t| t.status.is_active())
            .filter(|t| t.cancel_requested_at.is_some_and(|at| at + timeout <= now))
            .cloned()
            .collect();
        expired
    }

    /// Drop terminal tasks finished before `cutoff`, keeping any that a live
    /// task still depends on. Returns how many were purged.
    pub fn purge_terminal(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.lock();
        let referenced: HashSet<TaskId> = state
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .flat_map(|t| t.dependencies.iter().copied())
            .collect();
        let doomed: Vec<TaskId> = state
            .tasks
            .values()
            .filter(|t| t.status.is_terminal())
            .filter(|t| t.finished_at.is_some_and(|at| at < cutoff))
            .filter(|t| !referenced.contains(&t.id))
            .map(|t| t.id)
            .collect();
        for id in &doomed {
            state.tasks.remove(id);
            state.keys.remove(id);
        }
        if !doomed.is_empty() {
            debug!(count = doomed.len(), "Purged terminal tasks");
        }
        doomed.len()
    }

    /// Get a snapshot of a task by id.
    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.state.lock().tasks.get(&id).cloned()
    }

    /// Number of pending (not yet assigned) tasks.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Total number of tasks known, including terminal ones not yet purged.
    pub fn total_count(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Limit on non-terminal tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Counters for `get_queue_stats`.
    pub fn stats(&self, now: DateTime<Utc>) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats {
            pending: state.pending.len(),
            ready: state.ready_iter(now).count(),
            total: state.tasks.len(),
            capacity: self.capacity,
            ..QueueStats::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed { .. } => stats.failed += 1,
                TaskStatus::Pending => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn caps(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_queue() {
        let queue = TaskQueue::new(8);
        assert_eq!(queue.total_count(), 0);
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.peek_ready(&caps(&[]), Utc::now()).is_none());
    }

    #[test]
    fn test_priority_order() {
        let queue = TaskQueue::new(8);
        for p in [1, 5, 3] {
            queue.enqueue(Task::new(format!("p{p}")).with_priority(p)).unwrap();
        }
        let order: Vec<i32> = queue
            .ready_tasks(Utc::now())
            .iter()
            .map(|t| t.priority)
            .collect();
        assert_eq!(order, vec![5, 3, 1]);
    }

    #[test]
    fn test_tie_break_deadline_then_fifo() {
        let queue = TaskQueue::new(8);
        let now = Utc::now();
        let a = queue.enqueue(Task::new("no-deadline").with_priority(2)).unwrap();
        let b = queue
            .enqueue(Task::new("late").with_priority(2).with_deadline(now + Duration::hours(2)))
            .unwrap();
        let c = queue
            .enqueue(Task::new("soon").with_priority(2).with_deadline(now + Duration::hours(1)))
            .unwrap();
        let d = queue.enqueue(Task::new("no-deadline-2").with_priority(2)).unwrap();

        let order: Vec<TaskId> = queue.ready_tasks(now).iter().map(|t| t.id).collect();
        assert_eq!(order, vec![c, b, a, d]);
    }

    #[test]
    fn test_queue_full() {
        let queue = TaskQueue::new(1);
        queue.enqueue(Task::new("one")).unwrap();
        let err = queue.enqueue(Task::new("two")).unwrap_err();
        assert!(matches!(err, ConductorError::QueueFull { capacity: 1 }));
    }

    #[test]
    fn test_invalid_dependency_rejected() {
        let queue = TaskQueue::new(8);
        let ghost = TaskId::new();
        let err = queue
            .enqueue(Task::new("orphan").with_dependencies(vec![ghost]))
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidDependency { dependency, .. } if dependency == ghost));
        assert_eq!(queue.total_count(), 0);
    }

    #[test]
    fn test_dependency_gates_readiness() {
        let queue = TaskQueue::new(8);
        let now = Utc::now();
        let first = queue.enqueue(Task::new("first").with_priority(1)).unwrap();
        let second = queue
            .enqueue(Task::new("second").with_priority(10).with_dependencies(vec![first]))
            .unwrap();

        assert_eq!(queue.peek_ready(&caps(&[]), now).unwrap().id, first);

        queue.take(first).unwrap();
        // Assigned is not Completed.
        assert!(queue.peek_ready(&caps(&[]), now).is_none());

        queue.complete(first, now).unwrap();
        assert_eq!(queue.peek_ready(&caps(&[]), now).unwrap().id, second);
    }

    #[test]
    fn test_peek_ready_filters_capabilities() {
        let queue = TaskQueue::new(8);
        let now = Utc::now();
        queue
            .enqueue(Task::new("gpu").with_priority(9).with_capabilities(["gpu"]))
            .unwrap();
        let cpu = queue.enqueue(Task::new("cpu").with_priority(1)).unwrap();

        assert_eq!(queue.peek_ready(&caps(&["rust"]), now).unwrap().id, cpu);
        assert_eq!(queue.peek_ready(&caps(&["gpu"]), now).unwrap().priority, 9);
    }

    #[test]
    fn test_take_is_exactly_once() {
        let queue = TaskQueue::new(8);
        let id = queue.enqueue(Task::new("once")).unwrap();
        let taken = queue.take(id).unwrap();
        assert_eq!(taken.status, TaskStatus::Assigned);
        assert_eq!(taken.attempts, 1);
        assert!(matches!(queue.take(id), Err(ConductorError::TaskNotFound(_))));
    }

    #[test]
    fn test_requeue_keeps_fifo_position() {
        let queue = TaskQueue::new(8);
        let now = Utc::now();
        let a = queue.enqueue(Task::new("a")).unwrap();
        let b = queue.enqueue(Task::new("b")).unwrap();
        queue.take(a).unwrap();
        queue.requeue(a, None, Some("agent lost".into()), false).unwrap();

        let order: Vec<TaskId> = queue.ready_tasks(now).iter().map(|t| t.id).collect();
        assert_eq!(order, vec![a, b]);
        let task = queue.get(a).unwrap();
        assert_eq!(task.attempts, 1);
        assert_eq!(task.last_error.as_deref(), Some("agent lost"));
    }

    #[test]
    fn test_requeue_backoff_delays_readiness() {
        let queue = TaskQueue::new(8);
        let now = Utc::now();
        let id = queue.enqueue(Task::new("retry")).unwrap();
        queue.take(id).unwrap();
        queue
            .requeue(id, Some(now + Duration::seconds(5)), None, false)
            .unwrap();
        assert!(queue.ready_tasks(now).is_empty());
        assert_eq!(queue.ready_tasks(now + Duration::seconds(5)).len(), 1);
    }

    #[test]
    fn test_requeue_refunds_attempt() {
        let queue = TaskQueue::new(8);
        let id = queue.enqueue(Task::new("preempted")).unwrap();
        queue.take(id).unwrap();
        queue.requeue(id, None, None, true).unwrap();
        assert_eq!(queue.get(id).unwrap().attempts, 0);
    }

    #[test]
    fn test_fail_cascades_to_dependents() {
        let queue = TaskQueue::new(8);
        let now = Utc::now();
        let root = queue.enqueue(Task::new("root")).unwrap();
        let child = queue
            .enqueue(Task::new("child").with_dependencies(vec![root]))
            .unwrap();
        let grandchild = queue
            .enqueue(Task::new("grandchild").with_dependencies(vec![child]))
            .unwrap();

        queue.take(root).unwrap();
        let failed = queue
            .fail(
                root,
                FailureReason::AttemptsExhausted {
                    last_error: "boom".into(),
                },
                now,
            )
            .unwrap();
        assert_eq!(failed.len(), 3);
        assert!(matches!(
            queue.get(grandchild).unwrap().status,
            TaskStatus::Failed {
                reason: FailureReason::DependencyFailed { dependency }
            } if dependency == child
        ));
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_fail_is_noop_when_terminal() {
        let queue = TaskQueue::new(8);
        let now = Utc::now();
        let id = queue.enqueue(Task::new("done")).unwrap();
        queue.take(id).unwrap();
        assert!(queue.complete(id, now).unwrap());
        assert!(!queue.complete(id, now).unwrap());
        assert!(queue.fail(id, FailureReason::Cancelled, now).unwrap().is_empty());
        assert_eq!(queue.get(id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn test_enqueue_after_dependency_failed_fails_immediately() {
        let queue = TaskQueue::new(8);
        let now = Utc::now();
        let parent = queue.enqueue(Task::new("parent")).unwrap();
        queue.fail(parent, FailureReason::Cancelled, now).unwrap();

        let child = queue
            .enqueue(Task::new("child").with_dependencies(vec![parent]))
            .unwrap();
        assert!(matches!(
            queue.get(child).unwrap().status,
            TaskStatus::Failed {
                reason: FailureReason::DependencyFailed { dependency }
            } if dependency == parent
        ));
        assert_eq!(queue.pending_count(), 0);
        assert!(queue.ready_tasks(now).is_empty());

        // Both are terminal and unreferenced, so retention can drop them.
        assert_eq!(queue.purge_terminal(Utc::now() + chrono::Duration::seconds(1)), 2);
    }

    #[test]
    fn test_mark_running() {
        let queue = TaskQueue::new(8);
        let id = queue.enqueue(Task::new("run")).unwrap();
        assert!(queue.mark_running(id).is_err());
        queue.take(id).unwrap();
        queue.mark_running(id).unwrap();
        assert_eq!(queue.get(id).unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn test_purge_keeps_referenced_tasks() {
        let queue = TaskQueue::new(8);
        let now = Utc::now();
        let done = queue.enqueue(Task::new("done")).unwrap();
        queue.take(done).unwrap();
        queue.complete(done, now).unwrap();
        let other = queue.enqueue(Task::new("other")).unwrap();
        queue.take(other).unwrap();
        queue.complete(other, now).unwrap();
        queue
            .enqueue(Task::new("waits").with_dependencies(vec![done]))
            .unwrap();

        let purged = queue.purge_terminal(now + Duration::seconds(1));
        assert_eq!(purged, 1);
        assert!(queue.get(done).is_some());
        assert!(queue.get(other).is_none());
    }

    #[test]
    fn test_stats() {
        let queue = TaskQueue::new(8);
        let now = Utc::now();
        let a = queue.enqueue(Task::new("a")).unwrap();
        let b = queue.enqueue(Task::new("b")).unwrap();
        queue.enqueue(Task::new("c").with_dependencies(vec![a])).unwrap();
        queue.take(a).unwrap();
        queue.take(b).unwrap();
        queue.mark_running(b).unwrap();

        let stats = queue.stats(now);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.assigned, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.capacity, 8);
    }
}
