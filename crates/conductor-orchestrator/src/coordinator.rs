use crate::clock::{Clock, SystemClock};
use crate::config::{OrchestratorConfig, RetryPolicy};
use crate::events::{EventBus, EventRecord, OrchestratorEvent};
use crate::ledger::{LedgerSnapshot, ResourceLedger};
use crate::strategy::{Balancer, Candidate, LoadBalancingStrategy};
use crate::task_queue::{QueueStats, TaskQueue};
use crate::types::{
    ActiveTask, Agent, AgentSpec, AgentStatus, AgentStatusReport, Assignment, FailureReason,
    Task, TaskOutcome, TaskStatus, TaskStatusReport,
};
use chrono::{DateTime, Utc};
use conductor_core::{AgentId, ConductorError, ConductorResult, TaskId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

/// How many times `assign_next` re-plans after losing a race to a
/// concurrent caller before giving up for this round.
const MAX_ASSIGN_ROUNDS: usize = 8;

pub(crate) struct AgentEntry {
    pub(crate) seq: u64,
    pub(crate) agent: Arc<Mutex<Agent>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) agents: HashMap<AgentId, AgentEntry>,
    next_seq: u64,
}

/// Result of one background sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Tasks whose allocation lease ran out and were sent back for retry.
    pub expired: Vec<TaskId>,
    /// Tasks force-cancelled after the agent failed to acknowledge in time.
    pub cancelled: Vec<TaskId>,
    /// Terminal tasks dropped from the queue's records.
    pub purged: usize,
}

enum Round {
    Assigned(Box<Assignment>),
    /// Lost a race with a concurrent caller; plan again.
    Contended,
}

/// A capable, healthy agent as seen while planning one assignment.
struct View {
    handle: Arc<Mutex<Agent>>,
    candidate: Candidate,
    fits: bool,
    /// Held tasks with lower priority than the task being placed.
    lower: Vec<ActiveTask>,
}

/// Owns the agent registry and drives assignment, result handling,
/// cancellation and failure recovery over the shared queue and ledger.
///
/// Per-agent state sits behind its own lock, so work on one agent never waits
/// on another. Lock order is registry, then agent, then queue or ledger; the
/// queue and ledger never hold their locks across calls.
pub struct Coordinator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) registry: RwLock<Registry>,
    pub(crate) queue: TaskQueue,
    pub(crate) ledger: ResourceLedger,
    balancer: Balancer,
    retry: RetryPolicy,
    pub(crate) events: EventBus,
    closed: AtomicBool,
}

impl Coordinator {
    /// Build a coordinator on the wall clock.
    pub fn new(config: OrchestratorConfig) -> ConductorResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a coordinator on an injected clock. Fails on an invalid config.
    pub fn with_clock(config: OrchestratorConfig, clock: Arc<dyn Clock>) -> ConductorResult<Self> {
        config.validate()?;
        Ok(Self {
            queue: TaskQueue::new(config.queue_max_size),
            ledger: ResourceLedger::new(config.system_capacity),
            balancer: Balancer::new(config.load_balancing_strategy),
            retry: config.retry_policy(),
            registry: RwLock::new(Registry::default()),
            events: EventBus::default(),
            closed: AtomicBool::new(false),
            clock,
            config,
        })
    }

    /// Configuration this coordinator was built with.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Current instant on the coordinator's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // --- Registration ---

    /// Add an agent to the registry as Idle and open its ledger account.
    pub fn register_agent(&self, spec: AgentSpec) -> ConductorResult<AgentId> {
        let now = self.clock.now();
        let id = spec.id.clone();
        let agent_type = spec.agent_type.clone();
        {
            let mut registry = self.registry.write();
            if registry.agents.contains_key(&id) {
                return Err(ConductorError::DuplicateAgent(id));
            }
            self.ledger.register_agent(&id, spec.budget)?;
            let seq = registry.next_seq;
            registry.next_seq += 1;
            let agent = Agent::from_spec(spec, seq, now);
            registry.agents.insert(
                id.clone(),
                AgentEntry {
                    seq,
                    agent: Arc::new(Mutex::new(agent)),
                },
            );
        }
        info!(agent_id = %id, agent_type = %agent_type, "Agent registered");
        self.events.publish(
            now,
            OrchestratorEvent::AgentRegistered {
                agent_id: id.clone(),
                agent_type,
            },
        );
        // A new agent may unblock waiting work.
        self.queue.ready_signal().notify_one();
        Ok(id)
    }

    /// Remove an agent. Tasks it still holds go back to the queue without
    /// consuming an attempt.
    pub fn unregister_agent(&self, id: &AgentId) -> ConductorResult<()> {
        let now = self.clock.now();
        let entry = self
            .registry
            .write()
            .agents
            .remove(id)
            .ok_or_else(|| ConductorError::AgentNotFound(id.clone()))?;
        let held: Vec<ActiveTask> = {
            // Retire under the agent lock so a `bind` holding a stale handle
            // sees it and backs off.
            let mut agent = entry.agent.lock();
            agent.retired = true;
            self.ledger.deregister_agent(id);
            std::mem::take(&mut agent.active_tasks)
        };
        for active in held {
            self.requeue_refunded(active.task_id, format!("agent {id} unregistered"), now)?;
        }
        info!(agent_id = %id, "Agent unregistered");
        self.events.publish(now, OrchestratorEvent::AgentRemoved { agent_id: id.clone() });
        Ok(())
    }

    // --- Submission ---

    /// Validate and enqueue a task.
    pub fn submit_task(&self, mut task: Task) -> ConductorResult<TaskId> {
        if self.is_closed() {
            return Err(ConductorError::ShuttingDown);
        }
        let now = self.clock.now();
        task.submitted_at = now;
        let priority = task.priority;
        let id = self.queue.enqueue(task)?;
        info!(task_id = %id, priority, "Task submitted");
        self.events.publish(now, OrchestratorEvent::TaskSubmitted { task_id: id, priority });
        if let Some(TaskStatus::Failed { reason }) = self.queue.get(id).map(|t| t.status) {
            self.events
                .publish(now, OrchestratorEvent::TaskFailed { task_id: id, reason });
        }
        Ok(id)
    }

    // --- Assignment ---

    /// Bind the highest-priority ready task to one eligible agent.
    ///
    /// Returns `NoReadyTask` when nothing is ready and `NoEligibleAgent` when
    /// no healthy agent offers the capabilities of any ready task. When the
    /// first placeable task does not fit any capable agent's headroom it stays
    /// Pending and `InsufficientResources` is returned; lower-priority tasks
    /// are not dispatched ahead of it.
    pub fn assign_next(&self) -> ConductorResult<Assignment> {
        self.assign_next_with(self.balancer.strategy())
    }

    /// [`Coordinator::assign_next`] with a strategy chosen by the caller for
    /// this one placement.
    pub fn assign_next_with(&self, strategy: LoadBalancingStrategy) -> ConductorResult<Assignment> {
        for _ in 0..MAX_ASSIGN_ROUNDS {
            match self.plan_round(strategy)? {
                Round::Assigned(assignment) => return Ok(*assignment),
                Round::Contended => continue,
            }
        }
        debug!("Assignment contended for every round; yielding");
        Err(ConductorError::NoEligibleAgent)
    }

    fn plan_round(&self, strategy: LoadBalancingStrategy) -> ConductorResult<Round> {
        let now = self.clock.now();
        let ready = self.queue.ready_tasks(now);
        if ready.is_empty() {
            return Err(ConductorError::NoReadyTask);
        }
        let agents = self.agent_handles();

        for task in ready {
            let views = self.views_for(&task, &agents);
            if views.is_empty() {
                debug!(task_id = %task.id, "No healthy agent offers required capabilities");
                continue;
            }

            let fitting: Vec<Candidate> = views
                .iter()
                .filter(|v| v.fits)
                .map(|v| v.candidate.clone())
                .collect();

            if fitting.is_empty() {
                if strategy.preempts() {
                    if let Some(round) = self.try_preempt(&task, &views, now)? {
                        return Ok(round);
                    }
                }
                debug!(
                    task_id = %task.id,
                    requirement = %task.requirement,
                    "No capable agent has headroom; task stays pending"
                );
                return Err(ConductorError::InsufficientResources(format!(
                    "task {} requires {}; no capable agent has headroom",
                    task.id, task.requirement
                )));
            }

            let Some(handle) = self
                .balancer
                .select_with(strategy, &fitting)
                .and_then(|chosen| views.iter().find(|v| v.candidate.agent_id == chosen.agent_id))
                .map(|v| v.handle.clone())
            else {
                continue;
            };
            return self.bind(&task, &handle, strategy, now);
        }
        Err(ConductorError::NoEligibleAgent)
    }

    fn views_for(&self, task: &Task, agents: &[Arc<Mutex<Agent>>]) -> Vec<View> {
        agents
            .iter()
            .filter_map(|handle| {
                let agent = handle.lock();
                if !agent.accepts_work() || !agent.offers(&task.required_capabilities) {
                    return None;
                }
                let lower: Vec<ActiveTask> =
                    agent.lower_priority_tasks(task.priority).cloned().collect();
                Some(View {
                    handle: handle.clone(),
                    candidate: Candidate {
                        agent_id: agent.id.clone(),
                        registration_seq: agent.registration_seq,
                        extra_capabilities: agent
                            .capabilities
                            .len()
                            .saturating_sub(task.required_capabilities.len()),
                        load_ratio: self.ledger.load_ratio(&agent.id),
                        lower_priority_tasks: lower.len(),
                        score: agent.performance.score(),
                    },
                    fits: self.ledger.can_fit(&agent.id, &task.requirement),
                    lower,
                })
            })
            .collect()
    }

    /// Allocate on the agent behind `handle`, then claim the task. Either
    /// step losing a race undoes the other and reports contention.
    fn bind(
        &self,
        task: &Task,
        handle: &Arc<Mutex<Agent>>,
        strategy: LoadBalancingStrategy,
        now: DateTime<Utc>,
    ) -> ConductorResult<Round> {
        let mut agent = handle.lock();
        if !agent.accepts_work() {
            return Ok(Round::Contended);
        }
        let agent_id = agent.id.clone();

        let allocation = match self.ledger.allocate(
            &agent_id,
            task.id,
            task.requirement,
            now,
            self.config.allocation_ttl(),
        ) {
            Ok(allocation) => allocation,
            Err(ConductorError::InsufficientResources(_) | ConductorError::AgentNotFound(_)) => {
                return Ok(Round::Contended)
            }
            Err(e) => return Err(e),
        };

        let taken = match self.queue.take(task.id) {
            Ok(taken) => taken,
            Err(e) => {
                self.ledger.release(allocation.id);
                return match e {
                    ConductorError::TaskNotFound(_) => Ok(Round::Contended),
                    other => Err(other),
                };
            }
        };
        if let Err(e) = self.queue.record_assignment(task.id, &agent_id, allocation.id, now) {
            self.ledger.release(allocation.id);
            return Err(e);
        }

        agent.active_tasks.push(ActiveTask {
            task_id: task.id,
            priority: taken.priority,
            allocation_id: allocation.id,
            assigned_at: now,
        });
        if agent.status == AgentStatus::Idle {
            self.move_agent(&mut agent, AgentStatus::Busy, now);
        }
        drop(agent);

        info!(
            task_id = %task.id,
            agent_id = %agent_id,
            attempt = taken.attempts,
            strategy = %strategy,
            "Task assigned"
        );
        self.events.publish(
            now,
            OrchestratorEvent::TaskAssigned {
                task_id: task.id,
                agent_id: agent_id.clone(),
                allocation_id: allocation.id,
                attempt: taken.attempts,
            },
        );
        Ok(Round::Assigned(Box::new(Assignment {
            task_id: taken.id,
            task_name: taken.name,
            agent_id,
            allocation_id: allocation.id,
            priority: taken.priority,
            attempt: taken.attempts,
            assigned_at: now,
            payload: taken.payload,
            preempted: None,
        })))
    }

    /// Displace the lowest-priority task on a capable agent whose budget
    /// would then fit `task`. Returns `None` if no such victim exists.
    fn try_preempt(
        &self,
        task: &Task,
        views: &[View],
        now: DateTime<Utc>,
    ) -> ConductorResult<Option<Round>> {
        let victim = views
            .iter()
            .flat_map(|v| v.lower.iter().map(move |t| (v, t)))
            .filter(|(v, t)| {
                self.ledger.can_fit_after_release(
                    &v.candidate.agent_id,
                    t.allocation_id,
                    &task.requirement,
                )
            })
            .min_by(|(va, a), (vb, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.assigned_at.cmp(&a.assigned_at))
                    .then_with(|| {
                        va.candidate
                            .registration_seq
                            .cmp(&vb.candidate.registration_seq)
                    })
            })
            .map(|(v, t)| (v.candidate.agent_id.clone(), v.handle.clone(), t.clone()));
        let Some((agent_id, handle, victim)) = victim else {
            return Ok(None);
        };

        let mut agent = handle.lock();
        if !agent.accepts_work() || !agent.holds(victim.task_id) {
            return Ok(Some(Round::Contended));
        }

        let taken = match self.queue.take(task.id) {
            Ok(taken) => taken,
            Err(ConductorError::TaskNotFound(_)) => return Ok(Some(Round::Contended)),
            Err(e) => return Err(e),
        };
        let (_, allocation) = match self.ledger.reallocate(
            victim.allocation_id,
            &agent_id,
            task.id,
            task.requirement,
            now,
            self.config.allocation_ttl(),
        ) {
            Ok(pair) => pair,
            Err(_) => {
                self.queue.requeue(task.id, None, None, true)?;
                return Ok(Some(Round::Contended));
            }
        };
        self.queue
            .record_assignment(task.id, &agent_id, allocation.id, now)?;
        agent.release_task(victim.task_id);
        agent.active_tasks.push(ActiveTask {
            task_id: task.id,
            priority: taken.priority,
            allocation_id: allocation.id,
            assigned_at: now,
        });
        drop(agent);

        warn!(
            task_id = %task.id,
            preempted = %victim.task_id,
            agent_id = %agent_id,
            "Lower-priority task preempted"
        );
        self.events.publish(
            now,
            OrchestratorEvent::TaskPreempted {
                task_id: victim.task_id,
                by: task.id,
                agent_id: agent_id.clone(),
            },
        );
        self.requeue_refunded(victim.task_id, format!("preempted by task {}", task.id), now)?;
        self.events.publish(
            now,
            OrchestratorEvent::TaskAssigned {
                task_id: task.id,
                agent_id: agent_id.clone(),
                allocation_id: allocation.id,
                attempt: taken.attempts,
            },
        );
        Ok(Some(Round::Assigned(Box::new(Assignment {
            task_id: taken.id,
            task_name: taken.name,
            agent_id,
            allocation_id: allocation.id,
            priority: taken.priority,
            attempt: taken.attempts,
            assigned_at: now,
            payload: taken.payload,
            preempted: Some(victim.task_id),
        }))))
    }

    // --- Results ---

    /// Assigned → Running, on the agent's acknowledgement.
    pub fn task_started(&self, task_id: TaskId) -> ConductorResult<()> {
        self.queue.mark_running(task_id)
    }

    /// Record the outcome of a task.
    ///
    /// Reports for terminal tasks, or for tasks the reporting agent no longer
    /// holds (preempted or recovered), are ignored.
    pub fn report_result(&self, task_id: TaskId, outcome: TaskOutcome) -> ConductorResult<()> {
        let now = self.clock.now();
        let task = self
            .queue
            .get(task_id)
            .ok_or(ConductorError::TaskNotFound(task_id))?;
        if !task.status.is_active() {
            debug!(task_id = %task_id, status = task.status.label(), "Result ignored");
            return Ok(());
        }
        let Some((agent_id, _)) = self.detach(&task, |agent, active| {
            let latency = (now - active.assigned_at).num_milliseconds().max(0) as u64;
            agent
                .performance
                .record(matches!(outcome, TaskOutcome::Success), latency);
        }) else {
            debug!(task_id = %task_id, "Stale result from a previous holder ignored");
            return Ok(());
        };

        let cancel_requested = self
            .queue
            .get(task_id)
            .is_some_and(|t| t.cancel_requested_at.is_some());
        if cancel_requested {
            return self.fail_task(task_id, FailureReason::Cancelled, now);
        }

        match outcome {
            TaskOutcome::Success => {
                self.queue.complete(task_id, now)?;
                info!(task_id = %task_id, agent_id = %agent_id, "Task completed");
                self.events
                    .publish(now, OrchestratorEvent::TaskCompleted { task_id, agent_id });
                Ok(())
            }
            TaskOutcome::Failure { error } => {
                warn!(task_id = %task_id, agent_id = %agent_id, error = %error, "Task failed");
                self.retry_or_fail(task_id, error, true, now)
            }
        }
    }

    /// Take back an assignment that never reached its agent. The task goes
    /// back to the queue without charging the attempt. No-op if the task is
    /// no longer held.
    pub fn revoke_assignment(&self, task_id: TaskId) -> ConductorResult<()> {
        let now = self.clock.now();
        let task = self
            .queue
            .get(task_id)
            .ok_or(ConductorError::TaskNotFound(task_id))?;
        if !task.status.is_active() {
            return Ok(());
        }
        let Some((agent_id, _)) = self.detach(&task, |_, _| {}) else {
            debug!(task_id = %task_id, "Revoked task already released");
            return Ok(());
        };
        warn!(task_id = %task_id, agent_id = %agent_id, "Assignment not delivered; requeueing");
        self.requeue_refunded(task_id, format!("assignment to agent {agent_id} not delivered"), now)
    }

    // --- Cancellation ---

    /// Cancel a task. Pending work fails immediately; active work is flagged
    /// and finalised on [`Coordinator::acknowledge_cancel`] or after
    /// `cancel_timeout`. Cancelling a terminal task is a no-op.
    pub fn cancel_task(&self, task_id: TaskId) -> ConductorResult<()> {
        let now = self.clock.now();
        let task = self
            .queue
            .get(task_id)
            .ok_or(ConductorError::TaskNotFound(task_id))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        if !task.status.is_active() {
            return self.fail_task(task_id, FailureReason::Cancelled, now);
        }
        self.queue.request_cancel(task_id, now)?;
        if let Some(agent_id) = task.assigned_agent {
            info!(task_id = %task_id, agent_id = %agent_id, "Cancellation requested");
            self.events
                .publish(now, OrchestratorEvent::CancelRequested { task_id, agent_id });
        }
        Ok(())
    }

    /// The agent confirms it stopped working on a cancelled task.
    pub fn acknowledge_cancel(&self, task_id: TaskId) -> ConductorResult<()> {
        let now = self.clock.now();
        let task = self
            .queue
            .get(task_id)
            .ok_or(ConductorError::TaskNotFound(task_id))?;
        if task.status.is_terminal() {
            return Ok(());
        }
        if task.cancel_requested_at.is_none() {
            return Err(ConductorError::InvalidTransition(format!(
                "task {task_id}: no cancellation pending"
            )));
        }
        if self.detach(&task, |_, _| {}).is_some() {
            self.fail_task(task_id, FailureReason::Cancelled, now)?;
        }
        Ok(())
    }

    // --- Sweep ---

    /// Reclaim expired allocations, enforce the cancellation timeout and purge
    /// terminal tasks past retention.
    pub fn sweep(&self) -> ConductorResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for allocation in self.ledger.sweep_expired(now) {
            self.events.publish(
                now,
                OrchestratorEvent::AllocationExpired {
                    allocation_id: allocation.id,
                    task_id: allocation.task_id,
                    agent_id: allocation.agent_id.clone(),
                },
            );
            let Some(handle) = self.agent_handle(&allocation.agent_id) else {
                continue;
            };
            let detached = {
                let mut agent = handle.lock();
                let holds_this = agent
                    .active_tasks
                    .iter()
                    .any(|t| t.task_id == allocation.task_id && t.allocation_id == allocation.id);
                if holds_this {
                    agent.release_task(allocation.task_id);
                    self.settle_agent(&mut agent, now);
                }
                holds_this
            };
            if detached {
                self.retry_or_fail(allocation.task_id, "allocation expired".into(), true, now)?;
                report.expired.push(allocation.task_id);
            }
        }

        for task in self.queue.cancel_timeouts(now, self.config.cancel_timeout()) {
            if self.detach(&task, |_, _| {}).is_some() {
                warn!(task_id = %task.id, "Cancellation not acknowledged in time; forcing");
                self.fail_task(task.id, FailureReason::Cancelled, now)?;
                report.cancelled.push(task.id);
            }
        }

        let cutoff = now
            .checked_sub_signed(self.config.task_retention())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        report.purged = self.queue.purge_terminal(cutoff);
        Ok(report)
    }

    // --- Recovery helpers ---

    /// Take `task` off its holder, release its allocation and settle the
    /// holder's status. `inspect` runs under the agent lock. Returns `None`
    /// when the recorded holder no longer has it, in which case another path
    /// already owns the task's fate.
    fn detach<F>(&self, task: &Task, inspect: F) -> Option<(AgentId, ActiveTask)>
    where
        F: FnOnce(&mut Agent, &ActiveTask),
    {
        let agent_id = task.assigned_agent.as_ref()?;
        let handle = self.agent_handle(agent_id)?;
        let now = self.clock.now();
        let mut agent = handle.lock();
        let active = agent.release_task(task.id)?;
        self.ledger.release(active.allocation_id);
        inspect(&mut agent, &active);
        self.settle_agent(&mut agent, now);
        Some((agent_id.clone(), active))
    }

    /// Busy → Idle once an agent holds nothing.
    fn settle_agent(&self, agent: &mut Agent, now: DateTime<Utc>) {
        if agent.status == AgentStatus::Busy && agent.active_tasks.is_empty() {
            self.move_agent(agent, AgentStatus::Idle, now);
        }
    }

    pub(crate) fn move_agent(&self, agent: &mut Agent, next: AgentStatus, now: DateTime<Utc>) -> bool {
        match agent.transition(next) {
            Ok(from) => {
                info!(agent_id = %agent.id, from = %from, to = %next, "Agent status changed");
                self.events.publish(
                    now,
                    OrchestratorEvent::AgentStatusChanged {
                        agent_id: agent.id.clone(),
                        from,
                        to: next,
                    },
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "Agent transition rejected");
                false
            }
        }
    }

    /// A detached task failed (or lost its agent). Retry it unless the
    /// attempt budget is spent or it was being cancelled.
    pub(crate) fn retry_or_fail(
        &self,
        task_id: TaskId,
        error: String,
        backoff: bool,
        now: DateTime<Utc>,
    ) -> ConductorResult<()> {
        let task = self
            .queue
            .get(task_id)
            .ok_or(ConductorError::TaskNotFound(task_id))?;
        if task.cancel_requested_at.is_some() {
            return self.fail_task(task_id, FailureReason::Cancelled, now);
        }
        if self.retry.exhausted(task.attempts) {
            warn!(task_id = %task_id, attempts = task.attempts, "Attempts exhausted");
            return self.fail_task(
                task_id,
                FailureReason::AttemptsExhausted { last_error: error },
                now,
            );
        }
        let retry_at = backoff.then(|| now + self.retry.backoff(task.attempts));
        self.queue.requeue(task_id, retry_at, Some(error), false)?;
        self.events.publish(
            now,
            OrchestratorEvent::TaskRequeued {
                task_id,
                attempts: task.attempts,
                retry_at,
            },
        );
        Ok(())
    }

    /// Return a detached task to the queue without charging an attempt.
    fn requeue_refunded(&self, task_id: TaskId, reason: String, now: DateTime<Utc>) -> ConductorResult<()> {
        let task = self
            .queue
            .get(task_id)
            .ok_or(ConductorError::TaskNotFound(task_id))?;
        if task.cancel_requested_at.is_some() {
            return self.fail_task(task_id, FailureReason::Cancelled, now);
        }
        self.queue.requeue(task_id, None, Some(reason), true)?;
        self.events.publish(
            now,
            OrchestratorEvent::TaskRequeued {
                task_id,
                attempts: task.attempts.saturating_sub(1),
                retry_at: None,
            },
        );
        Ok(())
    }

    pub(crate) fn fail_task(
        &self,
        task_id: TaskId,
        reason: FailureReason,
        now: DateTime<Utc>,
    ) -> ConductorResult<()> {
        for failed in self.queue.fail(task_id, reason.clone(), now)? {
            let reason = match self.queue.get(failed).map(|t| t.status) {
                Some(TaskStatus::Failed { reason }) => reason,
                _ => reason.clone(),
            };
            info!(task_id = %failed, reason = reason.code(), "Task failed terminally");
            self.events
                .publish(now, OrchestratorEvent::TaskFailed { task_id: failed, reason });
        }
        Ok(())
    }

    // --- Registry access ---

    pub(crate) fn agent_handle(&self, id: &AgentId) -> Option<Arc<Mutex<Agent>>> {
        self.registry.read().agents.get(id).map(|e| e.agent.clone())
    }

    /// Every agent handle, in registration order.
    pub(crate) fn agent_handles(&self) -> Vec<Arc<Mutex<Agent>>> {
        let registry = self.registry.read();
        let mut entries: Vec<&AgentEntry> = registry.agents.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| e.agent.clone()).collect()
    }

    // --- Queries ---

    /// Status, load and performance of one agent.
    pub fn get_agent_status(&self, id: &AgentId) -> ConductorResult<AgentStatusReport> {
        let handle = self
            .agent_handle(id)
            .ok_or_else(|| ConductorError::AgentNotFound(id.clone()))?;
        let agent = handle.lock();
        Ok(self.report_for(&agent))
    }

    /// Status of every registered agent, in registration order.
    pub fn list_agents(&self) -> Vec<AgentStatusReport> {
        self.agent_handles()
            .iter()
            .map(|h| self.report_for(&h.lock()))
            .collect()
    }

    fn report_for(&self, agent: &Agent) -> AgentStatusReport {
        AgentStatusReport {
            id: agent.id.clone(),
            agent_type: agent.agent_type.clone(),
            status: agent.status,
            current_task: agent.current_task(),
            active_tasks: agent.active_tasks.iter().map(|t| t.task_id).collect(),
            budget: agent.budget,
            allocated: self.ledger.allocated(&agent.id),
            load_ratio: self.ledger.load_ratio(&agent.id),
            last_heartbeat: agent.last_heartbeat,
            success_rate: agent.performance.success_rate(),
            mean_latency_ms: agent.performance.mean_latency_ms(),
        }
    }

    /// Status, attempts and failure reason of one task.
    pub fn get_task_status(&self, id: TaskId) -> ConductorResult<TaskStatusReport> {
        self.queue
            .get(id)
            .map(|t| TaskStatusReport::from_task(&t))
            .ok_or(ConductorError::TaskNotFound(id))
    }

    /// Queue counters.
    pub fn get_queue_stats(&self) -> QueueStats {
        self.queue.stats(self.clock.now())
    }

    /// Current ledger utilization.
    pub fn ledger_snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    /// Agents that are not Offline.
    pub fn instance_count(&self) -> usize {
        self.agent_handles()
            .iter()
            .filter(|h| h.lock().status != AgentStatus::Offline)
            .count()
    }

    /// Idle agents, most recently registered first.
    pub fn idle_agents(&self) -> Vec<AgentId> {
        let mut idle: Vec<AgentId> = self
            .agent_handles()
            .iter()
            .filter_map(|h| {
                let agent = h.lock();
                (agent.status == AgentStatus::Idle && agent.active_tasks.is_empty())
                    .then(|| agent.id.clone())
            })
            .collect();
        idle.reverse();
        idle
    }

    /// Strategy used by [`Coordinator::assign_next`].
    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.balancer.strategy()
    }

    /// Swap the load-balancing strategy; takes effect on the next assignment.
    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        if strategy != self.balancer.strategy() {
            info!(strategy = %strategy, "Load balancing strategy changed");
            self.balancer.set_strategy(strategy);
        }
    }

    /// The event bus every state change is published on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.events.subscribe()
    }

    /// Fires when work may have become assignable.
    pub fn ready_signal(&self) -> Arc<Notify> {
        self.queue.ready_signal()
    }

    /// Refuse further submissions.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// True once [`Coordinator::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
