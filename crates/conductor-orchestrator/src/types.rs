use chrono::{DateTime, Utc};
use conductor_core::{AgentId, AllocationId, ConductorError, ConductorResult, ResourceVector, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// Number of recent results kept in an agent's performance history.
pub const PERFORMANCE_WINDOW: usize = 50;

/// Mean latency assumed for an agent with no history, so new agents score
/// competitively under the predictive strategy.
pub const DEFAULT_LATENCY_MS: f64 = 1_000.0;

// --- Agents ---

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Healthy, holding no task.
    Idle,
    /// Healthy, holding at least one task.
    Busy,
    /// Missed enough heartbeats to be suspect; receives no new work.
    Degraded,
    /// Declared dead. Terminal for this agent instance.
    Offline,
}

impl AgentStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Idle, Busy)
                | (Busy, Idle)
                | (Idle, Degraded)
                | (Busy, Degraded)
                | (Degraded, Idle)
                | (Degraded, Busy)
                | (Degraded, Offline)
        )
    }

    /// Healthy agents may receive new assignments.
    pub fn accepts_work(self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Busy)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Degraded => write!(f, "degraded"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Registration request for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique agent id.
    pub id: AgentId,
    /// Instance type, used by the lifecycle collaborator when scaling.
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    /// Capabilities offered to tasks.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Resources the agent contributes to the ledger.
    pub budget: ResourceVector,
}

fn default_agent_type() -> String {
    "worker".to_string()
}

impl AgentSpec {
    /// Spec with the default agent type and no capabilities.
    pub fn new(id: impl Into<AgentId>, budget: ResourceVector) -> Self {
        Self {
            id: id.into(),
            agent_type: default_agent_type(),
            capabilities: BTreeSet::new(),
            budget,
        }
    }

    /// Set the instance type.
    pub fn with_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = agent_type.into();
        self
    }

    /// Add capabilities.
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities.extend(caps.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct PerformanceSample {
    success: bool,
    latency_ms: u64,
}

/// Rolling window of an agent's recent task outcomes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceHistory {
    samples: VecDeque<PerformanceSample>,
}

impl PerformanceHistory {
    /// Record one finished task.
    pub fn record(&mut self, success: bool, latency_ms: u64) {
        if self.samples.len() == PERFORMANCE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(PerformanceSample {
            success,
            latency_ms,
        });
    }

    /// Fraction of successful results; `1.0` with no history.
    pub fn success_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        let ok = self.samples.iter().filter(|s| s.success).count();
        ok as f64 / self.samples.len() as f64
    }

    /// Mean latency in milliseconds; [`DEFAULT_LATENCY_MS`] with no history.
    pub fn mean_latency_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return DEFAULT_LATENCY_MS;
        }
        let total: u64 = self.samples.iter().map(|s| s.latency_ms).sum();
        total as f64 / self.samples.len() as f64
    }

    /// Predictive score: success rate times inverse mean latency.
    pub fn score(&self) -> f64 {
        self.success_rate() / self.mean_latency_ms().max(1.0)
    }

    /// Samples recorded.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True before the first sample.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A task currently held by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTask {
    /// Held task.
    pub task_id: TaskId,
    /// Priority of the held task.
    pub priority: i32,
    /// Ledger allocation backing the task.
    pub allocation_id: AllocationId,
    /// When the task was bound.
    pub assigned_at: DateTime<Utc>,
}

/// Registry record for one agent. Tasks are referenced by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique id.
    pub id: AgentId,
    /// Instance type.
    pub agent_type: String,
    /// Offered capabilities.
    pub capabilities: BTreeSet<String>,
    /// Ledger budget.
    pub budget: ResourceVector,
    /// Current status.
    pub status: AgentStatus,
    /// Tasks held, oldest first.
    pub active_tasks: Vec<ActiveTask>,
    /// Last accepted heartbeat, clamped to the orchestrator clock.
    pub last_heartbeat: DateTime<Utc>,
    /// Instant the missed-heartbeat threshold was crossed.
    pub degraded_at: Option<DateTime<Utc>>,
    /// When the agent went Offline.
    pub offline_at: Option<DateTime<Utc>>,
    /// Registration instant.
    pub registered_at: DateTime<Utc>,
    /// Monotonic registration order, used by round-robin.
    pub registration_seq: u64,
    /// Recent outcomes and latencies, used by the predictive strategy.
    pub performance: PerformanceHistory,
    /// Set once the agent leaves the registry; a stale handle must not take work.
    #[serde(default)]
    pub retired: bool,
}

impl Agent {
    /// Fresh Idle agent from a registration request.
    pub fn from_spec(spec: AgentSpec, registration_seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: spec.id,
            agent_type: spec.agent_type,
            capabilities: spec.capabilities,
            budget: spec.budget,
            status: AgentStatus::Idle,
            active_tasks: Vec::new(),
            last_heartbeat: now,
            degraded_at: None,
            offline_at: None,
            registered_at: now,
            registration_seq,
            performance: PerformanceHistory::default(),
            retired: false,
        }
    }

    /// Move to `next`, enforcing the state machine. Returns the previous status.
    pub fn transition(&mut self, next: AgentStatus) -> ConductorResult<AgentStatus> {
        let prev = self.status;
        if !prev.can_transition_to(next) {
            return Err(ConductorError::InvalidTransition(format!(
                "agent {}: {prev} -> {next}",
                self.id
            )));
        }
        self.status = next;
        Ok(prev)
    }

    /// The most recently assigned task, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        self.active_tasks.last().map(|t| t.task_id)
    }

    /// Whether the agent holds `task_id`.
    pub fn holds(&self, task_id: TaskId) -> bool {
        self.active_tasks.iter().any(|t| t.task_id == task_id)
    }

    /// Remove a held task, returning its record.
    pub fn release_task(&mut self, task_id: TaskId) -> Option<ActiveTask> {
        let pos = self.active_tasks.iter().position(|t| t.task_id == task_id)?;
        Some(self.active_tasks.remove(pos))
    }

    /// Whether this agent offers every capability in `required`.
    pub fn offers(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Healthy and still registered.
    pub fn accepts_work(&self) -> bool {
        !self.retired && self.status.accepts_work()
    }

    /// Held tasks with priority strictly below `priority`.
    pub fn lower_priority_tasks(&self, priority: i32) -> impl Iterator<Item = &ActiveTask> + '_ {
        self.active_tasks
            .iter()
            .filter(move |t| t.priority < priority)
    }
}

// --- Tasks ---

/// Why a task ended in [`TaskStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum FailureReason {
    /// Every allowed attempt failed.
    AttemptsExhausted {
        /// Error from the final attempt.
        last_error: String,
    },
    /// The submitter cancelled the task.
    Cancelled,
    /// A dependency reached a terminal failure, so this task can never run.
    DependencyFailed {
        /// The dependency that failed.
        dependency: TaskId,
    },
}

impl FailureReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::AttemptsExhausted { .. } => "ATTEMPTS_EXHAUSTED",
            FailureReason::Cancelled => "CANCELLED",
            FailureReason::DependencyFailed { .. } => "DEPENDENCY_FAILED",
        }
    }
}

/// Status of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies, backoff or an agent.
    Pending,
    /// Bound to an agent, not yet acknowledged.
    Assigned,
    /// The agent started it.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed for good.
    Failed {
        /// Why it failed.
        reason: FailureReason,
    },
}

impl TaskStatus {
    /// Completed or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }

    /// Assigned or Running.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }

    /// Lowercase status name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
        }
    }
}

/// A unit of work. The payload is opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Assigned by the queue on enqueue.
    pub id: TaskId,
    /// Human-readable name.
    pub name: String,
    /// Higher is more urgent.
    pub priority: i32,
    /// Every capability an agent must offer.
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    /// Resources reserved while the task runs.
    #[serde(default)]
    pub requirement: ResourceVector,
    /// Tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Earlier deadlines win among equal priorities.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Opaque to the orchestrator.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Current status.
    pub status: TaskStatus,
    /// Number of times the task has been assigned.
    #[serde(default)]
    pub attempts: u32,
    /// Error reported by the last failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Current holder while Assigned or Running.
    #[serde(default)]
    pub assigned_agent: Option<AgentId>,
    /// Ledger allocation while Assigned or Running.
    #[serde(default)]
    pub allocation: Option<AllocationId>,
    /// Submission instant.
    pub submitted_at: DateTime<Utc>,
    /// When the task was bound.
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal status.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Retry backoff: the task is not ready before this instant.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    /// Set while an active task waits for its agent to acknowledge a cancel.
    #[serde(default)]
    pub cancel_requested_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Pending task with priority 0 and no requirements.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            priority: 0,
            required_capabilities: BTreeSet::new(),
            requirement: ResourceVector::zero(),
            dependencies: Vec::new(),
            deadline: None,
            payload: serde_json::Value::Null,
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            assigned_agent: None,
            allocation: None,
            submitted_at: Utc::now(),
            assigned_at: None,
            finished_at: None,
            not_before: None,
            cancel_requested_at: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add capabilities.
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(caps.into_iter().map(Into::into));
        self
    }

    /// Set the resource requirement.
    pub fn with_requirement(mut self, requirement: ResourceVector) -> Self {
        self.requirement = requirement;
        self
    }

    /// Set the tasks that must complete first.
    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set the deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach an opaque payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// What the agent runtime reports when it finishes or abandons a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The task finished.
    Success,
    /// The task failed; eligible for retry.
    Failure {
        /// Error reported by the agent.
        error: String,
    },
}

/// Record of one task placed on one agent, handed to the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    /// Held task.
    pub task_id: TaskId,
    /// Name of the task.
    pub task_name: String,
    /// Agent the task is bound to.
    pub agent_id: AgentId,
    /// Ledger allocation granted for the task.
    pub allocation_id: AllocationId,
    /// Task priority.
    pub priority: i32,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the task was bound.
    pub assigned_at: DateTime<Utc>,
    /// Opaque task payload.
    pub payload: serde_json::Value,
    /// Lower-priority task displaced from the same agent to make room.
    #[serde(default)]
    pub preempted: Option<TaskId>,
}

// --- Status reports ---

/// Structured answer to `get_agent_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusReport {
    /// Unique id.
    pub id: AgentId,
    /// Instance type.
    pub agent_type: String,
    /// Current status.
    pub status: AgentStatus,
    /// Most recently assigned task.
    pub current_task: Option<TaskId>,
    /// Every task the agent holds.
    pub active_tasks: Vec<TaskId>,
    /// Ledger budget.
    pub budget: ResourceVector,
    /// Currently allocated resources.
    pub allocated: ResourceVector,
    /// Allocated divided by budget, dominant dimension.
    pub load_ratio: f64,
    /// Last accepted heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Share of recent tasks that succeeded.
    pub success_rate: f64,
    /// Mean latency of recent tasks.
    pub mean_latency_ms: f64,
}

/// Structured answer to `get_task_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusReport {
    /// Unique id.
    pub id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Times the task has been assigned.
    pub attempts: u32,
    /// Current holder, if any.
    pub assigned_agent: Option<AgentId>,
    /// Reason code for terminal failures.
    pub reason_code: Option<String>,
    /// Error reported by the last failed attempt.
    pub last_error: Option<String>,
}

impl TaskStatusReport {
    /// Report for `task`.
    pub fn from_task(task: &Task) -> Self {
        let reason_code = match &task.status {
            TaskStatus::Failed { reason } => Some(reason.code().to_string()),
            _ => None,
        };
        Self {
            id: task.id,
            status: task.status.clone(),
            attempts: task.attempts,
            assigned_agent: task.assigned_agent.clone(),
            reason_code,
            last_error: task.last_error.clone(),
        }
    }
}
