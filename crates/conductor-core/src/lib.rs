//! Core types and error definitions for the Conductor orchestration core.
//!
//! This crate provides the foundational types shared by the orchestrator,
//! including identifiers, resource vectors, the error taxonomy and tracing
//! initialisation.
//!
//! # Main types
//!
//! - [`ConductorError`] — Unified error enum covering queue, ledger, registry and scaling failures.
//! - [`ConductorResult`] — Convenience alias for `Result<T, ConductorError>`.
//! - [`AgentId`] / [`TaskId`] / [`AllocationId`] — Identifiers used for id-based lookups.
//! - [`ResourceVector`] — cpu / memory / disk / network quantities.

/// Identifier newtypes.
pub mod ids;
/// Resource quantities and arithmetic.
pub mod resource;
/// Tracing subscriber initialisation.
pub mod telemetry;

pub use ids::{AgentId, AllocationId, TaskId};
pub use resource::ResourceVector;
pub use telemetry::{init_tracing, LoggingConfig};

// --- Error types ---

/// Top-level error type for the Conductor core.
///
/// Queue, ledger and registry errors are returned synchronously to the
/// immediate caller and never retried by the component that raised them.
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// The task queue reached its configured capacity.
    #[error("Queue full: capacity {capacity} reached")]
    QueueFull {
        /// Configured maximum number of pending tasks.
        capacity: usize,
    },

    /// A submitted task references a dependency id the queue does not know.
    #[error("Invalid dependency: task {task} depends on unknown task {dependency}")]
    InvalidDependency {
        /// The task being submitted.
        task: TaskId,
        /// The unknown dependency id.
        dependency: TaskId,
    },

    /// No healthy agent offers the capabilities a ready task needs.
    #[error("No eligible agent for any ready task")]
    NoEligibleAgent,

    /// The queue holds no task whose dependencies are satisfied.
    #[error("No ready task")]
    NoReadyTask,

    /// An allocation would exceed an agent budget or the system capacity.
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// An agent with the same id is already registered.
    #[error("Duplicate agent: {0}")]
    DuplicateAgent(AgentId),

    /// A task with the same id was already submitted.
    #[error("Duplicate task: {0}")]
    DuplicateTask(TaskId),

    /// The agent id is unknown to the registry.
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// The task id is unknown, or the task was already taken by a concurrent caller.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// A scaling request falls outside `[min, max]`.
    #[error("Scaling bound violation: requested {requested}, allowed [{min}, {max}]")]
    ScalingBoundViolation {
        /// Requested instance count.
        requested: usize,
        /// Configured minimum.
        min: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A status transition that the state machine does not allow.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The orchestrator is shutting down and refuses new work.
    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    /// The agent-lifecycle collaborator failed to create or terminate an instance.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConductorError {
    /// Stable reason code used in status reports and events.
    pub fn code(&self) -> &'static str {
        match self {
            ConductorError::QueueFull { .. } => "QUEUE_FULL",
            ConductorError::InvalidDependency { .. } => "INVALID_DEPENDENCY",
            ConductorError::NoEligibleAgent => "NO_ELIGIBLE_AGENT",
            ConductorError::NoReadyTask => "NO_READY_TASK",
            ConductorError::InsufficientResources(_) => "INSUFFICIENT_RESOURCES",
            ConductorError::DuplicateAgent(_) => "DUPLICATE_AGENT",
            ConductorError::DuplicateTask(_) => "DUPLICATE_TASK",
            ConductorError::AgentNotFound(_) => "AGENT_NOT_FOUND",
            ConductorError::TaskNotFound(_) => "TASK_NOT_FOUND",
            ConductorError::ScalingBoundViolation { .. } => "SCALING_BOUND_VIOLATION",
            ConductorError::InvalidTransition(_) => "INVALID_TRANSITION",
            ConductorError::ShuttingDown => "SHUTTING_DOWN",
            ConductorError::Lifecycle(_) => "LIFECYCLE",
            ConductorError::Config(_) => "CONFIG",
            ConductorError::Json(_) => "JSON",
            ConductorError::Io(_) => "IO",
        }
    }
}

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;
