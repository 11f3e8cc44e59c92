//! Multi-agent task orchestration core.
//!
//! Registers worker agents, assigns queued tasks to them under a selectable
//! load-balancing strategy, tracks per-agent resource budgets, recovers work
//! from failed agents and resizes the agent pool with load.
//!
//! # Main types
//!
//! - [`Coordinator`] — Agent registry, task assignment, health supervision and recovery.
//! - [`TaskQueue`] — Priority queue with dependency gating and exactly-once `take`.
//! - [`ResourceLedger`] — All-or-nothing cpu / memory / disk / network allocations.
//! - [`LoadBalancingStrategy`] — The five agent-selection policies.
//! - [`ScalingController`] — Grows and shrinks the pool through an [`AgentLifecycle`].
//! - [`OrchestratorRuntime`] — Background assignment, health, sweep and scaling loops.
//! - [`OrchestratorConfig`] — TOML configuration with hot reload via [`ConfigWatcher`].

/// Time source abstraction.
pub mod clock;
/// Orchestrator configuration and retry policy.
pub mod config;
/// Config hot-reload watcher.
pub mod config_watcher;
/// Agent registry, assignment, results, cancellation and recovery.
pub mod coordinator;
/// State-transition event bus and JSONL event log.
pub mod events;
/// Heartbeats and the agent health state machine.
pub mod health;
/// Resource budgets and allocations.
pub mod ledger;
/// Background loops and shutdown.
pub mod runtime;
/// Pool sizing decisions and the agent lifecycle seam.
pub mod scaling;
/// Load-balancing strategies.
pub mod strategy;
/// Priority task queue.
pub mod task_queue;
/// Shared orchestration types (Agent, Task, Assignment, status reports).
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{OrchestratorConfig, RetryPolicy};
pub use config_watcher::ConfigWatcher;
pub use coordinator::{Coordinator, SweepReport};
pub use events::{EventBus, EventLog, EventRecord, OrchestratorEvent};
pub use health::HealthReport;
pub use ledger::{AgentUsage, LedgerSnapshot, ResourceAllocation, ResourceLedger};
pub use runtime::OrchestratorRuntime;
pub use scaling::{
    AgentLifecycle, HoldReason, ScalingController, ScalingDecision, ScalingPolicy, ScalingStatus,
};
pub use strategy::{Balancer, Candidate, LoadBalancingStrategy};
pub use task_queue::{QueueStats, TaskQueue};
pub use types::{
    Agent, AgentSpec, AgentStatus, AgentStatusReport, Assignment, FailureReason, Task,
    TaskOutcome, TaskStatus, TaskStatusReport,
};
