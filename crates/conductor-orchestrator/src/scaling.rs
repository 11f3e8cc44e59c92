use crate::coordinator::Coordinator;
use crate::events::OrchestratorEvent;
use crate::types::AgentSpec;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use conductor_core::{AgentId, ConductorError, ConductorResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Creates and destroys agent instances on behalf of the Scaling Controller.
///
/// Failures are reported back but never fatal: the controller logs them and
/// tries again on its next evaluation.
#[async_trait]
pub trait AgentLifecycle: Send + Sync {
    /// Start a new instance of `agent_type` and describe it for registration.
    async fn create_instance(&self, agent_type: &str) -> ConductorResult<AgentSpec>;

    /// Stop a running instance.
    async fn terminate_instance(&self, agent_id: &AgentId) -> ConductorResult<()>;
}

/// Bounds, thresholds and weights driving scaling decisions.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    /// Pool floor.
    pub min_agents: usize,
    /// Pool ceiling.
    pub max_agents: usize,
    /// Load above which the pool grows.
    pub scale_up_threshold: f64,
    /// Load below which the pool shrinks.
    pub scale_down_threshold: f64,
    /// Minimum spacing between scaling actions.
    pub cooldown: Duration,
    /// Multiplier applied on scale-up.
    pub scale_factor: f64,
    /// Weight of ledger utilization in the load signal.
    pub utilization_weight: f64,
    /// Weight of pending tasks per agent in the load signal.
    pub queue_weight: f64,
    /// Agent type requested on scale-up.
    pub agent_type: String,
}

impl ScalingPolicy {
    /// Weighted load signal.
    pub fn load(&self, utilization: f64, pending: usize, instances: usize) -> f64 {
        let depth = pending as f64 / instances.max(1) as f64;
        self.utilization_weight * utilization + self.queue_weight * depth
    }

    fn check_bounds(&self, requested: usize) -> ConductorResult<()> {
        if requested < self.min_agents || requested > self.max_agents {
            return Err(ConductorError::ScalingBoundViolation {
                requested,
                min: self.min_agents,
                max: self.max_agents,
            });
        }
        Ok(())
    }
}

/// Why an evaluation took no action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// The last action is more recent than the cooldown period.
    Cooldown,
    /// Load sits between the two thresholds.
    WithinThresholds,
    /// Load calls for growth but the pool is at `max_agents`.
    AtMaxBound,
    /// Load calls for shrinking but the pool is at `min_agents`.
    AtMinBound,
    /// Already at the requested size.
    NoChange,
    /// The lifecycle collaborator failed every request.
    LifecycleFailed,
}

/// Outcome of one scaling evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScalingDecision {
    /// Grow the pool.
    ScaleUp {
        /// Size before.
        from: usize,
        /// Size after.
        to: usize,
    },
    /// Shrink the pool.
    ScaleDown {
        /// Size before.
        from: usize,
        /// Size after.
        to: usize,
    },
    /// Leave the pool as it is.
    Hold {
        /// Why nothing changed.
        reason: HoldReason,
    },
}

impl ScalingDecision {
    /// True for ScaleUp and ScaleDown.
    pub fn is_action(&self) -> bool {
        !matches!(self, ScalingDecision::Hold { .. })
    }
}

/// Pure decision step: what to do with `count` instances under `load`.
pub fn decide(
    policy: &ScalingPolicy,
    count: usize,
    load: f64,
    last_action_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ScalingDecision {
    if last_action_at.is_some_and(|at| now - at < policy.cooldown) {
        return ScalingDecision::Hold {
            reason: HoldReason::Cooldown,
        };
    }
    if count < policy.min_agents {
        return ScalingDecision::ScaleUp {
            from: count,
            to: policy.min_agents,
        };
    }
    if count > policy.max_agents {
        return ScalingDecision::ScaleDown {
            from: count,
            to: policy.max_agents,
        };
    }
    if load >= policy.scale_up_threshold {
        if count >= policy.max_agents {
            return ScalingDecision::Hold {
                reason: HoldReason::AtMaxBound,
            };
        }
        let grown = (count as f64 * policy.scale_factor).ceil() as usize;
        return ScalingDecision::ScaleUp {
            from: count,
            to: grown.max(count + 1).min(policy.max_agents),
        };
    }
    if load <= policy.scale_down_threshold {
        if count <= policy.min_agents {
            return ScalingDecision::Hold {
                reason: HoldReason::AtMinBound,
            };
        }
        let shrunk = (count as f64 / policy.scale_factor).floor() as usize;
        return ScalingDecision::ScaleDown {
            from: count,
            to: shrunk.min(count - 1).max(policy.min_agents),
        };
    }
    ScalingDecision::Hold {
        reason: HoldReason::WithinThresholds,
    }
}

#[derive(Debug, Default)]
struct ScalingState {
    last_action_at: Option<DateTime<Utc>>,
    last_decision: Option<ScalingDecision>,
    last_load: f64,
}

/// Snapshot returned by `get_scaling_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingStatus {
    /// Registered healthy agents.
    pub instance_count: usize,
    /// Pool floor.
    pub min_agents: usize,
    /// Pool ceiling.
    pub max_agents: usize,
    /// Ledger utilization.
    pub utilization: f64,
    /// Tasks waiting in the queue.
    pub pending_tasks: usize,
    /// Current weighted load signal.
    pub load: f64,
    /// Load signal at the last evaluation.
    pub last_load: f64,
    /// Outcome of the last evaluation.
    pub last_decision: Option<ScalingDecision>,
    /// When the pool was last resized.
    pub last_action_at: Option<DateTime<Utc>>,
    /// Whether the next action is held back by the cooldown.
    pub in_cooldown: bool,
}

/// Periodically sizes the agent pool from ledger utilization and queue
/// depth. Reads coordinator snapshots and acts only through its public API.
pub struct ScalingController {
    coordinator: Arc<Coordinator>,
    lifecycle: Arc<dyn AgentLifecycle>,
    policy: RwLock<ScalingPolicy>,
    state: Mutex<ScalingState>,
    /// Serializes evaluations across lifecycle awaits.
    gate: tokio::sync::Mutex<()>,
}

impl ScalingController {
    /// Controller over `coordinator`, acting through `lifecycle`.
    pub fn new(
        coordinator: Arc<Coordinator>,
        lifecycle: Arc<dyn AgentLifecycle>,
        policy: ScalingPolicy,
    ) -> Self {
        Self {
            coordinator,
            lifecycle,
            policy: RwLock::new(policy),
            state: Mutex::new(ScalingState::default()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Current policy.
    pub fn policy(&self) -> ScalingPolicy {
        self.policy.read().clone()
    }

    /// Swap the policy in place, e.g. on config reload.
    pub fn update_policy(&self, policy: ScalingPolicy) -> ConductorResult<()> {
        if policy.min_agents > policy.max_agents {
            return Err(ConductorError::ScalingBoundViolation {
                requested: policy.min_agents,
                min: policy.min_agents,
                max: policy.max_agents,
            });
        }
        info!(
            min = policy.min_agents,
            max = policy.max_agents,
            up = policy.scale_up_threshold,
            down = policy.scale_down_threshold,
            "Scaling policy updated"
        );
        *self.policy.write() = policy;
        Ok(())
    }

    fn current_load(&self, policy: &ScalingPolicy) -> (usize, f64, usize, f64) {
        let instances = self.coordinator.instance_count();
        let utilization = self.coordinator.ledger_snapshot().utilization;
        let pending = self.coordinator.get_queue_stats().pending;
        let load = policy.load(utilization, pending, instances);
        (instances, utilization, pending, load)
    }

    /// One evaluation tick.
    pub async fn evaluate(&self) -> ConductorResult<ScalingDecision> {
        let _gate = self.gate.lock().await;
        let now = self.coordinator.now();
        let policy = self.policy();
        let (count, utilization, pending, load) = self.current_load(&policy);
        let last_action_at = {
            let mut state = self.state.lock();
            state.last_load = load;
            state.last_action_at
        };

        let planned = decide(&policy, count, load, last_action_at, now);
        debug!(
            instances = count,
            utilization,
            pending,
            load,
            decision = ?planned,
            "Scaling evaluated"
        );
        Ok(self.execute(&policy, planned, now).await)
    }

    /// Resize to exactly `target` instances, bypassing thresholds but not
    /// the cooldown.
    pub async fn scale_to(&self, target: usize) -> ConductorResult<ScalingDecision> {
        let _gate = self.gate.lock().await;
        let now = self.coordinator.now();
        let policy = self.policy();
        policy.check_bounds(target)?;

        let last_action_at = self.state.lock().last_action_at;
        let count = self.coordinator.instance_count();
        let planned = if last_action_at.is_some_and(|at| now - at < policy.cooldown) {
            ScalingDecision::Hold {
                reason: HoldReason::Cooldown,
            }
        } else if target > count {
            ScalingDecision::ScaleUp {
                from: count,
                to: target,
            }
        } else if target < count {
            ScalingDecision::ScaleDown {
                from: count,
                to: target,
            }
        } else {
            ScalingDecision::Hold {
                reason: HoldReason::NoChange,
            }
        };
        Ok(self.execute(&policy, planned, now).await)
    }

    /// Carry out a planned decision and report what actually happened.
    async fn execute(
        &self,
        policy: &ScalingPolicy,
        planned: ScalingDecision,
        now: DateTime<Utc>,
    ) -> ScalingDecision {
        let outcome = match planned {
            ScalingDecision::ScaleUp { from, to } => {
                let created = self.grow(&policy.agent_type, to - from).await;
                if created == 0 {
                    ScalingDecision::Hold {
                        reason: HoldReason::LifecycleFailed,
                    }
                } else {
                    ScalingDecision::ScaleUp {
                        from,
                        to: from + created,
                    }
                }
            }
            ScalingDecision::ScaleDown { from, to } => {
                let removed = self.shrink(from - to).await;
                if removed == 0 {
                    ScalingDecision::Hold {
                        reason: HoldReason::LifecycleFailed,
                    }
                } else {
                    ScalingDecision::ScaleDown {
                        from,
                        to: from - removed,
                    }
                }
            }
            hold @ ScalingDecision::Hold { .. } => hold,
        };

        {
            let mut state = self.state.lock();
            if outcome.is_action() {
                state.last_action_at = Some(now);
            }
            state.last_decision = Some(outcome);
        }
        if outcome.is_action() {
            info!(decision = ?outcome, "Scaling action taken");
        }
        self.coordinator
            .events()
            .publish(now, OrchestratorEvent::Scaling { decision: outcome });
        outcome
    }

    async fn grow(&self, agent_type: &str, n: usize) -> usize {
        let mut created = 0;
        for _ in 0..n {
            match self.lifecycle.create_instance(agent_type).await {
                Ok(spec) => {
                    let agent_id = spec.id.clone();
                    match self.coordinator.register_agent(spec) {
                        Ok(_) => created += 1,
                        Err(e) => {
                            warn!(
                                agent_id = %agent_id,
                                error = %e,
                                "Created instance could not be registered; terminating it"
                            );
                            // Nothing else tracks an unregistered instance.
                            if let Err(e) = self.lifecycle.terminate_instance(&agent_id).await {
                                error!(
                                    agent_id = %agent_id,
                                    error = %e,
                                    "Terminating unregistered instance failed"
                                );
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, agent_type, "Instance creation failed; will retry"),
            }
        }
        created
    }

    /// Terminate up to `n` idle agents, newest first.
    async fn shrink(&self, n: usize) -> usize {
        let mut removed = 0;
        for agent_id in self.coordinator.idle_agents().into_iter().take(n) {
            if let Err(e) = self.lifecycle.terminate_instance(&agent_id).await {
                warn!(agent_id = %agent_id, error = %e, "Instance termination failed; will retry");
                continue;
            }
            match self.coordinator.unregister_agent(&agent_id) {
                Ok(()) | Err(ConductorError::AgentNotFound(_)) => removed += 1,
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Unregister after termination failed"),
            }
        }
        removed
    }

    /// Pool size, load and the last decision.
    pub fn get_scaling_status(&self) -> ScalingStatus {
        let policy = self.policy();
        let now = self.coordinator.now();
        let (instances, utilization, pending, load) = self.current_load(&policy);
        let state = self.state.lock();
        ScalingStatus {
            instance_count: instances,
            min_agents: policy.min_agents,
            max_agents: policy.max_agents,
            utilization,
            pending_tasks: pending,
            load,
            last_load: state.last_load,
            last_decision: state.last_decision,
            last_action_at: state.last_action_at,
            in_cooldown: state
                .last_action_at
                .is_some_and(|at| now - at < policy.cooldown),
        }
    }
}
