use crate::scaling::ScalingPolicy;
use crate::strategy::LoadBalancingStrategy;
use conductor_core::{ConductorError, ConductorResult, LoggingConfig, ResourceVector};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-dimension system capacity used when none is configured.
pub const UNBOUNDED_CAPACITY: u64 = i64::MAX as u64;

/// Upper bound on any configured duration (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3_600;

/// Orchestrator settings. Durations are whole seconds unless the field name
/// says otherwise. Every field has a default, so a partial TOML file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Floor on the managed pool size.
    pub min_agents: usize,
    /// Ceiling on the managed pool size.
    pub max_agents: usize,
    /// Strategy used by the assignment loop.
    pub load_balancing_strategy: LoadBalancingStrategy,
    /// Expected heartbeat period.
    pub health_check_interval: u64,
    /// Missed heartbeats before an agent is Degraded.
    pub failure_threshold: u32,
    /// Time a Degraded agent has to recover before it is Offline.
    pub offline_grace_period: u64,
    /// Load above which the pool grows.
    pub scale_up_threshold: f64,
    /// Load below which the pool shrinks.
    pub scale_down_threshold: f64,
    /// Minimum spacing between two scaling actions.
    pub cooldown_period: u64,
    /// Multiplier applied to the pool size on scale-up.
    pub scale_factor: f64,
    /// Attempts before a task fails for good.
    pub max_task_attempts: u32,
    /// Non-terminal tasks the queue accepts.
    pub queue_max_size: usize,

    /// First retry delay, doubled per attempt.
    pub retry_backoff_base_ms: u64,
    /// Cap on the retry delay.
    pub retry_backoff_max_ms: u64,
    /// How long an agent has to acknowledge a cancellation.
    pub cancel_timeout: u64,
    /// Terminal tasks are kept this long for status queries.
    pub task_retention: u64,
    /// Offline agents are kept this long before removal.
    pub agent_retention: u64,
    /// Optional lease on every allocation.
    pub allocation_ttl: Option<u64>,
    /// Fallback tick of the assignment loop.
    pub assignment_interval_ms: u64,
    /// Period of the health and lease sweep.
    pub sweep_interval: u64,
    /// Period of the scaling evaluation.
    pub scaling_interval: u64,
    /// Weight of ledger utilization in the scaling load signal.
    pub utilization_weight: f64,
    /// Weight of pending tasks per agent in the scaling load signal.
    pub queue_weight: f64,
    /// Agent type requested from the lifecycle collaborator on scale-up.
    pub default_agent_type: String,
    /// Total resources the ledger may hand out.
    pub system_capacity: ResourceVector,
    /// Log filter and format.
    pub logging: LoggingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_agents: 1,
            max_agents: 10,
            load_balancing_strategy: LoadBalancingStrategy::LeastLoaded,
            health_check_interval: 30,
            failure_threshold: 3,
            offline_grace_period: 60,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown_period: 300,
            scale_factor: 2.0,
            max_task_attempts: 3,
            queue_max_size: 10_000,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 60_000,
            cancel_timeout: 30,
            task_retention: 3_600,
            agent_retention: 600,
            allocation_ttl: None,
            assignment_interval_ms: 250,
            sweep_interval: 5,
            scaling_interval: 15,
            utilization_weight: 1.0,
            queue_weight: 0.25,
            default_agent_type: "worker".to_string(),
            system_capacity: ResourceVector::new(
                UNBOUNDED_CAPACITY,
                UNBOUNDED_CAPACITY,
                UNBOUNDED_CAPACITY,
                UNBOUNDED_CAPACITY,
            ),
            logging: LoggingConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> ConductorResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ConductorError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> ConductorResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConductorError::Config(format!(
                "Failed to read config '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.min_agents > self.max_agents {
            return Err(ConductorError::ScalingBoundViolation {
                requested: self.min_agents,
                min: self.min_agents,
                max: self.max_agents,
            });
        }
        if self.max_agents == 0 {
            return Err(ConductorError::Config("max_agents must be at least 1".into()));
        }
        if self.scale_down_threshold < 0.0
            || self.scale_down_threshold >= self.scale_up_threshold
        {
            return Err(ConductorError::Config(format!(
                "scale_down_threshold ({}) must be non-negative and below scale_up_threshold ({})",
                self.scale_down_threshold, self.scale_up_threshold
            )));
        }
        if self.scale_factor.is_nan() || self.scale_factor <= 1.0 {
            return Err(ConductorError::Config(format!(
                "scale_factor must be greater than 1, got {}",
                self.scale_factor
            )));
        }
        if self.health_check_interval == 0
            || self.failure_threshold == 0
            || self.sweep_interval == 0
            || self.scaling_interval == 0
            || self.assignment_interval_ms == 0
        {
            return Err(ConductorError::Config(
                "intervals and failure_threshold must be non-zero".into(),
            ));
        }
        if self.max_task_attempts == 0 {
            return Err(ConductorError::Config("max_task_attempts must be at least 1".into()));
        }
        if self.queue_max_size == 0 {
            return Err(ConductorError::Config("queue_max_size must be at least 1".into()));
        }
        if self.utilization_weight < 0.0 || self.queue_weight < 0.0 {
            return Err(ConductorError::Config("load weights must be non-negative".into()));
        }
        let durations = [
            ("health_check_interval", self.health_check_interval),
            ("offline_grace_period", self.offline_grace_period),
            ("cooldown_period", self.cooldown_period),
            ("cancel_timeout", self.cancel_timeout),
            ("task_retention", self.task_retention),
            ("agent_retention", self.agent_retention),
            ("allocation_ttl", self.allocation_ttl.unwrap_or(0)),
            ("sweep_interval", self.sweep_interval),
            ("scaling_interval", self.scaling_interval),
            ("retry_backoff_base_ms", self.retry_backoff_base_ms / 1_000),
            ("retry_backoff_max_ms", self.retry_backoff_max_ms / 1_000),
            ("assignment_interval_ms", self.assignment_interval_ms / 1_000),
            (
                "health_check_interval * failure_threshold",
                self.health_check_interval
                    .saturating_mul(u64::from(self.failure_threshold)),
            ),
        ];
        if let Some((name, secs)) = durations.iter().find(|(_, secs)| *secs > MAX_DURATION_SECS) {
            return Err(ConductorError::Config(format!(
                "{name} ({secs}s) exceeds the maximum of {MAX_DURATION_SECS}s"
            )));
        }
        Ok(())
    }

    /// Scaling thresholds and bounds derived from this config.
    pub fn scaling_policy(&self) -> ScalingPolicy {
        ScalingPolicy {
            min_agents: self.min_agents,
            max_agents: self.max_agents,
            scale_up_threshold: self.scale_up_threshold,
            scale_down_threshold: self.scale_down_threshold,
            cooldown: seconds(self.cooldown_period),
            scale_factor: self.scale_factor,
            utilization_weight: self.utilization_weight,
            queue_weight: self.queue_weight,
            agent_type: self.default_agent_type.clone(),
        }
    }

    /// Retry budget derived from this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_task_attempts,
            backoff_base_ms: self.retry_backoff_base_ms,
            backoff_max_ms: self.retry_backoff_max_ms,
        }
    }

    /// Expected heartbeat period.
    pub fn health_check_interval(&self) -> chrono::Duration {
        seconds(self.health_check_interval)
    }

    /// Grace period before a Degraded agent goes Offline.
    pub fn offline_grace_period(&self) -> chrono::Duration {
        seconds(self.offline_grace_period)
    }

    /// How long an agent has to acknowledge a cancellation.
    pub fn cancel_timeout(&self) -> chrono::Duration {
        seconds(self.cancel_timeout)
    }

    /// How long terminal tasks stay queryable.
    pub fn task_retention(&self) -> chrono::Duration {
        seconds(self.task_retention)
    }

    /// How long Offline agents stay in the registry.
    pub fn agent_retention(&self) -> chrono::Duration {
        seconds(self.agent_retention)
    }

    /// Lease on each allocation, if configured.
    pub fn allocation_ttl(&self) -> Option<chrono::Duration> {
        self.allocation_ttl.map(seconds)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::try_seconds(i64::try_from(secs.min(MAX_DURATION_SECS)).unwrap_or(0))
        .unwrap_or(chrono::Duration::MAX)
}

/// Retry budget and backoff for failed task executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based):
    /// `base * 2^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: u32) -> chrono::Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.backoff_max_ms);
        chrono::Duration::try_milliseconds(i64::try_from(delay).unwrap_or(i64::MAX))
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Whether `attempts` used up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
