use conductor_core::AgentId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Policy for picking one agent among the eligible candidates for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Cycle through agents in registration order.
    RoundRobin,
    /// Lowest allocation-to-budget ratio.
    #[default]
    LeastLoaded,
    /// Prefer agents whose capabilities strictly exceed the requirement.
    CapabilityBased,
    /// Avoid agents running lower-priority work; may preempt it.
    PriorityWeighted,
    /// Highest success rate over mean latency.
    Predictive,
}

impl LoadBalancingStrategy {
    /// Snake-case name, as used in config files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastLoaded => "least_loaded",
            Self::CapabilityBased => "capability_based",
            Self::PriorityWeighted => "priority_weighted",
            Self::Predictive => "predictive",
        }
    }

    /// Whether this strategy may displace running work when capacity is short.
    pub fn preempts(self) -> bool {
        matches!(self, Self::PriorityWeighted)
    }
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "least_loaded" => Ok(Self::LeastLoaded),
            "capability_based" => Ok(Self::CapabilityBased),
            "priority_weighted" => Ok(Self::PriorityWeighted),
            "predictive" => Ok(Self::Predictive),
            other => Err(format!("unknown load balancing strategy: {other}")),
        }
    }
}

/// What a strategy sees about one eligible agent.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Agent id.
    pub agent_id: AgentId,
    /// Registration order, used by round-robin.
    pub registration_seq: u64,
    /// Capabilities offered beyond the task's requirement.
    pub extra_capabilities: usize,
    /// Current allocation divided by budget.
    pub load_ratio: f64,
    /// Held tasks with priority below the task being placed.
    pub lower_priority_tasks: usize,
    /// Predictive score (success rate over mean latency).
    pub score: f64,
}

/// Applies the configured [`LoadBalancingStrategy`]. Holds the round-robin
/// cursor so rotation survives across calls.
#[derive(Debug, Default)]
pub struct Balancer {
    strategy: Mutex<LoadBalancingStrategy>,
    last_seq: Mutex<Option<u64>>,
}

impl Balancer {
    /// Balancer starting with `strategy`.
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy: Mutex::new(strategy),
            last_seq: Mutex::new(None),
        }
    }

    /// Active strategy.
    pub fn strategy(&self) -> LoadBalancingStrategy {
        *self.strategy.lock()
    }

    /// Replace the active strategy.
    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        *self.strategy.lock() = strategy;
    }

    /// Pick one candidate with the configured strategy, or `None` if the
    /// slice is empty.
    pub fn select<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        self.select_with(self.strategy(), candidates)
    }

    /// Pick one candidate with an explicit strategy. Round-robin still
    /// advances the shared cursor.
    pub fn select_with<'a>(
        &self,
        strategy: LoadBalancingStrategy,
        candidates: &'a [Candidate],
    ) -> Option<&'a Candidate> {
        if candidates.is_empty() {
            return None;
        }
        match strategy {
            LoadBalancingStrategy::RoundRobin => self.round_robin(candidates),
            LoadBalancingStrategy::LeastLoaded => least_loaded(candidates.iter()),
            LoadBalancingStrategy::CapabilityBased => {
                let superset: Vec<&Candidate> =
                    candidates.iter().filter(|c| c.extra_capabilities > 0).collect();
                if superset.is_empty() {
                    least_loaded(candidates.iter())
                } else {
                    least_loaded(superset.into_iter())
                }
            }
            LoadBalancingStrategy::PriorityWeighted => candidates.iter().min_by(|a, b| {
                a.lower_priority_tasks
                    .cmp(&b.lower_priority_tasks)
                    .then_with(|| by_load(a, b))
            }),
            LoadBalancingStrategy::Predictive => candidates.iter().min_by(|a, b| {
                // Highest score first.
                b.score.total_cmp(&a.score).then_with(|| by_load(a, b))
            }),
        }
    }

    /// Next agent after the last one picked, in registration order, wrapping.
    fn round_robin<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        let mut last = self.last_seq.lock();
        let after_cursor = candidates
            .iter()
            .filter(|c| last.map_or(true, |seq| c.registration_seq > seq))
            .min_by_key(|c| c.registration_seq);
        let picked =
            after_cursor.or_else(|| candidates.iter().min_by_key(|c| c.registration_seq))?;
        *last = Some(picked.registration_seq);
        Some(picked)
    }
}

fn by_load(a: &Candidate, b: &Candidate) -> Ordering {
    a.load_ratio
        .total_cmp(&b.load_ratio)
        .then_with(|| a.registration_seq.cmp(&b.registration_seq))
}

fn least_loaded<'a>(candidates: impl Iterator<Item = &'a Candidate>) -> Option<&'a Candidate> {
    candidates.min_by(|a, b| by_load(a, b))
}
