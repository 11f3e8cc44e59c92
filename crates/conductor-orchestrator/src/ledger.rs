use chrono::{DateTime, Duration, Utc};
use conductor_core::{AgentId, AllocationId, ConductorError, ConductorResult, ResourceVector, TaskId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Resources granted to one task on one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    /// Allocation handle.
    pub id: AllocationId,
    /// Agent the resources were taken from.
    pub agent_id: AgentId,
    /// Task holding the grant.
    pub task_id: TaskId,
    /// Granted amount.
    pub granted: ResourceVector,
    /// When the grant was made.
    pub granted_at: DateTime<Utc>,
    /// Lease end; `None` means the grant never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct AgentAccount {
    budget: ResourceVector,
    used: ResourceVector,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AgentId, AgentAccount>,
    allocations: HashMap<AllocationId, ResourceAllocation>,
    total_budget: ResourceVector,
    total_used: ResourceVector,
}

impl LedgerState {
    /// Check-and-grant as one step. Callers hold the ledger lock.
    fn grant(
        &mut self,
        capacity: &ResourceVector,
        agent: &AgentId,
        task: TaskId,
        requirement: ResourceVector,
        now: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> ConductorResult<ResourceAllocation> {
        let account = self
            .accounts
            .get(agent)
            .ok_or_else(|| ConductorError::AgentNotFound(agent.clone()))?;

        let agent_after = account
            .used
            .checked_add(&requirement)
            .filter(|after| after.fits_within(&account.budget))
            .ok_or_else(|| {
                ConductorError::InsufficientResources(format!(
                    "agent {agent}: requested {requirement}, remaining {}",
                    account.budget.saturating_sub(&account.used)
                ))
            })?;
        let system_after = self
            .total_used
            .checked_add(&requirement)
            .filter(|after| after.fits_within(capacity))
            .ok_or_else(|| {
                ConductorError::InsufficientResources(format!(
                    "system: requested {requirement}, remaining {}",
                    capacity.saturating_sub(&self.total_used)
                ))
            })?;

        let allocation = ResourceAllocation {
            id: AllocationId::new(),
            agent_id: agent.clone(),
            task_id: task,
            granted: requirement,
            granted_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        };
        if let Some(account) = self.accounts.get_mut(agent) {
            account.used = agent_after;
        }
        self.total_used = system_after;
        self.allocations.insert(allocation.id, allocation.clone());
        Ok(allocation)
    }

    fn reclaim(&mut self, id: AllocationId) -> Option<ResourceAllocation> {
        let allocation = self.allocations.remove(&id)?;
        if let Some(account) = self.accounts.get_mut(&allocation.agent_id) {
            account.used = account.used.saturating_sub(&allocation.granted);
        }
        self.total_used = self.total_used.saturating_sub(&allocation.granted);
        Some(allocation)
    }
}

/// Per-agent usage in a [`LedgerSnapshot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentUsage {
    /// Agent id.
    pub agent_id: AgentId,
    /// Registered budget.
    pub budget: ResourceVector,
    /// Currently allocated.
    pub used: ResourceVector,
    /// Dominant share of `used` over `budget`.
    pub load_ratio: f64,
}

/// Point-in-time utilization view for the Scaling Controller and monitors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// System-declared capacity.
    pub capacity: ResourceVector,
    /// Sum of registered agent budgets.
    pub total_budget: ResourceVector,
    /// Sum of active allocations.
    pub total_used: ResourceVector,
    /// Dominant share of `total_used` over `total_budget`.
    pub utilization: f64,
    /// Live allocations across all agents.
    pub active_allocations: usize,
    /// Per-agent breakdown.
    pub agents: Vec<AgentUsage>,
}

/// Tracks aggregate and per-agent resource budgets and grants all-or-nothing
/// allocations against them.
pub struct ResourceLedger {
    capacity: ResourceVector,
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    /// Empty ledger bounded by `capacity`.
    pub fn new(capacity: ResourceVector) -> Self {
        Self {
            capacity,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Open an account for an agent. The sum of all budgets may not exceed
    /// the declared system capacity.
    pub fn register_agent(&self, agent: &AgentId, budget: ResourceVector) -> ConductorResult<()> {
        let mut state = self.state.lock();
        if state.accounts.contains_key(agent) {
            return Err(ConductorError::DuplicateAgent(agent.clone()));
        }
        let total = state
            .total_budget
            .checked_add(&budget)
            .filter(|total| total.fits_within(&self.capacity))
            .ok_or_else(|| {
                ConductorError::InsufficientResources(format!(
                    "budget {budget} for agent {agent} exceeds remaining system capacity {}",
                    self.capacity.saturating_sub(&state.total_budget)
                ))
            })?;
        state.total_budget = total;
        state.accounts.insert(
            agent.clone(),
            AgentAccount {
                budget,
                used: ResourceVector::zero(),
            },
        );
        debug!(agent_id = %agent, %budget, "Ledger account opened");
        Ok(())
    }

    /// Close an agent's account, reclaiming every allocation it still holds.
    pub fn deregister_agent(&self, agent: &AgentId) -> Vec<ResourceAllocation> {
        let mut state = self.state.lock();
        let ids: Vec<AllocationId> = state
            .allocations
            .values()
            .filter(|a| &a.agent_id == agent)
            .map(|a| a.id)
            .collect();
        let released: Vec<ResourceAllocation> =
            ids.into_iter().filter_map(|id| state.reclaim(id)).collect();
        if let Some(account) = state.accounts.remove(agent) {
            state.total_budget = state.total_budget.saturating_sub(&account.budget);
        }
        released
    }

    /// Grant `requirement` on `agent` for `task`, or deny with
    /// `InsufficientResources`. Never blocks and never grants partially.
    pub fn allocate(
        &self,
        agent: &AgentId,
        task: TaskId,
        requirement: ResourceVector,
        now: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> ConductorResult<ResourceAllocation> {
        let mut state = self.state.lock();
        let allocation = state.grant(&self.capacity, agent, task, requirement, now, ttl)?;
        debug!(
            agent_id = %agent,
            task_id = %task,
            allocation_id = %allocation.id,
            "Resources allocated"
        );
        Ok(allocation)
    }

    /// Release `displaced` and grant `requirement` in one critical section.
    /// If the new grant would not fit even after the release, nothing changes.
    pub fn reallocate(
        &self,
        displaced: AllocationId,
        agent: &AgentId,
        task: TaskId,
        requirement: ResourceVector,
        now: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> ConductorResult<(ResourceAllocation, ResourceAllocation)> {
        let mut state = self.state.lock();
        let old = state
            .reclaim(displaced)
            .ok_or_else(|| ConductorError::InsufficientResources(format!(
                "allocation {displaced} no longer held"
            )))?;
        match state.grant(&self.capacity, agent, task, requirement, now, ttl) {
            Ok(new) => Ok((old, new)),
            Err(e) => {
                // Put the displaced grant back exactly as it was.
                if let Some(account) = state.accounts.get_mut(&old.agent_id) {
                    account.used = account.used.saturating_add(&old.granted);
                }
                state.total_used = state.total_used.saturating_add(&old.granted);
                state.allocations.insert(old.id, old);
                Err(e)
            }
        }
    }

    /// Reclaim an allocation. Releasing an unknown or already released id is
    /// a no-op that returns `None`.
    pub fn release(&self, id: AllocationId) -> Option<ResourceAllocation> {
        let released = self.state.lock().reclaim(id);
        if let Some(allocation) = &released {
            debug!(
                agent_id = %allocation.agent_id,
                task_id = %allocation.task_id,
                allocation_id = %id,
                "Resources released"
            );
        }
        released
    }

    /// Whether `requirement` would currently be granted on `agent`.
    pub fn can_fit(&self, agent: &AgentId, requirement: &ResourceVector) -> bool {
        let state = self.state.lock();
        let Some(account) = state.accounts.get(agent) else {
            return false;
        };
        let agent_ok = account
            .used
            .checked_add(requirement)
            .is_some_and(|after| after.fits_within(&account.budget));
        let system_ok = state
            .total_used
            .checked_add(requirement)
            .is_some_and(|after| after.fits_within(&self.capacity));
        agent_ok && system_ok
    }

    /// Whether `requirement` would fit on `agent` if `displaced` were released first.
    pub fn can_fit_after_release(
        &self,
        agent: &AgentId,
        displaced: AllocationId,
        requirement: &ResourceVector,
    ) -> bool {
        let state = self.state.lock();
        let (Some(account), Some(old)) =
            (state.accounts.get(agent), state.allocations.get(&displaced))
        else {
            return false;
        };
        let freed = account.used.saturating_sub(&old.granted);
        freed
            .checked_add(requirement)
            .is_some_and(|after| after.fits_within(&account.budget))
    }

    /// Current allocation divided by budget (dominant share). `0.0` for unknown agents.
    pub fn load_ratio(&self, agent: &AgentId) -> f64 {
        let state = self.state.lock();
        state
            .accounts
            .get(agent)
            .map(|a| a.used.dominant_share(&a.budget))
            .unwrap_or(0.0)
    }

    /// Resources currently granted on `agent`.
    pub fn allocated(&self, agent: &AgentId) -> ResourceVector {
        let state = self.state.lock();
        state
            .accounts
            .get(agent)
            .map(|a| a.used)
            .unwrap_or_default()
    }

    /// A live allocation by id.
    pub fn allocation(&self, id: AllocationId) -> Option<ResourceAllocation> {
        self.state.lock().allocations.get(&id).cloned()
    }

    /// System-declared capacity.
    pub fn capacity(&self) -> ResourceVector {
        self.capacity
    }

    /// Current utilization view.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        let mut agents: Vec<AgentUsage> = state
            .accounts
            .iter()
            .map(|(id, a)| AgentUsage {
                agent_id: id.clone(),
                budget: a.budget,
                used: a.used,
                load_ratio: a.used.dominant_share(&a.budget),
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        LedgerSnapshot {
            capacity: self.capacity,
            total_budget: state.total_budget,
            total_used: state.total_used,
            utilization: state.total_used.dominant_share(&state.total_budget),
            active_allocations: state.allocations.len(),
            agents,
        }
    }

    /// Reclaim every allocation whose expiry is at or before `now`.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<ResourceAllocation> {
        let mut state = self.state.lock();
        let expired: Vec<AllocationId> = state
            .allocations
            .values()
            .filter(|a| a.expires_at.is_some_and(|at| at <= now))
            .map(|a| a.id)
            .collect();
        let reclaimed: Vec<ResourceAllocation> =
            expired.into_iter().filter_map(|id| state.reclaim(id)).collect();
        drop(state);

        for allocation in &reclaimed {
            warn!(
                agent_id = %allocation.agent_id,
                task_id = %allocation.task_id,
                allocation_id = %allocation.id,
                "Allocation expired and was reclaimed"
            );
        }
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "Ledger sweep reclaimed expired allocations");
        }
        reclaimed
    }
}
