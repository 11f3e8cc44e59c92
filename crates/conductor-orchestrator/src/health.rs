use crate::coordinator::Coordinator;
use crate::events::OrchestratorEvent;
use crate::types::{ActiveTask, AgentStatus, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use conductor_core::{AgentId, ConductorError, ConductorResult, TaskId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// What one health pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Agents that missed too many heartbeats.
    pub degraded: Vec<AgentId>,
    /// Agents that stayed silent past the grace period.
    pub offline: Vec<AgentId>,
    /// Tasks taken from Offline agents and returned to the queue.
    pub requeued: Vec<TaskId>,
    /// Tasks taken from Offline agents whose attempt budget was spent.
    pub failed: Vec<TaskId>,
    /// Offline agents dropped from the registry after retention.
    pub removed: Vec<AgentId>,
}

impl HealthReport {
    /// True when the pass changed nothing.
    pub fn is_empty(&self) -> bool {
        self.degraded.is_empty()
            && self.offline.is_empty()
            && self.requeued.is_empty()
            && self.failed.is_empty()
            && self.removed.is_empty()
    }
}

/// Whole heartbeat intervals elapsed since `last`.
fn missed_heartbeats(last: DateTime<Utc>, now: DateTime<Utc>, interval: Duration) -> u32 {
    let interval_ms = interval.num_milliseconds().max(1);
    let elapsed_ms = (now - last).num_milliseconds().max(0);
    u32::try_from(elapsed_ms / interval_ms).unwrap_or(u32::MAX)
}

impl Coordinator {
    /// Record a liveness signal stamped `at` by the agent.
    ///
    /// Timestamps ahead of the orchestrator clock are clamped to now.
    /// Out-of-order heartbeats older than the last one seen are ignored. A
    /// Degraded agent whose heartbeat is current again returns to Idle or
    /// Busy. Heartbeats from Offline agents are ignored: a lost instance must
    /// re-register.
    pub fn heartbeat(&self, id: &AgentId, at: DateTime<Utc>) -> ConductorResult<()> {
        let handle = self
            .agent_handle(id)
            .ok_or_else(|| ConductorError::AgentNotFound(id.clone()))?;
        let now = self.clock.now();
        let at = at.min(now);
        let mut agent = handle.lock();

        if agent.status == AgentStatus::Offline {
            warn!(agent_id = %id, "Heartbeat from offline agent ignored");
            return Ok(());
        }
        if at <= agent.last_heartbeat {
            debug!(agent_id = %id, "Stale heartbeat ignored");
            return Ok(());
        }
        agent.last_heartbeat = at;

        if agent.status == AgentStatus::Degraded {
            let missed = missed_heartbeats(at, now, self.config.health_check_interval());
            if missed < self.config.failure_threshold {
                let next = if agent.active_tasks.is_empty() {
                    AgentStatus::Idle
                } else {
                    AgentStatus::Busy
                };
                if self.move_agent(&mut agent, next, now) {
                    agent.degraded_at = None;
                    info!(agent_id = %id, "Agent recovered");
                    drop(agent);
                    self.queue.ready_signal().notify_one();
                }
            }
        }
        Ok(())
    }

    /// One pass of the health state machine over every agent.
    ///
    /// Healthy agents that missed `failure_threshold` heartbeat intervals
    /// become Degraded; Degraded agents silent past the grace period become
    /// Offline and every task they held is returned to the queue (counting as
    /// a failed attempt). Offline agents past `agent_retention` are removed.
    pub fn check_health(&self) -> ConductorResult<HealthReport> {
        let now = self.clock.now();
        let interval = self.config.health_check_interval();
        let threshold = self.config.failure_threshold;
        let grace = self.config.offline_grace_period();
        let retention = self.config.agent_retention();

        let mut report = HealthReport::default();
        let mut orphaned: Vec<(AgentId, Vec<ActiveTask>)> = Vec::new();
        let mut expired: Vec<AgentId> = Vec::new();

        for handle in self.agent_handles() {
            let mut agent = handle.lock();

            if agent.status.accepts_work() {
                let missed = missed_heartbeats(agent.last_heartbeat, now, interval);
                if missed >= threshold {
                    let degraded_at = interval
                        .checked_mul(i32::try_from(threshold).unwrap_or(i32::MAX))
                        .and_then(|silence| agent.last_heartbeat.checked_add_signed(silence))
                        .unwrap_or(now)
                        .min(now);
                    if self.move_agent(&mut agent, AgentStatus::Degraded, now) {
                        agent.degraded_at = Some(degraded_at);
                        warn!(agent_id = %agent.id, missed, "Agent missed heartbeats");
                        report.degraded.push(agent.id.clone());
                    }
                }
            }

            match agent.status {
                AgentStatus::Degraded => {
                    let since = agent.degraded_at.unwrap_or(now);
                    let deadline = since
                        .checked_add_signed(grace)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    if now >= deadline && self.move_agent(&mut agent, AgentStatus::Offline, now) {
                        agent.offline_at = Some(now);
                        let held = std::mem::take(&mut agent.active_tasks);
                        error!(
                            agent_id = %agent.id,
                            held = held.len(),
                            "Agent offline; recovering its tasks"
                        );
                        report.offline.push(agent.id.clone());
                        orphaned.push((agent.id.clone(), held));
                    }
                }
                AgentStatus::Offline => {
                    let removable = agent
                        .offline_at
                        .and_then(|at| at.checked_add_signed(retention))
                        .is_some_and(|until| until <= now);
                    if removable {
                        expired.push(agent.id.clone());
                    }
                }
                AgentStatus::Idle | AgentStatus::Busy => {}
            }
        }

        for (agent_id, held) in orphaned {
            // Frees the agent's budget and every allocation it still held.
            self.ledger.deregister_agent(&agent_id);
            for active in held {
                self.retry_or_fail(
                    active.task_id,
                    format!("agent {agent_id} went offline"),
                    false,
                    now,
                )?;
                match self.queue.get(active.task_id).map(|t| t.status) {
                    Some(TaskStatus::Pending) => report.requeued.push(active.task_id),
                    _ => report.failed.push(active.task_id),
                }
            }
        }

        for agent_id in expired {
            if self.registry.write().agents.remove(&agent_id).is_some() {
                info!(agent_id = %agent_id, "Offline agent removed after retention");
                self.events
                    .publish(now, OrchestratorEvent::AgentRemoved { agent_id: agent_id.clone() });
                report.removed.push(agent_id);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::OrchestratorConfig;
    use crate::types::{AgentSpec, Task};
    use conductor_core::ResourceVector;
    use std::sync::Arc;

    fn setup() -> (Coordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = OrchestratorConfig {
            health_check_interval: 30,
            failure_threshold: 3,
            offline_grace_period: 60,
            agent_retention: 600,
            ..OrchestratorConfig::default()
        };
        (Coordinator::with_clock(config, clock.clone()).unwrap(), clock)
    }

    fn status(c: &Coordinator, id: &AgentId) -> AgentStatus {
        c.get_agent_status(id).unwrap().status
    }

    #[test]
    fn test_missed_heartbeats_counts_whole_intervals() {
        let t0 = Utc::now();
        let interval = Duration::seconds(30);
        assert_eq!(missed_heartbeats(t0, t0 + Duration::seconds(29), interval), 0);
        assert_eq!(missed_heartbeats(t0, t0 + Duration::seconds(90), interval), 3);
        assert_eq!(missed_heartbeats(t0, t0 - Duration::seconds(5), interval), 0);
    }

    #[test]
    fn test_degrade_then_offline_timeline() {
        let (c, clock) = setup();
        let a = c.register_agent(AgentSpec::new("a", ResourceVector::new(100, 0, 0, 0))).unwrap();

        clock.advance(Duration::seconds(89));
        assert!(c.check_health().unwrap().is_empty());
        clock.advance(Duration::seconds(1));
        assert_eq!(c.check_health().unwrap().degraded, vec![a.clone()]);
        assert_eq!(status(&c, &a), AgentStatus::Degraded);

        clock.advance(Duration::seconds(59));
        assert!(c.check_health().unwrap().offline.is_empty());
        clock.advance(Duration::seconds(1));
        assert_eq!(c.check_health().unwrap().offline, vec![a.clone()]);
        assert_eq!(status(&c, &a), AgentStatus::Offline);
        assert_eq!(c.instance_count(), 0);
    }

    #[test]
    fn test_late_check_walks_both_edges() {
        let (c, clock) = setup();
        let a = c.register_agent(AgentSpec::new("a", ResourceVector::zero())).unwrap();
        clock.advance(Duration::seconds(150));
        let report = c.check_health().unwrap();
        assert_eq!(report.degraded, vec![a.clone()]);
        assert_eq!(report.offline, vec![a]);
    }

    #[test]
    fn test_heartbeat_recovers_degraded() {
        let (c, clock) = setup();
        let a = c.register_agent(AgentSpec::new("a", ResourceVector::zero())).unwrap();
        clock.advance(Duration::seconds(95));
        c.check_health().unwrap();
        assert_eq!(status(&c, &a), AgentStatus::Degraded);

        c.heartbeat(&a, clock.now()).unwrap();
        assert_eq!(status(&c, &a), AgentStatus::Idle);
        clock.advance(Duration::seconds(60));
        assert!(c.check_health().unwrap().is_empty());
    }

    #[test]
    fn test_stale_heartbeat_ignored() {
        let (c, clock) = setup();
        let a = c.register_agent(AgentSpec::new("a", ResourceVector::zero())).unwrap();
        let start = clock.now();
        clock.advance(Duration::seconds(20));
        c.heartbeat(&a, clock.now()).unwrap();
        c.heartbeat(&a, start).unwrap();
        assert_eq!(c.get_agent_status(&a).unwrap().last_heartbeat, clock.now());
    }

    #[test]
    fn test_future_heartbeat_clamped_to_now() {
        let (c, clock) = setup();
        let a = c.register_agent(AgentSpec::new("a", ResourceVector::zero())).unwrap();
        c.heartbeat(&a, clock.now() + Duration::days(365)).unwrap();
        assert_eq!(c.get_agent_status(&a).unwrap().last_heartbeat, clock.now());

        clock.advance(Duration::seconds(90));
        assert_eq!(c.check_health().unwrap().degraded, vec![a.clone()]);
        assert_eq!(status(&c, &a), AgentStatus::Degraded);
    }

    #[test]
    fn test_longest_retention_does_not_overflow() {
        let clock = Arc::new(ManualClock::default());
        let config = OrchestratorConfig {
            health_check_interval: 30,
            failure_threshold: 3,
            offline_grace_period: 60,
            agent_retention: crate::config::MAX_DURATION_SECS,
            ..OrchestratorConfig::default()
        };
        let c = Coordinator::with_clock(config, clock.clone()).unwrap();
        let a = c.register_agent(AgentSpec::new("a", ResourceVector::zero())).unwrap();
        clock.advance(Duration::seconds(150));
        let report = c.check_health().unwrap();
        assert_eq!(report.offline, vec![a.clone()]);
        clock.advance(Duration::days(365));
        assert!(c.check_health().unwrap().removed.is_empty());
        assert_eq!(status(&c, &a), AgentStatus::Offline);
    }

    #[test]
    fn test_offline_agent_heartbeat_ignored_and_removed_after_retention() {
        let (c, clock) = setup();
        let a = c.register_agent(AgentSpec::new("a", ResourceVector::zero())).unwrap();
        clock.advance(Duration::seconds(150));
        c.check_health().unwrap();

        c.heartbeat(&a, clock.now()).unwrap();
        assert_eq!(status(&c, &a), AgentStatus::Offline);

        clock.advance(Duration::seconds(600));
        assert_eq!(c.check_health().unwrap().removed, vec![a.clone()]);
        assert!(matches!(
            c.heartbeat(&a, clock.now()),
            Err(ConductorError::AgentNotFound(_))
        ));
    }

    #[test]
    fn test_offline_requeues_held_task() {
        let (c, clock) = setup();
        let a = c.register_agent(AgentSpec::new("a", ResourceVector::new(100, 0, 0, 0))).unwrap();
        let t = c
            .submit_task(Task::new("t").with_requirement(ResourceVector::new(60, 0, 0, 0)))
            .unwrap();
        c.assign_next().unwrap();

        clock.advance(Duration::seconds(150));
        let report = c.check_health().unwrap();
        assert_eq!(report.requeued, vec![t]);
        let task = c.get_task_status(t).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert_eq!(c.ledger_snapshot().total_used, ResourceVector::zero());
        assert!(c.get_agent_status(&a).unwrap().active_tasks.is_empty());
    }
}
