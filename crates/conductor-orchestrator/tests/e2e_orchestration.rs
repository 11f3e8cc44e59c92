//! End-to-end orchestration tests.
//!
//! Drives the coordinator, ledger and scaling controller through the
//! documented scenarios: priority dispatch under least-loaded balancing,
//! heartbeat loss and recovery, cooldown-gated scale-up, and resource
//! back-pressure. Also checks exactly-once assignment under concurrency.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::Duration;
use conductor_core::{AgentId, ConductorError, ConductorResult, ResourceVector, TaskId};
use conductor_orchestrator::*;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn cpu(n: u64) -> ResourceVector {
    ResourceVector::new(n, 0, 0, 0)
}

fn coordinator_with(config: OrchestratorConfig) -> (Arc<Coordinator>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let coordinator = Arc::new(Coordinator::with_clock(config, clock.clone()).unwrap());
    (coordinator, clock)
}

// ---------------------------------------------------------------------------
// Mock lifecycle collaborator
// ---------------------------------------------------------------------------

struct MockLifecycle {
    created: AtomicUsize,
    budget: ResourceVector,
    terminated: Mutex<Vec<AgentId>>,
}

impl MockLifecycle {
    fn new(budget: ResourceVector) -> Self {
        Self {
            created: AtomicUsize::new(0),
            budget,
            terminated: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentLifecycle for MockLifecycle {
    async fn create_instance(&self, agent_type: &str) -> ConductorResult<AgentSpec> {
        let n = self.created.fetch_add(1, Ordering::SeqCst);
        Ok(AgentSpec::new(format!("scaled-{n}"), self.budget).with_type(agent_type))
    }

    async fn terminate_instance(&self, agent_id: &AgentId) -> ConductorResult<()> {
        self.terminated.lock().push(agent_id.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scenario 1: priority order under least-loaded balancing
// ---------------------------------------------------------------------------

#[test]
fn test_priority_dispatch_least_loaded() {
    let (c, _) = coordinator_with(OrchestratorConfig {
        load_balancing_strategy: LoadBalancingStrategy::LeastLoaded,
        ..OrchestratorConfig::default()
    });
    for name in ["A", "B", "C"] {
        c.register_agent(AgentSpec::new(name, cpu(1000))).unwrap();
    }
    for priority in [1, 5, 3, 2, 4] {
        c.submit_task(
            Task::new(format!("p{priority}"))
                .with_priority(priority)
                .with_requirement(cpu(100)),
        )
        .unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..5 {
        let lowest_load = c
            .list_agents()
            .iter()
            .map(|a| a.load_ratio)
            .fold(f64::INFINITY, f64::min);
        let assignment = c.assign_next().unwrap();
        let chosen = c.get_agent_status(&assignment.agent_id).unwrap();
        // The chosen agent had the lowest ratio before this assignment.
        assert!((chosen.load_ratio - 0.1 - lowest_load).abs() < 1e-9);
        order.push((assignment.priority, assignment.agent_id.to_string()));
    }

    assert_eq!(
        order,
        vec![
            (5, "A".to_string()),
            (4, "B".to_string()),
            (3, "C".to_string()),
            (2, "A".to_string()),
            (1, "B".to_string()),
        ]
    );
    assert!(matches!(c.assign_next(), Err(ConductorError::NoReadyTask)));
}

// ---------------------------------------------------------------------------
// Scenario 2: missed heartbeats, Degraded at 90s, Offline at 150s, reassignment
// ---------------------------------------------------------------------------

#[test]
fn test_heartbeat_loss_recovers_task() {
    let (c, clock) = coordinator_with(OrchestratorConfig {
        health_check_interval: 30,
        failure_threshold: 3,
        offline_grace_period: 60,
        ..OrchestratorConfig::default()
    });
    let a = c.register_agent(AgentSpec::new("A", cpu(100))).unwrap();
    let b = c.register_agent(AgentSpec::new("B", cpu(100))).unwrap();
    let task = c.submit_task(Task::new("job").with_requirement(cpu(50))).unwrap();
    assert_eq!(c.assign_next().unwrap().agent_id, a);
    c.task_started(task).unwrap();
    let mut events = c.subscribe();

    let mut degraded_at = None;
    let mut offline_at = None;
    let mut requeued = Vec::new();
    for step in 1..=5 {
        clock.advance(Duration::seconds(30));
        c.heartbeat(&b, clock.now()).unwrap();
        let report = c.check_health().unwrap();
        if report.degraded.contains(&a) {
            degraded_at = Some(step * 30);
        }
        if report.offline.contains(&a) {
            offline_at = Some(step * 30);
            requeued = report.requeued.clone();
        }
    }
    assert_eq!(degraded_at, Some(90));
    assert_eq!(offline_at, Some(150));
    assert_eq!(requeued, vec![task]);
    assert_eq!(c.get_agent_status(&b).unwrap().status, AgentStatus::Idle);

    // Reassigned on the next assignment cycle.
    let again = c.assign_next().unwrap();
    assert_eq!(again.task_id, task);
    assert_eq!(again.agent_id, b);
    assert_eq!(again.attempt, 2);

    // Transitions observed follow the state machine.
    let mut transitions = Vec::new();
    while let Ok(record) = events.try_recv() {
        if let OrchestratorEvent::AgentStatusChanged { agent_id, from, to } = record.event {
            if agent_id == a {
                transitions.push((from, to));
            }
        }
    }
    assert_eq!(
        transitions,
        vec![
            (AgentStatus::Busy, AgentStatus::Degraded),
            (AgentStatus::Degraded, AgentStatus::Offline),
        ]
    );
}

#[test]
fn test_degraded_agent_gets_no_work_until_heartbeat() {
    let (c, clock) = coordinator_with(OrchestratorConfig::default());
    let a = c.register_agent(AgentSpec::new("A", cpu(100))).unwrap();
    clock.advance(Duration::seconds(100));
    c.check_health().unwrap();
    c.submit_task(Task::new("waiting")).unwrap();
    assert!(matches!(c.assign_next(), Err(ConductorError::NoEligibleAgent)));

    c.heartbeat(&a, clock.now()).unwrap();
    assert_eq!(c.assign_next().unwrap().agent_id, a);
}

// ---------------------------------------------------------------------------
// Scenario 3: scale-up, cooldown hold, scale-up again after cooldown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_scale_up_respects_cooldown() {
    let config = OrchestratorConfig {
        min_agents: 1,
        max_agents: 10,
        scale_up_threshold: 0.8,
        cooldown_period: 300,
        scale_factor: 2.0,
        ..OrchestratorConfig::default()
    };
    let (c, clock) = coordinator_with(config.clone());
    let lifecycle = Arc::new(MockLifecycle::new(cpu(100)));
    let scaling = ScalingController::new(c.clone(), lifecycle.clone(), config.scaling_policy());

    c.register_agent(AgentSpec::new("seed", cpu(100))).unwrap();
    c.submit_task(Task::new("hot").with_requirement(cpu(85))).unwrap();
    c.assign_next().unwrap();
    assert!((c.ledger_snapshot().utilization - 0.85).abs() < 1e-9);

    let t0 = clock.now();
    assert_eq!(
        scaling.evaluate().await.unwrap(),
        ScalingDecision::ScaleUp { from: 1, to: 2 }
    );

    clock.set(t0 + Duration::seconds(60));
    c.submit_task(Task::new("hot-2").with_requirement(cpu(85))).unwrap();
    c.assign_next().unwrap();
    assert!((c.ledger_snapshot().utilization - 0.85).abs() < 1e-9);
    assert_eq!(
        scaling.evaluate().await.unwrap(),
        ScalingDecision::Hold {
            reason: HoldReason::Cooldown
        }
    );
    assert_eq!(c.instance_count(), 2);

    clock.set(t0 + Duration::seconds(310));
    assert_eq!(
        scaling.evaluate().await.unwrap(),
        ScalingDecision::ScaleUp { from: 2, to: 4 }
    );
    assert_eq!(c.instance_count(), 4);
    assert_eq!(lifecycle.created.load(Ordering::SeqCst), 3);

    let status = scaling.get_scaling_status();
    assert!(status.in_cooldown);
    assert_eq!(status.last_action_at, Some(t0 + Duration::seconds(310)));
}

#[tokio::test]
async fn test_scaling_stays_in_bounds_and_spaced() {
    let config = OrchestratorConfig {
        min_agents: 1,
        max_agents: 6,
        cooldown_period: 300,
        ..OrchestratorConfig::default()
    };
    let (c, clock) = coordinator_with(config.clone());
    let lifecycle = Arc::new(MockLifecycle::new(cpu(100)));
    let scaling = ScalingController::new(c.clone(), lifecycle, config.scaling_policy());

    let mut backlog: Vec<TaskId> = Vec::new();
    let mut actions = Vec::new();
    for step in 0..40 {
        // Alternate between a deep unplaceable backlog and an empty queue.
        if step % 8 == 0 {
            for _ in 0..20 {
                backlog.push(
                    c.submit_task(Task::new("blocked").with_capabilities(["unavailable"]))
                        .unwrap(),
                );
            }
        } else if step % 8 == 4 {
            for id in backlog.drain(..) {
                c.cancel_task(id).unwrap();
            }
        }

        let decision = scaling.evaluate().await.unwrap();
        let count = c.instance_count();
        assert!((1..=6).contains(&count), "count {count} out of bounds");
        if decision.is_action() {
            actions.push(clock.now());
        }
        clock.advance(Duration::seconds(100));
    }

    assert!(actions.len() >= 3);
    for pair in actions.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::seconds(300));
    }
}

// ---------------------------------------------------------------------------
// Scenario 4: insufficient resources keeps the task pending
// ---------------------------------------------------------------------------

#[test]
fn test_insufficient_resources_back_pressure() {
    let (c, _) = coordinator_with(OrchestratorConfig::default());
    let big = c.register_agent(AgentSpec::new("big", cpu(1000))).unwrap();
    c.register_agent(AgentSpec::new("small", cpu(200))).unwrap();

    let first = c.submit_task(Task::new("first").with_priority(5).with_requirement(cpu(900))).unwrap();
    assert_eq!(c.assign_next().unwrap().agent_id, big);

    let large = c.submit_task(Task::new("large").with_priority(4).with_requirement(cpu(500))).unwrap();
    let small_task = c.submit_task(Task::new("tiny").with_priority(1).with_requirement(cpu(50))).unwrap();

    assert!(matches!(
        c.assign_next(),
        Err(ConductorError::InsufficientResources(_))
    ));
    assert_eq!(c.get_task_status(large).unwrap().status, TaskStatus::Pending);
    // The lower-priority task is not dispatched ahead of the blocked one.
    assert_eq!(c.get_task_status(small_task).unwrap().status, TaskStatus::Pending);
    assert_eq!(c.get_queue_stats().pending, 2);

    c.report_result(first, TaskOutcome::Success).unwrap();
    let assignment = c.assign_next().unwrap();
    assert_eq!(assignment.task_id, large);
    assert_eq!(assignment.agent_id, big);
    assert_eq!(c.assign_next().unwrap().task_id, small_task);
}

// ---------------------------------------------------------------------------
// Concurrency: exactly-once assignment and budgets never exceeded
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_assign_is_exactly_once() {
    let (c, _) = coordinator_with(OrchestratorConfig {
        load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
        ..OrchestratorConfig::default()
    });
    for i in 0..8 {
        c.register_agent(AgentSpec::new(format!("agent-{i}"), cpu(1000))).unwrap();
    }
    let mut submitted = HashSet::new();
    for i in 0..300 {
        submitted.insert(
            c.submit_task(Task::new(format!("t{i}")).with_priority(i % 7).with_requirement(cpu(25)))
                .unwrap(),
        );
    }

    let mut workers = Vec::new();
    for _ in 0..16 {
        let c = c.clone();
        workers.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                match c.assign_next() {
                    Ok(a) => mine.push(a),
                    Err(ConductorError::NoReadyTask) => break,
                    Err(_) => tokio::task::yield_now().await,
                }
            }
            mine
        }));
    }

    let mut per_task: HashMap<TaskId, usize> = HashMap::new();
    for worker in workers {
        for assignment in worker.await.unwrap() {
            *per_task.entry(assignment.task_id).or_default() += 1;
        }
    }
    assert_eq!(per_task.len(), submitted.len());
    assert!(per_task.values().all(|&n| n == 1));

    let mut held = HashSet::new();
    for agent in c.list_agents() {
        for task in &agent.active_tasks {
            assert!(held.insert(*task), "task {task} held by two agents");
        }
        assert!(agent.allocated.fits_within(&agent.budget));
    }
    assert_eq!(held.len(), 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_never_oversubscribe() {
    let (c, _) = coordinator_with(OrchestratorConfig::default());
    c.register_agent(AgentSpec::new("only", cpu(1000))).unwrap();
    for i in 0..50 {
        c.submit_task(Task::new(format!("t{i}")).with_requirement(cpu(70))).unwrap();
    }

    let mut workers = Vec::new();
    for _ in 0..8 {
        let c = c.clone();
        workers.push(tokio::spawn(async move {
            let mut n = 0usize;
            for _ in 0..50 {
                if c.assign_next().is_ok() {
                    n += 1;
                }
            }
            n
        }));
    }
    let mut total = 0;
    for worker in workers {
        total += worker.await.unwrap();
    }

    // floor(1000 / 70) tasks fit.
    assert_eq!(total, 14);
    let agent = c.get_agent_status(&AgentId::from("only")).unwrap();
    assert_eq!(agent.allocated, cpu(980));
    assert_eq!(c.get_queue_stats().pending, 36);
}

// ---------------------------------------------------------------------------
// Boundaries and idempotence
// ---------------------------------------------------------------------------

#[test]
fn test_unknown_dependency_rejected_and_not_enqueued() {
    let (c, _) = coordinator_with(OrchestratorConfig::default());
    let ghost = TaskId::new();
    let task = Task::new("orphan").with_dependencies(vec![ghost]);
    let id = task.id;
    let err = c.submit_task(task).unwrap_err();
    assert!(matches!(err, ConductorError::InvalidDependency { dependency, .. } if dependency == ghost));
    assert!(matches!(c.get_task_status(id), Err(ConductorError::TaskNotFound(_))));
    assert_eq!(c.get_queue_stats().total, 0);
}

#[test]
fn test_exact_budget_fits_one_more_unit_does_not() {
    let (c, _) = coordinator_with(OrchestratorConfig::default());
    c.register_agent(AgentSpec::new("a", ResourceVector::new(1000, 2048, 10, 5))).unwrap();
    c.submit_task(Task::new("half").with_requirement(ResourceVector::new(400, 1024, 5, 0)))
        .unwrap();
    c.assign_next().unwrap();

    let over = c
        .submit_task(Task::new("over").with_requirement(ResourceVector::new(600, 1025, 5, 5)))
        .unwrap();
    assert!(matches!(
        c.assign_next(),
        Err(ConductorError::InsufficientResources(_))
    ));
    c.cancel_task(over).unwrap();

    c.submit_task(Task::new("exact").with_requirement(ResourceVector::new(600, 1024, 5, 5)))
        .unwrap();
    c.assign_next().unwrap();
    let snapshot = c.ledger_snapshot();
    assert_eq!(snapshot.total_used, ResourceVector::new(1000, 2048, 10, 5));
    assert!((snapshot.utilization - 1.0).abs() < 1e-9);
}

#[test]
fn test_release_twice_matches_release_once() {
    let ledger = ResourceLedger::new(cpu(10_000));
    let a = AgentId::from("a");
    ledger.register_agent(&a, cpu(500)).unwrap();
    let allocation = ledger
        .allocate(&a, TaskId::new(), cpu(200), chrono::Utc::now(), None)
        .unwrap();

    ledger.release(allocation.id);
    let once = ledger.snapshot();
    ledger.release(allocation.id);
    let twice = ledger.snapshot();
    assert_eq!(once.total_used, twice.total_used);
    assert_eq!(once.active_allocations, twice.active_allocations);
}

#[test]
fn test_terminal_failure_surfaces_reason_and_attempts() {
    let (c, _) = coordinator_with(OrchestratorConfig {
        max_task_attempts: 1,
        ..OrchestratorConfig::default()
    });
    c.register_agent(AgentSpec::new("a", cpu(100))).unwrap();
    let t = c.submit_task(Task::new("doomed")).unwrap();
    c.assign_next().unwrap();
    c.report_result(t, TaskOutcome::Failure { error: "disk full".into() })
        .unwrap();

    let status = c.get_task_status(t).unwrap();
    assert_eq!(status.attempts, 1);
    assert_eq!(status.reason_code.as_deref(), Some("ATTEMPTS_EXHAUSTED"));
    assert_eq!(status.last_error.as_deref(), Some("disk full"));

    // Re-reporting is a no-op.
    c.report_result(t, TaskOutcome::Success).unwrap();
    assert_eq!(c.get_task_status(t).unwrap().status, status.status);
}

#[test]
fn test_predictive_prefers_reliable_fast_agent() {
    let (c, clock) = coordinator_with(OrchestratorConfig {
        load_balancing_strategy: LoadBalancingStrategy::Predictive,
        ..OrchestratorConfig::default()
    });
    let slow = c.register_agent(AgentSpec::new("slow", cpu(100))).unwrap();
    let fast = c.register_agent(AgentSpec::new("fast", cpu(100))).unwrap();

    // Seed history: `slow` takes 5s, `fast` 100ms.
    let t1 = c.submit_task(Task::new("warm-1").with_requirement(cpu(10))).unwrap();
    assert_eq!(c.assign_next().unwrap().agent_id, slow);
    let t2 = c.submit_task(Task::new("warm-2").with_requirement(cpu(10))).unwrap();
    assert_eq!(c.assign_next().unwrap().agent_id, fast);
    clock.advance(Duration::milliseconds(100));
    c.report_result(t2, TaskOutcome::Success).unwrap();
    clock.advance(Duration::milliseconds(4900));
    c.report_result(t1, TaskOutcome::Success).unwrap();

    c.submit_task(Task::new("real")).unwrap();
    assert_eq!(c.assign_next().unwrap().agent_id, fast);
}
