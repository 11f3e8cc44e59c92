#![allow(clippy::unwrap_used, clippy::expect_used)]

use conductor_core::*;

// ---------------------------------------------------------------------------
// 1. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let full = ConductorError::QueueFull { capacity: 10 };
    assert_eq!(full.to_string(), "Queue full: capacity 10 reached");

    let dup = ConductorError::DuplicateAgent(AgentId::from("worker-1"));
    assert_eq!(dup.to_string(), "Duplicate agent: worker-1");

    let missing = ConductorError::AgentNotFound(AgentId::from("ghost"));
    assert_eq!(missing.to_string(), "Agent not found: ghost");

    let task = TaskId::new();
    let dep = TaskId::new();
    let invalid = ConductorError::InvalidDependency {
        task,
        dependency: dep,
    };
    assert!(invalid.to_string().contains(&dep.to_string()));

    let insufficient = ConductorError::InsufficientResources("cpu".to_string());
    assert_eq!(insufficient.to_string(), "Insufficient resources: cpu");

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: ConductorError = io_err.into();
    assert!(err.to_string().starts_with("IO error:"));
    assert_eq!(err.code(), "IO");
}

// ---------------------------------------------------------------------------
// 2. Every taxonomy variant has a distinct reason code
// ---------------------------------------------------------------------------

#[test]
fn reason_codes_are_distinct() {
    let errors = vec![
        ConductorError::QueueFull { capacity: 1 },
        ConductorError::InvalidDependency {
            task: TaskId::new(),
            dependency: TaskId::new(),
        },
        ConductorError::NoEligibleAgent,
        ConductorError::NoReadyTask,
        ConductorError::InsufficientResources(String::new()),
        ConductorError::DuplicateAgent(AgentId::from("a")),
        ConductorError::AgentNotFound(AgentId::from("a")),
        ConductorError::TaskNotFound(TaskId::new()),
        ConductorError::ScalingBoundViolation {
            requested: 0,
            min: 1,
            max: 2,
        },
    ];
    let mut codes: Vec<&str> = errors.iter().map(ConductorError::code).collect();
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), errors.len());
}

// ---------------------------------------------------------------------------
// 3. Resource vectors: exact budget boundary
// ---------------------------------------------------------------------------

#[test]
fn resource_budget_boundary() {
    let budget = ResourceVector::new(2000, 4096, 10_240, 100);
    let used = ResourceVector::new(500, 1024, 0, 0);
    let remaining = budget.saturating_sub(&used);

    assert!(remaining.fits_within(&remaining));
    let one_more = remaining.saturating_add(&ResourceVector::new(1, 0, 0, 0));
    assert!(!one_more.fits_within(&remaining));
}

// ---------------------------------------------------------------------------
// 4. Resource vector serde defaults
// ---------------------------------------------------------------------------

#[test]
fn resource_vector_partial_json() {
    let parsed: ResourceVector = serde_json::from_str(r#"{"cpu": 250}"#).unwrap();
    assert_eq!(parsed, ResourceVector::new(250, 0, 0, 0));
    assert_eq!(
        parsed.to_string(),
        "cpu=250m mem=0MiB disk=0MiB net=0Mbps"
    );
}
