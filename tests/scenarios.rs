//! End-to-end scheduler scenarios.
//!
//! Each test wires a real store in a temp run directory to the stub
//! adapter and a scripted provider, then drives a full run and asserts on
//! the structured result.

use std::collections::HashMap;
use std::sync::Arc;

use cohort::adapter::{AdapterCallKind, ScriptedProvider, StubAdapter};
use cohort::orchestrator::{Orchestrator, OrchestratorConfig};
use cohort::personas::{PersonaDefaults, PersonaDefinition, PersonaRole, PhasePolicy};
use cohort::store::TaskStore;
use cohort::task::{TaskId, TaskSpec, TaskStatus};
use tempfile::TempDir;

fn store_with(specs: Vec<TaskSpec>) -> (TempDir, TaskStore) {
    let temp = TempDir::new().unwrap();
    let store = TaskStore::open(temp.path()).unwrap();
    store.bootstrap(specs, false).unwrap();
    (temp, store)
}

fn teammate_config(ids: &[&str]) -> OrchestratorConfig {
    OrchestratorConfig {
        teammate_ids: ids.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Scenario A: a plan-gated task and its dependent, with the provider
/// approving the plan. The run drains the graph and reports completion.
#[tokio::test]
async fn scenario_a_plan_then_dependent_completes() {
    let (_temp, store) = store_with(vec![
        TaskSpec::new("t1", "lay the groundwork").with_plan(),
        TaskSpec::new("t2", "build on top").with_deps(&["t1"]),
    ]);

    let provider = ScriptedProvider::new(vec![serde_json::json!({
        "task_updates": [{"task_id": "t1", "plan_action": "approve", "feedback": "clear enough"}],
        "meta": {"provider": "mock", "model": "deterministic"}
    })]);
    let mut config = teammate_config(&["dev1"]);
    config.auto_approve_fallback = false;

    let mut orchestrator = Orchestrator::new(
        config,
        store,
        Arc::new(StubAdapter::new()),
        Arc::new(provider),
    )
    .unwrap();

    let result = orchestrator.run().await.unwrap();
    assert_eq!(result.stop_reason, "all_tasks_completed");
    assert_eq!(result.summary.completed, 2);
    assert_eq!(result.tasks_total, 2);
    assert!(result.provider_calls >= 1);
}

/// Same graph, provider stays quiet: the auto-approve fallback unblocks
/// the submitted plan instead.
#[tokio::test]
async fn scenario_a_variant_auto_approve_fallback() {
    let (_temp, store) = store_with(vec![
        TaskSpec::new("t1", "lay the groundwork").with_plan(),
        TaskSpec::new("t2", "build on top").with_deps(&["t1"]),
    ]);

    let mut config = teammate_config(&["dev1"]);
    config.auto_approve_fallback = true;

    let mut orchestrator = Orchestrator::new(
        config,
        store,
        Arc::new(StubAdapter::new()),
        Arc::new(ScriptedProvider::quiet()),
    )
    .unwrap();

    let result = orchestrator.run().await.unwrap();
    assert_eq!(result.stop_reason, "all_tasks_completed");
    assert_eq!(result.summary.completed, 2);
}

/// Scenario B: with human approval required, the run halts on the pending
/// plan before the provider is ever consulted.
#[tokio::test]
async fn scenario_b_human_approval_halts_before_provider() {
    let (_temp, store) = store_with(vec![TaskSpec::new("t1", "sensitive change").with_plan()]);

    let mut config = teammate_config(&["dev1"]);
    config.human_approval = true;

    let mut orchestrator = Orchestrator::new(
        config,
        store,
        Arc::new(StubAdapter::new()),
        Arc::new(ScriptedProvider::quiet()),
    )
    .unwrap();

    let result = orchestrator.run().await.unwrap();
    assert_eq!(result.stop_reason, "human_approval_required");
    assert_eq!(result.provider_calls, 0);
    assert!(result.human_approval);
    assert_eq!(result.summary.needs_approval, 1);
}

/// Scenario C: a blocking reviewer persona emits an explicit stop token;
/// the run halts with a persona blocker before consulting the provider.
#[tokio::test]
async fn scenario_c_reviewer_stop_becomes_persona_blocker() {
    let (_temp, store) = store_with(vec![TaskSpec::new("t1", "review the diff")]);

    let mut config = OrchestratorConfig::default();
    config.personas = vec![PersonaDefinition::new("gatekeeper", PersonaRole::Reviewer)
        .with_focus("requirement fidelity")
        .blocking()
        .executable()];

    let adapter = StubAdapter::new().script_execution(
        "gatekeeper",
        "t1",
        "REVIEWER_STOP:requirement_drift detected major drift",
    );

    let mut orchestrator = Orchestrator::new(
        config,
        store,
        Arc::new(adapter),
        Arc::new(ScriptedProvider::quiet()),
    )
    .unwrap();

    let result = orchestrator.run().await.unwrap();
    assert_eq!(result.stop_reason, "persona_blocker:gatekeeper");
    assert_eq!(result.provider_calls, 0);
    assert!(result.persona_metrics.persona_blocker_triggered);
    assert!(result
        .persona_metrics
        .severity_counts
        .contains_key("blocker"));
}

/// A reviewer without blocking authority downgrades the same signal to an
/// escalation; the run continues and the task awaits approval.
#[tokio::test]
async fn scenario_c_variant_non_blocking_reviewer_escalates() {
    let (_temp, store) = store_with(vec![TaskSpec::new("t1", "review the diff")]);

    let mut config = OrchestratorConfig::default();
    config.personas = vec![
        PersonaDefinition::new("gatekeeper", PersonaRole::Reviewer).executable(),
    ];
    config.auto_approve_fallback = false;
    config.max_rounds = 1;

    let adapter = StubAdapter::new().script_execution(
        "gatekeeper",
        "t1",
        "REVIEWER_STOP:over_editing rewrote unrelated modules",
    );

    let mut orchestrator = Orchestrator::new(
        config,
        store,
        Arc::new(adapter),
        Arc::new(ScriptedProvider::quiet()),
    )
    .unwrap();

    let result = orchestrator.run().await.unwrap();
    assert_ne!(result.stop_reason, "persona_blocker:gatekeeper");
    assert!(!result.persona_metrics.persona_blocker_triggered);
    assert_eq!(result.summary.needs_approval, 1);
}

/// Scenario D: a task whose dependency id does not exist can never be
/// claimed; with a tight idle limit the run stops idle.
#[tokio::test]
async fn scenario_d_unclaimable_task_hits_idle_limit() {
    let (_temp, store) =
        store_with(vec![TaskSpec::new("t1", "stranded").with_deps(&["missing-dep"])]);

    let mut config = teammate_config(&["dev1"]);
    config.max_idle_rounds = 1;

    let mut orchestrator = Orchestrator::new(
        config,
        store,
        Arc::new(StubAdapter::new()),
        Arc::new(ScriptedProvider::quiet()),
    )
    .unwrap();

    let result = orchestrator.run().await.unwrap();
    assert_eq!(result.stop_reason, "idle_rounds_limit");
    assert_eq!(result.summary.pending, 1);
    assert_eq!(result.summary.completed, 0);
}

/// Scenario E: implement -> review phase routing. The implementer finishes
/// phase 0, the task advances, and the reviewer (not the implementer)
/// claims the next execution.
#[tokio::test]
async fn scenario_e_phase_handoff_routes_to_reviewer() {
    let (_temp, store) = store_with(vec![TaskSpec::new("t1", "feature with review")]);

    let mut config = OrchestratorConfig::default();
    config.personas = vec![
        PersonaDefinition::new("alpha", PersonaRole::Implementer).executable(),
        PersonaDefinition::new("beta", PersonaRole::Reviewer).executable(),
    ];
    config.persona_defaults = PersonaDefaults {
        phase_order: vec!["implement".to_string(), "review".to_string()],
        phase_policies: HashMap::from([
            (
                "implement".to_string(),
                PhasePolicy {
                    active_personas: vec!["alpha".to_string(), "beta".to_string()],
                    executor_personas: vec!["alpha".to_string()],
                    state_transition_personas: vec!["beta".to_string()],
                },
            ),
            (
                "review".to_string(),
                PhasePolicy {
                    active_personas: vec!["alpha".to_string(), "beta".to_string()],
                    executor_personas: vec!["beta".to_string()],
                    state_transition_personas: vec!["beta".to_string()],
                },
            ),
        ]),
    };

    let adapter = Arc::new(StubAdapter::new());
    let mut orchestrator = Orchestrator::new(
        config,
        store,
        adapter.clone(),
        Arc::new(ScriptedProvider::quiet()),
    )
    .unwrap();

    let result = orchestrator.run().await.unwrap();
    assert_eq!(result.stop_reason, "all_tasks_completed");
    assert_eq!(result.summary.completed, 1);

    let executions: Vec<_> = adapter
        .calls()
        .into_iter()
        .filter(|c| c.kind == AdapterCallKind::Execute)
        .collect();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[0].subject, "alpha");
    assert_eq!(executions[0].phase_index, None);
    assert_eq!(executions[1].subject, "beta");
    assert_eq!(executions[1].phase_index, Some(1));
}

/// Resume round-trip: a task left in progress by a crashed run is swept
/// back to pending with an audit line and completes on the next run.
#[tokio::test]
async fn resume_requeues_interrupted_task_and_completes() {
    let (_temp, store) = store_with(vec![TaskSpec::new("t1", "interrupted work")]);

    // Simulated crash: a claim happened but the owner never reported back.
    store.claim_execution_task("dev1", None).unwrap().unwrap();
    assert_eq!(
        store.get_task(&TaskId::from("t1")).unwrap().status,
        TaskStatus::InProgress
    );

    let mut orchestrator = Orchestrator::new(
        teammate_config(&["dev1"]),
        store,
        Arc::new(StubAdapter::new()),
        Arc::new(ScriptedProvider::quiet()),
    )
    .unwrap();

    let result = orchestrator.run().await.unwrap();
    assert_eq!(result.stop_reason, "all_tasks_completed");
    assert_eq!(result.summary.completed, 1);
}

/// Target-path collisions serialize execution: two tasks writing the same
/// path complete across rounds instead of running concurrently.
#[tokio::test]
async fn colliding_tasks_serialize_across_workers() {
    let (_temp, store) = store_with(vec![
        TaskSpec::new("t1", "touch core").with_paths(&["src/core.rs"]),
        TaskSpec::new("t2", "also touch core").with_paths(&["src/core.rs"]),
    ]);

    let mut orchestrator = Orchestrator::new(
        teammate_config(&["dev1", "dev2"]),
        store,
        Arc::new(StubAdapter::new()),
        Arc::new(ScriptedProvider::quiet()),
    )
    .unwrap();

    let result = orchestrator.run().await.unwrap();
    assert_eq!(result.stop_reason, "all_tasks_completed");
    assert_eq!(result.summary.completed, 2);
}

/// Provider messages land in the mailbox with increasing sequence numbers.
#[tokio::test]
async fn provider_messages_reach_the_mailbox() {
    let temp = TempDir::new().unwrap();
    let store = TaskStore::open(temp.path()).unwrap();
    store
        .bootstrap(vec![TaskSpec::new("t1", "solo").with_deps(&["missing-dep"])], false)
        .unwrap();
    let inbox_store = TaskStore::open(temp.path()).unwrap();

    let provider = ScriptedProvider::new(vec![serde_json::json!({
        "messages": [{"to": "dev1", "text_short": "t1 is stranded, check its dependency list"}]
    })]);
    let mut config = teammate_config(&["dev1"]);
    config.max_idle_rounds = 1;

    let mut orchestrator = Orchestrator::new(
        config,
        store,
        Arc::new(StubAdapter::new()),
        Arc::new(provider),
    )
    .unwrap();
    orchestrator.run().await.unwrap();

    let inbox = inbox_store.get_inbox("dev1", 0).unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].sender, "lead");
    assert!(inbox[0].content.contains("stranded"));
}
