use serde_json::json;
use studio_core::reconcile::{RunTracker, run_agent_reconcile};
use studio_core::{AgentState, AgentStatus, AgentStore, StudioError, execute_commands};
use studio_gateway::protocol::methods;
use studio_tests::harness::gateway::{GatewayState, TestGateway};
use studio_tests::harness::{connect, init_tracing};

fn running(agent_id: &str, run_id: &str) -> AgentState {
    AgentState {
        status: AgentStatus::Running,
        session_created: true,
        run_id: Some(run_id.to_string()),
        run_started_at: Some(1),
        ..AgentState::new(agent_id, format!("agent:{agent_id}:main"))
    }
}

#[tokio::test]
async fn finished_runs_are_settled_and_refreshed() {
    init_tracing();
    let mut state = GatewayState::default();
    state.runs.insert("run-ok".to_string(), json!({"status": "ok"}));
    state
        .runs
        .insert("run-bad".to_string(), json!({"status": "error", "error": "boom"}));
    let gateway = TestGateway::spawn_with(state).await.unwrap();
    let ctx = connect(&gateway).await.unwrap();

    let mut store = AgentStore::from_agents([
        running("a", "run-ok"),
        running("b", "run-bad"),
        running("c", "run-live"),
        AgentState::new("idle", "agent:idle:main"),
    ]);
    let agents = store.snapshot();
    let commands = run_agent_reconcile(
        &ctx,
        &agents,
        |id| store.get(id).cloned(),
        &store.runs,
        StudioError::is_disconnect_like,
    )
    .await;
    execute_commands(commands, &mut store, StudioError::is_disconnect_like);

    let a = store.get("a").unwrap();
    assert_eq!(a.status, AgentStatus::Idle);
    assert_eq!(a.run_id, None);
    assert_eq!(a.run_started_at, None);
    assert_eq!(store.get("b").unwrap().status, AgentStatus::Error);
    assert_eq!(store.get("c").unwrap().status, AgentStatus::Running);
    assert_eq!(store.take_refresh_requests(), vec!["a", "b"]);

    // Claims are released whether the run settled or timed out.
    assert!(store.runs.is_empty());
    assert!(store.runs.claim("run-live"));

    let waits = gateway.state().calls_to(methods::AGENT_WAIT);
    assert_eq!(waits.len(), 3);
    assert_eq!(waits[0], json!({"runId": "run-ok", "timeoutMs": 1}));
}

#[tokio::test]
async fn disconnect_mid_reconcile_releases_claims() {
    let gateway = TestGateway::spawn().await.unwrap();
    let ctx = connect(&gateway).await.unwrap();
    ctx.client.disconnect().await;

    let mut store = AgentStore::from_agents([running("a", "run-1")]);
    let agents = store.snapshot();
    let commands = run_agent_reconcile(
        &ctx,
        &agents,
        |id| store.get(id).cloned(),
        &store.runs,
        StudioError::is_disconnect_like,
    )
    .await;
    assert!(commands.is_empty());
    execute_commands(commands, &mut store, StudioError::is_disconnect_like);
    assert!(store.runs.is_empty());
    assert_eq!(store.get("a").unwrap().status, AgentStatus::Running);
}
