//! Chat history sync: fetch a session's history and fold it into the local
//! transcript without duplicating or reordering lines.

pub mod messages;
pub mod transcript;

use crate::agent_state::{AgentPatch, AgentState};
use crate::commands::{MetricMeta, NoopReason, StudioCommand};
use crate::context::StudioContext;
use crate::session_keys::is_same_session_key;
use serde_json::json;
use std::collections::HashSet;
use studio_gateway::GatewayRpc;
use studio_gateway::protocol::{SessionsHistoryResult, methods};

pub use messages::{HistoryLines, build_history_lines, extract_text, extract_tool_lines};
pub use transcript::{legacy_merge_history_lines, merge_history_lines};

pub const METRIC_SKIPPED_RUNNING: &str = "history_apply_skipped_running";
pub const METRIC_STALE_REVISION: &str = "history_apply_stale_revision";

#[derive(Debug, Clone)]
pub struct HistorySyncRequest<'a> {
    pub agent_id: &'a str,
    /// Caller-chosen id, stamped on the applied patch.
    pub request_id: &'a str,
    pub loaded_at: u64,
    /// Overrides the default fetch size; clamped to the configured maximum.
    pub limit: Option<usize>,
    /// Session keys with a history request already outstanding, not
    /// counting this one.
    pub in_flight_session_keys: &'a HashSet<String>,
}

fn metadata_patch(request: &HistorySyncRequest<'_>, limit: usize, fetched: usize) -> AgentPatch {
    AgentPatch {
        history_loaded_at: Some(request.loaded_at),
        history_fetch_limit: Some(limit),
        history_fetched_count: Some(fetched),
        history_maybe_truncated: Some(fetched >= limit),
        last_applied_history_request_id: Some(request.request_id.to_string()),
        ..AgentPatch::default()
    }
}

/// Fetch history for one agent and describe how to apply it.
///
/// `get_agent` must return the agent's current local state; it is consulted
/// before the fetch and again after it, since the agent may have changed in
/// between.
pub async fn run_history_sync<C, G>(
    ctx: &StudioContext<C>,
    request: HistorySyncRequest<'_>,
    get_agent: G,
) -> Vec<StudioCommand>
where
    C: GatewayRpc,
    G: Fn(&str) -> Option<AgentState>,
{
    let Some(agent) = get_agent(request.agent_id) else {
        return vec![StudioCommand::noop(NoopReason::MissingAgent)];
    };
    if !agent.session_created {
        return vec![StudioCommand::noop(NoopReason::SessionNotCreated)];
    }
    if request.in_flight_session_keys.contains(&agent.session_key) {
        return vec![StudioCommand::noop(NoopReason::RequestInFlight)];
    }

    let revision = agent.transcript_revision;
    let limit = ctx.options.history_limit(request.limit);
    let params = json!({"sessionKey": agent.session_key, "limit": limit});
    let history: SessionsHistoryResult = match ctx.call(methods::SESSIONS_HISTORY, &params).await {
        Ok(history) => history,
        Err(error) => {
            return vec![StudioCommand::LogError {
                message: format!(
                    "Failed to load chat history for agent {} (request {}).",
                    agent.agent_id, request.request_id
                ),
                error,
            }];
        }
    };

    let Some(latest) = get_agent(request.agent_id) else {
        return vec![StudioCommand::noop(NoopReason::MissingAgent)];
    };
    let response_key = history.session_key.as_deref().unwrap_or(&agent.session_key);
    if !is_same_session_key(&agent.session_key, &latest.session_key)
        || !is_same_session_key(response_key, &latest.session_key)
    {
        return vec![StudioCommand::noop(NoopReason::SessionKeyChanged)];
    }

    let fetched = history.messages.len();
    let metadata = metadata_patch(&request, limit, fetched);

    if latest.has_active_run() {
        return vec![
            StudioCommand::dispatch(latest.agent_id.clone(), metadata),
            StudioCommand::LogMetric {
                metric: METRIC_SKIPPED_RUNNING.to_string(),
                meta: MetricMeta {
                    agent_id: latest.agent_id.clone(),
                    request_id: Some(request.request_id.to_string()),
                    run_id: latest.run_id.clone(),
                },
            },
        ];
    }

    let remote = build_history_lines(&history.messages);
    let mut commands = Vec::new();
    let (output_lines, expected_revision) = if ctx.options.transcript_v2 {
        commands.push(StudioCommand::dispatch(
            latest.agent_id.clone(),
            AgentPatch {
                last_history_request_revision: Some(revision),
                ..AgentPatch::default()
            },
        ));
        if latest.transcript_revision != revision {
            tracing::debug!(
                agent_id = %latest.agent_id,
                request_id = request.request_id,
                fetched_revision = revision,
                current_revision = latest.transcript_revision,
                "transcript advanced during history fetch"
            );
            commands.push(StudioCommand::dispatch(latest.agent_id.clone(), metadata));
            commands.push(StudioCommand::LogMetric {
                metric: METRIC_STALE_REVISION.to_string(),
                meta: MetricMeta {
                    agent_id: latest.agent_id.clone(),
                    request_id: Some(request.request_id.to_string()),
                    run_id: None,
                },
            });
            commands.push(StudioCommand::RequestHistoryRefresh {
                agent_id: latest.agent_id.clone(),
            });
            return commands;
        }
        (
            merge_history_lines(&latest.output_lines, &remote.lines),
            Some(revision),
        )
    } else {
        (
            legacy_merge_history_lines(&latest.output_lines, &remote.lines),
            None,
        )
    };

    let mut patch = AgentPatch {
        output_lines: Some(output_lines),
        ..metadata
    };
    if let Some(text) = remote.last_assistant {
        patch.last_result = Some(Some(text.clone()));
        patch.latest_preview = Some(Some(text));
    }
    if let Some(text) = remote.last_user {
        patch.last_user_message = Some(Some(text));
    }
    if let Some(at) = remote.last_assistant_at {
        patch.last_assistant_message_at = Some(Some(at));
    }
    commands.push(StudioCommand::DispatchUpdateAgent {
        agent_id: latest.agent_id.clone(),
        patch,
        expected_revision,
    });
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_state::{AgentStatus, AgentStore};
    use crate::commands::execute_commands;
    use crate::context::StudioOptions;
    use crate::error::StudioError;
    use crate::testing::{ScriptedGateway, disconnected};
    use serde_json::Value;
    use std::cell::RefCell;

    fn agent() -> AgentState {
        AgentState {
            session_created: true,
            ..AgentState::new("agent-1", "agent:agent-1:main")
        }
    }

    fn history(messages: Value) -> ScriptedGateway {
        ScriptedGateway::new().on(
            methods::SESSIONS_HISTORY,
            json!({"sessionKey": "agent:agent-1:main", "messages": messages}),
        )
    }

    fn request<'a>(request_id: &'a str, in_flight: &'a HashSet<String>) -> HistorySyncRequest<'a> {
        HistorySyncRequest {
            agent_id: "agent-1",
            request_id,
            loaded_at: 1_234,
            limit: None,
            in_flight_session_keys: in_flight,
        }
    }

    fn dispatches(commands: &[StudioCommand]) -> Vec<(&AgentPatch, Option<u64>)> {
        commands
            .iter()
            .filter_map(|c| match c {
                StudioCommand::DispatchUpdateAgent {
                    patch,
                    expected_revision,
                    ..
                } => Some((patch, *expected_revision)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn intent_noops_skip_the_fetch() {
        let ctx = StudioContext::new(history(json!([])));
        let none = HashSet::new();

        let commands = run_history_sync(&ctx, request("req-1", &none), |_| None).await;
        assert!(matches!(
            commands.as_slice(),
            [StudioCommand::Noop { reason: NoopReason::MissingAgent }]
        ));

        let not_created = AgentState {
            session_created: false,
            ..agent()
        };
        let commands =
            run_history_sync(&ctx, request("req-1", &none), |_| Some(not_created.clone())).await;
        assert!(matches!(
            commands.as_slice(),
            [StudioCommand::Noop { reason: NoopReason::SessionNotCreated }]
        ));

        let busy: HashSet<String> = ["agent:agent-1:main".to_string()].into();
        let commands = run_history_sync(&ctx, request("req-1", &busy), |_| Some(agent())).await;
        assert!(matches!(
            commands.as_slice(),
            [StudioCommand::Noop { reason: NoopReason::RequestInFlight }]
        ));
        assert!(ctx.client.calls().is_empty());
    }

    #[tokio::test]
    async fn running_agent_gets_metadata_only() {
        let ctx = StudioContext::new(history(json!([{"role": "assistant", "content": "remote answer"}])));
        let running = AgentState {
            status: AgentStatus::Running,
            run_id: Some("run-1".into()),
            transcript_revision: 3,
            output_lines: vec!["> local question".into(), "assistant draft".into()],
            ..agent()
        };
        let none = HashSet::new();
        let commands = run_history_sync(&ctx, request("req-2", &none), |_| Some(running.clone())).await;

        let updates = dispatches(&commands);
        assert_eq!(updates.len(), 1);
        assert_eq!(
            *updates[0].0,
            AgentPatch {
                history_loaded_at: Some(1_234),
                history_fetch_limit: Some(200),
                history_fetched_count: Some(1),
                history_maybe_truncated: Some(false),
                last_applied_history_request_id: Some("req-2".into()),
                ..AgentPatch::default()
            }
        );
        assert!(commands.iter().any(|c| matches!(
            c,
            StudioCommand::LogMetric { metric, meta }
                if metric == METRIC_SKIPPED_RUNNING
                    && meta.request_id.as_deref() == Some("req-2")
                    && meta.run_id.as_deref() == Some("run-1")
        )));
        assert_eq!(
            ctx.client.params_of(methods::SESSIONS_HISTORY)[0],
            json!({"sessionKey": "agent:agent-1:main", "limit": 200})
        );
    }

    #[tokio::test]
    async fn v2_apply_merges_and_guards_revision() {
        let ctx = StudioContext::new(history(json!([{"role": "assistant", "content": "Merged answer"}])));
        let local = AgentState {
            transcript_revision: 1,
            output_lines: vec!["> local question".into()],
            ..agent()
        };
        let none = HashSet::new();
        let commands = run_history_sync(&ctx, request("req-3", &none), |_| Some(local.clone())).await;

        let updates = dispatches(&commands);
        assert!(updates.len() >= 2);
        assert_eq!(
            *updates[0].0,
            AgentPatch {
                last_history_request_revision: Some(1),
                ..AgentPatch::default()
            }
        );
        let (last, expected) = updates[updates.len() - 1];
        assert_eq!(expected, Some(1));
        let lines = last.output_lines.as_ref().unwrap();
        assert!(lines.contains(&"> local question".to_string()));
        assert!(lines.contains(&"Merged answer".to_string()));
        assert_eq!(last.last_result, Some(Some("Merged answer".into())));
        assert_eq!(last.latest_preview, Some(Some("Merged answer".into())));
        assert_eq!(last.last_applied_history_request_id.as_deref(), Some("req-3"));
    }

    #[tokio::test]
    async fn legacy_apply_has_no_guard() {
        let options = StudioOptions {
            transcript_v2: false,
            ..StudioOptions::default()
        };
        let ctx = StudioContext::new(history(json!([{"role": "assistant", "content": "Legacy answer"}])))
            .with_options(options);
        let local = AgentState {
            output_lines: vec!["> local question".into()],
            ..agent()
        };
        let none = HashSet::new();
        let commands = run_history_sync(&ctx, request("req-4", &none), |_| Some(local.clone())).await;
        let updates = dispatches(&commands);
        let (last, expected) = updates[updates.len() - 1];
        assert_eq!(expected, None);
        let lines = last.output_lines.as_ref().unwrap();
        assert!(lines.contains(&"> local question".to_string()));
        assert!(lines.contains(&"Legacy answer".to_string()));
        assert_eq!(last.last_result, Some(Some("Legacy answer".into())));
        assert_eq!(last.last_applied_history_request_id.as_deref(), Some("req-4"));
    }

    #[tokio::test]
    async fn revision_advance_during_fetch_aborts_apply() {
        let ctx = StudioContext::new(history(json!([{"role": "assistant", "content": "old"}])));
        let before = agent();
        let after = AgentState {
            transcript_revision: 1,
            output_lines: vec!["streamed".into()],
            ..agent()
        };
        let reads = RefCell::new(0);
        let none = HashSet::new();
        let commands = run_history_sync(&ctx, request("req-5", &none), |_| {
            *reads.borrow_mut() += 1;
            Some(if *reads.borrow() == 1 { before.clone() } else { after.clone() })
        })
        .await;

        assert!(dispatches(&commands).iter().all(|(p, _)| p.output_lines.is_none()));
        assert!(commands.iter().any(|c| matches!(
            c,
            StudioCommand::LogMetric { metric, .. } if metric == METRIC_STALE_REVISION
        )));
        assert!(commands.iter().any(|c| matches!(
            c,
            StudioCommand::RequestHistoryRefresh { agent_id } if agent_id == "agent-1"
        )));
    }

    #[tokio::test]
    async fn switched_session_is_ignored() {
        let ctx = StudioContext::new(
            ScriptedGateway::new().on(
                methods::SESSIONS_HISTORY,
                json!({"sessionKey": "agent:agent-1:studio:other", "messages": []}),
            ),
        );
        let none = HashSet::new();
        let commands = run_history_sync(&ctx, request("req-6", &none), |_| Some(agent())).await;
        assert!(matches!(
            commands.as_slice(),
            [StudioCommand::Noop { reason: NoopReason::SessionKeyChanged }]
        ));
    }

    #[tokio::test]
    async fn fetch_errors_become_log_commands() {
        let ctx = StudioContext::new(
            ScriptedGateway::new().on_err(methods::SESSIONS_HISTORY, disconnected()),
        );
        let none = HashSet::new();
        let commands = run_history_sync(&ctx, request("req-7", &none), |_| Some(agent())).await;
        match commands.as_slice() {
            [StudioCommand::LogError { error, .. }] => assert!(error.is_disconnect_like()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn applying_same_history_twice_is_stable() {
        let messages = json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"}
        ]);
        let ctx = StudioContext::new(history(messages));
        let mut store = AgentStore::from_agents([agent()]);
        let none = HashSet::new();

        for request_id in ["req-a", "req-b"] {
            let snapshot = store.get("agent-1").cloned();
            let commands =
                run_history_sync(&ctx, request(request_id, &none), |_| snapshot.clone()).await;
            execute_commands(commands, &mut store, StudioError::is_disconnect_like);
        }

        let agent = store.get("agent-1").unwrap();
        assert_eq!(agent.output_lines, ["> hi", "hello"]);
        assert_eq!(agent.transcript_revision, 1);
        assert_eq!(agent.last_applied_history_request_id.as_deref(), Some("req-b"));
    }
}
