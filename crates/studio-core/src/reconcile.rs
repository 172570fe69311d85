use crate::agent_state::{AgentPatch, AgentState, AgentStatus};
use crate::commands::StudioCommand;
use crate::context::StudioContext;
use crate::error::StudioError;
use dashmap::DashSet;
use serde_json::json;
use studio_gateway::GatewayRpc;
use studio_gateway::protocol::{AgentWaitResult, methods};

/// Claims on run ids so two reconcile passes never wait on the same run.
pub trait RunTracker {
    /// Returns false if the run is already claimed.
    fn claim(&self, run_id: &str) -> bool;
    fn release(&self, run_id: &str);
}

#[derive(Debug, Default, Clone)]
pub struct InFlightRuns {
    runs: DashSet<String>,
}

impl InFlightRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl RunTracker for InFlightRuns {
    fn claim(&self, run_id: &str) -> bool {
        self.runs.insert(run_id.to_string())
    }

    fn release(&self, run_id: &str) {
        self.runs.remove(run_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Ok,
    Error,
}

/// Patch that settles an agent whose run finished while we weren't looking.
pub fn reconcile_terminal_patch(outcome: RunOutcome) -> AgentPatch {
    AgentPatch {
        status: Some(match outcome {
            RunOutcome::Ok => AgentStatus::Idle,
            RunOutcome::Error => AgentStatus::Error,
        }),
        run_id: Some(None),
        run_started_at: Some(None),
        stream_text: Some(None),
        thinking_trace: Some(None),
        ..AgentPatch::default()
    }
}

fn eligible_run_id(agent: &AgentState) -> Option<&str> {
    if agent.status != AgentStatus::Running || !agent.session_created {
        return None;
    }
    agent.run_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
}

/// Ask the gateway whether runs we believe are active have already ended.
///
/// Used after a reconnect, when terminal events may have been missed.
pub async fn run_agent_reconcile<C, G, T, D>(
    ctx: &StudioContext<C>,
    agents: &[AgentState],
    get_latest: G,
    tracker: &T,
    is_disconnect_like: D,
) -> Vec<StudioCommand>
where
    C: GatewayRpc,
    G: Fn(&str) -> Option<AgentState>,
    T: RunTracker + ?Sized,
    D: Fn(&StudioError) -> bool,
{
    let mut commands = Vec::new();
    for agent in agents {
        let Some(run_id) = eligible_run_id(agent) else {
            continue;
        };
        if !tracker.claim(run_id) {
            continue;
        }

        let params = json!({"runId": run_id, "timeoutMs": ctx.options.wait_timeout_ms});
        let waited: Result<AgentWaitResult, StudioError> =
            ctx.call(methods::AGENT_WAIT, &params).await;
        let result = match waited {
            Ok(result) => result,
            Err(err) => {
                tracker.release(run_id);
                if is_disconnect_like(&err) {
                    tracing::debug!(agent_id = %agent.agent_id, run_id, error = %err, "run reconcile interrupted");
                } else {
                    tracing::warn!(agent_id = %agent.agent_id, run_id, error = %err, "run reconcile failed");
                    commands.push(StudioCommand::LogError {
                        message: format!(
                            "Failed to reconcile run {run_id} for agent {}.",
                            agent.agent_id
                        ),
                        error: err,
                    });
                }
                continue;
            }
        };

        let outcome = match result.status.as_str() {
            "ok" => RunOutcome::Ok,
            "error" => RunOutcome::Error,
            _ => {
                tracker.release(run_id);
                continue;
            }
        };

        let still_running = get_latest(&agent.agent_id)
            .as_ref()
            .and_then(eligible_run_id)
            .is_some_and(|latest| latest == run_id);
        if !still_running {
            tracker.release(run_id);
            continue;
        }

        tracing::info!(agent_id = %agent.agent_id, run_id, ?outcome, "run settled during disconnect");
        commands.push(StudioCommand::ClearRunTracking {
            run_id: run_id.to_string(),
        });
        commands.push(StudioCommand::dispatch(
            agent.agent_id.clone(),
            reconcile_terminal_patch(outcome),
        ));
        commands.push(StudioCommand::RequestHistoryRefresh {
            agent_id: agent.agent_id.clone(),
        });
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedGateway, disconnected};

    fn running(agent_id: &str, run_id: &str) -> AgentState {
        AgentState {
            status: AgentStatus::Running,
            session_created: true,
            run_id: Some(run_id.to_string()),
            ..AgentState::new(agent_id, format!("agent:{agent_id}:main"))
        }
    }

    #[tokio::test]
    async fn terminal_run_is_reconciled() {
        let ctx = StudioContext::new(ScriptedGateway::new().on(methods::AGENT_WAIT, json!({"status": "ok"})));
        let agent = running("a1", "run-1");
        let runs = InFlightRuns::new();

        let commands = run_agent_reconcile(
            &ctx,
            std::slice::from_ref(&agent),
            |_| Some(agent.clone()),
            &runs,
            |_| false,
        )
        .await;

        assert_eq!(
            ctx.client.calls(),
            vec![(methods::AGENT_WAIT.to_string(), json!({"runId": "run-1", "timeoutMs": 1}))]
        );
        assert_eq!(commands.len(), 3);
        assert!(matches!(&commands[0], StudioCommand::ClearRunTracking { run_id } if run_id == "run-1"));
        match &commands[1] {
            StudioCommand::DispatchUpdateAgent { agent_id, patch, expected_revision } => {
                assert_eq!(agent_id, "a1");
                assert_eq!(*patch, reconcile_terminal_patch(RunOutcome::Ok));
                assert_eq!(*expected_revision, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&commands[2], StudioCommand::RequestHistoryRefresh { agent_id } if agent_id == "a1"));
        // Claim stays until the executor clears it.
        assert!(!runs.claim("run-1"));
    }

    #[tokio::test]
    async fn ineligible_agents_make_no_calls() {
        let ctx = StudioContext::new(ScriptedGateway::new());
        let idle = AgentState {
            status: AgentStatus::Idle,
            ..running("a1", "run-1")
        };
        let no_session = AgentState {
            session_created: false,
            ..running("a2", "run-2")
        };
        let blank_run = running("a3", "  ");
        let agents = [idle, no_session, blank_run];
        let commands =
            run_agent_reconcile(&ctx, &agents, |_| None, &InFlightRuns::new(), |_| false).await;
        assert!(commands.is_empty());
        assert!(ctx.client.calls().is_empty());
    }

    #[tokio::test]
    async fn claimed_runs_are_skipped() {
        let ctx = StudioContext::new(ScriptedGateway::new());
        let agent = running("a1", "run-1");
        let runs = InFlightRuns::new();
        runs.claim("run-1");
        let commands =
            run_agent_reconcile(&ctx, &[agent], |_| None, &runs, |_| false).await;
        assert!(commands.is_empty());
        assert!(ctx.client.calls().is_empty());
    }

    #[tokio::test]
    async fn timeout_releases_claim() {
        let ctx = StudioContext::new(
            ScriptedGateway::new().on(methods::AGENT_WAIT, json!({"status": "timeout"})),
        );
        let agent = running("a1", "run-1");
        let runs = InFlightRuns::new();
        let commands = run_agent_reconcile(
            &ctx,
            std::slice::from_ref(&agent),
            |_| Some(agent.clone()),
            &runs,
            |_| false,
        )
        .await;
        assert!(commands.is_empty());
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn run_replaced_meanwhile_is_left_alone() {
        let ctx = StudioContext::new(
            ScriptedGateway::new().on(methods::AGENT_WAIT, json!({"status": "error"})),
        );
        let agent = running("a1", "run-1");
        let commands = run_agent_reconcile(
            &ctx,
            std::slice::from_ref(&agent),
            |_| Some(running("a1", "run-2")),
            &InFlightRuns::new(),
            |_| false,
        )
        .await;
        assert!(commands.is_empty());
    }

    #[tokio::test]
    async fn disconnects_are_silent_other_errors_logged() {
        let ctx = StudioContext::new(
            ScriptedGateway::new()
                .then(methods::AGENT_WAIT, Err(disconnected()))
                .then(
                    methods::AGENT_WAIT,
                    Err(studio_gateway::GatewayError::Response {
                        code: "NOT_FOUND".into(),
                        message: "unknown run".into(),
                    }),
                ),
        );
        let agents = [running("a1", "run-1"), running("a2", "run-2")];
        let runs = InFlightRuns::new();
        let commands = run_agent_reconcile(
            &ctx,
            &agents,
            |_| None,
            &runs,
            StudioError::is_disconnect_like,
        )
        .await;
        assert_eq!(commands.len(), 1);
        assert!(matches!(&commands[0], StudioCommand::LogError { message, .. } if message.contains("run-2")));
        assert!(runs.is_empty());
    }
}
