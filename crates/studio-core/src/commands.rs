//! Side effects described as data.
//!
//! History sync and run reconciliation never touch local state directly. They
//! return [`StudioCommand`]s and the caller runs them through
//! [`execute_commands`] against a [`CommandSink`].

use crate::agent_state::AgentPatch;
use crate::error::StudioError;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoopReason {
    MissingAgent,
    SessionNotCreated,
    RequestInFlight,
    SessionKeyChanged,
}

impl fmt::Display for NoopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::MissingAgent => "missing-agent",
            Self::SessionNotCreated => "session-not-created",
            Self::RequestInFlight => "request-in-flight",
            Self::SessionKeyChanged => "session-key-changed",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricMeta {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum StudioCommand {
    /// Patch one agent. With `expected_revision`, the sink must refuse the
    /// patch if the agent's transcript revision has moved on.
    DispatchUpdateAgent {
        agent_id: String,
        patch: AgentPatch,
        expected_revision: Option<u64>,
    },
    LogMetric {
        metric: String,
        meta: MetricMeta,
    },
    LogError {
        message: String,
        error: StudioError,
    },
    Noop {
        reason: NoopReason,
    },
    ClearRunTracking {
        run_id: String,
    },
    RequestHistoryRefresh {
        agent_id: String,
    },
}

impl StudioCommand {
    pub fn dispatch(agent_id: impl Into<String>, patch: AgentPatch) -> Self {
        Self::DispatchUpdateAgent {
            agent_id: agent_id.into(),
            patch,
            expected_revision: None,
        }
    }

    pub fn noop(reason: NoopReason) -> Self {
        Self::Noop { reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied,
    MissingAgent,
    Stale { current_revision: u64 },
}

/// Where commands land. The logging hooks default to `tracing`.
pub trait CommandSink {
    fn dispatch(
        &mut self,
        agent_id: &str,
        patch: &AgentPatch,
        expected_revision: Option<u64>,
    ) -> DispatchOutcome;

    fn log_metric(&mut self, metric: &str, meta: &MetricMeta) {
        tracing::info!(metric, agent_id = %meta.agent_id, "metric");
    }

    fn log_error(&mut self, message: &str, error: &StudioError) {
        tracing::warn!(error = %error, "{message}");
    }

    fn clear_run_tracking(&mut self, _run_id: &str) {}

    fn request_history_refresh(&mut self, _agent_id: &str) {}
}

/// Apply `commands` in order.
///
/// Disconnect-like errors are expected while reconnecting and only logged at
/// debug. A guarded dispatch refused as stale turns into a history refresh
/// for that agent.
pub fn execute_commands<S, F>(commands: Vec<StudioCommand>, sink: &mut S, is_disconnect_like: F)
where
    S: CommandSink + ?Sized,
    F: Fn(&StudioError) -> bool,
{
    for command in commands {
        match command {
            StudioCommand::DispatchUpdateAgent {
                agent_id,
                patch,
                expected_revision,
            } => match sink.dispatch(&agent_id, &patch, expected_revision) {
                DispatchOutcome::Applied => {}
                DispatchOutcome::MissingAgent => {
                    tracing::debug!(agent_id = %agent_id, "dropping patch for unknown agent");
                }
                DispatchOutcome::Stale { current_revision } => {
                    tracing::debug!(
                        agent_id = %agent_id,
                        expected_revision,
                        current_revision,
                        "transcript moved on, requesting history refresh"
                    );
                    sink.request_history_refresh(&agent_id);
                }
            },
            StudioCommand::LogMetric { metric, meta } => sink.log_metric(&metric, &meta),
            StudioCommand::LogError { message, error } => {
                if is_disconnect_like(&error) {
                    tracing::debug!(error = %error, "{message}");
                } else {
                    sink.log_error(&message, &error);
                }
            }
            StudioCommand::Noop { reason } => {
                tracing::trace!(%reason, "noop");
            }
            StudioCommand::ClearRunTracking { run_id } => sink.clear_run_tracking(&run_id),
            StudioCommand::RequestHistoryRefresh { agent_id } => {
                sink.request_history_refresh(&agent_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_state::{AgentState, AgentStore};
    use crate::testing::disconnected;

    #[derive(Default)]
    struct RecordingSink {
        dispatched: Vec<(String, AgentPatch)>,
        metrics: Vec<(String, MetricMeta)>,
        errors: Vec<String>,
        refreshes: Vec<String>,
        stale_next: bool,
    }

    impl CommandSink for RecordingSink {
        fn dispatch(
            &mut self,
            agent_id: &str,
            patch: &AgentPatch,
            _expected_revision: Option<u64>,
        ) -> DispatchOutcome {
            if std::mem::take(&mut self.stale_next) {
                return DispatchOutcome::Stale {
                    current_revision: 9,
                };
            }
            self.dispatched.push((agent_id.to_string(), patch.clone()));
            DispatchOutcome::Applied
        }

        fn log_metric(&mut self, metric: &str, meta: &MetricMeta) {
            self.metrics.push((metric.to_string(), meta.clone()));
        }

        fn log_error(&mut self, message: &str, _error: &StudioError) {
            self.errors.push(message.to_string());
        }

        fn request_history_refresh(&mut self, agent_id: &str) {
            self.refreshes.push(agent_id.to_string());
        }
    }

    #[test]
    fn executes_dispatch_and_metrics_and_suppresses_disconnects() {
        let patch = AgentPatch {
            history_loaded_at: Some(1234),
            ..AgentPatch::default()
        };
        let meta = MetricMeta {
            agent_id: "agent-1".into(),
            request_id: Some("req-1".into()),
            run_id: Some("run-1".into()),
        };
        let commands = vec![
            StudioCommand::dispatch("agent-1", patch.clone()),
            StudioCommand::LogMetric {
                metric: "history_sync_test_metric".into(),
                meta: meta.clone(),
            },
            StudioCommand::LogError {
                message: "Disconnected".into(),
                error: StudioError::Gateway(disconnected()),
            },
            StudioCommand::LogError {
                message: "Unexpected failure".into(),
                error: StudioError::payload("boom"),
            },
            StudioCommand::noop(NoopReason::MissingAgent),
        ];

        let mut sink = RecordingSink::default();
        execute_commands(commands, &mut sink, StudioError::is_disconnect_like);

        assert_eq!(sink.dispatched, vec![("agent-1".to_string(), patch)]);
        assert_eq!(sink.metrics, vec![("history_sync_test_metric".to_string(), meta)]);
        assert_eq!(sink.errors, ["Unexpected failure"]);
    }

    #[test]
    fn stale_dispatch_requests_refresh() {
        let mut sink = RecordingSink {
            stale_next: true,
            ..RecordingSink::default()
        };
        execute_commands(
            vec![StudioCommand::DispatchUpdateAgent {
                agent_id: "a".into(),
                patch: AgentPatch::default(),
                expected_revision: Some(1),
            }],
            &mut sink,
            |_| false,
        );
        assert!(sink.dispatched.is_empty());
        assert_eq!(sink.refreshes, ["a"]);
    }

    #[test]
    fn store_sink_applies_in_order() {
        let mut store = AgentStore::from_agents([AgentState::new("a", "agent:a:main")]);
        execute_commands(
            vec![
                StudioCommand::dispatch(
                    "a",
                    AgentPatch {
                        output_lines: Some(vec!["x".into()]),
                        ..AgentPatch::default()
                    },
                ),
                StudioCommand::RequestHistoryRefresh {
                    agent_id: "a".into(),
                },
            ],
            &mut store,
            StudioError::is_disconnect_like,
        );
        assert_eq!(store.get("a").unwrap().output_lines, ["x"]);
        assert_eq!(store.take_refresh_requests(), ["a"]);
    }

    #[test]
    fn noop_reason_strings() {
        assert_eq!(NoopReason::MissingAgent.to_string(), "missing-agent");
        assert_eq!(
            serde_json::to_value(NoopReason::SessionKeyChanged).unwrap(),
            serde_json::json!("session-key-changed")
        );
    }
}
