use crate::commands::{CommandSink, DispatchOutcome, MetricMeta};
use crate::exec_approvals::{ExecAsk, ExecSecurity};
use crate::reconcile::{InFlightRuns, RunTracker};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Running,
    Error,
}

/// Client-side view of one agent and its transcript.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentState {
    pub agent_id: String,
    pub name: Option<String>,
    pub session_key: String,
    pub status: AgentStatus,
    pub session_created: bool,
    pub run_id: Option<String>,
    pub run_started_at: Option<u64>,
    pub stream_text: Option<String>,
    pub thinking_trace: Option<String>,
    pub output_lines: Vec<String>,
    pub last_result: Option<String>,
    pub latest_preview: Option<String>,
    pub last_user_message: Option<String>,
    pub last_assistant_message_at: Option<u64>,
    /// Bumped on every change to `output_lines`.
    pub transcript_revision: u64,
    pub last_history_request_revision: Option<u64>,
    /// Most recent history request issued for this agent.
    pub last_history_request_id: Option<String>,
    pub last_applied_history_request_id: Option<String>,
    pub history_loaded_at: Option<u64>,
    pub history_fetch_limit: Option<usize>,
    pub history_fetched_count: Option<usize>,
    pub history_maybe_truncated: bool,
    pub session_exec_security: Option<ExecSecurity>,
    pub session_exec_ask: Option<ExecAsk>,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>, session_key: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_key: session_key.into(),
            ..Self::default()
        }
    }

    /// Whether a history response for `request_id` is still the newest one
    /// the caller asked for. Stale responses must not be dispatched.
    pub fn is_history_response_current(&self, request_id: &str) -> bool {
        self.last_history_request_id
            .as_deref()
            .is_none_or(|latest| latest == request_id)
    }

    pub fn has_active_run(&self) -> bool {
        self.status == AgentStatus::Running
            && self.run_id.as_deref().is_some_and(|id| !id.trim().is_empty())
    }
}

/// Partial update of an [`AgentState`].
///
/// `None` leaves a field alone. For nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_started_at: Option<Option<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_text: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_trace: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_lines: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_preview: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_user_message: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_assistant_message_at: Option<Option<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_history_request_revision: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_history_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_loaded_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_fetch_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_fetched_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_maybe_truncated: Option<bool>,
}

fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *slot = value.clone();
    }
}

impl AgentPatch {
    pub fn apply(&self, state: &mut AgentState) {
        set(&mut state.status, &self.status);
        set(&mut state.run_id, &self.run_id);
        set(&mut state.run_started_at, &self.run_started_at);
        set(&mut state.stream_text, &self.stream_text);
        set(&mut state.thinking_trace, &self.thinking_trace);
        if let Some(lines) = &self.output_lines
            && *lines != state.output_lines
        {
            state.output_lines = lines.clone();
            state.transcript_revision += 1;
        }
        set(&mut state.last_result, &self.last_result);
        set(&mut state.latest_preview, &self.latest_preview);
        set(&mut state.last_user_message, &self.last_user_message);
        set(&mut state.last_assistant_message_at, &self.last_assistant_message_at);
        if self.last_history_request_revision.is_some() {
            state.last_history_request_revision = self.last_history_request_revision;
        }
        if self.last_applied_history_request_id.is_some() {
            state.last_applied_history_request_id = self.last_applied_history_request_id.clone();
        }
        if self.history_loaded_at.is_some() {
            state.history_loaded_at = self.history_loaded_at;
        }
        if self.history_fetch_limit.is_some() {
            state.history_fetch_limit = self.history_fetch_limit;
        }
        if self.history_fetched_count.is_some() {
            state.history_fetched_count = self.history_fetched_count;
        }
        set(&mut state.history_maybe_truncated, &self.history_maybe_truncated);
    }
}

/// Reference reducer for the commands emitted by history sync and run
/// reconciliation.
#[derive(Debug, Default)]
pub struct AgentStore {
    agents: BTreeMap<String, AgentState>,
    in_flight_history: HashSet<String>,
    refresh_requests: Vec<String>,
    pub runs: InFlightRuns,
}

impl AgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_agents(agents: impl IntoIterator<Item = AgentState>) -> Self {
        Self {
            agents: agents
                .into_iter()
                .map(|agent| (agent.agent_id.clone(), agent))
                .collect(),
            ..Self::default()
        }
    }

    pub fn upsert(&mut self, agent: AgentState) {
        self.agents.insert(agent.agent_id.clone(), agent);
    }

    pub fn remove(&mut self, agent_id: &str) -> Option<AgentState> {
        self.agents.remove(agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentState> {
        self.agents.get(agent_id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentState> {
        self.agents.values()
    }

    pub fn snapshot(&self) -> Vec<AgentState> {
        self.agents.values().cloned().collect()
    }

    /// Append a streamed transcript line, advancing the revision.
    pub fn append_output(&mut self, agent_id: &str, line: impl Into<String>) -> bool {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return false;
        };
        agent.output_lines.push(line.into());
        agent.transcript_revision += 1;
        true
    }

    /// Mark a history request as issued. Returns false when one is already
    /// in flight for the agent's session key.
    pub fn begin_history_request(&mut self, agent_id: &str, request_id: &str) -> bool {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return false;
        };
        if !self.in_flight_history.insert(agent.session_key.clone()) {
            return false;
        }
        agent.last_history_request_id = Some(request_id.to_string());
        true
    }

    pub fn end_history_request(&mut self, session_key: &str) {
        self.in_flight_history.remove(session_key);
    }

    pub fn in_flight_history(&self) -> &HashSet<String> {
        &self.in_flight_history
    }

    /// Agents whose history should be re-fetched, drained in request order.
    pub fn take_refresh_requests(&mut self) -> Vec<String> {
        std::mem::take(&mut self.refresh_requests)
    }
}

impl CommandSink for AgentStore {
    fn dispatch(
        &mut self,
        agent_id: &str,
        patch: &AgentPatch,
        expected_revision: Option<u64>,
    ) -> DispatchOutcome {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return DispatchOutcome::MissingAgent;
        };
        if let Some(expected) = expected_revision
            && agent.transcript_revision != expected
        {
            return DispatchOutcome::Stale {
                current_revision: agent.transcript_revision,
            };
        }
        patch.apply(agent);
        DispatchOutcome::Applied
    }

    fn log_metric(&mut self, metric: &str, meta: &MetricMeta) {
        tracing::info!(
            metric,
            agent_id = %meta.agent_id,
            request_id = meta.request_id.as_deref().unwrap_or(""),
            run_id = meta.run_id.as_deref().unwrap_or(""),
            "metric"
        );
    }

    fn clear_run_tracking(&mut self, run_id: &str) {
        self.runs.release(run_id);
    }

    fn request_history_refresh(&mut self, agent_id: &str) {
        if !self.refresh_requests.iter().any(|id| id == agent_id) {
            self.refresh_requests.push(agent_id.to_string());
        }
    }
}
