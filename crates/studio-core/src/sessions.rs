use crate::context::StudioContext;
use crate::error::{StudioError, StudioResult, require_agent_id};
use crate::exec_approvals::{ExecAsk, ExecSecurity};
use crate::session_keys::{
    StudioSessionEntry, StudioSessionSelection, extract_studio_session_entries,
    group_studio_sessions, reconcile_studio_session_selection,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use studio_gateway::GatewayRpc;
use studio_gateway::protocol::{SessionListEntry, SessionsListResult, methods};

pub const SESSION_LIST_LIMIT: usize = 200;

pub async fn list_sessions<C: GatewayRpc>(
    ctx: &StudioContext<C>,
) -> StudioResult<Vec<SessionListEntry>> {
    let params = json!({
        "includeGlobal": true,
        "includeUnknown": true,
        "limit": SESSION_LIST_LIMIT,
    });
    let result: SessionsListResult = ctx.call(methods::SESSIONS_LIST, &params).await?;
    Ok(result.sessions)
}

/// List sessions and pick the studio session id for `agent_ids`.
///
/// Nothing is deleted here; stale keys are returned for the caller to prune
/// with [`delete_sessions`].
pub async fn reconcile_studio_sessions<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_ids: &[String],
    persisted_session_id: Option<&str>,
    generated_session_id: &str,
) -> StudioResult<StudioSessionSelection> {
    let sessions = list_sessions(ctx).await?;
    let groups = group_studio_sessions(agent_ids, &sessions);
    let selection =
        reconcile_studio_session_selection(&groups, persisted_session_id, generated_session_id);
    tracing::debug!(
        session_id = %selection.session_id,
        existing = selection.existing_session_keys.len(),
        stale = selection.stale_studio_keys.len(),
        "studio sessions reconciled"
    );
    Ok(selection)
}

/// Delete each key in turn. Stops at the first failure.
pub async fn delete_sessions<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    keys: &[String],
) -> StudioResult<usize> {
    let mut deleted = 0;
    for key in keys.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
        ctx.call_unit(methods::SESSIONS_DELETE, &json!({ "key": key }))
            .await?;
        tracing::info!(session_key = key, "stale session deleted");
        deleted += 1;
    }
    Ok(deleted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecHost {
    Sandbox,
    Gateway,
}

/// Exec settings carried by `sessions.patch`. A `None` host is sent as
/// `null`, which clears the session's host override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExecSettings {
    pub exec_host: Option<ExecHost>,
    pub exec_security: ExecSecurity,
    pub exec_ask: ExecAsk,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionsPatchParams<'a> {
    key: &'a str,
    #[serde(flatten)]
    settings: &'a SessionExecSettings,
}

pub async fn sync_session_exec_settings<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    session_key: &str,
    settings: &SessionExecSettings,
) -> StudioResult<()> {
    let key = session_key.trim();
    if key.is_empty() {
        return Err(StudioError::validation("Session key is required."));
    }
    ctx.call_unit(
        methods::SESSIONS_PATCH,
        &SessionsPatchParams { key, settings },
    )
    .await
}

/// Studio session keys currently known for one agent, newest first.
pub async fn list_agent_studio_sessions<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
) -> StudioResult<Vec<StudioSessionEntry>> {
    let agent_id = require_agent_id(agent_id)?;
    let sessions = list_sessions(ctx).await?;
    Ok(extract_studio_session_entries(agent_id, &sessions))
}
