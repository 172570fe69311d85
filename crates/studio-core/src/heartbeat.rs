use crate::agent_config::{AgentHeartbeat, resolve_heartbeat_settings};
use crate::context::StudioContext;
use crate::error::{StudioResult, require_agent_id};
use serde::{Deserialize, Serialize};
use serde_json::json;
use studio_gateway::GatewayRpc;
use studio_gateway::protocol::{
    ConfigSnapshot, GatewayStatusSnapshot, JsonObject, WakeResult, methods,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatSource {
    Override,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHeartbeatSummary {
    pub id: String,
    pub agent_id: String,
    pub source: HeartbeatSource,
    pub enabled: bool,
    pub heartbeat: AgentHeartbeat,
}

/// Heartbeats configured for one agent, as seen by config and live status.
///
/// Empty when the gateway reports the heartbeat disabled and the agent has
/// no override of its own.
pub async fn list_heartbeats_for_agent<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
) -> StudioResult<Vec<AgentHeartbeatSummary>> {
    let agent_id = require_agent_id(agent_id)?;
    let empty = JsonObject::new();
    let (snapshot, status): (ConfigSnapshot, GatewayStatusSnapshot) = tokio::try_join!(
        ctx.call(methods::CONFIG_GET, &empty),
        ctx.call(methods::STATUS, &empty),
    )?;

    let resolved = resolve_heartbeat_settings(&snapshot.document, agent_id);
    let live = status
        .heartbeat
        .as_ref()
        .and_then(|hb| {
            hb.agents
                .iter()
                .find(|entry| entry.agent_id.as_deref().map(str::trim) == Some(agent_id))
        });
    let enabled = live.and_then(|entry| entry.enabled).unwrap_or(false);
    if !enabled && !resolved.has_override {
        return Ok(Vec::new());
    }

    let mut heartbeat = resolved.heartbeat;
    if let Some(every) = live
        .and_then(|entry| entry.every.as_deref())
        .map(str::trim)
        .filter(|every| !every.is_empty())
    {
        heartbeat.every = every.to_string();
    }
    Ok(vec![AgentHeartbeatSummary {
        id: agent_id.to_string(),
        agent_id: agent_id.to_string(),
        source: if resolved.has_override {
            HeartbeatSource::Override
        } else {
            HeartbeatSource::Default
        },
        enabled,
        heartbeat,
    }])
}

/// Ask the gateway to run a heartbeat immediately.
pub async fn trigger_heartbeat_now<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
) -> StudioResult<WakeResult> {
    let agent_id = require_agent_id(agent_id)?;
    let params = json!({
        "mode": "now",
        "text": format!("OpenClaw Studio heartbeat trigger ({agent_id})."),
    });
    ctx.call(methods::WAKE, &params).await
}
