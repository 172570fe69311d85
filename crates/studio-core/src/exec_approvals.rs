//! Per-agent exec approval policies in the gateway's approvals file.

use crate::context::StudioContext;
use crate::error::{StudioError, StudioResult, require_agent_id};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use studio_gateway::GatewayRpc;
use studio_gateway::protocol::{ExecApprovalsFile, ExecApprovalsSnapshot, JsonObject, methods};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecSecurity {
    Deny,
    Allowlist,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecAsk {
    Off,
    OnMiss,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecAllowlistEntry {
    pub pattern: String,
}

impl ExecAllowlistEntry {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecApprovalPolicy {
    pub security: ExecSecurity,
    pub ask: ExecAsk,
    #[serde(default)]
    pub allowlist: Vec<ExecAllowlistEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecApprovalsSetParams<'a> {
    file: &'a ExecApprovalsFile,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_hash: Option<&'a str>,
}

fn policy_of(file: &ExecApprovalsFile, agent_id: &str) -> Option<ExecApprovalPolicy> {
    let entry = file.agents.get(agent_id)?;
    match serde_json::from_value(entry.clone()) {
        Ok(policy) => Some(policy),
        Err(err) => {
            tracing::debug!(agent_id, error = %err, "ignoring unreadable exec approval entry");
            None
        }
    }
}

fn encode_policy(existing: Option<&Value>, policy: &ExecApprovalPolicy) -> StudioResult<Value> {
    let Value::Object(fields) = serde_json::to_value(policy)
        .map_err(|err| StudioError::payload(format!("failed to encode exec policy: {err}")))?
    else {
        return Err(StudioError::payload("exec policy did not encode to an object"));
    };
    let mut entry: JsonObject = existing
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    entry.extend(fields);
    Ok(Value::Object(entry))
}

/// The agent's current policy, or `None` when it has no entry.
pub async fn read_agent_exec_approvals<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
) -> StudioResult<Option<ExecApprovalPolicy>> {
    let agent_id = require_agent_id(agent_id)?;
    let snapshot: ExecApprovalsSnapshot =
        ctx.call(methods::EXEC_APPROVALS_GET, &JsonObject::new()).await?;
    Ok(policy_of(&snapshot.file, agent_id))
}

/// Set or, with `None`, remove the agent's policy. Returns whether a write
/// was made; an unchanged file is left alone.
pub async fn upsert_agent_exec_approvals<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
    policy: Option<&ExecApprovalPolicy>,
) -> StudioResult<bool> {
    let agent_id = require_agent_id(agent_id)?;
    let snapshot: ExecApprovalsSnapshot =
        ctx.call(methods::EXEC_APPROVALS_GET, &JsonObject::new()).await?;

    let mut file = snapshot.file.clone();
    match policy {
        Some(policy) => {
            let entry = encode_policy(file.agents.get(agent_id), policy)?;
            file.agents.insert(agent_id.to_string(), entry);
        }
        None => {
            file.agents.remove(agent_id);
        }
    }
    if file == snapshot.file {
        return Ok(false);
    }

    let base_hash = snapshot
        .hash
        .as_deref()
        .map(str::trim)
        .filter(|hash| !hash.is_empty());
    if snapshot.exists && base_hash.is_none() {
        return Err(StudioError::payload(
            "exec approvals hash unavailable; re-run exec.approvals.get",
        ));
    }
    ctx.call_unit(
        methods::EXEC_APPROVALS_SET,
        &ExecApprovalsSetParams {
            file: &file,
            base_hash,
        },
    )
    .await?;
    tracing::info!(agent_id, removed = policy.is_none(), "exec approvals updated");
    Ok(true)
}
