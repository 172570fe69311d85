use crate::agent_config::{AgentOverrides, update_agent_overrides};
use crate::context::StudioContext;
use crate::error::{StudioResult, require_agent_id, require_agent_name};
use crate::exec_approvals::{ExecApprovalPolicy, upsert_agent_exec_approvals};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use studio_gateway::GatewayRpc;
use studio_gateway::protocol::{AgentsCreateResult, methods};

/// Side effects the creation wizard wants applied to a new agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentGuidedSetup {
    #[serde(default)]
    pub agent_overrides: AgentOverrides,
    /// Workspace file name to contents, e.g. `AGENTS.md`.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub exec_approvals: Option<ExecApprovalPolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentOutcome {
    pub agent_id: String,
    pub setup_applied: bool,
    /// The gateway is remote; setup must wait until it has restarted.
    pub awaiting_restart: bool,
}

async fn write_agent_files<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
    files: &BTreeMap<String, String>,
) -> StudioResult<()> {
    for (name, content) in files {
        ctx.call_unit(
            methods::AGENTS_FILES_SET,
            &json!({"agentId": agent_id, "name": name, "content": content}),
        )
        .await?;
    }
    Ok(())
}

/// Apply `setup` to an agent that already exists.
///
/// Files are written first, then the exec approval policy, then the config
/// overrides. Each step is idempotent, so an interrupted apply can simply be
/// run again.
pub async fn apply_guided_agent_setup<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
    setup: &AgentGuidedSetup,
    include_overrides: bool,
) -> StudioResult<()> {
    let agent_id = require_agent_id(agent_id)?;
    write_agent_files(ctx, agent_id, &setup.files).await?;
    upsert_agent_exec_approvals(ctx, agent_id, setup.exec_approvals.as_ref()).await?;
    if include_overrides && !setup.agent_overrides.is_empty() {
        update_agent_overrides(ctx, agent_id, &setup.agent_overrides).await?;
    }
    tracing::info!(agent_id, files = setup.files.len(), "guided setup applied");
    Ok(())
}

/// Create an agent and, on a local gateway, apply its setup right away.
///
/// A remote gateway has to restart before the new agent can take files, so
/// the setup is left to the caller to persist and apply later.
pub async fn create_agent_with_optional_setup<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    name: &str,
    setup: Option<&AgentGuidedSetup>,
    is_local_gateway: bool,
) -> StudioResult<CreateAgentOutcome> {
    let name = require_agent_name(name)?;
    let created: AgentsCreateResult = ctx
        .call(methods::AGENTS_CREATE, &json!({ "name": name }))
        .await?;
    let agent_id = created.agent_id;

    if !is_local_gateway {
        tracing::info!(agent_id = %agent_id, "agent created on remote gateway, setup deferred");
        return Ok(CreateAgentOutcome {
            agent_id,
            setup_applied: false,
            awaiting_restart: true,
        });
    }
    if let Some(setup) = setup {
        apply_guided_agent_setup(ctx, &agent_id, setup, true).await?;
    }
    Ok(CreateAgentOutcome {
        agent_id,
        setup_applied: setup.is_some(),
        awaiting_restart: false,
    })
}
