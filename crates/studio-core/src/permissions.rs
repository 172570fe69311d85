//! Agent permission presets and how they map onto exec approvals, tool
//! groups and session exec settings.

use crate::agent_config::{AgentOverrides, list_agents, update_agent_overrides};
use crate::context::StudioContext;
use crate::error::{StudioResult, require_agent_id};
use crate::exec_approvals::{
    ExecAllowlistEntry, ExecApprovalPolicy, ExecAsk, ExecSecurity, read_agent_exec_approvals,
    upsert_agent_exec_approvals,
};
use crate::sessions::{ExecHost, SessionExecSettings, sync_session_exec_settings};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use studio_gateway::GatewayRpc;
use studio_gateway::protocol::JsonObject;

const GROUP_RUNTIME: &str = "group:runtime";
const GROUP_WEB: &str = "group:web";
const GROUP_FS: &str = "group:fs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionRole {
    Conservative,
    Collaborative,
    Autonomous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandMode {
    Off,
    Ask,
    Auto,
}

impl ExecutionRole {
    /// Role implied by a session's current exec settings.
    pub fn from_session(security: Option<ExecSecurity>, ask: Option<ExecAsk>) -> Self {
        match (security, ask) {
            (Some(ExecSecurity::Full), Some(ExecAsk::Off)) => Self::Autonomous,
            (Some(ExecSecurity::Allowlist), _) | (_, Some(ExecAsk::Always | ExecAsk::OnMiss)) => {
                Self::Collaborative
            }
            _ => Self::Conservative,
        }
    }

    pub fn for_command_mode(mode: CommandMode) -> Self {
        match mode {
            CommandMode::Off => Self::Conservative,
            CommandMode::Ask => Self::Collaborative,
            CommandMode::Auto => Self::Autonomous,
        }
    }

    pub fn command_mode(self) -> CommandMode {
        match self {
            Self::Conservative => CommandMode::Off,
            Self::Collaborative => CommandMode::Ask,
            Self::Autonomous => CommandMode::Auto,
        }
    }

    pub fn preset_defaults(self) -> AgentPermissionsDraft {
        let open = self != Self::Conservative;
        AgentPermissionsDraft {
            command_mode: self.command_mode(),
            web_access: open,
            file_tools: open,
        }
    }

    /// Exec approval policy for the role. Conservative agents get none.
    pub fn exec_policy(self, allowlist: Vec<ExecAllowlistEntry>) -> Option<ExecApprovalPolicy> {
        let (security, ask) = match self {
            Self::Conservative => return None,
            Self::Collaborative => (ExecSecurity::Allowlist, ExecAsk::Always),
            Self::Autonomous => (ExecSecurity::Full, ExecAsk::Off),
        };
        Some(ExecApprovalPolicy {
            security,
            ask,
            allowlist,
        })
    }

    /// Session exec settings for the role. Commands run in the sandbox only
    /// when the agent's sandbox mode is `all`.
    pub fn session_exec_settings(self, sandbox_mode: &str) -> SessionExecSettings {
        let host = if sandbox_mode.trim().eq_ignore_ascii_case("all") {
            ExecHost::Sandbox
        } else {
            ExecHost::Gateway
        };
        match self {
            Self::Conservative => SessionExecSettings {
                exec_host: None,
                exec_security: ExecSecurity::Deny,
                exec_ask: ExecAsk::Off,
            },
            Self::Collaborative => SessionExecSettings {
                exec_host: Some(host),
                exec_security: ExecSecurity::Allowlist,
                exec_ask: ExecAsk::Always,
            },
            Self::Autonomous => SessionExecSettings {
                exec_host: Some(host),
                exec_security: ExecSecurity::Full,
                exec_ask: ExecAsk::Off,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPermissionsDraft {
    pub command_mode: CommandMode,
    pub web_access: bool,
    pub file_tools: bool,
}

impl AgentPermissionsDraft {
    /// True when the draft departs from the role's preset.
    pub fn is_custom(&self, role: ExecutionRole) -> bool {
        *self != role.preset_defaults()
    }

    pub fn summary(&self) -> String {
        let commands = match self.command_mode {
            CommandMode::Auto => "Auto",
            CommandMode::Ask => "Ask",
            CommandMode::Off => "Off",
        };
        let on_off = |enabled: bool| if enabled { "On" } else { "Off" };
        format!(
            "Commands: {commands} | Web: {} | File tools: {}",
            on_off(self.web_access),
            on_off(self.file_tools)
        )
    }
}

impl fmt::Display for AgentPermissionsDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Insertion-ordered set of tool names.
#[derive(Debug, Default)]
struct ToolSet(Vec<String>);

impl ToolSet {
    fn contains(&self, tool: &str) -> bool {
        self.0.iter().any(|t| t == tool)
    }

    fn insert(&mut self, tool: &str) {
        if !self.contains(tool) {
            self.0.push(tool.to_string());
        }
    }

    fn remove(&mut self, tool: &str) {
        self.0.retain(|t| t != tool);
    }
}

fn string_list(tools: Option<&JsonObject>, key: &str) -> Option<Vec<String>> {
    let items = tools?.get(key)?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Allowed and denied tools of an agent's `tools` override. Agents that set
/// `allow` replace the default tool set; the rest extend it via `alsoAllow`.
struct ToolLists {
    uses_allow: bool,
    allowed: ToolSet,
    denied: ToolSet,
}

impl ToolLists {
    fn read(tools: Option<&JsonObject>) -> Self {
        let allow = string_list(tools, "allow");
        let uses_allow = allow.is_some();
        let allowed = allow
            .or_else(|| string_list(tools, "alsoAllow"))
            .unwrap_or_default();
        let mut lists = Self {
            uses_allow,
            allowed: ToolSet::default(),
            denied: ToolSet::default(),
        };
        for tool in &allowed {
            lists.allowed.insert(tool);
        }
        for tool in string_list(tools, "deny").unwrap_or_default() {
            lists.denied.insert(&tool);
        }
        lists
    }

    fn group_state(&self, group: &str) -> Option<bool> {
        if self.denied.contains(group) {
            Some(false)
        } else if self.allowed.contains(group) {
            Some(true)
        } else {
            None
        }
    }
}

/// Per-group state of a `tools` override. `None` means the group is not
/// mentioned; deny wins over allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolGroupState {
    pub runtime: Option<bool>,
    pub web: Option<bool>,
    pub fs: Option<bool>,
    pub uses_allow: bool,
}

impl ToolGroupState {
    pub fn from_tools(tools: Option<&JsonObject>) -> Self {
        let lists = ToolLists::read(tools);
        Self {
            runtime: lists.group_state(GROUP_RUNTIME),
            web: lists.group_state(GROUP_WEB),
            fs: lists.group_state(GROUP_FS),
            uses_allow: lists.uses_allow,
        }
    }
}

/// New `tools` override fields with the three groups toggled. Other
/// entries of the lists are kept, as is the agent's `allow`/`alsoAllow`
/// mode.
pub fn resolve_tool_group_overrides(
    tools: Option<&JsonObject>,
    runtime: bool,
    web: bool,
    fs: bool,
) -> JsonObject {
    let mut lists = ToolLists::read(tools);
    for (group, enabled) in [(GROUP_RUNTIME, runtime), (GROUP_WEB, web), (GROUP_FS, fs)] {
        if enabled {
            lists.allowed.insert(group);
            lists.denied.remove(group);
        } else {
            lists.allowed.remove(group);
            lists.denied.insert(group);
        }
    }
    let deny: Vec<Value> = lists
        .denied
        .0
        .iter()
        .filter(|tool| !lists.allowed.contains(tool))
        .map(|tool| Value::String(tool.clone()))
        .collect();
    let allow: Vec<Value> = lists.allowed.0.into_iter().map(Value::String).collect();

    let allow_key = if lists.uses_allow { "allow" } else { "alsoAllow" };
    let mut out = JsonObject::new();
    out.insert(allow_key.to_string(), Value::Array(allow));
    out.insert("deny".to_string(), Value::Array(deny));
    out
}

/// Draft shown for an agent: command mode from its session role, web and
/// file access from its tool override when set, else the role preset.
pub fn resolve_agent_permissions_draft(
    security: Option<ExecSecurity>,
    ask: Option<ExecAsk>,
    tools: Option<&JsonObject>,
) -> AgentPermissionsDraft {
    let defaults = ExecutionRole::from_session(security, ask).preset_defaults();
    let groups = ToolGroupState::from_tools(tools);
    AgentPermissionsDraft {
        command_mode: defaults.command_mode,
        web_access: groups.web.unwrap_or(defaults.web_access),
        file_tools: groups.fs.unwrap_or(defaults.file_tools),
    }
}

/// Apply a permissions draft: exec approvals, then tool overrides, then the
/// session's exec settings. The existing allowlist is carried over.
pub async fn update_agent_permissions<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
    session_key: &str,
    draft: &AgentPermissionsDraft,
) -> StudioResult<SessionExecSettings> {
    let agent_id = require_agent_id(agent_id)?;
    let role = ExecutionRole::for_command_mode(draft.command_mode);

    let allowlist = read_agent_exec_approvals(ctx, agent_id)
        .await?
        .map(|policy| policy.allowlist)
        .unwrap_or_default();
    upsert_agent_exec_approvals(ctx, agent_id, role.exec_policy(allowlist).as_ref()).await?;

    let entry = list_agents(ctx)
        .await?
        .into_iter()
        .find(|entry| entry.id == agent_id);
    let sandbox_mode = entry
        .as_ref()
        .and_then(|entry| entry.sandbox_object())
        .and_then(|sandbox| sandbox.get("mode"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tools = resolve_tool_group_overrides(
        entry.as_ref().and_then(|entry| entry.tools_object()),
        role != ExecutionRole::Conservative,
        draft.web_access,
        draft.file_tools,
    );
    update_agent_overrides(
        ctx,
        agent_id,
        &AgentOverrides {
            sandbox: None,
            tools: Some(tools),
        },
    )
    .await?;

    let settings = role.session_exec_settings(&sandbox_mode);
    sync_session_exec_settings(ctx, session_key, &settings).await?;
    tracing::info!(agent_id, ?role, summary = %draft, "agent permissions updated");
    Ok(settings)
}
