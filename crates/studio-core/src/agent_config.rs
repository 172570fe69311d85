use crate::config_list::{
    AgentDirectoryEntry, agent_list_patch, read_agent_list, upsert_agent_entry, write_agent_list,
};
use crate::config_mutation::{Mutation, mutate_config};
use crate::context::StudioContext;
use crate::error::{StudioResult, require_agent_id, require_agent_name};
use crate::slug::allocate_agent_id;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use studio_gateway::GatewayRpc;
use studio_gateway::protocol::{ConfigSnapshot, JsonObject, methods};

const DEFAULT_EVERY: &str = "30m";
const DEFAULT_TARGET: &str = "last";
const DEFAULT_ACK_MAX_CHARS: u64 = 300;

// ---------------------------------------------------------------------------
// Heartbeat settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatActiveHours {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHeartbeat {
    pub every: String,
    pub target: String,
    pub include_reasoning: bool,
    #[serde(default)]
    pub ack_max_chars: Option<Number>,
    #[serde(default)]
    pub active_hours: Option<HeartbeatActiveHours>,
}

/// Effective heartbeat for one agent and whether it carries its own override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHeartbeatResult {
    pub heartbeat: AgentHeartbeat,
    pub has_override: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatUpdate {
    /// `false` drops the agent's override and falls back to the defaults.
    #[serde(rename = "override")]
    pub override_enabled: bool,
    pub heartbeat: AgentHeartbeat,
}

fn heartbeat_defaults(document: &JsonObject) -> Option<&JsonObject> {
    document
        .get("agents")
        .and_then(|agents| agents.get("defaults"))
        .and_then(|defaults| defaults.get("heartbeat"))
        .and_then(Value::as_object)
}

fn coerce_active_hours(value: Option<&Value>) -> Option<HeartbeatActiveHours> {
    let hours = value?.as_object()?;
    let start = hours.get("start").and_then(Value::as_str).filter(|s| !s.is_empty())?;
    let end = hours.get("end").and_then(Value::as_str).filter(|s| !s.is_empty())?;
    Some(HeartbeatActiveHours {
        start: start.to_string(),
        end: end.to_string(),
    })
}

/// Any JSON number is kept as written, negative or fractional included.
fn coerce_number(value: Option<&Value>) -> Option<Number> {
    match value? {
        Value::Number(number) => Some(number.clone()),
        _ => None,
    }
}

/// Shallow merge of the defaults with the override, then field defaults.
/// `activeHours` comes whole from whichever side supplies the key.
fn normalize_heartbeat(
    defaults: Option<&JsonObject>,
    override_block: Option<&Value>,
) -> AgentHeartbeatResult {
    let mut merged = defaults.cloned().unwrap_or_default();
    let override_object = override_block.and_then(Value::as_object);
    if let Some(overrides) = override_object {
        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    let text = |key: &str, fallback: &str| {
        merged
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(fallback)
            .to_string()
    };
    AgentHeartbeatResult {
        heartbeat: AgentHeartbeat {
            every: text("every", DEFAULT_EVERY),
            target: text("target", DEFAULT_TARGET),
            include_reasoning: merged
                .get("includeReasoning")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ack_max_chars: Some(
                coerce_number(merged.get("ackMaxChars"))
                    .unwrap_or_else(|| Number::from(DEFAULT_ACK_MAX_CHARS)),
            ),
            active_hours: coerce_active_hours(merged.get("activeHours")),
        },
        has_override: override_object.is_some(),
    }
}

/// Resolve the effective heartbeat for `agent_id` against a config document.
pub fn resolve_heartbeat_settings(document: &JsonObject, agent_id: &str) -> AgentHeartbeatResult {
    let list = read_agent_list(document);
    let entry = list.iter().find(|entry| entry.id == agent_id);
    normalize_heartbeat(
        heartbeat_defaults(document),
        entry.and_then(|entry| entry.heartbeat.as_ref()),
    )
}

fn heartbeat_override_value(heartbeat: &AgentHeartbeat) -> Value {
    let mut block = JsonObject::new();
    block.insert("every".into(), Value::from(heartbeat.every.clone()));
    block.insert("target".into(), Value::from(heartbeat.target.clone()));
    block.insert("includeReasoning".into(), Value::from(heartbeat.include_reasoning));
    if let Some(ack) = &heartbeat.ack_max_chars {
        block.insert("ackMaxChars".into(), Value::Number(ack.clone()));
    }
    if let Some(hours) = &heartbeat.active_hours {
        let mut active = JsonObject::new();
        active.insert("start".into(), Value::from(hours.start.clone()));
        active.insert("end".into(), Value::from(hours.end.clone()));
        block.insert("activeHours".into(), Value::Object(active));
    }
    Value::Object(block)
}

// ---------------------------------------------------------------------------
// Directory operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAgentResult {
    pub removed: bool,
    pub removed_bindings: usize,
}

/// Per-agent `sandbox` / `tools` overrides, shallow-merged into the entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<JsonObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<JsonObject>,
}

impl AgentOverrides {
    pub fn is_empty(&self) -> bool {
        self.sandbox.is_none() && self.tools.is_none()
    }
}

pub async fn list_agents<C: GatewayRpc>(
    ctx: &StudioContext<C>,
) -> StudioResult<Vec<AgentDirectoryEntry>> {
    let snapshot: ConfigSnapshot = ctx.call(methods::CONFIG_GET, &JsonObject::new()).await?;
    Ok(read_agent_list(&snapshot.document))
}

pub async fn rename_agent<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
    name: &str,
) -> StudioResult<AgentDirectoryEntry> {
    let name = require_agent_name(name)?;
    let agent_id = require_agent_id(agent_id)?;
    mutate_config(ctx, |input| {
        let (list, entry) = upsert_agent_entry(input.agents, agent_id, |entry| {
            entry.name = Some(name.to_string());
        });
        Ok(Mutation::Patch {
            patch: agent_list_patch(&list),
            result: entry,
        })
    })
    .await
}

pub async fn create_agent<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    name: &str,
) -> StudioResult<AgentDirectoryEntry> {
    let name = require_agent_name(name)?;
    let entry = mutate_config(ctx, |input| {
        let id = allocate_agent_id(name, input.agents)?;
        let entry = AgentDirectoryEntry {
            name: Some(name.to_string()),
            ..AgentDirectoryEntry::new(id)
        };
        let mut list = input.agents.to_vec();
        list.push(entry.clone());
        Ok(Mutation::Patch {
            patch: agent_list_patch(&list),
            result: entry,
        })
    })
    .await?;
    tracing::info!(agent_id = %entry.id, "agent created");
    Ok(entry)
}

/// Remove the agent's entry and every binding routed to it.
pub async fn delete_agent<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
) -> StudioResult<DeleteAgentResult> {
    let agent_id = require_agent_id(agent_id)?;
    mutate_config(ctx, |input| {
        let list: Vec<_> = input
            .agents
            .iter()
            .filter(|entry| entry.id != agent_id)
            .cloned()
            .collect();
        let bindings = input
            .document
            .get("bindings")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let kept_bindings: Vec<Value> = bindings
            .iter()
            .filter(|binding| binding.get("agentId").and_then(Value::as_str) != Some(agent_id))
            .cloned()
            .collect();

        let mut patch = JsonObject::new();
        if list.len() != input.agents.len() {
            patch.extend(agent_list_patch(&list));
        }
        if kept_bindings.len() != bindings.len() {
            patch.insert("bindings".into(), Value::Array(kept_bindings.clone()));
        }
        let result = DeleteAgentResult {
            removed: list.len() != input.agents.len(),
            removed_bindings: bindings.len() - kept_bindings.len(),
        };
        if patch.is_empty() {
            return Ok(Mutation::Skip(result));
        }
        Ok(Mutation::Patch { patch, result })
    })
    .await
}

pub async fn update_heartbeat<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
    update: &HeartbeatUpdate,
) -> StudioResult<AgentHeartbeatResult> {
    let agent_id = require_agent_id(agent_id)?;
    mutate_config(ctx, |input| {
        let (list, _) = upsert_agent_entry(input.agents, agent_id, |entry| {
            entry.heartbeat = update
                .override_enabled
                .then(|| heartbeat_override_value(&update.heartbeat));
        });
        let next_document = write_agent_list(input.document, &list);
        Ok(Mutation::Patch {
            patch: agent_list_patch(&list),
            result: resolve_heartbeat_settings(&next_document, agent_id),
        })
    })
    .await
}

/// Drop the agent's heartbeat override. No write when there is none.
pub async fn remove_heartbeat_override<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
) -> StudioResult<AgentHeartbeatResult> {
    let agent_id = require_agent_id(agent_id)?;
    mutate_config(ctx, |input| {
        let has_override = input
            .agents
            .iter()
            .any(|entry| entry.id == agent_id && entry.heartbeat.is_some());
        if !has_override {
            return Ok(Mutation::Skip(resolve_heartbeat_settings(
                input.document,
                agent_id,
            )));
        }
        let list: Vec<_> = input
            .agents
            .iter()
            .cloned()
            .map(|mut entry| {
                if entry.id == agent_id {
                    entry.heartbeat = None;
                }
                entry
            })
            .collect();
        let next_document = write_agent_list(input.document, &list);
        Ok(Mutation::Patch {
            patch: agent_list_patch(&list),
            result: resolve_heartbeat_settings(&next_document, agent_id),
        })
    })
    .await
}

fn merge_object(existing: Option<&Value>, overlay: &JsonObject) -> Value {
    let mut merged = existing
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    Value::Object(merged)
}

/// Write sandbox/tools overrides for `agent_id` with a full-document
/// `config.set`.
pub async fn update_agent_overrides<C: GatewayRpc>(
    ctx: &StudioContext<C>,
    agent_id: &str,
    overrides: &AgentOverrides,
) -> StudioResult<AgentDirectoryEntry> {
    let agent_id = require_agent_id(agent_id)?;
    mutate_config(ctx, |input| {
        let current = input.agents.iter().find(|entry| entry.id == agent_id).cloned();
        let (list, entry) = upsert_agent_entry(input.agents, agent_id, |entry| {
            if let Some(sandbox) = &overrides.sandbox {
                entry.sandbox = Some(merge_object(entry.sandbox.as_ref(), sandbox));
            }
            if let Some(tools) = &overrides.tools {
                entry.tools = Some(merge_object(entry.tools.as_ref(), tools));
            }
        });
        if current.as_ref() == Some(&entry) {
            return Ok(Mutation::Skip(entry));
        }
        Ok(Mutation::Replace {
            document: write_agent_list(input.document, &list),
            result: entry,
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StudioError;
    use crate::testing::ScriptedGateway;
    use serde_json::json;

    fn raw_of(params: &Value) -> Value {
        serde_json::from_str(params["raw"].as_str().unwrap()).unwrap()
    }

    fn gateway_with(config: Value) -> ScriptedGateway {
        ScriptedGateway::new()
            .on(methods::CONFIG_GET, json!({"config": config, "hash": "h1", "exists": true}))
            .on(methods::CONFIG_PATCH, json!({"ok": true}))
            .on(methods::CONFIG_SET, json!({"ok": true}))
    }

    #[tokio::test]
    async fn blank_names_fail_before_any_call() {
        let ctx = StudioContext::new(ScriptedGateway::new());
        let err = create_agent(&ctx, "   ").await.unwrap_err();
        assert!(matches!(err, StudioError::Validation { ref message } if message == "Agent name is required."));
        let err = rename_agent(&ctx, "a", "").await.unwrap_err();
        assert!(matches!(err, StudioError::Validation { .. }));
        assert!(ctx.client.calls().is_empty());
    }

    #[tokio::test]
    async fn rename_upserts_name_and_keeps_other_fields() {
        let ctx = StudioContext::new(gateway_with(json!({
            "agents": {"list": [{"id": "alpha", "name": "Old", "workspace": "/w"}]}
        })));
        let entry = rename_agent(&ctx, "alpha", "  New Name ").await.unwrap();
        assert_eq!(entry.name.as_deref(), Some("New Name"));
        let patch = raw_of(&ctx.client.params_of(methods::CONFIG_PATCH)[0]);
        assert_eq!(
            patch,
            json!({"agents": {"list": [{"id": "alpha", "name": "New Name", "workspace": "/w"}]}})
        );
    }

    #[tokio::test]
    async fn create_allocates_unique_slug() {
        let ctx = StudioContext::new(gateway_with(json!({
            "agents": {"list": [{"id": "my-agent"}]}
        })));
        let entry = create_agent(&ctx, "My Agent").await.unwrap();
        assert_eq!(entry.id, "my-agent-2");
        let patch = raw_of(&ctx.client.params_of(methods::CONFIG_PATCH)[0]);
        assert_eq!(
            patch["agents"]["list"],
            json!([{"id": "my-agent"}, {"id": "my-agent-2", "name": "My Agent"}])
        );
    }

    #[tokio::test]
    async fn delete_removes_entry_and_bindings() {
        let ctx = StudioContext::new(gateway_with(json!({
            "agents": {"list": [{"id": "a"}, {"id": "b"}]},
            "bindings": [{"agentId": "a", "match": {}}, {"agentId": "b"}, {"agentId": "a"}, "junk"]
        })));
        let result = delete_agent(&ctx, "a").await.unwrap();
        assert_eq!(
            result,
            DeleteAgentResult {
                removed: true,
                removed_bindings: 2
            }
        );
        let patch = raw_of(&ctx.client.params_of(methods::CONFIG_PATCH)[0]);
        assert_eq!(patch["agents"]["list"], json!([{"id": "b"}]));
        assert_eq!(patch["bindings"], json!([{"agentId": "b"}, "junk"]));
    }

    #[tokio::test]
    async fn delete_of_unknown_agent_writes_nothing() {
        let ctx = StudioContext::new(gateway_with(json!({"agents": {"list": [{"id": "b"}]}})));
        let result = delete_agent(&ctx, "ghost").await.unwrap();
        assert!(!result.removed);
        assert_eq!(result.removed_bindings, 0);
        assert_eq!(ctx.client.count(methods::CONFIG_PATCH), 0);
    }

    #[test]
    fn heartbeat_resolution_merges_defaults() {
        let document = json!({
            "agents": {
                "defaults": {"heartbeat": {
                    "every": "1h",
                    "includeReasoning": true,
                    "activeHours": {"start": "08:00", "end": "18:00"}
                }},
                "list": [
                    {"id": "plain"},
                    {"id": "custom", "heartbeat": {"every": "5m", "activeHours": {"start": "09:00"}}}
                ]
            }
        });
        let document = document.as_object().unwrap();

        let plain = resolve_heartbeat_settings(document, "plain");
        assert!(!plain.has_override);
        assert_eq!(plain.heartbeat.every, "1h");
        assert_eq!(plain.heartbeat.target, "last");
        assert!(plain.heartbeat.include_reasoning);
        assert_eq!(plain.heartbeat.ack_max_chars, Some(300.into()));
        assert_eq!(
            plain.heartbeat.active_hours,
            Some(HeartbeatActiveHours {
                start: "08:00".into(),
                end: "18:00".into()
            })
        );

        let custom = resolve_heartbeat_settings(document, "custom");
        assert!(custom.has_override);
        assert_eq!(custom.heartbeat.every, "5m");
        assert!(custom.heartbeat.include_reasoning);
        // Override replaces activeHours wholesale and lacks `end`.
        assert_eq!(custom.heartbeat.active_hours, None);
    }

    #[test]
    fn ack_max_chars_keeps_any_number() {
        for raw in [json!(-5), json!(12.5), json!(0)] {
            let document = json!({"agents": {"defaults": {"heartbeat": {"ackMaxChars": raw.clone()}}}});
            let result = resolve_heartbeat_settings(document.as_object().unwrap(), "x");
            assert_eq!(result.heartbeat.ack_max_chars.map(Value::Number), Some(raw));
        }
        let document = json!({"agents": {"defaults": {"heartbeat": {"ackMaxChars": "10"}}}});
        let result = resolve_heartbeat_settings(document.as_object().unwrap(), "x");
        assert_eq!(result.heartbeat.ack_max_chars, Some(300.into()));
    }

    #[test]
    fn heartbeat_defaults_when_config_empty() {
        let result = resolve_heartbeat_settings(&JsonObject::new(), "x");
        assert_eq!(
            result.heartbeat,
            AgentHeartbeat {
                every: "30m".into(),
                target: "last".into(),
                include_reasoning: false,
                ack_max_chars: Some(300.into()),
                active_hours: None,
            }
        );
    }

    #[tokio::test]
    async fn update_heartbeat_writes_override_and_resolves() {
        let ctx = StudioContext::new(gateway_with(json!({"agents": {"list": [{"id": "a"}]}})));
        let update = HeartbeatUpdate {
            override_enabled: true,
            heartbeat: AgentHeartbeat {
                every: "15m".into(),
                target: "none".into(),
                include_reasoning: false,
                ack_max_chars: None,
                active_hours: Some(HeartbeatActiveHours {
                    start: "07:00".into(),
                    end: "23:00".into(),
                }),
            },
        };
        let result = update_heartbeat(&ctx, "a", &update).await.unwrap();
        assert!(result.has_override);
        assert_eq!(result.heartbeat.every, "15m");
        assert_eq!(result.heartbeat.ack_max_chars, Some(300.into()));

        let patch = raw_of(&ctx.client.params_of(methods::CONFIG_PATCH)[0]);
        assert_eq!(
            patch["agents"]["list"][0]["heartbeat"],
            json!({
                "every": "15m",
                "target": "none",
                "includeReasoning": false,
                "activeHours": {"start": "07:00", "end": "23:00"}
            })
        );
    }

    #[tokio::test]
    async fn update_heartbeat_without_override_clears_field() {
        let ctx = StudioContext::new(gateway_with(json!({
            "agents": {"list": [{"id": "a", "heartbeat": {"every": "1m"}}]}
        })));
        let update = HeartbeatUpdate {
            override_enabled: false,
            heartbeat: resolve_heartbeat_settings(&JsonObject::new(), "a").heartbeat,
        };
        let result = update_heartbeat(&ctx, "a", &update).await.unwrap();
        assert!(!result.has_override);
        let patch = raw_of(&ctx.client.params_of(methods::CONFIG_PATCH)[0]);
        assert_eq!(patch["agents"]["list"], json!([{"id": "a"}]));
    }

    #[tokio::test]
    async fn remove_override_skips_when_absent() {
        let ctx = StudioContext::new(gateway_with(json!({"agents": {"list": [{"id": "a"}]}})));
        let result = remove_heartbeat_override(&ctx, "a").await.unwrap();
        assert!(!result.has_override);
        assert_eq!(ctx.client.count(methods::CONFIG_PATCH), 0);
    }

    #[tokio::test]
    async fn overrides_merge_into_entry_via_config_set() {
        let ctx = StudioContext::new(gateway_with(json!({
            "agents": {"list": [{"id": "a", "tools": {"profile": "coding", "deny": ["x"]}}]},
            "gateway": {"port": 18789}
        })));
        let overrides = AgentOverrides {
            sandbox: Some(json!({"mode": "non-main"}).as_object().unwrap().clone()),
            tools: Some(json!({"deny": ["group:web"]}).as_object().unwrap().clone()),
        };
        let entry = update_agent_overrides(&ctx, "a", &overrides).await.unwrap();
        assert_eq!(entry.tools, Some(json!({"profile": "coding", "deny": ["group:web"]})));

        let document = raw_of(&ctx.client.params_of(methods::CONFIG_SET)[0]);
        assert_eq!(document["gateway"]["port"], 18789);
        assert_eq!(document["agents"]["list"][0]["sandbox"], json!({"mode": "non-main"}));
    }

    #[tokio::test]
    async fn unchanged_overrides_skip_write() {
        let ctx = StudioContext::new(gateway_with(json!({
            "agents": {"list": [{"id": "a", "sandbox": {"mode": "all"}}]}
        })));
        let overrides = AgentOverrides {
            sandbox: Some(json!({"mode": "all"}).as_object().unwrap().clone()),
            tools: None,
        };
        update_agent_overrides(&ctx, "a", &overrides).await.unwrap();
        assert_eq!(ctx.client.count(methods::CONFIG_SET), 0);
    }
}
