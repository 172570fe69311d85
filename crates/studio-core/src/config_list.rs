use serde::{Deserialize, Serialize};
use serde_json::Value;
use studio_gateway::protocol::JsonObject;

/// One entry of `agents.list` in the gateway config document.
///
/// Fields this crate doesn't interpret are kept in `extra` so a rewrite of
/// the list never drops them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDirectoryEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<Value>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

impl AgentDirectoryEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn sandbox_object(&self) -> Option<&JsonObject> {
        self.sandbox.as_ref().and_then(Value::as_object)
    }

    pub fn tools_object(&self) -> Option<&JsonObject> {
        self.tools.as_ref().and_then(Value::as_object)
    }

    pub fn heartbeat_object(&self) -> Option<&JsonObject> {
        self.heartbeat.as_ref().and_then(Value::as_object)
    }
}

/// Read `agents.list`, skipping entries without a usable string id.
pub fn read_agent_list(document: &JsonObject) -> Vec<AgentDirectoryEntry> {
    let Some(list) = document
        .get("agents")
        .and_then(|agents| agents.get("list"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    list.iter()
        .filter(|item| {
            item.get("id")
                .and_then(Value::as_str)
                .is_some_and(|id| !id.trim().is_empty())
        })
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed agents.list entry");
                None
            }
        })
        .collect()
}

pub fn agent_list_value(list: &[AgentDirectoryEntry]) -> Value {
    Value::Array(
        list.iter()
            .filter_map(|entry| serde_json::to_value(entry).ok())
            .collect(),
    )
}

/// Copy of `document` with `agents.list` replaced by `list`.
pub fn write_agent_list(document: &JsonObject, list: &[AgentDirectoryEntry]) -> JsonObject {
    let mut next = document.clone();
    let mut agents = match next.remove("agents") {
        Some(Value::Object(agents)) => agents,
        _ => JsonObject::new(),
    };
    agents.insert("list".to_string(), agent_list_value(list));
    next.insert("agents".to_string(), Value::Object(agents));
    next
}

/// Merge patch that replaces the whole `agents.list` array.
pub fn agent_list_patch(list: &[AgentDirectoryEntry]) -> JsonObject {
    let mut agents = JsonObject::new();
    agents.insert("list".to_string(), agent_list_value(list));
    let mut patch = JsonObject::new();
    patch.insert("agents".to_string(), Value::Object(agents));
    patch
}

/// Apply `update` to the entry for `agent_id`, appending a fresh entry when
/// none exists. Returns the new list and the updated entry.
pub fn upsert_agent_entry(
    list: &[AgentDirectoryEntry],
    agent_id: &str,
    update: impl FnOnce(&mut AgentDirectoryEntry),
) -> (Vec<AgentDirectoryEntry>, AgentDirectoryEntry) {
    let mut next = list.to_vec();
    let index = match next.iter().position(|entry| entry.id == agent_id) {
        Some(index) => index,
        None => {
            next.push(AgentDirectoryEntry::new(agent_id));
            next.len() - 1
        }
    };
    update(&mut next[index]);
    let entry = next[index].clone();
    (next, entry)
}
