use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Maximum size of a JSON-lines frame on the gateway stream (4 MiB).
///
/// History responses carry whole transcripts, so this is much larger than a
/// typical control frame.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Protocol revision announced in the `connect` handshake.
pub const PROTOCOL_VERSION: u32 = 3;

/// A JSON object, as used for config documents and patches.
pub type JsonObject = serde_json::Map<String, Value>;

/// Gateway method names consumed by this client.
pub mod methods {
    pub const CONNECT: &str = "connect";
    pub const STATUS: &str = "status";
    pub const WAKE: &str = "wake";
    pub const CONFIG_GET: &str = "config.get";
    pub const CONFIG_PATCH: &str = "config.patch";
    pub const CONFIG_SET: &str = "config.set";
    pub const AGENTS_CREATE: &str = "agents.create";
    pub const AGENTS_FILES_SET: &str = "agents.files.set";
    pub const EXEC_APPROVALS_GET: &str = "exec.approvals.get";
    pub const EXEC_APPROVALS_SET: &str = "exec.approvals.set";
    pub const SESSIONS_LIST: &str = "sessions.list";
    pub const SESSIONS_HISTORY: &str = "sessions.history";
    pub const SESSIONS_PATCH: &str = "sessions.patch";
    pub const SESSIONS_DELETE: &str = "sessions.delete";
    pub const AGENT_WAIT: &str = "agent.wait";
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One line on the gateway stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client-to-gateway call.
    Req {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    /// Gateway reply correlated by `id`.
    Res {
        id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },
    /// Unsolicited gateway event (chat deltas, presence, agent lifecycle).
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl Frame {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Frame::Res {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Frame::Res {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

/// An event as delivered to subscribers of [`crate::client::GatewayClient`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub event: String,
    pub payload: Option<Value>,
    pub seq: Option<u64>,
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub client: ClientInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Payload of a successful `connect` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelloPayload {
    #[serde(default)]
    pub protocol: u32,
    #[serde(default)]
    pub features: Vec<String>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Result of `config.get`.
///
/// The concurrency token is a content hash of the document as the gateway
/// last stored it. A snapshot is only meaningful for the write that follows
/// it and must never be cached across operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(rename = "config", default, deserialize_with = "object_or_empty")]
    pub document: JsonObject,
    #[serde(rename = "hash", default, skip_serializing_if = "Option::is_none")]
    pub concurrency_token: Option<String>,
    #[serde(default = "default_true")]
    pub exists: bool,
}

impl ConfigSnapshot {
    /// The trimmed concurrency token, if the gateway supplied a usable one.
    pub fn base_hash(&self) -> Option<&str> {
        self.concurrency_token
            .as_deref()
            .map(str::trim)
            .filter(|hash| !hash.is_empty())
    }
}

/// Parameters of `config.patch` and `config.set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigWriteParams {
    pub raw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsCreateResult {
    #[serde(alias = "id")]
    pub agent_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Per-agent exec approval file as returned by `exec.approvals.get`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecApprovalsFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub agents: JsonObject,
    #[serde(flatten)]
    pub extra: JsonObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecApprovalsSnapshot {
    #[serde(default = "default_true")]
    pub exists: bool,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub file: ExecApprovalsFile,
}

// ---------------------------------------------------------------------------
// Sessions and runs
// ---------------------------------------------------------------------------

/// One row of `sessions.list`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListEntry {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub updated_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionsListResult {
    #[serde(default)]
    pub sessions: Vec<SessionListEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsHistoryResult {
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

/// Result of `agent.wait`. `status` is `ok`, `error` or `timeout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentWaitResult {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentWaitResult {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "ok" | "error")
    }
}

// ---------------------------------------------------------------------------
// Status / heartbeat
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayStatusSnapshot {
    #[serde(default)]
    pub heartbeat: Option<HeartbeatStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatStatus {
    #[serde(default)]
    pub agents: Vec<HeartbeatStatusAgent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatStatusAgent {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub every: Option<String>,
    #[serde(default)]
    pub every_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeResult {
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// serde helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

fn object_or_empty<'de, D>(deserializer: D) -> Result<JsonObject, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    })
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)),
        _ => None,
    })
}
