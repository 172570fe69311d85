use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use studio_gateway::protocol::{Frame, MAX_FRAME_BYTES, methods};
use tempfile::TempDir;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

const CONFLICT_MESSAGE: &str = "config changed since last load; re-run config.get and retry";

/// Everything the fake gateway remembers.
#[derive(Debug)]
pub struct GatewayState {
    pub config: Map<String, Value>,
    pub config_exists: bool,
    pub approvals: Value,
    pub approvals_exists: bool,
    /// `sessions.list` rows.
    pub sessions: Vec<Value>,
    /// Messages per session key, oldest first.
    pub histories: HashMap<String, Vec<Value>>,
    /// `agent.wait` replies per run id; unknown runs time out.
    pub runs: HashMap<String, Value>,
    pub heartbeat_status: Value,
    /// `(agentId, name)` to content.
    pub files: BTreeMap<(String, String), String>,
    /// Last `sessions.patch` params per session key.
    pub session_patches: HashMap<String, Value>,
    pub calls: Vec<(String, Value)>,
    /// Required token, if any.
    pub token: Option<String>,
    /// Config writes to reject as stale, each after a concurrent edit.
    pub injected_conflicts: usize,
    /// Methods answered with an error, keyed by method name.
    pub failing: HashMap<String, String>,
    next_agent: usize,
}

impl Default for GatewayState {
    fn default() -> Self {
        Self {
            config: Map::new(),
            config_exists: true,
            approvals: json!({"version": 1, "agents": {}}),
            approvals_exists: true,
            sessions: Vec::new(),
            histories: HashMap::new(),
            runs: HashMap::new(),
            heartbeat_status: json!({"heartbeat": {"agents": []}}),
            files: BTreeMap::new(),
            session_patches: HashMap::new(),
            calls: Vec::new(),
            token: None,
            injected_conflicts: 0,
            failing: HashMap::new(),
            next_agent: 0,
        }
    }
}

fn content_hash(value: &Value) -> String {
    hex::encode(Sha256::digest(value.to_string().as_bytes()))
}

/// RFC 7396 merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

impl GatewayState {
    pub fn config_hash(&self) -> String {
        content_hash(&Value::Object(self.config.clone()))
    }

    pub fn approvals_hash(&self) -> String {
        content_hash(&self.approvals)
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls.iter().map(|(m, _)| m.clone()).collect()
    }

    fn handle(&mut self, method: &str, params: &Value) -> std::result::Result<Value, (String, String)> {
        self.calls.push((method.to_string(), params.clone()));
        if let Some(message) = self.failing.get(method) {
            return Err(("UNAVAILABLE".to_string(), message.clone()));
        }
        match method {
            methods::CONNECT => {
                let presented = params.get("token").and_then(Value::as_str);
                match &self.token {
                    Some(token) if presented != Some(token.as_str()) => {
                        Err(invalid("unauthorized: gateway token mismatch"))
                    }
                    _ => Ok(json!({"protocol": params["protocol"], "features": ["config.patch"]})),
                }
            }
            methods::CONFIG_GET => Ok(json!({
                "config": self.config,
                "hash": self.config_hash(),
                "exists": self.config_exists,
            })),
            methods::CONFIG_PATCH | methods::CONFIG_SET => self.write_config(method, params),
            methods::AGENTS_CREATE => {
                let name = params["name"].as_str().unwrap_or_default().trim().to_string();
                if name.is_empty() {
                    return Err(invalid("name is required"));
                }
                self.next_agent += 1;
                let agent_id = format!("agent-{}", self.next_agent);
                let mut list = self
                    .config
                    .get("agents")
                    .and_then(|agents| agents.get("list"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                list.push(json!({"id": agent_id, "name": name}));
                let mut document = Value::Object(self.config.clone());
                merge_patch(&mut document, &json!({"agents": {"list": list}}));
                if let Value::Object(document) = document {
                    self.config = document;
                }
                Ok(json!({"agentId": agent_id, "name": name}))
            }
            methods::AGENTS_FILES_SET => {
                let agent_id = params["agentId"].as_str().unwrap_or_default().to_string();
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let content = params["content"].as_str().unwrap_or_default().to_string();
                self.files.insert((agent_id, name), content);
                Ok(json!({"ok": true}))
            }
            methods::EXEC_APPROVALS_GET => Ok(json!({
                "exists": self.approvals_exists,
                "hash": self.approvals_hash(),
                "file": self.approvals,
            })),
            methods::EXEC_APPROVALS_SET => {
                if self.approvals_exists && params["baseHash"].as_str() != Some(self.approvals_hash().as_str()) {
                    return Err(invalid("exec approvals changed; re-run exec.approvals.get"));
                }
                self.approvals = params["file"].clone();
                self.approvals_exists = true;
                Ok(json!({"ok": true}))
            }
            methods::SESSIONS_LIST => Ok(json!({"sessions": self.sessions})),
            methods::SESSIONS_HISTORY => {
                let key = params["sessionKey"].as_str().unwrap_or_default();
                let limit = params["limit"].as_u64().unwrap_or(200) as usize;
                let messages = self.histories.get(key).cloned().unwrap_or_default();
                let start = messages.len().saturating_sub(limit);
                Ok(json!({"sessionKey": key, "messages": &messages[start..]}))
            }
            methods::SESSIONS_DELETE => {
                let key = params["key"].as_str().unwrap_or_default();
                self.sessions.retain(|row| row["key"].as_str() != Some(key));
                Ok(json!({"ok": true}))
            }
            methods::SESSIONS_PATCH => {
                let key = params["key"].as_str().unwrap_or_default().to_string();
                self.session_patches.insert(key, params.clone());
                Ok(json!({"ok": true}))
            }
            methods::AGENT_WAIT => {
                let run_id = params["runId"].as_str().unwrap_or_default();
                Ok(self
                    .runs
                    .get(run_id)
                    .cloned()
                    .unwrap_or_else(|| json!({"status": "timeout"})))
            }
            methods::STATUS => Ok(self.heartbeat_status.clone()),
            methods::WAKE => Ok(json!({"ok": true})),
            other => Err(invalid(&format!("unknown method: {other}"))),
        }
    }

    fn write_config(&mut self, method: &str, params: &Value) -> std::result::Result<Value, (String, String)> {
        if self.injected_conflicts > 0 {
            self.injected_conflicts -= 1;
            // Someone else wrote in between.
            let edits = self.config.get("concurrentEdits").and_then(Value::as_u64).unwrap_or(0);
            self.config.insert("concurrentEdits".to_string(), json!(edits + 1));
            return Err(invalid(CONFLICT_MESSAGE));
        }
        if self.config_exists && params["baseHash"].as_str() != Some(self.config_hash().as_str()) {
            return Err(invalid(CONFLICT_MESSAGE));
        }
        let raw = params["raw"].as_str().unwrap_or_default();
        let body: Value = serde_json::from_str(raw).map_err(|err| invalid(&format!("invalid raw: {err}")))?;
        let mut document = Value::Object(std::mem::take(&mut self.config));
        if method == methods::CONFIG_SET {
            document = body;
        } else {
            merge_patch(&mut document, &body);
        }
        let Value::Object(document) = document else {
            return Err(invalid("config must be an object"));
        };
        self.config = document;
        self.config_exists = true;
        Ok(json!({"ok": true}))
    }
}

fn invalid(message: &str) -> (String, String) {
    ("INVALID_REQUEST".to_string(), message.to_string())
}

/// A fake gateway listening on a Unix socket in a temp directory.
pub struct TestGateway {
    pub socket_path: PathBuf,
    state: Arc<Mutex<GatewayState>>,
    events: broadcast::Sender<Frame>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _dir: TempDir,
}

impl TestGateway {
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(GatewayState::default()).await
    }

    pub async fn spawn_with(state: GatewayState) -> Result<Self> {
        let dir = TempDir::new()?;
        let socket_path = dir.path().join("gateway.sock");
        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        let state = Arc::new(Mutex::new(state));
        let (events, _) = broadcast::channel(64);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let accept_state = state.clone();
        let accept_events = events.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            tokio::spawn(serve_connection(
                                stream,
                                accept_state.clone(),
                                accept_events.subscribe(),
                            ));
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "test gateway accept failed");
                            break;
                        }
                    },
                }
            }
        });

        Ok(Self {
            socket_path,
            state,
            events,
            shutdown_tx: Some(shutdown_tx),
            _dir: dir,
        })
    }

    /// `unix:` URL for this gateway.
    pub fn url(&self) -> String {
        format!("unix:{}", self.socket_path.display())
    }

    pub fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Push an event frame to every connected client.
    pub fn emit(&self, event: &str, payload: Value) {
        let _ = self.events.send(Frame::Event {
            event: event.to_string(),
            payload: Some(payload),
            seq: None,
        });
    }

    /// Drop every live connection.
    pub fn kick_all(&self) {
        let _ = self.events.send(Frame::Event {
            event: KICK_EVENT.to_string(),
            payload: None,
            seq: None,
        });
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

const KICK_EVENT: &str = "__test.kick";

async fn serve_connection(
    stream: UnixStream,
    state: Arc<Mutex<GatewayState>>,
    mut events: broadcast::Receiver<Frame>,
) {
    let (reader, writer) = stream.into_split();
    let mut reader = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let mut writer = FramedWrite::new(writer, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

    loop {
        let outgoing = tokio::select! {
            line = reader.next() => {
                let Some(Ok(line)) = line else { break };
                let Ok(Frame::Req { id, method, params }) = serde_json::from_str::<Frame>(&line) else {
                    continue;
                };
                let reply = state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .handle(&method, &params);
                match reply {
                    Ok(payload) => Frame::ok(id, payload),
                    Err((code, message)) => Frame::error(id, &code, message),
                }
            }
            event = events.recv() => match event {
                Ok(Frame::Event { event, .. }) if event == KICK_EVENT => break,
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        let Ok(line) = serde_json::to_string(&outgoing) else {
            continue;
        };
        if writer.send(line).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_patch_follows_rfc7396() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "d": [1, 2]});
        merge_patch(&mut target, &json!({"a": {"b": null, "e": 3}, "d": [3]}));
        assert_eq!(target, json!({"a": {"c": 2, "e": 3}, "d": [3]}));
    }

    #[test]
    fn stale_base_hash_is_rejected() {
        let mut state = GatewayState::default();
        let err = state
            .handle(methods::CONFIG_PATCH, &json!({"raw": "{}", "baseHash": "nope"}))
            .unwrap_err();
        assert!(err.1.contains("re-run config.get"));

        let hash = state.config_hash();
        state
            .handle(methods::CONFIG_PATCH, &json!({"raw": "{\"x\": 1}", "baseHash": hash}))
            .unwrap();
        assert_eq!(state.config["x"], 1);
    }
}
