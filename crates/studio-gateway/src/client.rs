use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{
    ClientInfo, ConnectParams, Frame, GatewayEvent, HelloPayload, MAX_FRAME_BYTES,
    PROTOCOL_VERSION, methods,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// Gateway endpoint used when nothing else is configured.
pub const DEFAULT_GATEWAY_URL: &str = "tcp://127.0.0.1:18789";

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CHANNEL_CAPACITY: usize = 256;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type PendingReply = oneshot::Sender<GatewayResult<Value>>;

// ---------------------------------------------------------------------------
// Abstract RPC seam
// ---------------------------------------------------------------------------

/// Request/response access to the gateway.
///
/// Everything in `studio-core` is written against this trait so it can run
/// over [`GatewayClient`] or an in-memory double.
pub trait GatewayRpc: Send + Sync {
    fn call(&self, method: &str, params: Value) -> impl Future<Output = GatewayResult<Value>> + Send;
}

impl<T: GatewayRpc> GatewayRpc for Arc<T> {
    fn call(&self, method: &str, params: Value) -> impl Future<Output = GatewayResult<Value>> + Send {
        (**self).call(method, params)
    }
}

impl<T: GatewayRpc> GatewayRpc for &T {
    fn call(&self, method: &str, params: Value) -> impl Future<Output = GatewayResult<Value>> + Send {
        (**self).call(method, params)
    }
}

/// Call `method` and decode the payload into `T`.
pub async fn call_typed<C, P, T>(client: &C, method: &str, params: &P) -> GatewayResult<T>
where
    C: GatewayRpc,
    P: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let params = serde_json::to_value(params).map_err(|err| GatewayError::Protocol {
        message: format!("failed to encode {method} params: {err}"),
    })?;
    let payload = client.call(method, params).await?;
    serde_json::from_value(payload).map_err(|err| GatewayError::Protocol {
        message: format!("invalid {method} payload: {err}"),
    })
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEndpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for GatewayEndpoint {
    type Err = GatewayError;

    fn from_str(raw: &str) -> GatewayResult<Self> {
        let url = raw.trim();
        let invalid = || GatewayError::Connection {
            message: format!("invalid gateway url: {raw:?}"),
        };
        if url.is_empty() {
            return Err(invalid());
        }
        if let Some(path) = url.strip_prefix("unix://").or_else(|| url.strip_prefix("unix:")) {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if url.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(url)));
        }

        let (rest, default_port) = if let Some(rest) = url.strip_prefix("tcp://") {
            (rest, None)
        } else if let Some(rest) = url.strip_prefix("ws://") {
            (rest, Some(80))
        } else if let Some(rest) = url.strip_prefix("wss://") {
            (rest, Some(443))
        } else {
            (url, None)
        };
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if authority.is_empty() {
            return Err(invalid());
        }
        let has_port = authority
            .rsplit_once(':')
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
        match (has_port, default_port) {
            (true, _) => Ok(Self::Tcp(authority.to_string())),
            (false, Some(port)) => Ok(Self::Tcp(format!("{authority}:{port}"))),
            (false, None) => Err(invalid()),
        }
    }
}

impl fmt::Display for GatewayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub endpoint: GatewayEndpoint,
    pub token: Option<String>,
    pub client: ClientInfo,
    pub call_timeout: Duration,
}

impl ConnectOptions {
    pub fn new(endpoint: GatewayEndpoint) -> Self {
        Self {
            endpoint,
            token: None,
            client: ClientInfo {
                name: "studio".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

struct Inner {
    writer: Mutex<Option<FramedWrite<BoxedWriter, LinesCodec>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    pending: DashMap<String, PendingReply>,
    events: broadcast::Sender<GatewayEvent>,
    status: watch::Sender<GatewayStatus>,
    call_timeout_ms: AtomicU64,
}

/// Persistent connection to the gateway with request correlation and event
/// fan-out. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl Default for GatewayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayClient {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(GatewayStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(None),
                reader_task: Mutex::new(None),
                pending: DashMap::new(),
                events,
                status,
                call_timeout_ms: AtomicU64::new(DEFAULT_CALL_TIMEOUT.as_millis() as u64),
            }),
        }
    }

    /// Open the configured endpoint and perform the `connect` handshake.
    pub async fn connect(&self, options: ConnectOptions) -> GatewayResult<HelloPayload> {
        self.inner.status.send_replace(GatewayStatus::Connecting);
        let opened: GatewayResult<(BoxedReader, BoxedWriter)> = match &options.endpoint {
            GatewayEndpoint::Unix(path) => UnixStream::connect(path)
                .await
                .map(|stream| {
                    let (r, w) = stream.into_split();
                    (Box::new(r) as BoxedReader, Box::new(w) as BoxedWriter)
                })
                .map_err(|err| GatewayError::Connection {
                    message: format!("failed to connect to {}: {err}", path.display()),
                }),
            GatewayEndpoint::Tcp(addr) => TcpStream::connect(addr.as_str())
                .await
                .map(|stream| {
                    let (r, w) = stream.into_split();
                    (Box::new(r) as BoxedReader, Box::new(w) as BoxedWriter)
                })
                .map_err(|err| GatewayError::Connection {
                    message: format!("failed to connect to {addr}: {err}"),
                }),
        };
        match opened {
            Ok((reader, writer)) => self.connect_with_stream(reader, writer, options).await,
            Err(err) => {
                self.inner.status.send_replace(GatewayStatus::Disconnected);
                Err(err)
            }
        }
    }

    /// Run the handshake over an already-open byte stream.
    pub async fn connect_with_stream<R, W>(
        &self,
        reader: R,
        writer: W,
        options: ConnectOptions,
    ) -> GatewayResult<HelloPayload>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.teardown("reconnecting").await;
        self.inner.status.send_replace(GatewayStatus::Connecting);
        self.inner
            .call_timeout_ms
            .store(options.call_timeout.as_millis() as u64, Ordering::Relaxed);

        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        *self.inner.writer.lock().await = Some(FramedWrite::new(
            writer,
            LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
        ));
        let framed = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
        let task = tokio::spawn(read_loop(self.inner.clone(), framed));
        *self.inner.reader_task.lock().await = Some(task);

        let params = ConnectParams {
            protocol: PROTOCOL_VERSION,
            token: options.token.clone(),
            client: options.client.clone(),
        };
        let params = serde_json::to_value(&params).map_err(|err| GatewayError::Protocol {
            message: format!("failed to encode connect params: {err}"),
        })?;
        let hello = match self.send_request(methods::CONNECT, params).await {
            Ok(payload) => serde_json::from_value::<HelloPayload>(payload).unwrap_or_default(),
            Err(err) => {
                self.teardown("handshake failed").await;
                return Err(err);
            }
        };

        self.inner.status.send_replace(GatewayStatus::Connected);
        tracing::info!(endpoint = %options.endpoint, protocol = hello.protocol, "gateway connected");
        Ok(hello)
    }

    /// Close the connection and fail every outstanding call.
    pub async fn disconnect(&self) {
        self.teardown("client disconnected").await;
    }

    pub fn status(&self) -> GatewayStatus {
        *self.inner.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == GatewayStatus::Connected
    }

    /// Receive every gateway event from now on. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<GatewayStatus> {
        self.inner.status.subscribe()
    }

    /// Send a request and wait for its correlated response.
    pub async fn request(&self, method: &str, params: Value) -> GatewayResult<Value> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        self.send_request(method, params).await
    }

    async fn send_request(&self, method: &str, params: Value) -> GatewayResult<Value> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id.clone(), tx);

        let frame = Frame::Req {
            id: id.clone(),
            method: method.to_string(),
            params,
        };
        if let Err(err) = self.write_frame(&frame).await {
            self.inner.pending.remove(&id);
            return Err(err);
        }

        let timeout_ms = self.inner.call_timeout_ms.load(Ordering::Relaxed);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Disconnected {
                message: format!("connection closed before {method} completed"),
            }),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(GatewayError::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    async fn write_frame(&self, frame: &Frame) -> GatewayResult<()> {
        let line = serde_json::to_string(frame).map_err(|err| GatewayError::Protocol {
            message: format!("failed to encode frame: {err}"),
        })?;
        let mut guard = self.inner.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(GatewayError::NotConnected);
        };
        writer.send(line).await.map_err(|err| GatewayError::Connection {
            message: format!("socket write failed: {err}"),
        })
    }

    async fn teardown(&self, reason: &str) {
        if let Some(task) = self.inner.reader_task.lock().await.take() {
            task.abort();
        }
        self.inner.writer.lock().await.take();
        self.inner.fail_pending(reason);
        self.inner.status.send_replace(GatewayStatus::Disconnected);
    }
}

impl GatewayRpc for GatewayClient {
    fn call(&self, method: &str, params: Value) -> impl Future<Output = GatewayResult<Value>> + Send {
        self.request(method, params)
    }
}

impl Inner {
    fn fail_pending(&self, reason: &str) {
        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(GatewayError::Disconnected {
                    message: reason.to_string(),
                }));
            }
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Res {
                id,
                ok,
                payload,
                error,
            } => {
                let Some((_, tx)) = self.pending.remove(&id) else {
                    tracing::debug!(request_id = %id, "response for unknown request");
                    return;
                };
                let result = if ok {
                    Ok(payload.unwrap_or(Value::Null))
                } else {
                    let shape = error.unwrap_or_else(|| crate::protocol::ErrorShape {
                        code: "UNKNOWN".to_string(),
                        message: "gateway request failed".to_string(),
                    });
                    Err(GatewayError::Response {
                        code: shape.code,
                        message: shape.message,
                    })
                };
                let _ = tx.send(result);
            }
            Frame::Event {
                event,
                payload,
                seq,
            } => {
                // No subscribers is fine.
                let _ = self.events.send(GatewayEvent {
                    event,
                    payload,
                    seq,
                });
            }
            Frame::Req { method, .. } => {
                tracing::debug!(%method, "ignoring gateway-initiated request");
            }
        }
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: FramedRead<BoxedReader, LinesCodec>) {
    let reason = loop {
        match reader.next().await {
            Some(Ok(line)) => match serde_json::from_str::<Frame>(&line) {
                Ok(frame) => inner.dispatch(frame),
                Err(err) => tracing::warn!(error = %err, "invalid frame from gateway"),
            },
            Some(Err(err)) => break format!("socket read failed: {err}"),
            None => break "gateway closed the connection".to_string(),
        }
    };
    tracing::info!(%reason, "gateway disconnected");
    inner.writer.lock().await.take();
    inner.fail_pending(&reason);
    inner.status.send_replace(GatewayStatus::Disconnected);
}
