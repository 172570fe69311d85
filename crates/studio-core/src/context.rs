use crate::error::{StudioError, StudioResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use studio_gateway::{GatewayRpc, call_typed};

pub const DEFAULT_HISTORY_LIMIT: usize = 200;
pub const MAX_HISTORY_LIMIT: usize = 5000;
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 1;
pub const DEFAULT_PENDING_SETUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables shared by every operation of one client session.
#[derive(Debug, Clone)]
pub struct StudioOptions {
    pub history_default_limit: usize,
    pub history_max_limit: usize,
    /// Merge history into the local transcript instead of replacing it.
    pub transcript_v2: bool,
    /// `timeoutMs` passed to `agent.wait` during run reconciliation.
    pub wait_timeout_ms: u64,
    pub pending_setup_ttl: Duration,
}

impl Default for StudioOptions {
    fn default() -> Self {
        Self {
            history_default_limit: DEFAULT_HISTORY_LIMIT,
            history_max_limit: MAX_HISTORY_LIMIT,
            transcript_v2: true,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            pending_setup_ttl: DEFAULT_PENDING_SETUP_TTL,
        }
    }
}

impl StudioOptions {
    /// Clamp a requested history limit into `1..=history_max_limit`.
    pub fn history_limit(&self, requested: Option<usize>) -> usize {
        let max = self.history_max_limit.max(1);
        requested
            .unwrap_or(self.history_default_limit)
            .clamp(1, max)
    }
}

/// Everything an operation needs: the gateway handle, the caller's session
/// key (forwarded on config writes), and the tunables.
pub struct StudioContext<C> {
    pub client: C,
    pub session_key: Option<String>,
    pub options: StudioOptions,
}

impl<C: GatewayRpc> StudioContext<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            session_key: None,
            options: StudioOptions::default(),
        }
    }

    pub fn with_session_key(mut self, session_key: impl Into<String>) -> Self {
        let key = session_key.into();
        self.session_key = Some(key).filter(|k| !k.trim().is_empty());
        self
    }

    pub fn with_options(mut self, options: StudioOptions) -> Self {
        self.options = options;
        self
    }

    pub(crate) async fn call<P, T>(&self, method: &str, params: &P) -> StudioResult<T>
    where
        P: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        call_typed(&self.client, method, params)
            .await
            .map_err(StudioError::from)
    }

    /// Call a method whose payload is irrelevant.
    pub(crate) async fn call_unit<P>(&self, method: &str, params: &P) -> StudioResult<()>
    where
        P: Serialize + ?Sized + Sync,
    {
        let params = serde_json::to_value(params)
            .map_err(|err| StudioError::payload(format!("failed to encode {method} params: {err}")))?;
        self.client.call(method, params).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_limit_clamps() {
        let options = StudioOptions::default();
        assert_eq!(options.history_limit(None), 200);
        assert_eq!(options.history_limit(Some(0)), 1);
        assert_eq!(options.history_limit(Some(9_000)), 5000);
        assert_eq!(options.history_limit(Some(42)), 42);
    }
}
