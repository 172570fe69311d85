use thiserror::Error;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("gateway not connected")]
    NotConnected,
    #[error("connection error: {message}")]
    Connection { message: String },
    #[error("gateway disconnected: {message}")]
    Disconnected { message: String },
    #[error("protocol error: {message}")]
    Protocol { message: String },
    #[error("{message}")]
    Response { code: String, message: String },
    #[error("timeout waiting for {method} after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
}

impl GatewayError {
    /// True when the call failed because the channel went away rather than
    /// because the gateway rejected it.
    pub fn is_disconnect_like(&self) -> bool {
        match self {
            Self::NotConnected | Self::Connection { .. } | Self::Disconnected { .. } => true,
            Self::Response { message, .. } => message_is_disconnect_like(message),
            Self::Protocol { .. } | Self::Timeout { .. } => false,
        }
    }

    /// True for the gateway's optimistic-concurrency rejection of a config
    /// write. Only gateway responses qualify; transport failures never do.
    pub fn is_config_conflict(&self) -> bool {
        match self {
            Self::Response { message, .. } => {
                let lower = message.to_ascii_lowercase();
                lower.contains("re-run config.get") || lower.contains("config changed since last load")
            }
            _ => false,
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Response { code, .. } => Some(code),
            _ => None,
        }
    }
}

fn message_is_disconnect_like(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["gateway not connected", "gateway disconnected", "socket closed", "connection closed"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(message: &str) -> GatewayError {
        GatewayError::Response {
            code: "INVALID_REQUEST".to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn conflict_detection_is_case_insensitive() {
        assert!(response("Config changed since last load; re-run config.get").is_config_conflict());
        assert!(response("base hash mismatch, RE-RUN CONFIG.GET").is_config_conflict());
        assert!(!response("invalid agent id").is_config_conflict());
    }

    #[test]
    fn transport_errors_are_never_conflicts() {
        let err = GatewayError::Connection {
            message: "config changed since last load".to_string(),
        };
        assert!(!err.is_config_conflict());
        assert!(err.is_disconnect_like());
    }

    #[test]
    fn disconnect_like_classification() {
        assert!(GatewayError::NotConnected.is_disconnect_like());
        assert!(
            GatewayError::Disconnected {
                message: "eof".to_string()
            }
            .is_disconnect_like()
        );
        assert!(response("Gateway not connected").is_disconnect_like());
        assert!(!response("unknown method").is_disconnect_like());
        assert!(
            !GatewayError::Timeout {
                method: "agent.wait".to_string(),
                timeout_ms: 10
            }
            .is_disconnect_like()
        );
    }
}
