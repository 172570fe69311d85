use studio_gateway::GatewayError;
use thiserror::Error;

pub type StudioResult<T> = std::result::Result<T, StudioError>;

#[derive(Debug, Clone, Error)]
pub enum StudioError {
    /// Bad caller input. Always raised before any gateway call.
    #[error("{message}")]
    Validation { message: String },
    #[error("Gateway config hash unavailable; re-run config.get.")]
    MissingBaseHash,
    #[error("Unable to allocate a unique agent ID for {base:?}.")]
    IdAllocation { base: String },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("unexpected payload: {message}")]
    Payload { message: String },
    #[error("store error: {message}")]
    Store { message: String },
}

impl StudioError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload {
            message: message.into(),
        }
    }

    pub fn is_disconnect_like(&self) -> bool {
        matches!(self, Self::Gateway(err) if err.is_disconnect_like())
    }

    pub fn is_config_conflict(&self) -> bool {
        matches!(self, Self::Gateway(err) if err.is_config_conflict())
    }
}

/// Trim `agent_id` and reject it when blank.
pub(crate) fn require_agent_id(agent_id: &str) -> StudioResult<&str> {
    let trimmed = agent_id.trim();
    if trimmed.is_empty() {
        return Err(StudioError::validation("Agent id is required."));
    }
    Ok(trimmed)
}

/// Trim `name` and reject it when blank.
pub(crate) fn require_agent_name(name: &str) -> StudioResult<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(StudioError::validation("Agent name is required."));
    }
    Ok(trimmed)
}
