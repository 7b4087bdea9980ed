use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("RATE_LIMITED: {0}")]
    RateLimited(String),
    #[error("AGENT_FAILURE: {0}")]
    Agent(String),
    #[error("EFFECTOR_FAILURE: {0}")]
    Effector(String),
    #[error("ORCHESTRATION_FAILURE: {0}")]
    Orchestration(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl EngineError {
    /// Configuration errors are logged and dropped; nothing retries them.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::NotFound(_) | Self::Conflict(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
