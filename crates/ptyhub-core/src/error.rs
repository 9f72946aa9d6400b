use thiserror::Error;

/// Errors produced across the ptyhub protocol, hub and proxy layers.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("failed to spawn shell: {0}")]
    SpawnFailure(String),

    #[error("limit reached: {0}")]
    LimitReached(String),

    #[error("proxy target unreachable: {0}")]
    ProxyTargetUnreachable(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for HubError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        HubError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for HubError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        HubError::Codec(e.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Codec(e.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;
