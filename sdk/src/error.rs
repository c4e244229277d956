use thiserror::Error;

/// Everything an sdk operation can fail with. Errors are propagated to
/// the calling operation; the runtime never logs-and-swallows, and the
/// hub reconnect loop is the only implicit retry.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("crypto failure")]
    Crypto,

    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("agent offline: {0}")]
    Offline(String),

    /// An `{error: …}` frame from a peer, or an error reply from the hub
    /// that is not one of the registry errors.
    #[error("peer error: {0}")]
    Application(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<codec::Error> for Error {
    fn from(value: codec::Error) -> Self {
        match value {
            codec::Error::DecryptionFailed | codec::Error::InvalidPublicKey => Self::Crypto,
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

pub type Result<T> = std::result::Result<T, Error>;
