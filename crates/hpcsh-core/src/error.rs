use thiserror::Error;

/// Errors produced by the hpcsh protocol and session layers.
///
/// A child process exiting is not represented here — that is a normal
/// lifecycle notification (`ServerMessage::Exited`), not a failure.
#[derive(Debug, Error)]
pub enum HpcshError {
    /// The platform could not allocate a pseudo-terminal pair, or the
    /// session table is full.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The child failed to start or exec the allocator command.
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// The operation referenced an unknown or already-reaped session id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// I/O failure on the remote connection.
    #[error("channel error: {0}")]
    Channel(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for HpcshError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        HpcshError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for HpcshError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        HpcshError::Codec(e.to_string())
    }
}

pub type HpcshResult<T> = Result<T, HpcshError>;
