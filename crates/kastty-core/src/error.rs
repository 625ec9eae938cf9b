use thiserror::Error;

/// A control message that failed to parse or did not match any known shape.
///
/// Always recoverable: the offending message is discarded and the
/// connection carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("protocol error: {0}")]
pub struct ProtocolError(pub String);

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError(e.to_string())
    }
}

/// Errors produced by kastty.
#[derive(Debug, Error)]
pub enum KasttyError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("process error: {0}")]
    Process(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("viewer limit ({0}) reached")]
    ViewerLimit(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type KasttyResult<T> = Result<T, KasttyError>;
