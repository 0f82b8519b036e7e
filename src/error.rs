use std::string::FromUtf8Error;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;
use tokio::time::error::Elapsed;

/// The closed set of error kinds the core can produce.
///
/// Every variant maps to a single outward-facing consequence: an HTTP
/// error response during the handshake, or a WebSocket close code once a
/// session is open. `close_code` implements that mapping in one place so
/// `session.rs` and `message.rs` never have to duplicate it.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {source}")]
    Transport {
        #[from]
        source: std::io::Error,
    },

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("message exceeds configured size limit")]
    MessageTooBig,

    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("server at capacity")]
    CapacityExceeded,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{source}")]
    Utf8 {
        #[from]
        source: FromUtf8Error,
    },

    #[error("channel closed")]
    ChannelClosed,
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Error::ChannelClosed
    }
}

impl Error {
    /// The close code a session transitions to because of this error.
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(_) => 1002,
            Error::InvalidPayload(_) | Error::Utf8 { .. } => 1007,
            Error::MessageTooBig => 1009,
            Error::Timeout { .. } => 1001,
            Error::Transport { .. } | Error::ChannelClosed => 1006,
            Error::Internal(_) | Error::Handshake(_) | Error::CapacityExceeded => 1011,
        }
    }
}
