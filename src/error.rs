//! Error types for the subscription multiplexing client

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the subscription client
///
/// Connection-level failures (dial, handshake, transport) affect every
/// subscription multiplexed on that connection; subscription-level failures
/// are confined to a single id.
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket upgrade could not be established
    #[error("dial failed: {0}")]
    Dial(String),

    /// Init handshake failed (no ack in time, rejection, or unexpected frame)
    #[error("connection handshake failed: {0}")]
    Handshake(String),

    /// Malformed or unexpected frame in the current state
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Read/write failure on an established socket
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Server rejected or failed a single subscription id
    #[error("subscription failed upstream: {0}")]
    ServerSubscription(String),

    /// Caller cancelled before the subscription was registered
    #[error("subscriber cancelled before registration")]
    SubscriberCancelled,

    /// Client-wide shutdown in progress
    #[error("client is shutting down")]
    ClientShutdown,

    /// Target connection handler stopped accepting subscriptions
    #[error("connection handler is closing")]
    HandlerClosing,

    /// Invalid subscription request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors raised by user-supplied callbacks
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the caller may retry the subscribe and expect a fresh handler.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::HandlerClosing)
    }

    /// Whether the error terminates the whole connection rather than a
    /// single subscription.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Dial(_) | Error::Handshake(_) | Error::Transport(_) | Error::Io(_)
        )
    }
}
