use std::time::Duration;

/// Errors returned by the tbus transport layer.
///
/// Every variant means the same thing to the protocol above: this
/// connection (or this dial attempt) is gone.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("send to {peer} failed: {source}")]
    Send {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("receive from {peer} failed: {source}")]
    Receive {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} with {peer} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        peer: String,
        timeout: Duration,
    },

    #[error("connection closed by {peer}")]
    Closed { peer: String },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("unsupported endpoint {address}: {reason}")]
    Unsupported { address: String, reason: String },
}

impl TransportError {
    /// `true` when the failure came from a deadline rather than the socket.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}
