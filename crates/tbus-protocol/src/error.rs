/// Protocol-level errors for tbus.
///
/// Wraps transport errors and adds the protocol, application and state
/// failures the resolver, broker and node runtime report.
#[derive(Debug, thiserror::Error)]
pub enum TbusError {
    #[error("transport error: {0}")]
    Transport(#[from] tbus_transport::TransportError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("handshake rejected: {reason}")]
    HandshakeRejected { reason: String },

    #[error("timed out waiting for response")]
    Timeout,

    #[error("shutting down")]
    Shutdown,

    #[error("connection to {address} lost")]
    ConnectionLost { address: String },

    /// The remote side answered with an `error` message.
    #[error("remote error: {0}")]
    Remote(String),

    // ── State errors ──────────────────────────────────────────────────
    #[error("sync token {token} is already in use")]
    DuplicateToken { token: String },

    #[error("node name {name} is already connected")]
    DuplicateNodeName { name: String },

    #[error("topic {topic} is already resolved through another broker")]
    DuplicateResolution { topic: String },

    #[error("already subscribed to {topic}")]
    AlreadySubscribed { topic: String },

    #[error("not subscribed to {topic}")]
    NotSubscribed { topic: String },

    #[error("unknown sync token {token}")]
    UnknownToken { token: String },

    #[error("unknown topic {topic}")]
    UnknownTopic { topic: String },

    #[error("no subscribers for {topic}")]
    NoSubscribers { topic: String },

    #[error("no handler for {topic}")]
    NoHandler { topic: String },

    #[error("subscribing to {topic} failed after {attempts} attempts")]
    SubscribeExhausted { topic: String, attempts: u32 },

    // ── Lifecycle / config ────────────────────────────────────────────
    #[error("already running")]
    AlreadyRunning,

    #[error("not running")]
    NotRunning,

    #[error("invalid config: {0}")]
    Config(String),
}

impl TbusError {
    /// `true` for failures a caller may reasonably retry: timeouts and
    /// lost or refused connections. State and remote errors are permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TbusError::Transport(_) | TbusError::Timeout | TbusError::ConnectionLost { .. }
        )
    }

    /// `true` if this is an `error` reply from a peer carrying `expected`.
    /// Lets a node tell a broker-side state error apart from other failures.
    pub fn is_remote(&self, expected: &TbusError) -> bool {
        matches!(self, TbusError::Remote(reason) if *reason == expected.to_string())
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        TbusError::InvalidMessage {
            reason: reason.into(),
        }
    }
}

impl From<rmp_serde::encode::Error> for TbusError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TbusError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TbusError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TbusError::Deserialization(e.to_string())
    }
}

impl From<serde_json::Error> for TbusError {
    fn from(e: serde_json::Error) -> Self {
        TbusError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_remote_matches_reply_text() {
        let already = TbusError::AlreadySubscribed {
            topic: "events".into(),
        };
        let reply = TbusError::Remote(already.to_string());
        assert!(reply.is_remote(&already));
        assert!(!reply.is_remote(&TbusError::AlreadySubscribed {
            topic: "orders".into()
        }));
        assert!(!already.is_remote(&already));
    }

    #[test]
    fn test_display_remote() {
        let err = TbusError::Remote("no subscribers for orders".into());
        assert_eq!(err.to_string(), "remote error: no subscribers for orders");
    }

    #[test]
    fn test_display_subscribe_exhausted() {
        let err = TbusError::SubscribeExhausted {
            topic: "events".into(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "subscribing to events failed after 3 attempts"
        );
    }

    #[test]
    fn test_display_duplicate_token() {
        let err = TbusError::DuplicateToken {
            token: "abc".into(),
        };
        assert_eq!(err.to_string(), "sync token abc is already in use");
    }

    #[test]
    fn test_from_transport_error() {
        let err: TbusError = tbus_transport::TransportError::Closed {
            peer: "127.0.0.1:1".into(),
        }
        .into();
        assert!(matches!(err, TbusError::Transport(_)));
        assert!(err.to_string().contains("connection closed by 127.0.0.1:1"));
    }

    #[test]
    fn test_retryable_split() {
        assert!(TbusError::Timeout.is_retryable());
        assert!(TbusError::ConnectionLost {
            address: "x".into()
        }
        .is_retryable());
        assert!(!TbusError::Shutdown.is_retryable());
        assert!(!TbusError::Remote("boom".into()).is_retryable());
        assert!(!TbusError::AlreadySubscribed {
            topic: "t".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_from_decode_error() {
        let err: TbusError = rmp_serde::from_slice::<String>(&[0xc1])
            .unwrap_err()
            .into();
        assert!(matches!(err, TbusError::Deserialization(_)));
    }
}
