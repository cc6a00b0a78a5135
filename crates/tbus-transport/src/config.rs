use std::time::Duration;

/// Transport settings shared by [`dial`](crate::dial) and
/// [`Listener::bind`](crate::Listener::bind).
///
/// ```rust
/// use std::time::Duration;
/// use tbus_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .connect_timeout(Duration::from_secs(2))
///     .max_frame_size(64 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Deadline for establishing an outbound TCP connection.
    pub(crate) connect_timeout: Duration,
    /// Largest inbound frame accepted, in bytes. 0 disables the limit.
    pub(crate) max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_size: 1024 * 1024, // 1 MB
        }
    }

    /// Set the outbound connect deadline (default: 5s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the inbound frame limit in bytes (default: 1 MB, 0 = unlimited).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }
}
