use std::time::Duration;

use tbus_transport::FrameWriter;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::TbusError;
use crate::message::Message;
use crate::wire;

/// Broker side of one node's connection.
///
/// The read half is owned by the connection's read loop; sends from
/// routing tasks go through the writer lock.
#[derive(Debug)]
pub(crate) struct NodeConnection {
    name: String,
    peer: String,
    writer: Mutex<FrameWriter>,
    closed: CancellationToken,
}

impl NodeConnection {
    pub fn new(name: String, writer: FrameWriter) -> Self {
        Self {
            name,
            peer: writer.peer_addr().to_string(),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&self, message: &Message, timeout: Duration) -> Result<usize, TbusError> {
        if self.closed.is_cancelled() {
            return Err(TbusError::ConnectionLost {
                address: self.peer.clone(),
            });
        }
        let mut writer = self.writer.lock().await;
        wire::write_message(&mut writer, message, timeout).await
    }

    /// Stop the read loop and half-close the socket.
    pub async fn close(&self) {
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("shutdown of {} failed: {e}", self.name);
        }
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}
