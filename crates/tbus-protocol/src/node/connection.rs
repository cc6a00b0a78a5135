use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tbus_transport::{Endpoint, FrameWriter};
use tokio_util::sync::CancellationToken;

use crate::error::TbusError;
use crate::message::Message;
use crate::wire;

#[derive(Debug, Default)]
struct Topics {
    resolved: HashSet<String>,
    subscribed: HashSet<String>,
}

/// Node side of the single connection to one broker address.
///
/// Topic sets have their own lock so routing on one connection never
/// contends with the node-wide tables.
#[derive(Debug)]
pub(crate) struct BrokerConnection {
    endpoint: Endpoint,
    writer: tokio::sync::Mutex<FrameWriter>,
    topics: Mutex<Topics>,
    closed: CancellationToken,
}

impl BrokerConnection {
    pub fn new(endpoint: Endpoint, writer: FrameWriter) -> Self {
        Self {
            endpoint,
            writer: tokio::sync::Mutex::new(writer),
            topics: Mutex::new(Topics::default()),
            closed: CancellationToken::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn address(&self) -> &str {
        &self.endpoint.address
    }

    pub async fn send(&self, message: &Message, timeout: Duration) -> Result<usize, TbusError> {
        if self.is_closed() {
            return Err(self.lost());
        }
        let mut writer = self.writer.lock().await;
        wire::write_message(&mut writer, message, timeout).await
    }

    pub fn lost(&self) -> TbusError {
        TbusError::ConnectionLost {
            address: self.endpoint.address.clone(),
        }
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Signal the read loop to stop; it performs the cleanup.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Half-close the socket after the read loop has stopped.
    pub async fn shutdown_writer(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            tracing::debug!("shutdown of {} failed: {e}", self.endpoint);
        }
    }

    pub fn add_resolved(&self, topic: &str) -> Result<(), TbusError> {
        let mut topics = self.lock();
        if self.is_closed() {
            return Err(self.lost());
        }
        topics.resolved.insert(topic.to_string());
        Ok(())
    }

    pub fn remove_resolved(&self, topic: &str) {
        self.lock().resolved.remove(topic);
    }

    pub fn add_subscribed(&self, topic: &str) -> Result<(), TbusError> {
        let mut topics = self.lock();
        if self.is_closed() {
            return Err(self.lost());
        }
        if !topics.subscribed.insert(topic.to_string()) {
            return Err(TbusError::AlreadySubscribed {
                topic: topic.to_string(),
            });
        }
        Ok(())
    }

    pub fn remove_subscribed(&self, topic: &str) -> bool {
        self.lock().subscribed.remove(topic)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.lock().subscribed.contains(topic)
    }

    /// Nothing resolved or subscribed through this connection.
    pub fn is_idle(&self) -> bool {
        let topics = self.lock();
        topics.resolved.is_empty() && topics.subscribed.is_empty()
    }

    /// Snapshot and clear both sets. Returns `(resolved, subscribed)`.
    pub fn take_topics(&self) -> (Vec<String>, Vec<String>) {
        let mut topics = self.lock();
        let mut resolved: Vec<String> = topics.resolved.drain().collect();
        let mut subscribed: Vec<String> = topics.subscribed.drain().collect();
        resolved.sort();
        subscribed.sort();
        (resolved, subscribed)
    }

    fn lock(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
