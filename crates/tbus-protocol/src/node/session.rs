use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tbus_transport::{dial, Endpoint, FrameReader};

use super::connection::BrokerConnection;
use super::Node;
use crate::error::TbusError;
use crate::message::Message;
use crate::topics;
use crate::wire;

impl Node {
    /// The live connection to `endpoint`, dialing one if needed.
    ///
    /// The table lock is held across dial and handshake, so concurrent
    /// callers for the same address end up sharing one connection.
    pub(super) async fn get_or_connect(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Arc<BrokerConnection>, TbusError> {
        let mut connections = self.inner.connections.lock().await;
        if let Some(existing) = connections.get(&endpoint.address) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(TbusError::Shutdown);
        }
        let connection = self.connect(endpoint).await?;
        connections.insert(endpoint.address.clone(), connection.clone());
        Ok(connection)
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<BrokerConnection>, TbusError> {
        let config = &self.inner.config;
        let mut connection = dial(endpoint, &self.inner.transport).await?;

        let hello = Message::new_async(topics::CONNECT, &config.name, Vec::new());
        let reply = wire::exchange(&mut connection, &hello, config.tcp_timeout).await?;
        match reply.topic() {
            topics::CONNECTED => {}
            topics::ERROR => {
                return Err(TbusError::HandshakeRejected {
                    reason: reply.payload_str().into_owned(),
                })
            }
            other => {
                return Err(TbusError::HandshakeRejected {
                    reason: format!("unexpected handshake reply {other}"),
                })
            }
        }

        let (reader, writer) = connection.into_split();
        let connection = Arc::new(BrokerConnection::new(endpoint.clone(), writer));
        tokio::spawn(self.clone().read_loop(connection.clone(), reader));
        if let Some(interval) = config.heartbeat_interval {
            tokio::spawn(self.clone().heartbeat_loop(connection.clone(), interval));
        }
        tracing::info!("node {} connected to broker at {endpoint}", config.name);
        Ok(connection)
    }

    async fn read_loop(self, connection: Arc<BrokerConnection>, mut reader: FrameReader) {
        loop {
            let received = tokio::select! {
                _ = connection.closed().cancelled() => break,
                received = wire::read_message(&mut reader, None) => received,
            };
            match received {
                Ok((message, size)) => {
                    self.inner.metrics.bytes_received.add(size as u64);
                    self.dispatch(&connection, message);
                }
                Err(TbusError::Deserialization(e)) => {
                    tracing::warn!("dropping undecodable frame from {}: {e}", connection.endpoint());
                }
                Err(e) => {
                    if !self.inner.shutdown.is_cancelled() {
                        tracing::info!("connection to {} lost: {e}", connection.endpoint());
                    }
                    break;
                }
            }
        }
        self.handle_disconnect(&connection).await;
    }

    async fn heartbeat_loop(self, connection: Arc<BrokerConnection>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = connection.closed().cancelled() => return,
                _ = ticker.tick() => {}
            }
            let beat = Message::new_async(topics::HEARTBEAT, self.name(), Vec::new());
            if let Err(e) = self.send_on(&connection, &beat).await {
                tracing::warn!("heartbeat to {} failed: {e}", connection.endpoint());
                return;
            }
        }
    }

    /// Tear down everything tied to `connection`, then win back the
    /// subscriptions it carried.
    async fn handle_disconnect(&self, connection: &Arc<BrokerConnection>) {
        connection.close();
        connection.shutdown_writer().await;

        {
            let mut connections = self.inner.connections.lock().await;
            if connections
                .get(connection.address())
                .is_some_and(|current| Arc::ptr_eq(current, connection))
            {
                connections.remove(connection.address());
            }
        }
        self.inner
            .lock_resolutions()
            .retain(|_, current| !Arc::ptr_eq(current, connection));

        let (resolved, subscribed) = connection.take_topics();
        tracing::debug!(
            "dropped {} resolutions served by {}",
            resolved.len(),
            connection.endpoint()
        );
        if self.inner.shutdown.is_cancelled() || subscribed.is_empty() {
            return;
        }

        tracing::warn!(
            "lost subscriptions {subscribed:?} with {}, resubscribing",
            connection.endpoint()
        );
        for topic in subscribed {
            tokio::spawn(self.clone().resubscribe(topic));
        }
    }

    /// A resubscription that runs out of attempts leaves the node deaf to
    /// `topic`, so the node stops.
    ///
    /// Boxed: the future reaches `connect`, which spawns `read_loop`, which
    /// spawns this again.
    fn resubscribe(self, topic: String) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            self.inner.metrics.reconnect_attempts.inc();
            match self
                .subscribe_loop(&topic, self.inner.config.max_subscribe_attempts)
                .await
            {
                Ok(()) => tracing::info!("node {} resubscribed to {topic}", self.name()),
                Err(TbusError::Shutdown | TbusError::NotRunning) => {}
                Err(e) => {
                    tracing::error!(
                        "node {} cannot resubscribe to {topic}: {e}; stopping",
                        self.name()
                    );
                    let _ = self.stop().await;
                }
            }
        })
    }
}
