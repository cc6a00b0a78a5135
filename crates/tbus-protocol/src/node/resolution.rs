use std::sync::Arc;
use std::time::Duration;

use tbus_transport::Endpoint;

use super::connection::BrokerConnection;
use super::{Node, NodeInner};
use crate::error::TbusError;
use crate::resolver;

impl Node {
    /// The connection serving `topic`, resolving and dialing on a miss.
    pub(super) async fn resolve_and_connect(
        &self,
        topic: &str,
    ) -> Result<Arc<BrokerConnection>, TbusError> {
        if let Some(connection) = self.inner.resolution(topic) {
            return Ok(connection);
        }

        let endpoint = self.resolve_topic(topic).await?;
        let mut retried = false;
        loop {
            let connection = self.get_or_connect(&endpoint).await?;
            match self.inner.add_topic_resolution(topic, &connection) {
                Ok(true) => {
                    tracing::debug!("{topic} resolved to {endpoint}");
                    if let Some(lifetime) = self.inner.config.topic_resolution_lifetime {
                        tokio::spawn(self.clone().expire_resolution(
                            topic.to_string(),
                            connection.clone(),
                            lifetime,
                        ));
                    }
                    return Ok(connection);
                }
                Ok(false) => return Ok(connection),
                // An idle connection can close between dial and insert.
                Err(TbusError::ConnectionLost { .. }) if !retried => retried = true,
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop the cached resolution for `topic`. Refused while subscribed,
    /// since the subscription lives on that connection.
    pub fn remove_topic_resolution(&self, topic: &str) -> Result<(), TbusError> {
        let Some(connection) = self.inner.resolution(topic) else {
            return Ok(());
        };
        if connection.is_subscribed(topic) {
            return Err(TbusError::AlreadySubscribed {
                topic: topic.to_string(),
            });
        }
        self.inner.drop_resolution(topic, &connection);
        Ok(())
    }

    async fn resolve_topic(&self, topic: &str) -> Result<Endpoint, TbusError> {
        let config = &self.inner.config;
        self.inner.metrics.resolutions.inc();
        resolver::resolve(
            &config.resolver_endpoint,
            topic,
            &config.name,
            &self.inner.transport,
            config.tcp_timeout,
        )
        .await
    }

    /// Re-check a resolution every `lifetime`. Subscribed topics stay put.
    /// Others are resolved again and dropped if the broker moved or the
    /// resolver no longer knows them.
    async fn expire_resolution(
        self,
        topic: String,
        connection: Arc<BrokerConnection>,
        lifetime: Duration,
    ) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = connection.closed().cancelled() => return,
                _ = tokio::time::sleep(lifetime) => {}
            }
            let current = self.inner.resolution(&topic);
            if !current.is_some_and(|c| Arc::ptr_eq(&c, &connection)) {
                return;
            }
            if connection.is_subscribed(&topic) {
                continue;
            }
            match self.resolve_topic(&topic).await {
                Ok(endpoint) if endpoint.address == connection.address() => continue,
                Ok(endpoint) => {
                    tracing::info!("{topic} moved from {} to {endpoint}", connection.endpoint())
                }
                Err(e) => tracing::debug!("re-resolving {topic} failed: {e}"),
            }
            self.inner.drop_resolution(&topic, &connection);
            return;
        }
    }
}

impl NodeInner {
    /// Cached resolution for `topic`, ignoring closed connections.
    pub(super) fn resolution(&self, topic: &str) -> Option<Arc<BrokerConnection>> {
        self.lock_resolutions()
            .get(topic)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Record that `connection` serves `topic`. `Ok(false)` if it already
    /// did; a different live connection is a conflict.
    fn add_topic_resolution(
        &self,
        topic: &str,
        connection: &Arc<BrokerConnection>,
    ) -> Result<bool, TbusError> {
        let mut resolutions = self.lock_resolutions();
        match resolutions.get(topic) {
            Some(existing) if Arc::ptr_eq(existing, connection) => return Ok(false),
            Some(existing) if !existing.is_closed() => {
                return Err(TbusError::DuplicateResolution {
                    topic: topic.to_string(),
                })
            }
            _ => {}
        }
        connection.add_resolved(topic)?;
        resolutions.insert(topic.to_string(), connection.clone());
        Ok(true)
    }

    /// Forget `topic` on `connection`, closing the connection once nothing
    /// uses it.
    fn drop_resolution(&self, topic: &str, connection: &Arc<BrokerConnection>) {
        {
            let mut resolutions = self.lock_resolutions();
            if resolutions
                .get(topic)
                .is_some_and(|c| Arc::ptr_eq(c, connection))
            {
                resolutions.remove(topic);
            }
        }
        connection.remove_resolved(topic);
        if connection.is_idle() {
            tracing::debug!("closing idle connection to {}", connection.endpoint());
            connection.close();
        }
    }
}
