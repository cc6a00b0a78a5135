use std::sync::Arc;

use tbus_transport::{Connection, FrameReader};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::connection::NodeConnection;
use super::state::TopicKind;
use super::BrokerInner;
use crate::error::TbusError;
use crate::message::Message;
use crate::topics;
use crate::wire;

/// Handshake, then run the node's read loop until it disconnects or the
/// broker stops.
pub(super) async fn serve_node(
    inner: Arc<BrokerInner>,
    connection: Connection,
    shutdown: CancellationToken,
) {
    let peer = connection.peer_addr().to_string();
    let (mut reader, mut writer) = connection.into_split();
    let timeout = inner.config.tcp_timeout;

    let name = match inner.handshake(&mut reader).await {
        Ok(name) => name,
        Err(e) => {
            tracing::warn!("handshake with {peer} failed: {e}");
            let reply = Message::new_async(topics::ERROR, &inner.config.name, e.to_string());
            if let Err(e) = wire::write_message(&mut writer, &reply, timeout).await {
                tracing::debug!("could not tell {peer} about failed handshake: {e}");
            }
            return;
        }
    };

    let node = Arc::new(NodeConnection::new(name.clone(), writer));
    let registered = inner.lock_state().insert_node(&name, node.clone());
    if let Err(e) = registered {
        tracing::warn!("rejecting {peer}: {e}");
        let reply = Message::new_async(topics::ERROR, &inner.config.name, e.to_string());
        if let Err(e) = inner.send_to(&node, &reply).await {
            tracing::debug!("could not tell {peer} about the rejection: {e}");
        }
        node.close().await;
        return;
    }

    let connected = Message::new_async(topics::CONNECTED, &inner.config.name, "");
    if let Err(e) = inner.send_to(&node, &connected).await {
        tracing::warn!("failed to confirm handshake with {name}: {e}");
        inner.disconnect(&node).await;
        return;
    }
    tracing::info!("node {name} connected from {peer}");

    inner.read_loop(&node, &mut reader, &shutdown).await;
    inner.disconnect(&node).await;
}

impl BrokerInner {
    /// Read the `connect` message and return the node's name.
    async fn handshake(&self, reader: &mut FrameReader) -> Result<String, TbusError> {
        let (message, size) = wire::read_message(reader, Some(self.config.tcp_timeout)).await?;
        self.metrics.bytes_received.add(size as u64);
        message.validate(&self.config.limits)?;

        if message.topic() != topics::CONNECT {
            return Err(TbusError::HandshakeRejected {
                reason: format!("expected {}, got {}", topics::CONNECT, message.topic()),
            });
        }
        if message.is_sync_request() || message.is_sync_response() || !message.payload().is_empty() {
            return Err(TbusError::HandshakeRejected {
                reason: "connect must carry no payload and no sync token".into(),
            });
        }
        Ok(message.origin().to_string())
    }

    async fn read_loop(
        self: &Arc<Self>,
        node: &Arc<NodeConnection>,
        reader: &mut FrameReader,
        shutdown: &CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                _ = node.closed().cancelled() => break,
                _ = shutdown.cancelled() => break,
                received = wire::read_message(reader, None) => received,
            };
            match received {
                Ok((message, size)) => {
                    self.metrics.incoming_messages.inc();
                    self.metrics.bytes_received.add(size as u64);
                    let inner = self.clone();
                    let node = node.clone();
                    tokio::spawn(async move { inner.route(node, message).await });
                }
                Err(TbusError::Deserialization(e)) => {
                    tracing::warn!("dropping malformed frame from {}: {e}", node.name());
                }
                Err(e) => {
                    tracing::debug!("read from {} ended: {e}", node.name());
                    break;
                }
            }
        }
    }

    /// Remove the node and all of its subscriptions.
    async fn disconnect(&self, node: &Arc<NodeConnection>) {
        let dropped = {
            let mut state = self.lock_state();
            let current = state.node(node.name()).is_some_and(|n| Arc::ptr_eq(n, node));
            if current {
                state.remove_node(node.name()).map(|(_, topics)| topics)
            } else {
                None
            }
        };
        node.close().await;
        if let Some(dropped) = dropped {
            tracing::info!("node {} disconnected, dropped subscriptions {dropped:?}", node.name());
        }
    }

    async fn route(self: Arc<Self>, node: Arc<NodeConnection>, message: Message) {
        if let Err(e) = message.validate(&self.config.limits) {
            return self.reject(&node, &message, e).await;
        }

        if let Some(token) = message.sync_response_token() {
            match self.requests.complete(token, message.clone()) {
                Ok(origin) => tracing::debug!(
                    "response {token} from {} routed to {origin}",
                    node.name()
                ),
                Err(e) => tracing::warn!("dropping response from {}: {e}", node.name()),
            }
            return;
        }

        let kind = self.lock_state().topic_kind(message.topic());
        match (kind, message.is_sync_request()) {
            (Some(TopicKind::Sync), true) => self.handle_sync_request(&node, &message).await,
            (Some(TopicKind::Async), false) => self.fan_out(&node, message),
            (None, _) => {
                let topic = message.topic().to_string();
                self.reject(&node, &message, TbusError::UnknownTopic { topic })
                    .await
            }
            (Some(TopicKind::Async), true) => {
                let reason = format!("{} is an async topic", message.topic());
                self.reject(&node, &message, TbusError::invalid(reason)).await
            }
            (Some(TopicKind::Sync), false) => {
                let reason = format!("{} is a sync topic", message.topic());
                self.reject(&node, &message, TbusError::invalid(reason)).await
            }
        }
    }

    /// Log, and answer sync requests with an `error` response.
    async fn reject(&self, node: &NodeConnection, message: &Message, error: TbusError) {
        tracing::warn!(
            "rejected {} message from {}: {error}",
            message.topic(),
            node.name()
        );
        if message.is_sync_request() && !message.is_sync_response() {
            let reply = self.error_response(message, &error);
            if let Err(e) = self.send_to(node, &reply).await {
                tracing::debug!("error reply to {} failed: {e}", node.name());
            }
        }
    }

    fn error_response(&self, request: &Message, error: &TbusError) -> Message {
        Message::new_response(request, topics::ERROR, &self.config.name, error.to_string())
    }

    fn fan_out(self: &Arc<Self>, from: &NodeConnection, message: Message) {
        if message.topic() == topics::HEARTBEAT {
            tracing::debug!("heartbeat from {}", from.name());
            return;
        }
        let subscribers = self.lock_state().subscribers(message.topic());
        tracing::debug!(
            "{} from {} to {} subscribers",
            message.topic(),
            from.name(),
            subscribers.len()
        );
        let message = Arc::new(message);
        for subscriber in subscribers {
            self.spawn_delivery(subscriber, message.clone());
        }
    }

    /// Deliver to one subscriber on its own task so one slow or dead
    /// subscriber never holds up the others.
    fn spawn_delivery(self: &Arc<Self>, subscriber: Arc<NodeConnection>, message: Arc<Message>) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.send_to(&subscriber, &message).await {
                inner.metrics.delivery_failures.inc();
                tracing::warn!(
                    "delivery of {} to {} failed: {e}",
                    message.topic(),
                    subscriber.name()
                );
            }
        });
    }

    async fn handle_sync_request(self: &Arc<Self>, node: &Arc<NodeConnection>, request: &Message) {
        let Some(token) = request.sync_request_token() else {
            return;
        };

        let response = match request.topic() {
            topics::SUBSCRIBE | topics::UNSUBSCRIBE => {
                let rx = match self.requests.open(token, node.name()) {
                    Ok(rx) => rx,
                    Err(e) => return self.reject(node, request, e).await,
                };
                let outcome = self.apply_subscription(node, request);
                if let Err(e) = self.requests.complete(token, outcome) {
                    tracing::warn!("subscription response lost: {e}");
                }
                self.await_response(token, rx).await
            }
            topic => {
                let subscribers = self.lock_state().subscribers(topic);
                if subscribers.is_empty() {
                    let error = TbusError::NoSubscribers {
                        topic: topic.to_string(),
                    };
                    return self.reject(node, request, error).await;
                }
                let rx = match self.requests.open(token, node.name()) {
                    Ok(rx) => rx,
                    Err(e) => return self.reject(node, request, e).await,
                };
                self.metrics.sync_requests_opened.inc();
                let shared = Arc::new(request.clone());
                for subscriber in subscribers {
                    self.spawn_delivery(subscriber, shared.clone());
                }
                self.await_response(token, rx).await
            }
        };

        let response = response.unwrap_or_else(|e| self.error_response(request, &e));
        if let Err(e) = self.send_to(node, &response).await {
            tracing::warn!("response {token} to {} failed: {e}", node.name());
        }
    }

    async fn await_response(
        &self,
        token: &str,
        rx: oneshot::Receiver<Message>,
    ) -> Result<Message, TbusError> {
        tokio::select! {
            response = rx => response.map_err(|_| TbusError::Remote("broker stopped".into())),
            _ = tokio::time::sleep(self.config.sync_response_timeout) => {
                self.requests.cancel(token);
                self.metrics.sync_requests_timed_out.inc();
                Err(TbusError::Timeout)
            }
        }
    }

    /// Apply a `subscribe`/`unsubscribe` and build the reply.
    fn apply_subscription(&self, node: &Arc<NodeConnection>, request: &Message) -> Message {
        let topic = request.payload_str();
        let result = {
            let mut state = self.lock_state();
            let connected = state
                .node(node.name())
                .is_some_and(|n| Arc::ptr_eq(n, node));
            if !connected {
                Err(TbusError::ConnectionLost {
                    address: node.peer().to_string(),
                })
            } else if request.topic() == topics::SUBSCRIBE {
                state.subscribe(node.name(), &topic)
            } else {
                state.unsubscribe(node.name(), &topic)
            }
        };

        match result {
            Ok(()) => {
                let reply_topic = if request.topic() == topics::SUBSCRIBE {
                    topics::SUBSCRIBED
                } else {
                    topics::UNSUBSCRIBED
                };
                tracing::info!("node {} {reply_topic} {topic}", node.name());
                Message::new_response(request, reply_topic, &self.config.name, topic.as_bytes())
            }
            Err(e) => self.error_response(request, &e),
        }
    }

    pub(super) async fn send_to(&self, node: &NodeConnection, message: &Message) -> Result<(), TbusError> {
        let sent = node.send(message, self.config.tcp_timeout).await?;
        self.metrics.outgoing_messages.inc();
        self.metrics.bytes_sent.add(sent as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tbus_transport::{dial, Accept, AccessControl, Endpoint, Listener, TransportConfig};

    use super::*;
    use crate::broker::Broker;
    use crate::config::BrokerConfig;

    #[tokio::test]
    async fn dead_subscriber_does_not_hold_up_the_others() {
        let broker = Broker::new(BrokerConfig::new("b").async_topic("events")).unwrap();
        let inner = broker.inner.clone();
        let config = TransportConfig::new();
        let listener = Listener::bind("127.0.0.1:0", AccessControl::default(), &config)
            .await
            .unwrap();
        let endpoint = Endpoint::new(listener.local_addr().unwrap().to_string());

        let mut clients = Vec::new();
        let mut nodes = Vec::new();
        for name in ["live-1", "dead", "live-2"] {
            let client = dial(&endpoint, &config).await.unwrap();
            let Accept::Admitted(server) = listener.accept().await.unwrap() else {
                panic!("{name} was rejected");
            };
            let (_reader, writer) = server.into_split();
            let node = Arc::new(NodeConnection::new(name.to_string(), writer));
            {
                let mut state = inner.lock_state();
                state.insert_node(name, node.clone()).unwrap();
                state.subscribe(name, "events").unwrap();
            }
            clients.push((name, client));
            nodes.push(node);
        }
        nodes[1].close().await;

        inner.fan_out(&nodes[0], Message::new_async("events", "pub", "hello"));

        for (name, client) in &mut clients {
            if *name == "dead" {
                continue;
            }
            let frame = client.receive(Some(Duration::from_secs(5))).await.unwrap();
            let message = Message::from_bytes(&frame).unwrap();
            assert_eq!(message.payload_str(), "hello", "{name}");
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while inner.metrics.delivery_failures.get() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(inner.metrics.delivery_failures.get(), 1);
        assert_eq!(inner.metrics.outgoing_messages.get(), 2);
    }

    #[tokio::test]
    async fn heartbeat_is_absorbed() {
        let broker = Broker::new(BrokerConfig::new("b").async_topic("events")).unwrap();
        let inner = broker.inner.clone();
        let config = TransportConfig::new();
        let listener = Listener::bind("127.0.0.1:0", AccessControl::default(), &config)
            .await
            .unwrap();
        let endpoint = Endpoint::new(listener.local_addr().unwrap().to_string());
        let mut client = dial(&endpoint, &config).await.unwrap();
        let Accept::Admitted(server) = listener.accept().await.unwrap() else {
            panic!("rejected");
        };
        let (_reader, writer) = server.into_split();
        let node = Arc::new(NodeConnection::new("n".to_string(), writer));
        inner.lock_state().insert_node("n", node.clone()).unwrap();

        let beat = Message::new_async(topics::HEARTBEAT, "n", Vec::new());
        inner.clone().route(node.clone(), beat).await;

        assert_eq!(inner.metrics.outgoing_messages.get(), 0);
        assert!(client.receive(Some(Duration::from_millis(100))).await.is_err());
    }
}
