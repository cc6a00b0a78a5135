//! Node client runtime.
//!
//! A node keeps one connection per broker address, caches which
//! connection serves which topic, subscribes to every topic it has a
//! handler for, and re-subscribes on its own when a broker connection
//! drops. Application code talks to it through [`Node::send_async`] and
//! [`Node::send_sync`].
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tbus_protocol::{Node, NodeConfig};
//!
//! # async fn example() -> Result<(), tbus_protocol::TbusError> {
//! let node = Node::builder(NodeConfig::new("billing"))
//!     .on_sync("invoice", |_node, request| async move {
//!         Ok(format!("invoice for {}", request.payload_str()).into_bytes())
//!     })
//!     .build()?;
//! node.start().await?;
//!
//! let reply = node.send_sync("orders", "ping", Duration::from_secs(1)).await?;
//! println!("{}", reply.payload_str());
//!
//! node.stop().await?;
//! # Ok(())
//! # }
//! ```

mod connection;
mod dispatch;
mod handler;
mod pending;
mod resolution;
mod session;

pub use handler::{AsyncHandler, Handler, SyncHandler};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tbus_transport::TransportConfig;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::TbusError;
use crate::message::{new_token, Message};
use crate::metrics::NodeMetrics;
use crate::topics;

use connection::BrokerConnection;
use dispatch::Inbound;
use pending::PendingResponses;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Handle to a node runtime. Clones share the same runtime.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    transport: TransportConfig,
    handlers: HashMap<String, Handler>,
    /// Broker address → connection. Held across dial and handshake.
    connections: tokio::sync::Mutex<HashMap<String, Arc<BrokerConnection>>>,
    /// Topic → connection currently serving it.
    resolutions: Mutex<HashMap<String, Arc<BrokerConnection>>>,
    pending: PendingResponses,
    sequential: Option<mpsc::UnboundedSender<Inbound>>,
    sequential_queue: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    lifecycle: Mutex<Lifecycle>,
    shutdown: CancellationToken,
    metrics: NodeMetrics,
}

/// Collects handlers before the node is built.
pub struct NodeBuilder {
    config: NodeConfig,
    handlers: HashMap<String, Handler>,
}

impl NodeBuilder {
    pub fn handler(mut self, topic: impl Into<String>, handler: Handler) -> Self {
        self.handlers.insert(topic.into(), handler);
        self
    }

    pub fn on_sync<F, Fut>(self, topic: impl Into<String>, f: F) -> Self
    where
        F: Fn(Node, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<u8>>> + Send + 'static,
    {
        self.handler(topic, Handler::sync_fn(f))
    }

    pub fn on_async<F, Fut>(self, topic: impl Into<String>, f: F) -> Self
    where
        F: Fn(Node, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handler(topic, Handler::async_fn(f))
    }

    pub fn build(self) -> Result<Node, TbusError> {
        self.config.validate()?;
        for topic in self.handlers.keys() {
            if topic.is_empty() || topics::is_reserved(topic) {
                return Err(TbusError::Config(format!(
                    "cannot register a handler for {topic:?}"
                )));
            }
        }

        let (sequential, queue) = if self.config.handle_messages_sequentially {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        Ok(Node {
            inner: Arc::new(NodeInner {
                transport: self.config.transport(),
                config: self.config,
                handlers: self.handlers,
                connections: tokio::sync::Mutex::new(HashMap::new()),
                resolutions: Mutex::new(HashMap::new()),
                pending: PendingResponses::new(),
                sequential,
                sequential_queue: Mutex::new(queue),
                lifecycle: Mutex::new(Lifecycle::Idle),
                shutdown: CancellationToken::new(),
                metrics: NodeMetrics::default(),
            }),
        })
    }
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            handlers: HashMap::new(),
        }
    }

    /// A node without handlers: it can publish and make requests but
    /// subscribes to nothing.
    pub fn new(config: NodeConfig) -> Result<Self, TbusError> {
        Self::builder(config).build()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Subscribe to every handled topic. A topic that cannot be subscribed
    /// within `max_subscribe_attempts` stops the node and fails `start`.
    pub async fn start(&self) -> Result<(), TbusError> {
        {
            let mut lifecycle = self.inner.lock_lifecycle();
            match *lifecycle {
                Lifecycle::Idle => *lifecycle = Lifecycle::Running,
                Lifecycle::Running => return Err(TbusError::AlreadyRunning),
                Lifecycle::Stopped => return Err(TbusError::Shutdown),
            }
        }

        let queue = self
            .inner
            .sequential_queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(queue) = queue {
            tokio::spawn(self.clone().run_sequential(queue));
        }

        let mut handled: Vec<String> = self.inner.handlers.keys().cloned().collect();
        handled.sort();
        for topic in &handled {
            if let Err(e) = self
                .subscribe_loop(topic, self.inner.config.max_subscribe_attempts)
                .await
            {
                tracing::error!("node {} failed to subscribe to {topic}: {e}", self.name());
                let _ = self.stop().await;
                return Err(e);
            }
        }
        tracing::info!("node {} started, subscribed to {handled:?}", self.name());
        Ok(())
    }

    /// Wake every waiter, close every broker connection. A stopped node
    /// cannot be restarted.
    pub async fn stop(&self) -> Result<(), TbusError> {
        {
            let mut lifecycle = self.inner.lock_lifecycle();
            if *lifecycle != Lifecycle::Running {
                return Err(TbusError::NotRunning);
            }
            *lifecycle = Lifecycle::Stopped;
        }
        self.inner.shutdown.cancel();

        let connections: Vec<Arc<BrokerConnection>> = self
            .inner
            .connections
            .lock()
            .await
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        self.inner.lock_resolutions().clear();
        for connection in &connections {
            connection.close();
            connection.shutdown_writer().await;
        }
        self.inner.pending.clear();
        tracing::info!(
            "node {} stopped, closed {} broker connections",
            self.name(),
            connections.len()
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        *self.inner.lock_lifecycle() == Lifecycle::Running
    }

    // ── Messaging ─────────────────────────────────────────────────────

    /// Publish to `topic` without waiting for anything back.
    pub async fn send_async(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Result<(), TbusError> {
        self.ensure_running()?;
        let connection = self.resolve_and_connect(topic).await?;
        let message = Message::new_async(topic, self.name(), payload);
        self.send_on(&connection, &message).await?;
        self.inner.metrics.async_messages_sent.inc();
        Ok(())
    }

    /// Send a sync request and wait up to `timeout` for the first response.
    ///
    /// A response on the `error` topic becomes [`TbusError::Remote`].
    pub async fn send_sync(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Message, TbusError> {
        self.ensure_running()?;
        let connection = self.resolve_and_connect(topic).await?;
        let request = Message::new_sync(topic, self.name(), payload, new_token());
        self.inner.metrics.sync_requests_sent.inc();
        self.request(&connection, &request, timeout).await
    }

    // ── Subscriptions ─────────────────────────────────────────────────

    pub async fn subscribe(&self, topic: &str) -> Result<(), TbusError> {
        self.ensure_running()?;
        let connection = self.resolve_and_connect(topic).await?;
        if connection.is_subscribed(topic) {
            return Err(TbusError::AlreadySubscribed {
                topic: topic.to_string(),
            });
        }
        let request = Message::new_sync(topics::SUBSCRIBE, self.name(), topic, new_token());
        let already = TbusError::AlreadySubscribed {
            topic: topic.to_string(),
        };
        let response = match self
            .request(&connection, &request, self.inner.config.sync_response_timeout)
            .await
        {
            Ok(response) => response,
            // An earlier attempt reached the broker but its reply was lost.
            Err(e) if e.is_remote(&already) => {
                connection.add_subscribed(topic)?;
                tracing::info!("node {} adopted existing subscription to {topic}", self.name());
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if response.topic() != topics::SUBSCRIBED {
            return Err(TbusError::invalid(format!(
                "expected {} reply, got {}",
                topics::SUBSCRIBED,
                response.topic()
            )));
        }
        connection.add_subscribed(topic)?;
        tracing::info!("node {} subscribed to {topic} at {}", self.name(), connection.endpoint());
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), TbusError> {
        self.ensure_running()?;
        let connection = self
            .inner
            .resolution(topic)
            .filter(|c| c.is_subscribed(topic))
            .ok_or_else(|| TbusError::NotSubscribed {
                topic: topic.to_string(),
            })?;
        let request = Message::new_sync(topics::UNSUBSCRIBE, self.name(), topic, new_token());
        let missing = TbusError::NotSubscribed {
            topic: topic.to_string(),
        };
        let response = match self
            .request(&connection, &request, self.inner.config.sync_response_timeout)
            .await
        {
            Ok(response) => response,
            // The broker already dropped it; an earlier reply was lost.
            Err(e) if e.is_remote(&missing) => {
                connection.remove_subscribed(topic);
                tracing::info!("node {} unsubscribed from {topic}", self.name());
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if response.topic() != topics::UNSUBSCRIBED {
            return Err(TbusError::invalid(format!(
                "expected {} reply, got {}",
                topics::UNSUBSCRIBED,
                response.topic()
            )));
        }
        connection.remove_subscribed(topic);
        tracing::info!("node {} unsubscribed from {topic}", self.name());
        Ok(())
    }

    /// Retry [`subscribe`](Self::subscribe) with `subscribe_delay` between
    /// attempts. `max_attempts == 0` retries until shutdown.
    pub async fn subscribe_loop(&self, topic: &str, max_attempts: u32) -> Result<(), TbusError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.subscribe(topic).await {
                Ok(()) | Err(TbusError::AlreadySubscribed { .. }) => return Ok(()),
                Err(e @ (TbusError::Shutdown | TbusError::NotRunning)) => return Err(e),
                Err(e) => tracing::warn!("subscribe to {topic} failed (attempt {attempts}): {e}"),
            }
            if max_attempts > 0 && attempts >= max_attempts {
                return Err(TbusError::SubscribeExhausted {
                    topic: topic.to_string(),
                    attempts,
                });
            }
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Err(TbusError::Shutdown),
                _ = tokio::time::sleep(self.inner.config.subscribe_delay) => {}
            }
        }
    }

    // ── Introspection ─────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.inner.metrics
    }

    /// Live broker connections.
    pub async fn connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .await
            .values()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Topics with a cached resolution, sorted.
    pub fn resolved_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.lock_resolutions().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Topics currently subscribed, sorted.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .inner
            .lock_resolutions()
            .iter()
            .filter(|(topic, c)| c.is_subscribed(topic))
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Sync requests still waiting for a response.
    pub fn pending_responses(&self) -> usize {
        self.inner.pending.len()
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn ensure_running(&self) -> Result<(), TbusError> {
        match *self.inner.lock_lifecycle() {
            Lifecycle::Running => Ok(()),
            Lifecycle::Idle => Err(TbusError::NotRunning),
            Lifecycle::Stopped => Err(TbusError::Shutdown),
        }
    }

    /// Send on `connection`; a failed write closes it so the disconnect
    /// path runs.
    async fn send_on(&self, connection: &BrokerConnection, message: &Message) -> Result<(), TbusError> {
        match connection.send(message, self.inner.config.tcp_timeout).await {
            Ok(sent) => {
                self.inner.metrics.bytes_sent.add(sent as u64);
                Ok(())
            }
            Err(e) => {
                connection.close();
                Err(e)
            }
        }
    }

    /// Register the wait before sending so a fast response cannot be missed,
    /// then wait for the response, shutdown, connection loss or timeout.
    async fn request(
        &self,
        connection: &BrokerConnection,
        request: &Message,
        timeout: Duration,
    ) -> Result<Message, TbusError> {
        let token = request
            .sync_request_token()
            .ok_or_else(|| TbusError::invalid("request without sync token"))?;
        let mut wait = self.inner.pending.register(token)?;
        self.send_on(connection, request).await?;

        let response = tokio::select! {
            biased;
            response = wait.wait() => response?,
            _ = self.inner.shutdown.cancelled() => return Err(TbusError::Shutdown),
            _ = connection.closed().cancelled() => return Err(connection.lost()),
            _ = tokio::time::sleep(timeout) => return Err(TbusError::Timeout),
        };

        if response.topic() == topics::ERROR {
            return Err(TbusError::Remote(response.payload_str().into_owned()));
        }
        Ok(response)
    }
}

impl NodeInner {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_resolutions(&self) -> MutexGuard<'_, HashMap<String, Arc<BrokerConnection>>> {
        self.resolutions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
