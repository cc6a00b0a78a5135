//! Message broker.
//!
//! A broker accepts node connections, keeps a subscriber set per topic it
//! serves, fans async messages out to every subscriber, and parks sync
//! requests until the first subscriber answers. A second listener takes
//! config commands (topic registry and access-list edits).
//!
//! ```rust,no_run
//! use tbus_protocol::{Broker, BrokerConfig};
//! use tbus_transport::Endpoint;
//!
//! # async fn example() -> Result<(), tbus_protocol::TbusError> {
//! let broker = Broker::new(
//!     BrokerConfig::new("broker-1")
//!         .resolver(Endpoint::new("127.0.0.1:60001"))
//!         .sync_topic("orders")
//!         .async_topic("events"),
//! )?;
//! broker.start().await?;
//! // ...
//! broker.stop().await?;
//! # Ok(())
//! # }
//! ```

mod commands;
mod connection;
mod requests;
mod routing;
mod state;

pub use state::TopicKind;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tbus_transport::{Accept, AccessControl, Endpoint, Listener};
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::config_request::config_request;
use crate::error::TbusError;
use crate::metrics::BrokerMetrics;
use crate::topics;

use connection::NodeConnection;
use requests::SyncRequests;
use state::BrokerState;

/// Handle to a broker. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    state: Mutex<BrokerState<Arc<NodeConnection>>>,
    requests: SyncRequests,
    node_access: AccessControl,
    config_access: AccessControl,
    metrics: BrokerMetrics,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: CancellationToken,
    endpoint: Endpoint,
    config_addr: SocketAddr,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Result<Self, TbusError> {
        config.validate()?;
        let state = BrokerState::new(config.sync_topics.clone(), config.async_topics.clone());
        Ok(Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(state),
                requests: SyncRequests::new(),
                node_access: config.node_access(),
                config_access: config.config_access(),
                metrics: BrokerMetrics::default(),
                running: Mutex::new(None),
                config,
            }),
        })
    }

    /// Bind the node and config listeners, then register served topics with
    /// every configured resolver.
    pub async fn start(&self) -> Result<(), TbusError> {
        let inner = &self.inner;
        if inner.lock_running().is_some() {
            return Err(TbusError::AlreadyRunning);
        }
        let transport = inner.config.transport();
        let nodes = Listener::bind(&inner.config.node_address, inner.node_access.clone(), &transport)
            .await?;
        let admin = Listener::bind(
            &inner.config.config_address,
            inner.config_access.clone(),
            &transport,
        )
        .await?;

        let node_addr = nodes.local_addr()?;
        let endpoint = inner
            .config
            .endpoint
            .clone()
            .unwrap_or_else(|| Endpoint::new(node_addr.to_string()));
        let shutdown = CancellationToken::new();
        {
            let mut running = inner.lock_running();
            if running.is_some() {
                return Err(TbusError::AlreadyRunning);
            }
            *running = Some(Running {
                shutdown: shutdown.clone(),
                endpoint: endpoint.clone(),
                config_addr: admin.local_addr()?,
            });
        }
        tracing::info!("broker {} serving nodes at {endpoint}", inner.config.name);

        tokio::spawn(node_accept_loop(inner.clone(), nodes, shutdown.clone()));
        tokio::spawn(config_accept_loop(inner.clone(), admin, shutdown));

        let served = inner.lock_state().served_topics();
        inner.register_at_resolvers(&served).await;
        Ok(())
    }

    /// Deregister from resolvers, close every node connection and fail every
    /// open sync request.
    pub async fn stop(&self) -> Result<(), TbusError> {
        let inner = &self.inner;
        let running = inner.lock_running().take().ok_or(TbusError::NotRunning)?;
        running.shutdown.cancel();

        let served = inner.lock_state().served_topics();
        inner.deregister_at_resolvers(&served).await;

        let nodes = inner.lock_state().node_handles();
        for node in nodes {
            node.close().await;
        }
        let failed = inner.requests.fail_all();
        tracing::info!(
            "broker {} stopped ({failed} open sync requests failed)",
            inner.config.name
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_running().is_some()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Endpoint advertised to resolvers.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.lock_running().as_ref().map(|r| r.endpoint.clone())
    }

    pub fn config_endpoint(&self) -> Option<Endpoint> {
        self.inner
            .lock_running()
            .as_ref()
            .map(|r| Endpoint::new(r.config_addr.to_string()))
    }

    pub async fn add_sync_topics(&self, names: Vec<String>) -> Vec<String> {
        self.inner.add_topics(TopicKind::Sync, names).await
    }

    pub async fn add_async_topics(&self, names: Vec<String>) -> Vec<String> {
        self.inner.add_topics(TopicKind::Async, names).await
    }

    pub async fn remove_sync_topics(&self, names: Vec<String>) -> Vec<String> {
        self.inner.remove_topics(TopicKind::Sync, names).await
    }

    pub async fn remove_async_topics(&self, names: Vec<String>) -> Vec<String> {
        self.inner.remove_topics(TopicKind::Async, names).await
    }

    pub fn topic_kind(&self, topic: &str) -> Option<TopicKind> {
        self.inner.lock_state().topic_kind(topic)
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock_state().node_count()
    }

    /// Names of the nodes subscribed to `topic`, sorted.
    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.inner.lock_state().subscriber_names(topic)
    }

    pub fn open_sync_requests(&self) -> usize {
        self.inner.requests.len()
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.inner.metrics
    }
}

impl BrokerInner {
    fn lock_state(&self) -> MutexGuard<'_, BrokerState<Arc<NodeConnection>>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advertised_endpoint(&self) -> Option<Endpoint> {
        self.lock_running().as_ref().map(|r| r.endpoint.clone())
    }

    async fn add_topics(&self, kind: TopicKind, names: Vec<String>) -> Vec<String> {
        let added = self.lock_state().add_topics(kind, names);
        if !added.is_empty() {
            tracing::info!("broker {} added {kind:?} topics {added:?}", self.config.name);
            self.register_at_resolvers(&added).await;
        }
        added
    }

    async fn remove_topics(&self, kind: TopicKind, names: Vec<String>) -> Vec<String> {
        let removed = self.lock_state().remove_topics(kind, names);
        if !removed.is_empty() {
            tracing::info!("broker {} removed {kind:?} topics {removed:?}", self.config.name);
            self.deregister_at_resolvers(&removed).await;
        }
        removed
    }

    async fn register_at_resolvers(&self, names: &[String]) {
        let Some(endpoint) = self.advertised_endpoint() else {
            return;
        };
        if names.is_empty() {
            return;
        }
        let payload = format!(
            "{}{}{}",
            endpoint.to_json(),
            topics::LIST_SEPARATOR,
            topics::join_list(names)
        );
        self.notify_resolvers(topics::ADD_TOPICS, &payload).await;
    }

    async fn deregister_at_resolvers(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        self.notify_resolvers(topics::REMOVE_TOPICS, &topics::join_list(names))
            .await;
    }

    /// Failures are logged; a missing resolver never stops the broker.
    async fn notify_resolvers(&self, command: &str, payload: &str) {
        for resolver in &self.config.resolver_config_endpoints {
            match config_request(
                resolver,
                command,
                &self.config.name,
                payload,
                self.config.tcp_timeout,
            )
            .await
            {
                Ok(_) => tracing::debug!("{command} sent to resolver {resolver}"),
                Err(e) => tracing::warn!("{command} to resolver {resolver} failed: {e}"),
            }
        }
    }
}

async fn node_accept_loop(inner: Arc<BrokerInner>, listener: Listener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(Accept::Admitted(connection)) => {
                tokio::spawn(routing::serve_node(inner.clone(), connection, shutdown.clone()));
            }
            Ok(Accept::Rejected { .. }) => inner.metrics.rejected_connections.inc(),
            Err(e) => {
                tracing::warn!("node listener accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn config_accept_loop(inner: Arc<BrokerInner>, listener: Listener, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(Accept::Admitted(connection)) => {
                tokio::spawn(commands::serve_config(inner.clone(), connection));
            }
            Ok(Accept::Rejected { .. }) => inner.metrics.rejected_connections.inc(),
            Err(e) => {
                tracing::warn!("config listener accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
