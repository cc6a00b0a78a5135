//! Topic directory service.
//!
//! A resolver runs two listeners. The resolution listener answers one
//! `resolve` request per connection with the endpoint of the broker that
//! serves the topic. The config listener accepts directory and
//! access-list commands from brokers and operators.

mod client;
mod directory;

pub use client::resolve;
pub use directory::TopicDirectory;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tbus_transport::{Accept, AccessControl, Connection, Endpoint, Listener};
use tokio_util::sync::CancellationToken;

use crate::config::ResolverConfig;
use crate::error::TbusError;
use crate::message::Message;
use crate::metrics::ResolverMetrics;
use crate::topics::{self, edit_list, require_list};

/// Origin of every reply a resolver sends.
pub const RESOLVER_ORIGIN: &str = "resolver";

/// Handle to a resolver. Cheap to clone.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    config: ResolverConfig,
    directory: Mutex<TopicDirectory>,
    resolution_access: AccessControl,
    config_access: AccessControl,
    metrics: ResolverMetrics,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: CancellationToken,
    resolution_addr: SocketAddr,
    config_addr: SocketAddr,
}

#[derive(Debug, Clone, Copy)]
enum Service {
    Resolution,
    Config,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Result<Self, TbusError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ResolverInner {
                resolution_access: config.resolution_access(),
                config_access: config.config_access(),
                config,
                directory: Mutex::new(TopicDirectory::new()),
                metrics: ResolverMetrics::default(),
                running: Mutex::new(None),
            }),
        })
    }

    /// Bind both listeners and start serving.
    pub async fn start(&self) -> Result<(), TbusError> {
        if self.is_running() {
            return Err(TbusError::AlreadyRunning);
        }
        let config = &self.inner.config;
        let transport = config.transport();
        let resolution = Listener::bind(
            &config.resolution_address,
            self.inner.resolution_access.clone(),
            &transport,
        )
        .await?;
        let admin = Listener::bind(
            &config.config_address,
            self.inner.config_access.clone(),
            &transport,
        )
        .await?;

        let shutdown = CancellationToken::new();
        let running = Running {
            shutdown: shutdown.clone(),
            resolution_addr: resolution.local_addr()?,
            config_addr: admin.local_addr()?,
        };
        {
            let mut slot = self.lock_running();
            if slot.is_some() {
                return Err(TbusError::AlreadyRunning);
            }
            tracing::info!(
                "resolver started (resolution {}, config {})",
                running.resolution_addr,
                running.config_addr
            );
            *slot = Some(running);
        }

        tokio::spawn(accept_loop(
            self.inner.clone(),
            resolution,
            Service::Resolution,
            shutdown.clone(),
        ));
        tokio::spawn(accept_loop(self.inner.clone(), admin, Service::Config, shutdown));
        Ok(())
    }

    /// Stop accepting connections. The directory is kept.
    pub fn stop(&self) -> Result<(), TbusError> {
        let running = self.lock_running().take().ok_or(TbusError::NotRunning)?;
        running.shutdown.cancel();
        tracing::info!("resolver stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Bound resolution listener, for nodes.
    pub fn resolution_endpoint(&self) -> Option<Endpoint> {
        self.lock_running()
            .as_ref()
            .map(|r| Endpoint::new(r.resolution_addr.to_string()))
    }

    /// Bound config listener, for brokers.
    pub fn config_endpoint(&self) -> Option<Endpoint> {
        self.lock_running()
            .as_ref()
            .map(|r| Endpoint::new(r.config_addr.to_string()))
    }

    pub fn register_topics<I, S>(&self, endpoint: &Endpoint, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.lock_directory().register(endpoint, topics);
    }

    pub fn deregister_topics<I, S>(&self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.inner.lock_directory().deregister(topics);
    }

    pub fn resolve(&self, topic: &str) -> Option<Endpoint> {
        self.inner.lock_directory().resolve(topic).cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        self.inner.lock_directory().topics()
    }

    pub fn metrics(&self) -> &ResolverMetrics {
        &self.inner.metrics
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

async fn accept_loop(
    inner: Arc<ResolverInner>,
    listener: Listener,
    service: Service,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok(Accept::Admitted(connection)) => {
                let inner = inner.clone();
                tokio::spawn(async move { inner.serve(service, connection).await });
            }
            Ok(Accept::Rejected { .. }) => inner.metrics.rejected_connections.inc(),
            Err(e) => {
                tracing::warn!("{service:?} listener accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    tracing::debug!("{service:?} listener closed");
}

impl ResolverInner {
    fn lock_directory(&self) -> std::sync::MutexGuard<'_, TopicDirectory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One request, one reply, then close.
    async fn serve(&self, service: Service, mut connection: Connection) {
        let timeout = self.config.tcp_timeout;
        let frame = match connection.receive(Some(timeout)).await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("no request from {}: {e}", connection.peer_addr());
                return;
            }
        };
        self.metrics.bytes_received.add(frame.len() as u64);

        let result = Message::from_bytes(&frame).and_then(|request| {
            self.check_request(&request)?;
            match service {
                Service::Resolution => self.handle_resolution(&request),
                Service::Config => self.handle_config(&request),
            }
        });
        let reply = result.unwrap_or_else(|e| {
            tracing::warn!("{service:?} request from {} failed: {e}", connection.peer_addr());
            Message::new_async(topics::ERROR, RESOLVER_ORIGIN, e.to_string())
        });

        match reply.to_bytes() {
            Ok(bytes) => match connection.send(&bytes, timeout).await {
                Ok(sent) => self.metrics.bytes_sent.add(sent as u64),
                Err(e) => tracing::debug!("reply to {} failed: {e}", connection.peer_addr()),
            },
            Err(e) => tracing::warn!("failed to encode reply: {e}"),
        }
    }

    fn check_request(&self, request: &Message) -> Result<(), TbusError> {
        request.validate(&self.config.limits)?;
        if request.is_sync_request() || request.is_sync_response() {
            return Err(TbusError::invalid("resolver requests must not carry sync tokens"));
        }
        Ok(())
    }

    fn handle_resolution(&self, request: &Message) -> Result<Message, TbusError> {
        self.metrics.resolution_requests.inc();
        if request.topic() != topics::RESOLVE {
            return Err(TbusError::UnknownTopic {
                topic: request.topic().to_string(),
            });
        }
        let topic = request.payload_str();
        let endpoint = self
            .lock_directory()
            .resolve(&topic)
            .cloned()
            .ok_or_else(|| TbusError::UnknownTopic {
                topic: topic.to_string(),
            })?;

        self.metrics.successful_resolutions.inc();
        tracing::debug!("resolved {topic} to {endpoint} for {}", request.origin());
        Ok(Message::new_async(
            topics::RESOLUTION,
            RESOLVER_ORIGIN,
            endpoint.to_json(),
        ))
    }

    fn handle_config(&self, request: &Message) -> Result<Message, TbusError> {
        self.metrics.config_requests.inc();
        let payload = request.payload_str();

        match request.topic() {
            topics::ADD_TOPICS => {
                let (endpoint, list) = payload
                    .split_once(topics::LIST_SEPARATOR)
                    .ok_or_else(|| TbusError::invalid("addTopics payload is endpoint|topic|..."))?;
                let endpoint = Endpoint::from_json(endpoint)?;
                let names = require_list(list)?;
                tracing::info!("{} registered {names:?} at {endpoint}", request.origin());
                self.lock_directory().register(&endpoint, names);
            }
            topics::REMOVE_TOPICS => {
                let names = require_list(&payload)?;
                tracing::info!("{} deregistered {names:?}", request.origin());
                self.lock_directory().deregister(names);
            }
            topics::ADD_ALLOW_RESOLVER => edit_list(&self.resolution_access.allow, &payload, true)?,
            topics::REMOVE_ALLOW_RESOLVER => edit_list(&self.resolution_access.allow, &payload, false)?,
            topics::ADD_DENY_RESOLVER => edit_list(&self.resolution_access.deny, &payload, true)?,
            topics::REMOVE_DENY_RESOLVER => edit_list(&self.resolution_access.deny, &payload, false)?,
            topics::ADD_ALLOW_CONFIG => edit_list(&self.config_access.allow, &payload, true)?,
            topics::REMOVE_ALLOW_CONFIG => edit_list(&self.config_access.allow, &payload, false)?,
            topics::ADD_DENY_CONFIG => edit_list(&self.config_access.deny, &payload, true)?,
            topics::REMOVE_DENY_CONFIG => edit_list(&self.config_access.deny, &payload, false)?,
            other => {
                return Err(TbusError::UnknownTopic {
                    topic: other.to_string(),
                })
            }
        }
        Ok(Message::new_async(topics::SUCCESS, RESOLVER_ORIGIN, ""))
    }
}
