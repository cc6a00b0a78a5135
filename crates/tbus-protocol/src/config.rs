//! Resolver, broker and node configuration.
//!
//! Every config is built in code with chained setters or loaded from JSON
//! with `from_json`. Durations are written in humantime form (`"5s"`,
//! `"250ms"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tbus_transport::{AccessControl, AccessList, Endpoint, TransportConfig};

use crate::error::TbusError;
use crate::topics;

/// Environment variable consulted for the default resolver address.
pub const RESOLVER_ADDRESS_ENV: &str = "TBUS_RESOLVER_ADDRESS";

const DEFAULT_RESOLVER_ADDRESS: &str = "127.0.0.1:60000";
const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

// ── Message limits ────────────────────────────────────────────────────

/// Size limits applied to inbound messages. 0 disables a limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageLimits {
    pub max_topic_size: usize,
    pub max_origin_size: usize,
    pub max_payload_size: usize,
    pub max_token_size: usize,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_topic_size: 255,
            max_origin_size: 255,
            max_payload_size: 0,
            max_token_size: 255,
        }
    }
}

impl MessageLimits {
    pub fn unlimited() -> Self {
        Self {
            max_topic_size: 0,
            max_origin_size: 0,
            max_payload_size: 0,
            max_token_size: 0,
        }
    }

    pub fn max_topic_size(mut self, bytes: usize) -> Self {
        self.max_topic_size = bytes;
        self
    }

    pub fn max_origin_size(mut self, bytes: usize) -> Self {
        self.max_origin_size = bytes;
        self
    }

    pub fn max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }

    pub fn max_token_size(mut self, bytes: usize) -> Self {
        self.max_token_size = bytes;
        self
    }
}

// ── Resolver ──────────────────────────────────────────────────────────

/// Configuration for a [`Resolver`](crate::Resolver).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Listener answering `resolve` requests.
    pub resolution_address: String,
    /// Listener accepting directory and access-list commands.
    pub config_address: String,
    pub allow_resolution: Vec<String>,
    pub deny_resolution: Vec<String>,
    pub allow_config: Vec<String>,
    pub deny_config: Vec<String>,
    /// Deadline for reading a request and writing its reply.
    #[serde(with = "humantime_serde")]
    pub tcp_timeout: Duration,
    pub max_frame_size: usize,
    pub limits: MessageLimits,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverConfig {
    pub fn new() -> Self {
        Self {
            resolution_address: DEFAULT_RESOLVER_ADDRESS.to_string(),
            config_address: "127.0.0.1:60001".to_string(),
            allow_resolution: Vec::new(),
            deny_resolution: Vec::new(),
            allow_config: Vec::new(),
            deny_config: Vec::new(),
            tcp_timeout: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            limits: MessageLimits::default(),
        }
    }

    pub fn from_json(data: &str) -> Result<Self, TbusError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn resolution_address(mut self, address: impl Into<String>) -> Self {
        self.resolution_address = address.into();
        self
    }

    pub fn config_address(mut self, address: impl Into<String>) -> Self {
        self.config_address = address.into();
        self
    }

    pub fn allow_config(mut self, addresses: Vec<String>) -> Self {
        self.allow_config = addresses;
        self
    }

    pub fn deny_resolution(mut self, addresses: Vec<String>) -> Self {
        self.deny_resolution = addresses;
        self
    }

    pub fn tcp_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_timeout = timeout;
        self
    }

    pub fn limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn validate(&self) -> Result<(), TbusError> {
        require_address("resolution_address", &self.resolution_address)?;
        require_address("config_address", &self.config_address)?;
        if self.resolution_address == self.config_address && !self.resolution_address.ends_with(":0") {
            return Err(TbusError::Config(
                "resolution and config listeners must use different addresses".into(),
            ));
        }
        require_timeout("tcp_timeout", self.tcp_timeout)
    }

    pub(crate) fn transport(&self) -> TransportConfig {
        transport_config(self.tcp_timeout, self.max_frame_size)
    }

    pub(crate) fn resolution_access(&self) -> AccessControl {
        access(&self.allow_resolution, &self.deny_resolution)
    }

    pub(crate) fn config_access(&self) -> AccessControl {
        access(&self.allow_config, &self.deny_config)
    }
}

// ── Broker ────────────────────────────────────────────────────────────

/// Configuration for a [`Broker`](crate::Broker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Origin used on every message the broker sends.
    pub name: String,
    /// Listener for node connections.
    pub node_address: String,
    /// Listener for config commands.
    pub config_address: String,
    /// Endpoint advertised to resolvers. Defaults to the bound node
    /// listener address.
    pub endpoint: Option<Endpoint>,
    pub allow_node: Vec<String>,
    pub deny_node: Vec<String>,
    pub allow_config: Vec<String>,
    pub deny_config: Vec<String>,
    /// Config endpoints of the resolvers this broker registers with.
    pub resolver_config_endpoints: Vec<Endpoint>,
    pub sync_topics: Vec<String>,
    pub async_topics: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub tcp_timeout: Duration,
    /// How long a sync request waits for the first subscriber response.
    #[serde(with = "humantime_serde")]
    pub sync_response_timeout: Duration,
    pub max_frame_size: usize,
    pub limits: MessageLimits,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new("broker")
    }
}

impl BrokerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_address: "127.0.0.1:60002".to_string(),
            config_address: "127.0.0.1:60003".to_string(),
            endpoint: None,
            allow_node: Vec::new(),
            deny_node: Vec::new(),
            allow_config: Vec::new(),
            deny_config: Vec::new(),
            resolver_config_endpoints: Vec::new(),
            sync_topics: Vec::new(),
            async_topics: Vec::new(),
            tcp_timeout: Duration::from_secs(5),
            sync_response_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            limits: MessageLimits::default(),
        }
    }

    pub fn from_json(data: &str) -> Result<Self, TbusError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn node_address(mut self, address: impl Into<String>) -> Self {
        self.node_address = address.into();
        self
    }

    pub fn config_address(mut self, address: impl Into<String>) -> Self {
        self.config_address = address.into();
        self
    }

    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn resolver(mut self, config_endpoint: Endpoint) -> Self {
        self.resolver_config_endpoints.push(config_endpoint);
        self
    }

    pub fn sync_topic(mut self, topic: impl Into<String>) -> Self {
        self.sync_topics.push(topic.into());
        self
    }

    pub fn async_topic(mut self, topic: impl Into<String>) -> Self {
        self.async_topics.push(topic.into());
        self
    }

    pub fn deny_node(mut self, addresses: Vec<String>) -> Self {
        self.deny_node = addresses;
        self
    }

    pub fn tcp_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_timeout = timeout;
        self
    }

    pub fn sync_response_timeout(mut self, timeout: Duration) -> Self {
        self.sync_response_timeout = timeout;
        self
    }

    pub fn limits(mut self, limits: MessageLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn validate(&self) -> Result<(), TbusError> {
        if self.name.is_empty() {
            return Err(TbusError::Config("broker name must not be empty".into()));
        }
        require_address("node_address", &self.node_address)?;
        require_address("config_address", &self.config_address)?;
        require_timeout("tcp_timeout", self.tcp_timeout)?;
        require_timeout("sync_response_timeout", self.sync_response_timeout)?;

        for topic in self.sync_topics.iter().chain(&self.async_topics) {
            if topic.is_empty() || topic.contains(topics::LIST_SEPARATOR) {
                return Err(TbusError::Config(format!("invalid topic name {topic:?}")));
            }
            if topics::is_reserved(topic) {
                return Err(TbusError::Config(format!("topic {topic} is reserved")));
            }
        }
        if let Some(topic) = self.sync_topics.iter().find(|t| self.async_topics.contains(t)) {
            return Err(TbusError::Config(format!(
                "topic {topic} is configured as both sync and async"
            )));
        }
        Ok(())
    }

    pub(crate) fn transport(&self) -> TransportConfig {
        transport_config(self.tcp_timeout, self.max_frame_size)
    }

    pub(crate) fn node_access(&self) -> AccessControl {
        access(&self.allow_node, &self.deny_node)
    }

    pub(crate) fn config_access(&self) -> AccessControl {
        access(&self.allow_config, &self.deny_config)
    }
}

// ── Node ──────────────────────────────────────────────────────────────

/// Configuration for a [`Node`](crate::Node).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique name; sent as origin and used for the broker handshake.
    pub name: String,
    /// Resolution endpoint of the resolver.
    pub resolver_endpoint: Endpoint,
    #[serde(with = "humantime_serde")]
    pub tcp_timeout: Duration,
    /// Default deadline for `subscribe` and `send_sync`.
    #[serde(with = "humantime_serde")]
    pub sync_response_timeout: Duration,
    /// Re-resolve cached topics after this long. `None` keeps a resolution
    /// until its connection drops.
    #[serde(with = "humantime_serde")]
    pub topic_resolution_lifetime: Option<Duration>,
    /// Pause between subscribe attempts.
    #[serde(with = "humantime_serde")]
    pub subscribe_delay: Duration,
    /// 0 retries forever.
    pub max_subscribe_attempts: u32,
    /// Run handlers one at a time, in arrival order.
    pub handle_messages_sequentially: bool,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Option<Duration>,
    pub max_frame_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new("node")
    }
}

impl NodeConfig {
    /// Defaults, with the resolver address taken from
    /// `TBUS_RESOLVER_ADDRESS` when set.
    pub fn new(name: impl Into<String>) -> Self {
        let resolver = std::env::var(RESOLVER_ADDRESS_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_RESOLVER_ADDRESS.to_string());
        Self {
            name: name.into(),
            resolver_endpoint: Endpoint::new(resolver),
            tcp_timeout: Duration::from_secs(5),
            sync_response_timeout: Duration::from_secs(10),
            topic_resolution_lifetime: None,
            subscribe_delay: Duration::from_secs(1),
            max_subscribe_attempts: 0,
            handle_messages_sequentially: false,
            heartbeat_interval: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn from_json(data: &str) -> Result<Self, TbusError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn resolver(mut self, endpoint: Endpoint) -> Self {
        self.resolver_endpoint = endpoint;
        self
    }

    pub fn tcp_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_timeout = timeout;
        self
    }

    pub fn sync_response_timeout(mut self, timeout: Duration) -> Self {
        self.sync_response_timeout = timeout;
        self
    }

    pub fn topic_resolution_lifetime(mut self, lifetime: Duration) -> Self {
        self.topic_resolution_lifetime = Some(lifetime);
        self
    }

    pub fn subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = delay;
        self
    }

    pub fn max_subscribe_attempts(mut self, attempts: u32) -> Self {
        self.max_subscribe_attempts = attempts;
        self
    }

    pub fn handle_messages_sequentially(mut self, sequential: bool) -> Self {
        self.handle_messages_sequentially = sequential;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn validate(&self) -> Result<(), TbusError> {
        if self.name.is_empty() {
            return Err(TbusError::Config("node name must not be empty".into()));
        }
        require_address("resolver_endpoint", &self.resolver_endpoint.address)?;
        require_timeout("tcp_timeout", self.tcp_timeout)?;
        require_timeout("sync_response_timeout", self.sync_response_timeout)?;
        if let Some(lifetime) = self.topic_resolution_lifetime {
            require_timeout("topic_resolution_lifetime", lifetime)?;
        }
        if let Some(interval) = self.heartbeat_interval {
            require_timeout("heartbeat_interval", interval)?;
        }
        Ok(())
    }

    pub(crate) fn transport(&self) -> TransportConfig {
        transport_config(self.tcp_timeout, self.max_frame_size)
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

fn require_address(field: &str, address: &str) -> Result<(), TbusError> {
    if address.trim().is_empty() {
        return Err(TbusError::Config(format!("{field} must not be empty")));
    }
    Ok(())
}

fn require_timeout(field: &str, timeout: Duration) -> Result<(), TbusError> {
    if timeout.is_zero() {
        return Err(TbusError::Config(format!("{field} must be non-zero")));
    }
    Ok(())
}

fn transport_config(timeout: Duration, max_frame_size: usize) -> TransportConfig {
    TransportConfig::new()
        .connect_timeout(timeout)
        .max_frame_size(max_frame_size)
}

fn access(allow: &[String], deny: &[String]) -> AccessControl {
    AccessControl::new(AccessList::new(allow.iter().cloned()), AccessList::new(deny.iter().cloned()))
}
