//! tbus protocol layer.
//!
//! Topic-routed messaging on top of `tbus-transport`: a resolver maps
//! topics to brokers, brokers fan async messages out to subscribers and
//! route sync requests to the first responder, and nodes tie it together
//! behind `send_async` / `send_sync`.
//!
//! Wire format: MessagePack (compact binary), one message per frame.

pub mod broker;
pub mod config;
pub mod config_request;
pub mod error;
pub mod message;
pub mod metrics;
pub mod node;
pub mod resolver;
pub mod topics;

mod wire;

pub use broker::{Broker, TopicKind};
pub use config::{BrokerConfig, MessageLimits, NodeConfig, ResolverConfig, RESOLVER_ADDRESS_ENV};
pub use config_request::config_request;
pub use error::TbusError;
pub use message::{new_token, Message};
pub use metrics::{BrokerMetrics, NodeMetrics, ResolverMetrics};
pub use node::{AsyncHandler, Handler, Node, NodeBuilder, SyncHandler};
pub use resolver::{resolve, Resolver, TopicDirectory, RESOLVER_ORIGIN};

pub use tbus_transport::{AccessControl, AccessList, Endpoint, TransportError};
