//! Per-component traffic counters.
//!
//! Each struct serializes to a flat JSON object of `u64`s, which is what a
//! collector scraping `metrics()` expects.

use serde::Serialize;
use tbus_metrics::Counter;

#[derive(Debug, Default, Serialize)]
pub struct ResolverMetrics {
    pub resolution_requests: Counter,
    pub successful_resolutions: Counter,
    pub config_requests: Counter,
    pub rejected_connections: Counter,
    pub bytes_sent: Counter,
    pub bytes_received: Counter,
}

#[derive(Debug, Default, Serialize)]
pub struct BrokerMetrics {
    pub incoming_messages: Counter,
    pub outgoing_messages: Counter,
    pub config_requests: Counter,
    pub sync_requests_opened: Counter,
    pub sync_requests_timed_out: Counter,
    pub delivery_failures: Counter,
    pub rejected_connections: Counter,
    pub bytes_sent: Counter,
    pub bytes_received: Counter,
}

#[derive(Debug, Default, Serialize)]
pub struct NodeMetrics {
    pub async_messages_sent: Counter,
    pub sync_requests_sent: Counter,
    pub sync_responses_received: Counter,
    pub incoming_async_messages: Counter,
    pub incoming_sync_requests: Counter,
    pub outgoing_sync_responses: Counter,
    pub resolutions: Counter,
    pub reconnect_attempts: Counter,
    pub bytes_sent: Counter,
    pub bytes_received: Counter,
}
