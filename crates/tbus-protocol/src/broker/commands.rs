use std::sync::Arc;

use tbus_transport::Connection;

use super::state::TopicKind;
use super::BrokerInner;
use crate::error::TbusError;
use crate::message::Message;
use crate::topics::{self, edit_list, require_list};

/// Serve one config command, reply `success` or `error`, then close.
pub(super) async fn serve_config(inner: Arc<BrokerInner>, mut connection: Connection) {
    let timeout = inner.config.tcp_timeout;
    let frame = match connection.receive(Some(timeout)).await {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!("no command from {}: {e}", connection.peer_addr());
            return;
        }
    };
    inner.metrics.config_requests.inc();
    inner.metrics.bytes_received.add(frame.len() as u64);

    let outcome = match Message::from_bytes(&frame) {
        Ok(request) => inner.apply_command(&request).await,
        Err(e) => Err(e),
    };
    let reply = match outcome {
        Ok(()) => Message::new_async(topics::SUCCESS, &inner.config.name, ""),
        Err(e) => {
            tracing::warn!("config command from {} failed: {e}", connection.peer_addr());
            Message::new_async(topics::ERROR, &inner.config.name, e.to_string())
        }
    };

    let sent = match reply.to_bytes() {
        Ok(bytes) => connection.send(&bytes, timeout).await.map_err(TbusError::from),
        Err(e) => Err(e),
    };
    match sent {
        Ok(bytes) => inner.metrics.bytes_sent.add(bytes as u64),
        Err(e) => tracing::debug!("config reply to {} failed: {e}", connection.peer_addr()),
    }
}

impl BrokerInner {
    async fn apply_command(&self, request: &Message) -> Result<(), TbusError> {
        request.validate(&self.config.limits)?;
        if request.is_sync_request() || request.is_sync_response() {
            return Err(TbusError::invalid("config commands must not carry sync tokens"));
        }
        let payload = request.payload_str();
        tracing::debug!("config command {} from {}", request.topic(), request.origin());

        match request.topic() {
            topics::ADD_SYNC_TOPICS => {
                self.add_topics(TopicKind::Sync, require_list(&payload)?).await;
            }
            topics::REMOVE_SYNC_TOPICS => {
                self.remove_topics(TopicKind::Sync, require_list(&payload)?).await;
            }
            topics::ADD_ASYNC_TOPICS => {
                self.add_topics(TopicKind::Async, require_list(&payload)?).await;
            }
            topics::REMOVE_ASYNC_TOPICS => {
                self.remove_topics(TopicKind::Async, require_list(&payload)?).await;
            }
            topics::ADD_ALLOW_NODE => edit_list(&self.node_access.allow, &payload, true)?,
            topics::REMOVE_ALLOW_NODE => edit_list(&self.node_access.allow, &payload, false)?,
            topics::ADD_DENY_NODE => edit_list(&self.node_access.deny, &payload, true)?,
            topics::REMOVE_DENY_NODE => edit_list(&self.node_access.deny, &payload, false)?,
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
        Ok(())
    }
}
