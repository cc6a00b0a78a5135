use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::config::MessageLimits;
use crate::error::TbusError;

/// The unit exchanged by resolvers, brokers and nodes.
///
/// Serialized as MessagePack. A message carries at most one of the two
/// sync tokens: a request token marks a sync request, a response token
/// marks the answer to one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    topic: String,
    origin: String,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
    sync_request_token: Option<String>,
    sync_response_token: Option<String>,
}

impl Message {
    /// Fire-and-forget message.
    pub fn new_async(
        topic: impl Into<String>,
        origin: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            origin: origin.into(),
            payload: payload.into(),
            sync_request_token: None,
            sync_response_token: None,
        }
    }

    /// Sync request correlated by `token`.
    pub fn new_sync(
        topic: impl Into<String>,
        origin: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            sync_request_token: Some(token.into()),
            ..Self::new_async(topic, origin, payload)
        }
    }

    /// Response to `request`, carrying its request token as response token.
    pub fn new_response(
        request: &Message,
        topic: impl Into<String>,
        origin: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            sync_response_token: request.sync_request_token.clone(),
            ..Self::new_async(topic, origin, payload)
        }
    }

    /// Build a message from raw parts. No validation is performed.
    pub fn from_parts(
        topic: impl Into<String>,
        origin: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        sync_request_token: Option<String>,
        sync_response_token: Option<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            origin: origin.into(),
            payload: payload.into(),
            sync_request_token,
            sync_response_token,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    pub fn sync_request_token(&self) -> Option<&str> {
        self.sync_request_token.as_deref()
    }

    pub fn sync_response_token(&self) -> Option<&str> {
        self.sync_response_token.as_deref()
    }

    pub fn is_sync_request(&self) -> bool {
        self.sync_request_token.is_some()
    }

    pub fn is_sync_response(&self) -> bool {
        self.sync_response_token.is_some()
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TbusError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TbusError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }

    /// Check shape and size limits.
    ///
    /// Responses may have an empty origin; everything else needs both a
    /// topic and an origin.
    pub fn validate(&self, limits: &MessageLimits) -> Result<(), TbusError> {
        if self.is_sync_request() && self.is_sync_response() {
            return Err(TbusError::invalid(
                "message is both a sync request and a sync response",
            ));
        }
        if self.topic.is_empty() {
            return Err(TbusError::invalid("empty topic"));
        }
        if self.origin.is_empty() && !self.is_sync_response() {
            return Err(TbusError::invalid("empty origin"));
        }
        if self.sync_request_token.as_deref() == Some("")
            || self.sync_response_token.as_deref() == Some("")
        {
            return Err(TbusError::invalid("empty sync token"));
        }

        check_size("topic", self.topic.len(), limits.max_topic_size)?;
        check_size("origin", self.origin.len(), limits.max_origin_size)?;
        check_size("payload", self.payload.len(), limits.max_payload_size)?;
        let token_len = self
            .sync_request_token
            .as_ref()
            .or(self.sync_response_token.as_ref())
            .map_or(0, String::len);
        check_size("sync token", token_len, limits.max_token_size)?;
        Ok(())
    }
}

fn check_size(field: &str, len: usize, max: usize) -> Result<(), TbusError> {
    if max > 0 && len > max {
        return Err(TbusError::invalid(format!(
            "{field} is {len} bytes, limit is {max}"
        )));
    }
    Ok(())
}

/// Fresh random sync token.
pub fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}
