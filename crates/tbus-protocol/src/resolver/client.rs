use std::time::Duration;

use tbus_transport::{dial, Endpoint, TransportConfig};

use crate::error::TbusError;
use crate::message::Message;
use crate::topics;
use crate::wire;

/// Ask the resolver at `resolver` which broker serves `topic`.
///
/// An `error` reply (unknown topic, rejected request) becomes
/// [`TbusError::Remote`].
pub async fn resolve(
    resolver: &Endpoint,
    topic: &str,
    origin: &str,
    transport: &TransportConfig,
    timeout: Duration,
) -> Result<Endpoint, TbusError> {
    let mut connection = dial(resolver, transport).await?;
    let request = Message::new_async(topics::RESOLVE, origin, topic);
    let reply = wire::exchange(&mut connection, &request, timeout).await?;

    match reply.topic() {
        topics::RESOLUTION => Ok(Endpoint::from_json(&reply.payload_str())?),
        topics::ERROR => Err(TbusError::Remote(reply.payload_str().into_owned())),
        other => Err(TbusError::invalid(format!(
            "unexpected reply topic {other} to resolve"
        ))),
    }
}
