use std::time::Duration;

use tbus_transport::{dial, Endpoint, TransportConfig};

use crate::error::TbusError;
use crate::message::Message;
use crate::topics;
use crate::wire;

/// Send one command to a resolver or broker config endpoint.
///
/// Opens a fresh connection, sends `topic` with `payload`, and waits for
/// the `success` reply. An `error` reply becomes [`TbusError::Remote`].
///
/// ```rust,no_run
/// use std::time::Duration;
/// use tbus_protocol::{config_request, topics};
/// use tbus_transport::Endpoint;
///
/// # async fn example() -> Result<(), tbus_protocol::TbusError> {
/// let resolver = Endpoint::new("127.0.0.1:60001");
/// config_request(&resolver, topics::ADD_DENY_RESOLVER, "admin", "10.0.0.9", Duration::from_secs(2)).await?;
/// # Ok(())
/// # }
/// ```
pub async fn config_request(
    endpoint: &Endpoint,
    topic: &str,
    origin: &str,
    payload: impl Into<Vec<u8>>,
    timeout: Duration,
) -> Result<Message, TbusError> {
    let transport = TransportConfig::new().connect_timeout(timeout);
    let mut connection = dial(endpoint, &transport).await?;
    let request = Message::new_async(topic, origin, payload);
    let reply = wire::exchange(&mut connection, &request, timeout).await?;

    match reply.topic() {
        topics::SUCCESS => Ok(reply),
        topics::ERROR => Err(TbusError::Remote(reply.payload_str().into_owned())),
        other => Err(TbusError::invalid(format!(
            "unexpected reply topic {other} to {topic}"
        ))),
    }
}
