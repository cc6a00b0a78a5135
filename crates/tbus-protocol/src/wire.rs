use std::time::Duration;

use tbus_transport::{Connection, FrameReader, FrameWriter};

use crate::error::TbusError;
use crate::message::Message;

/// Encode and write one message. Returns bytes on the wire.
pub(crate) async fn write_message(
    writer: &mut FrameWriter,
    message: &Message,
    timeout: Duration,
) -> Result<usize, TbusError> {
    let bytes = message.to_bytes()?;
    Ok(writer.send(&bytes, timeout).await?)
}

/// Read and decode one message. Returns the message and its frame size.
pub(crate) async fn read_message(
    reader: &mut FrameReader,
    timeout: Option<Duration>,
) -> Result<(Message, usize), TbusError> {
    let frame = reader.receive(timeout).await?;
    let message = Message::from_bytes(&frame)?;
    Ok((message, frame.len()))
}

/// One request, one reply, over an unsplit connection.
pub(crate) async fn exchange(
    connection: &mut Connection,
    message: &Message,
    timeout: Duration,
) -> Result<Message, TbusError> {
    let frame = connection.exchange(&message.to_bytes()?, timeout).await?;
    Message::from_bytes(&frame)
}
