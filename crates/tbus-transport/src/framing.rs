use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::TransportError;

/// Size of the big-endian length prefix in front of every frame.
pub const FRAME_HEADER_LEN: usize = 4;

/// Write one length-prefixed frame. Returns the bytes put on the wire.
pub(crate) async fn write_framed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> std::io::Result<usize> {
    let len = u32::try_from(data.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds u32"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(FRAME_HEADER_LEN + data.len())
}

/// Read one length-prefixed frame, refusing anything above `max_size`
/// (0 = unlimited).
pub(crate) async fn read_framed<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
    peer: &str,
) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| receive_error(e, peer))?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if max_size > 0 && len > max_size {
        return Err(TransportError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| receive_error(e, peer))?;

    Ok(buf)
}

fn receive_error(e: std::io::Error, peer: &str) -> TransportError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => TransportError::Closed {
            peer: peer.to_string(),
        },
        _ => TransportError::Receive {
            peer: peer.to_string(),
            source: e,
        },
    }
}
