use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::framing::{read_framed, write_framed};
use crate::{Endpoint, TransportConfig, TransportError};

/// A framed, full-duplex TCP connection.
///
/// Split it with [`Connection::into_split`] when one task reads while
/// others write.
#[derive(Debug)]
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
}

/// Receiving half of a [`Connection`].
#[derive(Debug)]
pub struct FrameReader {
    inner: OwnedReadHalf,
    peer: String,
    max_frame_size: usize,
}

/// Sending half of a [`Connection`].
#[derive(Debug)]
pub struct FrameWriter {
    inner: OwnedWriteHalf,
    peer: String,
}

impl Connection {
    pub(crate) fn from_stream(stream: TcpStream, peer: SocketAddr, max_frame_size: usize) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay on {peer} failed: {e}");
        }
        let peer = peer.to_string();
        let (read, write) = stream.into_split();
        Self {
            reader: FrameReader {
                inner: read,
                peer: peer.clone(),
                max_frame_size,
            },
            writer: FrameWriter { inner: write, peer },
        }
    }

    /// Remote `ip:port`.
    pub fn peer_addr(&self) -> &str {
        &self.reader.peer
    }

    pub async fn send(&mut self, frame: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        self.writer.send(frame, timeout).await
    }

    pub async fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, TransportError> {
        self.reader.receive(timeout).await
    }

    /// Send one frame and wait for the next inbound frame.
    pub async fn exchange(
        &mut self,
        frame: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.send(frame, timeout).await?;
        self.receive(non_zero(timeout)).await
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

impl FrameReader {
    pub fn peer_addr(&self) -> &str {
        &self.peer
    }

    /// Read the next frame. `None` waits indefinitely.
    pub async fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, TransportError> {
        let read = read_framed(&mut self.inner, self.max_frame_size, &self.peer);
        match timeout {
            None => read.await,
            Some(timeout) => tokio::time::timeout(timeout, read)
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "receive",
                    peer: self.peer.clone(),
                    timeout,
                })?,
        }
    }
}

impl FrameWriter {
    pub fn peer_addr(&self) -> &str {
        &self.peer
    }

    /// Write one frame. `Duration::ZERO` means no deadline.
    pub async fn send(&mut self, frame: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let peer = &self.peer;
        let write = write_framed(&mut self.inner, frame);
        let result = match non_zero(timeout) {
            None => write.await,
            Some(timeout) => tokio::time::timeout(timeout, write)
                .await
                .map_err(|_| TransportError::Timeout {
                    operation: "send",
                    peer: peer.clone(),
                    timeout,
                })?,
        };
        result.map_err(|source| TransportError::Send {
            peer: peer.clone(),
            source,
        })
    }

    /// Half-close the stream so the peer's next read sees EOF.
    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.inner
            .shutdown()
            .await
            .map_err(|source| TransportError::Send {
                peer: self.peer.clone(),
                source,
            })
    }
}

fn non_zero(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

/// Open a plain TCP connection to `endpoint`.
///
/// TLS endpoints are refused with [`TransportError::Unsupported`].
pub async fn dial(endpoint: &Endpoint, config: &TransportConfig) -> Result<Connection, TransportError> {
    if endpoint.requires_tls() {
        return Err(TransportError::Unsupported {
            address: endpoint.address.clone(),
            reason: "TLS endpoints are not supported by this transport".into(),
        });
    }

    let connect = TcpStream::connect(endpoint.address.as_str());
    let stream = match non_zero(config.connect_timeout) {
        None => connect.await,
        Some(timeout) => tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                peer: endpoint.address.clone(),
                timeout,
            })?,
    }
    .map_err(|source| TransportError::Connect {
        address: endpoint.address.clone(),
        source,
    })?;

    let peer = stream
        .peer_addr()
        .map_err(|source| TransportError::Connect {
            address: endpoint.address.clone(),
            source,
        })?;

    tracing::debug!("dialed {peer}");
    Ok(Connection::from_stream(stream, peer, config.max_frame_size))
}
