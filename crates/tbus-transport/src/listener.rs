use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::access::{AccessControl, Rejection};
use crate::connection::Connection;
use crate::{TransportConfig, TransportError};

/// Outcome of one [`Listener::accept`] call.
#[derive(Debug)]
pub enum Accept {
    Admitted(Connection),
    /// The socket was closed without reading a byte.
    Rejected { peer: SocketAddr, reason: Rejection },
}

/// A TCP listener that checks every peer against its access lists before
/// handing out a [`Connection`].
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    access: AccessControl,
    max_frame_size: usize,
}

impl Listener {
    pub async fn bind(
        address: &str,
        access: AccessControl,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(address)
            .await
            .map_err(|source| TransportError::Bind {
                address: address.to_string(),
                source,
            })?;
        if let Ok(local) = inner.local_addr() {
            tracing::info!("listening on {local}");
        }
        Ok(Self {
            inner,
            access,
            max_frame_size: config.max_frame_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.local_addr().map_err(TransportError::Accept)
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub async fn accept(&self) -> Result<Accept, TransportError> {
        let (stream, peer) = self.inner.accept().await.map_err(TransportError::Accept)?;
        if let Err(reason) = self.access.check(&peer.ip()) {
            tracing::warn!("rejected connection from {peer}: {reason}");
            drop(stream);
            return Ok(Accept::Rejected { peer, reason });
        }
        Ok(Accept::Admitted(Connection::from_stream(
            stream,
            peer,
            self.max_frame_size,
        )))
    }
}
