//! tbus transport layer.
//!
//! Plain TCP with a 4-byte big-endian length prefix per frame, deadlines on
//! every send/receive, and listeners that filter peers through allow/deny
//! lists before a single byte is read.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tbus_transport::{dial, Accept, AccessControl, Endpoint, Listener, TransportConfig};
//!
//! # async fn example() -> Result<(), tbus_transport::TransportError> {
//! let config = TransportConfig::new();
//! let listener = Listener::bind("127.0.0.1:0", AccessControl::default(), &config).await?;
//! let endpoint = Endpoint::new(listener.local_addr()?.to_string());
//!
//! let mut client = dial(&endpoint, &config).await?;
//! client.send(b"hello", Duration::from_secs(1)).await?;
//!
//! if let Accept::Admitted(mut server) = listener.accept().await? {
//!     let frame = server.receive(Some(Duration::from_secs(1))).await?;
//!     assert_eq!(frame, b"hello");
//! }
//! # Ok(())
//! # }
//! ```

mod access;
mod config;
mod connection;
mod endpoint;
mod error;
mod framing;
mod listener;

pub use access::{AccessControl, AccessList, Rejection};
pub use config::TransportConfig;
pub use connection::{dial, Connection, FrameReader, FrameWriter};
pub use endpoint::Endpoint;
pub use error::TransportError;
pub use framing::FRAME_HEADER_LEN;
pub use listener::{Accept, Listener};
