//! Byte transports to the terminal
//!
//! The engine only needs connect/disconnect/write/read; serial and TCP links
//! implement the same trait so the session never knows which one it drives.

pub mod mock;
pub mod reconnect;
pub mod serial;
pub mod tcp;

pub use mock::{MockHandle, MockTransport};
pub use reconnect::{connect_with_backoff, ReconnectConfig};
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    Serial,
    Tcp,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => f.write_str("serial"),
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

/// Raw byte link to a terminal
#[async_trait]
pub trait ByteTransport: Send {
    fn kind(&self) -> ConnectionKind;

    /// Human-readable target, for logs
    fn describe(&self) -> String;

    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Copy whatever bytes have arrived into `buf` without waiting
    ///
    /// `Ok(0)` means nothing is available yet; callers poll.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn is_connected(&self) -> bool;
}

#[async_trait]
impl ByteTransport for Box<dyn ByteTransport> {
    fn kind(&self) -> ConnectionKind {
        (**self).kind()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    async fn connect(&mut self) -> Result<()> {
        (**self).connect().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect().await
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data).await
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf).await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
