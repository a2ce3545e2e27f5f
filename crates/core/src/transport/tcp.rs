//! TCP link for LAN-attached terminals

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::{ByteTransport, ConnectionKind};
use crate::{EcrError, Result};

pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
            stream: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(EcrError::NotConnected)
    }
}

#[async_trait]
impl ByteTransport for TcpTransport {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Tcp
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.address)
    }

    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                EcrError::Connection(format!(
                    "Connecting to {} timed out after {:?}",
                    self.address, self.connect_timeout
                ))
            })??;
        stream.set_nodelay(true)?;
        tracing::debug!("Connected to {}", self.address);
        self.stream = Some(stream);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Shutdown of {} failed: {}", self.address, e);
            }
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream()?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let result = self.stream()?.try_read(buf);
        match result {
            Ok(0) if !buf.is_empty() => {
                self.stream = None;
                Err(EcrError::Connection(format!(
                    "{} closed the connection",
                    self.address
                )))
            }
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_roundtrip_with_polling_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&[0x06]).await.unwrap();
            buf[0]
        });

        let mut transport = TcpTransport::new(addr.to_string());
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        transport.write(&[0x05]).await.unwrap();

        let mut buf = [0u8; 8];
        let mut n = 0;
        for _ in 0..200 {
            n = transport.read(&mut buf).await.unwrap();
            if n > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(&buf[..n], &[0x06]);
        assert_eq!(server.await.unwrap(), 0x05);

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_write_without_connect_fails() {
        let mut transport = TcpTransport::new("127.0.0.1:1");
        assert!(matches!(
            transport.write(b"x").await,
            Err(EcrError::NotConnected)
        ));
    }
}
