//! Serial link (RS-232 / USB CDC) via the serialport crate
//!
//! The serialport handle is blocking. Opening, writing and reading pending
//! bytes run on the blocking pool; idle polls only ask the driver how many
//! bytes are queued. A dropped I/O future loses the port handle, which shows
//! up as a closed link.

use async_trait::async_trait;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::time::Duration;

use super::{ByteTransport, ConnectionKind};
use crate::{EcrError, Result};

/// Default line speed for ECR terminals
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Serial transport, 8N1 without flow control
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    read_timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            read_timeout: Duration::from_millis(5),
            port: None,
        }
    }

    /// Upper bound for a single blocking read once bytes are pending
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(EcrError::NotConnected)
    }

    /// Run blocking port I/O on the blocking pool, then hand the port back
    async fn blocking<R, F>(&mut self, op: F) -> Result<R>
    where
        F: FnOnce(&mut Box<dyn SerialPort>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut port = self.port.take().ok_or(EcrError::NotConnected)?;
        let (port, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut port);
            (port, result)
        })
        .await
        .map_err(task_failed)?;
        self.port = Some(port);
        result
    }
}

fn task_failed(err: tokio::task::JoinError) -> EcrError {
    EcrError::Connection(format!("Serial I/O task failed: {}", err))
}

#[async_trait]
impl ByteTransport for SerialTransport {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Serial
    }

    fn describe(&self) -> String {
        format!("serial {} @ {} baud", self.path, self.baud_rate)
    }

    async fn connect(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        tracing::debug!("Opening {}", self.describe());
        let builder = serialport::new(&self.path, self.baud_rate)
            .timeout(self.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None);
        let port = tokio::task::spawn_blocking(move || builder.open())
            .await
            .map_err(task_failed)??;
        self.port = Some(port);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            tracing::debug!("Closed {}", self.describe());
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.blocking(move |port| {
            port.write_all(&data)?;
            port.flush()?;
            Ok(())
        })
        .await
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let pending = self.port()?.bytes_to_read()? as usize;
        if pending == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = pending.min(buf.len());
        let chunk = self
            .blocking(move |port| {
                let mut chunk = vec![0u8; len];
                match port.read(&mut chunk) {
                    Ok(n) => chunk.truncate(n),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => chunk.clear(),
                    Err(e) => return Err(e.into()),
                }
                Ok(chunk)
            })
            .await?;
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unopened_port_is_not_connected() {
        let mut transport = SerialTransport::new("/dev/ttyECR-missing", DEFAULT_BAUD_RATE);
        assert!(!transport.is_connected());
        assert_eq!(transport.kind(), ConnectionKind::Serial);
        assert!(matches!(
            transport.write(b"x").await,
            Err(EcrError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_missing_port_fails_to_open() {
        let mut transport = SerialTransport::new("/dev/ttyECR-missing", DEFAULT_BAUD_RATE);
        assert!(transport.connect().await.is_err());
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_describe() {
        let transport = SerialTransport::new("COM3", 115_200);
        assert_eq!(transport.describe(), "serial COM3 @ 115200 baud");
        assert_eq!(transport.path(), "COM3");
    }
}
