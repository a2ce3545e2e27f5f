//! Scripted transport for tests and offline runs
//!
//! Every write except the `ABORT` token consumes the next scripted reaction
//! and queues its bytes as inbound data. `script_exchange` queues the four
//! reactions of one well-behaved terminal conversation.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ByteTransport, ConnectionKind};
use crate::protocol::frame::{FrameCodec, ABORT, ACK, ENQ, EOT, STX};
use crate::{EcrError, Result};

#[derive(Debug, Default)]
struct MockState {
    inbound: VecDeque<u8>,
    reactions: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    failed_connects_left: usize,
    connect_attempts: usize,
    drop_after_writes: Option<usize>,
    link_dropped: bool,
    fail_next_abort: bool,
}

/// Shared view of a mock transport, kept by the test after the transport has
/// moved into a session
#[derive(Debug, Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        // poisoning only happens if a test already panicked
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bytes the terminal sends in reply to the next write
    pub fn script(&self, reaction: impl Into<Vec<u8>>) -> &Self {
        self.lock().reactions.push_back(reaction.into());
        self
    }

    /// One complete conversation answering with `payload`
    pub fn script_exchange(&self, payload: impl AsRef<[u8]>) -> &Self {
        self.script(vec![ACK])
            .script(vec![ACK, ENQ])
            .script(FrameCodec::wrap(payload.as_ref()))
            .script(vec![EOT])
    }

    /// Bytes available immediately, without a write
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.lock().inbound.extend(bytes);
    }

    /// Make the next `count` connects fail
    pub fn fail_connects(&self, count: usize) {
        self.lock().failed_connects_left = count;
    }

    /// Close the link once `count` writes have been made; the last write's
    /// reaction is still delivered
    pub fn drop_link_after_writes(&self, count: usize) {
        self.lock().drop_after_writes = Some(count);
    }

    /// Make the next `ABORT` write fail
    pub fn fail_next_abort(&self) {
        self.lock().fail_next_abort = true;
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.lock().writes.clone()
    }

    pub fn abort_count(&self) -> usize {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.as_slice() == ABORT)
            .count()
    }

    /// Payloads of every frame written, in order
    pub fn sent_payloads(&self) -> Vec<String> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.first() == Some(&STX))
            .filter_map(|w| FrameCodec::unwrap(w).ok())
            .map(|p| String::from_utf8_lossy(&p).into_owned())
            .collect()
    }

    pub fn pending_reactions(&self) -> usize {
        self.lock().reactions.len()
    }
}

pub struct MockTransport {
    handle: MockHandle,
    connected: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            handle: MockHandle::default(),
            connected: false,
        }
    }

    /// Already connected mock, for tests that skip `connect`
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::new()
        }
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ByteTransport for MockTransport {
    fn kind(&self) -> ConnectionKind {
        ConnectionKind::Serial
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.handle.lock();
        state.connect_attempts += 1;
        if state.failed_connects_left > 0 {
            state.failed_connects_left -= 1;
            return Err(EcrError::Connection("mock connect refused".into()));
        }
        state.drop_after_writes = None;
        state.link_dropped = false;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(EcrError::NotConnected);
        }
        let mut state = self.handle.lock();
        if data == ABORT && state.fail_next_abort {
            state.fail_next_abort = false;
            let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "mock write failed");
            return Err(err.into());
        }
        state.writes.push(data.to_vec());
        if data != ABORT {
            if let Some(reaction) = state.reactions.pop_front() {
                state.inbound.extend(reaction);
            }
        }
        let written = state.writes.len();
        if state.drop_after_writes.is_some_and(|n| written >= n) {
            state.link_dropped = true;
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.connected {
            return Err(EcrError::NotConnected);
        }
        let mut state = self.handle.lock();
        if state.link_dropped && state.inbound.is_empty() {
            drop(state);
            self.connected = false;
            return Err(EcrError::Connection("mock peer closed the connection".into()));
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reactions_follow_writes() {
        let mut transport = MockTransport::connected();
        let handle = transport.handle();
        handle.script(vec![ACK]);

        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);
        transport.write(&[ENQ]).await.unwrap();
        assert_eq!(transport.read(&mut buf).await.unwrap(), 1);
        assert_eq!(buf[0], ACK);
    }

    #[tokio::test]
    async fn test_abort_does_not_consume_reaction() {
        let mut transport = MockTransport::connected();
        let handle = transport.handle();
        handle.script(vec![ACK]);
        transport.write(ABORT).await.unwrap();
        assert_eq!(handle.pending_reactions(), 1);
        assert_eq!(handle.abort_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_mock_rejects_io() {
        let mut transport = MockTransport::new();
        assert!(matches!(
            transport.write(&[ENQ]).await,
            Err(EcrError::NotConnected)
        ));
        transport.connect().await.unwrap();
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_dropped_link_drains_then_closes() {
        let mut transport = MockTransport::connected();
        let handle = transport.handle();
        handle.drop_link_after_writes(1);
        handle.script(vec![ACK]);
        transport.write(&[ENQ]).await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(transport.read(&mut buf).await.unwrap(), 1);
        assert!(matches!(
            transport.read(&mut buf).await,
            Err(EcrError::Connection(_))
        ));
        assert!(!transport.is_connected());

        transport.connect().await.unwrap();
        assert_eq!(transport.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_connects() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        handle.fail_connects(1);
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert_eq!(handle.connect_attempts(), 2);
    }
}
