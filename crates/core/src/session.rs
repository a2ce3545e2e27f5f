//! Transport session: the ENQ/ACK/EOT handshake state machine
//!
//! One exchange walks
//! `Idle → SendingEnq → AwaitingHandshakeAck → SendingCommand →
//! AwaitingCommandAck → AwaitingTerminalEnq → SendingResponseAck →
//! ReceivingResponse → SendingFinalAck → AwaitingEot → Idle`.
//! Any failure passes through `Aborting`: the `ABORT` token is sent on a best
//! effort basis and the original error is returned. Transport failures come
//! back as [`EcrError::Link`] carrying the state they happened in. Nothing is
//! retried here.
//!
//! All reads are polling loops with a per-step deadline, so a session never
//! blocks the runtime and can be cancelled between polls.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::commlog::{CommunicationLog, LogLevel, DEFAULT_LOG_CAPACITY};
use crate::error::HandshakeError;
use crate::protocol::frame::{describe_control, to_hex, FrameCodec, ABORT, ACK, ENQ, EOT};
use crate::transport::{connect_with_backoff, ByteTransport, ConnectionKind, ReconnectConfig};
use crate::{EcrError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    SendingEnq,
    AwaitingHandshakeAck,
    SendingCommand,
    AwaitingCommandAck,
    AwaitingTerminalEnq,
    SendingResponseAck,
    ReceivingResponse,
    SendingFinalAck,
    AwaitingEot,
    Aborting,
}

impl SessionState {
    /// States in which the terminal has not yet accepted the command
    pub fn before_command_accepted(self) -> bool {
        matches!(
            self,
            Self::SendingEnq
                | Self::AwaitingHandshakeAck
                | Self::SendingCommand
                | Self::AwaitingCommandAck
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-step deadlines and polling cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub enq_timeout_ms: u64,
    pub ack_timeout_ms: u64,
    /// Covers the terminal's ENQ and the response frame; includes the time
    /// the customer needs at the terminal
    pub response_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub log_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enq_timeout_ms: 3_000,
            ack_timeout_ms: 3_000,
            response_timeout_ms: 90_000,
            poll_interval_ms: 10,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl SessionConfig {
    fn enq_timeout(&self) -> Duration {
        Duration::from_millis(self.enq_timeout_ms)
    }

    fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Session over one transport, owned by the orchestrator
pub struct TransportSession<T: ByteTransport> {
    transport: T,
    config: SessionConfig,
    state: SessionState,
    pending: BytesMut,
    log: CommunicationLog,
    cancel: CancellationToken,
}

impl<T: ByteTransport> TransportSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let log = CommunicationLog::new(config.log_capacity);
        Self {
            transport,
            config,
            state: SessionState::Idle,
            pending: BytesMut::with_capacity(512),
            log,
            cancel: CancellationToken::new(),
        }
    }

    pub fn kind(&self) -> ConnectionKind {
        self.transport.kind()
    }

    pub fn is_live(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn log(&self) -> &CommunicationLog {
        &self.log
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Token that cancels the exchange in flight
    ///
    /// A cancelled exchange replaces the token, so fetch a fresh handle for
    /// every transaction.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn connect(&mut self, reconnect: &ReconnectConfig) -> Result<()> {
        if self.transport.is_connected() {
            return Ok(());
        }
        connect_with_backoff(&mut self.transport, reconnect).await?;
        self.record(LogLevel::Info, format!("Connected ({})", self.transport.describe()));
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.pending.clear();
        self.state = SessionState::Idle;
        self.transport.disconnect().await?;
        self.record(LogLevel::Info, format!("Disconnected ({})", self.transport.describe()));
        Ok(())
    }

    /// Run one full command exchange and return the verified response payload
    pub async fn exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if !self.transport.is_connected() {
            return Err(EcrError::NotConnected);
        }
        // a cancel requested while idle does not carry over
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        if !self.pending.is_empty() {
            tracing::debug!("Discarding {} stale bytes: {}", self.pending.len(), to_hex(&self.pending));
            self.pending.clear();
        }

        match self.run_exchange(frame).await {
            Ok(payload) => {
                self.transition(SessionState::Idle);
                Ok(payload)
            }
            Err(err) => {
                let err = err.on_link(self.state);
                self.record(LogLevel::Error, format!("Exchange failed: {}", err));
                self.transition(SessionState::Aborting);
                self.abort().await;
                if self.cancel.is_cancelled() {
                    self.cancel = CancellationToken::new();
                }
                self.transition(SessionState::Idle);
                Err(err)
            }
        }
    }

    /// Best-effort ABORT; a failure to send it is only logged
    pub async fn abort(&mut self) {
        if !self.transport.is_connected() {
            return;
        }
        match self.transport.write(ABORT).await {
            Ok(()) => self.record(LogLevel::Warn, "→ ABORT"),
            Err(e) => {
                tracing::warn!("Failed to send ABORT: {}", e);
                self.log.push(LogLevel::Error, format!("Failed to send ABORT: {}", e));
            }
        }
    }

    async fn run_exchange(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let enq_timeout = self.config.enq_timeout();
        let ack_timeout = self.config.ack_timeout();
        let response_timeout = self.config.response_timeout();

        self.transition(SessionState::SendingEnq);
        self.send_control(ENQ).await?;
        self.transition(SessionState::AwaitingHandshakeAck);
        self.expect_control(ACK, enq_timeout).await?;

        self.transition(SessionState::SendingCommand);
        self.transport.write(frame).await?;
        self.record(LogLevel::Info, format!("→ frame {}", to_hex(frame)));
        self.transition(SessionState::AwaitingCommandAck);
        self.expect_control(ACK, ack_timeout).await?;

        // role reversal: the terminal now asks to send
        self.transition(SessionState::AwaitingTerminalEnq);
        self.expect_control(ENQ, response_timeout).await?;
        self.transition(SessionState::SendingResponseAck);
        self.send_control(ACK).await?;

        self.transition(SessionState::ReceivingResponse);
        let raw = self.receive_frame(response_timeout).await?;
        self.record(LogLevel::Info, format!("← frame {}", to_hex(&raw)));

        self.transition(SessionState::SendingFinalAck);
        self.send_control(ACK).await?;
        self.transition(SessionState::AwaitingEot);
        match self.read_byte(ack_timeout).await? {
            Some(EOT) => self.record(LogLevel::Debug, "← EOT"),
            Some(other) => {
                return Err(HandshakeError::UnexpectedControl {
                    state: self.state,
                    expected: "EOT",
                    got: describe_control(other),
                }
                .into())
            }
            None => return Err(HandshakeError::EotMissing.into()),
        }

        FrameCodec::unwrap(&raw).map_err(|source| EcrError::Framing {
            source,
            raw_hex: to_hex(&raw),
        })
    }

    fn transition(&mut self, next: SessionState) {
        tracing::trace!("Session {} -> {}", self.state, next);
        self.state = next;
    }

    fn record(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{}", message);
        self.log.push(level, message);
    }

    async fn send_control(&mut self, byte: u8) -> Result<()> {
        self.transport.write(&[byte]).await?;
        self.record(LogLevel::Debug, format!("→ {}", describe_control(byte)));
        Ok(())
    }

    async fn expect_control(&mut self, expected: u8, timeout: Duration) -> Result<()> {
        match self.read_byte(timeout).await? {
            Some(byte) if byte == expected => {
                self.record(LogLevel::Debug, format!("← {}", describe_control(byte)));
                Ok(())
            }
            Some(other) => Err(HandshakeError::UnexpectedControl {
                state: self.state,
                expected: control_name(expected),
                got: describe_control(other),
            }
            .into()),
            None => Err(HandshakeError::Timeout {
                state: self.state,
                waited_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(HandshakeError::Cancelled { state: self.state }.into());
        }
        Ok(())
    }

    /// Move whatever the transport has into the pending buffer
    async fn fill_pending(&mut self) -> Result<usize> {
        let mut buf = [0u8; 256];
        let n = self.transport.read(&mut buf).await?;
        if n > 0 {
            self.pending.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }

    /// One byte within `timeout`, `None` on timeout
    async fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending.has_remaining() {
                return Ok(Some(self.pending.get_u8()));
            }
            self.check_cancelled()?;
            if self.fill_pending().await? > 0 {
                continue;
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    /// Accumulate until STX…ETX+LRC is complete; leftover bytes stay pending
    async fn receive_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(range) = FrameCodec::find_complete_frame(&self.pending) {
                if range.start > 0 {
                    tracing::debug!("Skipping {} bytes before STX", range.start);
                }
                let frame = self.pending.split_to(range.end);
                return Ok(frame[range.start..].to_vec());
            }
            self.check_cancelled()?;
            if self.fill_pending().await? > 0 {
                continue;
            }
            if Instant::now() >= deadline {
                return Err(HandshakeError::ResponseTimeout {
                    waited_ms: timeout.as_millis() as u64,
                }
                .into());
            }
            sleep(self.config.poll_interval()).await;
        }
    }
}

fn control_name(byte: u8) -> &'static str {
    match byte {
        ACK => "ACK",
        ENQ => "ENQ",
        EOT => "EOT",
        _ => "control byte",
    }
}
