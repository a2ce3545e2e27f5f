//! Transaction orchestration
//!
//! [`EcrClient`] owns the transport session and turns business requests into
//! exchanges: encode, run the handshake, decode, record. Split payments and
//! partial refunds live in their own modules on top of
//! [`EcrClient::execute`].

pub mod ledger;
pub mod refund;
pub mod split;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::commlog::CommunicationLog;
use crate::config::EcrConfig;
use crate::protocol::{decode, encode_frame, Command, ResponseRecord, TransactionFamily};
use crate::session::{SessionState, TransportSession};
use crate::store::KeyValueStore;
use crate::transport::{ByteTransport, ReconnectConfig};
use crate::{EcrError, Result};

pub use ledger::{Ledger, TransactionRecord};
pub use refund::{PartialRefundOutcome, PartialRefundRecord, PartialRefundRequest};
pub use split::{
    LegOutcome, PaymentMethod, ReversalOutcome, SplitLeg, SplitLegRequest, SplitPaymentTransaction,
    SplitPlan, SplitStatus,
};

/// Whole-exchange retry for failures before the terminal accepted the command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Clears the in-flight flag when the exchange ends, however it ends
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn set(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct EcrClient<T: ByteTransport> {
    session: TransportSession<T>,
    retry: RetryPolicy,
    reconnect: ReconnectConfig,
    ledger: Option<Ledger>,
    in_flight: Arc<AtomicBool>,
}

impl<T: ByteTransport> EcrClient<T> {
    pub fn new(transport: T, config: &EcrConfig) -> Self {
        Self {
            session: TransportSession::new(transport, config.session.clone()),
            retry: config.retry.clone(),
            reconnect: config.reconnect.clone(),
            ledger: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record every decoded transaction, split payment and refund in `store`
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.ledger = Some(Ledger::new(store));
        self
    }

    pub fn ledger(&self) -> Option<&Ledger> {
        self.ledger.as_ref()
    }

    /// Set while an exchange is running; the device monitor pauses on it
    pub fn in_flight_flag(&self) -> Arc<AtomicBool> {
        self.in_flight.clone()
    }

    /// Publish in-flight state on an existing flag, e.g. one a running
    /// monitor already watches
    pub fn share_in_flight(mut self, flag: Arc<AtomicBool>) -> Self {
        self.in_flight = flag;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_live()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn log(&self) -> &CommunicationLog {
        self.session.log()
    }

    pub fn cancel_handle(&self) -> CancellationToken {
        self.session.cancel_handle()
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.session.connect(&self.reconnect).await
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.session.disconnect().await
    }

    /// Send ABORT outside of an exchange
    pub async fn abort(&mut self) {
        self.session.abort().await;
    }

    /// Run one transaction with retry
    ///
    /// A decline is returned as an unapproved record, not as an error.
    pub async fn execute(&mut self, command: &Command) -> Result<ResponseRecord> {
        self.run(command, true).await
    }

    pub(crate) async fn run(&mut self, command: &Command, retry: bool) -> Result<ResponseRecord> {
        let family = command.family;
        let frame = encode_frame(command).map_err(|e| EcrError::from(e).in_family(family))?;

        let payload = {
            let _guard = InFlightGuard::set(&self.in_flight);
            self.exchange_with_retry(family, &frame, retry)
                .await
                .map_err(|e| e.in_family(family))?
        };

        let response = decode(&payload).map_err(|e| e.in_family(family))?;
        if response.family != family {
            tracing::warn!("{} answered with a {} response", family, response.family);
        }

        if response.is_approved {
            tracing::info!(
                "{} approved: status {} trace {}",
                family,
                response.status_code,
                response.trace_number.as_deref().unwrap_or("-")
            );
        } else {
            tracing::warn!(
                "{} declined: {} ({})",
                family,
                response.status_code,
                response.status_description
            );
        }

        if let Some(ledger) = &self.ledger {
            match ledger
                .record_transaction(&response, command.amount, &command.host)
                .await
            {
                Ok(record) => tracing::info!("Recorded {} as {}", family, record.id),
                Err(e) => tracing::error!("Failed to record {} in the ledger: {}", family, e),
            }
        }

        Ok(response)
    }

    async fn exchange_with_retry(
        &mut self,
        family: TransactionFamily,
        frame: &[u8],
        retry: bool,
    ) -> Result<Vec<u8>> {
        let max_attempts = if retry { self.retry.max_attempts.max(1) } else { 1 };
        let backoff = Duration::from_millis(self.retry.backoff_ms);
        let mut attempt = 1;

        loop {
            match self.session.exchange(frame).await {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    tracing::warn!(
                        "{} attempt {}/{} failed: {}, retrying in {:?}",
                        family,
                        attempt,
                        max_attempts,
                        e,
                        backoff
                    );
                    sleep(backoff).await;
                    attempt += 1;
                    if !self.session.is_live() {
                        self.session.connect(&self.reconnect).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn sale(&mut self, host: &str, amount: u64) -> Result<ResponseRecord> {
        self.execute(&Command::sale(host, amount)).await
    }

    pub async fn void(&mut self, host: &str, amount: u64, trace_number: &str) -> Result<ResponseRecord> {
        self.execute(&Command::void(host, amount, trace_number)).await
    }

    pub async fn refund(&mut self, host: &str, amount: u64) -> Result<ResponseRecord> {
        self.execute(&Command::refund(host, amount)).await
    }

    pub async fn settlement(&mut self, host: &str) -> Result<ResponseRecord> {
        self.execute(&Command::settlement(host)).await
    }

    pub async fn echo_test(&mut self) -> Result<ResponseRecord> {
        self.execute(&Command::echo_test()).await
    }

    pub async fn wallet_sale(&mut self, host: &str, amount: u64, qr_code_id: &str) -> Result<ResponseRecord> {
        self.execute(&Command::wallet_sale(host, amount, qr_code_id)).await
    }

    pub async fn read_card(&mut self) -> Result<ResponseRecord> {
        self.execute(&Command::read_card()).await
    }

    pub async fn scan_qr(&mut self, qr_code_id: &str) -> Result<ResponseRecord> {
        self.execute(&Command::scan_qr(qr_code_id)).await
    }

    pub async fn transaction_status(&mut self, host: &str, trace_number: &str) -> Result<ResponseRecord> {
        self.execute(&Command::transaction_status(host, trace_number)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{HandshakeError, ValidationError};
    use crate::protocol::frame::{ACK, ENQ, NAK};
    use crate::protocol::response::tests::card_payload;
    use crate::store::MemoryStore;
    use crate::transport::{MockHandle, MockTransport};

    pub(crate) fn client() -> (EcrClient<MockTransport>, MockHandle) {
        let transport = MockTransport::connected();
        let handle = transport.handle();
        (EcrClient::new(transport, &EcrConfig::default()), handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sale_approved_and_recorded() {
        let (client, handle) = client();
        let mut client = client.with_store(Arc::new(MemoryStore::new()));
        handle.script_exchange(card_payload("R200", "00", "000123", 1099));

        let response = client.sale("01", 1099).await.unwrap();
        assert!(response.is_approved);
        assert_eq!(handle.sent_payloads()[0], format!("C20001000000001099{}", " ".repeat(24)));
        assert!(!client.in_flight_flag().load(Ordering::SeqCst));

        let records = client.ledger().unwrap().transactions().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].trace_number.as_deref(), Some("000123"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_test_approved_with_any_status() {
        let (mut client, handle) = client();
        handle.script_exchange("R902ZZTID00001");

        let response = client.echo_test().await.unwrap();
        assert!(response.is_approved);
        assert_eq!(response.family, TransactionFamily::EchoTest);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decline_is_not_an_error() {
        let (mut client, handle) = client();
        handle.script_exchange(card_payload("R200", "51", "000124", 500));

        let response = client.sale("01", 500).await.unwrap();
        assert!(!response.is_approved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_command_never_reaches_transport() {
        let (mut client, handle) = client();
        let err = client.sale("1", 100).await.unwrap_err();
        assert!(matches!(
            err.root(),
            EcrError::Validation(ValidationError::Field { field: "host number", .. })
        ));
        assert!(handle.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_when_handshake_is_refused() {
        let (mut client, handle) = client();
        handle.script(vec![NAK]);
        handle.script_exchange(card_payload("R200", "00", "000125", 100));

        let response = client.sale("01", 100).await.unwrap();
        assert!(response.is_approved);
        assert_eq!(handle.abort_count(), 1);
        assert_eq!(handle.sent_payloads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let (mut client, handle) = client();
        for _ in 0..3 {
            handle.script(vec![NAK]);
        }

        let err = client.sale("01", 100).await.unwrap_err();
        assert!(matches!(err, EcrError::Transaction { family: TransactionFamily::Sale, .. }));
        assert_eq!(handle.abort_count(), 3);
        assert_eq!(handle.writes().iter().filter(|w| w.as_slice() == [ENQ]).count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_after_command_accepted() {
        let (mut client, handle) = client();
        // terminal accepts the command, then never asks to send the response
        handle.script(vec![ACK]).script(vec![ACK]);

        let err = client.sale("01", 100).await.unwrap_err();
        assert!(matches!(
            err.root(),
            EcrError::Handshake(HandshakeError::Timeout {
                state: SessionState::AwaitingTerminalEnq,
                ..
            })
        ));
        assert_eq!(handle.sent_payloads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_after_command_accepted_is_not_resent() {
        let (mut client, handle) = client();
        handle.script(vec![ACK]).script(vec![ACK]);
        handle.drop_link_after_writes(2);

        let err = client.sale("01", 100).await.unwrap_err();
        assert!(matches!(
            err.root(),
            EcrError::Link {
                state: SessionState::AwaitingTerminalEnq,
                ..
            }
        ));
        assert_eq!(handle.sent_payloads().len(), 1);
        assert_eq!(handle.connect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_lost_before_command_accepted_reconnects_and_retries() {
        let (mut client, handle) = client();
        handle.script(vec![]);
        handle.drop_link_after_writes(1);
        handle.script_exchange(card_payload("R200", "00", "000126", 100));

        let response = client.sale("01", 100).await.unwrap();
        assert!(response.is_approved);
        assert_eq!(handle.connect_attempts(), 1);
        assert_eq!(handle.sent_payloads().len(), 1);
    }

    #[tokio::test]
    async fn test_tcp_terminal_closing_after_ack_gets_one_frame() {
        use crate::protocol::frame::ETX;
        use crate::transport::TcpTransport;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let terminal = tokio::spawn(async move {
            let mut frames = 0;
            let mut accepted =
                tokio::time::timeout(Duration::from_secs(2), listener.accept()).await;
            while let Ok(Ok((mut socket, _))) = accepted {
                let mut byte = [0u8; 1];
                socket.read_exact(&mut byte).await.unwrap();
                socket.write_all(&[ACK]).await.unwrap();
                // command frame up to ETX, then its LRC
                loop {
                    socket.read_exact(&mut byte).await.unwrap();
                    if byte[0] == ETX {
                        socket.read_exact(&mut byte).await.unwrap();
                        break;
                    }
                }
                frames += 1;
                socket.write_all(&[ACK]).await.unwrap();
                drop(socket);
                accepted = tokio::time::timeout(Duration::from_secs(2), listener.accept()).await;
            }
            frames
        });

        let mut client = EcrClient::new(TcpTransport::new(addr.to_string()), &EcrConfig::default());
        client.connect().await.unwrap();
        let err = client.sale("01", 100).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(matches!(err.root(), EcrError::Link { .. }));
        assert_eq!(terminal.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_response_code_is_reported() {
        let (mut client, handle) = client();
        handle.script_exchange("X99900");

        let err = client.echo_test().await.unwrap_err();
        assert!(matches!(err.root(), EcrError::UnknownResponseCode { .. }));
    }
}
