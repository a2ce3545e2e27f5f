//! ECR Link Core - payment terminal protocol engine
//!
//! This crate provides:
//! - Wire protocol (STX/ETX frames with LRC, command encoding, response decoding)
//! - Byte transports (serial, TCP, scripted mock)
//! - The ENQ/ACK/EOT transport session
//! - Transaction orchestration (retry, split payments, partial refunds, ledger)
//! - USB device registry with auto-reconnect
//! - Error types and configuration

pub mod commlog;
pub mod config;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;

// Re-export common types
pub use config::EcrConfig;
pub use device::{DeviceEvent, DeviceMonitor, DeviceRegistry, SerialPortScanner, UsbDevice};
pub use error::{EcrError, Result};
pub use orchestrator::{
    EcrClient, PartialRefundRequest, SplitLegRequest, SplitPaymentTransaction, SplitPlan,
};
pub use protocol::{Command, ResponseRecord, TransactionFamily};
pub use session::{SessionState, TransportSession};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use transport::{ByteTransport, MockTransport, SerialTransport, TcpTransport};
