//! Error types for ecrlink-core

use thiserror::Error;

use crate::protocol::TransactionFamily;
use crate::session::SessionState;

/// Input rejected before anything is sent to the terminal
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{family}: invalid {field}: {reason}")]
    Field {
        family: TransactionFamily,
        field: &'static str,
        reason: String,
    },

    #[error("Split payment legs sum to {sum}, declared total is {total}")]
    SplitTotalMismatch { total: u64, sum: u64 },

    #[error("Split payment needs between 2 and 5 legs, got {0}")]
    SplitLegCount(usize),

    #[error("Split payment leg {index}: {reason}")]
    SplitLeg { index: usize, reason: String },

    #[error("Refund amount {refund} must be greater than zero and less than original amount {original}")]
    RefundAmount { original: u64, refund: u64 },

    #[error("Refund amount {refund} exceeds remaining refundable amount {remaining}")]
    RefundExceedsRemaining { remaining: u64, refund: u64 },

    #[error("Original transaction {0} is not in the ledger")]
    RefundOriginalNotFound(String),

    #[error("Original transaction {id} was not approved")]
    RefundOriginalNotApproved { id: String },

    #[error("Original transaction {id} is for {recorded}, refund request says {requested}")]
    RefundOriginalAmount {
        id: String,
        recorded: u64,
        requested: u64,
    },
}

impl ValidationError {
    pub(crate) fn field(
        family: TransactionFamily,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::Field {
            family,
            field,
            reason: reason.into(),
        }
    }
}

/// Received bytes rejected before decoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Checksum mismatch: expected {expected:#04X}, got {actual:#04X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
}

/// Failures of the ENQ/ACK/EOT conversation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("Handshake timeout in {state} after {waited_ms}ms")]
    Timeout { state: SessionState, waited_ms: u64 },

    #[error("Unexpected control byte in {state}: expected {expected}, got {got}")]
    UnexpectedControl {
        state: SessionState,
        expected: &'static str,
        got: String,
    },

    #[error("No response frame after {waited_ms}ms")]
    ResponseTimeout { waited_ms: u64 },

    #[error("Terminal did not send EOT after the response")]
    EotMissing,

    #[error("Exchange cancelled in {state}")]
    Cancelled { state: SessionState },
}

impl HandshakeError {
    /// State the conversation was in when it failed
    pub fn state(&self) -> SessionState {
        match self {
            Self::Timeout { state, .. }
            | Self::UnexpectedControl { state, .. }
            | Self::Cancelled { state } => *state,
            Self::ResponseTimeout { .. } => SessionState::ReceivingResponse,
            Self::EotMissing => SessionState::AwaitingEot,
        }
    }
}

/// Core error type
#[derive(Debug, Error)]
pub enum EcrError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{source} (raw: {raw_hex})")]
    Framing {
        #[source]
        source: FramingError,
        raw_hex: String,
    },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Unknown response code {code:?} (raw: {raw_hex})")]
    UnknownResponseCode { code: String, raw_hex: String },

    /// Transport failure during an exchange, tagged with the session state
    #[error("Link lost in {state}: {source}")]
    Link {
        state: SessionState,
        #[source]
        source: Box<EcrError>,
    },

    #[error("{family} failed: {source}")]
    Transaction {
        family: TransactionFamily,
        #[source]
        source: Box<EcrError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device {0} not found")]
    DeviceNotFound(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcrError>;

impl EcrError {
    /// Attach the transaction family to an error, once
    pub fn in_family(self, family: TransactionFamily) -> Self {
        match self {
            err @ Self::Transaction { .. } => err,
            err => Self::Transaction {
                family,
                source: Box::new(err),
            },
        }
    }

    /// Tag a transport failure with the session state it happened in
    pub(crate) fn on_link(self, state: SessionState) -> Self {
        match self {
            err @ (Self::Io(_) | Self::Serial(_) | Self::Connection(_) | Self::NotConnected) => {
                Self::Link {
                    state,
                    source: Box::new(err),
                }
            }
            err => err,
        }
    }

    /// Error with the family context removed
    pub fn root(&self) -> &EcrError {
        match self {
            Self::Transaction { source, .. } => source.root(),
            err => err,
        }
    }

    /// True when re-running the whole exchange cannot double-charge: the
    /// terminal never acknowledged the command.
    pub fn is_transient(&self) -> bool {
        match self.root() {
            Self::Link { state, .. } => state.before_command_accepted(),
            Self::Handshake(HandshakeError::Cancelled { .. }) => false,
            Self::Handshake(err) => err.state().before_command_accepted(),
            _ => false,
        }
    }

    /// True when the exchange was cancelled locally
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Handshake(HandshakeError::Cancelled { .. }))
    }
}
