//! ECR wire protocol
//!
//! - `frame`: STX/ETX framing, LRC checksum and control bytes
//! - `command`: fixed-width command encoding per transaction family
//! - `response`: fixed-offset response decoding and approval rules
//! - `status`: protocol and ISO status code tables

pub mod command;
pub mod fields;
pub mod frame;
pub mod response;
pub mod status;

mod family;

pub use command::{encode_frame, encode_payload, Command};
pub use family::{HostType, TransactionFamily};
pub use frame::FrameCodec;
pub use response::{decode, ResponseDetails, ResponseRecord};
pub use status::StatusCategory;
