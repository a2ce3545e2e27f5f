//! Response decoding
//!
//! A verified payload starts with a 4 character response code: `R` or `G`
//! followed by the command suffix. The family picks a fixed-offset layout;
//! host type and approval are derived afterwards, independent of family.

use serde::{Deserialize, Serialize};

use super::fields::{self as f, parse_amount, rest, slice};
use super::frame::to_hex;
use super::status::{self, StatusCategory, EWALLET_APPROVED};
use super::{HostType, TransactionFamily};
use crate::error::EcrError;

/// Card data returned by card and read-card responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardInfo {
    pub card_number: Option<String>,
    pub expiry: Option<String>,
    pub cardholder_name: Option<String>,
    pub card_type: Option<String>,
    pub card_brand: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletInfo {
    pub wallet_transaction_id: Option<String>,
    pub qr_code_id: Option<String>,
    pub wallet_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementTotals {
    pub sale_count: Option<u64>,
    pub sale_total: Option<u64>,
    pub refund_count: Option<u64>,
    pub refund_total: Option<u64>,
}

/// Family-specific part of a response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseDetails {
    Card(CardInfo),
    Wallet(WalletInfo),
    Settlement(SettlementTotals),
    ScannedQr {
        qr_code_id: Option<String>,
        data: Option<String>,
    },
    QueriedTransaction {
        original_code: Option<String>,
    },
    None,
}

/// Decoded terminal response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub family: TransactionFamily,
    pub response_code: String,
    pub host_type: HostType,
    pub status_code: String,
    pub status_description: String,
    pub status_category: StatusCategory,
    pub is_approved: bool,
    pub approval_code: Option<String>,
    pub rrn: Option<String>,
    pub trace_number: Option<String>,
    pub batch_number: Option<String>,
    pub host_number: Option<String>,
    pub terminal_id: Option<String>,
    pub merchant_id: Option<String>,
    pub amount: Option<u64>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub details: ResponseDetails,
    pub raw_hex: String,
}

impl ResponseRecord {
    fn empty(family: TransactionFamily, code: &str, host_type: HostType, raw_hex: String) -> Self {
        Self {
            family,
            response_code: code.to_string(),
            host_type,
            status_code: String::new(),
            status_description: String::new(),
            status_category: StatusCategory::Unknown,
            is_approved: false,
            approval_code: None,
            rrn: None,
            trace_number: None,
            batch_number: None,
            host_number: None,
            terminal_id: None,
            merchant_id: None,
            amount: None,
            date: None,
            time: None,
            details: ResponseDetails::None,
            raw_hex,
        }
    }

    /// Terminal reported that the customer cancelled
    pub fn is_user_cancelled(&self) -> bool {
        self.status_code == status::USER_CANCELLED
    }
}

/// Which fixed layout a family's response uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Card,
    Wallet,
    Void,
    Settlement,
    ReadCard,
    ScanQr,
    TransactionStatus,
    EchoTest,
}

impl Layout {
    fn of(family: TransactionFamily) -> Self {
        use TransactionFamily::*;
        match family {
            PreAuth | Sale | Refund | CashAdvance | SaleWithCash | Adjust | OfflineSale => {
                Self::Card
            }
            WalletSale | WalletRefund => Self::Wallet,
            Void => Self::Void,
            Settlement => Self::Settlement,
            ReadCard => Self::ReadCard,
            ScanQr => Self::ScanQr,
            TransactionStatus => Self::TransactionStatus,
            EchoTest => Self::EchoTest,
        }
    }
}

/// Fixed field offsets; the status code always sits right after the code
mod offsets {
    pub const STATUS: usize = 4;

    pub mod card {
        pub const APPROVAL: usize = 6;
        pub const RRN: usize = 12;
        pub const TRACE: usize = 24;
        pub const BATCH: usize = 30;
        pub const HOST: usize = 36;
        pub const TERMINAL_ID: usize = 38;
        pub const MERCHANT_ID: usize = 46;
        pub const CARD_NUMBER: usize = 61;
        pub const EXPIRY: usize = 80;
        pub const CARDHOLDER: usize = 84;
        pub const CARD_TYPE: usize = 110;
        pub const AMOUNT: usize = 112;
        pub const DATE: usize = 124;
        pub const TIME: usize = 130;
    }

    pub mod wallet {
        pub const APPROVAL: usize = 6;
        pub const TRACE: usize = 12;
        pub const BATCH: usize = 18;
        pub const HOST: usize = 24;
        pub const TERMINAL_ID: usize = 26;
        pub const MERCHANT_ID: usize = 34;
        pub const AMOUNT: usize = 49;
        pub const WALLET_TXN_ID: usize = 61;
        pub const QR_CODE_ID: usize = 81;
        pub const DATE: usize = 83;
        pub const TIME: usize = 89;
    }

    pub mod void {
        pub const APPROVAL: usize = 6;
        pub const RRN: usize = 12;
        pub const TRACE: usize = 24;
        pub const BATCH: usize = 30;
        pub const HOST: usize = 36;
        pub const TERMINAL_ID: usize = 38;
        pub const MERCHANT_ID: usize = 46;
        pub const AMOUNT: usize = 61;
        pub const DATE: usize = 73;
        pub const TIME: usize = 79;
    }

    pub mod settlement {
        pub const HOST: usize = 6;
        pub const BATCH: usize = 8;
        pub const TERMINAL_ID: usize = 14;
        pub const MERCHANT_ID: usize = 22;
        pub const SALE_COUNT: usize = 37;
        pub const SALE_TOTAL: usize = 40;
        pub const REFUND_COUNT: usize = 52;
        pub const REFUND_TOTAL: usize = 55;
        pub const COUNT_WIDTH: usize = 3;
    }

    pub mod read_card {
        pub const CARD_NUMBER: usize = 6;
        pub const EXPIRY: usize = 25;
        pub const CARDHOLDER: usize = 29;
        pub const CARD_TYPE: usize = 55;
    }

    pub mod scan_qr {
        pub const QR_CODE_ID: usize = 6;
        pub const DATA: usize = 8;
    }

    pub mod status_query {
        pub const ORIGINAL_CODE: usize = 6;
        pub const APPROVAL: usize = 10;
        pub const RRN: usize = 16;
        pub const TRACE: usize = 28;
        pub const AMOUNT: usize = 34;
    }

    pub mod echo {
        pub const TERMINAL_ID: usize = 6;
    }
}

fn card_info(p: &str, number: usize, expiry: usize, holder: usize, card_type: usize) -> CardInfo {
    let card_type = slice(p, card_type, f::CARD_TYPE_WIDTH);
    CardInfo {
        card_number: slice(p, number, f::CARD_NUMBER_WIDTH),
        expiry: slice(p, expiry, f::EXPIRY_WIDTH),
        cardholder_name: slice(p, holder, f::CARDHOLDER_WIDTH),
        card_brand: card_type
            .as_deref()
            .and_then(status::card_type_name)
            .map(str::to_string),
        card_type,
    }
}

fn decode_card(p: &str, r: &mut ResponseRecord) {
    use offsets::card::*;
    r.approval_code = slice(p, APPROVAL, f::APPROVAL_WIDTH);
    r.rrn = slice(p, RRN, f::RRN_WIDTH);
    r.trace_number = slice(p, TRACE, f::TRACE_WIDTH);
    r.batch_number = slice(p, BATCH, f::BATCH_WIDTH);
    r.host_number = slice(p, HOST, f::HOST_WIDTH);
    r.terminal_id = slice(p, TERMINAL_ID, f::TERMINAL_ID_WIDTH);
    r.merchant_id = slice(p, MERCHANT_ID, f::MERCHANT_ID_WIDTH);
    r.amount = parse_amount(slice(p, AMOUNT, f::AMOUNT_WIDTH).as_deref());
    r.date = slice(p, DATE, f::DATE_WIDTH);
    r.time = slice(p, TIME, f::TIME_WIDTH);
    r.details = ResponseDetails::Card(card_info(p, CARD_NUMBER, EXPIRY, CARDHOLDER, CARD_TYPE));
}

fn decode_wallet(p: &str, r: &mut ResponseRecord) {
    use offsets::wallet::*;
    r.approval_code = slice(p, APPROVAL, f::APPROVAL_WIDTH);
    r.trace_number = slice(p, TRACE, f::TRACE_WIDTH);
    r.batch_number = slice(p, BATCH, f::BATCH_WIDTH);
    r.host_number = slice(p, HOST, f::HOST_WIDTH);
    r.terminal_id = slice(p, TERMINAL_ID, f::TERMINAL_ID_WIDTH);
    r.merchant_id = slice(p, MERCHANT_ID, f::MERCHANT_ID_WIDTH);
    r.amount = parse_amount(slice(p, AMOUNT, f::AMOUNT_WIDTH).as_deref());
    r.date = slice(p, DATE, f::DATE_WIDTH);
    r.time = slice(p, TIME, f::TIME_WIDTH);
    let qr_code_id = slice(p, QR_CODE_ID, f::QR_CODE_ID_WIDTH);
    r.details = ResponseDetails::Wallet(WalletInfo {
        wallet_transaction_id: slice(p, WALLET_TXN_ID, f::WALLET_TXN_ID_WIDTH),
        wallet_name: qr_code_id
            .as_deref()
            .and_then(status::qr_code_name)
            .map(str::to_string),
        qr_code_id,
    });
}

fn decode_void(p: &str, r: &mut ResponseRecord) {
    use offsets::void::*;
    r.approval_code = slice(p, APPROVAL, f::APPROVAL_WIDTH);
    r.rrn = slice(p, RRN, f::RRN_WIDTH);
    r.trace_number = slice(p, TRACE, f::TRACE_WIDTH);
    r.batch_number = slice(p, BATCH, f::BATCH_WIDTH);
    r.host_number = slice(p, HOST, f::HOST_WIDTH);
    r.terminal_id = slice(p, TERMINAL_ID, f::TERMINAL_ID_WIDTH);
    r.merchant_id = slice(p, MERCHANT_ID, f::MERCHANT_ID_WIDTH);
    r.amount = parse_amount(slice(p, AMOUNT, f::AMOUNT_WIDTH).as_deref());
    r.date = slice(p, DATE, f::DATE_WIDTH);
    r.time = slice(p, TIME, f::TIME_WIDTH);
}

fn decode_settlement(p: &str, r: &mut ResponseRecord) {
    use offsets::settlement::*;
    r.host_number = slice(p, HOST, f::HOST_WIDTH);
    r.batch_number = slice(p, BATCH, f::BATCH_WIDTH);
    r.terminal_id = slice(p, TERMINAL_ID, f::TERMINAL_ID_WIDTH);
    r.merchant_id = slice(p, MERCHANT_ID, f::MERCHANT_ID_WIDTH);
    r.details = ResponseDetails::Settlement(SettlementTotals {
        sale_count: parse_amount(slice(p, SALE_COUNT, COUNT_WIDTH).as_deref()),
        sale_total: parse_amount(slice(p, SALE_TOTAL, f::AMOUNT_WIDTH).as_deref()),
        refund_count: parse_amount(slice(p, REFUND_COUNT, COUNT_WIDTH).as_deref()),
        refund_total: parse_amount(slice(p, REFUND_TOTAL, f::AMOUNT_WIDTH).as_deref()),
    });
}

fn decode_transaction_status(p: &str, r: &mut ResponseRecord) {
    use offsets::status_query::*;
    r.approval_code = slice(p, APPROVAL, f::APPROVAL_WIDTH);
    r.rrn = slice(p, RRN, f::RRN_WIDTH);
    r.trace_number = slice(p, TRACE, f::TRACE_WIDTH);
    r.amount = parse_amount(slice(p, AMOUNT, f::AMOUNT_WIDTH).as_deref());
    r.details = ResponseDetails::QueriedTransaction {
        original_code: slice(p, ORIGINAL_CODE, f::CODE_WIDTH),
    };
}

/// Approval rule shared by every family except echo test
fn approved(status_code: &str, host_type: HostType, family: TransactionFamily) -> bool {
    if family == TransactionFamily::EchoTest {
        return !status_code.is_empty();
    }
    status::is_iso_approved(status_code)
        || (host_type == HostType::EWallet && !family.is_wallet() && status_code == EWALLET_APPROVED)
}

/// Decode a verified payload into a response record
pub fn decode(payload: &[u8]) -> Result<ResponseRecord, EcrError> {
    let raw_hex = to_hex(payload);
    let text = String::from_utf8_lossy(payload);
    let p = text.as_ref();

    let code = p.get(..f::CODE_WIDTH).unwrap_or(p);
    let unknown = || EcrError::UnknownResponseCode {
        code: code.to_string(),
        raw_hex: raw_hex.clone(),
    };
    let mut chars = code.chars();
    let host_type = chars
        .next()
        .and_then(HostType::from_prefix)
        .ok_or_else(unknown)?;
    let family = p
        .get(1..f::CODE_WIDTH)
        .and_then(TransactionFamily::from_code_suffix)
        .ok_or_else(unknown)?;

    let mut record = ResponseRecord::empty(family, code, host_type, raw_hex.clone());
    record.status_code = slice(p, offsets::STATUS, f::STATUS_WIDTH).unwrap_or_default();

    match Layout::of(family) {
        Layout::Card => decode_card(p, &mut record),
        Layout::Wallet => decode_wallet(p, &mut record),
        Layout::Void => decode_void(p, &mut record),
        Layout::Settlement => decode_settlement(p, &mut record),
        Layout::ReadCard => {
            use offsets::read_card::*;
            record.details =
                ResponseDetails::Card(card_info(p, CARD_NUMBER, EXPIRY, CARDHOLDER, CARD_TYPE));
        }
        Layout::ScanQr => {
            record.details = ResponseDetails::ScannedQr {
                qr_code_id: slice(p, offsets::scan_qr::QR_CODE_ID, f::QR_CODE_ID_WIDTH),
                data: rest(p, offsets::scan_qr::DATA),
            };
        }
        Layout::TransactionStatus => decode_transaction_status(p, &mut record),
        Layout::EchoTest => {
            record.terminal_id = slice(p, offsets::echo::TERMINAL_ID, f::TERMINAL_ID_WIDTH);
        }
    }

    record.is_approved = approved(&record.status_code, host_type, family);
    if !record.status_code.is_empty() {
        record.status_description = status::describe(&record.status_code);
        record.status_category = status::category(&record.status_code);
    } else {
        record.status_description = "No status code".to_string();
    }

    Ok(record)
}
