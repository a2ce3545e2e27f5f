//! Status code tables
//!
//! Two disjoint code spaces share the 2 character status field:
//! - protocol codes: two letters, connection and terminal level conditions
//! - ISO codes: ISO 8583 derived, business approval/decline
//!
//! A code's category comes from the table that holds it, never from the
//! transaction family.

use serde::{Deserialize, Serialize};

/// Codes that approve a transaction on any host
pub const ISO_APPROVED: [&str; 5] = ["00", "10", "11", "Y1", "Y3"];

/// Approval code used by the E-Wallet host for non-wallet families
pub const EWALLET_APPROVED: &str = "90";

/// Protocol code the terminal reports when the customer cancels
pub const USER_CANCELLED: &str = "UC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCategory {
    Protocol,
    Iso,
    Unknown,
}

const PROTOCOL_CODES: &[(&str, &str)] = &[
    ("TA", "Transaction aborted by terminal"),
    ("UC", "Transaction cancelled by user"),
    ("TO", "Terminal timeout waiting for card"),
    ("CE", "Terminal cannot connect to host"),
    ("NF", "Transaction not found"),
    ("ND", "No transaction to settle"),
    ("IC", "Invalid command"),
    ("BF", "Batch full, settlement required"),
    ("RE", "Card read error"),
    ("PE", "Printer error"),
    ("LB", "Terminal battery low"),
    ("TB", "Terminal busy"),
];

const ISO_CODES: &[(&str, &str)] = &[
    ("00", "Approved"),
    ("01", "Refer to card issuer"),
    ("02", "Refer to card issuer, special condition"),
    ("03", "Invalid merchant"),
    ("04", "Pick up card"),
    ("05", "Do not honor"),
    ("08", "Honor with identification"),
    ("10", "Approved for partial amount"),
    ("11", "Approved (VIP)"),
    ("12", "Invalid transaction"),
    ("13", "Invalid amount"),
    ("14", "Invalid card number"),
    ("19", "Re-enter transaction"),
    ("25", "Unable to locate record"),
    ("30", "Format error"),
    ("31", "Bank not supported"),
    ("41", "Lost card, pick up"),
    ("43", "Stolen card, pick up"),
    ("51", "Insufficient funds"),
    ("54", "Expired card"),
    ("55", "Incorrect PIN"),
    ("57", "Transaction not permitted to cardholder"),
    ("58", "Transaction not permitted to terminal"),
    ("61", "Exceeds withdrawal amount limit"),
    ("62", "Restricted card"),
    ("65", "Exceeds withdrawal frequency limit"),
    ("75", "Allowable number of PIN tries exceeded"),
    ("77", "Reconcile error"),
    ("78", "Trace number not found"),
    ("80", "Batch number not found"),
    ("89", "Bad terminal ID"),
    ("90", "Cutoff in progress"),
    ("91", "Issuer or switch inoperative"),
    ("94", "Duplicate transmission"),
    ("95", "Reconcile error, batch upload started"),
    ("96", "System malfunction"),
    ("Y1", "Offline approved"),
    ("Y3", "Unable to go online, offline approved"),
    ("Z1", "Offline declined"),
    ("Z3", "Unable to go online, offline declined"),
];

const CARD_TYPES: &[(&str, &str)] = &[
    ("01", "Visa"),
    ("02", "Mastercard"),
    ("03", "JCB"),
    ("04", "UnionPay"),
    ("05", "American Express"),
    ("06", "Local debit"),
];

/// QR code ids the terminal accepts for wallet and scan commands
pub const QR_CODE_IDS: &[(&str, &str)] = &[
    ("01", "PromptPay"),
    ("02", "Alipay"),
    ("03", "WeChat Pay"),
    ("04", "TrueMoney"),
    ("05", "ShopeePay"),
    ("06", "LINE Pay"),
];

fn lookup(table: &'static [(&'static str, &'static str)], code: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(key, _)| *key == code)
        .map(|(_, description)| *description)
}

fn protocol_description(code: &str) -> Option<&'static str> {
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_uppercase()) {
        lookup(PROTOCOL_CODES, code)
    } else {
        None
    }
}

/// Category of a status code
pub fn category(code: &str) -> StatusCategory {
    if protocol_description(code).is_some() {
        StatusCategory::Protocol
    } else if lookup(ISO_CODES, code).is_some() {
        StatusCategory::Iso
    } else {
        StatusCategory::Unknown
    }
}

/// Human-readable description; protocol table first, then ISO
pub fn describe(code: &str) -> String {
    protocol_description(code)
        .or_else(|| lookup(ISO_CODES, code))
        .map(str::to_string)
        .unwrap_or_else(|| format!("Unknown status ({})", code))
}

pub fn is_iso_approved(code: &str) -> bool {
    ISO_APPROVED.contains(&code)
}

pub fn card_type_name(code: &str) -> Option<&'static str> {
    lookup(CARD_TYPES, code)
}

pub fn qr_code_name(id: &str) -> Option<&'static str> {
    lookup(QR_CODE_IDS, id)
}
