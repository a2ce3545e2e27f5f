//! Command encoding
//!
//! Every field-shape and range check for outgoing commands lives here. A
//! command either encodes completely or fails with a `ValidationError` naming
//! the family and field; nothing is truncated or clamped.

use serde::{Deserialize, Serialize};

use super::fields::{self, MAX_AMOUNT};
use super::frame::FrameCodec;
use super::status::qr_code_name;
use super::TransactionFamily;
use crate::error::ValidationError;

/// Transaction request for one terminal command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub family: TransactionFamily,
    pub host: String,
    /// Minor currency units
    pub amount: u64,
    pub trace_number: Option<String>,
    pub original_amount: Option<u64>,
    pub cash_amount: Option<u64>,
    pub approval_code: Option<String>,
    pub qr_code_id: Option<String>,
    pub additional_data: String,
    pub print_receipt: Option<bool>,
}

impl Command {
    /// Bare command; prefer the family constructors
    pub fn new(family: TransactionFamily, host: impl Into<String>, amount: u64) -> Self {
        Self {
            family,
            host: host.into(),
            amount,
            trace_number: None,
            original_amount: None,
            cash_amount: None,
            approval_code: None,
            qr_code_id: None,
            additional_data: String::new(),
            print_receipt: None,
        }
    }

    pub fn sale(host: impl Into<String>, amount: u64) -> Self {
        Self::new(TransactionFamily::Sale, host, amount)
    }

    pub fn pre_auth(host: impl Into<String>, amount: u64) -> Self {
        Self::new(TransactionFamily::PreAuth, host, amount)
    }

    pub fn cash_advance(host: impl Into<String>, amount: u64) -> Self {
        Self::new(TransactionFamily::CashAdvance, host, amount)
    }

    pub fn sale_with_cash(host: impl Into<String>, amount: u64, cash_amount: u64) -> Self {
        Self {
            cash_amount: Some(cash_amount),
            ..Self::new(TransactionFamily::SaleWithCash, host, amount)
        }
    }

    pub fn void(host: impl Into<String>, amount: u64, trace_number: impl Into<String>) -> Self {
        Self {
            trace_number: Some(trace_number.into()),
            ..Self::new(TransactionFamily::Void, host, amount)
        }
    }

    pub fn refund(host: impl Into<String>, amount: u64) -> Self {
        Self::new(TransactionFamily::Refund, host, amount)
    }

    /// Refund carrying the amount of the transaction it refers to
    pub fn partial_refund(host: impl Into<String>, amount: u64, original_amount: u64) -> Self {
        Self {
            original_amount: Some(original_amount),
            ..Self::new(TransactionFamily::Refund, host, amount)
        }
    }

    pub fn adjust(host: impl Into<String>, amount: u64, trace_number: impl Into<String>) -> Self {
        Self {
            trace_number: Some(trace_number.into()),
            ..Self::new(TransactionFamily::Adjust, host, amount)
        }
    }

    pub fn offline_sale(
        host: impl Into<String>,
        amount: u64,
        approval_code: impl Into<String>,
    ) -> Self {
        Self {
            approval_code: Some(approval_code.into()),
            ..Self::new(TransactionFamily::OfflineSale, host, amount)
        }
    }

    pub fn wallet_sale(host: impl Into<String>, amount: u64, qr_code_id: impl Into<String>) -> Self {
        Self {
            qr_code_id: Some(qr_code_id.into()),
            ..Self::new(TransactionFamily::WalletSale, host, amount)
        }
    }

    pub fn wallet_refund(
        host: impl Into<String>,
        amount: u64,
        qr_code_id: impl Into<String>,
        trace_number: impl Into<String>,
    ) -> Self {
        Self {
            qr_code_id: Some(qr_code_id.into()),
            trace_number: Some(trace_number.into()),
            ..Self::new(TransactionFamily::WalletRefund, host, amount)
        }
    }

    pub fn transaction_status(host: impl Into<String>, trace_number: impl Into<String>) -> Self {
        Self {
            trace_number: Some(trace_number.into()),
            ..Self::new(TransactionFamily::TransactionStatus, host, 0)
        }
    }

    pub fn settlement(host: impl Into<String>) -> Self {
        Self::new(TransactionFamily::Settlement, host, 0)
    }

    pub fn echo_test() -> Self {
        Self::new(TransactionFamily::EchoTest, "", 0)
    }

    pub fn scan_qr(qr_code_id: impl Into<String>) -> Self {
        Self {
            qr_code_id: Some(qr_code_id.into()),
            ..Self::new(TransactionFamily::ScanQr, "", 0)
        }
    }

    pub fn read_card() -> Self {
        Self::new(TransactionFamily::ReadCard, "", 0)
    }

    pub fn with_additional_data(mut self, data: impl Into<String>) -> Self {
        self.additional_data = data.into();
        self
    }

    pub fn with_receipt(mut self, print: bool) -> Self {
        self.print_receipt = Some(print);
        self
    }
}

/// Builder for one family's payload; each push validates its field
struct PayloadWriter<'a> {
    command: &'a Command,
    out: String,
}

impl<'a> PayloadWriter<'a> {
    fn new(command: &'a Command) -> Self {
        let mut out = String::with_capacity(64);
        out.push_str(&command.family.command_code());
        Self { command, out }
    }

    fn error(&self, field: &'static str, reason: impl Into<String>) -> ValidationError {
        ValidationError::field(self.command.family, field, reason)
    }

    fn host(mut self) -> Result<Self, ValidationError> {
        let host = self.command.host.as_str();
        let numeric = host.len() == fields::HOST_WIDTH && host.bytes().all(|b| b.is_ascii_digit());
        if !numeric && !fields::RESERVED_HOSTS.contains(&host) {
            return Err(self.error(
                "host number",
                format!("{:?} is neither 00-99 nor a reserved host code", host),
            ));
        }
        self.out.push_str(host);
        Ok(self)
    }

    fn amount_field(mut self, field: &'static str, value: u64) -> Result<Self, ValidationError> {
        if value > MAX_AMOUNT {
            return Err(self.error(field, format!("{} exceeds {}", value, MAX_AMOUNT)));
        }
        self.out.push_str(&fields::amount(value));
        Ok(self)
    }

    fn amount(self) -> Result<Self, ValidationError> {
        let amount = self.command.amount;
        self.amount_field("amount", amount)
    }

    fn original_amount(self) -> Result<Self, ValidationError> {
        let value = self.command.original_amount.unwrap_or(0);
        self.amount_field("original amount", value)
    }

    fn cash_amount(self) -> Result<Self, ValidationError> {
        let value = self
            .command
            .cash_amount
            .ok_or_else(|| self.error("cash amount", "required"))?;
        self.amount_field("cash amount", value)
    }

    fn trace(mut self) -> Result<Self, ValidationError> {
        let trace = self
            .command
            .trace_number
            .as_deref()
            .ok_or_else(|| self.error("trace number", "required"))?;
        if trace.is_empty()
            || trace.len() > fields::TRACE_WIDTH
            || !trace.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(self.error(
                "trace number",
                format!("{:?} is not 1-{} digits", trace, fields::TRACE_WIDTH),
            ));
        }
        self.out
            .push_str(&fields::pad_left_zero(trace, fields::TRACE_WIDTH));
        Ok(self)
    }

    fn approval_code(mut self) -> Result<Self, ValidationError> {
        let code = self
            .command
            .approval_code
            .as_deref()
            .ok_or_else(|| self.error("approval code", "required"))?;
        if code.is_empty()
            || code.len() > fields::APPROVAL_WIDTH
            || !code.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(self.error(
                "approval code",
                format!("{:?} is not 1-{} alphanumerics", code, fields::APPROVAL_WIDTH),
            ));
        }
        self.out
            .push_str(&fields::pad_right(code, fields::APPROVAL_WIDTH));
        Ok(self)
    }

    fn qr_code_id(mut self) -> Result<Self, ValidationError> {
        let id = self
            .command
            .qr_code_id
            .as_deref()
            .ok_or_else(|| self.error("QR code id", "required"))?;
        if qr_code_name(id).is_none() {
            return Err(self.error("QR code id", format!("{:?} is not a known QR code id", id)));
        }
        self.out.push_str(id);
        Ok(self)
    }

    fn additional_data(mut self) -> Result<Self, ValidationError> {
        let data = self.command.additional_data.as_str();
        if !data.bytes().all(|b| (0x20..0x7F).contains(&b)) {
            return Err(self.error("additional data", "only printable ASCII is allowed"));
        }
        if data.len() > fields::ADDITIONAL_DATA_WIDTH {
            return Err(self.error(
                "additional data",
                format!(
                    "{} characters exceed the {} character field",
                    data.len(),
                    fields::ADDITIONAL_DATA_WIDTH
                ),
            ));
        }
        self.out
            .push_str(&fields::pad_right(data, fields::ADDITIONAL_DATA_WIDTH));
        Ok(self)
    }

    fn receipt_flag(mut self) -> Self {
        if let Some(print) = self.command.print_receipt {
            self.out.push(if print { 'Y' } else { 'N' });
        }
        self
    }

    fn finish(self) -> Vec<u8> {
        self.out.into_bytes()
    }
}

/// Encode a command into its unframed payload
pub fn encode_payload(command: &Command) -> Result<Vec<u8>, ValidationError> {
    use TransactionFamily::*;

    let w = PayloadWriter::new(command);
    let w = match command.family {
        PreAuth | Sale | CashAdvance => w.host()?.amount()?.additional_data()?.receipt_flag(),
        SaleWithCash => w
            .host()?
            .amount()?
            .cash_amount()?
            .additional_data()?
            .receipt_flag(),
        Void | Adjust => w
            .host()?
            .amount()?
            .trace()?
            .additional_data()?
            .receipt_flag(),
        Refund => w
            .host()?
            .amount()?
            .original_amount()?
            .additional_data()?
            .receipt_flag(),
        OfflineSale => w
            .host()?
            .amount()?
            .approval_code()?
            .additional_data()?
            .receipt_flag(),
        WalletSale => w
            .host()?
            .amount()?
            .qr_code_id()?
            .additional_data()?
            .receipt_flag(),
        WalletRefund => w
            .host()?
            .amount()?
            .qr_code_id()?
            .trace()?
            .additional_data()?
            .receipt_flag(),
        TransactionStatus => w.host()?.trace()?,
        Settlement => w.host()?,
        ScanQr => w.qr_code_id()?,
        EchoTest | ReadCard => w,
    };
    Ok(w.finish())
}

/// Encode and frame a command, ready for the wire
pub fn encode_frame(command: &Command) -> Result<Vec<u8>, ValidationError> {
    Ok(FrameCodec::wrap(&encode_payload(command)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(command: &Command) -> String {
        String::from_utf8(encode_payload(command).unwrap()).unwrap()
    }

    fn field_error(command: &Command) -> &'static str {
        match encode_payload(command) {
            Err(ValidationError::Field { field, .. }) => field,
            other => panic!("expected field error, got {:?}", other),
        }
    }

    #[test]
    fn test_sale_amount_is_zero_padded() {
        let encoded = payload(&Command::sale("01", 1099));
        assert_eq!(&encoded[..4], "C200");
        assert_eq!(&encoded[4..6], "01");
        assert_eq!(&encoded[6..18], "000000001099");
        assert_eq!(encoded.len(), 4 + 2 + 12 + 24);
    }

    #[test]
    fn test_additional_data_and_receipt_flag() {
        let encoded = payload(
            &Command::sale("01", 500)
                .with_additional_data("INV-42")
                .with_receipt(true),
        );
        assert_eq!(&encoded[18..42], "INV-42                  ");
        assert!(encoded.ends_with('Y'));
        assert_eq!(encoded.len(), 43);
    }

    #[test]
    fn test_void_layout() {
        let encoded = payload(&Command::void("02", 1099, "42"));
        assert_eq!(&encoded[..6], "C20102");
        assert_eq!(&encoded[6..18], "000000001099");
        assert_eq!(&encoded[18..24], "000042");
    }

    #[test]
    fn test_partial_refund_carries_both_amounts() {
        let encoded = payload(&Command::partial_refund("01", 300, 1000));
        assert_eq!(&encoded[..4], "C203");
        assert_eq!(&encoded[6..18], "000000000300");
        assert_eq!(&encoded[18..30], "000000001000");
    }

    #[test]
    fn test_short_layouts() {
        assert_eq!(payload(&Command::echo_test()), "C902");
        assert_eq!(payload(&Command::read_card()), "C910");
        assert_eq!(payload(&Command::settlement("01")), "C50001");
        assert_eq!(payload(&Command::scan_qr("03")), "C90603");
        assert_eq!(payload(&Command::transaction_status("01", "7")), "C20801000007");
    }

    #[test]
    fn test_wallet_layouts() {
        let sale = payload(&Command::wallet_sale("EW", 2500, "01"));
        assert_eq!(&sale[..6], "C290EW");
        assert_eq!(&sale[18..20], "01");

        let refund = payload(&Command::wallet_refund("EW", 2500, "02", "123456"));
        assert_eq!(&refund[..4], "C292");
        assert_eq!(&refund[18..26], "02123456");
    }

    #[test]
    fn test_offline_sale_and_sale_with_cash() {
        let offline = payload(&Command::offline_sale("01", 100, "AB12"));
        assert_eq!(&offline[18..24], "AB12  ");

        let cash = payload(&Command::sale_with_cash("01", 100, 2000));
        assert_eq!(&cash[..4], "C205");
        assert_eq!(&cash[18..30], "000000002000");
    }

    #[test]
    fn test_amount_over_twelve_digits_is_rejected() {
        assert_eq!(field_error(&Command::sale("01", MAX_AMOUNT + 1)), "amount");
        assert!(encode_payload(&Command::sale("01", MAX_AMOUNT)).is_ok());
    }

    #[test]
    fn test_host_number_shape() {
        assert!(encode_payload(&Command::sale("99", 1)).is_ok());
        assert!(encode_payload(&Command::sale("QR", 1)).is_ok());
        for bad in ["1", "100", "AB", "0x", ""] {
            assert_eq!(field_error(&Command::sale(bad, 1)), "host number", "{:?}", bad);
        }
    }

    #[test]
    fn test_additional_data_is_never_truncated() {
        let command = Command::sale("01", 1).with_additional_data("X".repeat(25));
        let err = encode_payload(&command).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Sale: invalid additional data: 25 characters exceed the 24 character field"
        );
        assert!(encode_payload(&Command::sale("01", 1).with_additional_data("X".repeat(24))).is_ok());
    }

    #[test]
    fn test_additional_data_rejects_control_bytes() {
        let command = Command::sale("01", 1).with_additional_data("A\u{3}B");
        assert_eq!(field_error(&command), "additional data");
    }

    #[test]
    fn test_trace_number_shape() {
        assert_eq!(field_error(&Command::void("01", 1, "1234567")), "trace number");
        assert_eq!(field_error(&Command::void("01", 1, "12a")), "trace number");
        assert_eq!(field_error(&Command::void("01", 1, "")), "trace number");
        assert_eq!(
            field_error(&Command::new(TransactionFamily::Void, "01", 1)),
            "trace number"
        );
    }

    #[test]
    fn test_unknown_qr_code_id() {
        assert_eq!(field_error(&Command::wallet_sale("EW", 1, "99")), "QR code id");
        assert_eq!(field_error(&Command::scan_qr("")), "QR code id");
    }

    #[test]
    fn test_encode_frame_wraps_payload() {
        let frame = encode_frame(&Command::echo_test()).unwrap();
        assert_eq!(FrameCodec::unwrap(&frame).unwrap(), b"C902");
    }
}
