//! Fixed-width field sizes and padding helpers

pub const CODE_WIDTH: usize = 4;
pub const HOST_WIDTH: usize = 2;
pub const AMOUNT_WIDTH: usize = 12;
pub const ADDITIONAL_DATA_WIDTH: usize = 24;
pub const CARD_NUMBER_WIDTH: usize = 19;
pub const EXPIRY_WIDTH: usize = 4;
pub const STATUS_WIDTH: usize = 2;
pub const APPROVAL_WIDTH: usize = 6;
pub const RRN_WIDTH: usize = 12;
pub const TRACE_WIDTH: usize = 6;
pub const BATCH_WIDTH: usize = 6;
pub const TERMINAL_ID_WIDTH: usize = 8;
pub const MERCHANT_ID_WIDTH: usize = 15;
pub const CARDHOLDER_WIDTH: usize = 26;
pub const CARD_TYPE_WIDTH: usize = 2;
pub const QR_CODE_ID_WIDTH: usize = 2;
pub const WALLET_TXN_ID_WIDTH: usize = 20;
pub const DATE_WIDTH: usize = 6;
pub const TIME_WIDTH: usize = 6;

/// Largest amount representable in the 12 digit field
pub const MAX_AMOUNT: u64 = 999_999_999_999;

/// Host numbers that are not two digits
pub const RESERVED_HOSTS: [&str; 3] = ["QR", "EW", "UP"];

/// Zero-padded decimal amount
pub fn amount(value: u64) -> String {
    format!("{:0width$}", value, width = AMOUNT_WIDTH)
}

/// Right-pad with spaces. Callers check the length first.
pub fn pad_right(value: &str, width: usize) -> String {
    format!("{:<width$}", value, width = width)
}

/// Left-pad with zeros. Callers check the length first.
pub fn pad_left_zero(value: &str, width: usize) -> String {
    format!("{:0>width$}", value, width = width)
}

/// Character range `start..start + width`, trimmed of padding
///
/// Missing or partial ranges at the end of a short payload yield what is
/// present; an empty result is `None`.
pub fn slice(payload: &str, start: usize, width: usize) -> Option<String> {
    let end = (start + width).min(payload.len());
    let value = payload.get(start..end)?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Everything from `start` to the end of the payload, trimmed
pub fn rest(payload: &str, start: usize) -> Option<String> {
    let value = payload.get(start..)?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Decimal amount field, `None` when absent or not numeric
pub fn parse_amount(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_is_zero_padded() {
        assert_eq!(amount(1099), "000000001099");
        assert_eq!(amount(0), "000000000000");
        assert_eq!(amount(MAX_AMOUNT), "999999999999");
    }

    #[test]
    fn test_padding() {
        assert_eq!(pad_right("AB", 4), "AB  ");
        assert_eq!(pad_left_zero("42", 6), "000042");
    }

    #[test]
    fn test_slice_trims_and_tolerates_short_payload() {
        let payload = "R20000ABC   ";
        assert_eq!(slice(payload, 4, 2).as_deref(), Some("00"));
        assert_eq!(slice(payload, 6, 6).as_deref(), Some("ABC"));
        assert_eq!(slice(payload, 10, 6), None);
        assert_eq!(slice(payload, 40, 6), None);
    }

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount(Some("000000001099")), Some(1099));
        assert_eq!(parse_amount(Some("12AB")), None);
        assert_eq!(parse_amount(None), None);
    }
}
