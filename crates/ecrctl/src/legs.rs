//! Split payment leg arguments

use anyhow::{bail, Context, Result};
use ecrlink_core::SplitLegRequest;

/// `card:<host>:<amount>` or `wallet:<host>:<qr-id>:<amount>`
pub fn parse_leg(arg: &str) -> Result<SplitLegRequest> {
    let parts: Vec<&str> = arg.split(':').collect();
    let amount = |text: &str| {
        text.parse::<u64>()
            .with_context(|| format!("Invalid amount {:?} in leg {:?}", text, arg))
    };
    match parts.as_slice() {
        ["card", host, value] => Ok(SplitLegRequest::card(*host, amount(*value)?)),
        ["wallet", host, qr, value] => Ok(SplitLegRequest::wallet(*host, *qr, amount(*value)?)),
        _ => bail!(
            "Invalid leg {:?}: expected card:<host>:<amount> or wallet:<host>:<qr-id>:<amount>",
            arg
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecrlink_core::orchestrator::PaymentMethod;

    #[test]
    fn test_card_leg() {
        let leg = parse_leg("card:01:600").unwrap();
        assert_eq!(leg.method, PaymentMethod::Card);
        assert_eq!(leg.host, "01");
        assert_eq!(leg.amount, 600);
    }

    #[test]
    fn test_wallet_leg() {
        let leg = parse_leg("wallet:EW:02:400").unwrap();
        assert_eq!(leg.method, PaymentMethod::Wallet);
        assert_eq!(leg.qr_code_id.as_deref(), Some("02"));
    }

    #[test]
    fn test_bad_legs() {
        assert!(parse_leg("card:01").is_err());
        assert!(parse_leg("cash:01:100").is_err());
        assert!(parse_leg("card:01:ten").is_err());
    }
}
