//! Transaction families and their command/response codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of command families the terminal understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionFamily {
    PreAuth,
    Sale,
    Void,
    Refund,
    CashAdvance,
    SaleWithCash,
    TransactionStatus,
    Adjust,
    OfflineSale,
    WalletSale,
    WalletRefund,
    Settlement,
    EchoTest,
    ScanQr,
    ReadCard,
}

impl TransactionFamily {
    pub const ALL: [TransactionFamily; 15] = [
        Self::PreAuth,
        Self::Sale,
        Self::Void,
        Self::Refund,
        Self::CashAdvance,
        Self::SaleWithCash,
        Self::TransactionStatus,
        Self::Adjust,
        Self::OfflineSale,
        Self::WalletSale,
        Self::WalletRefund,
        Self::Settlement,
        Self::EchoTest,
        Self::ScanQr,
        Self::ReadCard,
    ];

    /// Three digit code shared by the command and its response
    pub fn code_suffix(self) -> &'static str {
        match self {
            Self::PreAuth => "100",
            Self::Sale => "200",
            Self::Void => "201",
            Self::Refund => "203",
            Self::CashAdvance => "204",
            Self::SaleWithCash => "205",
            Self::TransactionStatus => "208",
            Self::Adjust => "220",
            Self::OfflineSale => "230",
            Self::WalletSale => "290",
            Self::WalletRefund => "292",
            Self::Settlement => "500",
            Self::EchoTest => "902",
            Self::ScanQr => "906",
            Self::ReadCard => "910",
        }
    }

    /// Four character command code, e.g. `C200`
    pub fn command_code(self) -> String {
        format!("C{}", self.code_suffix())
    }

    pub fn from_code_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code_suffix() == suffix)
    }

    pub fn is_wallet(self) -> bool {
        matches!(self, Self::WalletSale | Self::WalletRefund)
    }
}

impl fmt::Display for TransactionFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreAuth => "PreAuth",
            Self::Sale => "Sale",
            Self::Void => "Void",
            Self::Refund => "Refund",
            Self::CashAdvance => "CashAdvance",
            Self::SaleWithCash => "SaleWithCash",
            Self::TransactionStatus => "TransactionStatus",
            Self::Adjust => "Adjust",
            Self::OfflineSale => "OfflineSale",
            Self::WalletSale => "WalletSale",
            Self::WalletRefund => "WalletRefund",
            Self::Settlement => "Settlement",
            Self::EchoTest => "EchoTest",
            Self::ScanQr => "ScanQR",
            Self::ReadCard => "ReadCard",
        };
        f.write_str(name)
    }
}

/// Routing derived from the leading character of a response code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostType {
    Standard,
    EWallet,
}

impl HostType {
    pub fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            'R' => Some(Self::Standard),
            'G' => Some(Self::EWallet),
            _ => None,
        }
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => f.write_str("Standard"),
            Self::EWallet => f.write_str("E-Wallet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(TransactionFamily::Sale.command_code(), "C200");
        assert_eq!(TransactionFamily::Settlement.command_code(), "C500");
        assert_eq!(TransactionFamily::ReadCard.command_code(), "C910");
    }

    #[test]
    fn test_suffixes_are_unique() {
        for family in TransactionFamily::ALL {
            assert_eq!(
                TransactionFamily::from_code_suffix(family.code_suffix()),
                Some(family)
            );
        }
        assert_eq!(TransactionFamily::from_code_suffix("999"), None);
    }

    #[test]
    fn test_host_type_prefix() {
        assert_eq!(HostType::from_prefix('R'), Some(HostType::Standard));
        assert_eq!(HostType::from_prefix('G'), Some(HostType::EWallet));
        assert_eq!(HostType::from_prefix('C'), None);
    }
}
