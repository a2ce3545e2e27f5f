//! Partial refunds against an earlier transaction
//!
//! A refund must be below the original amount. With a ledger attached, the
//! original must be a recorded, approved transaction of the stated amount,
//! and the refunds already approved against it count too.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::EcrClient;
use crate::error::ValidationError;
use crate::protocol::{Command, ResponseRecord};
use crate::transport::ByteTransport;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialRefundRequest {
    pub original_transaction_id: String,
    pub original_amount: u64,
    pub refund_amount: u64,
    pub host: String,
}

impl PartialRefundRequest {
    pub fn new(
        original_transaction_id: impl Into<String>,
        original_amount: u64,
        refund_amount: u64,
        host: impl Into<String>,
    ) -> Self {
        Self {
            original_transaction_id: original_transaction_id.into(),
            original_amount,
            refund_amount,
            host: host.into(),
        }
    }

    /// `already_refunded` is the sum of earlier approved refunds
    pub fn validate(&self, already_refunded: u64) -> std::result::Result<(), ValidationError> {
        if self.refund_amount == 0 || self.refund_amount >= self.original_amount {
            return Err(ValidationError::RefundAmount {
                original: self.original_amount,
                refund: self.refund_amount,
            });
        }
        let remaining = self.original_amount.saturating_sub(already_refunded);
        if self.refund_amount > remaining {
            return Err(ValidationError::RefundExceedsRemaining {
                remaining,
                refund: self.refund_amount,
            });
        }
        Ok(())
    }
}

/// Approved partial refund, linked to its original
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialRefundRecord {
    pub original_transaction_id: String,
    pub original_amount: u64,
    pub refund_amount: u64,
    pub host: String,
    pub trace_number: Option<String>,
    pub approval_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialRefundOutcome {
    pub request: PartialRefundRequest,
    pub response: ResponseRecord,
    /// Present only when the terminal approved the refund
    pub record: Option<PartialRefundRecord>,
}

impl<T: ByteTransport> EcrClient<T> {
    /// Refund part of an earlier transaction
    ///
    /// Amount errors are returned before the terminal is contacted. A decline
    /// comes back as an outcome without a record.
    pub async fn partial_refund(&mut self, request: &PartialRefundRequest) -> Result<PartialRefundOutcome> {
        request.validate(0)?;
        if let Some(ledger) = &self.ledger {
            let id = &request.original_transaction_id;
            let original = ledger
                .transaction(id)
                .await?
                .ok_or_else(|| ValidationError::RefundOriginalNotFound(id.clone()))?;
            if !original.approved {
                return Err(ValidationError::RefundOriginalNotApproved { id: id.clone() }.into());
            }
            if original.amount != Some(request.original_amount) {
                return Err(ValidationError::RefundOriginalAmount {
                    id: id.clone(),
                    recorded: original.amount.unwrap_or(0),
                    requested: request.original_amount,
                }
                .into());
            }
            let refunded = ledger.refunded_total(id).await?;
            request.validate(refunded)?;
        }

        let command = Command::partial_refund(
            request.host.clone(),
            request.refund_amount,
            request.original_amount,
        );
        let response = self.execute(&command).await?;

        let record = response.is_approved.then(|| PartialRefundRecord {
            original_transaction_id: request.original_transaction_id.clone(),
            original_amount: request.original_amount,
            refund_amount: request.refund_amount,
            host: request.host.clone(),
            trace_number: response.trace_number.clone(),
            approval_code: response.approval_code.clone(),
            timestamp: Utc::now(),
        });

        if let (Some(record), Some(ledger)) = (&record, &self.ledger) {
            if let Err(e) = ledger.append_refund(record).await {
                tracing::error!(
                    "Failed to link refund to {}: {}",
                    record.original_transaction_id,
                    e
                );
            }
        }

        Ok(PartialRefundOutcome {
            request: request.clone(),
            response,
            record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::client;
    use crate::protocol::response::tests::card_payload;
    use crate::store::MemoryStore;
    use crate::transport::{MockHandle, MockTransport};
    use crate::EcrError;
    use std::sync::Arc;

    #[test]
    fn test_refund_bounds() {
        assert!(PartialRefundRequest::new("T1", 1000, 999, "01").validate(0).is_ok());
        assert!(PartialRefundRequest::new("T1", 1000, 1000, "01").validate(0).is_err());
        assert!(PartialRefundRequest::new("T1", 1000, 0, "01").validate(0).is_err());
        assert_eq!(
            PartialRefundRequest::new("T1", 1000, 400, "01").validate(700),
            Err(ValidationError::RefundExceedsRemaining {
                remaining: 300,
                refund: 400
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_not_below_original_sends_nothing() {
        let (mut client, handle) = client();
        let request = PartialRefundRequest::new("T1", 1000, 1000, "01");

        let err = client.partial_refund(&request).await.unwrap_err();
        assert!(matches!(
            err,
            EcrError::Validation(ValidationError::RefundAmount { .. })
        ));
        assert!(handle.writes().is_empty());
    }

    /// Client with a ledger holding one approved sale of 1000
    async fn client_with_sale() -> (EcrClient<MockTransport>, MockHandle, String) {
        let (client, handle) = client();
        let mut client = client.with_store(Arc::new(MemoryStore::new()));
        handle.script_exchange(card_payload("R200", "00", "000076", 1000));
        client.sale("01", 1000).await.unwrap();
        let id = client.ledger().unwrap().transactions().await.unwrap()[0].id.clone();
        (client, handle, id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_of_unknown_original_sends_nothing() {
        let (mut client, handle, _) = client_with_sale().await;

        let request = PartialRefundRequest::new("NO-SUCH-TXN", 1000, 600, "01");
        let err = client.partial_refund(&request).await.unwrap_err();
        assert!(matches!(
            err,
            EcrError::Validation(ValidationError::RefundOriginalNotFound(_))
        ));
        assert_eq!(handle.sent_payloads().len(), 1);
        assert_eq!(
            client.ledger().unwrap().refunded_total("NO-SUCH-TXN").await.unwrap(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_with_wrong_original_amount_sends_nothing() {
        let (mut client, handle, id) = client_with_sale().await;

        let request = PartialRefundRequest::new(id, 5000, 600, "01");
        let err = client.partial_refund(&request).await.unwrap_err();
        assert!(matches!(
            err,
            EcrError::Validation(ValidationError::RefundOriginalAmount {
                recorded: 1000,
                requested: 5000,
                ..
            })
        ));
        assert_eq!(handle.sent_payloads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refund_of_declined_original_sends_nothing() {
        let (client, handle) = client();
        let mut client = client.with_store(Arc::new(MemoryStore::new()));
        handle.script_exchange(card_payload("R200", "51", "000079", 1000));
        client.sale("01", 1000).await.unwrap();
        let id = client.ledger().unwrap().transactions().await.unwrap()[0].id.clone();

        let err = client
            .partial_refund(&PartialRefundRequest::new(id, 1000, 300, "01"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EcrError::Validation(ValidationError::RefundOriginalNotApproved { .. })
        ));
        assert_eq!(handle.sent_payloads().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_approved_refund_is_linked_and_counted() {
        let (mut client, handle, id) = client_with_sale().await;
        handle.script_exchange(card_payload("R203", "00", "000077", 600));

        let first = PartialRefundRequest::new(id.clone(), 1000, 600, "01");
        let outcome = client.partial_refund(&first).await.unwrap();
        assert!(outcome.record.is_some());
        assert!(handle.sent_payloads()[1].starts_with("C20301000000000600000000001000"));
        assert_eq!(client.ledger().unwrap().refunds(&id).await.unwrap().len(), 1);

        // 600 already refunded, only 400 remain
        let second = PartialRefundRequest::new(id, 1000, 500, "01");
        let err = client.partial_refund(&second).await.unwrap_err();
        assert!(matches!(
            err,
            EcrError::Validation(ValidationError::RefundExceedsRemaining { remaining: 400, .. })
        ));
        assert_eq!(handle.sent_payloads().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_declined_refund_has_no_record() {
        let (mut client, handle, id) = client_with_sale().await;
        handle.script_exchange(card_payload("R203", "05", "000078", 300));

        let outcome = client
            .partial_refund(&PartialRefundRequest::new(id.clone(), 1000, 300, "01"))
            .await
            .unwrap();
        assert!(!outcome.response.is_approved);
        assert!(outcome.record.is_none());
        assert_eq!(client.ledger().unwrap().refunded_total(&id).await.unwrap(), 0);
    }
}
