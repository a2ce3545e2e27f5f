//! Transaction, split payment and refund records on top of a [`KeyValueStore`]
//!
//! Keys: `txn:<id>`, `split:<id>`, `refunds:<original id>` (a JSON list).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::refund::PartialRefundRecord;
use super::split::SplitPaymentTransaction;
use crate::protocol::{ResponseRecord, TransactionFamily};
use crate::store::{get_json, put_json, KeyValueStore};
use crate::Result;

const TXN_PREFIX: &str = "txn:";
const SPLIT_PREFIX: &str = "split:";
const REFUNDS_PREFIX: &str = "refunds:";

/// One decoded terminal transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub family: TransactionFamily,
    pub amount: Option<u64>,
    pub host: Option<String>,
    pub trace_number: Option<String>,
    pub approval_code: Option<String>,
    pub status_code: String,
    pub approved: bool,
    pub timestamp: DateTime<Utc>,
}

/// Time-ordered id with a random suffix, e.g. `20261019143000-3fa2c1`
pub fn new_id() -> String {
    format!(
        "{}-{:06x}",
        Utc::now().format("%Y%m%d%H%M%S"),
        rand::random::<u32>() & 0x00FF_FFFF
    )
}

#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn KeyValueStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub async fn record_transaction(
        &self,
        response: &ResponseRecord,
        requested_amount: u64,
        requested_host: &str,
    ) -> Result<TransactionRecord> {
        let record = TransactionRecord {
            id: new_id(),
            family: response.family,
            amount: response.amount.or(Some(requested_amount)),
            host: response
                .host_number
                .clone()
                .or_else(|| Some(requested_host.to_string()).filter(|h| !h.is_empty())),
            trace_number: response.trace_number.clone(),
            approval_code: response.approval_code.clone(),
            status_code: response.status_code.clone(),
            approved: response.is_approved,
            timestamp: Utc::now(),
        };
        put_json(self.store.as_ref(), &format!("{}{}", TXN_PREFIX, record.id), &record).await?;
        Ok(record)
    }

    pub async fn transaction(&self, id: &str) -> Result<Option<TransactionRecord>> {
        get_json(self.store.as_ref(), &format!("{}{}", TXN_PREFIX, id)).await
    }

    /// All recorded transactions, oldest first
    pub async fn transactions(&self) -> Result<Vec<TransactionRecord>> {
        let mut records = Vec::new();
        for key in self.store.list_keys(TXN_PREFIX).await? {
            if let Some(record) = get_json::<TransactionRecord>(self.store.as_ref(), &key).await? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    pub async fn save_split(&self, split: &SplitPaymentTransaction) -> Result<()> {
        put_json(self.store.as_ref(), &format!("{}{}", SPLIT_PREFIX, split.id), split).await
    }

    pub async fn split(&self, id: &str) -> Result<Option<SplitPaymentTransaction>> {
        get_json(self.store.as_ref(), &format!("{}{}", SPLIT_PREFIX, id)).await
    }

    pub async fn refunds(&self, original_id: &str) -> Result<Vec<PartialRefundRecord>> {
        let key = format!("{}{}", REFUNDS_PREFIX, original_id);
        Ok(get_json(self.store.as_ref(), &key).await?.unwrap_or_default())
    }

    /// Sum of approved partial refunds already linked to `original_id`
    pub async fn refunded_total(&self, original_id: &str) -> Result<u64> {
        Ok(self
            .refunds(original_id)
            .await?
            .iter()
            .map(|r| r.refund_amount)
            .sum())
    }

    pub async fn append_refund(&self, record: &PartialRefundRecord) -> Result<()> {
        let key = format!("{}{}", REFUNDS_PREFIX, record.original_transaction_id);
        let mut refunds = self.refunds(&record.original_transaction_id).await?;
        refunds.push(record.clone());
        put_json(self.store.as_ref(), &key, &refunds).await
    }
}
