//! Split payments: one total paid through 2 to 5 legs
//!
//! Legs run in order. When a leg fails, every approved leg before it is
//! voided, newest first. A reversal is attempted once and its outcome is
//! recorded on the leg; nothing re-reverses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ledger::new_id;
use super::EcrClient;
use crate::error::ValidationError;
use crate::protocol::{encode_payload, Command, ResponseRecord};
use crate::transport::ByteTransport;
use crate::Result;

pub const MIN_LEGS: usize = 2;
pub const MAX_LEGS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    Card,
    Wallet,
}

/// One planned leg before execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitLegRequest {
    pub method: PaymentMethod,
    pub amount: u64,
    pub host: String,
    pub qr_code_id: Option<String>,
}

impl SplitLegRequest {
    pub fn card(host: impl Into<String>, amount: u64) -> Self {
        Self {
            method: PaymentMethod::Card,
            amount,
            host: host.into(),
            qr_code_id: None,
        }
    }

    pub fn wallet(host: impl Into<String>, qr_code_id: impl Into<String>, amount: u64) -> Self {
        Self {
            method: PaymentMethod::Wallet,
            amount,
            host: host.into(),
            qr_code_id: Some(qr_code_id.into()),
        }
    }

    fn command(&self) -> Command {
        match self.method {
            PaymentMethod::Card => Command::sale(self.host.clone(), self.amount),
            PaymentMethod::Wallet => Command::wallet_sale(
                self.host.clone(),
                self.amount,
                self.qr_code_id.clone().unwrap_or_default(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPlan {
    pub total: u64,
    pub legs: Vec<SplitLegRequest>,
}

impl SplitPlan {
    pub fn new(total: u64, legs: Vec<SplitLegRequest>) -> Self {
        Self { total, legs }
    }

    /// Check the whole plan; nothing is sent unless every leg would encode
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if !(MIN_LEGS..=MAX_LEGS).contains(&self.legs.len()) {
            return Err(ValidationError::SplitLegCount(self.legs.len()));
        }

        for (index, leg) in self.legs.iter().enumerate() {
            let leg_error = |reason: String| ValidationError::SplitLeg { index, reason };
            if leg.amount == 0 {
                return Err(leg_error("amount must be greater than zero".into()));
            }
            if leg.host.is_empty() {
                return Err(leg_error("host number is required".into()));
            }
            if leg.method == PaymentMethod::Wallet
                && leg.qr_code_id.as_deref().map_or(true, str::is_empty)
            {
                return Err(leg_error("wallet leg needs a QR code id".into()));
            }
            encode_payload(&leg.command()).map_err(|e| leg_error(e.to_string()))?;
        }

        let sum = self
            .legs
            .iter()
            .try_fold(0u64, |acc, leg| acc.checked_add(leg.amount))
            .unwrap_or(u64::MAX);
        if sum != self.total {
            return Err(ValidationError::SplitTotalMismatch {
                total: self.total,
                sum,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegOutcome {
    Pending,
    Approved,
    Declined { status_code: String },
    Cancelled,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReversalOutcome {
    Reversed { trace_number: String },
    Declined { status_code: String },
    Failed { error: String },
    /// The approved leg carried no trace number to void
    NotPossible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitLeg {
    pub method: PaymentMethod,
    pub amount: u64,
    pub host: String,
    pub qr_code_id: Option<String>,
    pub trace_number: Option<String>,
    pub outcome: LegOutcome,
    pub response: Option<ResponseRecord>,
    pub reversal: Option<ReversalOutcome>,
}

impl SplitLeg {
    fn planned(request: &SplitLegRequest) -> Self {
        Self {
            method: request.method,
            amount: request.amount,
            host: request.host.clone(),
            qr_code_id: request.qr_code_id.clone(),
            trace_number: None,
            outcome: LegOutcome::Pending,
            response: None,
            reversal: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPaymentTransaction {
    pub id: String,
    pub total: u64,
    pub legs: Vec<SplitLeg>,
    pub status: SplitStatus,
    pub created_at: DateTime<Utc>,
}

impl SplitPaymentTransaction {
    fn from_plan(plan: &SplitPlan) -> Self {
        Self {
            id: new_id(),
            total: plan.total,
            legs: plan.legs.iter().map(SplitLeg::planned).collect(),
            status: SplitStatus::Processing,
            created_at: Utc::now(),
        }
    }

    /// Sum of the legs that are approved and not reversed
    pub fn captured_amount(&self) -> u64 {
        self.legs
            .iter()
            .filter(|leg| leg.outcome == LegOutcome::Approved)
            .filter(|leg| !matches!(leg.reversal, Some(ReversalOutcome::Reversed { .. })))
            .map(|leg| leg.amount)
            .sum()
    }
}

impl<T: ByteTransport> EcrClient<T> {
    /// Run a split payment
    ///
    /// Plan errors are returned before any leg is sent. Leg failures are not
    /// errors: they show up in the returned transaction's status and legs.
    pub async fn split_payment(&mut self, plan: &SplitPlan) -> Result<SplitPaymentTransaction> {
        plan.validate()?;

        let mut split = SplitPaymentTransaction::from_plan(plan);
        tracing::info!(
            "Split payment {}: {} in {} legs",
            split.id,
            split.total,
            split.legs.len()
        );

        let mut failed_at = None;
        for (index, request) in plan.legs.iter().enumerate() {
            let cancelled = self.run_leg(&mut split.legs[index], request).await;
            if split.legs[index].outcome != LegOutcome::Approved {
                tracing::error!(
                    "Split payment {}: leg {} failed ({:?})",
                    split.id,
                    index + 1,
                    split.legs[index].outcome
                );
                failed_at = Some((index, cancelled));
                break;
            }
        }

        split.status = match failed_at {
            None => SplitStatus::Completed,
            Some((index, cancelled)) => {
                self.reverse_legs(&split.id, &mut split.legs[..index]).await;
                if cancelled {
                    SplitStatus::Cancelled
                } else {
                    SplitStatus::Failed
                }
            }
        };
        tracing::info!("Split payment {} finished: {:?}", split.id, split.status);

        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.save_split(&split).await {
                tracing::error!("Failed to record split payment {}: {}", split.id, e);
            }
        }
        Ok(split)
    }

    /// Run one leg and fill in its outcome; true when it was cancelled
    async fn run_leg(&mut self, leg: &mut SplitLeg, request: &SplitLegRequest) -> bool {
        match self.execute(&request.command()).await {
            Ok(response) => {
                let cancelled = response.is_user_cancelled();
                leg.outcome = if response.is_approved {
                    LegOutcome::Approved
                } else if cancelled {
                    LegOutcome::Cancelled
                } else {
                    LegOutcome::Declined {
                        status_code: response.status_code.clone(),
                    }
                };
                leg.trace_number = response.trace_number.clone();
                leg.response = Some(response);
                cancelled
            }
            Err(e) => {
                let cancelled = e.is_cancelled();
                leg.outcome = if cancelled {
                    LegOutcome::Cancelled
                } else {
                    LegOutcome::Failed {
                        error: e.to_string(),
                    }
                };
                cancelled
            }
        }
    }

    async fn reverse_legs(&mut self, split_id: &str, legs: &mut [SplitLeg]) {
        for (index, leg) in legs.iter_mut().enumerate().rev() {
            let Some(trace) = leg.trace_number.clone() else {
                tracing::error!("Split payment {}: leg {} has no trace number to void", split_id, index + 1);
                leg.reversal = Some(ReversalOutcome::NotPossible);
                continue;
            };

            tracing::warn!("Split payment {}: voiding leg {} (trace {})", split_id, index + 1, trace);
            let command = Command::void(leg.host.clone(), leg.amount, trace.clone());
            leg.reversal = Some(match self.run(&command, false).await {
                Ok(response) if response.is_approved => ReversalOutcome::Reversed { trace_number: trace },
                Ok(response) => {
                    tracing::error!(
                        "Split payment {}: void of leg {} declined ({})",
                        split_id,
                        index + 1,
                        response.status_code
                    );
                    ReversalOutcome::Declined {
                        status_code: response.status_code,
                    }
                }
                Err(e) => {
                    tracing::error!("Split payment {}: void of leg {} failed: {}", split_id, index + 1, e);
                    ReversalOutcome::Failed { error: e.to_string() }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::client;
    use crate::protocol::response::tests::{card_payload, void_payload, wallet_payload};
    use crate::store::MemoryStore;
    use crate::EcrError;
    use std::sync::Arc;

    fn three_legs() -> SplitPlan {
        SplitPlan::new(
            1000,
            vec![
                SplitLegRequest::card("01", 500),
                SplitLegRequest::card("02", 300),
                SplitLegRequest::wallet("EW", "01", 200),
            ],
        )
    }

    #[test]
    fn test_exact_sum_validates() {
        assert!(three_legs().validate().is_ok());
    }

    #[test]
    fn test_plan_shape_errors() {
        let mut plan = three_legs();
        plan.total = 999;
        assert_eq!(
            plan.validate(),
            Err(ValidationError::SplitTotalMismatch { total: 999, sum: 1000 })
        );

        let single = SplitPlan::new(100, vec![SplitLegRequest::card("01", 100)]);
        assert_eq!(single.validate(), Err(ValidationError::SplitLegCount(1)));

        let zero = SplitPlan::new(
            100,
            vec![SplitLegRequest::card("01", 100), SplitLegRequest::card("01", 0)],
        );
        assert!(matches!(zero.validate(), Err(ValidationError::SplitLeg { index: 1, .. })));

        let bad_qr = SplitPlan::new(
            200,
            vec![SplitLegRequest::card("01", 100), SplitLegRequest::wallet("EW", "99", 100)],
        );
        assert!(matches!(bad_qr.validate(), Err(ValidationError::SplitLeg { index: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_by_one_sum_sends_nothing() {
        let (mut client, handle) = client();
        let mut plan = three_legs();
        plan.total = 1001;

        let err = client.split_payment(&plan).await.unwrap_err();
        assert!(matches!(
            err,
            EcrError::Validation(ValidationError::SplitTotalMismatch { .. })
        ));
        assert!(handle.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_legs_approved() {
        let (client, handle) = client();
        let mut client = client.with_store(Arc::new(MemoryStore::new()));
        handle
            .script_exchange(card_payload("R200", "00", "000001", 500))
            .script_exchange(card_payload("R200", "00", "000002", 300))
            .script_exchange(wallet_payload("R290", "00", "000003", 200));

        let split = client.split_payment(&three_legs()).await.unwrap();
        assert_eq!(split.status, SplitStatus::Completed);
        assert_eq!(split.captured_amount(), 1000);
        assert!(split.legs.iter().all(|leg| leg.reversal.is_none()));

        let stored = client.ledger().unwrap().split(&split.id).await.unwrap();
        assert_eq!(stored, Some(split));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_leg_decline_reverses_first_only() {
        let (mut client, handle) = client();
        handle
            .script_exchange(card_payload("R200", "00", "000001", 500))
            .script_exchange(card_payload("R200", "51", "000002", 300))
            .script_exchange(void_payload("00", "000001"));

        let split = client.split_payment(&three_legs()).await.unwrap();
        assert_eq!(split.status, SplitStatus::Failed);
        assert_eq!(
            split.legs[0].reversal,
            Some(ReversalOutcome::Reversed {
                trace_number: "000001".into()
            })
        );
        assert!(split.legs[1].reversal.is_none());
        assert_eq!(split.legs[2].outcome, LegOutcome::Pending);

        let sent = handle.sent_payloads();
        assert_eq!(sent.len(), 3);
        assert!(sent[2].starts_with("C20101000000000500000001"));
        assert_eq!(handle.pending_reactions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reversal_runs_newest_first() {
        let (mut client, handle) = client();
        let plan = SplitPlan::new(
            600,
            vec![
                SplitLegRequest::card("01", 100),
                SplitLegRequest::card("02", 200),
                SplitLegRequest::card("03", 300),
            ],
        );
        handle
            .script_exchange(card_payload("R200", "00", "000011", 100))
            .script_exchange(card_payload("R200", "00", "000012", 200))
            .script_exchange(card_payload("R200", "05", "000013", 300))
            .script_exchange(void_payload("00", "000012"))
            .script_exchange(void_payload("00", "000011"));

        let split = client.split_payment(&plan).await.unwrap();
        assert_eq!(split.status, SplitStatus::Failed);
        assert_eq!(split.captured_amount(), 0);

        let sent = handle.sent_payloads();
        assert!(sent[3].starts_with("C20102000000000200000012"));
        assert!(sent[4].starts_with("C20101000000000100000011"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_cancel_marks_split_cancelled() {
        let (mut client, handle) = client();
        handle
            .script_exchange(card_payload("R200", "00", "000001", 500))
            .script_exchange(card_payload("R200", "UC", "000002", 300))
            .script_exchange(void_payload("00", "000001"));

        let split = client.split_payment(&three_legs()).await.unwrap();
        assert_eq!(split.status, SplitStatus::Cancelled);
        assert_eq!(split.legs[1].outcome, LegOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reversal_is_recorded() {
        let (mut client, handle) = client();
        handle
            .script_exchange(card_payload("R200", "00", "000001", 500))
            .script_exchange(card_payload("R200", "51", "000002", 300))
            .script_exchange(void_payload("12", "000001"));

        let split = client.split_payment(&three_legs()).await.unwrap();
        assert_eq!(
            split.legs[0].reversal,
            Some(ReversalOutcome::Declined {
                status_code: "12".into()
            })
        );
        assert_eq!(split.captured_amount(), 500);
    }
}
