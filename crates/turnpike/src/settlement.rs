//! The settlement orchestrator: turns a verified authorization into an
//! atomic on-chain outcome and a durable record of same, with webhook
//! notification.
//!
//! The orchestrator owns each audit record's lifecycle end to end. Records
//! open `pending` before any on-chain activity and advance to exactly one
//! terminal state. The nonce is marked used only on the fully-successful
//! path, and *before* the audit record turns `success`, so invariant
//! "every success has its nonce on file" holds even across a crash between
//! the two writes.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Bytes, U256};
use alloy::providers::Provider;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::audit::{AuditError, AuditLog, NewTransaction, TransactionPatch, TxStatus};
use crate::chain::SpendCall;
use crate::eip712;
use crate::error::FacilitatorError;
use crate::nonce_store::NonceStore;
use crate::payment::{ExactPayload, PaymentPayload, PaymentRequirements};
use crate::reason::ErrorReason;
use crate::response::SettleResponse;
use crate::security::redact_address;
use crate::splitter::SplitRequest;
use crate::submitter::{JobOutcome, SettleJob, SubmitterHandle};
use crate::tokens::net_and_fee;
use crate::verifier::{Evaluated, Verifier};

/// Settlement knobs validated at startup.
#[derive(Debug, Clone)]
pub struct SettlementSettings {
    /// Bound on each on-chain confirmation wait.
    pub timeout: Duration,
    /// Amounts below this are refused at settle time. Zero disables.
    pub min_settlement_unit: U256,
}

impl Default for SettlementSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            min_settlement_unit: U256::ZERO,
        }
    }
}

/// Event emitted at each terminal settlement outcome, consumed by the
/// webhook dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub event: String,
    pub timestamp: u64,
    pub data: SettlementEventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementEventData {
    pub transaction_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub payer: String,
    pub receiver: String,
    pub token: String,
    pub amount: String,
    pub fee: String,
    pub network: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

pub const EVENT_SETTLEMENT_SUCCESS: &str = "settlement.success";
pub const EVENT_SETTLEMENT_FAILED: &str = "settlement.failed";

pub struct SettlementOrchestrator<P> {
    verifier: Verifier<P>,
    audit: AuditLog,
    nonces: Arc<dyn NonceStore>,
    submitter: SubmitterHandle,
    settings: SettlementSettings,
    events: Option<mpsc::UnboundedSender<SettlementEvent>>,
    /// Process-local claim per (payer, nonce): the first settle to claim a
    /// pair wins; concurrent duplicates answer `nonce_already_used` without
    /// reaching the chain.
    in_flight: DashMap<(String, String), ()>,
}

impl<P> SettlementOrchestrator<P>
where
    P: Provider + Send + Sync + 'static,
{
    pub fn new(
        verifier: Verifier<P>,
        audit: AuditLog,
        nonces: Arc<dyn NonceStore>,
        submitter: SubmitterHandle,
        settings: SettlementSettings,
        events: Option<mpsc::UnboundedSender<SettlementEvent>>,
    ) -> Self {
        Self {
            verifier,
            audit,
            nonces,
            submitter,
            settings,
            events,
            in_flight: DashMap::new(),
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn verifier(&self) -> &Verifier<P> {
        &self.verifier
    }

    fn network(&self) -> String {
        self.verifier.config().network.clone()
    }

    /// Settle a payment. Idempotent per (payer, nonce): a second call with a
    /// previously used nonce fails with `nonce_already_used` and no on-chain
    /// effect.
    ///
    /// The work runs on a detached task so that bookkeeping for a submitted
    /// spend completes even when the HTTP caller disconnects mid-settlement.
    pub async fn settle(
        self: &Arc<Self>,
        payload: PaymentPayload,
        requirements: PaymentRequirements,
    ) -> SettleResponse {
        let orchestrator = Arc::clone(self);
        let network = self.network();
        match tokio::spawn(async move { orchestrator.settle_inner(payload, requirements).await })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "settlement task panicked");
                SettleResponse::rejected(ErrorReason::UnexpectedSettleError, None, &network)
            }
        }
    }

    async fn settle_inner(
        &self,
        payload: PaymentPayload,
        requirements: PaymentRequirements,
    ) -> SettleResponse {
        let network = self.network();

        // Defence in depth: the caller may have raced between verify and
        // settle, or skipped verify entirely.
        let evaluated = match self.verifier.evaluate(&payload, &requirements, true).await {
            Ok(evaluated) => evaluated,
            Err((reason, payer)) => {
                return SettleResponse::rejected(
                    reason,
                    payer.map(|a| format!("{a:#x}")),
                    &network,
                );
            }
        };

        let payer_hex = format!("{:#x}", evaluated.payer);

        if !self.settings.min_settlement_unit.is_zero()
            && evaluated.amount < self.settings.min_settlement_unit
        {
            return SettleResponse::rejected(
                ErrorReason::InvalidAuthorizationValueTooLow,
                Some(payer_hex),
                &network,
            );
        }

        // Claim the pair for this process before any on-chain work.
        let claim_key = (payer_hex.clone(), evaluated.nonce_hex.clone());
        if self.in_flight.insert(claim_key.clone(), ()).is_some() {
            tracing::warn!(
                payer = %redact_address(&payer_hex),
                "concurrent settle for the same (payer, nonce)"
            );
            return SettleResponse::rejected(
                ErrorReason::NonceAlreadyUsed,
                Some(payer_hex),
                &network,
            );
        }

        let response = self
            .settle_claimed(&payload, &requirements, &evaluated, &payer_hex, &network)
            .await;

        self.in_flight.remove(&claim_key);
        response
    }

    async fn settle_claimed(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
        evaluated: &Evaluated,
        payer_hex: &str,
        network: &str,
    ) -> SettleResponse {
        let config = self.verifier.config();
        let fee_bps = evaluated.token.effective_fee_bps();
        let (net_amount, fee_amount) = net_and_fee(evaluated.amount, fee_bps);

        // Destination. When payTo is this chain's splitter, the spend moves
        // the full amount into the splitter and a second call forwards the
        // net to the actual recipient.
        let splitter_in_use = config.splitter.is_some_and(|s| s == requirements.pay_to);
        let actual_recipient = requirements
            .extra
            .as_ref()
            .and_then(|e| e.actual_recipient)
            .or(config.treasury);

        if splitter_in_use && actual_recipient.is_none() {
            return SettleResponse::rejected(
                ErrorReason::FacilitatorNotConfigured,
                Some(payer_hex.to_string()),
                network,
            );
        }

        let ultimate_receiver = if splitter_in_use {
            actual_recipient.expect("checked above")
        } else {
            requirements.pay_to
        };

        // The audit record must exist before any on-chain activity.
        let record = NewTransaction {
            nonce: evaluated.nonce_hex.clone(),
            payer: payer_hex.to_string(),
            receiver: format!("{ultimate_receiver:#x}"),
            token_address: format!("{:#x}", evaluated.token.address),
            token_symbol: evaluated.token.symbol.clone(),
            amount: evaluated.amount.to_string(),
            fee: fee_amount.to_string(),
            fee_bps,
            network: network.to_string(),
            protocol: evaluated.protocol,
        };
        let record_id = match self.audit.create(&record) {
            Ok(id) => id,
            Err(AuditError::Duplicate { status }) => {
                tracing::warn!(
                    payer = %redact_address(payer_hex),
                    existing = status.as_str(),
                    "settle refused: audit record already exists for this (payer, nonce)"
                );
                return SettleResponse::rejected(
                    ErrorReason::NonceAlreadyUsed,
                    Some(payer_hex.to_string()),
                    network,
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "audit store unavailable, aborting before chain");
                return SettleResponse::rejected(
                    ErrorReason::UnexpectedSettleError,
                    Some(payer_hex.to_string()),
                    network,
                );
            }
        };

        let spend = match build_spend_call(payload, requirements, evaluated) {
            Ok(spend) => spend,
            Err(e) => {
                tracing::error!(error = %e, "spend construction failed after verification");
                self.finish_failed(
                    record_id,
                    &record,
                    None,
                    "spend construction failed",
                    ErrorReason::UnexpectedSettleError,
                );
                return self.failed_response(
                    record_id,
                    ErrorReason::UnexpectedSettleError,
                    payer_hex,
                    None,
                    network,
                );
            }
        };

        let split = splitter_in_use.then(|| SplitRequest {
            token: evaluated.token.address,
            payer: evaluated.payer,
            recipient: ultimate_receiver,
            amount: evaluated.amount,
        });

        // Record the spend's ledger id as soon as the RPC accepts it.
        let (submitted_tx, submitted_rx) = oneshot::channel::<String>();
        {
            let audit = self.audit.clone();
            tokio::spawn(async move {
                if let Ok(tx_id) = submitted_rx.await {
                    if let Err(e) = audit.record_ledger_tx(record_id, &tx_id) {
                        tracing::warn!(error = %e, "failed to note in-flight ledger id");
                    }
                }
            });
        }

        let job = SettleJob {
            spend,
            split,
            timeout: self.settings.timeout,
            submitted: Some(submitted_tx),
        };

        let outcome = match self.submitter.submit(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "submission queue failure");
                self.finish_failed(
                    record_id,
                    &record,
                    None,
                    &e.to_string(),
                    ErrorReason::UnexpectedSettleError,
                );
                return self.failed_response(
                    record_id,
                    ErrorReason::UnexpectedSettleError,
                    payer_hex,
                    None,
                    network,
                );
            }
        };

        match outcome {
            JobOutcome::SimulationFailed { error } => {
                self.finish_failed(
                    record_id,
                    &record,
                    None,
                    &format!("simulation failed: {error}"),
                    ErrorReason::TransactionReverted,
                );
                self.failed_response(
                    record_id,
                    ErrorReason::TransactionReverted,
                    payer_hex,
                    None,
                    network,
                )
            }
            JobOutcome::SpendFailed { error } => {
                self.finish_failed(
                    record_id,
                    &record,
                    None,
                    &format!("spend failed: {error}"),
                    ErrorReason::UnexpectedSettleError,
                );
                self.failed_response(
                    record_id,
                    ErrorReason::UnexpectedSettleError,
                    payer_hex,
                    None,
                    network,
                )
            }
            JobOutcome::SpendReverted { tx_hash } => {
                self.finish_failed(
                    record_id,
                    &record,
                    Some(tx_hash.clone()),
                    &format!("spend reverted: {tx_hash}"),
                    ErrorReason::TransactionReverted,
                );
                self.failed_response(
                    record_id,
                    ErrorReason::TransactionReverted,
                    payer_hex,
                    Some(tx_hash),
                    network,
                )
            }
            JobOutcome::SpendTimeout { tx_hash } => {
                // The authorization may still mine; the nonce stays unmarked
                // so the ledger remains the arbiter on retry.
                self.finish_failed(
                    record_id,
                    &record,
                    tx_hash.clone(),
                    &match &tx_hash {
                        Some(h) => format!("confirmation timed out, spend in flight: {h}"),
                        None => "confirmation timed out before submission".to_string(),
                    },
                    ErrorReason::TransactionTimeout,
                );
                self.failed_response(
                    record_id,
                    ErrorReason::TransactionTimeout,
                    payer_hex,
                    tx_hash,
                    network,
                )
            }
            JobOutcome::SplitFailed { spend_tx, error } => {
                // Stuck-funds case: the authorization has been consumed
                // on-chain but the splitter holds the gross amount. The nonce
                // stays unmarked so the store does not disguise this as a
                // completed settlement; the audit error carries the spend id
                // operators need for recovery.
                tracing::error!(
                    spend_tx = %spend_tx,
                    error = %error,
                    "split failed after spend, funds held by splitter"
                );
                self.finish_failed(
                    record_id,
                    &record,
                    Some(spend_tx.clone()),
                    &format!(
                        "splitPayment failed after authorization-spend {spend_tx}: {error}; \
                         funds held by splitter pending operator recovery"
                    ),
                    ErrorReason::TransactionReverted,
                );
                self.failed_response(
                    record_id,
                    ErrorReason::TransactionReverted,
                    payer_hex,
                    Some(spend_tx),
                    network,
                )
            }
            JobOutcome::Success {
                spend_tx,
                split_tx,
                block_number,
            } => {
                self.finish_success(
                    record_id,
                    &record,
                    evaluated,
                    payer_hex,
                    spend_tx,
                    split_tx,
                    block_number,
                    fee_amount,
                    net_amount,
                    network,
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_success(
        &self,
        record_id: i64,
        record: &NewTransaction,
        evaluated: &Evaluated,
        payer_hex: &str,
        spend_tx: String,
        split_tx: Option<String>,
        block_number: Option<u64>,
        fee_amount: U256,
        net_amount: U256,
        network: &str,
    ) -> SettleResponse {
        let terminal_tx = split_tx.clone().unwrap_or_else(|| spend_tx.clone());

        // Nonce first, then the audit flip: a success record without its
        // nonce on file must be impossible.
        if let Err(e) = self.nonces.mark_used(
            payer_hex,
            &evaluated.nonce_hex,
            &format!("{:#x}", evaluated.token.address),
            &terminal_tx,
        ) {
            tracing::error!(
                error = %e,
                tx = %terminal_tx,
                "nonce marking failed after on-chain success; replay protection uncertain"
            );
            self.finish_failed(
                record_id,
                record,
                Some(terminal_tx.clone()),
                &format!(
                    "settled on-chain as {terminal_tx} but nonce marking failed: {e}; \
                     replay protection is uncertain"
                ),
                ErrorReason::UnexpectedSettleError,
            );
            return self.failed_response(
                record_id,
                ErrorReason::UnexpectedSettleError,
                payer_hex,
                Some(terminal_tx),
                network,
            );
        }

        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self.audit.update(
            record_id,
            &TransactionPatch {
                status: Some(TxStatus::Success),
                ledger_tx_id: Some(terminal_tx.clone()),
                error_reason: None,
                settled_at: Some(now),
            },
        ) {
            // The settlement is real; only the bookkeeping flip failed.
            tracing::error!(error = %e, tx = %terminal_tx, "audit success update failed");
        }

        tracing::info!(
            payer = %redact_address(payer_hex),
            amount = %evaluated.amount,
            fee = %fee_amount,
            net = %net_amount,
            tx = %terminal_tx,
            protocol = %evaluated.protocol,
            "settlement succeeded"
        );

        self.emit(
            EVENT_SETTLEMENT_SUCCESS,
            record_id,
            record,
            Some(terminal_tx.clone()),
            "success",
            None,
        );

        SettleResponse {
            success: true,
            error_reason: None,
            payer: Some(payer_hex.to_string()),
            ledger_tx_id: Some(terminal_tx),
            block_number,
            fee: Some(fee_amount.to_string()),
            protocol: Some(evaluated.protocol),
            transaction_id: Some(record_id),
            network: network.to_string(),
        }
    }

    /// Persist a terminal failure and emit the failure event.
    fn finish_failed(
        &self,
        record_id: i64,
        record: &NewTransaction,
        tx_hash: Option<String>,
        detail: &str,
        reason: ErrorReason,
    ) {
        if let Err(e) = self.audit.update(
            record_id,
            &TransactionPatch {
                status: Some(TxStatus::Failed),
                ledger_tx_id: tx_hash.clone(),
                error_reason: Some(detail.to_string()),
                settled_at: None,
            },
        ) {
            tracing::error!(error = %e, "audit failure update failed");
        }
        self.emit(
            EVENT_SETTLEMENT_FAILED,
            record_id,
            record,
            tx_hash,
            "failed",
            Some(reason.as_str().to_string()),
        );
    }

    fn failed_response(
        &self,
        record_id: i64,
        reason: ErrorReason,
        payer_hex: &str,
        tx_hash: Option<String>,
        network: &str,
    ) -> SettleResponse {
        SettleResponse {
            success: false,
            error_reason: Some(reason),
            payer: Some(payer_hex.to_string()),
            ledger_tx_id: tx_hash,
            block_number: None,
            fee: None,
            protocol: None,
            transaction_id: Some(record_id),
            network: network.to_string(),
        }
    }

    fn emit(
        &self,
        event: &str,
        record_id: i64,
        record: &NewTransaction,
        tx_hash: Option<String>,
        status: &str,
        error_reason: Option<String>,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let _ = events.send(SettlementEvent {
            event: event.to_string(),
            timestamp,
            data: SettlementEventData {
                transaction_id: record_id,
                tx_hash,
                payer: record.payer.clone(),
                receiver: record.receiver.clone(),
                token: record.token_address.clone(),
                amount: record.amount.clone(),
                fee: record.fee.clone(),
                network: record.network.clone(),
                status: status.to_string(),
                error_reason,
            },
        });
    }
}

/// Build the on-chain spend from a payload that already passed verification.
fn build_spend_call(
    payload: &PaymentPayload,
    requirements: &PaymentRequirements,
    evaluated: &Evaluated,
) -> Result<SpendCall, FacilitatorError> {
    match &payload.payload {
        ExactPayload::WitnessSpend(ws) => {
            let auth = &ws.authorization;
            Ok(SpendCall::WitnessSpend {
                token: auth.permitted.token,
                amount: evaluated.amount,
                nonce: eip712::parse_u256(&auth.nonce)?,
                deadline: U256::from(auth.deadline),
                owner: evaluated.payer,
                spender: auth.spender,
                // The spend always pays the requirements' payTo; when that is
                // the splitter, the second phase forwards the net amount.
                to: requirements.pay_to,
                requested_amount: evaluated.amount,
                valid_after: U256::from(auth.witness.valid_after),
                valid_before: U256::from(auth.witness.valid_before),
                witness: eip712::witness_hash(auth),
                signature: Bytes::from(evaluated.signature.clone()),
            })
        }
        ExactPayload::DirectAuth(da) => {
            let auth = &da.authorization;
            Ok(SpendCall::DirectAuth {
                token: requirements.asset,
                from: auth.from,
                to: auth.to,
                value: evaluated.amount,
                valid_after: U256::from(auth.valid_after),
                valid_before: U256::from(auth.valid_before),
                nonce: eip712::parse_nonce32(&auth.nonce)?,
                signature: Bytes::from(evaluated.signature.clone()),
            })
        }
    }
}
