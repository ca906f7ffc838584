//! Fee-splitter contract client.
//!
//! The splitter embeds the fee policy in the ledger: `splitPayment` forwards
//! the net amount to the recipient and the fee to the treasury in one call.
//! This is the second phase of a splitter settlement, signed by the
//! facilitator key, so it runs under the nonce-retry discipline, unlike the
//! authorization-spend, which is bound to a user-signed nonce and must never
//! be retried.

use std::time::Duration;

use alloy::primitives::{Address, U256};
use alloy::providers::Provider;

use crate::chain::{send_and_confirm, IFeeSplitter, SpendError, SpendOutcome};
use crate::error::FacilitatorError;

/// Maximum submission attempts for a facilitator-signed call.
pub const MAX_SPLIT_ATTEMPTS: u32 = 3;

/// Backoff unit; the wait is `3s * attempt`.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(3);

/// The second-phase transfer to execute.
#[derive(Debug, Clone)]
pub struct SplitRequest {
    pub token: Address,
    pub payer: Address,
    pub recipient: Address,
    pub amount: U256,
}

/// Per-deployment context for splitter calls.
#[derive(Debug, Clone)]
pub struct SplitContext {
    pub splitter: Address,
    pub facilitator: Address,
    pub confirmations: u64,
    pub timeout: Duration,
    /// Refuse to submit above this fee per gas (wei). `None` = no cap.
    pub max_gas_price: Option<u128>,
}

/// Whether an RPC error message indicates a facilitator-key nonce conflict
/// worth retrying with a fee bump.
pub fn is_nonce_conflict(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("replacement transaction underpriced")
        || m.contains("nonce too low")
        || m.contains("already known")
}

/// Invoke `splitPayment` on the splitter contract.
///
/// Local checks mirror the contract's hard rejects so an obviously doomed
/// call never reaches the chain, then an `eth_call` simulation catches
/// paused/whitelist/cap state before gas is spent. The submission loop
/// queries the facilitator's pending nonce explicitly each attempt, and on a
/// nonce conflict bumps `maxFeePerGas` 1.5x and `maxPriorityFeePerGas` 2x
/// per attempt, up to [`MAX_SPLIT_ATTEMPTS`].
pub async fn split_payment<P: Provider>(
    provider: &P,
    ctx: &SplitContext,
    req: &SplitRequest,
) -> Result<SpendOutcome, FacilitatorError> {
    if req.amount < U256::from(1) {
        return Err(FacilitatorError::InvalidPayment(
            "split amount must be at least 1".to_string(),
        ));
    }
    if req.recipient == Address::ZERO || req.recipient == ctx.splitter {
        return Err(FacilitatorError::InvalidPayment(
            "split recipient must not be zero or the splitter itself".to_string(),
        ));
    }

    let contract = IFeeSplitter::new(ctx.splitter, provider);

    contract
        .splitPayment(req.token, req.payer, req.recipient, req.amount)
        .from(ctx.facilitator)
        .call()
        .await
        .map_err(|e| FacilitatorError::Chain(format!("split simulation failed: {e}")))?;

    let mut last_error = String::new();
    for attempt in 1..=MAX_SPLIT_ATTEMPTS {
        // Pending nonce queried explicitly, never from a cache: a prior
        // settlement in this process has just consumed one.
        let nonce = provider
            .get_transaction_count(ctx.facilitator)
            .pending()
            .await
            .map_err(|e| FacilitatorError::Chain(format!("pending nonce query failed: {e}")))?;

        let estimate = provider
            .estimate_eip1559_fees()
            .await
            .map_err(|e| FacilitatorError::Chain(format!("fee estimation failed: {e}")))?;

        let mut max_fee = estimate.max_fee_per_gas;
        let mut priority_fee = estimate.max_priority_fee_per_gas;
        for _ in 1..attempt {
            max_fee = max_fee.saturating_mul(3) / 2;
            priority_fee = priority_fee.saturating_mul(2);
        }

        if let Some(cap) = ctx.max_gas_price {
            if max_fee > cap {
                return Err(FacilitatorError::Chain(format!(
                    "fee per gas {max_fee} exceeds configured maximum {cap}"
                )));
            }
        }

        let builder = contract
            .splitPayment(req.token, req.payer, req.recipient, req.amount)
            .nonce(nonce)
            .max_fee_per_gas(max_fee)
            .max_priority_fee_per_gas(priority_fee);

        match send_and_confirm(builder, ctx.confirmations, ctx.timeout).await {
            Ok(outcome) => {
                if attempt > 1 {
                    tracing::info!(attempt, tx = %outcome.tx_hash, "split succeeded after retry");
                }
                return Ok(outcome);
            }
            Err(SpendError::Send(message))
                if is_nonce_conflict(&message) && attempt < MAX_SPLIT_ATTEMPTS =>
            {
                tracing::warn!(
                    attempt,
                    error = %message,
                    "split nonce conflict, backing off and bumping fees"
                );
                tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                last_error = message;
            }
            Err(e) => {
                return Err(FacilitatorError::Chain(format!("split failed: {e}")));
            }
        }
    }

    Err(FacilitatorError::Chain(format!(
        "split retries exhausted: {last_error}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_conflict_classification() {
        assert!(is_nonce_conflict("replacement transaction underpriced"));
        assert!(is_nonce_conflict("Nonce too low: next nonce 5"));
        assert!(is_nonce_conflict("transaction already known"));
        assert!(!is_nonce_conflict("execution reverted: not whitelisted"));
        assert!(!is_nonce_conflict("insufficient funds for gas"));
        assert!(!is_nonce_conflict(""));
    }
}
