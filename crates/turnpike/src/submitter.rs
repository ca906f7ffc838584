//! Single-worker submission queue for the facilitator signing key.
//!
//! Two concurrent settlements sharing the key would collide on its monotonic
//! ledger nonce, so every facilitator-signed transaction flows through one
//! worker task that owns the wallet provider. The channel gives FIFO order;
//! because no other code path can reach the signer, the single-writer
//! discipline survives refactors. Serialization is process-local: run one
//! facilitator process per signing key.

use std::time::Duration;

use alloy::primitives::Address;
use alloy::providers::Provider;
use tokio::sync::{mpsc, oneshot};

use crate::chain::{self, SpendCall, SpendError};
use crate::error::FacilitatorError;
use crate::splitter::{self, SplitContext, SplitRequest};

/// One settlement's on-chain work: simulate and submit the
/// authorization-spend, wait for confirmations, then optionally invoke the
/// fee splitter. The whole span executes inside the worker, so it is one
/// critical section.
#[derive(Debug)]
pub struct SettleJob {
    pub spend: SpendCall,
    pub split: Option<SplitRequest>,
    /// Bound on each confirmation wait.
    pub timeout: Duration,
    /// Fired with the spend's ledger id as soon as the RPC accepts it, so
    /// the audit record can reference an in-flight transaction.
    pub submitted: Option<oneshot::Sender<String>>,
}

/// Terminal outcome of a [`SettleJob`].
#[derive(Debug)]
pub enum JobOutcome {
    /// `eth_call` simulation failed; nothing reached the chain.
    SimulationFailed { error: String },
    /// The spend could not be submitted.
    SpendFailed { error: String },
    /// The spend reverted on-chain.
    SpendReverted { tx_hash: String },
    /// Confirmation wait exceeded the settlement timeout. The authorization
    /// may still mine; the nonce must not be marked used.
    SpendTimeout { tx_hash: Option<String> },
    /// The spend landed but the split did not: funds sit in the splitter
    /// awaiting operator recovery.
    SplitFailed { spend_tx: String, error: String },
    Success {
        spend_tx: String,
        split_tx: Option<String>,
        block_number: Option<u64>,
    },
}

struct QueuedJob {
    job: SettleJob,
    reply: oneshot::Sender<JobOutcome>,
}

/// Cloneable handle for enqueueing jobs. The worker processes them strictly
/// in arrival order.
#[derive(Clone)]
pub struct SubmitterHandle {
    sender: mpsc::Sender<QueuedJob>,
}

impl SubmitterHandle {
    /// Enqueue a job and wait for its outcome.
    pub async fn submit(&self, job: SettleJob) -> Result<JobOutcome, FacilitatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(QueuedJob {
                job,
                reply: reply_tx,
            })
            .await
            .map_err(|_| FacilitatorError::Chain("submission worker is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| FacilitatorError::Chain("submission worker dropped the job".to_string()))
    }
}

/// Parameters fixed for the worker's lifetime.
pub struct SubmitterConfig {
    pub facilitator: Address,
    pub permit2: Address,
    pub splitter: Option<Address>,
    pub confirmations: u64,
    /// Refuse to submit when the chain's gas price exceeds this (wei).
    pub max_gas_price: Option<u128>,
}

/// Spawn the submission worker that owns the facilitator's wallet provider.
pub fn spawn<P>(provider: P, config: SubmitterConfig) -> SubmitterHandle
where
    P: Provider + Send + Sync + 'static,
{
    let (sender, mut receiver) = mpsc::channel::<QueuedJob>(64);
    tokio::spawn(async move {
        while let Some(QueuedJob { job, reply }) = receiver.recv().await {
            let outcome = run_job(&provider, &config, job).await;
            // The orchestrator completes bookkeeping even if the HTTP caller
            // has disconnected, so a dropped receiver is harmless.
            let _ = reply.send(outcome);
        }
        tracing::info!("submission worker shutting down");
    });
    SubmitterHandle { sender }
}

async fn run_job<P: Provider>(provider: &P, config: &SubmitterConfig, job: SettleJob) -> JobOutcome {
    if let Some(cap) = config.max_gas_price {
        if let Ok(price) = provider.get_gas_price().await {
            if price > cap {
                return JobOutcome::SpendFailed {
                    error: format!("gas price {price} exceeds configured maximum {cap}"),
                };
            }
        }
    }

    if let Err(e) =
        chain::simulate_spend(provider, config.permit2, config.facilitator, &job.spend).await
    {
        return JobOutcome::SimulationFailed {
            error: e.to_string(),
        };
    }

    let (hash_tx, hash_rx) = oneshot::channel();
    if let Some(notify) = job.submitted {
        tokio::spawn(async move {
            if let Ok(hash) = hash_rx.await {
                let _ = notify.send(format!("{hash:#x}"));
            }
        });
    } else {
        drop(hash_rx);
    }

    let spend = match chain::submit_spend(
        provider,
        config.permit2,
        config.facilitator,
        &job.spend,
        config.confirmations,
        job.timeout,
        Some(hash_tx),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(SpendError::Reverted { tx_hash }) => {
            return JobOutcome::SpendReverted {
                tx_hash: format!("{tx_hash:#x}"),
            }
        }
        Err(SpendError::Timeout { tx_hash }) => {
            return JobOutcome::SpendTimeout {
                tx_hash: tx_hash.map(|h| format!("{h:#x}")),
            }
        }
        Err(e) => {
            return JobOutcome::SpendFailed {
                error: e.to_string(),
            }
        }
    };

    let spend_tx = format!("{:#x}", spend.tx_hash);

    let Some(split) = job.split else {
        return JobOutcome::Success {
            spend_tx,
            split_tx: None,
            block_number: spend.block_number,
        };
    };

    let Some(splitter_contract) = config.splitter else {
        // Destination selection should have prevented this.
        return JobOutcome::SplitFailed {
            spend_tx,
            error: "no splitter configured for this chain".to_string(),
        };
    };

    let ctx = SplitContext {
        splitter: splitter_contract,
        facilitator: config.facilitator,
        confirmations: config.confirmations,
        timeout: job.timeout,
        max_gas_price: config.max_gas_price,
    };

    match splitter::split_payment(provider, &ctx, &split).await {
        Ok(outcome) => JobOutcome::Success {
            spend_tx,
            split_tx: Some(format!("{:#x}", outcome.tx_hash)),
            block_number: outcome.block_number,
        },
        Err(e) => JobOutcome::SplitFailed {
            spend_tx,
            error: e.to_string(),
        },
    }
}
