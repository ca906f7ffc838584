//! Ledger adapter: ERC-20 reads and authorization-spend submission.
//!
//! Submissions here are the *user-signed* authorizations. They are bound to
//! a payer-signed nonce and are never retried by us; the nonce-retry loop in
//! [`crate::splitter`] wraps only our own facilitator-signed calls.

use std::time::Duration;

use alloy::contract::{CallBuilder, CallDecoder};
use alloy::primitives::{Address, Bytes, TxHash, B256, U256};
use alloy::providers::Provider;
use alloy::sol;
use thiserror::Error;

use crate::constants::WITNESS_TYPE_STRING;
use crate::error::FacilitatorError;

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
    }

    #[sol(rpc)]
    interface IERC3009 {
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            bytes signature
        ) external;
    }

    #[sol(rpc)]
    interface ISignatureTransfer {
        struct TokenPermissions {
            address token;
            uint256 amount;
        }

        struct PermitTransferFrom {
            TokenPermissions permitted;
            uint256 nonce;
            uint256 deadline;
        }

        struct SignatureTransferDetails {
            address to;
            uint256 requestedAmount;
        }

        function permitWitnessTransferFrom(
            PermitTransferFrom memory permit,
            SignatureTransferDetails calldata transferDetails,
            address owner,
            bytes32 witness,
            string calldata witnessTypeString,
            bytes calldata signature
        ) external;
    }

    /// Entry point shared by the public x402 proxy and the fee-splitter
    /// proxy: both are Permit2 spenders that relay
    /// `permitWitnessTransferFrom` on behalf of the caller, hashing the
    /// structured witness themselves.
    #[sol(rpc)]
    interface IPermit2Proxy {
        struct TokenPermissions {
            address token;
            uint256 amount;
        }

        struct PermitTransferFrom {
            TokenPermissions permitted;
            uint256 nonce;
            uint256 deadline;
        }

        struct SignatureTransferDetails {
            address to;
            uint256 requestedAmount;
        }

        struct TransferWitness {
            address receiver;
            uint256 validAfter;
            uint256 validBefore;
        }

        function permitWitnessTransferFrom(
            PermitTransferFrom memory permit,
            SignatureTransferDetails calldata transferDetails,
            address owner,
            TransferWitness calldata witness,
            bytes calldata signature
        ) external;
    }

    #[sol(rpc)]
    interface IFeeSplitter {
        event PaymentSplit(
            address indexed token,
            address indexed payer,
            address indexed recipient,
            uint256 grossAmount,
            uint256 netAmount,
            uint256 feeAmount,
            address facilitator
        );

        function splitPayment(address token, address payer, address recipient, uint256 amount)
            external
            returns (uint256 netAmount, uint256 feeAmount);

        function paused() external view returns (bool);

        function maxSettlementAmount() external view returns (uint256);
    }
}

/// Bound on the RPC round-trip for submitting a transaction. The
/// confirmation wait has its own, configurable bound.
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// One authorization-spend transaction, ready to simulate or submit.
#[derive(Debug, Clone)]
pub enum SpendCall {
    DirectAuth {
        token: Address,
        from: Address,
        to: Address,
        value: U256,
        valid_after: U256,
        valid_before: U256,
        nonce: B256,
        signature: Bytes,
    },
    WitnessSpend {
        token: Address,
        amount: U256,
        nonce: U256,
        deadline: U256,
        /// The payer recovered from the signature.
        owner: Address,
        /// The signed spender. When it is the facilitator itself, Permit2 is
        /// called directly; when it is a contract (the public proxy or the
        /// fee-splitter), the call routes through that contract, because
        /// Permit2 accepts the transfer only from the signed spender.
        spender: Address,
        to: Address,
        requested_amount: U256,
        /// Witness window, needed by the proxy path which re-hashes the
        /// witness itself.
        valid_after: U256,
        valid_before: U256,
        /// `eip712_hash_struct` of the signed witness, for the direct path.
        witness: B256,
        signature: Bytes,
    },
}

#[derive(Debug, Clone)]
pub struct SpendOutcome {
    pub tx_hash: TxHash,
    pub block_number: Option<u64>,
}

#[derive(Debug, Error)]
pub enum SpendError {
    #[error("simulation failed: {0}")]
    Simulation(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("transaction reverted: {tx_hash}")]
    Reverted { tx_hash: TxHash },

    #[error("confirmation timed out (tx: {tx_hash:?})")]
    Timeout { tx_hash: Option<TxHash> },
}

/// Query the ERC-20 balance of `owner`.
pub async fn balance_of<P: Provider>(
    provider: &P,
    token: Address,
    owner: Address,
) -> Result<U256, FacilitatorError> {
    let contract = IERC20::new(token, provider);
    contract
        .balanceOf(owner)
        .call()
        .await
        .map_err(|e| FacilitatorError::Chain(format!("balanceOf failed: {e}")))
}

/// Query the outer ERC-20 allowance `owner` has granted to `spender`
/// (the Permit2 deployment, for witness-spend payments).
pub async fn outer_allowance<P: Provider>(
    provider: &P,
    token: Address,
    owner: Address,
    spender: Address,
) -> Result<U256, FacilitatorError> {
    let contract = IERC20::new(token, provider);
    contract
        .allowance(owner, spender)
        .call()
        .await
        .map_err(|e| FacilitatorError::Chain(format!("allowance failed: {e}")))
}

/// Dry-run the spend via `eth_call` from the facilitator's address. A
/// failure here costs no gas and maps to a pre-chain settlement failure.
pub async fn simulate_spend<P: Provider>(
    provider: &P,
    permit2: Address,
    facilitator: Address,
    call: &SpendCall,
) -> Result<(), SpendError> {
    match call {
        SpendCall::DirectAuth {
            token,
            from,
            to,
            value,
            valid_after,
            valid_before,
            nonce,
            signature,
        } => {
            let contract = IERC3009::new(*token, provider);
            contract
                .transferWithAuthorization(
                    *from,
                    *to,
                    *value,
                    *valid_after,
                    *valid_before,
                    *nonce,
                    signature.clone(),
                )
                .from(facilitator)
                .call()
                .await
                .map(|_| ())
                .map_err(|e| SpendError::Simulation(e.to_string()))
        }
        spend @ SpendCall::WitnessSpend { spender, .. } => {
            if *spender == facilitator {
                let contract = ISignatureTransfer::new(permit2, provider);
                let (permit, details, owner, witness, signature) = direct_witness_args(spend);
                contract
                    .permitWitnessTransferFrom(
                        permit,
                        details,
                        owner,
                        witness,
                        WITNESS_TYPE_STRING.to_string(),
                        signature,
                    )
                    .from(facilitator)
                    .call()
                    .await
                    .map(|_| ())
                    .map_err(|e| SpendError::Simulation(e.to_string()))
            } else {
                let contract = IPermit2Proxy::new(*spender, provider);
                let (permit, details, owner, witness, signature) = proxied_witness_args(spend);
                contract
                    .permitWitnessTransferFrom(permit, details, owner, witness, signature)
                    .from(facilitator)
                    .call()
                    .await
                    .map(|_| ())
                    .map_err(|e| SpendError::Simulation(e.to_string()))
            }
        }
    }
}

/// Submit the spend and wait for the configured confirmations, bounded by
/// `timeout`. A timeout is a failure but the transaction may still mine; the
/// hash is surfaced so bookkeeping can reference it. When `submitted` is
/// given, the hash is sent on it as soon as the transaction is accepted by
/// the RPC, before the confirmation wait.
pub async fn submit_spend<P: Provider>(
    provider: &P,
    permit2: Address,
    facilitator: Address,
    call: &SpendCall,
    confirmations: u64,
    timeout: Duration,
    submitted: Option<tokio::sync::oneshot::Sender<TxHash>>,
) -> Result<SpendOutcome, SpendError> {
    match call {
        SpendCall::DirectAuth {
            token,
            from,
            to,
            value,
            valid_after,
            valid_before,
            nonce,
            signature,
        } => {
            let contract = IERC3009::new(*token, provider);
            let builder = contract.transferWithAuthorization(
                *from,
                *to,
                *value,
                *valid_after,
                *valid_before,
                *nonce,
                signature.clone(),
            );
            send_and_confirm_notify(builder, confirmations, timeout, submitted).await
        }
        spend @ SpendCall::WitnessSpend { spender, .. } => {
            if *spender == facilitator {
                let contract = ISignatureTransfer::new(permit2, provider);
                let (permit, details, owner, witness, signature) = direct_witness_args(spend);
                let builder = contract.permitWitnessTransferFrom(
                    permit,
                    details,
                    owner,
                    witness,
                    WITNESS_TYPE_STRING.to_string(),
                    signature,
                );
                send_and_confirm_notify(builder, confirmations, timeout, submitted).await
            } else {
                let contract = IPermit2Proxy::new(*spender, provider);
                let (permit, details, owner, witness, signature) = proxied_witness_args(spend);
                let builder =
                    contract.permitWitnessTransferFrom(permit, details, owner, witness, signature);
                send_and_confirm_notify(builder, confirmations, timeout, submitted).await
            }
        }
    }
}

type DirectWitnessArgs = (
    ISignatureTransfer::PermitTransferFrom,
    ISignatureTransfer::SignatureTransferDetails,
    Address,
    B256,
    Bytes,
);

/// Arguments for the direct Permit2 call: the witness goes over as its hash
/// plus the literal type string the client's wallet saw.
fn direct_witness_args(call: &SpendCall) -> DirectWitnessArgs {
    let SpendCall::WitnessSpend {
        token,
        amount,
        nonce,
        deadline,
        owner,
        to,
        requested_amount,
        witness,
        signature,
        ..
    } = call
    else {
        unreachable!("direct_witness_args is only called with witness spends")
    };
    (
        ISignatureTransfer::PermitTransferFrom {
            permitted: ISignatureTransfer::TokenPermissions {
                token: *token,
                amount: *amount,
            },
            nonce: *nonce,
            deadline: *deadline,
        },
        ISignatureTransfer::SignatureTransferDetails {
            to: *to,
            requestedAmount: *requested_amount,
        },
        *owner,
        *witness,
        signature.clone(),
    )
}

type ProxiedWitnessArgs = (
    IPermit2Proxy::PermitTransferFrom,
    IPermit2Proxy::SignatureTransferDetails,
    Address,
    IPermit2Proxy::TransferWitness,
    Bytes,
);

/// Arguments for the proxy path: the structured witness is handed to the
/// spender contract, which hashes it and relays to Permit2. The witness
/// receiver equals the transfer destination; verification enforced that.
fn proxied_witness_args(call: &SpendCall) -> ProxiedWitnessArgs {
    let SpendCall::WitnessSpend {
        token,
        amount,
        nonce,
        deadline,
        owner,
        to,
        requested_amount,
        valid_after,
        valid_before,
        signature,
        ..
    } = call
    else {
        unreachable!("proxied_witness_args is only called with witness spends")
    };
    (
        IPermit2Proxy::PermitTransferFrom {
            permitted: IPermit2Proxy::TokenPermissions {
                token: *token,
                amount: *amount,
            },
            nonce: *nonce,
            deadline: *deadline,
        },
        IPermit2Proxy::SignatureTransferDetails {
            to: *to,
            requestedAmount: *requested_amount,
        },
        *owner,
        IPermit2Proxy::TransferWitness {
            receiver: *to,
            validAfter: *valid_after,
            validBefore: *valid_before,
        },
        signature.clone(),
    )
}

pub(crate) async fn send_and_confirm<P, D>(
    builder: CallBuilder<P, D>,
    confirmations: u64,
    timeout: Duration,
) -> Result<SpendOutcome, SpendError>
where
    P: Provider,
    D: CallDecoder,
{
    send_and_confirm_notify(builder, confirmations, timeout, None).await
}

async fn send_and_confirm_notify<P, D>(
    builder: CallBuilder<P, D>,
    confirmations: u64,
    timeout: Duration,
    submitted: Option<tokio::sync::oneshot::Sender<TxHash>>,
) -> Result<SpendOutcome, SpendError>
where
    P: Provider,
    D: CallDecoder,
{
    let pending = tokio::time::timeout(SEND_TIMEOUT, builder.send())
        .await
        .map_err(|_| SpendError::Send("send timed out".to_string()))?
        .map_err(|e| SpendError::Send(e.to_string()))?;

    let tx_hash = *pending.tx_hash();
    if let Some(notify) = submitted {
        let _ = notify.send(tx_hash);
    }

    let receipt = tokio::time::timeout(
        timeout,
        pending.with_required_confirmations(confirmations).get_receipt(),
    )
    .await
    .map_err(|_| SpendError::Timeout {
        tx_hash: Some(tx_hash),
    })?
    .map_err(|e| SpendError::Send(format!("receipt failed: {e}")))?;

    if !receipt.status() {
        return Err(SpendError::Reverted { tx_hash });
    }

    Ok(SpendOutcome {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number,
    })
}
