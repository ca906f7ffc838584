//! Core verify/settle engine for the turnpike payment facilitator.
//!
//! Turnpike accepts cryptographically signed, off-chain payment authorizations
//! from a payer, validates them against a resource server's payment
//! requirements, and atomically settles them on an EVM ledger, optionally
//! routing funds through a fee-splitting contract so that an endpoint
//! provider and a treasury are paid in the same transaction.
//!
//! Two authorization protocols are supported:
//!
//! - **witness-spend** — a Permit2 `PermitWitnessTransferFrom` with an
//!   attached transfer witness carrying the receiver and validity window;
//! - **direct-auth** — an ERC-3009 `transferWithAuthorization` executed by
//!   the token contract itself.
//!
//! # Modules
//!
//! - [`verifier`] — structural + semantic validation without ledger writes
//! - [`settlement`] — the settle state machine and audit lifecycle
//! - [`submitter`] — single-worker queue owning the facilitator signing key
//! - [`eip712`] — typed-data signer recovery for both protocols
//! - [`nonce_store`] — replay protection with fail-safe lookups
//! - [`audit`] — durable transaction records and statistics
//! - [`tokens`] — curated token whitelist and fee resolution
//! - [`splitter`] — fee-splitter contract client with nonce-retry discipline
//! - [`price`] — non-authoritative USD quotes (never consulted by settlement)

pub mod audit;
pub mod chain;
pub mod config;
pub mod constants;
pub mod eip712;
pub mod error;
pub mod hmac;
pub mod nonce_store;
pub mod payment;
pub mod price;
pub mod reason;
pub mod response;
pub mod security;
pub mod settlement;
pub mod splitter;
pub mod submitter;
pub mod tokens;
pub mod verifier;

use alloy::sol;

// EIP-712 structs for the two authorization protocols -- the sol! macro
// auto-derives SolStruct which gives us eip712_signing_hash().
sol! {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct TokenPermissions {
        address token;
        uint256 amount;
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct X402TransferDetails {
        address receiver;
        uint256 validAfter;
        uint256 validBefore;
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct PermitWitnessTransferFrom {
        TokenPermissions permitted;
        address spender;
        uint256 nonce;
        uint256 deadline;
        X402TransferDetails witness;
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

// Re-exports
pub use constants::{ChainConfig, OperatingMode};
pub use error::FacilitatorError;
pub use payment::{
    DirectAuthPayload, ExactPayload, PaymentPayload, PaymentProtocol, PaymentRequirements,
    WitnessSpendPayload,
};
pub use reason::ErrorReason;
pub use response::{SettleResponse, VerifyResponse};
pub use settlement::{SettlementEvent, SettlementOrchestrator, SettlementSettings};
pub use tokens::TokenRegistry;
pub use verifier::Verifier;
