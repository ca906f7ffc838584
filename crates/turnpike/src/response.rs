use serde::{Deserialize, Serialize};

use crate::payment::PaymentProtocol;
use crate::reason::ErrorReason;

/// Result of running the verifier. Returned verbatim from `POST /verify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<ErrorReason>,
    /// Recovered payer address, lowercased 0x-hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

impl VerifyResponse {
    pub fn valid(payer: &str) -> Self {
        Self {
            is_valid: true,
            invalid_reason: None,
            payer: Some(payer.to_string()),
        }
    }

    pub fn invalid(reason: ErrorReason) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason),
            payer: None,
        }
    }

    pub fn invalid_with_payer(reason: ErrorReason, payer: &str) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason),
            payer: Some(payer.to_string()),
        }
    }
}

/// Result of running the settlement orchestrator. Returned from
/// `POST /settle` with HTTP 200 regardless of `success`, because the settlement
/// attempt itself is a successful RPC interaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<ErrorReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    /// Terminal ledger transaction id: the splitter call when a splitter was
    /// used, the authorization-spend otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_tx_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    /// Fee retained, smallest token unit, decimal string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<PaymentProtocol>,
    /// Audit record id for this settlement attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    pub network: String,
}

impl SettleResponse {
    pub fn rejected(reason: ErrorReason, payer: Option<String>, network: &str) -> Self {
        Self {
            success: false,
            error_reason: Some(reason),
            payer,
            ledger_tx_id: None,
            block_number: None,
            fee: None,
            protocol: None,
            transaction_id: None,
            network: network.to_string(),
        }
    }
}
