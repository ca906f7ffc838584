use serde::{Deserialize, Serialize};

/// Machine-readable failure reasons, stable over the wire.
///
/// Verification failures draw from the first block; settlement adds the
/// reasons below `TransactionReverted`. The wire encoding is snake_case and
/// is part of the public API; renaming a variant is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    InvalidPayload,
    InvalidPaymentRequirements,
    InvalidScheme,
    InvalidNetwork,
    InvalidX402Version,
    InvalidAuthorizationValue,
    InvalidAuthorizationValueTooLow,
    InvalidAuthorizationValidAfter,
    InvalidAuthorizationValidBefore,
    InvalidAuthorizationTypedDataMessage,
    InvalidSignature,
    InvalidSignatureAddress,
    NonceAlreadyUsed,
    OuterAllowanceRequired,
    TokenNotWhitelisted,
    InsufficientFunds,
    UnexpectedVerifyError,

    TransactionReverted,
    TransactionTimeout,
    FacilitatorNotConfigured,
    UnexpectedSettleError,
}

impl ErrorReason {
    /// The wire name, identical to the serde encoding.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::InvalidPaymentRequirements => "invalid_payment_requirements",
            Self::InvalidScheme => "invalid_scheme",
            Self::InvalidNetwork => "invalid_network",
            Self::InvalidX402Version => "invalid_x402_version",
            Self::InvalidAuthorizationValue => "invalid_authorization_value",
            Self::InvalidAuthorizationValueTooLow => "invalid_authorization_value_too_low",
            Self::InvalidAuthorizationValidAfter => "invalid_authorization_valid_after",
            Self::InvalidAuthorizationValidBefore => "invalid_authorization_valid_before",
            Self::InvalidAuthorizationTypedDataMessage => {
                "invalid_authorization_typed_data_message"
            }
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidSignatureAddress => "invalid_signature_address",
            Self::NonceAlreadyUsed => "nonce_already_used",
            Self::OuterAllowanceRequired => "outer_allowance_required",
            Self::TokenNotWhitelisted => "token_not_whitelisted",
            Self::InsufficientFunds => "insufficient_funds",
            Self::UnexpectedVerifyError => "unexpected_verify_error",
            Self::TransactionReverted => "transaction_reverted",
            Self::TransactionTimeout => "transaction_timeout",
            Self::FacilitatorNotConfigured => "facilitator_not_configured",
            Self::UnexpectedSettleError => "unexpected_settle_error",
        }
    }

    /// Whether this reason requires the client to perform an on-chain action
    /// (an outer approval) before the payment can succeed. Mapped to HTTP 412
    /// by the service layer.
    pub const fn requires_client_action(self) -> bool {
        matches!(self, Self::OuterAllowanceRequired)
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
