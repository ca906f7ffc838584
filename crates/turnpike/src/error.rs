use thiserror::Error;

/// Errors returned by turnpike operations.
#[derive(Debug, Error)]
pub enum FacilitatorError {
    #[error("signature error: {0}")]
    Signature(String),

    #[error("chain error: {0}")]
    Chain(String),

    #[error("invalid payment: {0}")]
    InvalidPayment(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
