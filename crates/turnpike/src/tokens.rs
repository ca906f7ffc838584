//! Curated token whitelist and fee resolution.
//!
//! The registry is the only fee authority the settlement path consults.
//! Unknown tokens fail closed; there is no "allow any" mode.

use std::collections::HashMap;
use std::sync::RwLock;

use alloy::primitives::{address, Address, U256};
use serde::{Deserialize, Serialize};

use crate::constants::{BASE_CHAIN_ID, BASE_SEPOLIA_CHAIN_ID};
use crate::error::FacilitatorError;

/// Fee ceiling: 1,000 basis points (10%).
pub const MAX_FEE_BPS: u32 = 1_000;

/// Basis-point denominator.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// A whitelisted token and its fee policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
    /// Configured fee in basis points, clamped to [`MAX_FEE_BPS`] on use.
    pub fee_bps: u32,
    /// When set, the effective fee is 0 regardless of `fee_bps`.
    pub fee_exempt: bool,
    /// Advertised partner discount. Metadata only; the effective fee
    /// computation ignores it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount_bps: Option<u32>,
    /// EIP-712 domain name for direct-auth signatures over this token.
    pub eip712_name: String,
    /// EIP-712 domain version for direct-auth signatures over this token.
    pub eip712_version: String,
}

impl TokenRecord {
    /// The fee actually applied: 0 when exempt, otherwise the configured
    /// bps clamped to the ceiling.
    pub fn effective_fee_bps(&self) -> u32 {
        if self.fee_exempt {
            0
        } else {
            self.fee_bps.min(MAX_FEE_BPS)
        }
    }
}

/// Token registry keyed by contract address. Address parsing normalizes
/// case, so lookups are case-insensitive by construction. Read-mostly; the
/// admin path mutates behind the lock.
pub struct TokenRegistry {
    inner: RwLock<HashMap<Address, TokenRecord>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Registry seeded with the curated USDC deployment for the given chain.
    pub fn with_defaults(chain_id: u64) -> Self {
        let registry = Self::new();
        let usdc = match chain_id {
            BASE_CHAIN_ID => Some(address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913")),
            BASE_SEPOLIA_CHAIN_ID => Some(address!("036CbD53842c5426634e7929541eC2318f3dCF7e")),
            _ => None,
        };
        if let Some(addr) = usdc {
            registry
                .insert(TokenRecord {
                    address: addr,
                    symbol: "USDC".to_string(),
                    decimals: 6,
                    fee_bps: 10,
                    fee_exempt: false,
                    discount_bps: None,
                    eip712_name: "USD Coin".to_string(),
                    eip712_version: "2".to_string(),
                })
                .expect("curated default is within the fee ceiling");
        }
        registry
    }

    /// Add or replace a token record. Rejects fees above the ceiling rather
    /// than silently clamping a misconfiguration.
    pub fn insert(&self, record: TokenRecord) -> Result<(), FacilitatorError> {
        if record.fee_bps > MAX_FEE_BPS {
            return Err(FacilitatorError::Config(format!(
                "fee for {} is {} bps, maximum is {}",
                record.symbol, record.fee_bps, MAX_FEE_BPS
            )));
        }
        let mut inner = self
            .inner
            .write()
            .map_err(|_| FacilitatorError::Store("token registry lock poisoned".to_string()))?;
        inner.insert(record.address, record);
        Ok(())
    }

    pub fn by_address(&self, address: Address) -> Option<TokenRecord> {
        self.inner.read().ok()?.get(&address).cloned()
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<TokenRecord> {
        self.inner
            .read()
            .ok()?
            .values()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
            .cloned()
    }

    /// Effective fee bps for a token: `Some(0)` when exempt, the clamped
    /// configuration otherwise, `None` for unknown tokens. Callers must
    /// reject `None`.
    pub fn fee_bps(&self, address: Address) -> Option<u32> {
        self.by_address(address).map(|t| t.effective_fee_bps())
    }

    /// All records, for `/supported` and the discovery surface.
    pub fn all(&self) -> Vec<TokenRecord> {
        self.inner
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `amount` into `(net, fee)` with `fee = floor(amount * bps / 10000)`.
///
/// Decomposed as `amount = 10000 q + r` so the multiplication cannot
/// overflow 256 bits for any valid amount:
/// `floor(a*b/10000) = q*b + floor(r*b/10000)`.
pub fn net_and_fee(amount: U256, bps: u32) -> (U256, U256) {
    let bps = U256::from(bps.min(MAX_FEE_BPS));
    let denom = U256::from(BPS_DENOMINATOR);
    let q = amount / denom;
    let r = amount % denom;
    let fee = q * bps + (r * bps) / denom;
    (amount - fee, fee)
}
