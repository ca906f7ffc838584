//! Environment configuration, validated at startup. The facilitator fails
//! fast on an invalid knob rather than limping into settlement with it.

use std::env;

use alloy::primitives::Address;
use thiserror::Error;
use url::Url;

use crate::constants::{self, OperatingMode};

const DEFAULT_PORT: u16 = 4022;
const DEFAULT_SETTLEMENT_TIMEOUT_MS: u64 = 60_000;
const MIN_SETTLEMENT_TIMEOUT_MS: u64 = 5_000;
const MAX_SETTLEMENT_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_CONFIRMATIONS: u64 = 1;
const DEFAULT_RATE_LIMIT_RPM: u32 = 120;
const DEFAULT_PRICE_REFRESH_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid value for {name}: {detail}")]
    Invalid {
        name: &'static str,
        detail: String,
    },
}

/// Facilitator service configuration.
#[derive(Clone)]
pub struct FacilitatorConfig {
    /// Facilitator signing key, 0x-prefixed 32-byte hex.
    pub private_key: String,
    pub rpc_url: String,
    /// CAIP-2 network to operate on.
    pub network: String,
    /// Durable store path for transactions and nonces. Required when
    /// `production` is set.
    pub database_path: Option<String>,
    pub webhook_db_path: Option<String>,
    pub settlement_timeout_ms: u64,
    pub confirmations: u64,
    /// Refuse submissions above this gas price (wei). `None` = no cap.
    pub max_gas_price: Option<u128>,
    /// Amounts below this are refused at settle time.
    pub min_settlement_unit: String,
    /// Fee-splitter contract. Zero address = disabled.
    pub fee_splitter: Option<Address>,
    /// Treasury fallback recipient for splitter settlements.
    pub treasury: Option<Address>,
    pub mode: OperatingMode,
    pub production: bool,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub rate_limit_rpm: u32,
    pub metrics_token: Option<String>,
    pub discovery_resources_path: Option<String>,
    pub price_refresh_secs: u64,
}

impl std::fmt::Debug for FacilitatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilitatorConfig")
            .field("private_key", &"[REDACTED]")
            .field("rpc_url", &self.rpc_url)
            .field("network", &self.network)
            .field("database_path", &self.database_path)
            .field("webhook_db_path", &self.webhook_db_path)
            .field("settlement_timeout_ms", &self.settlement_timeout_ms)
            .field("confirmations", &self.confirmations)
            .field("max_gas_price", &self.max_gas_price)
            .field("min_settlement_unit", &self.min_settlement_unit)
            .field("fee_splitter", &self.fee_splitter)
            .field("treasury", &self.treasury)
            .field("mode", &self.mode)
            .field("production", &self.production)
            .field("port", &self.port)
            .field("allowed_origins", &self.allowed_origins)
            .field("rate_limit_rpm", &self.rate_limit_rpm)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("discovery_resources_path", &self.discovery_resources_path)
            .field("price_refresh_secs", &self.price_refresh_secs)
            .finish()
    }
}

impl FacilitatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let private_key = env::var("FACILITATOR_PRIVATE_KEY")
            .map_err(|_| ConfigError::MissingRequired("FACILITATOR_PRIVATE_KEY"))?;
        validate_private_key(&private_key)?;

        let rpc_url =
            env::var("RPC_URL").unwrap_or_else(|_| constants::DEFAULT_RPC_URL.to_string());
        Url::parse(&rpc_url).map_err(|e| ConfigError::Invalid {
            name: "RPC_URL",
            detail: e.to_string(),
        })?;

        let network = env::var("NETWORK").unwrap_or_else(|_| constants::BASE_NETWORK.to_string());
        if constants::resolve_network(&network).is_none() {
            return Err(ConfigError::Invalid {
                name: "NETWORK",
                detail: format!("unknown network: {network}"),
            });
        }

        let production = env::var("PRODUCTION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let database_path = env::var("DATABASE_PATH").ok().filter(|s| !s.is_empty());
        if production && database_path.is_none() {
            return Err(ConfigError::MissingRequired("DATABASE_PATH"));
        }
        let webhook_db_path = env::var("WEBHOOK_DB_PATH").ok().filter(|s| !s.is_empty());

        let settlement_timeout_ms = parse_or_default(
            "SETTLEMENT_TIMEOUT_MS",
            DEFAULT_SETTLEMENT_TIMEOUT_MS,
        )?;
        if !(MIN_SETTLEMENT_TIMEOUT_MS..=MAX_SETTLEMENT_TIMEOUT_MS)
            .contains(&settlement_timeout_ms)
        {
            return Err(ConfigError::Invalid {
                name: "SETTLEMENT_TIMEOUT_MS",
                detail: format!(
                    "{settlement_timeout_ms} outside [{MIN_SETTLEMENT_TIMEOUT_MS}, {MAX_SETTLEMENT_TIMEOUT_MS}]"
                ),
            });
        }

        let confirmations = parse_or_default("CONFIRMATIONS", DEFAULT_CONFIRMATIONS)?;

        let max_gas_price = match env::var("MAX_GAS_PRICE_WEI") {
            Ok(s) if !s.is_empty() => {
                let value: u128 = s.parse().map_err(|_| ConfigError::Invalid {
                    name: "MAX_GAS_PRICE_WEI",
                    detail: format!("not a positive integer: {s}"),
                })?;
                if value == 0 {
                    return Err(ConfigError::Invalid {
                        name: "MAX_GAS_PRICE_WEI",
                        detail: "must be positive".to_string(),
                    });
                }
                Some(value)
            }
            _ => None,
        };

        let min_settlement_unit = match env::var("MIN_SETTLEMENT_UNIT") {
            Ok(s) if !s.is_empty() => {
                if !s.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ConfigError::Invalid {
                        name: "MIN_SETTLEMENT_UNIT",
                        detail: format!("not a non-negative integer: {s}"),
                    });
                }
                s
            }
            _ => "0".to_string(),
        };

        let fee_splitter = parse_optional_address("FEE_SPLITTER_ADDRESS")?;
        let treasury = parse_optional_address("TREASURY_ADDRESS")?;

        let mode = match env::var("OPERATING_MODE").as_deref() {
            Ok("splitter-proxy") => OperatingMode::SplitterProxy,
            Ok("direct") | Err(_) => OperatingMode::Direct,
            Ok(other) => {
                return Err(ConfigError::Invalid {
                    name: "OPERATING_MODE",
                    detail: format!("expected 'direct' or 'splitter-proxy', got '{other}'"),
                })
            }
        };
        if mode == OperatingMode::SplitterProxy && fee_splitter.is_none() {
            return Err(ConfigError::Invalid {
                name: "OPERATING_MODE",
                detail: "splitter-proxy mode requires FEE_SPLITTER_ADDRESS".to_string(),
            });
        }

        let port = parse_or_default("PORT", DEFAULT_PORT)?;
        let rate_limit_rpm = parse_or_default("RATE_LIMIT_RPM", DEFAULT_RATE_LIMIT_RPM)?;
        let price_refresh_secs =
            parse_or_default("PRICE_REFRESH_SECS", DEFAULT_PRICE_REFRESH_SECS)?;

        let allowed_origins: Vec<String> = env::var("ALLOWED_ORIGINS")
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if production && allowed_origins.contains(&"*".to_string()) {
            return Err(ConfigError::Invalid {
                name: "ALLOWED_ORIGINS",
                detail: "wildcard origin is not allowed in production".to_string(),
            });
        }

        let metrics_token = env::var("METRICS_TOKEN").ok().filter(|s| !s.is_empty());
        if metrics_token.is_none() {
            tracing::warn!("METRICS_TOKEN not set, /metrics requires explicit public opt-in");
        }

        let discovery_resources_path = env::var("DISCOVERY_RESOURCES_PATH")
            .ok()
            .filter(|s| !s.is_empty());

        Ok(Self {
            private_key,
            rpc_url,
            network,
            database_path,
            webhook_db_path,
            settlement_timeout_ms,
            confirmations,
            max_gas_price,
            min_settlement_unit,
            fee_splitter,
            treasury,
            mode,
            production,
            port,
            allowed_origins,
            rate_limit_rpm,
            metrics_token,
            discovery_resources_path,
            price_refresh_secs,
        })
    }
}

/// A facilitator key must be 0x-prefixed 32-byte hex. Anything else is a
/// configuration accident worth failing on before touching the chain.
pub fn validate_private_key(key: &str) -> Result<(), ConfigError> {
    let hex = key.strip_prefix("0x").ok_or(ConfigError::Invalid {
        name: "FACILITATOR_PRIVATE_KEY",
        detail: "missing 0x prefix".to_string(),
    })?;
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ConfigError::Invalid {
            name: "FACILITATOR_PRIVATE_KEY",
            detail: "expected 64 hex characters".to_string(),
        });
    }
    Ok(())
}

fn parse_optional_address(name: &'static str) -> Result<Option<Address>, ConfigError> {
    match env::var(name) {
        Ok(s) if !s.is_empty() => {
            let address: Address = s.parse().map_err(|_| ConfigError::Invalid {
                name,
                detail: format!("invalid address: {s}"),
            })?;
            // The zero address means "disabled".
            Ok((address != Address::ZERO).then_some(address))
        }
        _ => Ok(None),
    }
}

fn parse_or_default<T: std::str::FromStr>(
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(s) if !s.is_empty() => s.parse().map_err(|_| ConfigError::Invalid {
            name,
            detail: format!("unparseable value: {s}"),
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_key_validation() {
        let good = format!("0x{}", "ab".repeat(32));
        assert!(validate_private_key(&good).is_ok());

        assert!(validate_private_key(&"ab".repeat(32)).is_err()); // no prefix
        assert!(validate_private_key("0xabcd").is_err()); // too short
        let bad_chars = format!("0x{}", "zz".repeat(32));
        assert!(validate_private_key(&bad_chars).is_err());
        let too_long = format!("0x{}", "ab".repeat(33));
        assert!(validate_private_key(&too_long).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = FacilitatorConfig {
            private_key: format!("0x{}", "ab".repeat(32)),
            rpc_url: "https://mainnet.base.org".to_string(),
            network: "eip155:8453".to_string(),
            database_path: None,
            webhook_db_path: None,
            settlement_timeout_ms: 60_000,
            confirmations: 1,
            max_gas_price: None,
            min_settlement_unit: "0".to_string(),
            fee_splitter: None,
            treasury: None,
            mode: OperatingMode::Direct,
            production: false,
            port: 4022,
            allowed_origins: vec![],
            rate_limit_rpm: 120,
            metrics_token: Some("secret-token".to_string()),
            discovery_resources_path: None,
            price_refresh_secs: 300,
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("abab"));
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
