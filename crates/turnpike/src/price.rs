//! Non-authoritative USD quotes for pricing endpoints.
//!
//! Price data never influences settlement math. The settlement core depends
//! only on [`crate::tokens`]; this module is a sibling consulted by the
//! pricing/discovery surface alone.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::tokens::TokenRecord;

/// How a quote was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    /// Fresh from the upstream feed.
    Live,
    /// A prior value retained after a refresh failure.
    Stale,
    /// Hardcoded default for tokens with no prior value.
    Fallback,
    /// Pegged; never fetched.
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub usd: f64,
    pub source: PriceSource,
    pub fetched_at: u64,
}

/// Symbols pegged to $1. Stablecoin depegs are out of scope for quoting.
const STABLECOINS: &[&str] = &["USDC", "USDT", "DAI"];

/// Defaults used before the first successful refresh.
const FALLBACK_PRICES: &[(&str, f64)] = &[("ETH", 2500.0), ("WETH", 2500.0)];

/// Upstream ids for the simple-price feed, by symbol.
const FEED_IDS: &[(&str, &str)] = &[("ETH", "ethereum"), ("WETH", "weth")];

const DEFAULT_ENDPOINT: &str = "https://api.coingecko.com/api/v3/simple/price";

/// TTL cache of USD prices, refreshed on a fixed interval. Readers may see a
/// prior snapshot during refresh; that is deliberate.
pub struct PriceCache {
    prices: RwLock<HashMap<String, PriceQuote>>,
    client: reqwest::Client,
    endpoint: String,
    refresh_secs: u64,
}

impl PriceCache {
    pub fn new(refresh_secs: u64) -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT, refresh_secs)
    }

    pub fn with_endpoint(endpoint: &str, refresh_secs: u64) -> Self {
        let mut prices = HashMap::new();
        let now = unix_now();
        for symbol in STABLECOINS {
            prices.insert(
                (*symbol).to_string(),
                PriceQuote {
                    usd: 1.0,
                    source: PriceSource::Fixed,
                    fetched_at: now,
                },
            );
        }
        for (symbol, usd) in FALLBACK_PRICES {
            prices.insert(
                (*symbol).to_string(),
                PriceQuote {
                    usd: *usd,
                    source: PriceSource::Fallback,
                    fetched_at: now,
                },
            );
        }
        Self {
            prices: RwLock::new(prices),
            client: reqwest::Client::builder()
                // Prevent SSRF via redirects
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client construction cannot fail with these options"),
            endpoint: endpoint.to_string(),
            refresh_secs,
        }
    }

    /// Start the background refresh loop: one refresh now, then one per
    /// interval. Failures keep the prior value, re-marked stale.
    pub fn start(self: &Arc<Self>) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(cache.refresh_secs));
            loop {
                interval.tick().await;
                cache.refresh().await;
            }
        });
    }

    /// Fetch fresh prices for all feed-backed symbols.
    pub async fn refresh(&self) {
        let ids: Vec<&str> = FEED_IDS.iter().map(|(_, id)| *id).collect();
        let url = format!("{}?ids={}&vs_currencies=usd", self.endpoint, ids.join(","));

        let fetched: Result<HashMap<String, HashMap<String, f64>>, String> = async {
            let resp = self
                .client
                .get(&url)
                .timeout(std::time::Duration::from_secs(10))
                .send()
                .await
                .map_err(|e| e.to_string())?;
            resp.json().await.map_err(|e| e.to_string())
        }
        .await;

        match fetched {
            Ok(body) => {
                let now = unix_now();
                let Ok(mut prices) = self.prices.write() else {
                    return;
                };
                for (symbol, feed_id) in FEED_IDS {
                    if let Some(usd) = body.get(*feed_id).and_then(|m| m.get("usd")) {
                        prices.insert(
                            (*symbol).to_string(),
                            PriceQuote {
                                usd: *usd,
                                source: PriceSource::Live,
                                fetched_at: now,
                            },
                        );
                    }
                }
                tracing::debug!("price cache refreshed");
            }
            Err(e) => {
                tracing::warn!(error = %e, "price refresh failed, retaining prior values");
                if let Ok(mut prices) = self.prices.write() {
                    for quote in prices.values_mut() {
                        if quote.source == PriceSource::Live {
                            quote.source = PriceSource::Stale;
                        }
                    }
                }
            }
        }
    }

    pub fn usd_price(&self, symbol: &str) -> Option<PriceQuote> {
        self.prices
            .read()
            .ok()?
            .get(&symbol.to_ascii_uppercase())
            .cloned()
    }

    /// Convert a USD amount to the token's smallest unit. `None` when no
    /// price exists for the symbol.
    pub fn usd_to_token_units(&self, usd: f64, token: &TokenRecord) -> Option<String> {
        if !usd.is_finite() || usd < 0.0 {
            return None;
        }
        let quote = self.usd_price(&token.symbol)?;
        if quote.usd <= 0.0 {
            return None;
        }
        let units = usd / quote.usd * 10f64.powi(token.decimals as i32);
        Some(format!("{:.0}", units.floor()))
    }

    /// Convert an amount in smallest units to USD. `None` when no price
    /// exists or the amount does not parse.
    pub fn token_units_to_usd(&self, amount: &str, token: &TokenRecord) -> Option<f64> {
        let quote = self.usd_price(&token.symbol)?;
        let units: f64 = amount.parse().ok()?;
        Some(units / 10f64.powi(token.decimals as i32) * quote.usd)
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn usdc() -> TokenRecord {
        TokenRecord {
            address: address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            symbol: "USDC".to_string(),
            decimals: 6,
            fee_bps: 10,
            fee_exempt: false,
            discount_bps: None,
            eip712_name: "USD Coin".to_string(),
            eip712_version: "2".to_string(),
        }
    }

    #[test]
    fn test_stablecoins_are_fixed_at_one_dollar() {
        let cache = PriceCache::new(300);
        let quote = cache.usd_price("USDC").unwrap();
        assert_eq!(quote.usd, 1.0);
        assert_eq!(quote.source, PriceSource::Fixed);
    }

    #[test]
    fn test_fallback_prices_present_before_refresh() {
        let cache = PriceCache::new(300);
        let quote = cache.usd_price("ETH").unwrap();
        assert_eq!(quote.source, PriceSource::Fallback);
    }

    #[test]
    fn test_unknown_symbol_returns_none() {
        let cache = PriceCache::new(300);
        assert!(cache.usd_price("DOGE").is_none());
    }

    #[test]
    fn test_usd_to_token_units() {
        let cache = PriceCache::new(300);
        // $0.01 of USDC at $1 = 10,000 units at 6 decimals
        assert_eq!(
            cache.usd_to_token_units(0.01, &usdc()).as_deref(),
            Some("10000")
        );
        assert_eq!(
            cache.usd_to_token_units(1.0, &usdc()).as_deref(),
            Some("1000000")
        );
        assert!(cache.usd_to_token_units(f64::NAN, &usdc()).is_none());
        assert!(cache.usd_to_token_units(-1.0, &usdc()).is_none());
    }

    #[test]
    fn test_token_units_to_usd() {
        let cache = PriceCache::new(300);
        let usd = cache.token_units_to_usd("1000000", &usdc()).unwrap();
        assert!((usd - 1.0).abs() < 1e-9);
        assert!(cache.token_units_to_usd("not-a-number", &usdc()).is_none());
    }
}
