use alloy::primitives::{address, Address};
use serde::{Deserialize, Serialize};

/// Canonical Uniswap Permit2 contract address (same on all EVM chains via CREATE2).
pub const PERMIT2_ADDRESS: Address = address!("000000000022D473030F116dDEE9F6B43aC78BA3");

/// Public x402 Permit2 proxy deployment (CREATE2, deterministic address).
/// Accepted as a witness-spend spender in every operating mode.
pub const X402_PERMIT2_PROXY: Address = address!("4020615294c913F045dc10f0a5cdEbd86c280001");

/// The only payment scheme this facilitator speaks.
pub const SCHEME_EXACT: &str = "exact";

/// Protocol versions accepted on the wire.
pub const ACCEPTED_VERSIONS: [u32; 2] = [1, 2];

/// Base mainnet chain ID.
pub const BASE_CHAIN_ID: u64 = 8453;

/// CAIP-2 network identifier for Base mainnet.
pub const BASE_NETWORK: &str = "eip155:8453";

/// Base Sepolia chain ID.
pub const BASE_SEPOLIA_CHAIN_ID: u64 = 84532;

/// Default RPC endpoint for Base mainnet.
pub const DEFAULT_RPC_URL: &str = "https://mainnet.base.org";

/// Block explorer base URL.
pub const EXPLORER_BASE: &str = "https://basescan.org";

/// The Permit2 witness type tail, passed verbatim to
/// `permitWitnessTransferFrom` so the contract reconstructs the exact
/// typehash the client signed. Referenced struct types are ordered
/// alphabetically after the primary type, per EIP-712.
pub const WITNESS_TYPE_STRING: &str = "X402TransferDetails witness)\
TokenPermissions(address token,uint256 amount)\
X402TransferDetails(address receiver,uint256 validAfter,uint256 validBefore)";

/// Resolve a network string to a chain ID.
///
/// Accepts CAIP-2 identifiers (`eip155:<id>`) and the vendor aliases older
/// clients still send.
pub fn resolve_network(network: &str) -> Option<u64> {
    match network {
        "base" => Some(BASE_CHAIN_ID),
        "base-sepolia" => Some(BASE_SEPOLIA_CHAIN_ID),
        _ => {
            let id = network.strip_prefix("eip155:")?;
            id.parse().ok()
        }
    }
}

/// How the facilitator spends witness-spend authorizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperatingMode {
    /// The facilitator calls Permit2 itself; the signed spender is the
    /// facilitator address.
    Direct,
    /// The fee-splitter proxy calls Permit2; the signed spender is the
    /// splitter contract.
    SplitterProxy,
}

/// Runtime chain configuration. Decouples the verify/settle engine from
/// compile-time constants, enabling multi-chain deployments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub chain_id: u64,
    /// CAIP-2 identifier advertised on the wire.
    pub network: String,
    pub rpc_url: String,
    pub explorer_base: String,
    /// Permit2 deployment spending witness-spend authorizations.
    pub permit2: Address,
    /// Fee-splitter contract for this chain. `None` = splitting disabled.
    pub splitter: Option<Address>,
    /// Fallback recipient when a splitter settlement names no
    /// `actualRecipient`.
    pub treasury: Option<Address>,
    pub mode: OperatingMode,
    /// Confirmations to wait for before a settlement is terminal.
    pub confirmations: u64,
}

impl Default for ChainConfig {
    /// Defaults to Base mainnet in direct mode, no splitter.
    fn default() -> Self {
        Self {
            chain_id: BASE_CHAIN_ID,
            network: BASE_NETWORK.to_string(),
            rpc_url: DEFAULT_RPC_URL.to_string(),
            explorer_base: EXPLORER_BASE.to_string(),
            permit2: PERMIT2_ADDRESS,
            splitter: None,
            treasury: None,
            mode: OperatingMode::Direct,
            confirmations: 1,
        }
    }
}

impl ChainConfig {
    /// Whether `network` (CAIP-2 or alias) names this chain.
    pub fn matches_network(&self, network: &str) -> bool {
        resolve_network(network) == Some(self.chain_id)
    }

    /// The spender addresses accepted in a witness-spend authorization.
    ///
    /// The public proxy is always accepted; the mode-specific spender is the
    /// splitter contract in splitter-proxy mode, the facilitator's own
    /// address in direct mode.
    pub fn accepted_spenders(&self, facilitator: Address) -> Vec<Address> {
        let mut spenders = vec![X402_PERMIT2_PROXY];
        match self.mode {
            OperatingMode::Direct => spenders.push(facilitator),
            OperatingMode::SplitterProxy => {
                if let Some(splitter) = self.splitter {
                    spenders.push(splitter);
                }
            }
        }
        spenders
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_caip2() {
        assert_eq!(resolve_network("eip155:8453"), Some(8453));
        assert_eq!(resolve_network("eip155:84532"), Some(84532));
        assert_eq!(resolve_network("eip155:1"), Some(1));
    }

    #[test]
    fn test_resolve_vendor_alias() {
        assert_eq!(resolve_network("base"), Some(BASE_CHAIN_ID));
        assert_eq!(resolve_network("base-sepolia"), Some(BASE_SEPOLIA_CHAIN_ID));
    }

    #[test]
    fn test_resolve_unknown() {
        assert_eq!(resolve_network("solana:mainnet"), None);
        assert_eq!(resolve_network("eip155:not-a-number"), None);
        assert_eq!(resolve_network(""), None);
    }

    #[test]
    fn test_accepted_spenders_direct_mode() {
        let config = ChainConfig::default();
        let facilitator = address!("1111111111111111111111111111111111111111");
        let spenders = config.accepted_spenders(facilitator);
        assert!(spenders.contains(&X402_PERMIT2_PROXY));
        assert!(spenders.contains(&facilitator));
    }

    #[test]
    fn test_accepted_spenders_splitter_mode() {
        let splitter = address!("2222222222222222222222222222222222222222");
        let config = ChainConfig {
            splitter: Some(splitter),
            mode: OperatingMode::SplitterProxy,
            ..ChainConfig::default()
        };
        let facilitator = address!("1111111111111111111111111111111111111111");
        let spenders = config.accepted_spenders(facilitator);
        assert!(spenders.contains(&splitter));
        assert!(!spenders.contains(&facilitator));
    }
}
