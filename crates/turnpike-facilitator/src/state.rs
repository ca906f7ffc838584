use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use alloy::network::EthereumWallet;
use alloy::primitives::Address;
use alloy::providers::{
    fillers::{
        BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
    },
    Identity, RootProvider,
};

use turnpike::price::PriceCache;
use turnpike::settlement::SettlementOrchestrator;
use turnpike::tokens::TokenRegistry;

use crate::discovery::DiscoveryResource;
use crate::webhook::WebhookStore;

/// Concrete provider type from `ProviderBuilder::new().wallet(...).connect_http(...)`.
pub type WalletProvider = FillProvider<
    JoinFill<
        JoinFill<
            Identity,
            JoinFill<GasFiller, JoinFill<BlobGasFiller, JoinFill<NonceFiller, ChainIdFiller>>>,
        >,
        WalletFiller<EthereumWallet>,
    >,
    RootProvider,
>;

/// Shared application state for the facilitator server.
pub struct AppState {
    pub orchestrator: Arc<SettlementOrchestrator<WalletProvider>>,
    pub registry: Arc<TokenRegistry>,
    pub prices: Arc<PriceCache>,
    pub webhooks: WebhookStore,
    /// Catalog served from `/discovery/resources`.
    pub resources: Vec<DiscoveryResource>,
    /// CAIP-2 network this deployment settles on.
    pub network: String,
    pub facilitator_address: Address,
    /// Bearer token for `/metrics` (raw bytes). `None` = locked unless
    /// explicitly opted public.
    pub metrics_token: Option<Vec<u8>>,
    /// Operational warnings surfaced on `/health` (ephemeral stores, etc).
    pub warnings: Vec<String>,
    /// False until bootstrap completes; gated routes answer 503 before that.
    pub ready: AtomicBool,
}
