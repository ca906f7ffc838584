//! Construct the whole facilitator service from a validated configuration.
//!
//! Refuses to start in production without durable stores: an in-memory nonce
//! store loses its contents on restart, which would re-open the replay
//! window for every recently settled payment.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;

use turnpike::audit::AuditLog;
use turnpike::config::FacilitatorConfig;
use turnpike::constants::{self, ChainConfig};
use turnpike::nonce_store::{InMemoryNonceStore, NonceStore, SqliteNonceStore};
use turnpike::price::PriceCache;
use turnpike::settlement::{SettlementOrchestrator, SettlementSettings};
use turnpike::submitter::{self, SubmitterConfig};
use turnpike::tokens::TokenRegistry;
use turnpike::verifier::Verifier;

use crate::discovery;
use crate::state::AppState;
use crate::webhook::{self, WebhookStore};

/// Build the shared [`AppState`]. Exits the process on conditions that would
/// be unsafe to serve through.
pub fn build_state(config: &FacilitatorConfig) -> Arc<AppState> {
    let signer: PrivateKeySigner = config
        .private_key
        .parse()
        .expect("FACILITATOR_PRIVATE_KEY validated at config load");
    let facilitator_address = signer.address();
    if facilitator_address == Address::ZERO {
        tracing::error!("facilitator address is zero, refusing to start");
        std::process::exit(1);
    }

    let provider = ProviderBuilder::new()
        .wallet(alloy::network::EthereumWallet::from(signer))
        .connect_http(config.rpc_url.parse().expect("RPC_URL validated at config load"));

    let chain_id =
        constants::resolve_network(&config.network).expect("NETWORK validated at config load");
    let chain_config = ChainConfig {
        chain_id,
        network: format!("eip155:{chain_id}"),
        rpc_url: config.rpc_url.clone(),
        explorer_base: constants::EXPLORER_BASE.to_string(),
        permit2: constants::PERMIT2_ADDRESS,
        splitter: config.fee_splitter,
        treasury: config.treasury,
        mode: config.mode,
        confirmations: config.confirmations,
    };

    let mut warnings = Vec::new();

    let nonce_store: Arc<dyn NonceStore> = match &config.database_path {
        Some(path) => match SqliteNonceStore::open(path) {
            Ok(store) => {
                tracing::info!(path = %path, "nonce store: sqlite");
                Arc::new(store)
            }
            Err(e) => {
                // Do not fall back to in-memory: nonces lost on restart mean
                // replays of every recently settled payment.
                tracing::error!(path = %path, error = %e, "failed to open nonce store");
                tracing::error!("refusing to start without durable replay protection");
                std::process::exit(1);
            }
        },
        None => {
            if config.production {
                tracing::error!("DATABASE_PATH is required in production");
                std::process::exit(1);
            }
            warnings.push("nonce store is in-memory; replays possible after restart".to_string());
            tracing::warn!("nonce store: in-memory (non-production only)");
            Arc::new(InMemoryNonceStore::new())
        }
    };
    if config.production && nonce_store.is_ephemeral() {
        tracing::error!("ephemeral nonce store in production, refusing to start");
        std::process::exit(1);
    }

    let audit = match &config.database_path {
        Some(path) => AuditLog::open(path).unwrap_or_else(|e| {
            tracing::error!(path = %path, error = %e, "failed to open audit log");
            std::process::exit(1);
        }),
        None => {
            warnings.push("audit log is in-memory".to_string());
            AuditLog::in_memory().expect("in-memory sqlite cannot fail to open")
        }
    };

    let webhook_db = config
        .webhook_db_path
        .as_ref()
        .or(config.database_path.as_ref());
    let webhooks = match webhook_db {
        Some(path) => WebhookStore::open(path).unwrap_or_else(|e| {
            tracing::error!(path = %path, error = %e, "failed to open webhook store");
            std::process::exit(1);
        }),
        None => WebhookStore::in_memory().expect("in-memory sqlite cannot fail to open"),
    };

    let registry = Arc::new(TokenRegistry::with_defaults(chain_id));
    if registry.all().is_empty() {
        warnings.push(format!("no curated tokens for chain {chain_id}"));
    }

    let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
    webhook::spawn_dispatcher(webhooks.clone(), webhook::webhook_client(), events_rx);

    let submitter = submitter::spawn(
        provider.clone(),
        SubmitterConfig {
            facilitator: facilitator_address,
            permit2: chain_config.permit2,
            splitter: chain_config.splitter,
            confirmations: chain_config.confirmations,
            max_gas_price: config.max_gas_price,
        },
    );

    let verifier = Verifier::new(
        provider,
        facilitator_address,
        chain_config.clone(),
        registry.clone(),
        nonce_store.clone(),
    );

    let settings = SettlementSettings {
        timeout: Duration::from_millis(config.settlement_timeout_ms),
        min_settlement_unit: U256::from_str_radix(&config.min_settlement_unit, 10)
            .unwrap_or(U256::ZERO),
    };

    let orchestrator = Arc::new(SettlementOrchestrator::new(
        verifier,
        audit,
        nonce_store,
        submitter,
        settings,
        Some(events_tx),
    ));

    let prices = Arc::new(PriceCache::new(config.price_refresh_secs));
    prices.start();

    let resources = match &config.discovery_resources_path {
        Some(path) => discovery::load_resources(path).unwrap_or_else(|e| {
            tracing::error!(error = %e, "discovery catalog load failed");
            std::process::exit(1);
        }),
        None => Vec::new(),
    };

    if chain_config.splitter.is_none() {
        tracing::info!("fee splitter disabled; settlements pay receivers directly");
    } else {
        tracing::info!(
            splitter = ?chain_config.splitter,
            mode = ?chain_config.mode,
            "fee splitter enabled"
        );
    }
    tracing::info!(
        facilitator = %facilitator_address,
        network = %chain_config.network,
        "facilitator state constructed"
    );

    Arc::new(AppState {
        orchestrator,
        registry,
        prices,
        webhooks,
        resources,
        network: chain_config.network,
        facilitator_address,
        metrics_token: config.metrics_token.clone().map(String::into_bytes),
        warnings,
        ready: AtomicBool::new(true),
    })
}
