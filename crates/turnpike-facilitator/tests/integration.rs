use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use actix_web::{test, web, App};
use alloy::network::EthereumWallet;
use alloy::primitives::{address, Address};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use alloy::sol_types::SolStruct;

use turnpike::audit::AuditLog;
use turnpike::constants::PERMIT2_ADDRESS;
use turnpike::eip712;
use turnpike::nonce_store::{InMemoryNonceStore, NonceStore};
use turnpike::payment::{DirectAuthAuthorization, DirectAuthPayload, ExactPayload};
use turnpike::price::PriceCache;
use turnpike::settlement::{SettlementOrchestrator, SettlementSettings};
use turnpike::submitter::{self, SubmitterConfig};
use turnpike::tokens::TokenRegistry;
use turnpike::verifier::Verifier;
use turnpike::ChainConfig;

use turnpike_facilitator::routes;
use turnpike_facilitator::state::AppState;
use turnpike_facilitator::webhook::WebhookStore;

const USDC: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");
const RECEIVER: Address = address!("1111111111111111111111111111111111111111");
const FAR_FUTURE: u64 = 4_102_444_800;

fn make_state_with(ready: bool, metrics_token: Option<Vec<u8>>) -> web::Data<AppState> {
    let signer = PrivateKeySigner::random();
    let facilitator_address = signer.address();

    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect_http("http://localhost:1".parse().unwrap());

    let registry = Arc::new(TokenRegistry::with_defaults(8453));
    let nonces: Arc<dyn NonceStore> = Arc::new(InMemoryNonceStore::new());

    let verifier = Verifier::new(
        provider.clone(),
        facilitator_address,
        ChainConfig::default(),
        registry.clone(),
        nonces.clone(),
    );

    let submitter = submitter::spawn(
        provider,
        SubmitterConfig {
            facilitator: facilitator_address,
            permit2: PERMIT2_ADDRESS,
            splitter: None,
            confirmations: 1,
            max_gas_price: None,
        },
    );

    let orchestrator = Arc::new(SettlementOrchestrator::new(
        verifier,
        AuditLog::in_memory().unwrap(),
        nonces,
        submitter,
        SettlementSettings::default(),
        None,
    ));

    web::Data::new(AppState {
        orchestrator,
        registry,
        prices: Arc::new(PriceCache::new(300)),
        webhooks: WebhookStore::in_memory().unwrap(),
        resources: vec![],
        network: "eip155:8453".to_string(),
        facilitator_address,
        metrics_token,
        warnings: vec![],
        ready: AtomicBool::new(ready),
    })
}

fn make_state() -> web::Data<AppState> {
    make_state_with(true, None)
}

/// A structurally valid, correctly signed direct-auth payment request.
fn signed_payment_request(valid_after: u64, valid_before: u64) -> serde_json::Value {
    let signer = PrivateKeySigner::random();
    let auth = DirectAuthAuthorization {
        from: signer.address(),
        to: RECEIVER,
        value: "1000000".to_string(),
        valid_after,
        valid_before,
        nonce: format!("{}", eip712::random_nonce()),
    };
    let domain = eip712::token_domain("USD Coin", "2", 8453, USDC);
    let hash = eip712::direct_auth_struct(&auth)
        .unwrap()
        .eip712_signing_hash(&domain);
    let sig = signer.sign_hash_sync(&hash).unwrap();

    let payload = ExactPayload::DirectAuth(DirectAuthPayload {
        signature: format!("0x{}", alloy::hex::encode(sig.as_bytes())),
        authorization: auth,
    });

    serde_json::json!({
        "x402Version": 2,
        "paymentPayload": {
            "scheme": "exact",
            "network": "eip155:8453",
            "payload": payload,
        },
        "paymentRequirements": {
            "scheme": "exact",
            "network": "eip155:8453",
            "maxAmountRequired": "1000000",
            "resource": "https://api.example.com/data",
            "payTo": format!("{RECEIVER:#x}"),
            "asset": format!("{USDC:#x}"),
        }
    })
}

#[actix_rt::test]
async fn test_supported_advertises_scheme_network_tokens() {
    let state = make_state();
    let app = test::init_service(App::new().app_data(state).service(routes::supported)).await;

    let req = test::TestRequest::get().uri("/supported").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["schemes"][0], "exact");
    assert_eq!(body["networks"][0], "eip155:8453");
    assert_eq!(body["tokens"][0]["symbol"], "USDC");
    assert_eq!(body["x402Versions"], serde_json::json!([1, 2]));
}

#[actix_rt::test]
async fn test_verify_rejects_malformed_body() {
    let state = make_state();
    let app = test::init_service(App::new().app_data(state).service(routes::verify)).await;

    let req = test::TestRequest::post()
        .uri("/verify")
        .insert_header(("Content-Type", "application/json"))
        .set_payload("not json at all")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "invalid_payload");
}

#[actix_rt::test]
async fn test_verify_quick_accepts_valid_payload() {
    let state = make_state();
    let app = test::init_service(App::new().app_data(state).service(routes::verify_quick)).await;

    let body = signed_payment_request(0, FAR_FUTURE);
    let req = test::TestRequest::post()
        .uri("/verify/quick")
        .set_json(&body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["isValid"], true);
    assert!(body["payer"].as_str().unwrap().starts_with("0x"));
}

#[actix_rt::test]
async fn test_verify_quick_semantic_failure_is_200() {
    let state = make_state();
    let app = test::init_service(App::new().app_data(state).service(routes::verify_quick)).await;

    // Expired window: semantically invalid, structurally fine.
    let body = signed_payment_request(0, 1);
    let req = test::TestRequest::post()
        .uri("/verify/quick")
        .set_json(&body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["isValid"], false);
    assert_eq!(body["invalidReason"], "invalid_authorization_valid_before");
}

#[actix_rt::test]
async fn test_verify_accepts_payload_alias() {
    let state = make_state();
    let app = test::init_service(App::new().app_data(state).service(routes::verify_quick)).await;

    // Same request with the older `payload` field name.
    let mut body = signed_payment_request(0, FAR_FUTURE);
    let payment = body["paymentPayload"].take();
    body["payload"] = payment;
    body.as_object_mut().unwrap().remove("paymentPayload");

    let req = test::TestRequest::post()
        .uri("/verify/quick")
        .set_json(&body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["isValid"], true);
}

#[actix_rt::test]
async fn test_settle_semantic_failure_is_200_with_reason() {
    let state = make_state();
    let app = test::init_service(App::new().app_data(state).service(routes::settle)).await;

    let body = signed_payment_request(0, 1);
    let req = test::TestRequest::post()
        .uri("/settle")
        .set_json(&body)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["errorReason"], "invalid_authorization_valid_before");
    assert_eq!(body["network"], "eip155:8453");
}

#[actix_rt::test]
async fn test_settle_unavailable_before_initialization() {
    let state = make_state_with(false, None);
    let app = test::init_service(App::new().app_data(state).service(routes::settle)).await;

    let req = test::TestRequest::post()
        .uri("/settle")
        .set_json(&signed_payment_request(0, FAR_FUTURE))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
}

#[actix_rt::test]
async fn test_settle_recent_empty() {
    let state = make_state();
    let app = test::init_service(App::new().app_data(state).service(routes::settle_recent)).await;

    let req = test::TestRequest::get().uri("/settle/recent").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["transactions"], serde_json::json!([]));
}

#[actix_rt::test]
async fn test_settle_stats_start_at_zero() {
    let state = make_state();
    let app = test::init_service(App::new().app_data(state).service(routes::settle_stats)).await;

    let req = test::TestRequest::get().uri("/settle/stats").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["total"], 0);
    assert_eq!(body["totalVolume"], "0");
    assert_eq!(body["totalFees"], "0");
}

#[actix_rt::test]
async fn test_webhook_lifecycle() {
    let state = make_state();
    let app = test::init_service(
        App::new()
            .app_data(state)
            .service(routes::register_webhook)
            .service(routes::list_webhooks)
            .service(routes::deactivate_webhook),
    )
    .await;

    // Register
    let req = test::TestRequest::post()
        .uri("/webhooks")
        .set_json(serde_json::json!({
            "url": "https://hooks.example.com/pay",
            "events": ["settlement.success"],
            "secret": "hook-secret"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 201);
    let created: serde_json::Value = test::read_body_json(resp).await;
    let id = created["id"].as_i64().unwrap();
    assert!(created.get("secret").is_none());

    // List
    let req = test::TestRequest::get().uri("/webhooks").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let listed: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(listed["webhooks"].as_array().unwrap().len(), 1);
    assert!(listed["webhooks"][0].get("secret").is_none());

    // Deactivate
    let req = test::TestRequest::delete()
        .uri(&format!("/webhooks/{id}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    // Deactivating again is a 404
    let req = test::TestRequest::delete()
        .uri(&format!("/webhooks/{id}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

#[actix_rt::test]
async fn test_webhook_rejects_unknown_events_and_bad_urls() {
    let state = make_state();
    let app =
        test::init_service(App::new().app_data(state).service(routes::register_webhook)).await;

    let req = test::TestRequest::post()
        .uri("/webhooks")
        .set_json(serde_json::json!({
            "url": "https://hooks.example.com",
            "events": ["settlement.exploded"]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    let req = test::TestRequest::post()
        .uri("/webhooks")
        .set_json(serde_json::json!({
            "url": "ftp://hooks.example.com",
            "events": ["settlement.success"]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);

    // Plain http is a hard failure, not a warning.
    let req = test::TestRequest::post()
        .uri("/webhooks")
        .set_json(serde_json::json!({
            "url": "http://hooks.example.com/pay",
            "events": ["settlement.success"]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "invalid_webhook_url");
}

#[actix_rt::test]
async fn test_discovery_resources_empty_catalog() {
    let state = make_state();
    let app =
        test::init_service(App::new().app_data(state).service(routes::discovery_resources)).await;

    let req = test::TestRequest::get()
        .uri("/discovery/resources")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["count"], 0);
}

#[actix_rt::test]
async fn test_health_reports_ok() {
    let state = make_state();
    let app = test::init_service(App::new().app_data(state).service(routes::health)).await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["network"], "eip155:8453");
}

#[actix_rt::test]
async fn test_metrics_forbidden_without_token_config() {
    let state = make_state();
    let app =
        test::init_service(App::new().app_data(state).service(routes::metrics_endpoint)).await;

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 403);
}

#[actix_rt::test]
async fn test_metrics_requires_bearer_token() {
    let state = make_state_with(true, Some(b"metrics-token-123".to_vec()));
    let app =
        test::init_service(App::new().app_data(state).service(routes::metrics_endpoint)).await;

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::get()
        .uri("/metrics")
        .insert_header(("Authorization", "Bearer wrong"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 401);

    let req = test::TestRequest::get()
        .uri("/metrics")
        .insert_header(("Authorization", "Bearer metrics-token-123"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
}
