use std::sync::atomic::Ordering;

use actix_web::{delete, get, post, web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

use turnpike::payment::{PaymentPayload, PaymentRequirements};
use turnpike::reason::ErrorReason;
use turnpike::security::redact_address;

use crate::metrics;
use crate::state::AppState;
use crate::webhook::KNOWN_EVENTS;

/// Request body accepted by `/verify` and `/settle`. Two client generations
/// are in the field: `payload` vs `paymentPayload`, and a top-level
/// `x402Version` in addition to the nested one.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    #[serde(alias = "payload")]
    pub payment_payload: PaymentPayload,
    #[serde(alias = "requirements")]
    pub payment_requirements: PaymentRequirements,
    #[serde(default)]
    pub x402_version: Option<u32>,
}

fn bad_request(detail: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(serde_json::json!({
        "error": ErrorReason::InvalidPayload.as_str(),
        "message": detail,
    }))
}

fn not_ready() -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(serde_json::json!({
        "error": "facilitator_not_initialized",
        "message": "the facilitator is still starting up",
    }))
}

fn parse_payment_request(body: &web::Bytes) -> Result<PaymentRequest, HttpResponse> {
    match serde_json::from_slice::<PaymentRequest>(body) {
        Ok(mut parsed) => {
            parsed
                .payment_payload
                .normalize(&parsed.payment_requirements, parsed.x402_version);
            Ok(parsed)
        }
        Err(e) => {
            tracing::debug!(error = %e, "structurally malformed payment request");
            Err(bad_request("request body does not parse as a payment request"))
        }
    }
}

#[get("/supported")]
pub async fn supported(state: web::Data<AppState>) -> HttpResponse {
    let tokens: Vec<serde_json::Value> = state
        .registry
        .all()
        .into_iter()
        .map(|t| {
            serde_json::json!({
                "address": format!("{:#x}", t.address),
                "symbol": t.symbol,
                "decimals": t.decimals,
                "feeBps": t.effective_fee_bps(),
                "feeExempt": t.fee_exempt,
            })
        })
        .collect();

    HttpResponse::Ok().json(serde_json::json!({
        "schemes": ["exact"],
        "networks": [state.network],
        "x402Versions": [1, 2],
        "tokens": tokens,
        "facilitator": {
            "address": format!("{:#x}", state.facilitator_address),
            "version": env!("CARGO_PKG_VERSION"),
        },
    }))
}

#[post("/verify")]
pub async fn verify(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    if !state.ready.load(Ordering::Relaxed) {
        return not_ready();
    }
    let parsed = match parse_payment_request(&body) {
        Ok(parsed) => parsed,
        Err(resp) => return resp,
    };

    let result = state
        .orchestrator
        .verifier()
        .verify(&parsed.payment_payload, &parsed.payment_requirements)
        .await;

    metrics::VERIFY_REQUESTS
        .with_label_values(&[if result.is_valid { "valid" } else { "invalid" }])
        .inc();

    // Semantic failures answer 200 with isValid=false; the approval-required
    // case alone maps to 412 because the client must act on-chain first.
    match result.invalid_reason {
        Some(r) if r.requires_client_action() => {
            HttpResponse::PreconditionFailed().json(result)
        }
        _ => HttpResponse::Ok().json(result),
    }
}

#[post("/verify/quick")]
pub async fn verify_quick(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    if !state.ready.load(Ordering::Relaxed) {
        return not_ready();
    }
    let parsed = match parse_payment_request(&body) {
        Ok(parsed) => parsed,
        Err(resp) => return resp,
    };

    let result = state
        .orchestrator
        .verifier()
        .verify_quick(&parsed.payment_payload, &parsed.payment_requirements)
        .await;

    metrics::VERIFY_REQUESTS
        .with_label_values(&[if result.is_valid { "valid" } else { "invalid" }])
        .inc();

    HttpResponse::Ok().json(result)
}

#[post("/settle")]
pub async fn settle(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    if !state.ready.load(Ordering::Relaxed) {
        return not_ready();
    }
    let parsed = match parse_payment_request(&body) {
        Ok(parsed) => parsed,
        Err(resp) => return resp,
    };

    let start = std::time::Instant::now();
    let result = state
        .orchestrator
        .settle(parsed.payment_payload, parsed.payment_requirements)
        .await;
    let elapsed = start.elapsed().as_secs_f64();

    let label = if result.success { "success" } else { "rejected" };
    metrics::SETTLE_REQUESTS.with_label_values(&[label]).inc();
    metrics::SETTLE_LATENCY
        .with_label_values(&[label])
        .observe(elapsed);

    if result.success {
        tracing::info!(
            payer = %result.payer.as_deref().map(redact_address).unwrap_or_default(),
            tx = ?result.ledger_tx_id,
            "settlement completed"
        );
    } else {
        tracing::warn!(
            payer = %result.payer.as_deref().map(redact_address).unwrap_or_default(),
            reason = %result.error_reason.map(|r| r.as_str()).unwrap_or("unknown"),
            "settlement rejected"
        );
    }

    // A settlement failure is still a successful RPC interaction: 200 with
    // success=false, except the approval-required case which maps to 412.
    match result.error_reason {
        Some(r) if r.requires_client_action() => HttpResponse::PreconditionFailed().json(result),
        _ => HttpResponse::Ok().json(result),
    }
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_recent_limit")]
    pub limit: u32,
}

fn default_recent_limit() -> u32 {
    20
}

/// A transaction record with addresses redacted for the public surface.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RedactedRecord {
    id: i64,
    payer: String,
    receiver: String,
    token_symbol: String,
    amount: String,
    fee: String,
    fee_bps: u32,
    network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ledger_tx_id: Option<String>,
    status: turnpike::audit::TxStatus,
    protocol: turnpike::payment::PaymentProtocol,
    created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    settled_at: Option<i64>,
}

#[get("/settle/recent")]
pub async fn settle_recent(
    state: web::Data<AppState>,
    query: web::Query<RecentQuery>,
) -> HttpResponse {
    match state.orchestrator.audit().recent(query.limit) {
        Ok(records) => {
            let redacted: Vec<RedactedRecord> = records
                .into_iter()
                .map(|r| RedactedRecord {
                    id: r.id,
                    payer: redact_address(&r.payer),
                    receiver: redact_address(&r.receiver),
                    token_symbol: r.token_symbol,
                    amount: r.amount,
                    fee: r.fee,
                    fee_bps: r.fee_bps,
                    network: r.network,
                    ledger_tx_id: r.ledger_tx_id,
                    status: r.status,
                    protocol: r.protocol,
                    created_at: r.created_at,
                    settled_at: r.settled_at,
                })
                .collect();
            HttpResponse::Ok().json(serde_json::json!({ "transactions": redacted }))
        }
        Err(e) => {
            tracing::error!(error = %e, "recent records read failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "audit_store_unavailable"
            }))
        }
    }
}

#[get("/settle/stats")]
pub async fn settle_stats(state: web::Data<AppState>) -> HttpResponse {
    match state.orchestrator.audit().stats() {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => {
            tracing::error!(error = %e, "stats read failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "audit_store_unavailable"
            }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterWebhook {
    pub url: String,
    pub events: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
}

#[post("/webhooks")]
pub async fn register_webhook(
    state: web::Data<AppState>,
    body: web::Json<RegisterWebhook>,
) -> HttpResponse {
    if let Err(e) = crate::webhook::validate_webhook_url(&body.url) {
        tracing::warn!(error = %e, "webhook registration rejected");
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "invalid_webhook_url",
            "message": e,
        }));
    }

    if body.events.is_empty() || body.events.iter().any(|e| !KNOWN_EVENTS.contains(&e.as_str()))
    {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "invalid_webhook_events",
            "known": KNOWN_EVENTS,
        }));
    }

    match state
        .webhooks
        .register(&body.url, &body.events, body.secret.as_deref())
    {
        Ok(record) => HttpResponse::Created().json(record),
        Err(e) => {
            tracing::error!(error = %e, "webhook registration failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "webhook_store_unavailable"
            }))
        }
    }
}

#[get("/webhooks")]
pub async fn list_webhooks(state: web::Data<AppState>) -> HttpResponse {
    match state.webhooks.list() {
        Ok(records) => HttpResponse::Ok().json(serde_json::json!({ "webhooks": records })),
        Err(e) => {
            tracing::error!(error = %e, "webhook list failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "webhook_store_unavailable"
            }))
        }
    }
}

#[delete("/webhooks/{id}")]
pub async fn deactivate_webhook(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> HttpResponse {
    let id = path.into_inner();
    match state.webhooks.deactivate(id) {
        Ok(true) => HttpResponse::Ok().json(serde_json::json!({ "deactivated": id })),
        Ok(false) => HttpResponse::NotFound().json(serde_json::json!({
            "error": "webhook_not_found"
        })),
        Err(e) => {
            tracing::error!(error = %e, "webhook deactivation failed");
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "webhook_store_unavailable"
            }))
        }
    }
}

#[get("/discovery/resources")]
pub async fn discovery_resources(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "resources": state.resources,
        "count": state.resources.len(),
    }))
}

#[get("/health")]
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let ready = state.ready.load(Ordering::Relaxed);
    let body = serde_json::json!({
        "status": if ready { "ok" } else { "starting" },
        "service": "turnpike-facilitator",
        "network": state.network,
        "facilitator": format!("{:#x}", state.facilitator_address),
        "warnings": state.warnings,
    });
    if ready {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

#[get("/metrics")]
pub async fn metrics_endpoint(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    match &state.metrics_token {
        Some(token) => {
            let authorized = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| turnpike::security::constant_time_eq(t.as_bytes(), token))
                .unwrap_or(false);
            if !authorized {
                return HttpResponse::Unauthorized().json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "Valid Bearer token required for /metrics"
                }));
            }
        }
        None => {
            let public_metrics = std::env::var("TURNPIKE_PUBLIC_METRICS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false);
            if !public_metrics {
                return HttpResponse::Forbidden().json(serde_json::json!({
                    "error": "forbidden",
                    "message": "Set METRICS_TOKEN or TURNPIKE_PUBLIC_METRICS=true to access /metrics"
                }));
            }
        }
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(metrics::metrics_output())
}
