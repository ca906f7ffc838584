use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::{web, App, HttpServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use turnpike::config::FacilitatorConfig;
use turnpike_facilitator::{bootstrap, routes};

fn build_cors(origins: &[String]) -> Cors {
    if origins.is_empty() {
        // Default: allow localhost on any port
        Cors::default()
            .allowed_origin_fn(|origin, _| {
                origin
                    .to_str()
                    .map(|o| o == "http://localhost" || o.starts_with("http://localhost:"))
                    .unwrap_or(false)
            })
            .allow_any_method()
            .allowed_headers(vec!["content-type", "authorization"])
            .max_age(3600)
    } else {
        let mut cors = Cors::default();
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
        cors.allow_any_method()
            .allowed_headers(vec!["content-type", "authorization"])
            .max_age(3600)
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = FacilitatorConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "configuration invalid");
        std::process::exit(1);
    });
    tracing::debug!(?config, "configuration loaded");

    let port = config.port;
    let rate_limit_rpm = config.rate_limit_rpm as u64;
    let cors_origins = config.allowed_origins.clone();

    let state = bootstrap::build_state(&config);
    let data = web::Data::from(state);

    tracing::info!("turnpike facilitator listening on port {port}");
    tracing::info!("rate limit: {rate_limit_rpm} req/min per source");
    tracing::info!("  GET  http://localhost:{port}/supported");
    tracing::info!("  POST http://localhost:{port}/verify");
    tracing::info!("  POST http://localhost:{port}/settle");

    let governor_conf = GovernorConfigBuilder::default()
        .requests_per_minute(rate_limit_rpm)
        .finish()
        .expect("failed to build rate limiter config");

    HttpServer::new(move || {
        App::new()
            .wrap(build_cors(&cors_origins))
            .wrap(Governor::new(&governor_conf))
            .app_data(data.clone())
            .app_data(web::JsonConfig::default().limit(65_536))
            .service(routes::health)
            .service(routes::metrics_endpoint)
            .service(routes::supported)
            .service(routes::verify)
            .service(routes::verify_quick)
            .service(routes::settle)
            .service(routes::settle_recent)
            .service(routes::settle_stats)
            .service(routes::register_webhook)
            .service(routes::list_webhooks)
            .service(routes::deactivate_webhook)
            .service(routes::discovery_resources)
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
