//! entitlement-server
//!
//! Axum server behind the mobile app's paywall: starts Stripe checkouts and
//! portal sessions for a device, reports its entitlement, and applies Stripe
//! webhooks to the entitlement store.

mod config;
mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use entitlement_sync::{
    EntitlementStore, MemoryEntitlementStore, SignatureVerifier, SqliteEntitlementStore,
    StripeClient,
};

use crate::config::ServerConfig;
use crate::handlers::{
    create_checkout, create_portal, entitlement_status, health_check, stripe_webhook,
};
use crate::state::{AppState, Billing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let config = ServerConfig::from_env();

    // Entitlement store
    let store = open_store(&config).await?;

    // Payments
    let billing = match StripeClient::from_env() {
        Ok(client) => {
            tracing::info!("✓ Stripe configured");
            let verifier = SignatureVerifier::new(
                client.webhook_secret(),
                client.config().webhook_tolerance_secs,
            );
            Some(Billing::new(Arc::new(client), store.clone(), verifier))
        }
        Err(e) => {
            tracing::warn!("⚠ Stripe not configured - payments disabled ({})", e);
            tracing::warn!("  Set STRIPE_SECRET_KEY, STRIPE_WEBHOOK_SECRET and the STRIPE_PRICE_* ids in .env");
            None
        }
    };

    let state = AppState {
        store: store.clone(),
        billing,
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 entitlement-server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                 - Health check");
    tracing::info!("  POST /api/checkout           - Create Stripe checkout");
    tracing::info!("  POST /api/portal             - Open billing portal");
    tracing::info!("  GET  /api/status/{{deviceId}}  - Entitlement for a device");
    tracing::info!("  POST /webhook/stripe         - Stripe webhooks");
    tracing::info!("");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    tracing::info!("Entitlement store closed");

    Ok(())
}

/// Build the router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        // Paywall API
        .route("/api/checkout", post(create_checkout))
        .route("/api/portal", post(create_portal))
        .route("/api/status/{device_id}", get(entitlement_status))
        // Stripe
        .route("/webhook/stripe", post(stripe_webhook))
        .layer(CatchPanicLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn open_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn EntitlementStore>> {
    if config.uses_memory_store() {
        tracing::warn!("⚠ Using in-memory entitlement store - records are lost on restart");
        return Ok(Arc::new(MemoryEntitlementStore::new()));
    }

    let store = SqliteEntitlementStore::open(&config.database_url).await?;
    tracing::info!(database_url = %config.database_url, "✓ Entitlement store ready");
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}
