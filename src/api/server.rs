//! API Server Module
//!
//! Liveness endpoints for the relay:
//! - GET / - plain text liveness
//! - GET /health - JSON health check

use axum::{response::IntoResponse, routing::get, Json, Router};
use std::future::Future;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// GET /
async fn handle_root() -> &'static str {
    "server is running"
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "deposit-airdrop",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Create the router with all endpoints
pub fn create_router() -> Router {
    // CORS configuration - allow any origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .layer(cors)
}

/// Serve until `shutdown` resolves
pub async fn start_server<F>(port: u16, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router();
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
