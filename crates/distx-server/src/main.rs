//! # distx-server: HTTP Service for the Distributed Optimizer
//!
//! Exposes the optimizer as a JSON service. A frontend that has already parsed
//! and analyzed a query posts the logical plan together with the table metadata
//! and statistics it refers to, and gets back the fragmented physical plan.
//!
//! ```text
//! Frontend
//!   |
//!   | HTTP POST /optimize (catalog + logical query + session config, JSON)
//!   v
//! distx-server (this binary)
//!   |
//!   +-> validate plan and config
//!   +-> rewrite, implement, cost
//!   +-> runtime filters, fragments
//!   |
//!   | HTTP response (EXPLAIN text + fragments, JSON)
//!   v
//! Frontend
//! ```
//!
//! ## Endpoints
//!
//! - `GET  /health`    - Health check
//! - `GET  /rules`     - List the registered rules
//! - `POST /optimize`  - Optimize a query, returning EXPLAIN text and fragments
//! - `POST /explain`   - Optimize a query, returning EXPLAIN text only
//!
//! ## Configuration
//!
//! The server listens on `DISTX_LISTEN_ADDR` (default `0.0.0.0:3000`). Logging is
//! controlled by the `RUST_LOG` environment variable (defaults to `distx=debug`).

mod routes;
mod state;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

pub(crate) fn app(state: Arc<state::AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/rules", get(routes::list_rules))
        .route("/optimize", post(routes::optimize))
        .route("/explain", post(routes::explain))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("distx=debug")),
        )
        .init();

    let state = Arc::new(state::AppState::new());
    let addr = std::env::var("DISTX_LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("distx-server listening on http://{}", addr);
    axum::serve(listener, app(state)).await
}
