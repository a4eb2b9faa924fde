//! HTTP surface for on-demand runs.
//!
//! - `GET /health`
//! - `GET /cron/run?seq=&mailbox=&sync=&delete=` runs every account
//! - `GET /cron/run/:account` runs one account
//!
//! Successful runs answer `{"statusCode":200,"data":...}`.

pub mod handlers;

pub use handlers::{health, run_account, run_all, AppState, HealthResponse, RunQuery};

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

/// Build the router with all routes and request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/cron/run", get(run_all))
        .route("/cron/run/:account", get(run_account))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
