//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! The relay exposes one websocket endpoint for presence channels and a
//! health probe. Everything else the live map needs lives in the managed
//! backend, not here.

pub mod ws;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/presence", get(ws::handle_presence))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 200 when the relay is up and, if configured, Postgres answers.
async fn healthz(State(state): State<AppState>) -> StatusCode {
    let Some(pool) = &state.pool else {
        return StatusCode::OK;
    };
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "healthz: database unreachable");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
