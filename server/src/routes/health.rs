//! Liveness and database reachability.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use harbor_engine::Table;
use serde::Serialize;

use crate::{db, AppState};

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the database cannot be reached
    pub status: &'static str,
    pub version: &'static str,
    pub database: &'static str,
    /// Tables the row API serves
    pub tables: Vec<&'static str>,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// GET /health - 200 when the pool answers `SELECT 1`, 503 otherwise.
async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status, database) = match db::ping(&state.pool).await {
        Ok(()) => (StatusCode::OK, "ok", "ok"),
        Err(e) => {
            tracing::warn!("Health check could not reach the database: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "degraded", "unavailable")
        }
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            database,
            tables: Table::ALL.iter().map(|table| table.as_str()).collect(),
        }),
    )
}

/// Root handler.
async fn root() -> &'static str {
    "Harbor Table Server"
}
