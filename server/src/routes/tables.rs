//! Table API routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use harbor_engine::Table;
use serde_json::Value;

use crate::error::Result;
use crate::handlers::{handle_delete, handle_insert, handle_list, handle_update, RowsQuery};
use crate::AppState;

/// Create table routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/tables/{table}/rows", get(list_handler).post(insert_handler))
        .route(
            "/tables/{table}/rows/{id}",
            patch(update_handler).delete(delete_handler),
        )
}

/// GET /tables/{table}/rows - Rows changed after `updatedAfter`, or all rows.
async fn list_handler(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Query(query): Query<RowsQuery>,
) -> Result<Json<Vec<Value>>> {
    let table: Table = table.parse()?;
    Ok(Json(handle_list(&state.pool, table, query).await?))
}

/// POST /tables/{table}/rows - Insert a row.
async fn insert_handler(
    State(state): State<AppState>,
    Path(table): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>)> {
    let table: Table = table.parse()?;
    let row = handle_insert(&state.pool, table, body).await?;
    Ok((StatusCode::CREATED, Json(row)))
}

/// PATCH /tables/{table}/rows/{id} - Shallow-merge a patch into a row.
async fn update_handler(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let table: Table = table.parse()?;
    Ok(Json(handle_update(&state.pool, table, &id, body).await?))
}

/// DELETE /tables/{table}/rows/{id} - Delete a row.
async fn delete_handler(
    State(state): State<AppState>,
    Path((table, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let table: Table = table.parse()?;
    handle_delete(&state.pool, table, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
