//! Row handlers - the server side of the remote table API.
//!
//! Rows are opaque JSON objects keyed by table and id. The server owns `id`
//! (assigned on insert unless the client sent a non-temporary one) and
//! `updated_at` (stamped on every write, used by delta queries).

use crate::db;
use crate::error::{AppError, Result};
use harbor_engine::{is_temp_id, Table};
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::PgPool;

/// Fields clients may send but the server owns.
const SERVER_FIELDS: [&str; 2] = ["id", "updated_at"];

/// Query parameters for listing rows.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowsQuery {
    /// Only rows with `updated_at` strictly greater than this
    pub updated_after: Option<i64>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Split a request body into its payload and the id the client asked for.
fn split_body(body: Value) -> Result<(Map<String, Value>, Option<String>)> {
    let Value::Object(mut object) = body else {
        return Err(AppError::BadRequest("row must be a JSON object".to_string()));
    };

    let requested = object
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty() && !is_temp_id(id))
        .map(str::to_string);
    for field in SERVER_FIELDS {
        object.remove(field);
    }
    Ok((object, requested))
}

/// Insert a row and return it as stored.
pub async fn handle_insert(pool: &PgPool, table: Table, body: Value) -> Result<Value> {
    let (data, requested) = split_body(body)?;
    let id = requested.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let row = db::insert_row(pool, table.as_str(), &id, &Value::Object(data), now_millis()).await?;
    tracing::debug!("Inserted {}/{}", table, row.id);
    Ok(row.into_json())
}

/// Patch a row and return it as stored.
pub async fn handle_update(pool: &PgPool, table: Table, id: &str, body: Value) -> Result<Value> {
    let (patch, _) = split_body(body)?;

    let row = db::update_row(pool, table.as_str(), id, &Value::Object(patch), now_millis())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{table}/{id}")))?;
    tracing::debug!("Updated {}/{}", table, id);
    Ok(row.into_json())
}

/// Delete a row. Deleting a missing row succeeds, so retried deletes are harmless.
pub async fn handle_delete(pool: &PgPool, table: Table, id: &str) -> Result<()> {
    if db::delete_row(pool, table.as_str(), id).await? {
        tracing::debug!("Deleted {}/{}", table, id);
    }
    Ok(())
}

/// Rows changed since the query's checkpoint, or every row.
pub async fn handle_list(pool: &PgPool, table: Table, query: RowsQuery) -> Result<Vec<Value>> {
    let rows = db::rows_since(pool, table.as_str(), query.updated_after).await?;
    Ok(rows.into_iter().map(db::StoredRow::into_json).collect())
}
