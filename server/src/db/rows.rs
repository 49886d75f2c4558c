//! Database operations for the rows table.

use serde_json::{Map, Value};
use sqlx::{PgPool, Row};

/// A stored row from the database.
#[derive(Debug)]
pub struct StoredRow {
    pub table_name: String,
    pub id: String,
    pub data: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredRow {
            table_name: row.try_get("table_name")?,
            id: row.try_get("id")?,
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredRow {
    /// The row as clients see it: its payload plus `id` and `updated_at`.
    pub fn into_json(self) -> Value {
        let mut object = match self.data {
            Value::Object(object) => object,
            _ => Map::new(),
        };
        object.insert("id".to_string(), Value::String(self.id));
        object.insert("updated_at".to_string(), Value::from(self.updated_at));
        Value::Object(object)
    }
}

const RETURNING: &str = "RETURNING table_name, id, data, created_at, updated_at";

/// Insert a row, replacing the payload of an existing one with the same id.
pub async fn insert_row(
    pool: &PgPool,
    table: &str,
    id: &str,
    data: &Value,
    now: i64,
) -> Result<StoredRow, sqlx::Error> {
    sqlx::query_as::<_, StoredRow>(&format!(
        r#"
        INSERT INTO rows (table_name, id, data, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $4)
        ON CONFLICT (table_name, id) DO UPDATE SET
            data = EXCLUDED.data,
            updated_at = EXCLUDED.updated_at
        {RETURNING}
        "#
    ))
    .bind(table)
    .bind(id)
    .bind(data)
    .bind(now)
    .fetch_one(pool)
    .await
}

/// Shallow-merge a patch into a row. Returns `None` if the row does not exist.
pub async fn update_row(
    pool: &PgPool,
    table: &str,
    id: &str,
    patch: &Value,
    now: i64,
) -> Result<Option<StoredRow>, sqlx::Error> {
    sqlx::query_as::<_, StoredRow>(&format!(
        r#"
        UPDATE rows SET data = data || $3, updated_at = $4
        WHERE table_name = $1 AND id = $2
        {RETURNING}
        "#
    ))
    .bind(table)
    .bind(id)
    .bind(patch)
    .bind(now)
    .fetch_optional(pool)
    .await
}

/// Delete a row. Returns whether it existed.
pub async fn delete_row(pool: &PgPool, table: &str, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM rows WHERE table_name = $1 AND id = $2")
        .bind(table)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Rows of a table changed after `since`, oldest change first.
pub async fn rows_since(
    pool: &PgPool,
    table: &str,
    since: Option<i64>,
) -> Result<Vec<StoredRow>, sqlx::Error> {
    sqlx::query_as::<_, StoredRow>(
        r#"
        SELECT table_name, id, data, created_at, updated_at
        FROM rows
        WHERE table_name = $1 AND ($2::BIGINT IS NULL OR updated_at > $2)
        ORDER BY updated_at, id
        "#,
    )
    .bind(table)
    .bind(since)
    .fetch_all(pool)
    .await
}
