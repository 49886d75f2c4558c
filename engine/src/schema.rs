//! Partition layout and schema upgrades.
//!
//! Every domain table lives in its own partition with two secondary indexes
//! (`owner_id` and `synced`). The sync queue, settings, conflicts and id
//! mappings each get a partition of their own. The upgrade hook is keyed on
//! `PRAGMA user_version` and only ever creates what is missing.

use crate::{error::Result, Error};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: i64 = 2;

/// The closed set of domain tables the engine stores and syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Patients,
    Appointments,
    Treatments,
    Clinics,
}

impl Table {
    /// Every domain table, in pull order.
    pub const ALL: [Table; 4] = [
        Table::Patients,
        Table::Appointments,
        Table::Treatments,
        Table::Clinics,
    ];

    /// Partition / remote table name.
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Patients => "patients",
            Table::Appointments => "appointments",
            Table::Treatments => "treatments",
            Table::Clinics => "clinics",
        }
    }

    /// Payload field holding the id of the owning collection, if any.
    pub fn owner_field(self) -> Option<&'static str> {
        match self {
            Table::Patients | Table::Appointments | Table::Treatments => Some("clinic_id"),
            Table::Clinics => None,
        }
    }

    /// Settings key of this table's pull checkpoint.
    pub fn checkpoint_key(self) -> String {
        format!("lastSync_{}", self.as_str())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Table::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| Error::UnknownTable(s.to_string()))
    }
}

/// A payload type bound to exactly one domain table.
///
/// Payloads serialize to JSON objects. Unknown fields such as `id` and
/// `updated_at`, which the store and the remote add, must be tolerated.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: Table;
}

/// Secondary index lookups supported by every domain partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
    /// Every record in the partition.
    All,
    /// Records owned by the given collection id.
    OwnerId(String),
    /// Records whose sync flag matches.
    Synced(bool),
}

/// Bring the database up to [`SCHEMA_VERSION`].
///
/// Every `IF NOT EXISTS` statement runs on each call, so a partition or
/// index lost from an up-to-date database is recreated. The version stamp
/// only ever moves forward.
pub async fn upgrade(pool: &SqlitePool) -> Result<()> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;

    if version > SCHEMA_VERSION {
        return Err(Error::Migration(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    let mut tx = pool.begin().await?;
    for step in 1..=SCHEMA_VERSION {
        for statement in statements_for(step) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
    }
    if version < SCHEMA_VERSION {
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    if version < SCHEMA_VERSION {
        tracing::info!(
            "Upgraded record store schema from version {} to {}",
            version,
            SCHEMA_VERSION
        );
    }
    Ok(())
}

/// DDL introduced by a schema version.
fn statements_for(version: i64) -> Vec<String> {
    match version {
        1 => {
            let mut statements = Vec::new();
            for table in Table::ALL {
                statements.extend(record_partition_ddl(table));
            }
            statements.push(
                "CREATE TABLE IF NOT EXISTS sync_queue (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    record_id TEXT NOT NULL,
                    data TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT
                )"
                .to_string(),
            );
            statements.push(
                "CREATE INDEX IF NOT EXISTS idx_sync_queue_record
                 ON sync_queue(table_name, record_id)"
                    .to_string(),
            );
            statements.push(
                "CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )"
                .to_string(),
            );
            statements
        }
        2 => vec![
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                table_name TEXT NOT NULL,
                record_id TEXT NOT NULL,
                local_data TEXT NOT NULL,
                server_data TEXT NOT NULL,
                conflict_fields TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                last_modified_by TEXT
            )"
            .to_string(),
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_conflicts_record
             ON sync_conflicts(table_name, record_id)"
                .to_string(),
            "CREATE TABLE IF NOT EXISTS id_mappings (
                table_name TEXT NOT NULL,
                temp_id TEXT NOT NULL,
                server_id TEXT NOT NULL,
                mapped_at INTEGER NOT NULL,
                PRIMARY KEY (table_name, temp_id)
            )"
            .to_string(),
        ],
        _ => Vec::new(),
    }
}

fn record_partition_ddl(table: Table) -> [String; 3] {
    let name = table.as_str();
    [
        format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                owner_id TEXT,
                synced INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                timestamp INTEGER NOT NULL,
                last_modified INTEGER NOT NULL
            )"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{name}_owner_id ON {name}(owner_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{name}_synced ON {name}(synced)"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[test]
    fn table_names_roundtrip() {
        for table in Table::ALL {
            assert_eq!(table.as_str().parse::<Table>().unwrap(), table);
        }
        assert!(matches!(
            "invoices".parse::<Table>(),
            Err(Error::UnknownTable(name)) if name == "invoices"
        ));
    }

    #[test]
    fn owner_fields() {
        assert_eq!(Table::Patients.owner_field(), Some("clinic_id"));
        assert_eq!(Table::Clinics.owner_field(), None);
    }

    #[test]
    fn checkpoint_key_format() {
        assert_eq!(Table::Appointments.checkpoint_key(), "lastSync_appointments");
    }

    #[test]
    fn table_serializes_lowercase() {
        let json = serde_json::to_string(&Table::Treatments).unwrap();
        assert_eq!(json, "\"treatments\"");
    }

    #[tokio::test]
    async fn upgrade_creates_partitions() {
        let pool = memory_pool().await;
        upgrade(&pool).await.unwrap();

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_patients_%'
             ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(names, vec!["idx_patients_owner_id", "idx_patients_synced"]);
    }

    #[tokio::test]
    async fn upgrade_is_idempotent() {
        let pool = memory_pool().await;
        upgrade(&pool).await.unwrap();
        upgrade(&pool).await.unwrap();

        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sync_queue'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn missing_index_is_recreated_at_current_version() {
        let pool = memory_pool().await;
        upgrade(&pool).await.unwrap();
        sqlx::query("DROP INDEX idx_patients_synced")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("DROP TABLE id_mappings")
            .execute(&pool)
            .await
            .unwrap();

        upgrade(&pool).await.unwrap();

        let objects: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master
             WHERE name IN ('idx_patients_synced', 'id_mappings') ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(objects, vec!["id_mappings", "idx_patients_synced"]);

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn newer_schema_is_rejected() {
        let pool = memory_pool().await;
        sqlx::query("PRAGMA user_version = 99")
            .execute(&pool)
            .await
            .unwrap();

        assert!(matches!(upgrade(&pool).await, Err(Error::Migration(_))));
    }
}
