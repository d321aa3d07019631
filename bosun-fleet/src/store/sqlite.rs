use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use bosun_core::{DeviceId, DeviceKind, DeviceRecord, Percentage};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::{DeviceStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('button', 'smartwatch', 'repeater')),
    location TEXT NOT NULL,
    battery INTEGER NOT NULL,
    signal INTEGER NOT NULL,
    virtual_device INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// SQLite-backed device store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let connection_string = format!("sqlite:{}?mode=rwc", path.as_ref().display());
        let pool = SqlitePoolOptions::new().connect(&connection_string).await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

fn kind_from_str(s: &str) -> Result<DeviceKind, StoreError> {
    match s {
        "button" => Ok(DeviceKind::Button),
        "smartwatch" => Ok(DeviceKind::Smartwatch),
        "repeater" => Ok(DeviceKind::Repeater),
        other => Err(StoreError::InvalidKind(other.to_owned())),
    }
}

fn row_to_record(row: &SqliteRow) -> Result<DeviceRecord, StoreError> {
    let kind: String = row.get("kind");
    let created_at: String = row.get("created_at");
    let timestamp = jiff::Timestamp::from_str(&created_at)
        .map_err(|_| StoreError::InvalidTimestamp(created_at))?;

    Ok(DeviceRecord {
        id: DeviceId::from(row.get::<String, _>("id").as_str()),
        name: row.get::<String, _>("name").into_boxed_str(),
        kind: kind_from_str(&kind)?,
        location: row.get::<String, _>("location").into_boxed_str(),
        battery: Percentage::new(row.get::<i64, _>("battery") as u8),
        signal: Percentage::new(row.get::<i64, _>("signal") as u8),
        virtual_device: row.get::<i64, _>("virtual_device") != 0,
        created_at: timestamp,
    })
}

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn insert(&self, record: DeviceRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO devices
                (id, name, kind, location, battery, signal, virtual_device, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.name.as_ref())
        .bind(record.kind.as_str())
        .bind(record.location.as_ref())
        .bind(record.battery.0 as i64)
        .bind(record.signal.0 as i64)
        .bind(record.virtual_device as i64)
        .bind(record.created_at.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &DeviceId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM devices WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM devices WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM devices ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }
}
