pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use bosun_core::{DeviceId, DeviceRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid device kind: {0}")]
    InvalidKind(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// External persistence boundary for device records.
///
/// The fleet writes a row on creation and deletes it on removal; nothing in
/// the simulation depends on the schema beyond `DeviceRecord`'s fields.
#[async_trait]
pub trait DeviceStore: Send + Sync + 'static {
    async fn insert(&self, record: DeviceRecord) -> Result<(), StoreError>;

    async fn delete(&self, id: &DeviceId) -> Result<(), StoreError>;

    async fn get(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<DeviceRecord>, StoreError>;
}
