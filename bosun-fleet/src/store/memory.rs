use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bosun_core::{DeviceId, DeviceRecord};
use tokio::sync::Mutex;

use super::{DeviceStore, StoreError};

/// In-memory device store. Reference implementation of the trait, used by
/// tests and the default binary configuration.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<DeviceId, DeviceRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn insert(&self, record: DeviceRecord) -> Result<(), StoreError> {
        self.records.lock().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &DeviceId) -> Result<(), StoreError> {
        self.records.lock().await.remove(id);
        Ok(())
    }

    async fn get(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, StoreError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}
