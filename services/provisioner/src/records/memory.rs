//! In-memory record table.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{RecordItem, RecordTable, StoreError};

/// Record table held in process memory.
#[derive(Debug, Default)]
pub struct MemoryTable {
    items: RwLock<HashMap<String, RecordItem>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table pre-populated with one item.
    pub fn with_item(item: RecordItem) -> Self {
        let mut items = HashMap::new();
        if let Some(id) = item.id() {
            items.insert(id.to_string(), item);
        }
        Self {
            items: RwLock::new(items),
        }
    }
}

#[async_trait]
impl RecordTable for MemoryTable {
    async fn get(&self, id: &str) -> Result<Option<RecordItem>, StoreError> {
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn update(&self, item: RecordItem) -> Result<RecordItem, StoreError> {
        let id = item
            .id()
            .ok_or(StoreError::Malformed {
                attribute: "id",
                detail: "missing".to_string(),
            })?
            .to_string();

        let mut items = self.items.write().await;
        let stored = items.entry(id).or_default();
        stored.merge(item);
        Ok(stored.clone())
    }
}
