//! Master volume record persistence.
//!
//! Exactly one [`VolumeRecord`] exists, stored under the fixed id `"0"`. It is
//! created out-of-band, read at the start of every workflow run, and only
//! rewritten after a successful replication or snapshot.
//!
//! Writes are read-then-write with no concurrency token: two overlapping runs
//! both succeed and the last write wins.

mod memory;
mod sqlite;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use voldr_id::{IdError, SnapshotId, VolumeId};

pub use memory::MemoryTable;
pub use sqlite::SqliteTable;

/// Fixed key of the singleton record.
pub const RECORD_ID: &str = "0";

const ATTR_ID: &str = "id";
const ATTR_VOLUME_ID: &str = "volumeId";
const ATTR_DEVICE: &str = "device";
const ATTR_SNAPSHOT_ID: &str = "snapshotId";

/// Errors from record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("volume record '{id}' not found")]
    RecordNotFound { id: String },

    #[error("malformed attribute '{attribute}': {detail}")]
    Malformed {
        attribute: &'static str,
        detail: String,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// An item in the external key-value format: attribute name to string value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordItem(BTreeMap<String, String>);

impl RecordItem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.0.get(attribute).map(String::as_str)
    }

    pub fn set(&mut self, attribute: &str, value: impl Into<String>) {
        self.0.insert(attribute.to_string(), value.into());
    }

    /// Overlay `other` on top of this item. Attributes missing from `other`
    /// keep their current value.
    pub fn merge(&mut self, other: RecordItem) {
        self.0.extend(other.0);
    }

    pub fn id(&self) -> Option<&str> {
        self.get(ATTR_ID)
    }
}

/// External key-value table holding the record.
#[async_trait]
pub trait RecordTable: Send + Sync {
    /// Fetch an item by key.
    async fn get(&self, id: &str) -> Result<Option<RecordItem>, StoreError>;

    /// Create or update an item and return what is now stored.
    ///
    /// Attributes absent from `item` are left untouched.
    async fn update(&self, item: RecordItem) -> Result<RecordItem, StoreError>;
}

/// The master volume record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    pub id: String,

    /// Recorded volume reference, kept verbatim. Only resolved against the
    /// provider; an unparseable value counts as a lost volume.
    pub volume_id: String,
    pub device: String,
    pub snapshot_id: Option<SnapshotId>,
}

impl VolumeRecord {
    /// Create the singleton record.
    pub fn new(volume_id: VolumeId, device: impl Into<String>) -> Self {
        Self {
            id: RECORD_ID.to_string(),
            volume_id: volume_id.to_string(),
            device: device.into(),
            snapshot_id: None,
        }
    }

    pub fn with_snapshot(mut self, snapshot_id: SnapshotId) -> Self {
        self.snapshot_id = Some(snapshot_id);
        self
    }

    /// Parse the recorded volume reference.
    pub fn parsed_volume_id(&self) -> Result<VolumeId, IdError> {
        VolumeId::parse(&self.volume_id)
    }

    /// Translate to the external item format. A missing snapshot id is left
    /// out rather than written as empty.
    pub fn to_item(&self) -> RecordItem {
        let mut item = RecordItem::new();
        item.set(ATTR_ID, self.id.clone());
        item.set(ATTR_VOLUME_ID, self.volume_id.clone());
        item.set(ATTR_DEVICE, self.device.clone());
        if let Some(snapshot_id) = &self.snapshot_id {
            item.set(ATTR_SNAPSHOT_ID, snapshot_id.to_string());
        }
        item
    }

    /// Translate from the external item format.
    pub fn from_item(item: &RecordItem) -> Result<Self, StoreError> {
        let id = required(item, ATTR_ID)?.to_string();
        let volume_id = required(item, ATTR_VOLUME_ID)?.to_string();
        let device = required(item, ATTR_DEVICE)?.to_string();
        let snapshot_id = item
            .get(ATTR_SNAPSHOT_ID)
            .filter(|s| !s.is_empty())
            .map(SnapshotId::parse)
            .transpose()
            .map_err(|e| StoreError::Malformed {
                attribute: ATTR_SNAPSHOT_ID,
                detail: e.to_string(),
            })?;

        Ok(Self {
            id,
            volume_id,
            device,
            snapshot_id,
        })
    }
}

fn required<'a>(item: &'a RecordItem, attribute: &'static str) -> Result<&'a str, StoreError> {
    item.get(attribute).ok_or(StoreError::Malformed {
        attribute,
        detail: "missing".to_string(),
    })
}

/// Adapter between the singleton [`VolumeRecord`] and a [`RecordTable`].
#[derive(Clone)]
pub struct VolumeRecordStore {
    table: Arc<dyn RecordTable>,
}

impl VolumeRecordStore {
    pub fn new(table: Arc<dyn RecordTable>) -> Self {
        Self { table }
    }

    /// Fetch the singleton record.
    pub async fn fetch(&self) -> Result<VolumeRecord, StoreError> {
        let item = self
            .table
            .get(RECORD_ID)
            .await?
            .ok_or_else(|| StoreError::RecordNotFound {
                id: RECORD_ID.to_string(),
            })?;
        let record = VolumeRecord::from_item(&item)?;
        debug!(volume_id = %record.volume_id, device = %record.device, "Volume record fetched");
        Ok(record)
    }

    /// Write the record and return the persisted value, which callers must
    /// treat as authoritative from here on.
    pub async fn upsert(&self, record: &VolumeRecord) -> Result<VolumeRecord, StoreError> {
        debug!(record = ?record, "Volume record to be updated");
        let stored = self.table.update(record.to_item()).await?;
        let persisted = VolumeRecord::from_item(&stored)?;
        info!(
            volume_id = %persisted.volume_id,
            snapshot_id = ?persisted.snapshot_id.as_ref().map(ToString::to_string),
            "Volume record updated"
        );
        Ok(persisted)
    }

    /// Create the record out-of-band (operator tooling). The id is forced to
    /// the singleton key.
    pub async fn seed(&self, record: &VolumeRecord) -> Result<VolumeRecord, StoreError> {
        let record = VolumeRecord {
            id: RECORD_ID.to_string(),
            ..record.clone()
        };
        self.upsert(&record).await
    }
}
