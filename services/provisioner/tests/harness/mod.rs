//! Shared fixtures for workflow integration tests.
//!
//! Wires the workflows to a [`SimulatedCloud`], an in-memory record table that
//! remembers when each write happened relative to provider calls, and a
//! [`MemorySink`] for notifications.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use voldr_id::{InstanceId, SnapshotId, VolumeId};
use voldr_provisioner::cloud::{
    AttachmentState, CloudCall, Instance, InstanceState, Operation, OutputConfig,
    SimulatedCloud, Snapshot, SnapshotState, Volume, VolumeAttachment, VolumeState,
};
use voldr_provisioner::notify::{MemorySink, Notifier};
use voldr_provisioner::records::{
    MemoryTable, RecordItem, RecordTable, StoreError, VolumeRecord, VolumeRecordStore,
};
use voldr_provisioner::{Provisioner, ProvisionerSettings, Snapshotter};
use voldr_reconcile::WaitPolicy;

pub const ZONE_A: &str = "ap-southeast-2a";
pub const ZONE_B: &str = "ap-southeast-2b";
pub const TOPIC: &str = "master-volume-support";
pub const MOUNT_DOCUMENT: &str = "mount-master-volume";
pub const DEVICE: &str = "/dev/xvdf";
pub const OUTPUT_BUCKET: &str = "ops-command-output";
pub const OUTPUT_PREFIX: &str = "voldr/mount";

pub fn fast_policy() -> WaitPolicy {
    WaitPolicy::new(Duration::from_millis(100), Duration::from_millis(1))
}

pub fn instance_id() -> InstanceId {
    InstanceId::parse("i-06fc91a93c8d2534e").unwrap()
}

pub fn volume_id() -> VolumeId {
    VolumeId::parse("vol-049df61146c4d7901").unwrap()
}

pub fn stored_snapshot_id() -> SnapshotId {
    SnapshotId::parse("snap-066877671789bd71b").unwrap()
}

pub fn instance(zone: &str) -> Instance {
    Instance {
        id: instance_id(),
        availability_zone: zone.to_string(),
        state: InstanceState::Pending,
    }
}

/// The master volume in `zone`. An in-use volume is attached to a previous
/// instance.
pub fn volume(zone: &str, state: VolumeState) -> Volume {
    let attachments = match state {
        VolumeState::InUse => vec![VolumeAttachment {
            instance_id: InstanceId::parse("i-0aaaaaaaaaaaaaaaa").unwrap(),
            device: DEVICE.to_string(),
            state: AttachmentState::Attached,
        }],
        _ => vec![],
    };

    Volume {
        id: volume_id(),
        availability_zone: zone.to_string(),
        state,
        attachments,
        snapshot_id: None,
        size_gib: Some(100),
        volume_type: Some("gp3".to_string()),
    }
}

pub fn stored_snapshot() -> Snapshot {
    Snapshot {
        id: stored_snapshot_id(),
        volume_id: volume_id(),
        state: SnapshotState::Completed,
        tags: vec![],
    }
}

pub fn command_output() -> OutputConfig {
    OutputConfig {
        bucket: Some(OUTPUT_BUCKET.to_string()),
        key_prefix: Some(OUTPUT_PREFIX.to_string()),
    }
}

pub fn record() -> VolumeRecord {
    VolumeRecord::new(volume_id(), DEVICE).with_snapshot(stored_snapshot_id())
}

/// Record table that notes how many provider calls had been issued when
/// each write landed.
pub struct RecordingTable {
    inner: MemoryTable,
    cloud: Arc<SimulatedCloud>,
    writes: Mutex<Vec<(usize, RecordItem)>>,
}

impl RecordingTable {
    pub fn new(cloud: Arc<SimulatedCloud>, record: Option<&VolumeRecord>) -> Self {
        let inner = match record {
            Some(record) => MemoryTable::with_item(record.to_item()),
            None => MemoryTable::new(),
        };
        Self {
            inner,
            cloud,
            writes: Mutex::new(Vec::new()),
        }
    }

    /// `(calls issued before the write, written item)` pairs.
    pub async fn writes(&self) -> Vec<(usize, RecordItem)> {
        self.writes.lock().await.clone()
    }
}

#[async_trait]
impl RecordTable for RecordingTable {
    async fn get(&self, id: &str) -> Result<Option<RecordItem>, StoreError> {
        self.inner.get(id).await
    }

    async fn update(&self, item: RecordItem) -> Result<RecordItem, StoreError> {
        let issued = self.cloud.calls().await.len();
        self.writes.lock().await.push((issued, item.clone()));
        self.inner.update(item).await
    }
}

pub struct Fixture {
    pub cloud: Arc<SimulatedCloud>,
    pub table: Arc<RecordingTable>,
    pub records: VolumeRecordStore,
    pub sink: Arc<MemorySink>,
    pub provisioner: Provisioner,
    pub snapshotter: Snapshotter,
}

impl Fixture {
    pub fn new(cloud: SimulatedCloud, record: Option<VolumeRecord>) -> Self {
        Self::with_sink(cloud, record, MemorySink::new())
    }

    pub fn with_sink(
        cloud: SimulatedCloud,
        record: Option<VolumeRecord>,
        sink: MemorySink,
    ) -> Self {
        let cloud = Arc::new(cloud);
        let table = Arc::new(RecordingTable::new(cloud.clone(), record.as_ref()));
        let records = VolumeRecordStore::new(table.clone());
        let sink = Arc::new(sink);

        let provisioner = Provisioner::new(
            cloud.clone(),
            cloud.clone(),
            records.clone(),
            Notifier::new(sink.clone(), TOPIC),
            ProvisionerSettings {
                mount_document: MOUNT_DOCUMENT.to_string(),
                snapshot_name: "master-volume".to_string(),
                volume_type: Some("gp3".to_string()),
                command_output: command_output(),
            },
        );
        let snapshotter = Snapshotter::new(cloud.clone(), records.clone(), "master-volume");

        Self {
            cloud,
            table,
            records,
            sink,
            provisioner,
            snapshotter,
        }
    }

    /// Position of the first call of `operation` in the call log.
    pub async fn position(&self, operation: Operation) -> Option<usize> {
        self.calls()
            .await
            .iter()
            .position(|call| call.operation() == operation)
    }

    pub async fn calls(&self) -> Vec<CloudCall> {
        self.cloud.calls().await
    }

    pub async fn stored_record(&self) -> VolumeRecord {
        self.records.fetch().await.unwrap()
    }
}
