//! Scheduled snapshot workflow.
//!
//! Snapshots the master volume and points the record's `snapshotId` at the
//! result, so a later provisioning run can restore from it if the volume is
//! lost. Failures propagate to the caller; the record is only written once
//! the snapshot has completed.

use std::sync::Arc;

use tracing::info;

use crate::cloud::{Compute, Tag, WaitFor};
use crate::error::WorkflowError;
use crate::event::ScheduleTick;
use crate::records::{VolumeRecord, VolumeRecordStore};

pub struct Snapshotter {
    compute: Arc<dyn Compute>,
    records: VolumeRecordStore,
    snapshot_name: String,
}

impl Snapshotter {
    pub fn new(
        compute: Arc<dyn Compute>,
        records: VolumeRecordStore,
        snapshot_name: impl Into<String>,
    ) -> Self {
        Self {
            compute,
            records,
            snapshot_name: snapshot_name.into(),
        }
    }

    pub async fn run(&self, tick: &ScheduleTick) -> Result<String, WorkflowError> {
        info!(
            tick_id = ?tick.id,
            tick_time = ?tick.time,
            "Snapshot run started"
        );

        let record = self.records.fetch().await?;
        let volume_id = record
            .parsed_volume_id()
            .map_err(|e| WorkflowError::snapshot("resolving recorded volume", e))?;

        let tags = [
            Tag::new("Name", self.snapshot_name.clone()),
            Tag::new("CreatedBy", "voldr"),
            Tag::new("Trigger", "schedule"),
        ];
        let snapshot = self
            .compute
            .create_snapshot(&volume_id, &tags)
            .await
            .map_err(|e| WorkflowError::snapshot("creating snapshot", e))?;
        info!(
            snapshot_id = %snapshot.id,
            volume_id = %volume_id,
            "Snapshot requested"
        );

        self.compute
            .wait_until(&WaitFor::SnapshotCompleted(vec![snapshot.id.clone()]))
            .await
            .map_err(|e| WorkflowError::snapshot("waiting for snapshot completed", e))?;

        let updated = VolumeRecord {
            snapshot_id: Some(snapshot.id.clone()),
            ..record
        };
        self.records.upsert(&updated).await?;

        Ok(format!("Snapshot was created successfully: {}", snapshot.id))
    }
}
