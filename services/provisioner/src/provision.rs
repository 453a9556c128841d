//! Provisioning workflow.
//!
//! Reconciles a freshly launched instance against the master volume:
//!
//! ```text
//! START -> INSTANCE_LOOKED_UP -> RECORD_LOOKED_UP -> VOLUME_LOOKED_UP
//!       -> SAME_AZ | CROSS_AZ_REPLICATE -> ATTACHED -> MOUNTED -> DONE
//! ```
//!
//! Any step may end the run in `FAILED`. A failed run publishes one diagnostic
//! notification and returns the error; nothing is rolled back. An attached but
//! unmounted volume stays attached for an operator to inspect.
//!
//! Replication is not deduplicated: a replay after a failure past snapshot
//! creation creates another snapshot and volume.

use std::fmt;
use std::sync::Arc;

use tracing::{error, info, warn};
use voldr_id::{InstanceId, SnapshotId, VolumeId};
use voldr_reconcile::{plan_placement, LiveVolume, Placement, ReplicationSource};

use crate::cloud::{
    Compute, CreateVolumeRequest, Instance, OutputConfig, RemoteCommand, Tag, Volume, WaitFor,
};
use crate::error::WorkflowError;
use crate::event::LaunchEvent;
use crate::notify::{FailureReport, Notifier};
use crate::records::{VolumeRecord, VolumeRecordStore};

/// States of one provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Start,
    InstanceLookedUp,
    RecordLookedUp,
    VolumeLookedUp,
    SameAz,
    CrossAzReplicate,
    Attached,
    Mounted,
    Done,
    Failed,
}

impl ProvisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::InstanceLookedUp => "instance_looked_up",
            Self::RecordLookedUp => "record_looked_up",
            Self::VolumeLookedUp => "volume_looked_up",
            Self::SameAz => "same_az",
            Self::CrossAzReplicate => "cross_az_replicate",
            Self::Attached => "attached",
            Self::Mounted => "mounted",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient state of one run. Discarded when the run completes.
#[derive(Debug, Clone)]
pub struct ProvisioningContext {
    pub instance_id: InstanceId,
    pub state: ProvisionState,

    /// State reached before the run failed.
    pub failed_after: Option<ProvisionState>,

    pub record: Option<VolumeRecord>,
    pub instance: Option<Instance>,

    /// The volume that is (or will be) attached.
    pub volume: Option<Volume>,
}

impl ProvisioningContext {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            state: ProvisionState::Start,
            failed_after: None,
            record: None,
            instance: None,
            volume: None,
        }
    }

    fn enter(&mut self, state: ProvisionState) {
        info!(
            instance_id = %self.instance_id,
            from = %self.state,
            to = %state,
            "Provisioning state transition"
        );
        self.state = state;
    }

    fn fail(&mut self) {
        self.failed_after = Some(self.state);
        self.state = ProvisionState::Failed;
    }

    /// Best-known volume: the resolved volume, else the recorded one.
    pub fn best_known_volume(&self) -> Option<&str> {
        self.volume
            .as_ref()
            .map(|v| v.id.as_str())
            .or_else(|| self.record.as_ref().map(|r| r.volume_id.as_str()))
    }

    fn failure_report(&self, err: &WorkflowError) -> FailureReport {
        FailureReport {
            instance_id: self.instance_id.clone(),
            volume_id: self.best_known_volume().map(str::to_string),
            last_state: self.failed_after.unwrap_or(self.state).as_str(),
            reason_code: err.reason_code(),
            error: err.to_string(),
        }
    }
}

/// Settings for the provisioning workflow.
#[derive(Debug, Clone)]
pub struct ProvisionerSettings {
    /// Command document that mounts the attached device.
    pub mount_document: String,

    /// `Name` tag put on replication snapshots.
    pub snapshot_name: String,

    /// Volume type for replicas; the provider default when unset.
    pub volume_type: Option<String>,

    /// Where mount command output goes.
    pub command_output: OutputConfig,
}

/// Provisioning workflow with its collaborators.
pub struct Provisioner {
    compute: Arc<dyn Compute>,
    commands: Arc<dyn RemoteCommand>,
    records: VolumeRecordStore,
    notifier: Notifier,
    settings: ProvisionerSettings,
}

impl Provisioner {
    pub fn new(
        compute: Arc<dyn Compute>,
        commands: Arc<dyn RemoteCommand>,
        records: VolumeRecordStore,
        notifier: Notifier,
        settings: ProvisionerSettings,
    ) -> Self {
        Self {
            compute,
            commands,
            records,
            notifier,
            settings,
        }
    }

    /// Run the workflow for one launch event.
    ///
    /// Returns the success message, or the error after a failure notification
    /// has been published.
    pub async fn run(&self, event: &LaunchEvent) -> Result<String, WorkflowError> {
        info!(
            instance_id = %event.instance_id,
            lifecycle_transition = ?event.lifecycle_transition,
            auto_scaling_group = ?event.auto_scaling_group,
            "Provisioning run started"
        );

        let mut ctx = ProvisioningContext::new(event.instance_id.clone());
        match self.converge(&mut ctx).await {
            Ok(message) => {
                ctx.enter(ProvisionState::Done);
                info!(instance_id = %ctx.instance_id, "{}", message);
                Ok(message)
            }
            Err(err) => {
                ctx.fail();
                error!(
                    instance_id = %ctx.instance_id,
                    volume_id = ?ctx.best_known_volume(),
                    failed_after = ?ctx.failed_after.map(|s| s.as_str()),
                    reason = err.reason_code(),
                    error = %err,
                    "Provisioning run failed"
                );
                self.notifier.notify_failure(&ctx.failure_report(&err)).await;
                Err(err)
            }
        }
    }

    async fn converge(&self, ctx: &mut ProvisioningContext) -> Result<String, WorkflowError> {
        let instance = self.resolve_instance(ctx).await?;
        let record = self.resolve_record(ctx).await?;
        let live = self.resolve_volume(ctx, &record).await;

        let placement = plan_placement(
            &instance.availability_zone,
            live.as_ref().map(|v| LiveVolume {
                id: &v.id,
                availability_zone: &v.availability_zone,
            }),
            record.snapshot_id.as_ref(),
        )
        .map_err(|e| WorkflowError::replication("resolving replication source", e))?;

        let (record, volume) = match (placement, live) {
            (Placement::Colocated, Some(volume)) => {
                ctx.enter(ProvisionState::SameAz);
                (record, volume)
            }
            (Placement::Replicate(source), _) => {
                ctx.enter(ProvisionState::CrossAzReplicate);
                self.replicate(ctx, record, source, &instance).await?
            }
            (Placement::Colocated, None) => {
                return Err(WorkflowError::replication(
                    "resolving replication source",
                    "colocated placement without a live volume",
                ))
            }
        };

        self.attach(ctx, &instance, &record, &volume).await?;
        ctx.enter(ProvisionState::Attached);

        self.mount(&instance).await?;
        ctx.enter(ProvisionState::Mounted);

        Ok(format!(
            "volume {} attached at {} and mounted; instance {} provisioned",
            volume.id, record.device, instance.id
        ))
    }

    async fn resolve_instance(
        &self,
        ctx: &mut ProvisioningContext,
    ) -> Result<Instance, WorkflowError> {
        let instance = self
            .compute
            .describe_instance(&ctx.instance_id)
            .await
            .map_err(|e| WorkflowError::Lookup {
                resource: "instance",
                id: ctx.instance_id.to_string(),
                detail: e.to_string(),
            })?;

        info!(
            instance_id = %instance.id,
            availability_zone = %instance.availability_zone,
            state = ?instance.state,
            "Instance resolved"
        );
        ctx.instance = Some(instance.clone());
        ctx.enter(ProvisionState::InstanceLookedUp);
        Ok(instance)
    }

    async fn resolve_record(
        &self,
        ctx: &mut ProvisioningContext,
    ) -> Result<VolumeRecord, WorkflowError> {
        let record = self.records.fetch().await?;
        ctx.record = Some(record.clone());
        ctx.enter(ProvisionState::RecordLookedUp);
        Ok(record)
    }

    /// Resolve the recorded volume. A failed lookup, including a recorded id
    /// that does not parse, is not fatal: it sends the run down the
    /// restore-from-snapshot path.
    async fn resolve_volume(
        &self,
        ctx: &mut ProvisioningContext,
        record: &VolumeRecord,
    ) -> Option<Volume> {
        let lookup = match record.parsed_volume_id() {
            Ok(volume_id) => self.compute.describe_volume(&volume_id).await.map_err(|e| {
                if e.is_not_found() {
                    format!("volume no longer exists: {}", e)
                } else {
                    e.to_string()
                }
            }),
            Err(e) => Err(format!("recorded volume id is malformed: {}", e)),
        };

        let live = match lookup {
            Ok(volume) => {
                info!(
                    volume_id = %volume.id,
                    availability_zone = %volume.availability_zone,
                    state = %volume.state,
                    "Master volume resolved"
                );
                ctx.volume = Some(volume.clone());
                Some(volume)
            }
            Err(e) => {
                warn!(
                    volume_id = %record.volume_id,
                    snapshot_id = ?record.snapshot_id.as_ref().map(ToString::to_string),
                    error = %e,
                    "Master volume lookup failed, restoring from the recorded snapshot"
                );
                None
            }
        };
        ctx.enter(ProvisionState::VolumeLookedUp);
        live
    }

    /// Build a replica in the instance's zone and make it the master volume.
    async fn replicate(
        &self,
        ctx: &mut ProvisioningContext,
        record: VolumeRecord,
        source: ReplicationSource,
        instance: &Instance,
    ) -> Result<(VolumeRecord, Volume), WorkflowError> {
        let (snapshot_id, fresh_snapshot) = match source {
            ReplicationSource::LiveVolume(volume_id) => {
                (self.snapshot_live_volume(&volume_id, instance).await?, true)
            }
            ReplicationSource::StoredSnapshot(snapshot_id) => {
                info!(
                    snapshot_id = %snapshot_id,
                    "Creating replica from the recorded snapshot"
                );
                (snapshot_id, false)
            }
        };

        let request = CreateVolumeRequest {
            availability_zone: instance.availability_zone.clone(),
            snapshot_id: snapshot_id.clone(),
            size_gib: None,
            volume_type: self.settings.volume_type.clone(),
        };
        let created = self
            .compute
            .create_volume(&request)
            .await
            .map_err(|e| WorkflowError::replication("creating volume", e))?;
        info!(
            volume_id = %created.id,
            snapshot_id = %snapshot_id,
            availability_zone = %created.availability_zone,
            "Replica volume requested"
        );

        self.compute
            .wait_until(&WaitFor::VolumeAvailable(vec![created.id.clone()]))
            .await
            .map_err(|e| WorkflowError::replication("waiting for volume available", e))?;

        let mut updated = VolumeRecord {
            volume_id: created.id.to_string(),
            ..record
        };
        if fresh_snapshot {
            updated.snapshot_id = Some(snapshot_id);
        }
        let persisted = self.records.upsert(&updated).await?;

        ctx.record = Some(persisted.clone());
        ctx.volume = Some(created.clone());
        Ok((persisted, created))
    }

    async fn snapshot_live_volume(
        &self,
        volume_id: &VolumeId,
        instance: &Instance,
    ) -> Result<SnapshotId, WorkflowError> {
        let tags = [
            Tag::new("Name", self.settings.snapshot_name.clone()),
            Tag::new("CreatedBy", "voldr"),
            Tag::new("SourceInstance", instance.id.to_string()),
        ];
        let snapshot = self
            .compute
            .create_snapshot(volume_id, &tags)
            .await
            .map_err(|e| WorkflowError::replication("creating snapshot", e))?;
        info!(
            snapshot_id = %snapshot.id,
            volume_id = %volume_id,
            "Replication snapshot requested"
        );

        self.compute
            .wait_until(&WaitFor::SnapshotCompleted(vec![snapshot.id.clone()]))
            .await
            .map_err(|e| WorkflowError::replication("waiting for snapshot completed", e))?;

        Ok(snapshot.id)
    }

    async fn attach(
        &self,
        ctx: &ProvisioningContext,
        instance: &Instance,
        record: &VolumeRecord,
        volume: &Volume,
    ) -> Result<(), WorkflowError> {
        let attachment_error = |detail: String| WorkflowError::Attachment {
            volume_id: volume.id.to_string(),
            instance_id: instance.id.to_string(),
            detail,
        };

        if volume.availability_zone != instance.availability_zone {
            return Err(attachment_error(format!(
                "volume is in {}, instance is in {}",
                volume.availability_zone, instance.availability_zone
            )));
        }

        self.compute
            .wait_until(&WaitFor::InstanceRunning(vec![instance.id.clone()]))
            .await
            .map_err(|e| attachment_error(format!("waiting for instance running: {}", e)))?;

        self.compute
            .attach_volume(&record.device, &instance.id, &volume.id)
            .await
            .map_err(|e| attachment_error(e.to_string()))?;
        info!(
            instance_id = %ctx.instance_id,
            volume_id = %volume.id,
            device = %record.device,
            "Volume attach requested"
        );

        self.compute
            .wait_until(&WaitFor::VolumeInUse(vec![volume.id.clone()]))
            .await
            .map_err(|e| attachment_error(format!("waiting for volume in-use: {}", e)))?;

        Ok(())
    }

    async fn mount(&self, instance: &Instance) -> Result<(), WorkflowError> {
        let command_id = self
            .commands
            .send_command(
                &self.settings.mount_document,
                std::slice::from_ref(&instance.id),
                &self.settings.command_output,
            )
            .await
            .map_err(|e| WorkflowError::Mount {
                document: self.settings.mount_document.clone(),
                detail: e.to_string(),
            })?;

        info!(
            instance_id = %instance.id,
            command_id = %command_id,
            document = %self.settings.mount_document,
            "Mount command dispatched"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ProvisioningContext {
        ProvisioningContext::new(InstanceId::parse("i-06fc91a93c8d2534e").unwrap())
    }

    #[test]
    fn test_best_known_volume_prefers_resolved_volume() {
        let mut ctx = context();
        assert!(ctx.best_known_volume().is_none());

        ctx.record = Some(VolumeRecord::new(
            VolumeId::parse("vol-049df61146c4d7901").unwrap(),
            "/dev/xvdf",
        ));
        assert_eq!(ctx.best_known_volume(), Some("vol-049df61146c4d7901"));

        ctx.volume = Some(Volume {
            id: VolumeId::parse("vol-0bbbbbbbbbbbbbbbb").unwrap(),
            availability_zone: "ap-southeast-2b".to_string(),
            state: crate::cloud::VolumeState::Creating,
            attachments: vec![],
            snapshot_id: None,
            size_gib: None,
            volume_type: None,
        });
        assert_eq!(ctx.best_known_volume(), Some("vol-0bbbbbbbbbbbbbbbb"));
    }

    #[test]
    fn test_failure_report_records_last_state() {
        let mut ctx = context();
        ctx.enter(ProvisionState::InstanceLookedUp);
        ctx.fail();

        let err = WorkflowError::RecordNotFound("0".to_string());
        let report = ctx.failure_report(&err);
        assert_eq!(ctx.state, ProvisionState::Failed);
        assert_eq!(report.last_state, "instance_looked_up");
        assert_eq!(report.reason_code, "record_not_found");
        assert!(report.volume_id.is_none());
    }
}
