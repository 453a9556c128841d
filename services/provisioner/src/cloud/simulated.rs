//! In-process provider simulation.
//!
//! Resources move through their provider states the way the real provider
//! moves them, one step per waiter poll:
//! - instances: `pending` -> `running`
//! - snapshots: `pending` -> `completed`
//! - volumes: `creating` -> `available` -> (attach) -> `in-use`
//!
//! Every call is appended to a call log, and any operation can be made to
//! fail with an injected [`Fault`].

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use voldr_id::{CommandId, InstanceId, SnapshotId, VolumeId};
use voldr_reconcile::{poll_until, PollError, WaitPolicy};

use super::{
    AttachmentState, CloudError, Compute, CreateVolumeRequest, Instance, InstanceState,
    OutputConfig, RemoteCommand, Snapshot, SnapshotState, Tag, Volume, VolumeAttachment,
    VolumeState, WaitCondition, WaitFor,
};

/// Provider operations that can be faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DescribeInstance,
    DescribeVolume,
    CreateSnapshot,
    CreateVolume,
    AttachVolume,
    Wait(WaitCondition),
    SendCommand,
}

/// Injected failure for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The provider rejects the request.
    Reject(String),

    /// The provider cannot be reached.
    Unavailable(String),

    /// A waiter never observes its condition (only meaningful for waits).
    Stall,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    DescribeInstance(InstanceId),
    DescribeVolume(VolumeId),
    CreateSnapshot {
        volume_id: VolumeId,
        tags: Vec<Tag>,
    },
    CreateVolume(CreateVolumeRequest),
    AttachVolume {
        device: String,
        instance_id: InstanceId,
        volume_id: VolumeId,
    },
    WaitUntil {
        condition: WaitCondition,
        ids: Vec<String>,
    },
    SendCommand {
        document: String,
        instance_ids: Vec<InstanceId>,
        output: OutputConfig,
    },
}

impl CloudCall {
    pub fn operation(&self) -> Operation {
        match self {
            CloudCall::DescribeInstance(_) => Operation::DescribeInstance,
            CloudCall::DescribeVolume(_) => Operation::DescribeVolume,
            CloudCall::CreateSnapshot { .. } => Operation::CreateSnapshot,
            CloudCall::CreateVolume(_) => Operation::CreateVolume,
            CloudCall::AttachVolume { .. } => Operation::AttachVolume,
            CloudCall::WaitUntil { condition, .. } => Operation::Wait(*condition),
            CloudCall::SendCommand { .. } => Operation::SendCommand,
        }
    }
}

/// A dispatched remote command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInvocation {
    pub id: CommandId,
    pub document: String,
    pub instance_ids: Vec<InstanceId>,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Everything the simulated provider knows, keyed by canonical id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudState {
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Volume>,
    #[serde(default)]
    pub snapshots: BTreeMap<String, Snapshot>,
    #[serde(default)]
    pub commands: Vec<CommandInvocation>,
}

/// In-process provider implementing [`Compute`] and [`RemoteCommand`].
pub struct SimulatedCloud {
    state: Mutex<CloudState>,
    faults: Mutex<HashMap<Operation, Fault>>,
    calls: Mutex<Vec<CloudCall>>,
    policy: WaitPolicy,
}

impl SimulatedCloud {
    /// Create an empty provider.
    pub fn new(policy: WaitPolicy) -> Self {
        Self::from_state(CloudState::default(), policy)
    }

    /// Create a provider from existing state.
    pub fn from_state(state: CloudState, policy: WaitPolicy) -> Self {
        Self {
            state: Mutex::new(state),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            policy,
        }
    }

    /// Load provider state from a JSON fixture. A missing file is an empty cloud.
    pub async fn load(path: &Path, policy: WaitPolicy) -> Result<Self> {
        let state = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("invalid cloud state in {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CloudState::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        Ok(Self::from_state(state, policy))
    }

    /// Write provider state back to a JSON fixture.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let state = self.state.lock().await.clone();
        let json = serde_json::to_vec_pretty(&state)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(path = %path.display(), "Cloud state saved");
        Ok(())
    }

    /// Add an instance.
    pub fn with_instance(mut self, instance: Instance) -> Self {
        self.state
            .get_mut()
            .instances
            .insert(instance.id.to_string(), instance);
        self
    }

    /// Add a volume.
    pub fn with_volume(mut self, volume: Volume) -> Self {
        self.state
            .get_mut()
            .volumes
            .insert(volume.id.to_string(), volume);
        self
    }

    /// Add a snapshot.
    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.state
            .get_mut()
            .snapshots
            .insert(snapshot.id.to_string(), snapshot);
        self
    }

    /// Make every subsequent call of `operation` fail.
    pub async fn inject(&self, operation: Operation, fault: Fault) {
        self.faults.lock().await.insert(operation, fault);
    }

    /// Remove all injected faults.
    pub async fn clear_faults(&self) {
        self.faults.lock().await.clear();
    }

    /// Calls issued so far, in order.
    pub async fn calls(&self) -> Vec<CloudCall> {
        self.calls.lock().await.clone()
    }

    /// Number of calls issued for one operation.
    pub async fn call_count(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.operation() == operation)
            .count()
    }

    /// Copy of the current provider state.
    pub async fn state(&self) -> CloudState {
        self.state.lock().await.clone()
    }

    async fn record(&self, call: CloudCall) -> Result<(), CloudError> {
        let operation = call.operation();
        self.calls.lock().await.push(call);

        match self.faults.lock().await.get(&operation) {
            Some(Fault::Reject(message)) => Err(CloudError::rejected(
                format!("{:?}", operation),
                message.clone(),
            )),
            Some(Fault::Unavailable(message)) => Err(CloudError::Unavailable(message.clone())),
            Some(Fault::Stall) | None => Ok(()),
        }
    }

    async fn is_stalled(&self, condition: WaitCondition) -> bool {
        matches!(
            self.faults.lock().await.get(&Operation::Wait(condition)),
            Some(Fault::Stall)
        )
    }

    /// One waiter poll: report whether every target holds, and move the ones
    /// that do not one step forward.
    async fn probe(&self, target: &WaitFor, stalled: bool) -> Result<bool, CloudError> {
        if stalled {
            return Ok(false);
        }

        let mut state = self.state.lock().await;
        let mut satisfied = true;

        match target {
            WaitFor::InstanceRunning(ids) => {
                for id in ids {
                    let instance = state
                        .instances
                        .get_mut(id.as_str())
                        .ok_or_else(|| not_found("instance", id))?;
                    match instance.state {
                        InstanceState::Running => {}
                        InstanceState::Pending => {
                            instance.state = InstanceState::Running;
                            satisfied = false;
                        }
                        other => {
                            return Err(CloudError::rejected(
                                "wait instance-running",
                                format!("instance {} entered failure state {:?}", id, other),
                            ))
                        }
                    }
                }
            }
            WaitFor::SnapshotCompleted(ids) => {
                for id in ids {
                    let snapshot = state
                        .snapshots
                        .get_mut(id.as_str())
                        .ok_or_else(|| not_found("snapshot", id))?;
                    match snapshot.state {
                        SnapshotState::Completed => {}
                        SnapshotState::Pending => {
                            snapshot.state = SnapshotState::Completed;
                            satisfied = false;
                        }
                        SnapshotState::Error => {
                            return Err(CloudError::rejected(
                                "wait snapshot-completed",
                                format!("snapshot {} failed", id),
                            ))
                        }
                    }
                }
            }
            WaitFor::VolumeAvailable(ids) => {
                for id in ids {
                    let volume = live_volume_mut(&mut state, id)?;
                    match volume.state {
                        VolumeState::Available => {}
                        VolumeState::Creating => {
                            volume.state = VolumeState::Available;
                            satisfied = false;
                        }
                        VolumeState::InUse => satisfied = false,
                        other => {
                            return Err(CloudError::rejected(
                                "wait volume-available",
                                format!("volume {} is {}", id, other),
                            ))
                        }
                    }
                }
            }
            WaitFor::VolumeInUse(ids) => {
                for id in ids {
                    let volume = live_volume_mut(&mut state, id)?;
                    let attaching = volume
                        .attachments
                        .iter_mut()
                        .find(|a| a.state == AttachmentState::Attaching);
                    match (volume.state, attaching) {
                        (VolumeState::InUse, None) => {}
                        (_, Some(attachment)) => {
                            attachment.state = AttachmentState::Attached;
                            volume.state = VolumeState::InUse;
                            satisfied = false;
                        }
                        (VolumeState::Creating, None) => {
                            volume.state = VolumeState::Available;
                            satisfied = false;
                        }
                        (VolumeState::Available, None) => satisfied = false,
                        (other, None) => {
                            return Err(CloudError::rejected(
                                "wait volume-in-use",
                                format!("volume {} is {}", id, other),
                            ))
                        }
                    }
                }
            }
        }

        Ok(satisfied)
    }
}

fn not_found(kind: &'static str, id: &impl ToString) -> CloudError {
    CloudError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn live_volume_mut<'a>(
    state: &'a mut CloudState,
    id: &VolumeId,
) -> Result<&'a mut Volume, CloudError> {
    state
        .volumes
        .get_mut(id.as_str())
        .filter(|v| v.state != VolumeState::Deleted)
        .ok_or_else(|| not_found("volume", id))
}

#[async_trait]
impl Compute for SimulatedCloud {
    async fn describe_instance(&self, id: &InstanceId) -> Result<Instance, CloudError> {
        self.record(CloudCall::DescribeInstance(id.clone())).await?;
        let state = self.state.lock().await;
        state
            .instances
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| not_found("instance", id))
    }

    async fn describe_volume(&self, id: &VolumeId) -> Result<Volume, CloudError> {
        self.record(CloudCall::DescribeVolume(id.clone())).await?;
        let mut state = self.state.lock().await;
        live_volume_mut(&mut state, id).map(|v| v.clone())
    }

    async fn create_snapshot(
        &self,
        volume_id: &VolumeId,
        tags: &[Tag],
    ) -> Result<Snapshot, CloudError> {
        self.record(CloudCall::CreateSnapshot {
            volume_id: volume_id.clone(),
            tags: tags.to_vec(),
        })
        .await?;

        let mut state = self.state.lock().await;
        live_volume_mut(&mut state, volume_id)?;

        let snapshot = Snapshot {
            id: SnapshotId::generate(),
            volume_id: volume_id.clone(),
            state: SnapshotState::Pending,
            tags: tags.to_vec(),
        };
        state
            .snapshots
            .insert(snapshot.id.to_string(), snapshot.clone());

        info!(
            snapshot_id = %snapshot.id,
            volume_id = %volume_id,
            "[SIM] Snapshot started"
        );
        Ok(snapshot)
    }

    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume, CloudError> {
        self.record(CloudCall::CreateVolume(request.clone())).await?;

        let mut state = self.state.lock().await;
        let snapshot = state
            .snapshots
            .get(request.snapshot_id.as_str())
            .ok_or_else(|| not_found("snapshot", &request.snapshot_id))?;
        if snapshot.state != SnapshotState::Completed {
            return Err(CloudError::rejected(
                "CreateVolume",
                format!("snapshot {} is not completed", snapshot.id),
            ));
        }

        let inherited_size = state
            .volumes
            .get(snapshot.volume_id.as_str())
            .and_then(|v| v.size_gib);

        let volume = Volume {
            id: VolumeId::generate(),
            availability_zone: request.availability_zone.clone(),
            state: VolumeState::Creating,
            attachments: Vec::new(),
            snapshot_id: Some(request.snapshot_id.clone()),
            size_gib: request.size_gib.or(inherited_size),
            volume_type: request.volume_type.clone(),
        };
        state.volumes.insert(volume.id.to_string(), volume.clone());

        info!(
            volume_id = %volume.id,
            snapshot_id = %request.snapshot_id,
            availability_zone = %request.availability_zone,
            "[SIM] Volume creating"
        );
        Ok(volume)
    }

    async fn attach_volume(
        &self,
        device: &str,
        instance_id: &InstanceId,
        volume_id: &VolumeId,
    ) -> Result<(), CloudError> {
        self.record(CloudCall::AttachVolume {
            device: device.to_string(),
            instance_id: instance_id.clone(),
            volume_id: volume_id.clone(),
        })
        .await?;

        let mut state = self.state.lock().await;
        let instance = state
            .instances
            .get(instance_id.as_str())
            .cloned()
            .ok_or_else(|| not_found("instance", instance_id))?;
        let volume = live_volume_mut(&mut state, volume_id)?;

        if volume.availability_zone != instance.availability_zone {
            return Err(CloudError::rejected(
                "AttachVolume",
                format!(
                    "volume {} is in {}, instance {} is in {}",
                    volume_id, volume.availability_zone, instance_id, instance.availability_zone
                ),
            ));
        }
        if volume.state != VolumeState::Available {
            return Err(CloudError::rejected(
                "AttachVolume",
                format!("volume {} is {}", volume_id, volume.state),
            ));
        }
        if !matches!(
            instance.state,
            InstanceState::Running | InstanceState::Stopped
        ) {
            return Err(CloudError::rejected(
                "AttachVolume",
                format!("instance {} is not in a valid state", instance_id),
            ));
        }

        volume.attachments.push(VolumeAttachment {
            instance_id: instance_id.clone(),
            device: device.to_string(),
            state: AttachmentState::Attaching,
        });

        info!(
            volume_id = %volume_id,
            instance_id = %instance_id,
            device = %device,
            "[SIM] Volume attaching"
        );
        Ok(())
    }

    async fn wait_until(&self, target: &WaitFor) -> Result<(), CloudError> {
        let condition = target.condition();
        self.record(CloudCall::WaitUntil {
            condition,
            ids: target.ids(),
        })
        .await?;

        let stalled = self.is_stalled(condition).await;
        let resource = format!("{} {}", condition, target.ids().join(","));

        poll_until(&self.policy, &resource, || self.probe(target, stalled))
            .await
            .map(|attempts| {
                debug!(condition = %condition, attempts, "[SIM] Wait satisfied");
            })
            .map_err(|e| match e {
                PollError::Timeout { elapsed, .. } => {
                    CloudError::WaitTimeout { condition, elapsed }
                }
                PollError::Probe(e) => e,
            })
    }
}

#[async_trait]
impl RemoteCommand for SimulatedCloud {
    async fn send_command(
        &self,
        document: &str,
        instance_ids: &[InstanceId],
        output: &OutputConfig,
    ) -> Result<CommandId, CloudError> {
        self.record(CloudCall::SendCommand {
            document: document.to_string(),
            instance_ids: instance_ids.to_vec(),
            output: output.clone(),
        })
        .await?;

        let mut state = self.state.lock().await;
        if let Some(missing) = instance_ids
            .iter()
            .find(|id| !state.instances.contains_key(id.as_str()))
        {
            return Err(CloudError::rejected(
                "SendCommand",
                format!("instance {} is not registered for remote commands", missing),
            ));
        }

        let invocation = CommandInvocation {
            id: CommandId::generate(),
            document: document.to_string(),
            instance_ids: instance_ids.to_vec(),
            output: output.clone(),
        };
        let id = invocation.id.clone();
        state.commands.push(invocation);

        info!(command_id = %id, document = %document, "[SIM] Command dispatched");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn policy() -> WaitPolicy {
        WaitPolicy::new(Duration::from_millis(30), Duration::from_millis(1))
    }

    fn instance_id() -> InstanceId {
        InstanceId::parse("i-06fc91a93c8d2534e").unwrap()
    }

    fn volume_id() -> VolumeId {
        VolumeId::parse("vol-049df61146c4d7901").unwrap()
    }

    fn cloud() -> SimulatedCloud {
        SimulatedCloud::new(policy())
            .with_instance(Instance {
                id: instance_id(),
                availability_zone: "ap-southeast-2a".to_string(),
                state: InstanceState::Pending,
            })
            .with_volume(Volume {
                id: volume_id(),
                availability_zone: "ap-southeast-2a".to_string(),
                state: VolumeState::Available,
                attachments: vec![],
                snapshot_id: None,
                size_gib: Some(100),
                volume_type: Some("gp3".to_string()),
            })
    }

    #[tokio::test]
    async fn test_snapshot_then_volume_lifecycle() {
        let cloud = cloud();

        let snapshot = cloud.create_snapshot(&volume_id(), &[]).await.unwrap();
        assert_eq!(snapshot.state, SnapshotState::Pending);

        let request = CreateVolumeRequest {
            availability_zone: "ap-southeast-2b".to_string(),
            snapshot_id: snapshot.id.clone(),
            size_gib: None,
            volume_type: None,
        };
        // Creating from a pending snapshot is refused.
        assert!(cloud.create_volume(&request).await.is_err());

        cloud
            .wait_until(&WaitFor::SnapshotCompleted(vec![snapshot.id.clone()]))
            .await
            .unwrap();

        let volume = cloud.create_volume(&request).await.unwrap();
        assert_eq!(volume.state, VolumeState::Creating);
        assert_eq!(volume.size_gib, Some(100));

        cloud
            .wait_until(&WaitFor::VolumeAvailable(vec![volume.id.clone()]))
            .await
            .unwrap();
        let described = cloud.describe_volume(&volume.id).await.unwrap();
        assert_eq!(described.state, VolumeState::Available);
        assert_eq!(described.availability_zone, "ap-southeast-2b");
    }

    #[tokio::test]
    async fn test_attach_requires_same_zone() {
        let cloud = cloud().with_instance(Instance {
            id: InstanceId::parse("i-0aaaaaaaaaaaaaaaa").unwrap(),
            availability_zone: "ap-southeast-2c".to_string(),
            state: InstanceState::Running,
        });

        let err = cloud
            .attach_volume(
                "/dev/xvdf",
                &InstanceId::parse("i-0aaaaaaaaaaaaaaaa").unwrap(),
                &volume_id(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_attach_and_wait_in_use() {
        let cloud = cloud();

        cloud
            .wait_until(&WaitFor::InstanceRunning(vec![instance_id()]))
            .await
            .unwrap();
        cloud
            .attach_volume("/dev/xvdf", &instance_id(), &volume_id())
            .await
            .unwrap();
        cloud
            .wait_until(&WaitFor::VolumeInUse(vec![volume_id()]))
            .await
            .unwrap();

        let volume = cloud.describe_volume(&volume_id()).await.unwrap();
        assert_eq!(volume.state, VolumeState::InUse);
        assert_eq!(volume.attachments[0].state, AttachmentState::Attached);
        assert_eq!(volume.attachments[0].device, "/dev/xvdf");
    }

    #[tokio::test]
    async fn test_stalled_wait_times_out() {
        let cloud = cloud();
        cloud
            .inject(Operation::Wait(WaitCondition::InstanceRunning), Fault::Stall)
            .await;

        let err = cloud
            .wait_until(&WaitFor::InstanceRunning(vec![instance_id()]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CloudError::WaitTimeout {
                condition: WaitCondition::InstanceRunning,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_injected_fault_is_recorded() {
        let cloud = cloud();
        cloud
            .inject(Operation::DescribeVolume, Fault::Reject("boom".to_string()))
            .await;

        let err = cloud.describe_volume(&volume_id()).await.unwrap_err();
        assert!(!err.is_not_found());
        assert_eq!(cloud.call_count(Operation::DescribeVolume).await, 1);

        cloud.clear_faults().await;
        assert!(cloud.describe_volume(&volume_id()).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_volume_is_not_found() {
        let cloud = cloud();

        let err = cloud
            .describe_volume(&VolumeId::parse("vol-0bbbbbbbbbbbbbbbb").unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_state_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloud.json");

        let cloud = cloud();
        cloud.create_snapshot(&volume_id(), &[]).await.unwrap();
        cloud.save(&path).await.unwrap();

        let restored = SimulatedCloud::load(&path, policy()).await.unwrap();
        assert_eq!(restored.state().await, cloud.state().await);
    }

    #[tokio::test]
    async fn test_missing_fixture_is_empty_cloud() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = SimulatedCloud::load(&dir.path().join("absent.json"), policy())
            .await
            .unwrap();
        assert_eq!(cloud.state().await, CloudState::default());
    }
}
