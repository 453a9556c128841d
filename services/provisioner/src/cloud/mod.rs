//! Compute, storage and remote-command interfaces.
//!
//! The workflows only ever talk to the provider through the [`Compute`] and
//! [`RemoteCommand`] traits. Each call is awaited before the next one is
//! issued; nothing here fans out.
//!
//! A [`SimulatedCloud`] implements both traits in-process. It backs the test
//! suites and the local binary.

mod simulated;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use voldr_id::{CommandId, InstanceId, SnapshotId, VolumeId};

pub use simulated::{CloudCall, CloudState, Fault, Operation, SimulatedCloud};

/// Provider errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    /// The resource does not exist (or is no longer visible).
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The provider refused the request.
    #[error("{operation} rejected: {message}")]
    Rejected { operation: String, message: String },

    /// A waiter gave up before its condition held.
    #[error("timeout after {elapsed:?} waiting for {condition}")]
    WaitTimeout {
        condition: WaitCondition,
        elapsed: Duration,
    },

    /// The provider could not be reached.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl CloudError {
    pub fn rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns true if the resource is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Instance run-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

/// Volume state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeState::Creating => "creating",
            VolumeState::Available => "available",
            VolumeState::InUse => "in-use",
            VolumeState::Deleting => "deleting",
            VolumeState::Deleted => "deleted",
            VolumeState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Snapshot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

/// Attachment state of a volume on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
}

/// Read-only view of a compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub availability_zone: String,
    pub state: InstanceState,
}

/// One attachment of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub instance_id: InstanceId,
    pub device: String,
    pub state: AttachmentState,
}

/// Read-only view of a block storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub availability_zone: String,
    pub state: VolumeState,
    #[serde(default)]
    pub attachments: Vec<VolumeAttachment>,
    #[serde(default)]
    pub snapshot_id: Option<SnapshotId>,
    #[serde(default)]
    pub size_gib: Option<u32>,
    #[serde(default)]
    pub volume_type: Option<String>,
}

/// Point-in-time copy of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub volume_id: VolumeId,
    pub state: SnapshotState,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

/// Resource tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Request to create a volume from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub availability_zone: String,
    pub snapshot_id: SnapshotId,
    pub size_gib: Option<u32>,
    pub volume_type: Option<String>,
}

/// Conditions a provider waiter can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitCondition {
    InstanceRunning,
    SnapshotCompleted,
    VolumeAvailable,
    VolumeInUse,
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WaitCondition::InstanceRunning => "instance-running",
            WaitCondition::SnapshotCompleted => "snapshot-completed",
            WaitCondition::VolumeAvailable => "volume-available",
            WaitCondition::VolumeInUse => "volume-in-use",
        };
        f.write_str(s)
    }
}

/// A wait condition together with the resources it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitFor {
    InstanceRunning(Vec<InstanceId>),
    SnapshotCompleted(Vec<SnapshotId>),
    VolumeAvailable(Vec<VolumeId>),
    VolumeInUse(Vec<VolumeId>),
}

impl WaitFor {
    pub fn condition(&self) -> WaitCondition {
        match self {
            WaitFor::InstanceRunning(_) => WaitCondition::InstanceRunning,
            WaitFor::SnapshotCompleted(_) => WaitCondition::SnapshotCompleted,
            WaitFor::VolumeAvailable(_) => WaitCondition::VolumeAvailable,
            WaitFor::VolumeInUse(_) => WaitCondition::VolumeInUse,
        }
    }

    /// Resource ids in their canonical string form.
    pub fn ids(&self) -> Vec<String> {
        fn strings<T: ToString>(ids: &[T]) -> Vec<String> {
            ids.iter().map(ToString::to_string).collect()
        }

        match self {
            WaitFor::InstanceRunning(ids) => strings(ids),
            WaitFor::SnapshotCompleted(ids) => strings(ids),
            WaitFor::VolumeAvailable(ids) | WaitFor::VolumeInUse(ids) => strings(ids),
        }
    }
}

/// Where remote command output is written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub bucket: Option<String>,
    pub key_prefix: Option<String>,
}

/// Compute and block storage capabilities.
#[async_trait]
pub trait Compute: Send + Sync {
    /// Look up an instance.
    async fn describe_instance(&self, id: &InstanceId) -> Result<Instance, CloudError>;

    /// Look up a volume.
    async fn describe_volume(&self, id: &VolumeId) -> Result<Volume, CloudError>;

    /// Start a snapshot of a volume. The snapshot is usually still pending.
    async fn create_snapshot(
        &self,
        volume_id: &VolumeId,
        tags: &[Tag],
    ) -> Result<Snapshot, CloudError>;

    /// Create a volume from a snapshot. The volume is usually still creating.
    async fn create_volume(&self, request: &CreateVolumeRequest) -> Result<Volume, CloudError>;

    /// Request attachment of a volume to an instance.
    async fn attach_volume(
        &self,
        device: &str,
        instance_id: &InstanceId,
        volume_id: &VolumeId,
    ) -> Result<(), CloudError>;

    /// Block until the condition holds for every listed resource.
    ///
    /// Timeout and poll interval are the provider's own.
    async fn wait_until(&self, target: &WaitFor) -> Result<(), CloudError>;
}

/// Remote command execution on instances.
#[async_trait]
pub trait RemoteCommand: Send + Sync {
    /// Dispatch a named command document to instances.
    async fn send_command(
        &self,
        document: &str,
        instance_ids: &[InstanceId],
        output: &OutputConfig,
    ) -> Result<CommandId, CloudError>;
}
