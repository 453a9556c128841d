//! Workflow error types.

use thiserror::Error;

use crate::records::StoreError;

/// Workflow errors with standardized reason codes.
///
/// Every variant is fatal for the run that produced it. None are retried.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The trigger payload could not be understood.
    #[error("invalid_event: {0}")]
    InvalidEvent(String),

    /// Instance (or volume) could not be resolved.
    #[error("lookup_failed: {resource} {id}: {detail}")]
    Lookup {
        resource: &'static str,
        id: String,
        detail: String,
    },

    /// The singleton volume record is missing.
    #[error("record_not_found: volume record '{0}' does not exist")]
    RecordNotFound(String),

    /// The record store failed for a reason other than a missing record.
    #[error("record_store_failed: {0}")]
    Store(#[source] StoreError),

    /// Snapshot or volume creation, or one of their waits, failed.
    #[error("replication_failed: {stage}: {detail}")]
    Replication { stage: &'static str, detail: String },

    /// Attach, or a wait around it, failed.
    #[error("attachment_failed: volume {volume_id} on instance {instance_id}: {detail}")]
    Attachment {
        volume_id: String,
        instance_id: String,
        detail: String,
    },

    /// The mount command could not be dispatched.
    #[error("mount_failed: document {document}: {detail}")]
    Mount { document: String, detail: String },

    /// The scheduled snapshot failed.
    #[error("snapshot_failed: {stage}: {detail}")]
    Snapshot { stage: &'static str, detail: String },
}

impl WorkflowError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            WorkflowError::InvalidEvent(_) => "invalid_event",
            WorkflowError::Lookup { .. } => "lookup_failed",
            WorkflowError::RecordNotFound(_) => "record_not_found",
            WorkflowError::Store(_) => "record_store_failed",
            WorkflowError::Replication { .. } => "replication_failed",
            WorkflowError::Attachment { .. } => "attachment_failed",
            WorkflowError::Mount { .. } => "mount_failed",
            WorkflowError::Snapshot { .. } => "snapshot_failed",
        }
    }

    pub(crate) fn replication(stage: &'static str, detail: impl ToString) -> Self {
        Self::Replication {
            stage,
            detail: detail.to_string(),
        }
    }

    pub(crate) fn snapshot(stage: &'static str, detail: impl ToString) -> Self {
        Self::Snapshot {
            stage,
            detail: detail.to_string(),
        }
    }
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::RecordNotFound { id } => WorkflowError::RecordNotFound(id),
            other => WorkflowError::Store(other),
        }
    }
}
