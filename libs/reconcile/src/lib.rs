//! Reconciliation primitives for the master volume.
//!
//! This library provides the two pieces of the provisioning loop that do not
//! talk to a provider directly:
//!
//! - **Polling waits**: eventual-consistency conditions (snapshot completed,
//!   volume available, ...) are observed by polling with a bounded timeout.
//! - **Placement**: deciding whether the master volume can be attached where
//!   the instance runs, or which source a replica must be built from.
//!
//! # Invariants
//!
//! - Placement decisions are deterministic given the same inputs
//! - A replica is only ever planned into the instance's zone
//! - A wait never outlives its policy timeout by more than one probe

use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use voldr_id::{SnapshotId, VolumeId};

/// Default upper bound for a single wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60); // 10 minutes

/// Default delay between two probes of the same wait.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(15);

/// Polling errors.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// Timeout waiting for the condition.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// The probe itself failed.
    #[error("probe failed: {0}")]
    Probe(E),
}

/// Timeout and interval for a polling wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Give up after this long.
    pub timeout: Duration,

    /// Sleep this long between probes.
    pub interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_WAIT_TIMEOUT,
            interval: DEFAULT_WAIT_INTERVAL,
        }
    }
}

impl WaitPolicy {
    /// Create a policy from explicit timeout and interval.
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Poll `probe` until it reports `true`.
///
/// Returns the number of probes issued. The probe is always called at least
/// once, even with a zero timeout.
pub async fn poll_until<F, Fut, E>(
    policy: &WaitPolicy,
    resource: &str,
    mut probe: F,
) -> Result<u32, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    let started = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        if probe().await.map_err(PollError::Probe)? {
            return Ok(attempts);
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(PollError::Timeout {
                resource: resource.to_string(),
                elapsed,
            });
        }

        tokio::time::sleep(policy.interval.min(policy.timeout - elapsed)).await;
    }
}

/// The live master volume as seen by the provider.
#[derive(Debug, Clone, Copy)]
pub struct LiveVolume<'a> {
    pub id: &'a VolumeId,
    pub availability_zone: &'a str,
}

/// Where a replica of the master volume is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationSource {
    /// Snapshot the live volume first.
    LiveVolume(VolumeId),

    /// The live volume is gone; restore from the last recorded snapshot.
    StoredSnapshot(SnapshotId),
}

/// Placement decision for one provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// The master volume already lives in the instance's zone.
    Colocated,

    /// A replica must be created in the instance's zone.
    Replicate(ReplicationSource),
}

impl Placement {
    /// Returns true if no replica is needed.
    pub fn is_colocated(&self) -> bool {
        matches!(self, Self::Colocated)
    }
}

/// Placement errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// Neither a live volume nor a stored snapshot is available.
    #[error("no live volume and no stored snapshot to replicate from")]
    NoReplicationSource,
}

/// Decide how the master volume reaches `instance_zone`.
///
/// `live` is `None` when the recorded volume could not be resolved.
pub fn plan_placement(
    instance_zone: &str,
    live: Option<LiveVolume<'_>>,
    stored_snapshot: Option<&SnapshotId>,
) -> Result<Placement, PlacementError> {
    match live {
        Some(volume) if volume.availability_zone == instance_zone => Ok(Placement::Colocated),
        Some(volume) => Ok(Placement::Replicate(ReplicationSource::LiveVolume(
            volume.id.clone(),
        ))),
        None => stored_snapshot
            .map(|snapshot| {
                Placement::Replicate(ReplicationSource::StoredSnapshot(snapshot.clone()))
            })
            .ok_or(PlacementError::NoReplicationSource),
    }
}
