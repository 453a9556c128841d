//! Integration tests for the scheduled snapshot workflow.

mod harness;

use harness::*;
use voldr_provisioner::cloud::{
    CloudCall, Fault, Operation, SimulatedCloud, SnapshotState, VolumeState, WaitCondition,
};
use voldr_provisioner::records::VolumeRecord;
use voldr_provisioner::ScheduleTick;

fn cloud() -> SimulatedCloud {
    SimulatedCloud::new(fast_policy())
        .with_instance(instance(ZONE_A))
        .with_volume(volume(ZONE_A, VolumeState::InUse))
}

#[tokio::test]
async fn test_snapshot_updates_only_snapshot_id() {
    let fixture = Fixture::new(cloud(), Some(record()));

    let message = fixture
        .snapshotter
        .run(&ScheduleTick::default())
        .await
        .unwrap();

    let stored = fixture.stored_record().await;
    let snapshot_id = stored.snapshot_id.clone().unwrap();
    assert_ne!(snapshot_id, stored_snapshot_id());
    assert_eq!(
        message,
        format!("Snapshot was created successfully: {}", snapshot_id)
    );

    assert_eq!(stored.volume_id, volume_id().as_str());
    assert_eq!(stored.device, DEVICE);
    assert_eq!(stored.id, "0");

    let state = fixture.cloud.state().await;
    let snapshot = &state.snapshots[snapshot_id.as_str()];
    assert_eq!(snapshot.state, SnapshotState::Completed);
    assert_eq!(snapshot.volume_id, volume_id());
    assert!(snapshot
        .tags
        .iter()
        .any(|t| t.key == "Trigger" && t.value == "schedule"));

    // The record is only written once the snapshot completed.
    let writes = fixture.table.writes().await;
    assert_eq!(writes.len(), 1);
    let calls = fixture.calls().await;
    assert!(matches!(
        calls[writes[0].0 - 1],
        CloudCall::WaitUntil {
            condition: WaitCondition::SnapshotCompleted,
            ..
        }
    ));

    // Snapshots never notify.
    assert!(fixture.sink.published().await.is_empty());
}

#[tokio::test]
async fn test_snapshot_rejection_leaves_record_unchanged() {
    let cloud = cloud();
    cloud
        .inject(
            Operation::CreateSnapshot,
            Fault::Reject("SnapshotCreationPerVolumeRateExceeded".to_string()),
        )
        .await;
    let fixture = Fixture::new(cloud, Some(record()));

    let err = fixture
        .snapshotter
        .run(&ScheduleTick::default())
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "snapshot_failed");
    assert!(err.to_string().contains("SnapshotCreationPerVolumeRateExceeded"));

    assert!(fixture.table.writes().await.is_empty());
    assert_eq!(fixture.stored_record().await, record());
}

#[tokio::test]
async fn test_snapshot_wait_timeout_leaves_record_unchanged() {
    let cloud = cloud();
    cloud
        .inject(Operation::Wait(WaitCondition::SnapshotCompleted), Fault::Stall)
        .await;
    let fixture = Fixture::new(cloud, Some(record()));

    let err = fixture
        .snapshotter
        .run(&ScheduleTick::default())
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "snapshot_failed");
    assert_eq!(fixture.stored_record().await, record());
}

#[tokio::test]
async fn test_snapshot_without_record_fails() {
    let fixture = Fixture::new(cloud(), None);

    let err = fixture
        .snapshotter
        .run(&ScheduleTick::default())
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "record_not_found");
    assert!(fixture.calls().await.is_empty());
}

#[tokio::test]
async fn test_snapshot_with_garbled_volume_reference_fails_without_provider_calls() {
    let garbled = VolumeRecord {
        volume_id: "vol-deadbeefXX".to_string(),
        ..record()
    };
    let fixture = Fixture::new(cloud(), Some(garbled.clone()));

    let err = fixture
        .snapshotter
        .run(&ScheduleTick::default())
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "snapshot_failed");
    assert!(fixture.calls().await.is_empty());
    assert_eq!(fixture.stored_record().await, garbled);
}
