mod common;

use common::fixture;
use nimbus_common::{CoreError, SnapshotStatus, VolumeStatus};
use nimbus_orchestrator::services::VolumeService;
use nimbus_orchestrator::terminator_job::TerminatorReconciler;
use nimbus_orchestrator::Reconciler;

#[tokio::test]
async fn attach_detach_and_snapshot_restore() {
    let f = fixture();
    let volumes = VolumeService::new(f.svc.clone());
    let web = f.running("web", None).await;
    let other = f.running("other", None).await;

    let vol = volumes.create("data", 10).await.unwrap();
    assert_eq!(vol.status, VolumeStatus::Available);
    assert!(vol.backend_path.is_some());

    let attached = volumes.attach(vol.id, web.id).await.unwrap();
    assert_eq!(attached.status, VolumeStatus::InUse);
    assert_eq!(attached.instance_id, Some(web.id));

    // Same holder again is a no-op; a second holder is refused.
    volumes.attach(vol.id, web.id).await.unwrap();
    assert!(matches!(volumes.attach(vol.id, other.id).await, Err(CoreError::Conflict(_))));
    assert!(matches!(volumes.delete(vol.id).await, Err(CoreError::Conflict(_))));

    let snap = volumes.snapshot(vol.id, "nightly").await.unwrap();
    assert_eq!(snap.status, SnapshotStatus::Available);
    let restored = volumes.restore(snap.id, "data-copy").await.unwrap();
    assert_eq!(restored.size_gb, 10);
    assert_eq!(restored.status, VolumeStatus::Available);

    let detached = volumes.detach(vol.id).await.unwrap();
    assert_eq!(detached.status, VolumeStatus::Available);
    assert!(detached.instance_id.is_none());
    volumes.delete(vol.id).await.unwrap();
    assert!(matches!(volumes.get(vol.id).await, Err(CoreError::NotFound(_))));
}

#[tokio::test]
async fn termination_releases_volumes() {
    let f = fixture();
    let volumes = VolumeService::new(f.svc.clone());
    let web = f.running("web", None).await;
    let vol = volumes.create("data", 1).await.unwrap();
    volumes.attach(vol.id, web.id).await.unwrap();

    f.svc.request_termination(web.id).await.unwrap();
    TerminatorReconciler::new(f.svc.clone()).reconcile(&f.token).await.unwrap();

    let vol = volumes.get(vol.id).await.unwrap();
    assert_eq!(vol.status, VolumeStatus::Available);
    assert!(vol.instance_id.is_none());
}

#[tokio::test]
async fn size_is_bounded() {
    let f = fixture();
    let volumes = VolumeService::new(f.svc.clone());
    assert!(matches!(volumes.create("zero", 0).await, Err(CoreError::Validation { .. })));
    assert!(matches!(volumes.create("../x", 1).await, Err(CoreError::Validation { .. })));
}
