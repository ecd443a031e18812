mod common;

use common::{fixture, ProxyCall};
use nimbus_common::{LbAlgorithm, LbTarget};
use nimbus_orchestrator::lb_job::LbReconciler;
use nimbus_orchestrator::terminator_job::TerminatorReconciler;
use nimbus_orchestrator::Reconciler;
use nimbus_orchestrator::services::InstanceRequest;

fn target(lb_id: uuid::Uuid, instance_id: uuid::Uuid) -> LbTarget {
    LbTarget {
        lb_id,
        instance_id,
        port: 8080,
        weight: 1,
    }
}

#[tokio::test]
async fn deploys_then_follows_running_targets() {
    let f = fixture();
    let lb = f.store.insert_lb("front", 8081, LbAlgorithm::RoundRobin).await.unwrap();
    let web = f.running("web", None).await;
    let pending = f
        .svc
        .create(InstanceRequest {
            name: "late".into(),
            image: "alpine".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    f.store.upsert_target(&target(lb.id, web.id)).await.unwrap();
    f.store.upsert_target(&target(lb.id, pending.id)).await.unwrap();

    let lbs = LbReconciler::new(f.svc.clone());
    assert_eq!(lbs.reconcile(&f.token).await.unwrap(), 1);

    let Some(ProxyCall::Deploy(id, targets)) = f.proxy.last() else {
        panic!("expected a deploy, got {:?}", f.proxy.calls());
    };
    assert_eq!(id, lb.id.to_string());
    assert_eq!(targets.len(), 1);
    assert_eq!(Some(targets[0].instance_handle.clone()), web.backend_handle);
    assert_eq!(
        f.store.get_lb(lb.id).await.unwrap().unwrap().proxy_id.as_deref(),
        Some(lb.id.to_string().as_str())
    );

    // Already deployed: every later tick is an update.
    lbs.reconcile(&f.token).await.unwrap();
    assert!(matches!(f.proxy.last(), Some(ProxyCall::Update(_, t)) if t.len() == 1));

    // A target leaving Running disappears on the next tick.
    f.svc.request_termination(web.id).await.unwrap();
    lbs.reconcile(&f.token).await.unwrap();
    assert!(matches!(f.proxy.last(), Some(ProxyCall::Update(_, t)) if t.is_empty()));

    f.svc.launch(pending.id).await.unwrap();
    lbs.reconcile(&f.token).await.unwrap();
    assert!(matches!(f.proxy.last(), Some(ProxyCall::Update(_, t)) if t.len() == 1));
}

#[tokio::test]
async fn deleting_lb_is_removed_once() {
    let f = fixture();
    let lb = f.store.insert_lb("front", 8081, LbAlgorithm::LeastConnections).await.unwrap();
    let lbs = LbReconciler::new(f.svc.clone());
    lbs.reconcile(&f.token).await.unwrap();

    assert!(f.store.mark_lb_deleting(lb.id).await.unwrap());
    lbs.reconcile(&f.token).await.unwrap();
    assert_eq!(f.proxy.last(), Some(ProxyCall::Remove(lb.id.to_string())));
    assert!(f.store.get_lb(lb.id).await.unwrap().is_none());

    let calls = f.proxy.calls().len();
    lbs.reconcile(&f.token).await.unwrap();
    assert_eq!(f.proxy.calls().len(), calls);

    // The listener port is free again.
    f.store.insert_lb("front2", 8081, LbAlgorithm::RoundRobin).await.unwrap();
}

#[tokio::test]
async fn terminated_targets_stay_out() {
    let f = fixture();
    let lb = f.store.insert_lb("front", 9000, LbAlgorithm::RoundRobin).await.unwrap();
    let a = f.running("a", None).await;
    let b = f.running("b", None).await;
    f.store.upsert_target(&target(lb.id, a.id)).await.unwrap();
    f.store.upsert_target(&target(lb.id, b.id)).await.unwrap();

    f.svc.request_termination(a.id).await.unwrap();
    TerminatorReconciler::new(f.svc.clone()).reconcile(&f.token).await.unwrap();

    LbReconciler::new(f.svc.clone()).reconcile(&f.token).await.unwrap();
    let Some(ProxyCall::Deploy(_, targets)) = f.proxy.last() else {
        panic!("expected a deploy");
    };
    assert_eq!(targets.len(), 1);
    assert_eq!(Some(targets[0].instance_handle.clone()), b.backend_handle);
}
