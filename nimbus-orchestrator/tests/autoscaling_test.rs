mod common;

use chrono::{Duration, Utc};
use common::{fixture, settle, Fixture};
use nimbus_common::{Instance, InstanceState, LaunchTemplate, ScalingGroup};
use nimbus_orchestrator::autoscaling_job::AutoscalingReconciler;
use nimbus_orchestrator::store::{InstanceFilter, NewScalingGroup, NewScalingPolicy};
use nimbus_orchestrator::terminator_job::TerminatorReconciler;
use nimbus_orchestrator::Reconciler;

async fn group(f: &Fixture, min: i32, max: i32, desired: i32) -> ScalingGroup {
    f.store
        .insert_group(&NewScalingGroup {
            name: "web".into(),
            vpc_id: None,
            min_size: min,
            max_size: max,
            desired,
            launch_template: LaunchTemplate {
                image: "nginx".into(),
                ..Default::default()
            },
        })
        .await
        .unwrap()
}

async fn cpu_policy(f: &Fixture, g: &ScalingGroup) {
    f.store
        .insert_policy(&NewScalingPolicy {
            group_id: g.id,
            metric_type: "cpu".into(),
            target_value: 70.0,
            scale_out_step: 1,
            scale_in_step: 1,
            cooldown_secs: 300,
        })
        .await
        .unwrap();
}

async fn active(f: &Fixture, g: &ScalingGroup) -> Vec<Instance> {
    f.store
        .list_instances(&InstanceFilter::group(g.id))
        .await
        .unwrap()
        .into_iter()
        .filter(|i| i.state.is_active())
        .collect()
}

async fn desired(f: &Fixture, g: &ScalingGroup) -> i32 {
    f.store.get_group(g.id).await.unwrap().unwrap().desired
}

#[tokio::test]
async fn converges_on_desired_without_policies() {
    let f = fixture();
    let g = group(&f, 1, 5, 3).await;
    let scaler = AutoscalingReconciler::new(f.svc.clone());

    scaler.reconcile(&f.token).await.unwrap();
    settle().await;

    let members = active(&f, &g).await;
    assert_eq!(members.len(), 3);
    assert!(members.iter().all(|m| m.name.starts_with("web-")));

    // Steady state: nothing to do.
    assert_eq!(scaler.reconcile(&f.token).await.unwrap(), 0);
}

#[tokio::test]
async fn scale_out_respects_cooldown() {
    let f = fixture();
    let g = group(&f, 1, 5, 2).await;
    let scaler = AutoscalingReconciler::new(f.svc.clone());
    let t0 = Utc::now();

    scaler.reconcile_at(t0, &f.token).await.unwrap();
    settle().await;
    for m in active(&f, &g).await {
        f.store.record_metric(m.id, "cpu", 85.0).await.unwrap();
    }
    cpu_policy(&f, &g).await;

    scaler.reconcile_at(t0, &f.token).await.unwrap();
    assert_eq!(desired(&f, &g).await, 3);
    assert_eq!(active(&f, &g).await.len(), 3);

    scaler.reconcile_at(t0 + Duration::seconds(60), &f.token).await.unwrap();
    assert_eq!(desired(&f, &g).await, 3, "policy is cooling down");
    assert_eq!(active(&f, &g).await.len(), 3);

    scaler.reconcile_at(t0 + Duration::seconds(301), &f.token).await.unwrap();
    assert_eq!(desired(&f, &g).await, 4);
    assert_eq!(active(&f, &g).await.len(), 4);
}

#[tokio::test]
async fn scale_in_releases_youngest_first() {
    let f = fixture();
    let g = group(&f, 1, 5, 3).await;
    let scaler = AutoscalingReconciler::new(f.svc.clone());
    let t0 = Utc::now();

    scaler.reconcile_at(t0, &f.token).await.unwrap();
    settle().await;
    let members = active(&f, &g).await;
    for (age, m) in members.iter().enumerate() {
        f.mem.backdate_instance(m.id, t0 - Duration::minutes(10 - age as i64));
        f.store.record_metric(m.id, "cpu", 10.0).await.unwrap();
    }
    let youngest = members.last().unwrap().id;
    cpu_policy(&f, &g).await;

    scaler.reconcile_at(t0, &f.token).await.unwrap();
    assert_eq!(desired(&f, &g).await, 2);
    assert_eq!(f.instance(youngest).await.state, InstanceState::Stopping);
    assert_eq!(active(&f, &g).await.len(), 2);
}

#[tokio::test]
async fn never_leaves_bounds() {
    let f = fixture();
    let g = group(&f, 2, 3, 3).await;
    let scaler = AutoscalingReconciler::new(f.svc.clone());
    let t0 = Utc::now();

    scaler.reconcile_at(t0, &f.token).await.unwrap();
    settle().await;
    for m in active(&f, &g).await {
        f.store.record_metric(m.id, "cpu", 99.0).await.unwrap();
    }
    cpu_policy(&f, &g).await;

    scaler.reconcile_at(t0, &f.token).await.unwrap();
    assert_eq!(desired(&f, &g).await, 3);
    assert_eq!(active(&f, &g).await.len(), 3);
}

#[tokio::test]
async fn deleting_group_drains_members_first() {
    let f = fixture();
    let g = group(&f, 1, 5, 2).await;
    let scaler = AutoscalingReconciler::new(f.svc.clone());
    scaler.reconcile(&f.token).await.unwrap();
    settle().await;

    f.store.mark_group_deleting(g.id).await.unwrap();
    scaler.reconcile(&f.token).await.unwrap();
    assert!(f.store.get_group(g.id).await.unwrap().is_some());
    assert!(active(&f, &g).await.is_empty());

    TerminatorReconciler::new(f.svc.clone()).reconcile(&f.token).await.unwrap();
    scaler.reconcile(&f.token).await.unwrap();
    assert!(f.store.get_group(g.id).await.unwrap().is_none());
}
