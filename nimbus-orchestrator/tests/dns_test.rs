mod common;

use common::fixture;
use nimbus_common::{CoreError, InstanceState, RecordType};
use nimbus_orchestrator::dns_job::DnsReconciler;
use nimbus_orchestrator::services::{DnsService, NetworkService, RecordRequest};
use nimbus_orchestrator::store::NewDnsRecord;
use nimbus_orchestrator::Reconciler;

#[tokio::test]
async fn reconciler_restores_and_prunes_auto_records() {
    let f = fixture();
    let net = NetworkService::new(f.svc.clone(), "10.0.0.0/16");
    let vpc = net.create_vpc("prod", None).await.unwrap();

    // Instances launched before the zone existed have no record yet.
    let web = f.running("web", Some(vpc.id)).await;
    let db = f.running("db", Some(vpc.id)).await;
    let dns = DnsService::new(f.svc.clone());
    let zone = dns.create_zone("prod.internal.", Some(vpc.id)).await.unwrap();
    assert_eq!(zone.name, "prod.internal");
    assert!(f.store.list_records(zone.id).await.unwrap().is_empty());

    let reconciler = DnsReconciler::new(f.svc.clone());
    assert_eq!(reconciler.reconcile(&f.token).await.unwrap(), 2);
    assert_eq!(f.store.list_records(zone.id).await.unwrap().len(), 2);

    // A record left behind by an instance that stopped running is pruned.
    f.store
        .transition(db.id, &[InstanceState::Running], InstanceState::Stopped, &Default::default(), "powered off")
        .await
        .unwrap();
    assert_eq!(reconciler.reconcile(&f.token).await.unwrap(), 1);

    let records = f.store.list_records(zone.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].instance_id, Some(web.id));
    assert_eq!(reconciler.reconcile(&f.token).await.unwrap(), 0);
}

#[tokio::test]
async fn duplicate_auto_records_collapse_to_one() {
    let f = fixture();
    let net = NetworkService::new(f.svc.clone(), "10.0.0.0/16");
    let vpc = net.create_vpc("prod", None).await.unwrap();
    let zone = f.store.insert_zone("prod.internal", Some(vpc.id), None).await.unwrap();
    let web = f.running("web", Some(vpc.id)).await;

    f.store
        .insert_record(&NewDnsRecord {
            zone_id: zone.id,
            name: "web".into(),
            record_type: RecordType::A,
            content: "10.9.9.9".into(),
            ttl: 300,
            auto_managed: true,
            instance_id: Some(web.id),
        })
        .await
        .unwrap();
    assert_eq!(f.store.auto_records_for(web.id).await.unwrap().len(), 2);

    DnsReconciler::new(f.svc.clone()).reconcile(&f.token).await.unwrap();
    let left = f.store.auto_records_for(web.id).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].content, "127.0.0.1");
}

#[tokio::test]
async fn manual_records_clamp_ttl_and_are_never_auto() {
    let f = fixture();
    let dns = DnsService::new(f.svc.clone());
    let zone = dns.create_zone("example.test", None).await.unwrap();

    let rec = dns
        .create_record(
            zone.id,
            RecordRequest {
                name: "www".into(),
                record_type: "a".into(),
                content: "192.0.2.10".into(),
                ttl: Some(5),
            },
        )
        .await
        .unwrap();
    assert_eq!(rec.ttl, 60);
    assert!(!rec.auto_managed);
    assert!(rec.instance_id.is_none());

    let bad = dns
        .create_record(
            zone.id,
            RecordRequest {
                name: "www".into(),
                record_type: "A".into(),
                content: "not-an-ip".into(),
                ttl: None,
            },
        )
        .await;
    assert!(matches!(bad, Err(CoreError::Validation { .. })));

    dns.delete_record(zone.id, rec.id).await.unwrap();
    assert!(f.store.list_records(zone.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn a_vpc_owns_at_most_one_zone() {
    let f = fixture();
    let net = NetworkService::new(f.svc.clone(), "10.0.0.0/16");
    let vpc = net.create_vpc("prod", None).await.unwrap();
    let dns = DnsService::new(f.svc.clone());

    dns.create_zone("a.internal", Some(vpc.id)).await.unwrap();
    assert!(matches!(
        dns.create_zone("b.internal", Some(vpc.id)).await,
        Err(CoreError::Conflict(_))
    ));
}
