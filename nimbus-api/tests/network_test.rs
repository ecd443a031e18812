// HTTP tests for VPCs, DNS zones and records, volumes and snapshots

mod common;

use common::{create_test_app, settle};
use serde_json::{json, Value};

#[tokio::test]
async fn test_vpc_refuses_delete_while_non_empty() {
    let app = create_test_app();
    let vpc: Value = app.server.post("/vpcs").json(&json!({ "name": "prod" })).await.json();
    assert_eq!(vpc["cidr"], "10.0.0.0/16");
    let vpc_id = vpc["id"].as_str().unwrap().to_string();

    let subnet = app
        .server
        .post(&format!("/vpcs/{vpc_id}/subnets"))
        .json(&json!({ "name": "a", "cidr": "10.0.1.0/24" }))
        .await;
    assert_eq!(subnet.status_code(), 201);
    let subnet: Value = subnet.json();
    assert_eq!(subnet["gateway"], "10.0.1.1");

    let outside = app
        .server
        .post(&format!("/vpcs/{vpc_id}/subnets"))
        .json(&json!({ "name": "b", "cidr": "192.168.0.0/24" }))
        .await;
    assert_eq!(outside.status_code(), 400);

    let overlap = app
        .server
        .post(&format!("/vpcs/{vpc_id}/subnets"))
        .json(&json!({ "name": "c", "cidr": "10.0.1.0/25" }))
        .await;
    assert_eq!(overlap.status_code(), 409);

    assert_eq!(app.server.delete(&format!("/vpcs/{vpc_id}")).await.status_code(), 409);

    let subnet_id = subnet["id"].as_str().unwrap();
    assert_eq!(
        app.server.delete(&format!("/vpcs/{vpc_id}/subnets/{subnet_id}")).await.status_code(),
        204
    );
    assert_eq!(app.server.delete(&format!("/vpcs/{vpc_id}")).await.status_code(), 204);
    assert_eq!(app.server.get(&format!("/vpcs/{vpc_id}")).await.status_code(), 404);
}

#[tokio::test]
async fn test_security_group_rules_are_checked() {
    let app = create_test_app();
    let vpc: Value = app.server.post("/vpcs").json(&json!({ "name": "sg" })).await.json();
    let vpc_id = vpc["id"].as_str().unwrap().to_string();

    let ok = app
        .server
        .post(&format!("/vpcs/{vpc_id}/security-groups"))
        .json(&json!({
            "name": "web",
            "rules": [{
                "action": "allow", "direction": "ingress", "protocol": "tcp",
                "port_from": 443, "port_to": 443, "source": { "cidr": "0.0.0.0/0" }
            }]
        }))
        .await;
    assert_eq!(ok.status_code(), 201);

    let bad = app
        .server
        .post(&format!("/vpcs/{vpc_id}/security-groups"))
        .json(&json!({
            "name": "bad",
            "rules": [{
                "action": "allow", "direction": "ingress", "protocol": "sctp",
                "port_from": 1, "port_to": 2, "source": { "cidr": "0.0.0.0/0" }
            }]
        }))
        .await;
    assert_eq!(bad.status_code(), 400);
    assert_eq!(bad.json::<Value>()["field"], "protocol");
}

#[tokio::test]
async fn test_dns_zone_gets_auto_record_for_running_instance() {
    let app = create_test_app();
    let vpc: Value = app.server.post("/vpcs").json(&json!({ "name": "prod" })).await.json();
    let vpc_id = vpc["id"].as_str().unwrap().to_string();

    let zone = app
        .server
        .post("/dns/zones")
        .json(&json!({ "name": "Prod.Internal.", "vpc_id": vpc_id }))
        .await;
    assert_eq!(zone.status_code(), 201);
    let zone: Value = zone.json();
    assert_eq!(zone["name"], "prod.internal");
    let zone_id = zone["id"].as_str().unwrap().to_string();

    let second = app
        .server
        .post("/dns/zones")
        .json(&json!({ "name": "other.internal", "vpc_id": vpc_id }))
        .await;
    assert_eq!(second.status_code(), 409);

    app.server
        .post("/instances")
        .json(&json!({ "name": "web", "image": "nginx", "vpc_id": vpc_id }))
        .await;
    settle().await;

    let records: Vec<Value> = app.server.get(&format!("/dns/zones/{zone_id}/records")).await.json();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["name"], "web");
    assert_eq!(records[0]["auto_managed"], true);
    assert_eq!(records[0]["ttl"], 300);

    // Auto records belong to their instance.
    let rec_id = records[0]["id"].as_str().unwrap();
    let refused = app.server.delete(&format!("/dns/zones/{zone_id}/records/{rec_id}")).await;
    assert_eq!(refused.status_code(), 409);
}

#[tokio::test]
async fn test_manual_record_ttl_is_clamped() {
    let app = create_test_app();
    let zone: Value = app
        .server
        .post("/dns/zones")
        .json(&json!({ "name": "example.test" }))
        .await
        .json();
    let zone_id = zone["id"].as_str().unwrap().to_string();

    let record = app
        .server
        .post(&format!("/dns/zones/{zone_id}/records"))
        .json(&json!({ "name": "www", "record_type": "A", "content": "192.0.2.10", "ttl": 10 }))
        .await;
    assert_eq!(record.status_code(), 201);
    let record: Value = record.json();
    assert_eq!(record["ttl"], 60);
    assert_eq!(record["auto_managed"], false);

    let bad = app
        .server
        .post(&format!("/dns/zones/{zone_id}/records"))
        .json(&json!({ "name": "www", "record_type": "A", "content": "nope" }))
        .await;
    assert_eq!(bad.status_code(), 400);
}

#[tokio::test]
async fn test_volume_attach_snapshot_restore() {
    let app = create_test_app();
    let inst: Value = app
        .server
        .post("/instances")
        .json(&json!({ "name": "db", "image": "postgres:16" }))
        .await
        .json();
    let inst_id = inst["id"].as_str().unwrap().to_string();
    settle().await;

    let vol = app.server.post("/volumes").json(&json!({ "name": "pgdata", "size_gb": 20 })).await;
    assert_eq!(vol.status_code(), 201);
    let vol: Value = vol.json();
    assert_eq!(vol["status"], "available");
    let vol_id = vol["id"].as_str().unwrap().to_string();

    let attached: Value = app
        .server
        .post(&format!("/volumes/{vol_id}/attach"))
        .json(&json!({ "instance_id": inst_id }))
        .await
        .json();
    assert_eq!(attached["status"], "in_use");
    assert_eq!(app.server.delete(&format!("/volumes/{vol_id}")).await.status_code(), 409);

    let snap = app
        .server
        .post(&format!("/volumes/{vol_id}/snapshots"))
        .json(&json!({ "name": "before-upgrade" }))
        .await;
    assert_eq!(snap.status_code(), 201);
    let snap_id = snap.json::<Value>()["id"].as_str().unwrap().to_string();

    let restored = app
        .server
        .post(&format!("/snapshots/{snap_id}/restore"))
        .json(&json!({ "name": "pgdata-copy" }))
        .await;
    assert_eq!(restored.status_code(), 201);
    assert_eq!(restored.json::<Value>()["size_gb"], 20);

    let detached: Value = app.server.post(&format!("/volumes/{vol_id}/detach")).await.json();
    assert_eq!(detached["status"], "available");
    assert_eq!(app.server.delete(&format!("/volumes/{vol_id}")).await.status_code(), 204);

    let listed: Vec<Value> = app.server.get("/volumes").await.json();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["name"], "pgdata-copy");
}
