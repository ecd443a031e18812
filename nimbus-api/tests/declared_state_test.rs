// HTTP tests for the endpoints that only record declared state: load
// balancers, scaling groups, cron jobs and container deployments.

mod common;

use common::{create_test_app, settle};
use serde_json::{json, Value};
use uuid::Uuid;

async fn running_instance(app: &common::TestApp, name: &str) -> String {
    let body: Value = app
        .server
        .post("/instances")
        .json(&json!({ "name": name, "image": "alpine" }))
        .await
        .json();
    settle().await;
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_load_balancer_lifecycle() {
    let app = create_test_app();
    let response = app
        .server
        .post("/lb")
        .json(&json!({ "name": "front", "port": 8080, "algorithm": "least_conn" }))
        .await;
    assert_eq!(response.status_code(), 201);
    let lb: Value = response.json();
    assert_eq!(lb["algorithm"], "least-connections");
    assert!(lb["proxy_id"].is_null());
    let lb_id = lb["id"].as_str().unwrap().to_string();

    // The listener port is unique among live load balancers.
    let dup = app.server.post("/lb").json(&json!({ "name": "other", "port": 8080 })).await;
    assert_eq!(dup.status_code(), 409);

    let inst = running_instance(&app, "web").await;
    let target = app
        .server
        .post(&format!("/lb/{lb_id}/targets"))
        .json(&json!({ "instance_id": inst, "port": 80 }))
        .await;
    assert_eq!(target.status_code(), 201);
    assert_eq!(target.json::<Value>()["weight"], 1);

    let zero_weight = app
        .server
        .post(&format!("/lb/{lb_id}/targets"))
        .json(&json!({ "instance_id": inst, "port": 80, "weight": 0 }))
        .await;
    assert_eq!(zero_weight.status_code(), 400);

    let detail: Value = app.server.get(&format!("/lb/{lb_id}")).await.json();
    assert_eq!(detail["targets"].as_array().unwrap().len(), 1);
    assert_eq!(detail["targets"][0]["state"], "running");

    let removed = app.server.delete(&format!("/lb/{lb_id}/targets/{inst}")).await;
    assert_eq!(removed.status_code(), 204);
    let again = app.server.delete(&format!("/lb/{lb_id}/targets/{inst}")).await;
    assert_eq!(again.status_code(), 404);

    assert_eq!(app.server.delete(&format!("/lb/{lb_id}")).await.status_code(), 202);
    let lb: Value = app.server.get(&format!("/lb/{lb_id}")).await.json();
    assert_eq!(lb["load_balancer"]["status"], "deleting");

    let late = app
        .server
        .post(&format!("/lb/{lb_id}/targets"))
        .json(&json!({ "instance_id": inst, "port": 80 }))
        .await;
    assert_eq!(late.status_code(), 409);
}

#[tokio::test]
async fn test_load_balancer_rejects_bad_ports() {
    let app = create_test_app();
    let response = app.server.post("/lb").json(&json!({ "name": "x", "port": 70000 })).await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Value>()["field"], "port");
    assert_eq!(app.server.delete(&format!("/lb/{}", Uuid::new_v4())).await.status_code(), 404);
}

#[tokio::test]
async fn test_scaling_group_and_policy() {
    let app = create_test_app();
    let response = app
        .server
        .post("/autoscaling/groups")
        .json(&json!({
            "name": "workers",
            "min_size": 1,
            "max_size": 5,
            "desired": 2,
            "launch_template": { "image": "worker:3" }
        }))
        .await;
    assert_eq!(response.status_code(), 201);
    let group: Value = response.json();
    assert_eq!(group["desired"], 2);
    assert_eq!(group["launch_template"]["vcpus"], 1);
    let gid = group["id"].as_str().unwrap().to_string();

    let policy = app
        .server
        .post(&format!("/autoscaling/groups/{gid}/policies"))
        .json(&json!({ "metric_type": "cpu", "target_value": 70.0 }))
        .await;
    assert_eq!(policy.status_code(), 201);
    let policy: Value = policy.json();
    assert_eq!(policy["cooldown_secs"], 300);
    assert_eq!(policy["scale_out_step"], 1);

    let detail: Value = app.server.get(&format!("/autoscaling/groups/{gid}")).await.json();
    assert_eq!(detail["policies"].as_array().unwrap().len(), 1);

    assert_eq!(app.server.delete(&format!("/autoscaling/groups/{gid}")).await.status_code(), 202);
    let late = app
        .server
        .post(&format!("/autoscaling/groups/{gid}/policies"))
        .json(&json!({ "metric_type": "cpu", "target_value": 50.0 }))
        .await;
    assert_eq!(late.status_code(), 409);
}

#[tokio::test]
async fn test_scaling_group_bounds_are_validated() {
    let app = create_test_app();
    let template = json!({ "image": "worker:3" });

    let inverted = app
        .server
        .post("/autoscaling/groups")
        .json(&json!({ "name": "g", "min_size": 3, "max_size": 1, "launch_template": template }))
        .await;
    assert_eq!(inverted.status_code(), 400);
    assert_eq!(inverted.json::<Value>()["field"], "max_size");

    let outside = app
        .server
        .post("/autoscaling/groups")
        .json(&json!({ "name": "g", "min_size": 1, "max_size": 3, "desired": 4, "launch_template": template }))
        .await;
    assert_eq!(outside.status_code(), 400);
    assert_eq!(outside.json::<Value>()["field"], "desired");

    let no_image = app
        .server
        .post("/autoscaling/groups")
        .json(&json!({ "name": "g", "min_size": 0, "max_size": 1, "launch_template": { "image": " " } }))
        .await;
    assert_eq!(no_image.status_code(), 400);
    assert_eq!(no_image.json::<Value>()["field"], "template.image");
}

#[tokio::test]
async fn test_cron_pause_and_resume() {
    let app = create_test_app();
    let response = app
        .server
        .post("/cron/jobs")
        .json(&json!({
            "name": "nightly",
            "schedule": "0 3 * * *",
            "target": { "kind": "http", "url": "https://hooks.example.test/run" }
        }))
        .await;
    assert_eq!(response.status_code(), 201);
    let job: Value = response.json();
    assert_eq!(job["target"]["method"], "POST");
    let id = job["id"].as_str().unwrap().to_string();

    let detail: Value = app.server.get(&format!("/cron/jobs/{id}")).await.json();
    assert!(detail["next_fire_at"].is_string());

    let paused: Value = app.server.post(&format!("/cron/jobs/{id}/pause")).await.json();
    assert_eq!(paused["paused"], true);
    let detail: Value = app.server.get(&format!("/cron/jobs/{id}")).await.json();
    assert!(detail["next_fire_at"].is_null());

    let resumed: Value = app.server.post(&format!("/cron/jobs/{id}/resume")).await.json();
    assert_eq!(resumed["paused"], false);

    assert_eq!(
        app.server.post(&format!("/cron/jobs/{}/pause", Uuid::new_v4())).await.status_code(),
        404
    );
}

#[tokio::test]
async fn test_cron_rejects_bad_schedules_and_targets() {
    let app = create_test_app();
    let bad_schedule = app
        .server
        .post("/cron/jobs")
        .json(&json!({
            "name": "x",
            "schedule": "every tuesday",
            "target": { "kind": "function", "image": "task:1" }
        }))
        .await;
    assert_eq!(bad_schedule.status_code(), 400);
    assert_eq!(bad_schedule.json::<Value>()["field"], "schedule");

    let bad_url = app
        .server
        .post("/cron/jobs")
        .json(&json!({
            "name": "x",
            "schedule": "*/5 * * * *",
            "target": { "kind": "http", "url": "ftp://files" }
        }))
        .await;
    assert_eq!(bad_url.status_code(), 400);
    assert_eq!(bad_url.json::<Value>()["field"], "target.url");
}

#[tokio::test]
async fn test_deployment_scale() {
    let app = create_test_app();
    let response = app
        .server
        .post("/containers/deployments")
        .json(&json!({ "name": "api", "replicas": 2, "template": { "image": "api:1.0" } }))
        .await;
    assert_eq!(response.status_code(), 201);
    let dep: Value = response.json();
    assert_eq!(dep["desired_replicas"], 2);
    assert_eq!(dep["current_replicas"], 0);
    let id = dep["id"].as_str().unwrap().to_string();

    let scaled = app
        .server
        .post(&format!("/containers/deployments/{id}/scale"))
        .json(&json!({ "replicas": 5 }))
        .await;
    assert_eq!(scaled.status_code(), 200);
    assert_eq!(scaled.json::<Value>()["desired_replicas"], 5);

    let negative = app
        .server
        .post(&format!("/containers/deployments/{id}/scale"))
        .json(&json!({ "replicas": -1 }))
        .await;
    assert_eq!(negative.status_code(), 400);

    let missing = app
        .server
        .post(&format!("/containers/deployments/{}/scale", Uuid::new_v4()))
        .json(&json!({ "replicas": 1 }))
        .await;
    assert_eq!(missing.status_code(), 404);
}
