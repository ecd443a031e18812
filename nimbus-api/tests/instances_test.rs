// HTTP tests for the instance lifecycle endpoints

mod common;

use common::{create_test_app, settle};
use serde_json::{json, Value};
use uuid::Uuid;

#[tokio::test]
async fn test_create_instance_is_accepted_then_runs() {
    let app = create_test_app();

    let response = app
        .server
        .post("/instances")
        .json(&json!({ "name": "web-1", "image": "nginx:1.27", "ports": "8080:80, 8443:443" }))
        .await;
    assert_eq!(response.status_code(), 202);
    let body: Value = response.json();
    assert_eq!(body["state"], "pending");
    assert_eq!(body["port_map"].as_array().unwrap().len(), 2);
    let id = body["id"].as_str().unwrap().to_string();

    settle().await;

    let response = app.server.get(&format!("/instances/{id}")).await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["state"], "running");
    assert!(body["private_ip"].is_string());

    let history: Vec<Value> = app.server.get(&format!("/instances/{id}/history")).await.json();
    let to: Vec<&str> = history.iter().map(|h| h["to_state"].as_str().unwrap()).collect();
    assert_eq!(to, vec!["starting", "running"]);
}

#[tokio::test]
async fn test_create_instance_validation() {
    let app = create_test_app();

    let response = app
        .server
        .post("/instances")
        .json(&json!({ "name": "web", "image": "nginx", "ports": "80-80" }))
        .await;
    assert_eq!(response.status_code(), 400);
    let body: Value = response.json();
    assert_eq!(body["error"], "validation");
    assert_eq!(body["field"], "ports");

    let response = app
        .server
        .post("/instances")
        .json(&json!({ "name": "../etc", "image": "nginx" }))
        .await;
    assert_eq!(response.status_code(), 400);
    assert_eq!(response.json::<Value>()["field"], "name");

    let response = app
        .server
        .post("/instances")
        .json(&json!({ "name": "web", "image": "nginx", "vpc_id": Uuid::new_v4() }))
        .await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_terminate_instance_is_idempotent() {
    let app = create_test_app();
    let body: Value = app
        .server
        .post("/instances")
        .json(&json!({ "name": "api", "image": "alpine" }))
        .await
        .json();
    let id = body["id"].as_str().unwrap().to_string();
    settle().await;

    let response = app.server.delete(&format!("/instances/{id}")).await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["state"], "stopping");

    // Accepting the same termination again changes nothing.
    let response = app.server.delete(&format!("/instances/{id}")).await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.json::<Value>()["state"], "stopping");

    let response = app.server.delete(&format!("/instances/{}", Uuid::new_v4())).await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_list_instances_filters_by_state() {
    let app = create_test_app();
    for name in ["a", "b"] {
        app.server
            .post("/instances")
            .json(&json!({ "name": name, "image": "alpine" }))
            .await;
    }
    settle().await;

    let all: Vec<Value> = app.server.get("/instances").await.json();
    assert_eq!(all.len(), 2);
    let running: Vec<Value> = app.server.get("/instances?state=running").await.json();
    assert_eq!(running.len(), 2);
    let stopped: Vec<Value> = app.server.get("/instances?state=stopped").await.json();
    assert!(stopped.is_empty());
}

#[tokio::test]
async fn test_metric_samples_are_validated() {
    let app = create_test_app();
    let body: Value = app
        .server
        .post("/instances")
        .json(&json!({ "name": "m", "image": "alpine" }))
        .await
        .json();
    let id = body["id"].as_str().unwrap().to_string();

    let ok = app
        .server
        .post(&format!("/instances/{id}/metrics"))
        .json(&json!({ "metric_type": "cpu", "value": 42.5 }))
        .await;
    assert_eq!(ok.status_code(), 204);

    let bad = app
        .server
        .post(&format!("/instances/{id}/metrics"))
        .json(&json!({ "metric_type": "disk", "value": 1.0 }))
        .await;
    assert_eq!(bad.status_code(), 400);
    assert_eq!(bad.json::<Value>()["field"], "metric_type");
}
