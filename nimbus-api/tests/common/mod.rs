// Common test utilities: the full router over the in-memory store and no-op
// backends, served by axum-test.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use nimbus_api::config::AppConfig;
use nimbus_api::routes::create_app;
use nimbus_api::AppState;
use nimbus_orchestrator::services::Timeouts;
use nimbus_orchestrator::store::MemoryStore;
use nimbus_orchestrator::{EventPublisher, InstanceService, WorkerHealth};
use nimbus_providers::Backends;
use tokio_util::sync::CancellationToken;

pub struct TestApp {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub token: CancellationToken,
}

pub fn test_config(overrides: &[(&str, &str)]) -> AppConfig {
    let mut env: HashMap<String, String> = HashMap::from([
        ("DATABASE_URL".to_string(), "memory://".to_string()),
        ("COMPUTE_BACKEND".to_string(), "noop".to_string()),
        ("NETWORK_BACKEND".to_string(), "noop".to_string()),
        ("RATE_LIMIT_RPS".to_string(), "1000".to_string()),
        ("RATE_LIMIT_BURST".to_string(), "1000".to_string()),
    ]);
    for (k, v) in overrides {
        env.insert(k.to_string(), v.to_string());
    }
    AppConfig::from_lookup(|k| env.get(k).cloned()).expect("test config is valid")
}

pub fn create_test_app() -> TestApp {
    create_test_app_with(test_config(&[]), Backends::noop())
}

pub fn create_test_app_with(config: AppConfig, backends: Backends) -> TestApp {
    let token = CancellationToken::new();
    let instances = InstanceService::new(
        Arc::new(MemoryStore::new()),
        backends,
        EventPublisher::default(),
        token.clone(),
    )
    .with_timeouts(Timeouts {
        call: Duration::from_secs(5),
        ip_wait: Duration::from_secs(1),
    });
    let state = AppState::new(config, instances, None, WorkerHealth::default(), None);
    let server = TestServer::new(create_app(state.clone())).unwrap();
    TestApp { server, state, token }
}

/// Lets background launches finish.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
