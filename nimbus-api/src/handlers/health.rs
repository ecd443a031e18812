// Liveness, readiness and backend health checks
use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::app::AppState;
use crate::config::redis as redis_config;

pub async fn live() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Ready when the store answers, and Redis too when one is configured.
pub async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    let mut ok = true;

    match state.store.ping().await {
        Ok(()) => {
            checks.insert("database", "ok".to_string());
        }
        Err(e) => {
            tracing::warn!(error = %e, "readiness: store ping failed");
            checks.insert("database", "unreachable".to_string());
            ok = false;
        }
    }

    match &state.redis_client {
        None => {
            checks.insert("redis", "skipped".to_string());
        }
        Some(client) => match redis_config::ping(client).await {
            Ok(()) => {
                checks.insert("redis", "ok".to_string());
            }
            Err(e) => {
                tracing::warn!(error = %e, "readiness: redis ping failed");
                checks.insert("redis", "unreachable".to_string());
                ok = false;
            }
        },
    }

    let (status, label) = if ok {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    };
    (status, Json(json!({ "status": label, "checks": checks })))
}

/// Network backend health: healthy, degraded (no-op stand-in, still 200),
/// unhealthy (ping failed) or unavailable (no backend at all).
pub async fn network(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let backends = state.backends();
    let Some(net) = backends.network.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "message": "no network backend configured" })),
        );
    };
    if backends.network_degraded {
        return (
            StatusCode::OK,
            Json(json!({ "status": "degraded", "backend": net.kind(), "message": "software switch unavailable, using no-op network" })),
        );
    }
    let ctx = state.instances.call_context();
    match net.ping(&ctx).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "healthy", "backend": net.kind() }))),
        Err(e) => {
            tracing::warn!(backend = net.kind(), error = %e, "network backend ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unhealthy", "backend": net.kind(), "message": e.to_string() })),
            )
        }
    }
}

/// Last completed pass per reconciler and the launch breaker state.
pub async fn workers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ticks: BTreeMap<&str, _> = state.workers.snapshot().into_iter().collect();
    Json(json!({
        "role": format!("{:?}", state.config.role).to_ascii_lowercase(),
        "workers": ticks,
        "launch_breaker": state.instances.breaker().state().as_str(),
    }))
}
