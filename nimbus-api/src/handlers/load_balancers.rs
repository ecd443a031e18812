// Load balancers: only declared state changes here; the LB reconciler
// realizes it through the proxy adapter.
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use nimbus_common::{validate, CoreError, LbAlgorithm, LbTarget, ResourceStatus};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::found;
use crate::app::AppState;
use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct CreateLbRequest {
    pub name: String,
    pub port: i32,
    /// Free text, normalized; anything unrecognized is round-robin.
    #[serde(default)]
    pub algorithm: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddTargetRequest {
    pub instance_id: Uuid,
    pub port: i32,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_weight() -> i32 {
    1
}

fn check_port(field: &str, port: i32) -> Result<(), CoreError> {
    if (1..=65535).contains(&port) {
        Ok(())
    } else {
        Err(CoreError::validation(field, "must be between 1 and 65535"))
    }
}

pub async fn create_lb(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateLbRequest>,
) -> ApiResult<impl IntoResponse> {
    validate::identifier("name", &req.name)?;
    check_port("port", req.port)?;
    let algorithm = req.algorithm.as_deref().map(LbAlgorithm::parse).unwrap_or(LbAlgorithm::RoundRobin);
    let lb = state.store.insert_lb(&req.name, req.port, algorithm).await?;
    tracing::info!(lb_id = %lb.id, port = lb.port, algorithm = algorithm.as_str(), "load balancer declared");
    Ok((StatusCode::CREATED, Json(lb)))
}

pub async fn list_lbs(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_lbs().await?))
}

pub async fn get_lb(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let lb = found(state.store.get_lb(id).await?, || format!("load balancer {id}"))?;
    let targets = state.store.list_targets(id).await?;
    Ok(Json(json!({ "load_balancer": lb, "targets": targets })))
}

/// Marks the LB for removal; the reconciler tears down the proxy and drops it.
pub async fn delete_lb(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    if !state.store.mark_lb_deleting(id).await? {
        return Err(CoreError::not_found(format!("load balancer {id}")).into());
    }
    tracing::info!(lb_id = %id, "load balancer marked for deletion");
    Ok(StatusCode::ACCEPTED)
}

pub async fn add_target(
    State(state): State<Arc<AppState>>,
    Path(lb_id): Path<Uuid>,
    Json(req): Json<AddTargetRequest>,
) -> ApiResult<impl IntoResponse> {
    check_port("port", req.port)?;
    if req.weight < 1 {
        return Err(CoreError::validation("weight", "must be at least 1").into());
    }
    let lb = found(state.store.get_lb(lb_id).await?, || format!("load balancer {lb_id}"))?;
    if lb.status == ResourceStatus::Deleting {
        return Err(CoreError::Conflict(format!("load balancer {lb_id} is being deleted")).into());
    }
    let target = LbTarget {
        lb_id,
        instance_id: req.instance_id,
        port: req.port,
        weight: req.weight,
    };
    state.store.upsert_target(&target).await?;
    Ok((StatusCode::CREATED, Json(target)))
}

pub async fn remove_target(
    State(state): State<Arc<AppState>>,
    Path((lb_id, instance_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    if !state.store.remove_target(lb_id, instance_id).await? {
        return Err(CoreError::not_found(format!("target {instance_id} on load balancer {lb_id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}
