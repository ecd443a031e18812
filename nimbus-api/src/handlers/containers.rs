// Container deployments: a replica count over a launch template
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use nimbus_common::{validate, CoreError, LaunchTemplate};
use nimbus_orchestrator::store::InstanceFilter;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{check_template, found};
use crate::app::AppState;
use crate::error::ApiResult;

pub const MAX_REPLICAS: i32 = 100;

#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    #[serde(default = "one")]
    pub replicas: i32,
    pub template: LaunchTemplate,
    pub vpc_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub replicas: i32,
}

fn one() -> i32 {
    1
}

fn check_replicas(replicas: i32) -> Result<(), CoreError> {
    if (0..=MAX_REPLICAS).contains(&replicas) {
        Ok(())
    } else {
        Err(CoreError::validation("replicas", format!("must be between 0 and {MAX_REPLICAS}")))
    }
}

pub async fn create_deployment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDeploymentRequest>,
) -> ApiResult<impl IntoResponse> {
    validate::identifier("name", &req.name)?;
    check_replicas(req.replicas)?;
    check_template(&req.template)?;
    if let Some(v) = req.vpc_id {
        found(state.store.get_vpc(v).await?, || format!("vpc {v}"))?;
    }
    let dep = state
        .store
        .insert_deployment(&req.name, req.replicas, &req.template, req.vpc_id)
        .await?;
    tracing::info!(deployment_id = %dep.id, replicas = dep.desired_replicas, "deployment declared");
    Ok((StatusCode::CREATED, Json(dep)))
}

pub async fn list_deployments(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_deployments().await?))
}

pub async fn get_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let dep = found(state.store.get_deployment(id).await?, || format!("deployment {id}"))?;
    let replicas = state.store.list_instances(&InstanceFilter::deployment(id)).await?;
    Ok(Json(json!({ "deployment": dep, "replicas": replicas })))
}

pub async fn scale_deployment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ScaleRequest>,
) -> ApiResult<impl IntoResponse> {
    check_replicas(req.replicas)?;
    let dep = found(
        state.store.set_desired_replicas(id, req.replicas).await?,
        || format!("deployment {id}"),
    )?;
    tracing::info!(deployment_id = %id, replicas = req.replicas, "deployment scaled");
    Ok(Json(dep))
}
