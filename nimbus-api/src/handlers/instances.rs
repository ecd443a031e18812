use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use nimbus_common::{validate, CoreError, InstanceState};
use nimbus_orchestrator::services::InstanceRequest;
use nimbus_orchestrator::store::InstanceFilter;
use serde::Deserialize;
use uuid::Uuid;

use super::found;
use crate::app::AppState;
use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub image: String,
    /// Comma-separated `ext:int` pairs.
    #[serde(default)]
    pub ports: Option<String>,
    pub vpc_id: Option<Uuid>,
    pub subnet_id: Option<Uuid>,
    pub instance_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListInstanceParams {
    pub state: Option<InstanceState>,
    pub vpc_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub deployment_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct MetricSample {
    pub metric_type: String,
    pub value: f64,
}

/// Records the instance and launches it in the background. The response
/// carries the Pending record.
pub async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateInstanceRequest>,
) -> ApiResult<impl IntoResponse> {
    let ports = validate::parse_port_map(req.ports.as_deref().unwrap_or(""))?;
    let inst = state
        .instances
        .create(InstanceRequest {
            name: req.name,
            image: req.image,
            ports,
            vpc_id: req.vpc_id,
            subnet_id: req.subnet_id,
            instance_type: req.instance_type,
        })
        .await?;
    state.instances.spawn_launch(inst.id);
    Ok((StatusCode::ACCEPTED, Json(inst)))
}

pub async fn list_instances(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListInstanceParams>,
) -> ApiResult<impl IntoResponse> {
    let filter = InstanceFilter {
        vpc_id: params.vpc_id,
        scaling_group_id: params.group_id,
        deployment_id: params.deployment_id,
        states: params.state.into_iter().collect(),
    };
    Ok(Json(state.store.list_instances(&filter).await?))
}

pub async fn get_instance(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let inst = found(state.store.get_instance(id).await?, || format!("instance {id}"))?;
    Ok(Json(inst))
}

/// Accepts the termination; the terminator reconciler finishes it. Repeating
/// the call on a Terminated instance succeeds without side effects.
pub async fn terminate_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let inst = state.instances.request_termination(id).await?;
    Ok(Json(inst))
}

pub async fn instance_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    found(state.store.get_instance(id).await?, || format!("instance {id}"))?;
    Ok(Json(state.store.state_history(id).await?))
}

/// Ingests one utilization sample for the autoscaler.
pub async fn record_metric(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(sample): Json<MetricSample>,
) -> ApiResult<impl IntoResponse> {
    validate::metric_type("metric_type", &sample.metric_type)?;
    if !sample.value.is_finite() || sample.value < 0.0 {
        return Err(CoreError::validation("value", "must be a non-negative number").into());
    }
    found(state.store.get_instance(id).await?, || format!("instance {id}"))?;
    state.store.record_metric(id, &sample.metric_type, sample.value).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Streams the backend's log output for a running instance.
pub async fn instance_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let inst = found(state.store.get_instance(id).await?, || format!("instance {id}"))?;
    let handle = inst
        .backend_handle
        .ok_or_else(|| CoreError::Conflict(format!("instance {id} has no backend object")))?;
    let ctx = state.instances.call_context();
    let stream = state
        .backends()
        .compute
        .logs(&ctx, &handle)
        .await
        .map_err(CoreError::from)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], Body::from_stream(stream)))
}
