// Block volumes and their snapshots
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use nimbus_common::VolumeStatus;
use serde::Deserialize;
use uuid::Uuid;

use crate::app::AppState;
use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub size_gb: i32,
}

#[derive(Debug, Deserialize)]
pub struct AttachVolumeRequest {
    pub instance_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    /// Name of the volume created from the snapshot.
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ListSnapshotParams {
    pub volume_id: Option<Uuid>,
}

pub async fn create_volume(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateVolumeRequest>,
) -> ApiResult<impl IntoResponse> {
    let vol = state.volumes.create(&req.name, req.size_gb).await?;
    Ok((StatusCode::CREATED, Json(vol)))
}

pub async fn list_volumes(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let mut volumes = state.store.list_volumes().await?;
    volumes.retain(|v| v.status != VolumeStatus::Deleted);
    Ok(Json(volumes))
}

pub async fn get_volume(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.volumes.get(id).await?))
}

pub async fn delete_volume(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    state.volumes.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn attach_volume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<AttachVolumeRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.volumes.attach(id, req.instance_id).await?))
}

pub async fn detach_volume(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.volumes.detach(id).await?))
}

pub async fn create_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<SnapshotRequest>,
) -> ApiResult<impl IntoResponse> {
    let snap = state.volumes.snapshot(id, &req.name).await?;
    Ok((StatusCode::CREATED, Json(snap)))
}

pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListSnapshotParams>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_snapshots(params.volume_id).await?))
}

pub async fn restore_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<RestoreRequest>,
) -> ApiResult<impl IntoResponse> {
    let vol = state.volumes.restore(id, &req.name).await?;
    Ok((StatusCode::CREATED, Json(vol)))
}
