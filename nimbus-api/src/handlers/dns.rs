use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use nimbus_orchestrator::services::RecordRequest;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::found;
use crate::app::AppState;
use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct CreateZoneRequest {
    pub name: String,
    /// Binds the zone to a VPC; its Running instances get auto records.
    pub vpc_id: Option<Uuid>,
}

pub async fn create_zone(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateZoneRequest>,
) -> ApiResult<impl IntoResponse> {
    let zone = state.dns.create_zone(&req.name, req.vpc_id).await?;
    Ok((StatusCode::CREATED, Json(zone)))
}

pub async fn list_zones(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_zones().await?))
}

pub async fn get_zone(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let zone = found(state.store.get_zone(id).await?, || format!("zone {id}"))?;
    let records = state.store.list_records(id).await?;
    Ok(Json(json!({ "zone": zone, "records": records })))
}

pub async fn delete_zone(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    state.dns.delete_zone(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Manual records are never auto-managed; TTLs below the floor are raised.
pub async fn create_record(
    State(state): State<Arc<AppState>>,
    Path(zone_id): Path<Uuid>,
    Json(req): Json<RecordRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = state.dns.create_record(zone_id, req).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn list_records(
    State(state): State<Arc<AppState>>,
    Path(zone_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    found(state.store.get_zone(zone_id).await?, || format!("zone {zone_id}"))?;
    Ok(Json(state.store.list_records(zone_id).await?))
}

pub async fn delete_record(
    State(state): State<Arc<AppState>>,
    Path((zone_id, record_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    state.dns.delete_record(zone_id, record_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
