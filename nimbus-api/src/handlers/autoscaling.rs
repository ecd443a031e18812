// Scaling groups and their target-tracking policies
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use nimbus_common::{validate, CoreError, LaunchTemplate, ResourceStatus};
use nimbus_orchestrator::store::{InstanceFilter, NewScalingGroup, NewScalingPolicy};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{check_template, found};
use crate::app::AppState;
use crate::error::ApiResult;

pub const MAX_GROUP_SIZE: i32 = 100;

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub vpc_id: Option<Uuid>,
    pub min_size: i32,
    pub max_size: i32,
    /// Defaults to `min_size`.
    pub desired: Option<i32>,
    pub launch_template: LaunchTemplate,
}

#[derive(Debug, Deserialize)]
pub struct CreatePolicyRequest {
    pub metric_type: String,
    pub target_value: f64,
    #[serde(default = "one")]
    pub scale_out_step: i32,
    #[serde(default = "one")]
    pub scale_in_step: i32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: i64,
}

fn one() -> i32 {
    1
}

fn default_cooldown() -> i64 {
    300
}

pub async fn create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<impl IntoResponse> {
    validate::identifier("name", &req.name)?;
    if req.min_size < 0 {
        return Err(CoreError::validation("min_size", "must not be negative").into());
    }
    if req.max_size < req.min_size || req.max_size > MAX_GROUP_SIZE {
        return Err(CoreError::validation("max_size", format!("must be between min_size and {MAX_GROUP_SIZE}")).into());
    }
    let desired = req.desired.unwrap_or(req.min_size);
    if desired < req.min_size || desired > req.max_size {
        return Err(CoreError::validation("desired", "must be between min_size and max_size").into());
    }
    check_template(&req.launch_template)?;
    if let Some(v) = req.vpc_id {
        found(state.store.get_vpc(v).await?, || format!("vpc {v}"))?;
    }

    let group = state
        .store
        .insert_group(&NewScalingGroup {
            name: req.name,
            vpc_id: req.vpc_id,
            min_size: req.min_size,
            max_size: req.max_size,
            desired,
            launch_template: req.launch_template,
        })
        .await?;
    tracing::info!(group_id = %group.id, desired, "scaling group declared");
    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn list_groups(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_groups().await?))
}

pub async fn get_group(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let group = found(state.store.get_group(id).await?, || format!("scaling group {id}"))?;
    let policies = state.store.list_policies(id).await?;
    let members = state.store.list_instances(&InstanceFilter::group(id)).await?;
    Ok(Json(json!({ "group": group, "policies": policies, "members": members })))
}

/// Members are drained by the autoscaler before the group row goes away.
pub async fn delete_group(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    if !state.store.mark_group_deleting(id).await? {
        return Err(CoreError::not_found(format!("scaling group {id}")).into());
    }
    tracing::info!(group_id = %id, "scaling group marked for deletion");
    Ok(StatusCode::ACCEPTED)
}

pub async fn create_policy(
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<Uuid>,
    Json(req): Json<CreatePolicyRequest>,
) -> ApiResult<impl IntoResponse> {
    validate::metric_type("metric_type", &req.metric_type)?;
    if !req.target_value.is_finite() || req.target_value <= 0.0 {
        return Err(CoreError::validation("target_value", "must be a positive number").into());
    }
    if req.scale_out_step < 1 || req.scale_in_step < 1 {
        return Err(CoreError::validation("scale_out_step", "steps must be at least 1").into());
    }
    if req.cooldown_secs < 0 {
        return Err(CoreError::validation("cooldown_secs", "must not be negative").into());
    }
    let group = found(state.store.get_group(group_id).await?, || format!("scaling group {group_id}"))?;
    if group.status == ResourceStatus::Deleting {
        return Err(CoreError::Conflict(format!("scaling group {group_id} is being deleted")).into());
    }

    let policy = state
        .store
        .insert_policy(&NewScalingPolicy {
            group_id,
            metric_type: req.metric_type,
            target_value: req.target_value,
            scale_out_step: req.scale_out_step,
            scale_in_step: req.scale_in_step,
            cooldown_secs: req.cooldown_secs,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(policy)))
}
