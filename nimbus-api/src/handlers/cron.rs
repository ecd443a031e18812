use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use nimbus_common::{validate, CoreError, CronTarget};
use nimbus_orchestrator::cron_job::{next_fire, parse_schedule};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::found;
use crate::app::AppState;
use crate::error::ApiResult;

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

#[derive(Debug, Deserialize)]
pub struct CreateCronRequest {
    pub name: String,
    /// Five- or six-field cron expression.
    pub schedule: String,
    pub target: CronTarget,
}

fn check_target(target: &CronTarget) -> Result<(), CoreError> {
    match target {
        CronTarget::Http { url, method } => {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(CoreError::validation("target.url", "must be an http(s) URL"));
            }
            if !HTTP_METHODS.contains(&method.to_ascii_uppercase().as_str()) {
                return Err(CoreError::validation("target.method", format!("must be one of {}", HTTP_METHODS.join(", "))));
            }
        }
        CronTarget::Function { image, .. } => {
            if image.trim().is_empty() {
                return Err(CoreError::validation("target.image", "must not be empty"));
            }
        }
    }
    Ok(())
}

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCronRequest>,
) -> ApiResult<impl IntoResponse> {
    validate::identifier("name", &req.name)?;
    parse_schedule(&req.schedule)?;
    check_target(&req.target)?;
    let job = state.store.insert_cron(&req.name, req.schedule.trim(), &req.target).await?;
    tracing::info!(cron_id = %job.id, schedule = %job.schedule, "cron job created");
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_cron().await?))
}

/// The job plus its next fire time; paused jobs report none.
pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let job = found(state.store.get_cron(id).await?, || format!("cron job {id}"))?;
    let next = if job.paused { None } else { next_fire(&job).ok() };
    Ok(Json(json!({ "job": job, "next_fire_at": next })))
}

pub async fn pause_job(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let job = found(state.store.set_cron_paused(id, true).await?, || format!("cron job {id}"))?;
    tracing::info!(cron_id = %id, "cron job paused");
    Ok(Json(job))
}

pub async fn resume_job(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    let job = found(state.store.set_cron_paused(id, false).await?, || format!("cron job {id}"))?;
    tracing::info!(cron_id = %id, "cron job resumed");
    Ok(Json(job))
}

pub async fn delete_job(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    if !state.store.delete_cron(id).await? {
        return Err(CoreError::not_found(format!("cron job {id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}
