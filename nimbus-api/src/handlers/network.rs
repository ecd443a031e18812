// VPCs, subnets, security groups and elastic IPs
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use nimbus_common::{CoreError, SecurityRule};
use serde::Deserialize;
use uuid::Uuid;

use super::found;
use crate::app::AppState;
use crate::error::ApiResult;

#[derive(Debug, Deserialize)]
pub struct CreateVpcRequest {
    pub name: String,
    /// Defaults to the configured VPC range.
    pub cidr: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSubnetRequest {
    pub name: String,
    pub cidr: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateSecurityGroupRequest {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<SecurityRule>,
}

#[derive(Debug, Deserialize)]
pub struct AllocateElasticIpRequest {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct AssociateElasticIpRequest {
    /// `null` disassociates.
    pub instance_id: Option<Uuid>,
}

pub async fn create_vpc(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateVpcRequest>,
) -> ApiResult<impl IntoResponse> {
    let vpc = state.network.create_vpc(&req.name, req.cidr.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(vpc)))
}

pub async fn list_vpcs(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_vpcs().await?))
}

pub async fn get_vpc(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    Ok(Json(found(state.store.get_vpc(id).await?, || format!("vpc {id}"))?))
}

/// Refused with 409 while the VPC still owns subnets, a zone or live instances.
pub async fn delete_vpc(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> ApiResult<impl IntoResponse> {
    state.network.delete_vpc(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_subnet(
    State(state): State<Arc<AppState>>,
    Path(vpc_id): Path<Uuid>,
    Json(req): Json<CreateSubnetRequest>,
) -> ApiResult<impl IntoResponse> {
    let subnet = state.network.create_subnet(vpc_id, &req.name, &req.cidr).await?;
    Ok((StatusCode::CREATED, Json(subnet)))
}

pub async fn list_subnets(
    State(state): State<Arc<AppState>>,
    Path(vpc_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    found(state.store.get_vpc(vpc_id).await?, || format!("vpc {vpc_id}"))?;
    Ok(Json(state.store.list_subnets(vpc_id).await?))
}

pub async fn delete_subnet(
    State(state): State<Arc<AppState>>,
    Path((vpc_id, subnet_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    let subnet = found(state.store.get_subnet(subnet_id).await?, || format!("subnet {subnet_id}"))?;
    if subnet.vpc_id != vpc_id {
        return Err(CoreError::not_found(format!("subnet {subnet_id}")).into());
    }
    state.store.delete_subnet(subnet_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_security_group(
    State(state): State<Arc<AppState>>,
    Path(vpc_id): Path<Uuid>,
    Json(req): Json<CreateSecurityGroupRequest>,
) -> ApiResult<impl IntoResponse> {
    let sg = state.network.create_security_group(vpc_id, &req.name, req.rules).await?;
    Ok((StatusCode::CREATED, Json(sg)))
}

pub async fn list_security_groups(
    State(state): State<Arc<AppState>>,
    Path(vpc_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    found(state.store.get_vpc(vpc_id).await?, || format!("vpc {vpc_id}"))?;
    Ok(Json(state.store.list_security_groups(vpc_id).await?))
}

pub async fn delete_security_group(
    State(state): State<Arc<AppState>>,
    Path((_vpc_id, sg_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    if !state.store.delete_security_group(sg_id).await? {
        return Err(CoreError::not_found(format!("security group {sg_id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn allocate_elastic_ip(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AllocateElasticIpRequest>,
) -> ApiResult<impl IntoResponse> {
    let eip = state.network.allocate_elastic_ip(&req.address).await?;
    Ok((StatusCode::CREATED, Json(eip)))
}

pub async fn list_elastic_ips(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_elastic_ips().await?))
}

pub async fn associate_elastic_ip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<AssociateElasticIpRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.network.associate_elastic_ip(id, req.instance_id).await?))
}

pub async fn release_elastic_ip(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    if !state.store.delete_elastic_ip(id).await? {
        return Err(CoreError::not_found(format!("elastic ip {id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}
