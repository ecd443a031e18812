// VPCs, elastic IPs and DNS
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::app::AppState;
use crate::handlers::{dns, network};

pub fn create_network_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/vpcs", get(network::list_vpcs).post(network::create_vpc))
        .route("/vpcs/{id}", get(network::get_vpc).delete(network::delete_vpc))
        .route(
            "/vpcs/{id}/subnets",
            get(network::list_subnets).post(network::create_subnet),
        )
        .route("/vpcs/{id}/subnets/{subnet_id}", delete(network::delete_subnet))
        .route(
            "/vpcs/{id}/security-groups",
            get(network::list_security_groups).post(network::create_security_group),
        )
        .route("/vpcs/{id}/security-groups/{sg_id}", delete(network::delete_security_group))
        .route(
            "/elastic-ips",
            get(network::list_elastic_ips).post(network::allocate_elastic_ip),
        )
        .route("/elastic-ips/{id}", delete(network::release_elastic_ip))
        .route("/elastic-ips/{id}/associate", post(network::associate_elastic_ip))
        // DNS
        .route("/dns/zones", get(dns::list_zones).post(dns::create_zone))
        .route("/dns/zones/{id}", get(dns::get_zone).delete(dns::delete_zone))
        .route(
            "/dns/zones/{id}/records",
            get(dns::list_records).post(dns::create_record),
        )
        .route("/dns/zones/{id}/records/{record_id}", delete(dns::delete_record))
}
