// Instances, load balancers, autoscaling, cron and container deployments
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::app::AppState;
use crate::handlers::{autoscaling, containers, cron, events, instances, load_balancers};

pub fn create_compute_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Instances
        .route("/instances", get(instances::list_instances).post(instances::create_instance))
        .route(
            "/instances/{id}",
            get(instances::get_instance).delete(instances::terminate_instance),
        )
        .route("/instances/{id}/history", get(instances::instance_history))
        .route("/instances/{id}/metrics", post(instances::record_metric))
        .route("/instances/{id}/logs", get(instances::instance_logs))
        // Load balancers
        .route("/lb", get(load_balancers::list_lbs).post(load_balancers::create_lb))
        .route("/lb/{id}", get(load_balancers::get_lb).delete(load_balancers::delete_lb))
        .route("/lb/{id}/targets", post(load_balancers::add_target))
        .route("/lb/{id}/targets/{instance_id}", delete(load_balancers::remove_target))
        // Autoscaling
        .route(
            "/autoscaling/groups",
            get(autoscaling::list_groups).post(autoscaling::create_group),
        )
        .route(
            "/autoscaling/groups/{id}",
            get(autoscaling::get_group).delete(autoscaling::delete_group),
        )
        .route("/autoscaling/groups/{id}/policies", post(autoscaling::create_policy))
        // Cron
        .route("/cron/jobs", get(cron::list_jobs).post(cron::create_job))
        .route("/cron/jobs/{id}", get(cron::get_job).delete(cron::delete_job))
        .route("/cron/jobs/{id}/pause", post(cron::pause_job))
        .route("/cron/jobs/{id}/resume", post(cron::resume_job))
        // Container deployments
        .route(
            "/containers/deployments",
            get(containers::list_deployments).post(containers::create_deployment),
        )
        .route("/containers/deployments/{id}", get(containers::get_deployment))
        .route("/containers/deployments/{id}/scale", post(containers::scale_deployment))
        // Event stream
        .route("/events", get(events::events_stream))
}
