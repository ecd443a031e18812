// Volumes and snapshots
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::app::AppState;
use crate::handlers::volumes;

pub fn create_storage_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/volumes", get(volumes::list_volumes).post(volumes::create_volume))
        .route("/volumes/{id}", get(volumes::get_volume).delete(volumes::delete_volume))
        .route("/volumes/{id}/attach", post(volumes::attach_volume))
        .route("/volumes/{id}/detach", post(volumes::detach_volume))
        .route("/volumes/{id}/snapshots", post(volumes::create_snapshot))
        .route("/snapshots", get(volumes::list_snapshots))
        .route("/snapshots/{id}/restore", post(volumes::restore_snapshot))
}
