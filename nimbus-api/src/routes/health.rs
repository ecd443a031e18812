// Health routes (no rate limit)
use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::app::AppState;
use crate::handlers::health;

pub fn create_health_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/health/ovs", get(health::network))
        .route("/health/workers", get(health::workers))
}
