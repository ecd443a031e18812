// Routes module - Centralizes all route definitions
pub mod compute;
pub mod health;
pub mod network;
pub mod storage;

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

use crate::app::{create_cors, AppState};
use crate::rate_limit;

/// Build the main application router. Health routes are always served and
/// never rate limited; the rest only when this process serves the API.
pub fn create_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let router = Router::new().merge(health::create_health_routes());
    if !state.config.role.serves_api() {
        return router;
    }
    let api = Router::new()
        .merge(compute::create_compute_routes())
        .merge(network::create_network_routes())
        .merge(storage::create_storage_routes())
        .route_layer(middleware::from_fn_with_state(state, rate_limit::limit));
    router.merge(api)
}

/// The router with state and the outer layers applied; what `main` serves.
pub fn create_app(state: Arc<AppState>) -> Router {
    create_router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(create_cors())
        .with_state(state)
}
