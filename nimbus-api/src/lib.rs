// Library entry point for the binary and the HTTP tests

pub mod app;
pub mod config;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod setup;

pub use app::AppState;
pub use error::ApiError;
