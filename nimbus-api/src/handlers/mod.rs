// Request handlers, one module per resource family
pub mod autoscaling;
pub mod containers;
pub mod cron;
pub mod dns;
pub mod events;
pub mod health;
pub mod instances;
pub mod load_balancers;
pub mod network;
pub mod volumes;

use nimbus_common::CoreError;

use crate::error::ApiError;

/// Turns a missing row into a 404 naming what was looked up.
pub(crate) fn found<T>(row: Option<T>, what: impl FnOnce() -> String) -> Result<T, ApiError> {
    row.ok_or_else(|| ApiError(CoreError::NotFound(what())))
}

/// Launch templates come from groups and deployments alike.
pub(crate) fn check_template(t: &nimbus_common::LaunchTemplate) -> Result<(), CoreError> {
    if t.image.trim().is_empty() {
        return Err(CoreError::validation("template.image", "must not be empty"));
    }
    if t.vcpus < 1 {
        return Err(CoreError::validation("template.vcpus", "must be at least 1"));
    }
    if t.memory_mb < 64 {
        return Err(CoreError::validation("template.memory_mb", "must be at least 64"));
    }
    Ok(())
}
