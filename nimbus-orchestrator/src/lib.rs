//! Control-loop core: the persistent-store seam, the synchronous services
//! behind the API, and the reconcilers that converge backends on declared state.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub mod autoscaling_job;
pub mod breaker;
pub mod cron_job;
pub mod deployment_job;
pub mod dns_job;
pub mod events;
pub mod hub;
pub mod lb_job;
pub mod provisioning_job;
pub mod services;
pub mod store;
pub mod terminator_job;
pub mod worker;

pub use breaker::{BreakerState, CircuitBreaker};
pub use events::EventPublisher;
pub use hub::{Hub, HubHandle};
pub use services::InstanceService;
pub use worker::{Reconciler, WorkerHealth, Workers};

/// Every reconciler, wired to the same instance service.
pub fn reconcilers(svc: &InstanceService) -> Vec<Arc<dyn Reconciler>> {
    let dispatcher = Arc::new(cron_job::DefaultDispatcher::new(svc.clone()));
    vec![
        Arc::new(provisioning_job::ProvisioningReconciler::new(svc.clone())),
        Arc::new(terminator_job::TerminatorReconciler::new(svc.clone())),
        Arc::new(lb_job::LbReconciler::new(svc.clone())),
        Arc::new(autoscaling_job::AutoscalingReconciler::new(svc.clone())),
        Arc::new(cron_job::CronReconciler::new(svc.clone(), dispatcher)),
        Arc::new(deployment_job::DeploymentReconciler::new(svc.clone())),
        Arc::new(dns_job::DnsReconciler::new(svc.clone())),
    ]
}

/// Starts every reconciler under `token`.
pub fn start_workers(svc: &InstanceService, health: WorkerHealth, token: &CancellationToken) -> Workers {
    let mut workers = Workers::new(health);
    for r in reconcilers(svc) {
        workers.spawn(r, token.child_token());
    }
    tracing::info!(workers = workers.len(), "reconcilers started");
    workers
}
