use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nimbus_common::{CoreResult, InstanceState};
use tokio_util::sync::CancellationToken;

use crate::services::InstanceService;
use crate::store::InstanceFilter;
use crate::worker::Reconciler;

/// job-provisioning: picks up launches that never completed.
///
/// - Pending rows older than the grace period are launched again. This covers
///   launches lost to a restart and launches deferred by an open breaker.
/// - Starting rows untouched for longer than the starting grace belong to a
///   launch that died mid-flight. Whatever it created on the backend is
///   deleted, then the row goes back to Pending and is launched again. The
///   starting grace must outlast one launch (call deadline plus address wait).
/// - Running rows with a handle but no private address get another `get_ip`,
///   after which the DNS auto-record can be created.
pub struct ProvisioningReconciler {
    svc: InstanceService,
    period: Duration,
    grace: chrono::Duration,
    starting_grace: chrono::Duration,
}

impl ProvisioningReconciler {
    pub fn new(svc: InstanceService) -> Self {
        Self {
            svc,
            period: Duration::from_secs(10),
            grace: chrono::Duration::seconds(30),
            starting_grace: chrono::Duration::minutes(5),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Sets both grace periods.
    pub fn with_grace(mut self, grace: chrono::Duration) -> Self {
        self.grace = grace;
        self.starting_grace = grace;
        self
    }

    pub fn with_starting_grace(mut self, grace: chrono::Duration) -> Self {
        self.starting_grace = grace;
        self
    }
}

#[async_trait]
impl Reconciler for ProvisioningReconciler {
    fn name(&self) -> &'static str {
        "provisioning"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn reconcile(&self, token: &CancellationToken) -> CoreResult<usize> {
        let store = self.svc.store();
        let mut acted = 0;

        for inst in store.stale_starting(Utc::now() - self.starting_grace).await? {
            if token.is_cancelled() {
                return Ok(acted);
            }
            match self.svc.reset_stale_launch(&inst).await {
                Ok(Some(_)) => acted += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!(instance_id = %inst.id, error = %e, "stale launch not reset"),
            }
        }

        for inst in store.stale_pending(Utc::now() - self.grace).await? {
            if token.is_cancelled() {
                return Ok(acted);
            }
            match self.svc.launch(inst.id).await {
                Ok(i) if i.state == InstanceState::Running => acted += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(instance_id = %inst.id, error = %e, "re-launch did not complete"),
            }
        }

        let running = store
            .list_instances(&InstanceFilter::in_states(&[InstanceState::Running]))
            .await?;
        for inst in running.into_iter().filter(|i| i.private_ip.is_none()) {
            if token.is_cancelled() {
                break;
            }
            let Some(handle) = inst.backend_handle.as_deref() else {
                continue;
            };
            let ctx = self.svc.call_context();
            let ip = match self.svc.backends().compute.get_ip(&ctx, handle).await {
                Ok(ip) => ip,
                Err(e) => {
                    tracing::debug!(instance_id = %inst.id, error = %e, "private address still unknown");
                    continue;
                }
            };
            store.set_private_ip(inst.id, &ip).await?;
            tracing::info!(instance_id = %inst.id, ip = %ip, "private address discovered");
            let updated = nimbus_common::Instance {
                private_ip: Some(ip),
                ..inst
            };
            if let Err(e) = self.svc.ensure_auto_record(&updated).await {
                tracing::warn!(instance_id = %updated.id, error = %e, "auto record not created");
            }
            acted += 1;
        }
        Ok(acted)
    }
}
