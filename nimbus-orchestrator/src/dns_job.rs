use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_common::{CoreResult, InstanceState};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::services::InstanceService;
use crate::store::InstanceFilter;
use crate::worker::Reconciler;

/// Holds the auto-record invariant: every Running instance in a zone-owning
/// VPC has exactly one A record, and no other instance has any.
pub struct DnsReconciler {
    svc: InstanceService,
    period: Duration,
}

impl DnsReconciler {
    pub fn new(svc: InstanceService) -> Self {
        Self {
            svc,
            period: Duration::from_secs(15),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }
}

#[async_trait]
impl Reconciler for DnsReconciler {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn reconcile(&self, token: &CancellationToken) -> CoreResult<usize> {
        let store = self.svc.store();
        let mut acted = 0;

        let running = store
            .list_instances(&InstanceFilter::in_states(&[InstanceState::Running]))
            .await?;
        let running_ids: HashSet<Uuid> = running.iter().map(|i| i.id).collect();

        for inst in running.iter().filter(|i| i.vpc_id.is_some()) {
            if token.is_cancelled() {
                return Ok(acted);
            }
            match self.svc.ensure_auto_record(inst).await {
                Ok(true) => acted += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(instance_id = %inst.id, error = %e, "auto record not ensured"),
            }
        }

        let stale: HashSet<Uuid> = store
            .auto_records()
            .await?
            .into_iter()
            .filter_map(|r| r.instance_id)
            .filter(|id| !running_ids.contains(id))
            .collect();
        for instance_id in stale {
            if token.is_cancelled() {
                break;
            }
            match self.svc.remove_auto_record(instance_id).await {
                Ok(n) => acted += n,
                Err(e) => tracing::warn!(instance_id = %instance_id, error = %e, "stale auto record not removed"),
            }
        }
        Ok(acted)
    }
}
