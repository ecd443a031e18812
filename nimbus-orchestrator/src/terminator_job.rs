use std::time::Duration;

use async_trait::async_trait;
use nimbus_common::{CoreResult, InstanceState};
use tokio_util::sync::CancellationToken;

use crate::services::InstanceService;
use crate::store::InstanceFilter;
use crate::worker::Reconciler;

/// job-terminator: drives Stopping instances to Terminated.
///
/// Each pass re-reads the Stopping set, so an instance whose backend delete
/// failed is simply picked up again on the next tick.
pub struct TerminatorReconciler {
    svc: InstanceService,
    period: Duration,
}

impl TerminatorReconciler {
    pub fn new(svc: InstanceService) -> Self {
        Self {
            svc,
            period: Duration::from_secs(10),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }
}

#[async_trait]
impl Reconciler for TerminatorReconciler {
    fn name(&self) -> &'static str {
        "terminator"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn reconcile(&self, token: &CancellationToken) -> CoreResult<usize> {
        let stopping = self
            .svc
            .store()
            .list_instances(&InstanceFilter::in_states(&[InstanceState::Stopping]))
            .await?;

        let mut done = 0;
        for inst in stopping {
            if token.is_cancelled() {
                break;
            }
            match self.svc.terminate(&inst).await {
                Ok(t) if t.state == InstanceState::Terminated => done += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(instance_id = %inst.id, error = %e, "termination incomplete, retrying next tick"),
            }
        }
        Ok(done)
    }
}
