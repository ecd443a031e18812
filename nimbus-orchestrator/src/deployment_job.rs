use std::time::Duration;

use async_trait::async_trait;
use nimbus_common::bus::EventType;
use nimbus_common::validate::short_id;
use nimbus_common::{ContainerDeployment, CoreResult, Instance, InstanceState};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::services::InstanceService;
use crate::store::InstanceFilter;
use crate::worker::Reconciler;

/// Converges each container deployment on its desired replica count.
pub struct DeploymentReconciler {
    svc: InstanceService,
    period: Duration,
}

impl DeploymentReconciler {
    pub fn new(svc: InstanceService) -> Self {
        Self {
            svc,
            period: Duration::from_secs(5),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    async fn reconcile_one(&self, dep: &ContainerDeployment) -> CoreResult<bool> {
        let store = self.svc.store();
        let members = store.list_instances(&InstanceFilter::deployment(dep.id)).await?;

        let mut acted = false;
        for failed in members.iter().filter(|m| m.state == InstanceState::Error) {
            self.svc.request_termination(failed.id).await?;
            acted = true;
        }

        // Pending and Starting replicas count, so a slow launch is not doubled.
        let mut active: Vec<&Instance> = members.iter().filter(|m| m.state.is_active()).collect();
        let delta = dep.desired_replicas - active.len() as i32;

        if delta > 0 {
            for _ in 0..delta {
                let name = format!("{}-{}", dep.name, short_id());
                let inst = self
                    .svc
                    .create_member(name, &dep.template, dep.vpc_id, None, Some(dep.id))
                    .await?;
                self.svc.spawn_launch(inst.id);
            }
        } else if delta < 0 {
            active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            for inst in active.into_iter().take((-delta) as usize) {
                self.svc.request_termination(inst.id).await?;
            }
        }

        let running = members.iter().filter(|m| m.state == InstanceState::Running).count() as i32;
        if running != dep.current_replicas {
            store.set_current_replicas(dep.id, running).await?;
        }

        if delta != 0 {
            tracing::info!(deployment_id = %dep.id, desired = dep.desired_replicas, delta, "deployment scaled");
            self.svc
                .events()
                .publish(
                    EventType::DeploymentScaled,
                    json!({ "deployment_id": dep.id, "name": dep.name, "desired": dep.desired_replicas, "delta": delta }),
                )
                .await;
            acted = true;
        }
        Ok(acted)
    }
}

#[async_trait]
impl Reconciler for DeploymentReconciler {
    fn name(&self) -> &'static str {
        "deployment"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn reconcile(&self, token: &CancellationToken) -> CoreResult<usize> {
        let mut acted = 0;
        for dep in self.svc.store().list_deployments().await? {
            if token.is_cancelled() {
                break;
            }
            match self.reconcile_one(&dep).await {
                Ok(true) => acted += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(deployment_id = %dep.id, error = %e, "deployment not reconciled"),
            }
        }
        Ok(acted)
    }
}
