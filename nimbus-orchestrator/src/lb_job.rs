use std::time::Duration;

use async_trait::async_trait;
use nimbus_common::bus::EventType;
use nimbus_common::{CoreResult, InstanceState, LoadBalancer, ResourceStatus};
use nimbus_providers::inventory::{ProxySpec, ProxyTarget};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::services::InstanceService;
use crate::store::TargetView;
use crate::worker::Reconciler;

/// Keeps every declared load balancer realized as a proxy whose upstreams are
/// exactly its Running targets.
pub struct LbReconciler {
    svc: InstanceService,
    period: Duration,
}

impl LbReconciler {
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

    async fn reconcile_one(&self, lb: &LoadBalancer) -> CoreResult<bool> {
        let store = self.svc.store();
        let proxy = &self.svc.backends().proxy;
        let ctx = self.svc.call_context();
        let lb_ref = lb.id.to_string();

        if lb.status == ResourceStatus::Deleting {
            proxy.remove(&ctx, &lb_ref).await?;
            store.delete_lb(lb.id).await?;
            tracing::info!(lb_id = %lb.id, "load balancer removed");
            self.svc
                .events()
                .publish(EventType::LbRemoved, json!({ "lb_id": lb.id, "name": lb.name }))
                .await;
            return Ok(true);
        }

        let spec = ProxySpec {
            id: lb_ref,
            port: u16::try_from(lb.port).unwrap_or_default(),
            algorithm: lb.algorithm,
        };
        let targets = proxy_targets(&store.list_targets(lb.id).await?);

        match lb.proxy_id.as_deref() {
            None => {
                let handle = proxy.deploy(&ctx, &spec, &targets).await?;
                store.set_lb_proxy(lb.id, &handle).await?;
                tracing::info!(lb_id = %lb.id, targets = targets.len(), "load balancer deployed");
                self.svc
                    .events()
                    .publish(
                        EventType::LbDeployed,
                        json!({ "lb_id": lb.id, "name": lb.name, "port": lb.port, "targets": targets.len() }),
                    )
                    .await;
                Ok(true)
            }
            Some(_) => {
                proxy.update(&ctx, &spec, &targets).await?;
                tracing::debug!(lb_id = %lb.id, targets = targets.len(), "load balancer updated");
                Ok(false)
            }
        }
    }
}

/// Upstreams for the proxy: only targets whose instance is Running with a handle.
pub fn proxy_targets(views: &[TargetView]) -> Vec<ProxyTarget> {
    views
        .iter()
        .filter(|v| v.state == InstanceState::Running)
        .filter_map(|v| {
            Some(ProxyTarget {
                instance_handle: v.backend_handle.clone()?,
                port: u16::try_from(v.target.port).ok()?,
                weight: u32::try_from(v.target.weight).unwrap_or(1).max(1),
            })
        })
        .collect()
}

#[async_trait]
impl Reconciler for LbReconciler {
    fn name(&self) -> &'static str {
        "lb"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn reconcile(&self, token: &CancellationToken) -> CoreResult<usize> {
        let mut acted = 0;
        for lb in self.svc.store().list_lbs().await? {
            if token.is_cancelled() {
                break;
            }
            match self.reconcile_one(&lb).await {
                Ok(true) => acted += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(lb_id = %lb.id, error = %e, "load balancer not reconciled"),
            }
        }
        Ok(acted)
    }
}
