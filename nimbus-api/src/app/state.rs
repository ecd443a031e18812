use std::sync::Arc;

use nimbus_orchestrator::services::{DnsService, NetworkService, VolumeService};
use nimbus_orchestrator::store::Store;
use nimbus_orchestrator::{HubHandle, InstanceService, WorkerHealth};
use nimbus_providers::Backends;

use crate::config::AppConfig;
use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn Store>,
    pub instances: InstanceService,
    pub network: NetworkService,
    pub volumes: VolumeService,
    pub dns: DnsService,
    pub hub: Option<HubHandle>,
    pub workers: WorkerHealth,
    pub limiter: Arc<RateLimiter>,
    pub redis_client: Option<redis::Client>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        instances: InstanceService,
        hub: Option<HubHandle>,
        workers: WorkerHealth,
        redis_client: Option<redis::Client>,
    ) -> Arc<Self> {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_rps, config.rate_limit_burst));
        Arc::new(Self {
            store: instances.store().clone(),
            network: NetworkService::new(instances.clone(), config.default_vpc_cidr.clone()),
            volumes: VolumeService::new(instances.clone()),
            dns: DnsService::new(instances.clone()),
            config: Arc::new(config),
            instances,
            hub,
            workers,
            limiter,
            redis_client,
        })
    }

    pub fn backends(&self) -> &Backends {
        self.instances.backends()
    }
}
