//! Persistent-store seam. Reconcilers and services only see these traits;
//! `postgres` backs them in production and `memory` in tests and the noop profile.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_common::{
    ContainerDeployment, CoreResult, CronJob, CronTarget, DnsRecord, DnsZone, ElasticIp, Instance,
    InstanceState, InstanceStateChange, LaunchTemplate, LbAlgorithm, LbTarget, LoadBalancer,
    NewInstance, RecordType, ScalingGroup, ScalingPolicy, SecurityGroup, SecurityRule, Snapshot,
    SnapshotStatus, Subnet, Volume, VolumeStatus, Vpc,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Selects instances. Empty `states` means every state.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub vpc_id: Option<Uuid>,
    pub scaling_group_id: Option<Uuid>,
    pub deployment_id: Option<Uuid>,
    pub states: Vec<InstanceState>,
}

impl InstanceFilter {
    pub fn in_states(states: &[InstanceState]) -> Self {
        Self {
            states: states.to_vec(),
            ..Default::default()
        }
    }

    pub fn group(id: Uuid) -> Self {
        Self {
            scaling_group_id: Some(id),
            ..Default::default()
        }
    }

    pub fn deployment(id: Uuid) -> Self {
        Self {
            deployment_id: Some(id),
            ..Default::default()
        }
    }

    pub fn matches(&self, i: &Instance) -> bool {
        self.vpc_id.map_or(true, |v| i.vpc_id == Some(v))
            && self.scaling_group_id.map_or(true, |g| i.scaling_group_id == Some(g))
            && self.deployment_id.map_or(true, |d| i.deployment_id == Some(d))
            && (self.states.is_empty() || self.states.contains(&i.state))
    }
}

/// Columns written alongside a state transition. `None` leaves the column as is.
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub backend_handle: Option<String>,
    pub private_ip: Option<String>,
    pub error_message: Option<String>,
}

/// A load-balancer target joined with the state of its instance.
#[derive(Debug, Clone, Serialize)]
pub struct TargetView {
    #[serde(flatten)]
    pub target: LbTarget,
    pub state: InstanceState,
    pub backend_handle: Option<String>,
    pub private_ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewScalingGroup {
    pub name: String,
    pub vpc_id: Option<Uuid>,
    pub min_size: i32,
    pub max_size: i32,
    pub desired: i32,
    pub launch_template: LaunchTemplate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewScalingPolicy {
    pub group_id: Uuid,
    pub metric_type: String,
    pub target_value: f64,
    pub scale_out_step: i32,
    pub scale_in_step: i32,
    pub cooldown_secs: i64,
}

#[derive(Debug, Clone)]
pub struct NewDnsRecord {
    pub zone_id: Uuid,
    pub name: String,
    pub record_type: RecordType,
    pub content: String,
    pub ttl: i32,
    pub auto_managed: bool,
    pub instance_id: Option<Uuid>,
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn insert_instance(&self, new: &NewInstance) -> CoreResult<Instance>;
    async fn get_instance(&self, id: Uuid) -> CoreResult<Option<Instance>>;
    async fn list_instances(&self, filter: &InstanceFilter) -> CoreResult<Vec<Instance>>;

    /// Moves the instance to `to` only if its current state is one of `from`,
    /// and appends the change to the state history. `None` when the guard failed.
    async fn transition(
        &self,
        id: Uuid,
        from: &[InstanceState],
        to: InstanceState,
        patch: &InstancePatch,
        reason: &str,
    ) -> CoreResult<Option<Instance>>;

    async fn set_private_ip(&self, id: Uuid, ip: &str) -> CoreResult<()>;
    /// Records a backend handle without touching the state.
    async fn set_backend_handle(&self, id: Uuid, handle: &str) -> CoreResult<()>;
    async fn state_history(&self, id: Uuid) -> CoreResult<Vec<InstanceStateChange>>;

    /// Pending instances created before `before`.
    async fn stale_pending(&self, before: DateTime<Utc>) -> CoreResult<Vec<Instance>>;
    /// Starting instances whose last update is before `before`.
    async fn stale_starting(&self, before: DateTime<Utc>) -> CoreResult<Vec<Instance>>;
}

#[async_trait]
pub trait NetworkStore: Send + Sync {
    async fn insert_vpc(&self, name: &str, cidr: &str) -> CoreResult<Vpc>;
    async fn get_vpc(&self, id: Uuid) -> CoreResult<Option<Vpc>>;
    async fn list_vpcs(&self) -> CoreResult<Vec<Vpc>>;
    async fn set_vpc_network_handle(&self, id: Uuid, handle: &str) -> CoreResult<()>;
    /// Refuses with `Conflict` while the VPC owns subnets, zones or live instances.
    async fn delete_vpc(&self, id: Uuid) -> CoreResult<bool>;

    async fn insert_subnet(&self, vpc_id: Uuid, name: &str, cidr: &str, gateway: &str) -> CoreResult<Subnet>;
    async fn get_subnet(&self, id: Uuid) -> CoreResult<Option<Subnet>>;
    async fn list_subnets(&self, vpc_id: Uuid) -> CoreResult<Vec<Subnet>>;
    /// Refuses with `Conflict` while live instances use the subnet.
    async fn delete_subnet(&self, id: Uuid) -> CoreResult<bool>;

    async fn insert_security_group(&self, vpc_id: Uuid, name: &str, rules: &[SecurityRule]) -> CoreResult<SecurityGroup>;
    async fn list_security_groups(&self, vpc_id: Uuid) -> CoreResult<Vec<SecurityGroup>>;
    async fn delete_security_group(&self, id: Uuid) -> CoreResult<bool>;

    async fn insert_elastic_ip(&self, address: &str) -> CoreResult<ElasticIp>;
    async fn list_elastic_ips(&self) -> CoreResult<Vec<ElasticIp>>;
    /// `None` unassociates. `Conflict` when associating an already associated address.
    async fn associate_elastic_ip(&self, id: Uuid, instance_id: Option<Uuid>) -> CoreResult<Option<ElasticIp>>;
    async fn delete_elastic_ip(&self, id: Uuid) -> CoreResult<bool>;
}

#[async_trait]
pub trait VolumeStore: Send + Sync {
    async fn insert_volume(&self, name: &str, size_gb: i32) -> CoreResult<Volume>;
    async fn get_volume(&self, id: Uuid) -> CoreResult<Option<Volume>>;
    async fn list_volumes(&self) -> CoreResult<Vec<Volume>>;
    async fn update_volume(&self, id: Uuid, status: VolumeStatus, backend_path: Option<&str>) -> CoreResult<()>;
    /// Attaches only when the volume is free; `false` when someone else holds it.
    async fn attach_volume(&self, id: Uuid, instance_id: Uuid) -> CoreResult<bool>;
    async fn detach_volume(&self, id: Uuid) -> CoreResult<()>;
    async fn volumes_for_instance(&self, instance_id: Uuid) -> CoreResult<Vec<Volume>>;
    async fn delete_volume(&self, id: Uuid) -> CoreResult<bool>;

    async fn insert_snapshot(&self, volume_id: Uuid, name: &str) -> CoreResult<Snapshot>;
    async fn get_snapshot(&self, id: Uuid) -> CoreResult<Option<Snapshot>>;
    async fn list_snapshots(&self, volume_id: Option<Uuid>) -> CoreResult<Vec<Snapshot>>;
    async fn update_snapshot(&self, id: Uuid, status: SnapshotStatus, backend_path: Option<&str>) -> CoreResult<()>;
}

#[async_trait]
pub trait LoadBalancerStore: Send + Sync {
    async fn insert_lb(&self, name: &str, port: i32, algorithm: LbAlgorithm) -> CoreResult<LoadBalancer>;
    async fn get_lb(&self, id: Uuid) -> CoreResult<Option<LoadBalancer>>;
    async fn list_lbs(&self) -> CoreResult<Vec<LoadBalancer>>;
    async fn set_lb_proxy(&self, id: Uuid, proxy_id: &str) -> CoreResult<()>;
    async fn mark_lb_deleting(&self, id: Uuid) -> CoreResult<bool>;
    async fn delete_lb(&self, id: Uuid) -> CoreResult<()>;

    async fn upsert_target(&self, target: &LbTarget) -> CoreResult<()>;
    async fn remove_target(&self, lb_id: Uuid, instance_id: Uuid) -> CoreResult<bool>;
    async fn list_targets(&self, lb_id: Uuid) -> CoreResult<Vec<TargetView>>;
}

#[async_trait]
pub trait ScalingStore: Send + Sync {
    async fn insert_group(&self, new: &NewScalingGroup) -> CoreResult<ScalingGroup>;
    async fn get_group(&self, id: Uuid) -> CoreResult<Option<ScalingGroup>>;
    async fn list_groups(&self) -> CoreResult<Vec<ScalingGroup>>;
    async fn set_desired(&self, id: Uuid, desired: i32) -> CoreResult<()>;
    async fn mark_group_deleting(&self, id: Uuid) -> CoreResult<bool>;
    async fn delete_group(&self, id: Uuid) -> CoreResult<()>;

    async fn insert_policy(&self, new: &NewScalingPolicy) -> CoreResult<ScalingPolicy>;
    async fn list_policies(&self, group_id: Uuid) -> CoreResult<Vec<ScalingPolicy>>;
    async fn stamp_policy(&self, id: Uuid, at: DateTime<Utc>) -> CoreResult<()>;
}

/// Read side of the metrics collaborator consulted by the autoscaler.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn record_metric(&self, instance_id: Uuid, metric_type: &str, value: f64) -> CoreResult<()>;

    /// Average over the group's members of each member's most recent sample.
    async fn metric_for_group(&self, group_id: Uuid, metric_type: &str) -> CoreResult<Option<f64>>;
}

#[async_trait]
pub trait CronStore: Send + Sync {
    async fn insert_cron(&self, name: &str, schedule: &str, target: &CronTarget) -> CoreResult<CronJob>;
    async fn get_cron(&self, id: Uuid) -> CoreResult<Option<CronJob>>;
    async fn list_cron(&self) -> CoreResult<Vec<CronJob>>;
    async fn set_cron_paused(&self, id: Uuid, paused: bool) -> CoreResult<Option<CronJob>>;
    async fn stamp_cron(&self, id: Uuid, at: DateTime<Utc>) -> CoreResult<()>;
    async fn delete_cron(&self, id: Uuid) -> CoreResult<bool>;
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn insert_deployment(
        &self,
        name: &str,
        replicas: i32,
        template: &LaunchTemplate,
        vpc_id: Option<Uuid>,
    ) -> CoreResult<ContainerDeployment>;
    async fn get_deployment(&self, id: Uuid) -> CoreResult<Option<ContainerDeployment>>;
    async fn list_deployments(&self) -> CoreResult<Vec<ContainerDeployment>>;
    async fn set_desired_replicas(&self, id: Uuid, replicas: i32) -> CoreResult<Option<ContainerDeployment>>;
    async fn set_current_replicas(&self, id: Uuid, replicas: i32) -> CoreResult<()>;
}

#[async_trait]
pub trait DnsStore: Send + Sync {
    async fn insert_zone(&self, name: &str, vpc_id: Option<Uuid>, backend_zone_id: Option<&str>) -> CoreResult<DnsZone>;
    async fn get_zone(&self, id: Uuid) -> CoreResult<Option<DnsZone>>;
    async fn list_zones(&self) -> CoreResult<Vec<DnsZone>>;
    async fn zone_for_vpc(&self, vpc_id: Uuid) -> CoreResult<Option<DnsZone>>;
    async fn delete_zone(&self, id: Uuid) -> CoreResult<bool>;

    async fn insert_record(&self, new: &NewDnsRecord) -> CoreResult<DnsRecord>;
    async fn get_record(&self, id: Uuid) -> CoreResult<Option<DnsRecord>>;
    async fn list_records(&self, zone_id: Uuid) -> CoreResult<Vec<DnsRecord>>;
    async fn update_record_content(&self, id: Uuid, content: &str) -> CoreResult<()>;
    async fn delete_record(&self, id: Uuid) -> CoreResult<bool>;
    async fn auto_records(&self) -> CoreResult<Vec<DnsRecord>>;
    async fn auto_records_for(&self, instance_id: Uuid) -> CoreResult<Vec<DnsRecord>>;
}

/// Everything the control plane persists.
#[async_trait]
pub trait Store:
    InstanceStore
    + NetworkStore
    + VolumeStore
    + LoadBalancerStore
    + ScalingStore
    + MetricsSource
    + CronStore
    + DeploymentStore
    + DnsStore
{
    /// Readiness check.
    async fn ping(&self) -> CoreResult<()>;
}
