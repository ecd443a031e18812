//! In-process store. Backs the test suites and `DATABASE_URL=memory://`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use nimbus_common::{
    ContainerDeployment, CoreError, CoreResult, CronJob, CronTarget, DnsRecord, DnsZone,
    ElasticIp, ElasticIpStatus, Instance, InstanceState, InstanceStateChange, LaunchTemplate,
    LbAlgorithm, LbTarget, LoadBalancer, NewInstance, ResourceStatus, ScalingGroup,
    ScalingPolicy, SecurityGroup, SecurityRule, Snapshot, SnapshotStatus, Subnet, Volume,
    VolumeStatus, Vpc,
};
use sqlx::types::Json;
use uuid::Uuid;

use super::{
    CronStore, DeploymentStore, DnsStore, InstanceFilter, InstancePatch, InstanceStore,
    LoadBalancerStore, MetricsSource, NetworkStore, NewDnsRecord, NewScalingGroup,
    NewScalingPolicy, ScalingStore, Store, TargetView, VolumeStore,
};

/// Samples older than this are ignored by `metric_for_group`.
const METRIC_WINDOW_SECS: i64 = 300;

#[derive(Default)]
struct Tables {
    instances: HashMap<Uuid, Instance>,
    history: Vec<InstanceStateChange>,
    vpcs: HashMap<Uuid, Vpc>,
    subnets: HashMap<Uuid, Subnet>,
    security_groups: HashMap<Uuid, SecurityGroup>,
    elastic_ips: HashMap<Uuid, ElasticIp>,
    volumes: HashMap<Uuid, Volume>,
    snapshots: HashMap<Uuid, Snapshot>,
    lbs: HashMap<Uuid, LoadBalancer>,
    targets: Vec<LbTarget>,
    groups: HashMap<Uuid, ScalingGroup>,
    policies: HashMap<Uuid, ScalingPolicy>,
    metrics: Vec<(Uuid, String, f64, DateTime<Utc>)>,
    cron: HashMap<Uuid, CronJob>,
    deployments: HashMap<Uuid, ContainerDeployment>,
    zones: HashMap<Uuid, DnsZone>,
    records: HashMap<Uuid, DnsRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Test hook: rewrites an instance's creation time.
    pub fn backdate_instance(&self, id: Uuid, created_at: DateTime<Utc>) {
        if let Some(i) = self.lock().instances.get_mut(&id) {
            i.created_at = created_at;
        }
    }
}

fn sorted_by_created<T: Clone>(items: impl Iterator<Item = T>, key: impl Fn(&T) -> DateTime<Utc>) -> Vec<T> {
    let mut v: Vec<T> = items.collect();
    v.sort_by_key(|x| key(x));
    v
}

fn live(i: &Instance) -> bool {
    !i.state.is_terminal()
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_instance(&self, new: &NewInstance) -> CoreResult<Instance> {
        let now = Utc::now();
        let inst = Instance {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            image: new.image.clone(),
            vcpus: new.vcpus,
            memory_mb: new.memory_mb,
            vpc_id: new.vpc_id,
            subnet_id: new.subnet_id,
            state: InstanceState::Pending,
            private_ip: None,
            port_map: Json(new.port_map.clone()),
            backend_handle: None,
            scaling_group_id: new.scaling_group_id,
            deployment_id: new.deployment_id,
            error_message: None,
            created_at: now,
            updated_at: now,
            terminated_at: None,
        };
        self.lock().instances.insert(inst.id, inst.clone());
        Ok(inst)
    }

    async fn get_instance(&self, id: Uuid) -> CoreResult<Option<Instance>> {
        Ok(self.lock().instances.get(&id).cloned())
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> CoreResult<Vec<Instance>> {
        let t = self.lock();
        Ok(sorted_by_created(
            t.instances.values().filter(|i| filter.matches(i)).cloned(),
            |i| i.created_at,
        ))
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[InstanceState],
        to: InstanceState,
        patch: &InstancePatch,
        reason: &str,
    ) -> CoreResult<Option<Instance>> {
        let mut t = self.lock();
        let Some(inst) = t.instances.get_mut(&id) else {
            return Ok(None);
        };
        if !from.contains(&inst.state) {
            return Ok(None);
        }
        let prev = inst.state;
        let now = Utc::now();
        inst.state = to;
        inst.updated_at = now;
        if let Some(h) = &patch.backend_handle {
            inst.backend_handle = Some(h.clone());
        }
        if let Some(ip) = &patch.private_ip {
            inst.private_ip = Some(ip.clone());
        }
        if let Some(msg) = &patch.error_message {
            inst.error_message = Some(msg.clone());
        }
        if to == InstanceState::Terminated {
            inst.terminated_at = Some(now);
        }
        let updated = inst.clone();
        t.history.push(InstanceStateChange {
            instance_id: id,
            from_state: prev,
            to_state: to,
            reason: reason.to_string(),
            created_at: now,
        });
        Ok(Some(updated))
    }

    async fn set_private_ip(&self, id: Uuid, ip: &str) -> CoreResult<()> {
        if let Some(i) = self.lock().instances.get_mut(&id) {
            i.private_ip = Some(ip.to_string());
            i.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_backend_handle(&self, id: Uuid, handle: &str) -> CoreResult<()> {
        if let Some(i) = self.lock().instances.get_mut(&id) {
            i.backend_handle = Some(handle.to_string());
            i.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn state_history(&self, id: Uuid) -> CoreResult<Vec<InstanceStateChange>> {
        Ok(self.lock().history.iter().filter(|h| h.instance_id == id).cloned().collect())
    }

    async fn stale_pending(&self, before: DateTime<Utc>) -> CoreResult<Vec<Instance>> {
        let t = self.lock();
        Ok(sorted_by_created(
            t.instances
                .values()
                .filter(|i| i.state == InstanceState::Pending && i.created_at < before)
                .cloned(),
            |i| i.created_at,
        ))
    }

    async fn stale_starting(&self, before: DateTime<Utc>) -> CoreResult<Vec<Instance>> {
        let t = self.lock();
        Ok(sorted_by_created(
            t.instances
                .values()
                .filter(|i| i.state == InstanceState::Starting && i.updated_at < before)
                .cloned(),
            |i| i.updated_at,
        ))
    }
}

#[async_trait]
impl NetworkStore for MemoryStore {
    async fn insert_vpc(&self, name: &str, cidr: &str) -> CoreResult<Vpc> {
        let mut t = self.lock();
        if t.vpcs.values().any(|v| v.name == name) {
            return Err(CoreError::Conflict(format!("vpc {name} already exists")));
        }
        let vpc = Vpc {
            id: Uuid::new_v4(),
            name: name.to_string(),
            cidr: cidr.to_string(),
            network_handle: None,
            created_at: Utc::now(),
        };
        t.vpcs.insert(vpc.id, vpc.clone());
        Ok(vpc)
    }

    async fn get_vpc(&self, id: Uuid) -> CoreResult<Option<Vpc>> {
        Ok(self.lock().vpcs.get(&id).cloned())
    }

    async fn list_vpcs(&self) -> CoreResult<Vec<Vpc>> {
        Ok(sorted_by_created(self.lock().vpcs.values().cloned(), |v| v.created_at))
    }

    async fn set_vpc_network_handle(&self, id: Uuid, handle: &str) -> CoreResult<()> {
        if let Some(v) = self.lock().vpcs.get_mut(&id) {
            v.network_handle = Some(handle.to_string());
        }
        Ok(())
    }

    async fn delete_vpc(&self, id: Uuid) -> CoreResult<bool> {
        let mut t = self.lock();
        if !t.vpcs.contains_key(&id) {
            return Ok(false);
        }
        let busy = t.subnets.values().any(|s| s.vpc_id == id)
            || t.zones.values().any(|z| z.vpc_id == Some(id))
            || t.instances.values().any(|i| i.vpc_id == Some(id) && live(i));
        if busy {
            return Err(CoreError::Conflict("vpc still owns resources".into()));
        }
        t.security_groups.retain(|_, sg| sg.vpc_id != id);
        Ok(t.vpcs.remove(&id).is_some())
    }

    async fn insert_subnet(&self, vpc_id: Uuid, name: &str, cidr: &str, gateway: &str) -> CoreResult<Subnet> {
        let mut t = self.lock();
        if !t.vpcs.contains_key(&vpc_id) {
            return Err(CoreError::not_found(format!("vpc {vpc_id}")));
        }
        if t.subnets.values().any(|s| s.vpc_id == vpc_id && s.name == name) {
            return Err(CoreError::Conflict(format!("subnet {name} already exists")));
        }
        let subnet = Subnet {
            id: Uuid::new_v4(),
            vpc_id,
            name: name.to_string(),
            cidr: cidr.to_string(),
            gateway: gateway.to_string(),
            created_at: Utc::now(),
        };
        t.subnets.insert(subnet.id, subnet.clone());
        Ok(subnet)
    }

    async fn get_subnet(&self, id: Uuid) -> CoreResult<Option<Subnet>> {
        Ok(self.lock().subnets.get(&id).cloned())
    }

    async fn list_subnets(&self, vpc_id: Uuid) -> CoreResult<Vec<Subnet>> {
        let t = self.lock();
        Ok(sorted_by_created(
            t.subnets.values().filter(|s| s.vpc_id == vpc_id).cloned(),
            |s| s.created_at,
        ))
    }

    async fn delete_subnet(&self, id: Uuid) -> CoreResult<bool> {
        let mut t = self.lock();
        if t.instances.values().any(|i| i.subnet_id == Some(id) && live(i)) {
            return Err(CoreError::Conflict("subnet still has instances".into()));
        }
        Ok(t.subnets.remove(&id).is_some())
    }

    async fn insert_security_group(&self, vpc_id: Uuid, name: &str, rules: &[SecurityRule]) -> CoreResult<SecurityGroup> {
        let mut t = self.lock();
        if !t.vpcs.contains_key(&vpc_id) {
            return Err(CoreError::not_found(format!("vpc {vpc_id}")));
        }
        let sg = SecurityGroup {
            id: Uuid::new_v4(),
            vpc_id,
            name: name.to_string(),
            rules: Json(rules.to_vec()),
            created_at: Utc::now(),
        };
        t.security_groups.insert(sg.id, sg.clone());
        Ok(sg)
    }

    async fn list_security_groups(&self, vpc_id: Uuid) -> CoreResult<Vec<SecurityGroup>> {
        let t = self.lock();
        Ok(sorted_by_created(
            t.security_groups.values().filter(|s| s.vpc_id == vpc_id).cloned(),
            |s| s.created_at,
        ))
    }

    async fn delete_security_group(&self, id: Uuid) -> CoreResult<bool> {
        Ok(self.lock().security_groups.remove(&id).is_some())
    }

    async fn insert_elastic_ip(&self, address: &str) -> CoreResult<ElasticIp> {
        let mut t = self.lock();
        if t.elastic_ips.values().any(|e| e.address == address) {
            return Err(CoreError::Conflict(format!("address {address} already allocated")));
        }
        let eip = ElasticIp {
            id: Uuid::new_v4(),
            address: address.to_string(),
            status: ElasticIpStatus::Allocated,
            instance_id: None,
            created_at: Utc::now(),
        };
        t.elastic_ips.insert(eip.id, eip.clone());
        Ok(eip)
    }

    async fn list_elastic_ips(&self) -> CoreResult<Vec<ElasticIp>> {
        Ok(sorted_by_created(self.lock().elastic_ips.values().cloned(), |e| e.created_at))
    }

    async fn associate_elastic_ip(&self, id: Uuid, instance_id: Option<Uuid>) -> CoreResult<Option<ElasticIp>> {
        let mut t = self.lock();
        let Some(eip) = t.elastic_ips.get_mut(&id) else {
            return Ok(None);
        };
        match instance_id {
            Some(_) if eip.instance_id.is_some() => {
                Err(CoreError::Conflict(format!("address {} is already associated", eip.address)))
            }
            Some(iid) => {
                eip.instance_id = Some(iid);
                eip.status = ElasticIpStatus::Associated;
                Ok(Some(eip.clone()))
            }
            None => {
                eip.instance_id = None;
                eip.status = ElasticIpStatus::Allocated;
                Ok(Some(eip.clone()))
            }
        }
    }

    async fn delete_elastic_ip(&self, id: Uuid) -> CoreResult<bool> {
        let mut t = self.lock();
        if t.elastic_ips.get(&id).is_some_and(|e| e.instance_id.is_some()) {
            return Err(CoreError::Conflict("address is associated".into()));
        }
        Ok(t.elastic_ips.remove(&id).is_some())
    }
}

#[async_trait]
impl VolumeStore for MemoryStore {
    async fn insert_volume(&self, name: &str, size_gb: i32) -> CoreResult<Volume> {
        let mut t = self.lock();
        if t.volumes.values().any(|v| v.name == name && v.status != VolumeStatus::Deleted) {
            return Err(CoreError::Conflict(format!("volume {name} already exists")));
        }
        let vol = Volume {
            id: Uuid::new_v4(),
            name: name.to_string(),
            size_gb,
            backend_path: None,
            status: VolumeStatus::Creating,
            instance_id: None,
            created_at: Utc::now(),
        };
        t.volumes.insert(vol.id, vol.clone());
        Ok(vol)
    }

    async fn get_volume(&self, id: Uuid) -> CoreResult<Option<Volume>> {
        Ok(self.lock().volumes.get(&id).cloned())
    }

    async fn list_volumes(&self) -> CoreResult<Vec<Volume>> {
        Ok(sorted_by_created(self.lock().volumes.values().cloned(), |v| v.created_at))
    }

    async fn update_volume(&self, id: Uuid, status: VolumeStatus, backend_path: Option<&str>) -> CoreResult<()> {
        if let Some(v) = self.lock().volumes.get_mut(&id) {
            v.status = status;
            if let Some(p) = backend_path {
                v.backend_path = Some(p.to_string());
            }
        }
        Ok(())
    }

    async fn attach_volume(&self, id: Uuid, instance_id: Uuid) -> CoreResult<bool> {
        let mut t = self.lock();
        match t.volumes.get_mut(&id) {
            Some(v) if v.instance_id.is_none() => {
                v.instance_id = Some(instance_id);
                v.status = VolumeStatus::InUse;
                Ok(true)
            }
            Some(v) => Ok(v.instance_id == Some(instance_id)),
            None => Err(CoreError::not_found(format!("volume {id}"))),
        }
    }

    async fn detach_volume(&self, id: Uuid) -> CoreResult<()> {
        if let Some(v) = self.lock().volumes.get_mut(&id) {
            v.instance_id = None;
            if v.status == VolumeStatus::InUse {
                v.status = VolumeStatus::Available;
            }
        }
        Ok(())
    }

    async fn volumes_for_instance(&self, instance_id: Uuid) -> CoreResult<Vec<Volume>> {
        let t = self.lock();
        Ok(sorted_by_created(
            t.volumes.values().filter(|v| v.instance_id == Some(instance_id)).cloned(),
            |v| v.created_at,
        ))
    }

    async fn delete_volume(&self, id: Uuid) -> CoreResult<bool> {
        let mut t = self.lock();
        t.snapshots.retain(|_, s| s.volume_id != id);
        Ok(t.volumes.remove(&id).is_some())
    }

    async fn insert_snapshot(&self, volume_id: Uuid, name: &str) -> CoreResult<Snapshot> {
        let mut t = self.lock();
        if !t.volumes.contains_key(&volume_id) {
            return Err(CoreError::not_found(format!("volume {volume_id}")));
        }
        let snap = Snapshot {
            id: Uuid::new_v4(),
            volume_id,
            name: name.to_string(),
            backend_path: None,
            status: SnapshotStatus::Creating,
            created_at: Utc::now(),
        };
        t.snapshots.insert(snap.id, snap.clone());
        Ok(snap)
    }

    async fn get_snapshot(&self, id: Uuid) -> CoreResult<Option<Snapshot>> {
        Ok(self.lock().snapshots.get(&id).cloned())
    }

    async fn list_snapshots(&self, volume_id: Option<Uuid>) -> CoreResult<Vec<Snapshot>> {
        let t = self.lock();
        Ok(sorted_by_created(
            t.snapshots
                .values()
                .filter(|s| volume_id.map_or(true, |v| s.volume_id == v))
                .cloned(),
            |s| s.created_at,
        ))
    }

    async fn update_snapshot(&self, id: Uuid, status: SnapshotStatus, backend_path: Option<&str>) -> CoreResult<()> {
        if let Some(s) = self.lock().snapshots.get_mut(&id) {
            s.status = status;
            if let Some(p) = backend_path {
                s.backend_path = Some(p.to_string());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerStore for MemoryStore {
    async fn insert_lb(&self, name: &str, port: i32, algorithm: LbAlgorithm) -> CoreResult<LoadBalancer> {
        let mut t = self.lock();
        if t.lbs.values().any(|l| l.port == port && l.status == ResourceStatus::Active) {
            return Err(CoreError::Conflict(format!("listener port {port} is taken")));
        }
        let lb = LoadBalancer {
            id: Uuid::new_v4(),
            name: name.to_string(),
            port,
            algorithm,
            proxy_id: None,
            status: ResourceStatus::Active,
            created_at: Utc::now(),
        };
        t.lbs.insert(lb.id, lb.clone());
        Ok(lb)
    }

    async fn get_lb(&self, id: Uuid) -> CoreResult<Option<LoadBalancer>> {
        Ok(self.lock().lbs.get(&id).cloned())
    }

    async fn list_lbs(&self) -> CoreResult<Vec<LoadBalancer>> {
        Ok(sorted_by_created(self.lock().lbs.values().cloned(), |l| l.created_at))
    }

    async fn set_lb_proxy(&self, id: Uuid, proxy_id: &str) -> CoreResult<()> {
        if let Some(l) = self.lock().lbs.get_mut(&id) {
            l.proxy_id = Some(proxy_id.to_string());
        }
        Ok(())
    }

    async fn mark_lb_deleting(&self, id: Uuid) -> CoreResult<bool> {
        match self.lock().lbs.get_mut(&id) {
            Some(l) => {
                l.status = ResourceStatus::Deleting;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_lb(&self, id: Uuid) -> CoreResult<()> {
        let mut t = self.lock();
        t.targets.retain(|x| x.lb_id != id);
        t.lbs.remove(&id);
        Ok(())
    }

    async fn upsert_target(&self, target: &LbTarget) -> CoreResult<()> {
        let mut t = self.lock();
        if !t.lbs.contains_key(&target.lb_id) {
            return Err(CoreError::not_found(format!("load balancer {}", target.lb_id)));
        }
        if !t.instances.contains_key(&target.instance_id) {
            return Err(CoreError::not_found(format!("instance {}", target.instance_id)));
        }
        match t
            .targets
            .iter_mut()
            .find(|x| x.lb_id == target.lb_id && x.instance_id == target.instance_id)
        {
            Some(existing) => *existing = target.clone(),
            None => t.targets.push(target.clone()),
        }
        Ok(())
    }

    async fn remove_target(&self, lb_id: Uuid, instance_id: Uuid) -> CoreResult<bool> {
        let mut t = self.lock();
        let before = t.targets.len();
        t.targets.retain(|x| !(x.lb_id == lb_id && x.instance_id == instance_id));
        Ok(t.targets.len() != before)
    }

    async fn list_targets(&self, lb_id: Uuid) -> CoreResult<Vec<TargetView>> {
        let t = self.lock();
        Ok(t.targets
            .iter()
            .filter(|x| x.lb_id == lb_id)
            .filter_map(|x| {
                let inst = t.instances.get(&x.instance_id)?;
                Some(TargetView {
                    target: x.clone(),
                    state: inst.state,
                    backend_handle: inst.backend_handle.clone(),
                    private_ip: inst.private_ip.clone(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl ScalingStore for MemoryStore {
    async fn insert_group(&self, new: &NewScalingGroup) -> CoreResult<ScalingGroup> {
        let mut t = self.lock();
        if t.groups.values().any(|g| g.name == new.name) {
            return Err(CoreError::Conflict(format!("scaling group {} already exists", new.name)));
        }
        let group = ScalingGroup {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            vpc_id: new.vpc_id,
            min_size: new.min_size,
            max_size: new.max_size,
            desired: new.desired,
            launch_template: Json(new.launch_template.clone()),
            status: ResourceStatus::Active,
            created_at: Utc::now(),
        };
        t.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn get_group(&self, id: Uuid) -> CoreResult<Option<ScalingGroup>> {
        Ok(self.lock().groups.get(&id).cloned())
    }

    async fn list_groups(&self) -> CoreResult<Vec<ScalingGroup>> {
        Ok(sorted_by_created(self.lock().groups.values().cloned(), |g| g.created_at))
    }

    async fn set_desired(&self, id: Uuid, desired: i32) -> CoreResult<()> {
        if let Some(g) = self.lock().groups.get_mut(&id) {
            g.desired = desired;
        }
        Ok(())
    }

    async fn mark_group_deleting(&self, id: Uuid) -> CoreResult<bool> {
        match self.lock().groups.get_mut(&id) {
            Some(g) => {
                g.status = ResourceStatus::Deleting;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_group(&self, id: Uuid) -> CoreResult<()> {
        let mut t = self.lock();
        t.policies.retain(|_, p| p.group_id != id);
        t.groups.remove(&id);
        Ok(())
    }

    async fn insert_policy(&self, new: &NewScalingPolicy) -> CoreResult<ScalingPolicy> {
        let mut t = self.lock();
        if !t.groups.contains_key(&new.group_id) {
            return Err(CoreError::not_found(format!("scaling group {}", new.group_id)));
        }
        let policy = ScalingPolicy {
            id: Uuid::new_v4(),
            group_id: new.group_id,
            metric_type: new.metric_type.clone(),
            target_value: new.target_value,
            scale_out_step: new.scale_out_step,
            scale_in_step: new.scale_in_step,
            cooldown_secs: new.cooldown_secs,
            last_fired_at: None,
        };
        t.policies.insert(policy.id, policy.clone());
        Ok(policy)
    }

    async fn list_policies(&self, group_id: Uuid) -> CoreResult<Vec<ScalingPolicy>> {
        let t = self.lock();
        let mut v: Vec<ScalingPolicy> = t.policies.values().filter(|p| p.group_id == group_id).cloned().collect();
        v.sort_by_key(|p| p.id);
        Ok(v)
    }

    async fn stamp_policy(&self, id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        if let Some(p) = self.lock().policies.get_mut(&id) {
            p.last_fired_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsSource for MemoryStore {
    async fn record_metric(&self, instance_id: Uuid, metric_type: &str, value: f64) -> CoreResult<()> {
        self.lock().metrics.push((instance_id, metric_type.to_string(), value, Utc::now()));
        Ok(())
    }

    async fn metric_for_group(&self, group_id: Uuid, metric_type: &str) -> CoreResult<Option<f64>> {
        let t = self.lock();
        let horizon = Utc::now() - Duration::seconds(METRIC_WINDOW_SECS);
        let mut latest: HashMap<Uuid, (DateTime<Utc>, f64)> = HashMap::new();
        for (iid, kind, value, at) in &t.metrics {
            if kind != metric_type || *at < horizon {
                continue;
            }
            let member = t
                .instances
                .get(iid)
                .is_some_and(|i| i.scaling_group_id == Some(group_id) && i.state.is_active());
            if !member {
                continue;
            }
            let e = latest.entry(*iid).or_insert((*at, *value));
            if *at >= e.0 {
                *e = (*at, *value);
            }
        }
        if latest.is_empty() {
            return Ok(None);
        }
        let sum: f64 = latest.values().map(|(_, v)| v).sum();
        Ok(Some(sum / latest.len() as f64))
    }
}

#[async_trait]
impl CronStore for MemoryStore {
    async fn insert_cron(&self, name: &str, schedule: &str, target: &CronTarget) -> CoreResult<CronJob> {
        let mut t = self.lock();
        if t.cron.values().any(|c| c.name == name) {
            return Err(CoreError::Conflict(format!("cron job {name} already exists")));
        }
        let job = CronJob {
            id: Uuid::new_v4(),
            name: name.to_string(),
            schedule: schedule.to_string(),
            target: Json(target.clone()),
            paused: false,
            last_fired_at: None,
            created_at: Utc::now(),
        };
        t.cron.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_cron(&self, id: Uuid) -> CoreResult<Option<CronJob>> {
        Ok(self.lock().cron.get(&id).cloned())
    }

    async fn list_cron(&self) -> CoreResult<Vec<CronJob>> {
        Ok(sorted_by_created(self.lock().cron.values().cloned(), |c| c.created_at))
    }

    async fn set_cron_paused(&self, id: Uuid, paused: bool) -> CoreResult<Option<CronJob>> {
        Ok(self.lock().cron.get_mut(&id).map(|c| {
            c.paused = paused;
            c.clone()
        }))
    }

    async fn stamp_cron(&self, id: Uuid, at: DateTime<Utc>) -> CoreResult<()> {
        if let Some(c) = self.lock().cron.get_mut(&id) {
            c.last_fired_at = Some(at);
        }
        Ok(())
    }

    async fn delete_cron(&self, id: Uuid) -> CoreResult<bool> {
        Ok(self.lock().cron.remove(&id).is_some())
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn insert_deployment(
        &self,
        name: &str,
        replicas: i32,
        template: &LaunchTemplate,
        vpc_id: Option<Uuid>,
    ) -> CoreResult<ContainerDeployment> {
        let mut t = self.lock();
        if t.deployments.values().any(|d| d.name == name) {
            return Err(CoreError::Conflict(format!("deployment {name} already exists")));
        }
        let dep = ContainerDeployment {
            id: Uuid::new_v4(),
            name: name.to_string(),
            desired_replicas: replicas,
            current_replicas: 0,
            template: Json(template.clone()),
            vpc_id,
            created_at: Utc::now(),
        };
        t.deployments.insert(dep.id, dep.clone());
        Ok(dep)
    }

    async fn get_deployment(&self, id: Uuid) -> CoreResult<Option<ContainerDeployment>> {
        Ok(self.lock().deployments.get(&id).cloned())
    }

    async fn list_deployments(&self) -> CoreResult<Vec<ContainerDeployment>> {
        Ok(sorted_by_created(self.lock().deployments.values().cloned(), |d| d.created_at))
    }

    async fn set_desired_replicas(&self, id: Uuid, replicas: i32) -> CoreResult<Option<ContainerDeployment>> {
        Ok(self.lock().deployments.get_mut(&id).map(|d| {
            d.desired_replicas = replicas;
            d.clone()
        }))
    }

    async fn set_current_replicas(&self, id: Uuid, replicas: i32) -> CoreResult<()> {
        if let Some(d) = self.lock().deployments.get_mut(&id) {
            d.current_replicas = replicas;
        }
        Ok(())
    }
}

#[async_trait]
impl DnsStore for MemoryStore {
    async fn insert_zone(&self, name: &str, vpc_id: Option<Uuid>, backend_zone_id: Option<&str>) -> CoreResult<DnsZone> {
        let mut t = self.lock();
        if t.zones.values().any(|z| z.name == name) {
            return Err(CoreError::Conflict(format!("zone {name} already exists")));
        }
        if let Some(v) = vpc_id {
            if !t.vpcs.contains_key(&v) {
                return Err(CoreError::not_found(format!("vpc {v}")));
            }
            if t.zones.values().any(|z| z.vpc_id == Some(v)) {
                return Err(CoreError::Conflict("vpc already owns a zone".into()));
            }
        }
        let zone = DnsZone {
            id: Uuid::new_v4(),
            name: name.to_string(),
            vpc_id,
            backend_zone_id: backend_zone_id.map(str::to_string),
            created_at: Utc::now(),
        };
        t.zones.insert(zone.id, zone.clone());
        Ok(zone)
    }

    async fn get_zone(&self, id: Uuid) -> CoreResult<Option<DnsZone>> {
        Ok(self.lock().zones.get(&id).cloned())
    }

    async fn list_zones(&self) -> CoreResult<Vec<DnsZone>> {
        Ok(sorted_by_created(self.lock().zones.values().cloned(), |z| z.created_at))
    }

    async fn zone_for_vpc(&self, vpc_id: Uuid) -> CoreResult<Option<DnsZone>> {
        Ok(self.lock().zones.values().find(|z| z.vpc_id == Some(vpc_id)).cloned())
    }

    async fn delete_zone(&self, id: Uuid) -> CoreResult<bool> {
        let mut t = self.lock();
        t.records.retain(|_, r| r.zone_id != id);
        Ok(t.zones.remove(&id).is_some())
    }

    async fn insert_record(&self, new: &NewDnsRecord) -> CoreResult<DnsRecord> {
        let mut t = self.lock();
        if !t.zones.contains_key(&new.zone_id) {
            return Err(CoreError::not_found(format!("zone {}", new.zone_id)));
        }
        let dup = t.records.values().any(|r| {
            r.zone_id == new.zone_id && r.name == new.name && r.record_type == new.record_type && r.content == new.content
        });
        if dup {
            return Err(CoreError::Conflict(format!("record {} already exists", new.name)));
        }
        let rec = DnsRecord {
            id: Uuid::new_v4(),
            zone_id: new.zone_id,
            name: new.name.clone(),
            record_type: new.record_type,
            content: new.content.clone(),
            ttl: new.ttl,
            auto_managed: new.auto_managed,
            instance_id: new.instance_id,
            created_at: Utc::now(),
        };
        t.records.insert(rec.id, rec.clone());
        Ok(rec)
    }

    async fn get_record(&self, id: Uuid) -> CoreResult<Option<DnsRecord>> {
        Ok(self.lock().records.get(&id).cloned())
    }

    async fn list_records(&self, zone_id: Uuid) -> CoreResult<Vec<DnsRecord>> {
        let t = self.lock();
        Ok(sorted_by_created(
            t.records.values().filter(|r| r.zone_id == zone_id).cloned(),
            |r| r.created_at,
        ))
    }

    async fn update_record_content(&self, id: Uuid, content: &str) -> CoreResult<()> {
        if let Some(r) = self.lock().records.get_mut(&id) {
            r.content = content.to_string();
        }
        Ok(())
    }

    async fn delete_record(&self, id: Uuid) -> CoreResult<bool> {
        Ok(self.lock().records.remove(&id).is_some())
    }

    async fn auto_records(&self) -> CoreResult<Vec<DnsRecord>> {
        let t = self.lock();
        Ok(sorted_by_created(
            t.records.values().filter(|r| r.auto_managed).cloned(),
            |r| r.created_at,
        ))
    }

    async fn auto_records_for(&self, instance_id: Uuid) -> CoreResult<Vec<DnsRecord>> {
        let t = self.lock();
        Ok(t.records
            .values()
            .filter(|r| r.auto_managed && r.instance_id == Some(instance_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_instance(name: &str) -> NewInstance {
        NewInstance {
            name: name.into(),
            image: "alpine".into(),
            vcpus: 1,
            memory_mb: 256,
            vpc_id: None,
            subnet_id: None,
            port_map: vec![],
            scaling_group_id: None,
            deployment_id: None,
        }
    }

    #[tokio::test]
    async fn transition_is_guarded_and_recorded() {
        let store = MemoryStore::new();
        let inst = store.insert_instance(&new_instance("a")).await.unwrap();

        let moved = store
            .transition(inst.id, &[InstanceState::Pending], InstanceState::Starting, &InstancePatch::default(), "launch")
            .await
            .unwrap();
        assert_eq!(moved.map(|i| i.state), Some(InstanceState::Starting));

        let again = store
            .transition(inst.id, &[InstanceState::Pending], InstanceState::Starting, &InstancePatch::default(), "launch")
            .await
            .unwrap();
        assert!(again.is_none());

        let history = store.state_history(inst.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_state, InstanceState::Pending);
    }

    #[tokio::test]
    async fn vpc_with_subnet_cannot_be_deleted() {
        let store = MemoryStore::new();
        let vpc = store.insert_vpc("prod", "10.0.0.0/16").await.unwrap();
        store.insert_subnet(vpc.id, "a", "10.0.1.0/24", "10.0.1.1").await.unwrap();

        assert!(matches!(store.delete_vpc(vpc.id).await, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn group_metric_averages_latest_samples() {
        let store = MemoryStore::new();
        let group = store
            .insert_group(&NewScalingGroup {
                name: "g".into(),
                vpc_id: None,
                min_size: 1,
                max_size: 3,
                desired: 1,
                launch_template: LaunchTemplate::default(),
            })
            .await
            .unwrap();
        let mut a = new_instance("a");
        a.scaling_group_id = Some(group.id);
        let mut b = new_instance("b");
        b.scaling_group_id = Some(group.id);
        let a = store.insert_instance(&a).await.unwrap();
        let b = store.insert_instance(&b).await.unwrap();

        store.record_metric(a.id, "cpu", 10.0).await.unwrap();
        store.record_metric(a.id, "cpu", 80.0).await.unwrap();
        store.record_metric(b.id, "cpu", 60.0).await.unwrap();

        assert_eq!(store.metric_for_group(group.id, "cpu").await.unwrap(), Some(70.0));
        assert_eq!(store.metric_for_group(group.id, "memory").await.unwrap(), None);
    }
}
