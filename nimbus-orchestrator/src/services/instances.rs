use std::sync::Arc;
use std::time::Duration;

use nimbus_common::bus::EventType;
use nimbus_common::validate;
use nimbus_common::{
    CoreError, CoreResult, DnsZone, Instance, InstanceState, LaunchTemplate, NewInstance,
    PortMapping, RecordType,
};
use nimbus_providers::inventory::{LaunchOptions, RecordSpec};
use nimbus_providers::{BackendError, Backends, CallContext};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::breaker::{CallError, CircuitBreaker};
use crate::events::EventPublisher;
use crate::store::{InstancePatch, NewDnsRecord, Store};

/// TTL of auto-managed A records.
pub const AUTO_RECORD_TTL: i32 = 300;

const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_RESET: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Deadline of a single adapter call.
    pub call: Duration,
    /// How long a launch waits for the private address before going Running without one.
    pub ip_wait: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(60),
            ip_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceRequest {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub vpc_id: Option<Uuid>,
    #[serde(default)]
    pub subnet_id: Option<Uuid>,
    #[serde(default)]
    pub instance_type: Option<String>,
}

/// Resource envelope of a named instance type: (vcpus, memory_mb).
pub fn instance_type_envelope(name: &str) -> Option<(i32, i32)> {
    match name.trim().to_ascii_lowercase().as_str() {
        "nano" => Some((1, 256)),
        "small" => Some((1, 512)),
        "medium" => Some((2, 2048)),
        "large" => Some((4, 8192)),
        "xlarge" => Some((8, 16384)),
        _ => None,
    }
}

/// Instance lifecycle: launch, termination and the DNS auto-record that
/// follows an instance while it is Running.
#[derive(Clone)]
pub struct InstanceService {
    store: Arc<dyn Store>,
    backends: Backends,
    breaker: Arc<CircuitBreaker>,
    events: EventPublisher,
    timeouts: Timeouts,
    token: CancellationToken,
}

impl InstanceService {
    pub fn new(store: Arc<dyn Store>, backends: Backends, events: EventPublisher, token: CancellationToken) -> Self {
        Self {
            store,
            backends,
            breaker: Arc::new(CircuitBreaker::new("compute", BREAKER_THRESHOLD, BREAKER_RESET)),
            events,
            timeouts: Timeouts::default(),
            token,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fresh per-call context derived from the service's shutdown token.
    pub fn call_context(&self) -> CallContext {
        CallContext::new(self.token.child_token(), self.timeouts.call)
    }

    /// Validates and records a Pending instance. The caller launches it.
    pub async fn create(&self, req: InstanceRequest) -> CoreResult<Instance> {
        validate::identifier("name", &req.name)?;
        if req.image.trim().is_empty() {
            return Err(CoreError::validation("image", "must not be empty"));
        }
        let (vcpus, memory_mb) = match req.instance_type.as_deref() {
            None => (1, 512),
            Some(t) => instance_type_envelope(t)
                .ok_or_else(|| CoreError::validation("instance_type", format!("unknown type '{t}'")))?,
        };

        let mut vpc_id = req.vpc_id;
        if let Some(sid) = req.subnet_id {
            let subnet = self
                .store
                .get_subnet(sid)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("subnet {sid}")))?;
            match vpc_id {
                Some(v) if v != subnet.vpc_id => {
                    return Err(CoreError::validation("subnet_id", "subnet is not in the given vpc"));
                }
                _ => vpc_id = Some(subnet.vpc_id),
            }
        }
        if let Some(v) = vpc_id {
            if self.store.get_vpc(v).await?.is_none() {
                return Err(CoreError::not_found(format!("vpc {v}")));
            }
        }

        let inst = self
            .store
            .insert_instance(&NewInstance {
                name: req.name,
                image: req.image,
                vcpus,
                memory_mb,
                vpc_id,
                subnet_id: req.subnet_id,
                port_map: req.ports,
                scaling_group_id: None,
                deployment_id: None,
            })
            .await?;
        tracing::info!(instance_id = %inst.id, name = %inst.name, "instance recorded");
        Ok(inst)
    }

    /// Records a member of a scaling group or deployment from its template.
    pub async fn create_member(
        &self,
        name: String,
        template: &LaunchTemplate,
        vpc_id: Option<Uuid>,
        scaling_group_id: Option<Uuid>,
        deployment_id: Option<Uuid>,
    ) -> CoreResult<Instance> {
        let mut new = NewInstance::from_template(name, template, vpc_id);
        new.scaling_group_id = scaling_group_id;
        new.deployment_id = deployment_id;
        self.store.insert_instance(&new).await
    }

    /// Launches in the background; failures land on the record.
    pub fn spawn_launch(&self, id: Uuid) {
        let svc = self.clone();
        tokio::spawn(async move {
            if let Err(e) = svc.launch(id).await {
                tracing::warn!(instance_id = %id, error = %e, "launch did not complete");
            }
        });
    }

    /// Pending → Starting → Running. A transient backend failure puts the
    /// record back to Pending for the provisioning reconciler; a rejection
    /// moves it to Error.
    pub async fn launch(&self, id: Uuid) -> CoreResult<Instance> {
        let claimed = self
            .store
            .transition(id, &[InstanceState::Pending], InstanceState::Starting, &InstancePatch::default(), "launch started")
            .await?;
        let Some(inst) = claimed else {
            // Someone else owns the launch, or the instance moved on.
            return self
                .store
                .get_instance(id)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("instance {id}")));
        };
        self.publish_state(&inst).await;

        let opts = self.launch_options(&inst).await?;
        let ctx = self.call_context();
        let compute = self.backends.compute.clone();
        let launched = self
            .breaker
            .call_with(|| compute.launch(&ctx, &opts), BackendError::is_transient)
            .await;

        let info = match launched {
            Ok(info) => info,
            Err(err) => return Err(self.launch_failed(&inst, err).await),
        };

        let ip = match compute.get_ip(&ctx.child(self.timeouts.ip_wait), &info.handle).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                tracing::warn!(instance_id = %inst.id, handle = %info.handle, error = %e, "no private address yet");
                None
            }
        };

        let patch = InstancePatch {
            backend_handle: Some(info.handle.clone()),
            private_ip: ip,
            error_message: None,
        };
        let running = self
            .store
            .transition(inst.id, &[InstanceState::Starting], InstanceState::Running, &patch, "backend launched")
            .await?;
        let Some(running) = running else {
            // Termination was requested while the launch was in flight. The
            // record never saw the handle, so the object is released here.
            tracing::info!(instance_id = %inst.id, handle = %info.handle, "instance left Starting during launch");
            self.release_unrecorded(inst.id, &info.handle).await;
            return self
                .store
                .get_instance(inst.id)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("instance {}", inst.id)));
        };
        tracing::info!(instance_id = %running.id, handle = %info.handle, "instance running");
        self.publish_state(&running).await;

        if let Err(e) = self.ensure_auto_record(&running).await {
            tracing::warn!(instance_id = %running.id, error = %e, "auto record not created");
        }
        Ok(running)
    }

    async fn launch_failed(&self, inst: &Instance, err: CallError<BackendError>) -> CoreError {
        let retry = match &err {
            CallError::Open { .. } => true,
            CallError::Inner(e) => e.is_transient() || *e == BackendError::Cancelled,
        };
        let core: CoreError = err.into();

        if retry {
            tracing::warn!(instance_id = %inst.id, error = %core, "launch deferred");
            if let Err(e) = self
                .store
                .transition(inst.id, &[InstanceState::Starting], InstanceState::Pending, &InstancePatch::default(), "launch deferred")
                .await
            {
                tracing::error!(instance_id = %inst.id, error = %e, "could not defer launch; left for stale-launch recovery");
            }
            return core;
        }

        tracing::error!(instance_id = %inst.id, error = %core, "launch failed");
        let patch = InstancePatch {
            error_message: Some(core.to_string()),
            ..Default::default()
        };
        match self
            .store
            .transition(inst.id, &[InstanceState::Starting], InstanceState::Error, &patch, "launch failed")
            .await
        {
            Ok(Some(failed)) => {
                self.events
                    .publish(
                        EventType::InstanceError,
                        json!({ "instance_id": failed.id, "name": failed.name, "error": core.to_string() }),
                    )
                    .await;
            }
            Ok(None) => {}
            Err(e) => tracing::error!(instance_id = %inst.id, error = %e, "could not record launch failure"),
        }
        core
    }

    /// Deletes a backend object whose instance moved on before the handle
    /// was recorded. When the delete fails the handle is written to the row
    /// so the terminator can retry it.
    async fn release_unrecorded(&self, id: Uuid, handle: &str) {
        let ctx = self.call_context();
        match self.backends.compute.delete(&ctx, handle).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {
                tracing::info!(instance_id = %id, handle, "unrecorded backend object deleted");
            }
            Err(e) => {
                tracing::warn!(instance_id = %id, handle, error = %e, "unrecorded backend object not deleted");
                if let Err(e) = self.store.set_backend_handle(id, handle).await {
                    tracing::error!(instance_id = %id, handle, error = %e, "backend object orphaned");
                }
            }
        }
    }

    /// Resets a launch that stopped making progress in Starting: the backend
    /// object it may have created is deleted and the row goes back to
    /// Pending. Returns the Pending row, or `None` when the instance moved on
    /// or the delete failed.
    pub async fn reset_stale_launch(&self, inst: &Instance) -> CoreResult<Option<Instance>> {
        if inst.state != InstanceState::Starting {
            return Ok(None);
        }
        let handle = inst.backend_handle.clone().unwrap_or_else(|| backend_name(inst));
        let ctx = self.call_context();
        match self.backends.compute.delete(&ctx, &handle).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => {
                tracing::warn!(instance_id = %inst.id, handle = %handle, error = %e, "stale launch not cleaned up");
                return Ok(None);
            }
        }
        let reset = self
            .store
            .transition(inst.id, &[InstanceState::Starting], InstanceState::Pending, &InstancePatch::default(), "stale launch reset")
            .await?;
        if let Some(pending) = &reset {
            tracing::warn!(instance_id = %pending.id, handle = %handle, "stale launch reset to pending");
            self.publish_state(pending).await;
        }
        Ok(reset)
    }

    async fn launch_options(&self, inst: &Instance) -> CoreResult<LaunchOptions> {
        let network = match inst.vpc_id {
            Some(v) => self.store.get_vpc(v).await?.and_then(|vpc| vpc.network_handle),
            None => None,
        };
        Ok(LaunchOptions {
            name: backend_name(inst),
            image: inst.image.clone(),
            cpus: u32::try_from(inst.vcpus).ok(),
            memory_bytes: u64::try_from(inst.memory_mb).ok().map(|mb| mb * 1024 * 1024),
            ports: inst.port_map.0.iter().map(|p| p.to_string()).collect(),
            network,
            labels: vec![("nimbus.instance".to_string(), inst.id.to_string())],
            ..Default::default()
        })
    }

    /// Accepts a termination. Already Stopping or Terminated is a no-op.
    pub async fn request_termination(&self, id: Uuid) -> CoreResult<Instance> {
        let inst = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("instance {id}")))?;
        if matches!(inst.state, InstanceState::Stopping | InstanceState::Terminated) {
            return Ok(inst);
        }

        let moved = self
            .store
            .transition(id, InstanceState::terminable(), InstanceState::Stopping, &InstancePatch::default(), "termination requested")
            .await?;
        let Some(stopping) = moved else {
            return self
                .store
                .get_instance(id)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("instance {id}")));
        };
        tracing::info!(instance_id = %id, "termination accepted");
        self.publish_state(&stopping).await;

        if let Err(e) = self.remove_auto_record(id).await {
            tracing::warn!(instance_id = %id, error = %e, "auto record not removed");
        }
        Ok(stopping)
    }

    /// Stopping → Terminated: detach volumes, drop the auto record, delete the
    /// backend object, tombstone. Safe to re-run after a partial failure.
    pub async fn terminate(&self, inst: &Instance) -> CoreResult<Instance> {
        if inst.state == InstanceState::Terminated {
            return Ok(inst.clone());
        }
        let ctx = self.call_context();

        for vol in self.store.volumes_for_instance(inst.id).await? {
            if let Some(path) = vol.backend_path.as_deref() {
                if let Some(handle) = inst.backend_handle.as_deref() {
                    match self.backends.compute.detach_volume(&ctx, handle, path).await {
                        Ok(()) | Err(BackendError::Unsupported(_)) | Err(BackendError::NotFound(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                match self.backends.storage.detach_volume(&ctx, path, &inst.id.to_string()).await {
                    Ok(()) | Err(BackendError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.store.detach_volume(vol.id).await?;
            tracing::info!(instance_id = %inst.id, volume_id = %vol.id, "volume detached");
        }

        self.remove_auto_record(inst.id).await?;

        if let Some(handle) = inst.backend_handle.as_deref() {
            let compute = self.backends.compute.clone();
            match self
                .breaker
                .call_with(|| compute.delete(&ctx, handle), BackendError::is_transient)
                .await
            {
                Ok(()) | Err(CallError::Inner(BackendError::NotFound(_))) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let done = self
            .store
            .transition(inst.id, &[InstanceState::Stopping], InstanceState::Terminated, &InstancePatch::default(), "backend deleted")
            .await?;
        match done {
            Some(t) => {
                tracing::info!(instance_id = %t.id, "instance terminated");
                self.publish_state(&t).await;
                Ok(t)
            }
            None => self
                .store
                .get_instance(inst.id)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("instance {}", inst.id))),
        }
    }

    /// Makes sure a Running instance in a zone-owning VPC has exactly one
    /// auto-managed A record pointing at its private address. Returns true
    /// when something changed.
    pub async fn ensure_auto_record(&self, inst: &Instance) -> CoreResult<bool> {
        let (Some(vpc_id), Some(ip)) = (inst.vpc_id, inst.private_ip.as_deref()) else {
            return Ok(false);
        };
        if inst.state != InstanceState::Running {
            return Ok(false);
        }
        let Some(zone) = self.store.zone_for_vpc(vpc_id).await? else {
            return Ok(false);
        };

        let ctx = self.call_context();
        let spec = RecordSpec {
            name: record_fqdn(&inst.name, &zone),
            record_type: RecordType::A.as_str().to_string(),
            content: ip.to_string(),
            ttl: AUTO_RECORD_TTL as u32,
        };
        let zone_ref = backend_zone(&zone);

        let mut existing = self.store.auto_records_for(inst.id).await?;
        if let Some(first) = existing.first() {
            let mut changed = false;
            if first.content != ip {
                self.backends.dns.update_record(&ctx, zone_ref, &spec).await?;
                self.store.update_record_content(first.id, ip).await?;
                changed = true;
            }
            for extra in existing.drain(1..) {
                self.store.delete_record(extra.id).await?;
                changed = true;
            }
            return Ok(changed);
        }

        self.backends.dns.add_record(&ctx, zone_ref, &spec).await?;
        let rec = self
            .store
            .insert_record(&NewDnsRecord {
                zone_id: zone.id,
                name: inst.name.clone(),
                record_type: RecordType::A,
                content: ip.to_string(),
                ttl: AUTO_RECORD_TTL,
                auto_managed: true,
                instance_id: Some(inst.id),
            })
            .await?;
        tracing::info!(instance_id = %inst.id, record_id = %rec.id, fqdn = %spec.name, "auto record created");
        self.events
            .publish(
                EventType::DnsRecord,
                json!({ "action": "created", "record_id": rec.id, "instance_id": inst.id, "name": spec.name, "content": ip }),
            )
            .await;
        Ok(true)
    }

    /// Deletes every auto-managed record of the instance. Returns how many were removed.
    pub async fn remove_auto_record(&self, instance_id: Uuid) -> CoreResult<usize> {
        let records = self.store.auto_records_for(instance_id).await?;
        if records.is_empty() {
            return Ok(0);
        }
        let ctx = self.call_context();
        let mut removed = 0;
        for rec in records {
            if let Some(zone) = self.store.get_zone(rec.zone_id).await? {
                let fqdn = record_fqdn(&rec.name, &zone);
                match self
                    .backends
                    .dns
                    .delete_record(&ctx, backend_zone(&zone), &fqdn, rec.record_type.as_str())
                    .await
                {
                    Ok(()) | Err(BackendError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if self.store.delete_record(rec.id).await? {
                removed += 1;
                self.events
                    .publish(
                        EventType::DnsRecord,
                        json!({ "action": "removed", "record_id": rec.id, "instance_id": instance_id }),
                    )
                    .await;
            }
        }
        tracing::info!(instance_id = %instance_id, removed, "auto records removed");
        Ok(removed)
    }

    async fn publish_state(&self, inst: &Instance) {
        self.events
            .publish(
                EventType::InstanceState,
                json!({ "instance_id": inst.id, "name": inst.name, "state": inst.state }),
            )
            .await;
    }
}

/// Backend object name: the instance name plus a short id suffix, so two
/// instances with the same name never collide on the host.
pub fn backend_name(inst: &Instance) -> String {
    let id = inst.id.simple().to_string();
    format!("{}-{}", inst.name, &id[..8])
}

pub fn record_fqdn(name: &str, zone: &DnsZone) -> String {
    format!("{}.{}", name, zone.name.trim_end_matches('.'))
}

pub fn backend_zone(zone: &DnsZone) -> &str {
    zone.backend_zone_id.as_deref().unwrap_or(&zone.name)
}
