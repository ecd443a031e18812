use std::sync::Arc;

use nimbus_common::validate;
use nimbus_common::{CoreError, CoreResult, DnsRecord, DnsZone, RecordType};
use nimbus_providers::inventory::RecordSpec;
use nimbus_providers::{BackendError, Backends};
use uuid::Uuid;

use crate::services::{backend_zone, record_fqdn, InstanceService};
use crate::store::{NewDnsRecord, Store};

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RecordRequest {
    pub name: String,
    pub record_type: String,
    pub content: String,
    #[serde(default)]
    pub ttl: Option<i32>,
}

/// Zones and manually managed records. Auto-managed records belong to the
/// instance lifecycle and are never created here.
#[derive(Clone)]
pub struct DnsService {
    store: Arc<dyn Store>,
    backends: Backends,
    instances: InstanceService,
}

impl DnsService {
    pub fn new(instances: InstanceService) -> Self {
        Self {
            store: instances.store().clone(),
            backends: instances.backends().clone(),
            instances,
        }
    }

    pub async fn create_zone(&self, name: &str, vpc_id: Option<Uuid>) -> CoreResult<DnsZone> {
        let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() || !name.split('.').all(validate::is_identifier) {
            return Err(CoreError::validation("name", "must be a dotted domain name"));
        }
        if let Some(v) = vpc_id {
            if self.store.get_vpc(v).await?.is_none() {
                return Err(CoreError::not_found(format!("vpc {v}")));
            }
            if self.store.zone_for_vpc(v).await?.is_some() {
                return Err(CoreError::Conflict(format!("vpc {v} already owns a zone")));
            }
        }
        let ctx = self.instances.call_context();
        let info = self.backends.dns.create_zone(&ctx, &name).await?;
        let zone = self.store.insert_zone(&name, vpc_id, Some(&info.id)).await?;
        tracing::info!(zone_id = %zone.id, name = %zone.name, "zone created");
        Ok(zone)
    }

    pub async fn delete_zone(&self, id: Uuid) -> CoreResult<()> {
        let zone = self
            .store
            .get_zone(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("zone {id}")))?;
        let ctx = self.instances.call_context();
        match self.backends.dns.delete_zone(&ctx, backend_zone(&zone)).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete_zone(id).await?;
        tracing::info!(zone_id = %id, "zone deleted");
        Ok(())
    }

    /// Adds a manual record. The TTL is raised to the 60 s floor.
    pub async fn create_record(&self, zone_id: Uuid, req: RecordRequest) -> CoreResult<DnsRecord> {
        let zone = self
            .store
            .get_zone(zone_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("zone {zone_id}")))?;
        let record_type = RecordType::parse(&req.record_type)
            .ok_or_else(|| CoreError::validation("record_type", "expected A, AAAA, CNAME, MX or TXT"))?;
        let name = validate::sanitize_domain_name(&req.name);
        if req.content.trim().is_empty() {
            return Err(CoreError::validation("content", "must not be empty"));
        }
        if record_type == RecordType::A {
            validate::ipv4("content", &req.content)?;
        }
        let ttl = validate::clamp_ttl(req.ttl.unwrap_or(3600));

        let ctx = self.instances.call_context();
        let spec = RecordSpec {
            name: record_fqdn(&name, &zone),
            record_type: record_type.as_str().to_string(),
            content: req.content.trim().to_string(),
            ttl: ttl as u32,
        };
        self.backends.dns.add_record(&ctx, backend_zone(&zone), &spec).await?;
        self.store
            .insert_record(&NewDnsRecord {
                zone_id,
                name,
                record_type,
                content: spec.content,
                ttl,
                auto_managed: false,
                instance_id: None,
            })
            .await
    }

    pub async fn delete_record(&self, zone_id: Uuid, record_id: Uuid) -> CoreResult<()> {
        let zone = self
            .store
            .get_zone(zone_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("zone {zone_id}")))?;
        let rec = self
            .store
            .get_record(record_id)
            .await?
            .filter(|r| r.zone_id == zone_id)
            .ok_or_else(|| CoreError::not_found(format!("record {record_id}")))?;
        if rec.auto_managed {
            return Err(CoreError::Conflict("auto-managed records follow their instance".into()));
        }
        let ctx = self.instances.call_context();
        match self
            .backends
            .dns
            .delete_record(&ctx, backend_zone(&zone), &record_fqdn(&rec.name, &zone), rec.record_type.as_str())
            .await
        {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.store.delete_record(record_id).await?;
        Ok(())
    }
}
