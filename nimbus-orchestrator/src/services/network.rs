use std::sync::Arc;

use nimbus_common::validate::{self, Cidr};
use nimbus_common::{
    CoreError, CoreResult, ElasticIp, RuleSource, SecurityGroup, SecurityRule, Subnet, Vpc,
};
use nimbus_providers::Backends;
use uuid::Uuid;

use crate::services::InstanceService;
use crate::store::Store;

/// VPCs, subnets, security groups and elastic IPs.
#[derive(Clone)]
pub struct NetworkService {
    store: Arc<dyn Store>,
    backends: Backends,
    instances: InstanceService,
    default_cidr: String,
}

impl NetworkService {
    pub fn new(instances: InstanceService, default_cidr: impl Into<String>) -> Self {
        Self {
            store: instances.store().clone(),
            backends: instances.backends().clone(),
            instances,
            default_cidr: default_cidr.into(),
        }
    }

    /// Records the VPC and creates its bridge. The row is removed again when
    /// the bridge cannot be created.
    pub async fn create_vpc(&self, name: &str, cidr: Option<&str>) -> CoreResult<Vpc> {
        validate::identifier("name", name)?;
        let cidr = Cidr::parse("cidr", cidr.unwrap_or(&self.default_cidr))?;
        let vpc = self.store.insert_vpc(name, &cidr.to_string()).await?;

        let Some(network) = self.backends.network.as_ref() else {
            return Ok(vpc);
        };
        let bridge = bridge_name(vpc.id);
        let ctx = self.instances.call_context();
        if let Err(e) = network.create_bridge(&ctx, &bridge).await {
            tracing::error!(vpc_id = %vpc.id, bridge = %bridge, error = %e, "bridge creation failed");
            let _ = self.store.delete_vpc(vpc.id).await;
            return Err(e.into());
        }
        self.store.set_vpc_network_handle(vpc.id, &bridge).await?;
        tracing::info!(vpc_id = %vpc.id, bridge = %bridge, "vpc created");
        Ok(Vpc {
            network_handle: Some(bridge),
            ..vpc
        })
    }

    /// Refuses while the VPC owns subnets, a zone or live instances.
    pub async fn delete_vpc(&self, id: Uuid) -> CoreResult<()> {
        let vpc = self
            .store
            .get_vpc(id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("vpc {id}")))?;
        self.store.delete_vpc(id).await?;
        if let (Some(network), Some(bridge)) = (self.backends.network.as_ref(), vpc.network_handle.as_deref()) {
            let ctx = self.instances.call_context();
            if let Err(e) = network.delete_bridge(&ctx, bridge).await {
                tracing::warn!(vpc_id = %id, bridge, error = %e, "bridge left behind");
            }
        }
        tracing::info!(vpc_id = %id, "vpc deleted");
        Ok(())
    }

    pub async fn create_subnet(&self, vpc_id: Uuid, name: &str, cidr: &str) -> CoreResult<Subnet> {
        validate::identifier("name", name)?;
        let vpc = self
            .store
            .get_vpc(vpc_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("vpc {vpc_id}")))?;
        let block = Cidr::parse("cidr", cidr)?;
        let outer = Cidr::parse("cidr", &vpc.cidr)?;
        if !outer.contains(&block) {
            return Err(CoreError::validation("cidr", format!("{block} is outside the vpc range {outer}")));
        }
        for existing in self.store.list_subnets(vpc_id).await? {
            if let Ok(other) = Cidr::parse("cidr", &existing.cidr) {
                if other.overlaps(&block) {
                    return Err(CoreError::Conflict(format!("{block} overlaps subnet {}", existing.name)));
                }
            }
        }
        let subnet = self
            .store
            .insert_subnet(vpc_id, name, &block.to_string(), &block.gateway().to_string())
            .await?;
        tracing::info!(vpc_id = %vpc_id, subnet_id = %subnet.id, cidr = %block, "subnet created");
        Ok(subnet)
    }

    pub async fn create_security_group(&self, vpc_id: Uuid, name: &str, rules: Vec<SecurityRule>) -> CoreResult<SecurityGroup> {
        validate::identifier("name", name)?;
        for rule in &rules {
            check_rule(rule)?;
        }
        self.store.insert_security_group(vpc_id, name, &rules).await
    }

    pub async fn allocate_elastic_ip(&self, address: &str) -> CoreResult<ElasticIp> {
        let addr = validate::ipv4("address", address)?;
        self.store.insert_elastic_ip(&addr.to_string()).await
    }

    pub async fn associate_elastic_ip(&self, id: Uuid, instance_id: Option<Uuid>) -> CoreResult<ElasticIp> {
        if let Some(iid) = instance_id {
            let inst = self
                .store
                .get_instance(iid)
                .await?
                .ok_or_else(|| CoreError::not_found(format!("instance {iid}")))?;
            if inst.state.is_terminal() {
                return Err(CoreError::validation("instance_id", "instance is terminated"));
            }
        }
        self.store
            .associate_elastic_ip(id, instance_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("elastic ip {id}")))
    }
}

fn check_rule(rule: &SecurityRule) -> CoreResult<()> {
    let proto = rule.protocol.to_ascii_lowercase();
    if !matches!(proto.as_str(), "tcp" | "udp" | "icmp" | "all") {
        return Err(CoreError::validation("protocol", format!("unsupported protocol '{}'", rule.protocol)));
    }
    if rule.port_from > rule.port_to {
        return Err(CoreError::validation("port_from", "must not exceed port_to"));
    }
    if let RuleSource::Cidr(c) = &rule.source {
        check_source_cidr(c)?;
    }
    Ok(())
}

/// Rule sources may be any prefix length, `0.0.0.0/0` included.
fn check_source_cidr(s: &str) -> CoreResult<()> {
    let bad = || CoreError::validation("source", format!("'{s}' is not an IPv4 CIDR block"));
    let (addr, prefix) = s.trim().split_once('/').ok_or_else(bad)?;
    validate::ipv4("source", addr)?;
    match prefix.parse::<u8>() {
        Ok(p) if p <= 32 => Ok(()),
        _ => Err(bad()),
    }
}

/// Bridge names stay within the kernel's 15-byte interface name limit.
pub fn bridge_name(vpc_id: Uuid) -> String {
    let id = vpc_id.simple().to_string();
    format!("nb-{}", &id[..10])
}
