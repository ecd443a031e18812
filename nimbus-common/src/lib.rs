use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

pub mod bus;
pub mod errors;
pub mod validate;

pub use errors::{CoreError, CoreResult};

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "instance_state", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,    // Record created, launch not started
    Starting,   // Backend launch in flight
    Running,    // Backend object up, private IP known
    Stopping,   // Termination accepted
    Stopped,    // Powered off, handle retained
    Error,      // Backend rejected or launch failed
    Terminated, // Tombstone
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Error => "error",
            InstanceState::Terminated => "terminated",
        }
    }

    /// Pending, Starting and Running instances count toward a group's or
    /// deployment's membership.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstanceState::Pending | InstanceState::Starting | InstanceState::Running
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Terminated)
    }

    /// States from which a termination request is accepted.
    pub fn terminable() -> &'static [InstanceState] {
        &[
            InstanceState::Pending,
            InstanceState::Starting,
            InstanceState::Running,
            InstanceState::Stopped,
            InstanceState::Error,
        ]
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "volume_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "snapshot_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Creating,
    Available,
    Error,
    Deleted,
}

/// Load-balancing algorithm. Free-text input is normalized by [`LbAlgorithm::parse`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "lb_algorithm")]
pub enum LbAlgorithm {
    #[sqlx(rename = "round-robin")]
    #[serde(rename = "round-robin")]
    RoundRobin,
    #[sqlx(rename = "least-connections")]
    #[serde(rename = "least-connections")]
    LeastConnections,
}

impl LbAlgorithm {
    /// Accepts "least-conn", "least_conn", "leastconn" and "least-connections"
    /// (any case) as least-connections; everything else is round-robin.
    pub fn parse(s: &str) -> LbAlgorithm {
        let norm = s.trim().to_ascii_lowercase().replace('_', "-");
        match norm.as_str() {
            "least-conn" | "leastconn" | "least-connections" => LbAlgorithm::LeastConnections,
            _ => LbAlgorithm::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LbAlgorithm::RoundRobin => "round-robin",
            LbAlgorithm::LeastConnections => "least-connections",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "resource_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Active,
    Deleting,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(type_name = "dns_record_type", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
    Mx,
    Txt,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Mx => "MX",
            RecordType::Txt => "TXT",
        }
    }

    pub fn parse(s: &str) -> Option<RecordType> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Some(RecordType::A),
            "AAAA" => Some(RecordType::Aaaa),
            "CNAME" => Some(RecordType::Cname),
            "MX" => Some(RecordType::Mx),
            "TXT" => Some(RecordType::Txt),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "eip_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ElasticIpStatus {
    Allocated,
    Associated,
}

// --- Value types ---

/// One `external:internal` port mapping.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub external: u16,
    pub internal: u16,
}

impl PortMapping {
    pub fn parse(s: &str) -> Option<PortMapping> {
        let (ext, int) = s.trim().split_once(':')?;
        Some(PortMapping {
            external: ext.trim().parse().ok()?,
            internal: int.trim().parse().ok()?,
        })
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.external, self.internal)
    }
}

/// What a scaling group or container deployment launches for each member.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct LaunchTemplate {
    pub image: String,
    #[serde(default = "default_vcpus")]
    pub vcpus: i32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: i32,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub subnet_id: Option<Uuid>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

fn default_vcpus() -> i32 {
    1
}

fn default_memory_mb() -> i32 {
    512
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    Ingress,
    Egress,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Cidr(String),
    SecurityGroup(Uuid),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SecurityRule {
    pub action: RuleAction,
    pub direction: RuleDirection,
    pub protocol: String,
    pub port_from: u16,
    pub port_to: u16,
    pub source: RuleSource,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CronTarget {
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
    },
    Function {
        image: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

fn default_http_method() -> String {
    "POST".to_string()
}

// --- Entities (SQLx Mapped) ---

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Instance {
    pub id: Uuid,
    pub name: String,
    pub image: String,
    pub vcpus: i32,
    pub memory_mb: i32,
    pub vpc_id: Option<Uuid>,
    pub subnet_id: Option<Uuid>,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    pub port_map: Json<Vec<PortMapping>>,
    pub backend_handle: Option<String>,
    pub scaling_group_id: Option<Uuid>,
    pub deployment_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

/// Fields supplied when creating an instance record; everything else is
/// assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewInstance {
    pub name: String,
    pub image: String,
    pub vcpus: i32,
    pub memory_mb: i32,
    pub vpc_id: Option<Uuid>,
    pub subnet_id: Option<Uuid>,
    pub port_map: Vec<PortMapping>,
    pub scaling_group_id: Option<Uuid>,
    pub deployment_id: Option<Uuid>,
}

impl NewInstance {
    pub fn from_template(name: String, template: &LaunchTemplate, vpc_id: Option<Uuid>) -> Self {
        Self {
            name,
            image: template.image.clone(),
            vcpus: template.vcpus,
            memory_mb: template.memory_mb,
            vpc_id,
            subnet_id: template.subnet_id,
            port_map: template.ports.clone(),
            scaling_group_id: None,
            deployment_id: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct InstanceStateChange {
    pub instance_id: Uuid,
    pub from_state: InstanceState,
    pub to_state: InstanceState,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Vpc {
    pub id: Uuid,
    pub name: String,
    pub cidr: String,
    /// Bridge created by the network backend for this VPC.
    pub network_handle: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Subnet {
    pub id: Uuid,
    pub vpc_id: Uuid,
    pub name: String,
    pub cidr: String,
    pub gateway: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct SecurityGroup {
    pub id: Uuid,
    pub vpc_id: Uuid,
    pub name: String,
    pub rules: Json<Vec<SecurityRule>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Volume {
    pub id: Uuid,
    pub name: String,
    pub size_gb: i32,
    pub backend_path: Option<String>,
    pub status: VolumeStatus,
    pub instance_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct Snapshot {
    pub id: Uuid,
    pub volume_id: Uuid,
    pub name: String,
    pub backend_path: Option<String>,
    pub status: SnapshotStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct LoadBalancer {
    pub id: Uuid,
    pub name: String,
    pub port: i32,
    pub algorithm: LbAlgorithm,
    /// Handle returned by the proxy adapter's Deploy; None until first deployment.
    pub proxy_id: Option<String>,
    pub status: ResourceStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LbTarget {
    pub lb_id: Uuid,
    pub instance_id: Uuid,
    pub port: i32,
    pub weight: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct ScalingGroup {
    pub id: Uuid,
    pub name: String,
    pub vpc_id: Option<Uuid>,
    pub min_size: i32,
    pub max_size: i32,
    pub desired: i32,
    pub launch_template: Json<LaunchTemplate>,
    pub status: ResourceStatus,
    pub created_at: DateTime<Utc>,
}

impl ScalingGroup {
    pub fn clamp(&self, n: i32) -> i32 {
        n.max(self.min_size).min(self.max_size)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct ScalingPolicy {
    pub id: Uuid,
    pub group_id: Uuid,
    pub metric_type: String,
    pub target_value: f64,
    pub scale_out_step: i32,
    pub scale_in_step: i32,
    pub cooldown_secs: i64,
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl ScalingPolicy {
    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.last_fired_at {
            Some(at) => (now - at).num_seconds() < self.cooldown_secs,
            None => false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct CronJob {
    pub id: Uuid,
    pub name: String,
    pub schedule: String,
    pub target: Json<CronTarget>,
    pub paused: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct ContainerDeployment {
    pub id: Uuid,
    pub name: String,
    pub desired_replicas: i32,
    pub current_replicas: i32,
    pub template: Json<LaunchTemplate>,
    pub vpc_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct DnsZone {
    pub id: Uuid,
    pub name: String,
    pub vpc_id: Option<Uuid>,
    /// Zone id on the DNS server.
    pub backend_zone_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct DnsRecord {
    pub id: Uuid,
    pub zone_id: Uuid,
    pub name: String,
    pub record_type: RecordType,
    pub content: String,
    pub ttl: i32,
    pub auto_managed: bool,
    pub instance_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
pub struct ElasticIp {
    pub id: Uuid,
    pub address: String,
    pub status: ElasticIpStatus,
    pub instance_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_normalization() {
        assert_eq!(LbAlgorithm::parse("least-conn"), LbAlgorithm::LeastConnections);
        assert_eq!(LbAlgorithm::parse("least_conn"), LbAlgorithm::LeastConnections);
        assert_eq!(LbAlgorithm::parse("Least-Connections"), LbAlgorithm::LeastConnections);
        assert_eq!(LbAlgorithm::parse("round-robin"), LbAlgorithm::RoundRobin);
        assert_eq!(LbAlgorithm::parse("whatever"), LbAlgorithm::RoundRobin);
    }

    #[test]
    fn port_mapping_parse() {
        assert_eq!(
            PortMapping::parse(" 8080:80 "),
            Some(PortMapping { external: 8080, internal: 80 })
        );
        assert_eq!(PortMapping::parse("70000:80"), None);
        assert_eq!(PortMapping::parse("8080"), None);
        assert_eq!(PortMapping { external: 1, internal: 2 }.to_string(), "1:2");
    }

    #[test]
    fn state_classes() {
        assert!(InstanceState::Pending.is_active());
        assert!(!InstanceState::Stopping.is_active());
        assert!(!InstanceState::Error.is_active());
        assert!(InstanceState::Terminated.is_terminal());
        assert!(!InstanceState::terminable().contains(&InstanceState::Terminated));
    }

    #[test]
    fn policy_cooldown_window() {
        let now = Utc::now();
        let mut policy = ScalingPolicy {
            id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            metric_type: "cpu".into(),
            target_value: 70.0,
            scale_out_step: 1,
            scale_in_step: 1,
            cooldown_secs: 300,
            last_fired_at: None,
        };
        assert!(!policy.in_cooldown(now));
        policy.last_fired_at = Some(now - chrono::Duration::seconds(60));
        assert!(policy.in_cooldown(now));
        policy.last_fired_at = Some(now - chrono::Duration::seconds(301));
        assert!(!policy.in_cooldown(now));
    }
}
