use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub mod container;
pub mod context;
pub mod error;
pub mod hypervisor;
pub mod manager;
pub mod noop;
pub mod ovs;
pub mod powerdns;
pub mod proxy;
pub mod runner;
pub mod storage;

pub use context::CallContext;
pub use error::{BackendError, BackendResult};
pub use manager::{select_backends, BackendConfig, Backends, ComputeKind, DnsKind, NetworkKind};

/// Chunked output of `logs` / `stats`.
pub type ByteStream = BoxStream<'static, BackendResult<Bytes>>;

/// Exit code reported by `wait_task` callers when the deadline expires first.
pub const EXIT_DEADLINE: i64 = -1;

/// Compute capability surface: containers, VMs and micro-VMs all look like this.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Short tag identifying the adapter ("container-runtime", "hypervisor", ...).
    fn kind(&self) -> &'static str;

    async fn ping(&self, ctx: &CallContext) -> BackendResult<()>;

    async fn launch(
        &self,
        ctx: &CallContext,
        opts: &inventory::LaunchOptions,
    ) -> BackendResult<inventory::LaunchInfo>;
    async fn start(&self, ctx: &CallContext, handle: &str) -> BackendResult<()>;
    async fn stop(&self, ctx: &CallContext, handle: &str) -> BackendResult<()>;

    /// Must succeed when the backend object is already gone.
    async fn delete(&self, ctx: &CallContext, handle: &str) -> BackendResult<()>;

    async fn logs(&self, ctx: &CallContext, handle: &str) -> BackendResult<ByteStream>;
    async fn stats(&self, ctx: &CallContext, handle: &str) -> BackendResult<ByteStream>;

    async fn get_exposed_port(
        &self,
        ctx: &CallContext,
        handle: &str,
        internal_port: u16,
    ) -> BackendResult<u16>;

    /// Private address of the object. Waits up to the context deadline, then
    /// fails with `IpNotAssigned`.
    async fn get_ip(&self, ctx: &CallContext, handle: &str) -> BackendResult<String>;

    async fn exec(&self, ctx: &CallContext, handle: &str, argv: &[String]) -> BackendResult<Vec<u8>>;

    async fn run_task(
        &self,
        ctx: &CallContext,
        opts: &inventory::LaunchOptions,
    ) -> BackendResult<inventory::LaunchInfo>;

    /// Exit code of a task. `DeadlineExceeded` stands for exit code [`EXIT_DEADLINE`].
    async fn wait_task(&self, ctx: &CallContext, handle: &str) -> BackendResult<i64>;

    // Optional: hot-plug block volumes.
    // Default implementations let adapters without volume support compile.
    async fn attach_volume(
        &self,
        _ctx: &CallContext,
        _handle: &str,
        _volume_path: &str,
    ) -> BackendResult<()> {
        Err(BackendError::Unsupported(format!("{}: attach volume", self.kind())))
    }

    async fn detach_volume(
        &self,
        _ctx: &CallContext,
        _handle: &str,
        _volume_path: &str,
    ) -> BackendResult<()> {
        Err(BackendError::Unsupported(format!("{}: detach volume", self.kind())))
    }

    async fn console_url(&self, _ctx: &CallContext, _handle: &str) -> BackendResult<String> {
        Err(BackendError::Unsupported(format!("{}: console", self.kind())))
    }

    /// Releases long-lived sessions. Called once at shutdown.
    async fn close(&self) {}
}

/// Software-defined network surface.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn ping(&self, ctx: &CallContext) -> BackendResult<()>;

    async fn create_bridge(&self, ctx: &CallContext, name: &str) -> BackendResult<()>;
    async fn delete_bridge(&self, ctx: &CallContext, name: &str) -> BackendResult<()>;
    async fn list_bridges(&self, ctx: &CallContext) -> BackendResult<Vec<String>>;

    async fn add_port(&self, ctx: &CallContext, bridge: &str, port: &str) -> BackendResult<()>;
    async fn delete_port(&self, ctx: &CallContext, bridge: &str, port: &str) -> BackendResult<()>;

    async fn create_vxlan(
        &self,
        ctx: &CallContext,
        bridge: &str,
        port: &str,
        remote_ip: &str,
        vni: u32,
    ) -> BackendResult<()>;
    async fn delete_vxlan(&self, ctx: &CallContext, bridge: &str, port: &str) -> BackendResult<()>;

    async fn add_flow(
        &self,
        ctx: &CallContext,
        bridge: &str,
        rule: &inventory::FlowRule,
    ) -> BackendResult<()>;
    /// Deletes every flow matching `matcher` (an ofctl match expression).
    async fn delete_flows(&self, ctx: &CallContext, bridge: &str, matcher: &str) -> BackendResult<()>;
    async fn list_flows(&self, ctx: &CallContext, bridge: &str) -> BackendResult<Vec<String>>;

    async fn create_veth_pair(&self, ctx: &CallContext, a: &str, b: &str) -> BackendResult<()>;
    async fn attach_veth(&self, ctx: &CallContext, bridge: &str, veth: &str) -> BackendResult<()>;
    async fn delete_veth(&self, ctx: &CallContext, veth: &str) -> BackendResult<()>;
    async fn set_veth_address(&self, ctx: &CallContext, veth: &str, cidr: &str) -> BackendResult<()>;
}

/// Object buckets plus block volumes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn ping(&self, ctx: &CallContext) -> BackendResult<()>;

    async fn create_bucket(&self, ctx: &CallContext, bucket: &str) -> BackendResult<()>;
    async fn set_versioning(&self, ctx: &CallContext, bucket: &str, enabled: bool) -> BackendResult<()>;
    async fn put_object(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
        data: Bytes,
    ) -> BackendResult<inventory::ObjectMeta>;
    async fn get_object(&self, ctx: &CallContext, bucket: &str, key: &str) -> BackendResult<Bytes>;
    async fn head_object(
        &self,
        ctx: &CallContext,
        bucket: &str,
        key: &str,
    ) -> BackendResult<inventory::ObjectMeta>;
    async fn delete_object(&self, ctx: &CallContext, bucket: &str, key: &str) -> BackendResult<()>;
    async fn list_objects(
        &self,
        ctx: &CallContext,
        bucket: &str,
        prefix: &str,
    ) -> BackendResult<Vec<inventory::ObjectMeta>>;

    async fn create_volume(
        &self,
        ctx: &CallContext,
        name: &str,
        size_gb: u32,
    ) -> BackendResult<inventory::VolumeInfo>;
    async fn delete_volume(&self, ctx: &CallContext, path: &str) -> BackendResult<()>;
    async fn snapshot_volume(
        &self,
        ctx: &CallContext,
        path: &str,
        snapshot_name: &str,
    ) -> BackendResult<inventory::VolumeInfo>;
    async fn restore_snapshot(
        &self,
        ctx: &CallContext,
        snapshot_path: &str,
        volume_name: &str,
    ) -> BackendResult<inventory::VolumeInfo>;
    /// At most one attachment per volume; a second holder is rejected.
    async fn attach_volume(&self, ctx: &CallContext, path: &str, holder: &str) -> BackendResult<()>;
    async fn detach_volume(&self, ctx: &CallContext, path: &str, holder: &str) -> BackendResult<()>;
}

/// Realizes a declared load balancer as a running reverse proxy.
#[async_trait]
pub trait LbProxy: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Returns the proxy handle. Identical inputs produce identical configuration.
    async fn deploy(
        &self,
        ctx: &CallContext,
        lb: &inventory::ProxySpec,
        targets: &[inventory::ProxyTarget],
    ) -> BackendResult<String>;
    async fn update(
        &self,
        ctx: &CallContext,
        lb: &inventory::ProxySpec,
        targets: &[inventory::ProxyTarget],
    ) -> BackendResult<()>;
    /// No-op when nothing was deployed.
    async fn remove(&self, ctx: &CallContext, lb_id: &str) -> BackendResult<()>;
}

#[async_trait]
pub trait DnsBackend: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn ping(&self, ctx: &CallContext) -> BackendResult<()>;

    async fn create_zone(&self, ctx: &CallContext, name: &str) -> BackendResult<inventory::ZoneInfo>;
    async fn delete_zone(&self, ctx: &CallContext, zone_id: &str) -> BackendResult<()>;
    async fn get_zone(
        &self,
        ctx: &CallContext,
        zone_id: &str,
    ) -> BackendResult<Option<inventory::ZoneInfo>>;

    async fn add_record(
        &self,
        ctx: &CallContext,
        zone_id: &str,
        record: &inventory::RecordSpec,
    ) -> BackendResult<()>;
    async fn update_record(
        &self,
        ctx: &CallContext,
        zone_id: &str,
        record: &inventory::RecordSpec,
    ) -> BackendResult<()>;
    async fn delete_record(
        &self,
        ctx: &CallContext,
        zone_id: &str,
        name: &str,
        record_type: &str,
    ) -> BackendResult<()>;
    async fn list_records(
        &self,
        ctx: &CallContext,
        zone_id: &str,
    ) -> BackendResult<Vec<inventory::RecordSpec>>;
}

pub mod inventory {
    use nimbus_common::LbAlgorithm;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct LaunchOptions {
        pub name: String,
        pub image: String,
        pub cpus: Option<u32>,
        pub memory_bytes: Option<u64>,
        /// `external:internal` strings; malformed entries are skipped by the adapter.
        pub ports: Vec<String>,
        pub network: Option<String>,
        /// `host_path:guest_path` binds.
        pub volumes: Vec<String>,
        pub env: Vec<(String, String)>,
        pub command: Vec<String>,
        pub tenant: Option<String>,
        pub labels: Vec<(String, String)>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LaunchInfo {
        pub handle: String,
        pub info: serde_json::Value,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FlowRule {
        pub priority: u16,
        /// ofctl match fields, e.g. `tcp,nw_src=10.0.0.0/24,tp_dst=22`.
        pub matches: String,
        /// ofctl actions, e.g. `NORMAL` or `drop`.
        pub actions: String,
    }

    impl FlowRule {
        pub fn to_ofctl(&self) -> String {
            if self.matches.is_empty() {
                format!("priority={},actions={}", self.priority, self.actions)
            } else {
                format!("priority={},{},actions={}", self.priority, self.matches, self.actions)
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ObjectMeta {
        pub key: String,
        pub size: u64,
        pub etag: String,
        pub version: u64,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct VolumeInfo {
        pub path: String,
        pub size_gb: u32,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ProxySpec {
        pub id: String,
        pub port: u16,
        pub algorithm: LbAlgorithm,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ProxyTarget {
        /// Compute handle, resolved to an address through `get_ip`.
        pub instance_handle: String,
        pub port: u16,
        pub weight: u32,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RecordSpec {
        pub name: String,
        pub record_type: String,
        pub content: String,
        pub ttl: u32,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ZoneInfo {
        pub id: String,
        pub name: String,
    }
}
