//! Adapters that accept every call and touch nothing. Used for tests and as
//! the degraded-mode network fallback.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};

use crate::inventory::{
    FlowRule, LaunchInfo, LaunchOptions, ObjectMeta, ProxySpec, ProxyTarget, RecordSpec, VolumeInfo,
    ZoneInfo,
};
use crate::{
    BackendError, BackendResult, ByteStream, CallContext, ComputeBackend, DnsBackend, LbProxy,
    NetworkBackend, StorageBackend,
};

pub const NOOP_IP: &str = "127.0.0.1";

#[derive(Debug, Default, Clone)]
pub struct NoopCompute;

#[async_trait]
impl ComputeBackend for NoopCompute {
    fn kind(&self) -> &'static str {
        "noop"
    }

    async fn ping(&self, _ctx: &CallContext) -> BackendResult<()> {
        Ok(())
    }

    async fn launch(&self, _ctx: &CallContext, opts: &LaunchOptions) -> BackendResult<LaunchInfo> {
        Ok(LaunchInfo {
            handle: opts.name.clone(),
            info: serde_json::json!({ "backend": "noop" }),
        })
    }

    async fn start(&self, _ctx: &CallContext, _handle: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn stop(&self, _ctx: &CallContext, _handle: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn delete(&self, _ctx: &CallContext, _handle: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn logs(&self, _ctx: &CallContext, _handle: &str) -> BackendResult<ByteStream> {
        Ok(stream::empty().boxed())
    }

    async fn stats(&self, _ctx: &CallContext, _handle: &str) -> BackendResult<ByteStream> {
        let body = Bytes::from_static(br#"{"memory_stats":{"usage":0,"limit":0}}"#);
        Ok(stream::iter([Ok(body)]).boxed())
    }

    async fn get_exposed_port(
        &self,
        _ctx: &CallContext,
        _handle: &str,
        internal_port: u16,
    ) -> BackendResult<u16> {
        Ok(internal_port)
    }

    async fn get_ip(&self, _ctx: &CallContext, _handle: &str) -> BackendResult<String> {
        Ok(NOOP_IP.to_string())
    }

    async fn exec(&self, _ctx: &CallContext, _handle: &str, _argv: &[String]) -> BackendResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn run_task(&self, ctx: &CallContext, opts: &LaunchOptions) -> BackendResult<LaunchInfo> {
        self.launch(ctx, opts).await
    }

    async fn wait_task(&self, _ctx: &CallContext, _handle: &str) -> BackendResult<i64> {
        Ok(0)
    }

    async fn attach_volume(&self, _ctx: &CallContext, _handle: &str, _path: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn detach_volume(&self, _ctx: &CallContext, _handle: &str, _path: &str) -> BackendResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct NoopNetwork;

#[async_trait]
impl NetworkBackend for NoopNetwork {
    fn kind(&self) -> &'static str {
        "noop"
    }

    async fn ping(&self, _ctx: &CallContext) -> BackendResult<()> {
        Ok(())
    }

    async fn create_bridge(&self, _ctx: &CallContext, _name: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn delete_bridge(&self, _ctx: &CallContext, _name: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn list_bridges(&self, _ctx: &CallContext) -> BackendResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn add_port(&self, _ctx: &CallContext, _bridge: &str, _port: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn delete_port(&self, _ctx: &CallContext, _bridge: &str, _port: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn create_vxlan(
        &self,
        _ctx: &CallContext,
        _bridge: &str,
        _port: &str,
        _remote_ip: &str,
        _vni: u32,
    ) -> BackendResult<()> {
        Ok(())
    }

    async fn delete_vxlan(&self, _ctx: &CallContext, _bridge: &str, _port: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn add_flow(&self, _ctx: &CallContext, _bridge: &str, _rule: &FlowRule) -> BackendResult<()> {
        Ok(())
    }

    async fn delete_flows(&self, _ctx: &CallContext, _bridge: &str, _matcher: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn list_flows(&self, _ctx: &CallContext, _bridge: &str) -> BackendResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn create_veth_pair(&self, _ctx: &CallContext, _a: &str, _b: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn attach_veth(&self, _ctx: &CallContext, _bridge: &str, _veth: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn delete_veth(&self, _ctx: &CallContext, _veth: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn set_veth_address(&self, _ctx: &CallContext, _veth: &str, _cidr: &str) -> BackendResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct NoopStorage;

#[async_trait]
impl StorageBackend for NoopStorage {
    async fn ping(&self, _ctx: &CallContext) -> BackendResult<()> {
        Ok(())
    }

    async fn create_bucket(&self, _ctx: &CallContext, _bucket: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn set_versioning(&self, _ctx: &CallContext, _bucket: &str, _enabled: bool) -> BackendResult<()> {
        Ok(())
    }

    async fn put_object(
        &self,
        _ctx: &CallContext,
        _bucket: &str,
        key: &str,
        data: Bytes,
    ) -> BackendResult<ObjectMeta> {
        Ok(ObjectMeta {
            key: key.to_string(),
            size: data.len() as u64,
            etag: String::new(),
            version: 1,
        })
    }

    async fn get_object(&self, _ctx: &CallContext, _bucket: &str, key: &str) -> BackendResult<Bytes> {
        Err(BackendError::NotFound(key.to_string()))
    }

    async fn head_object(&self, _ctx: &CallContext, _bucket: &str, key: &str) -> BackendResult<ObjectMeta> {
        Err(BackendError::NotFound(key.to_string()))
    }

    async fn delete_object(&self, _ctx: &CallContext, _bucket: &str, _key: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn list_objects(
        &self,
        _ctx: &CallContext,
        _bucket: &str,
        _prefix: &str,
    ) -> BackendResult<Vec<ObjectMeta>> {
        Ok(Vec::new())
    }

    async fn create_volume(&self, _ctx: &CallContext, name: &str, size_gb: u32) -> BackendResult<VolumeInfo> {
        Ok(VolumeInfo {
            path: format!("noop://{name}"),
            size_gb,
        })
    }

    async fn delete_volume(&self, _ctx: &CallContext, _path: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn snapshot_volume(
        &self,
        _ctx: &CallContext,
        _path: &str,
        snapshot_name: &str,
    ) -> BackendResult<VolumeInfo> {
        Ok(VolumeInfo {
            path: format!("noop://{snapshot_name}"),
            size_gb: 0,
        })
    }

    async fn restore_snapshot(
        &self,
        _ctx: &CallContext,
        _snapshot_path: &str,
        volume_name: &str,
    ) -> BackendResult<VolumeInfo> {
        Ok(VolumeInfo {
            path: format!("noop://{volume_name}"),
            size_gb: 0,
        })
    }

    async fn attach_volume(&self, _ctx: &CallContext, _path: &str, _holder: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn detach_volume(&self, _ctx: &CallContext, _path: &str, _holder: &str) -> BackendResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct NoopProxy;

#[async_trait]
impl LbProxy for NoopProxy {
    fn kind(&self) -> &'static str {
        "noop"
    }

    async fn deploy(&self, _ctx: &CallContext, lb: &ProxySpec, _targets: &[ProxyTarget]) -> BackendResult<String> {
        Ok(lb.id.clone())
    }

    async fn update(&self, _ctx: &CallContext, _lb: &ProxySpec, _targets: &[ProxyTarget]) -> BackendResult<()> {
        Ok(())
    }

    async fn remove(&self, _ctx: &CallContext, _lb_id: &str) -> BackendResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct NoopDns;

#[async_trait]
impl DnsBackend for NoopDns {
    fn kind(&self) -> &'static str {
        "noop"
    }

    async fn ping(&self, _ctx: &CallContext) -> BackendResult<()> {
        Ok(())
    }

    async fn create_zone(&self, _ctx: &CallContext, name: &str) -> BackendResult<ZoneInfo> {
        Ok(ZoneInfo {
            id: name.to_string(),
            name: name.to_string(),
        })
    }

    async fn delete_zone(&self, _ctx: &CallContext, _zone_id: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn get_zone(&self, _ctx: &CallContext, zone_id: &str) -> BackendResult<Option<ZoneInfo>> {
        Ok(Some(ZoneInfo {
            id: zone_id.to_string(),
            name: zone_id.to_string(),
        }))
    }

    async fn add_record(&self, _ctx: &CallContext, _zone_id: &str, _record: &RecordSpec) -> BackendResult<()> {
        Ok(())
    }

    async fn update_record(&self, _ctx: &CallContext, _zone_id: &str, _record: &RecordSpec) -> BackendResult<()> {
        Ok(())
    }

    async fn delete_record(
        &self,
        _ctx: &CallContext,
        _zone_id: &str,
        _name: &str,
        _record_type: &str,
    ) -> BackendResult<()> {
        Ok(())
    }

    async fn list_records(&self, _ctx: &CallContext, _zone_id: &str) -> BackendResult<Vec<RecordSpec>> {
        Ok(Vec::new())
    }
}
