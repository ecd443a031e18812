//! Virtual-machine compute adapter backed by a local libvirt daemon.
//!
//! Handles are sanitized domain names. Every domain boots from a root volume
//! named `<name>-root` in the default storage pool.

pub mod virsh;
pub mod xml;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use nimbus_common::validate::sanitize_domain_name;
use nimbus_common::PortMapping;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::check_identifier;
use crate::inventory::{LaunchInfo, LaunchOptions};
use crate::runner::CommandRunner;
use crate::{BackendError, BackendResult, ByteStream, CallContext, ComputeBackend};

pub use virsh::{DhcpLease, DomainState, VirshSession, VirtSession, MEM_STAT_ACTUAL, MEM_STAT_RSS};
pub use xml::MachineProfile;

pub const DEFAULT_ROOT_BYTES: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_CPUS: u32 = 1;
pub const DEFAULT_MEMORY_BYTES: u64 = 512 * 1024 * 1024;
pub const DEFAULT_NETWORK: &str = "default";

/// Budget for the background port-forward setup after a launch.
const PORT_FORWARD_TIMEOUT: Duration = Duration::from_secs(120);

type PortTable = Arc<RwLock<HashMap<String, Vec<PortMapping>>>>;

#[derive(Clone)]
pub struct HypervisorBackend {
    session: Arc<dyn VirtSession>,
    runner: Arc<dyn CommandRunner>,
    /// Installed (external, internal) forwards per domain.
    ports: PortTable,
    profile: MachineProfile,
    poll_interval: Duration,
    log_dir: PathBuf,
    shutdown: CancellationToken,
}

impl HypervisorBackend {
    pub fn new(session: Arc<dyn VirtSession>, runner: Arc<dyn CommandRunner>, profile: MachineProfile) -> Self {
        Self {
            session,
            runner,
            ports: Arc::new(RwLock::new(HashMap::new())),
            profile,
            poll_interval: Duration::from_secs(1),
            log_dir: PathBuf::from("/var/log/libvirt/qemu"),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    fn root_volume(name: &str) -> String {
        format!("{name}-root")
    }

    /// Clones the image volume when the pool has it, otherwise allocates an
    /// empty sparse root volume. Returns the volume's on-host path.
    async fn prepare_root(&self, ctx: &CallContext, pool: &str, name: &str, image: &str) -> BackendResult<String> {
        let root = Self::root_volume(name);
        if !image.is_empty() {
            if let Some(_src) = self.session.volume_path(ctx, pool, image).await? {
                match self.session.clone_volume(ctx, pool, image, &root).await {
                    Ok(path) => return Ok(path),
                    Err(e) => {
                        warn!(domain = name, image, error = %e, "image clone failed, using empty root volume");
                        // A failed clone can leave a partial target behind.
                        match self.session.delete_volume(ctx, pool, &root).await {
                            Ok(()) | Err(BackendError::NotFound(_)) => {}
                            Err(e) => warn!(domain = name, error = %e, "partial root volume not removed"),
                        }
                    }
                }
            } else {
                debug!(domain = name, image, "image not in pool, using empty root volume");
            }
        }
        self.session.create_volume(ctx, pool, &root, DEFAULT_ROOT_BYTES).await
    }

    async fn define_and_start(&self, ctx: &CallContext, name: &str, disk: &str, opts: &LaunchOptions) -> BackendResult<()> {
        let network = opts.network.as_deref().unwrap_or(DEFAULT_NETWORK);
        let memory = opts.memory_bytes.unwrap_or(DEFAULT_MEMORY_BYTES);
        let domain = xml::render_domain(&xml::DomainSpec {
            name,
            cpus: opts.cpus.unwrap_or(DEFAULT_CPUS),
            memory_kib: memory / 1024,
            disk_path: disk,
            network,
            profile: &self.profile,
        })?;
        self.session.define_domain(ctx, &domain).await?;
        self.session.start_domain(ctx, name).await
    }

    /// Best-effort removal of whatever a failed launch left behind.
    async fn rollback_launch(&self, ctx: &CallContext, pool: &str, name: &str) {
        if let Ok(Some(_)) = self.session.domain_state(ctx, name).await {
            if let Err(e) = self.session.undefine_domain(ctx, name).await {
                warn!(domain = name, error = %e, "rollback: undefine failed");
            }
        }
        match self.session.delete_volume(ctx, pool, &Self::root_volume(name)).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => warn!(domain = name, error = %e, "rollback: root volume delete failed"),
        }
    }

    /// Installs DNAT + FORWARD rules for each `external:internal` mapping and
    /// records the pairs consulted by `get_exposed_port`.
    pub async fn setup_port_forwarding(&self, ctx: &CallContext, name: &str, mappings: &[String]) -> BackendResult<()> {
        let parsed: Vec<PortMapping> = mappings
            .iter()
            .filter_map(|m| match PortMapping::parse(m) {
                Some(p) => Some(p),
                None => {
                    warn!(domain = name, mapping = %m, "skipping malformed port mapping");
                    None
                }
            })
            .collect();
        if parsed.is_empty() {
            return Ok(());
        }

        let ip = self.get_ip(ctx, name).await?;
        let mut installed = Vec::with_capacity(parsed.len());
        for p in parsed {
            let ext = p.external.to_string();
            let int = p.internal.to_string();
            let dest = format!("{ip}:{int}");
            let dnat = [
                "-t", "nat", "-A", "PREROUTING", "-p", "tcp", "--dport", &ext, "-j", "DNAT",
                "--to-destination", &dest,
            ];
            let forward = ["-A", "FORWARD", "-p", "tcp", "-d", &ip, "--dport", &int, "-j", "ACCEPT"];
            for args in [&dnat[..], &forward[..]] {
                match self.runner.run(ctx, "iptables", args).await {
                    Ok(out) => {
                        out.check("iptables")?;
                    }
                    Err(BackendError::BinaryMissing(bin)) => {
                        warn!(domain = name, binary = %bin, "packet filter not installed, port forwarding disabled");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            installed.push(p);
        }

        info!(domain = name, ip = %ip, count = installed.len(), "port forwarding installed");
        self.ports.write().await.insert(name.to_string(), installed);
        Ok(())
    }

    fn spawn_port_forwarding(&self, name: String, mappings: Vec<String>) {
        if mappings.is_empty() {
            return;
        }
        let this = self.clone();
        let ctx = CallContext::new(self.shutdown.child_token(), PORT_FORWARD_TIMEOUT);
        tokio::spawn(async move {
            if let Err(e) = this.setup_port_forwarding(&ctx, &name, &mappings).await {
                warn!(domain = %name, error = %e, "port forwarding setup failed");
            }
        });
    }

    async fn wait_for_shutoff(&self, ctx: &CallContext, name: &str) -> BackendResult<i64> {
        loop {
            match self.session.domain_state(ctx, name).await? {
                Some(DomainState::Shutoff) => return Ok(0),
                Some(_) => {}
                None => return Err(BackendError::NotFound(name.to_string())),
            }
            ctx.sleep(self.poll_interval).await?;
        }
    }
}

#[async_trait]
impl ComputeBackend for HypervisorBackend {
    fn kind(&self) -> &'static str {
        match self.profile {
            MachineProfile::Standard => "hypervisor",
            MachineProfile::MicroVm { .. } => "micro-vm",
        }
    }

    async fn ping(&self, ctx: &CallContext) -> BackendResult<()> {
        self.session.ping(ctx).await
    }

    async fn launch(&self, ctx: &CallContext, opts: &LaunchOptions) -> BackendResult<LaunchInfo> {
        let name = sanitize_domain_name(&opts.name);
        check_identifier("name", &name)?;
        if !opts.image.is_empty() {
            check_identifier("image", &opts.image)?;
        }
        if let Some(net) = &opts.network {
            check_identifier("network", net)?;
        }

        let pool = self.session.default_pool(ctx).await?;
        let disk = match self.prepare_root(ctx, &pool, &name, &opts.image).await {
            Ok(disk) => disk,
            Err(e) => {
                warn!(domain = %name, error = %e, "root volume not prepared, rolling back");
                self.rollback_launch(ctx, &pool, &name).await;
                return Err(e);
            }
        };

        if let Err(e) = self.define_and_start(ctx, &name, &disk, opts).await {
            warn!(domain = %name, error = %e, "launch failed, rolling back");
            self.rollback_launch(ctx, &pool, &name).await;
            return Err(e);
        }

        info!(domain = %name, disk = %disk, "domain started");
        self.spawn_port_forwarding(name.clone(), opts.ports.clone());
        Ok(LaunchInfo {
            handle: name,
            info: serde_json::json!({ "disk": disk, "pool": pool }),
        })
    }

    async fn start(&self, ctx: &CallContext, handle: &str) -> BackendResult<()> {
        check_identifier("handle", handle)?;
        self.session.start_domain(ctx, handle).await
    }

    async fn stop(&self, ctx: &CallContext, handle: &str) -> BackendResult<()> {
        check_identifier("handle", handle)?;
        self.session.shutdown_domain(ctx, handle).await
    }

    async fn delete(&self, ctx: &CallContext, handle: &str) -> BackendResult<()> {
        check_identifier("handle", handle)?;
        if let Some(state) = self.session.domain_state(ctx, handle).await? {
            if state.is_active() {
                match self.session.destroy_domain(ctx, handle).await {
                    Ok(()) | Err(BackendError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            match self.session.undefine_domain(ctx, handle).await {
                Ok(()) | Err(BackendError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let pool = self.session.default_pool(ctx).await?;
        match self.session.delete_volume(ctx, &pool, &Self::root_volume(handle)).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        // Firewall rules stay behind; only the lookup table is cleared.
        self.ports.write().await.remove(handle);
        info!(domain = handle, "domain deleted");
        Ok(())
    }

    async fn logs(&self, _ctx: &CallContext, handle: &str) -> BackendResult<ByteStream> {
        check_identifier("handle", handle)?;
        let path = self.log_dir.join(format!("{handle}.log"));
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackendError::NotFound(path.display().to_string()),
                _ => BackendError::Unavailable(e.to_string()),
            })?;
        Ok(stream::iter([Ok(Bytes::from(data))]).boxed())
    }

    async fn stats(&self, ctx: &CallContext, handle: &str) -> BackendResult<ByteStream> {
        check_identifier("handle", handle)?;
        let table = self.session.memory_stats(ctx, handle).await?;
        let lookup = |tag: u32| table.iter().find(|(t, _)| *t == tag).map(|(_, kib)| kib * 1024).unwrap_or(0);
        let body = serde_json::json!({
            "memory_stats": {
                "usage": lookup(MEM_STAT_RSS),
                "limit": lookup(MEM_STAT_ACTUAL),
            }
        });
        Ok(stream::iter([Ok(Bytes::from(body.to_string()))]).boxed())
    }

    async fn get_exposed_port(&self, _ctx: &CallContext, handle: &str, internal_port: u16) -> BackendResult<u16> {
        self.ports
            .read()
            .await
            .get(handle)
            .and_then(|pairs| pairs.iter().find(|p| p.internal == internal_port))
            .map(|p| p.external)
            .ok_or_else(|| BackendError::NotFound(format!("{handle} port {internal_port}")))
    }

    async fn get_ip(&self, ctx: &CallContext, handle: &str) -> BackendResult<String> {
        check_identifier("handle", handle)?;
        let res: BackendResult<String> = async {
            loop {
                let dump = self.session.domain_xml(ctx, handle).await?;
                let iface = xml::parse_interface(&dump)?;
                let leases = self.session.dhcp_leases(ctx, &iface.network).await?;
                if let Some(lease) = leases.into_iter().find(|l| l.mac.eq_ignore_ascii_case(&iface.mac)) {
                    return Ok::<String, BackendError>(lease.ip);
                }
                ctx.sleep(self.poll_interval).await?;
            }
        }
        .await;
        match res {
            Err(BackendError::DeadlineExceeded) => Err(BackendError::IpNotAssigned(handle.to_string())),
            other => other,
        }
    }

    async fn exec(&self, _ctx: &CallContext, _handle: &str, _argv: &[String]) -> BackendResult<Vec<u8>> {
        Err(BackendError::Unsupported("exec requires a guest agent".into()))
    }

    async fn run_task(&self, ctx: &CallContext, opts: &LaunchOptions) -> BackendResult<LaunchInfo> {
        self.launch(ctx, opts).await
    }

    async fn wait_task(&self, ctx: &CallContext, handle: &str) -> BackendResult<i64> {
        check_identifier("handle", handle)?;
        self.wait_for_shutoff(ctx, handle).await
    }

    async fn attach_volume(&self, ctx: &CallContext, handle: &str, volume_path: &str) -> BackendResult<()> {
        check_identifier("handle", handle)?;
        let dump = self.session.domain_xml(ctx, handle).await?;
        if xml::parse_disks(&dump)?.iter().any(|(src, _)| src == volume_path) {
            return Ok(());
        }
        let target = xml::next_disk_target(&dump)?;
        self.session.attach_disk(ctx, handle, volume_path, &target).await
    }

    async fn detach_volume(&self, ctx: &CallContext, handle: &str, volume_path: &str) -> BackendResult<()> {
        check_identifier("handle", handle)?;
        match self.session.detach_disk(ctx, handle, volume_path).await {
            Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn console_url(&self, ctx: &CallContext, handle: &str) -> BackendResult<String> {
        check_identifier("handle", handle)?;
        let dump = self.session.domain_xml(ctx, handle).await?;
        xml::parse_console_url(&dump)
    }

    async fn close(&self) {
        self.shutdown.cancel();
    }
}
