use std::io::Write as _;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::CallContext;
use crate::error::{BackendError, BackendResult};
use crate::runner::{CommandOutput, CommandRunner};

/// Memory-stat tag for the balloon's current size (the domain limit).
pub const MEM_STAT_ACTUAL: u32 = 5;
/// Memory-stat tag for resident set size (usage).
pub const MEM_STAT_RSS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    Suspended,
}

impl DomainState {
    /// States in which the domain still holds resources and must be forced off.
    pub fn is_active(&self) -> bool {
        !matches!(self, DomainState::Shutoff)
    }

    pub fn parse(s: &str) -> Option<DomainState> {
        match s.trim() {
            "running" => Some(DomainState::Running),
            "idle" | "blocked" => Some(DomainState::Blocked),
            "paused" => Some(DomainState::Paused),
            "in shutdown" => Some(DomainState::ShuttingDown),
            "shut off" => Some(DomainState::Shutoff),
            "crashed" => Some(DomainState::Crashed),
            "pmsuspended" => Some(DomainState::Suspended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub mac: String,
    pub ip: String,
}

/// Long-lived session to the local virtualization daemon.
#[async_trait]
pub trait VirtSession: Send + Sync {
    async fn ping(&self, ctx: &CallContext) -> BackendResult<()>;

    /// Name of the default storage pool.
    async fn default_pool(&self, ctx: &CallContext) -> BackendResult<String>;
    /// On-host path of a volume, or None if the pool has no such volume.
    async fn volume_path(&self, ctx: &CallContext, pool: &str, name: &str) -> BackendResult<Option<String>>;
    async fn clone_volume(&self, ctx: &CallContext, pool: &str, source: &str, target: &str) -> BackendResult<String>;
    async fn create_volume(&self, ctx: &CallContext, pool: &str, name: &str, capacity_bytes: u64) -> BackendResult<String>;
    /// `NotFound` when the volume is already gone.
    async fn delete_volume(&self, ctx: &CallContext, pool: &str, name: &str) -> BackendResult<()>;

    async fn define_domain(&self, ctx: &CallContext, xml: &str) -> BackendResult<()>;
    async fn start_domain(&self, ctx: &CallContext, name: &str) -> BackendResult<()>;
    async fn shutdown_domain(&self, ctx: &CallContext, name: &str) -> BackendResult<()>;
    async fn destroy_domain(&self, ctx: &CallContext, name: &str) -> BackendResult<()>;
    async fn undefine_domain(&self, ctx: &CallContext, name: &str) -> BackendResult<()>;
    /// None when the domain is not defined.
    async fn domain_state(&self, ctx: &CallContext, name: &str) -> BackendResult<Option<DomainState>>;
    async fn domain_xml(&self, ctx: &CallContext, name: &str) -> BackendResult<String>;
    /// (tag, KiB) pairs, tags as in [`MEM_STAT_ACTUAL`] / [`MEM_STAT_RSS`].
    async fn memory_stats(&self, ctx: &CallContext, name: &str) -> BackendResult<Vec<(u32, u64)>>;

    async fn attach_disk(&self, ctx: &CallContext, name: &str, path: &str, target: &str) -> BackendResult<()>;
    async fn detach_disk(&self, ctx: &CallContext, name: &str, path: &str) -> BackendResult<()>;

    async fn dhcp_leases(&self, ctx: &CallContext, network: &str) -> BackendResult<Vec<DhcpLease>>;
}

/// `VirtSession` over the `virsh` CLI.
pub struct VirshSession {
    uri: String,
    runner: Arc<dyn CommandRunner>,
}

impl VirshSession {
    pub fn new(uri: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            uri: uri.into(),
            runner,
        }
    }

    async fn virsh(&self, ctx: &CallContext, args: &[&str]) -> BackendResult<CommandOutput> {
        let mut full = vec!["-c", self.uri.as_str(), "-q"];
        full.extend_from_slice(args);
        self.runner.run(ctx, "virsh", &full).await
    }

    async fn virsh_ok(&self, ctx: &CallContext, args: &[&str]) -> BackendResult<CommandOutput> {
        self.virsh(ctx, args).await?.check("virsh")
    }

    /// Like `virsh_ok` but a "not found" failure becomes `NotFound`.
    async fn virsh_found(&self, ctx: &CallContext, what: &str, args: &[&str]) -> BackendResult<CommandOutput> {
        let out = self.virsh(ctx, args).await?;
        if !out.success() && out.mentions_not_found() {
            return Err(BackendError::NotFound(what.to_string()));
        }
        out.check("virsh")
    }
}

#[async_trait]
impl VirtSession for VirshSession {
    async fn ping(&self, ctx: &CallContext) -> BackendResult<()> {
        match self.virsh(ctx, &["version"]).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(BackendError::Unavailable(out.stderr.trim().to_string())),
            Err(BackendError::BinaryMissing(b)) => Err(BackendError::Unavailable(format!("{b} not installed"))),
            Err(e) => Err(e),
        }
    }

    async fn default_pool(&self, ctx: &CallContext) -> BackendResult<String> {
        self.virsh_found(ctx, "storage pool default", &["pool-info", "default"]).await?;
        Ok("default".to_string())
    }

    async fn volume_path(&self, ctx: &CallContext, pool: &str, name: &str) -> BackendResult<Option<String>> {
        match self.virsh_found(ctx, name, &["vol-path", "--pool", pool, name]).await {
            Ok(out) => Ok(Some(out.stdout.trim().to_string())),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn clone_volume(&self, ctx: &CallContext, pool: &str, source: &str, target: &str) -> BackendResult<String> {
        self.virsh_ok(ctx, &["vol-clone", "--pool", pool, source, target]).await?;
        self.volume_path(ctx, pool, target)
            .await?
            .ok_or_else(|| BackendError::NotFound(target.to_string()))
    }

    async fn create_volume(&self, ctx: &CallContext, pool: &str, name: &str, capacity_bytes: u64) -> BackendResult<String> {
        let capacity = format!("{capacity_bytes}b");
        self.virsh_ok(
            ctx,
            &["vol-create-as", pool, name, &capacity, "--format", "qcow2", "--allocation", "0"],
        )
        .await?;
        self.volume_path(ctx, pool, name)
            .await?
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    async fn delete_volume(&self, ctx: &CallContext, pool: &str, name: &str) -> BackendResult<()> {
        self.virsh_found(ctx, name, &["vol-delete", "--pool", pool, name]).await?;
        Ok(())
    }

    async fn define_domain(&self, ctx: &CallContext, xml: &str) -> BackendResult<()> {
        let mut file = tempfile::Builder::new()
            .prefix("nimbus-domain-")
            .suffix(".xml")
            .tempfile()?;
        file.write_all(xml.as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().into_owned();
        self.virsh_ok(ctx, &["define", &path]).await?;
        Ok(())
    }

    async fn start_domain(&self, ctx: &CallContext, name: &str) -> BackendResult<()> {
        self.virsh_found(ctx, name, &["start", name]).await?;
        Ok(())
    }

    async fn shutdown_domain(&self, ctx: &CallContext, name: &str) -> BackendResult<()> {
        self.virsh_found(ctx, name, &["shutdown", name]).await?;
        Ok(())
    }

    async fn destroy_domain(&self, ctx: &CallContext, name: &str) -> BackendResult<()> {
        self.virsh_found(ctx, name, &["destroy", name]).await?;
        Ok(())
    }

    async fn undefine_domain(&self, ctx: &CallContext, name: &str) -> BackendResult<()> {
        self.virsh_found(ctx, name, &["undefine", name]).await?;
        Ok(())
    }

    async fn domain_state(&self, ctx: &CallContext, name: &str) -> BackendResult<Option<DomainState>> {
        match self.virsh_found(ctx, name, &["domstate", name]).await {
            Ok(out) => DomainState::parse(&out.stdout)
                .map(Some)
                .ok_or_else(|| BackendError::Rejected(format!("unknown domain state {:?}", out.stdout.trim()))),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn domain_xml(&self, ctx: &CallContext, name: &str) -> BackendResult<String> {
        Ok(self.virsh_found(ctx, name, &["dumpxml", name]).await?.stdout)
    }

    async fn memory_stats(&self, ctx: &CallContext, name: &str) -> BackendResult<Vec<(u32, u64)>> {
        let out = self.virsh_found(ctx, name, &["dommemstat", name]).await?;
        Ok(parse_memstat(&out.stdout))
    }

    async fn attach_disk(&self, ctx: &CallContext, name: &str, path: &str, target: &str) -> BackendResult<()> {
        self.virsh_ok(
            ctx,
            &["attach-disk", name, path, target, "--subdriver", "qcow2", "--persistent"],
        )
        .await?;
        Ok(())
    }

    async fn detach_disk(&self, ctx: &CallContext, name: &str, path: &str) -> BackendResult<()> {
        self.virsh_found(ctx, path, &["detach-disk", name, path, "--persistent"]).await?;
        Ok(())
    }

    async fn dhcp_leases(&self, ctx: &CallContext, network: &str) -> BackendResult<Vec<DhcpLease>> {
        let out = self.virsh_found(ctx, network, &["net-dhcp-leases", network]).await?;
        Ok(parse_leases(&out.stdout))
    }
}

/// `dommemstat` prints `name value` lines in KiB.
pub fn parse_memstat(out: &str) -> Vec<(u32, u64)> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let tag = match parts.next()? {
                "actual" => MEM_STAT_ACTUAL,
                "rss" => MEM_STAT_RSS,
                _ => return None,
            };
            let value = parts.next()?.parse().ok()?;
            Some((tag, value))
        })
        .collect()
}

/// Parses the `net-dhcp-leases` table. Header and separator lines are
/// skipped because they carry no MAC-shaped column.
pub fn parse_leases(out: &str) -> Vec<DhcpLease> {
    out.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let mac = cols
                .iter()
                .find(|c| c.len() == 17 && c.matches(':').count() == 5)?;
            let proto = cols.iter().position(|c| *c == "ipv4" || *c == "ipv6")?;
            let ip = cols.get(proto + 1)?;
            let ip = ip.split('/').next()?;
            Some(DhcpLease {
                mac: mac.to_ascii_lowercase(),
                ip: ip.to_string(),
            })
        })
        .collect()
}
