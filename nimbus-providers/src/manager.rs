use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::container::ContainerBackend;
use crate::hypervisor::{HypervisorBackend, MachineProfile, VirshSession};
use crate::noop::{NoopCompute, NoopDns, NoopNetwork, NoopProxy, NoopStorage};
use crate::ovs::OvsNetwork;
use crate::powerdns::PowerDns;
use crate::proxy::NginxProxy;
use crate::runner::{CommandRunner, HostRunner};
use crate::storage::LocalStorage;
use crate::{BackendError, CallContext, ComputeBackend, DnsBackend, LbProxy, NetworkBackend, StorageBackend};

const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeKind {
    ContainerRuntime,
    Hypervisor,
    MicroVm,
    Noop,
}

impl FromStr for ComputeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "container-runtime" | "container" | "docker" => Ok(ComputeKind::ContainerRuntime),
            "hypervisor" | "libvirt" => Ok(ComputeKind::Hypervisor),
            "micro-vm" | "microvm" => Ok(ComputeKind::MicroVm),
            "noop" => Ok(ComputeKind::Noop),
            other => Err(format!("unknown compute backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Ovs,
    Noop,
    /// No network backend at all; health reports "unavailable".
    Disabled,
}

impl FromStr for NetworkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ovs" | "openvswitch" => Ok(NetworkKind::Ovs),
            "noop" => Ok(NetworkKind::Noop),
            "none" | "disabled" => Ok(NetworkKind::Disabled),
            other => Err(format!("unknown network backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsKind {
    PowerDns,
    Noop,
}

impl FromStr for DnsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "powerdns" | "pdns" => Ok(DnsKind::PowerDns),
            "noop" => Ok(DnsKind::Noop),
            other => Err(format!("unknown dns backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub compute: ComputeKind,
    pub network: NetworkKind,
    pub dns: DnsKind,
    pub workdir: PathBuf,
    pub libvirt_uri: String,
    pub docker_socket: PathBuf,
    pub microvm_kernel: String,
    pub pdns_api_url: Option<String>,
    pub pdns_api_key: Option<String>,
}

/// The adapters chosen at startup. Cloning shares the same adapter values.
#[derive(Clone)]
pub struct Backends {
    pub compute: Arc<dyn ComputeBackend>,
    pub network: Option<Arc<dyn NetworkBackend>>,
    pub storage: Arc<dyn StorageBackend>,
    pub proxy: Arc<dyn LbProxy>,
    pub dns: Arc<dyn DnsBackend>,
    /// True when the configured network backend failed and the no-op one stands in.
    pub network_degraded: bool,
}

impl Backends {
    /// Everything no-op. Used by tests and the `noop` profile.
    pub fn noop() -> Self {
        Self {
            compute: Arc::new(NoopCompute),
            network: Some(Arc::new(NoopNetwork)),
            storage: Arc::new(NoopStorage),
            proxy: Arc::new(NoopProxy),
            dns: Arc::new(NoopDns),
            network_degraded: false,
        }
    }

    pub async fn close(&self) {
        self.compute.close().await;
    }
}

/// Builds and pings every adapter. The compute backend must answer its ping;
/// only the network backend may fall back to no-op.
pub async fn select_backends(cfg: &BackendConfig) -> Result<Backends, BackendError> {
    select_with_runner(cfg, Arc::new(HostRunner)).await
}

pub async fn select_with_runner(cfg: &BackendConfig, runner: Arc<dyn CommandRunner>) -> Result<Backends, BackendError> {
    let ping = CallContext::with_timeout(PING_TIMEOUT);

    let compute: Arc<dyn ComputeBackend> = match cfg.compute {
        ComputeKind::ContainerRuntime => Arc::new(ContainerBackend::new(&cfg.docker_socket)),
        ComputeKind::Hypervisor => Arc::new(HypervisorBackend::new(
            Arc::new(VirshSession::new(&cfg.libvirt_uri, runner.clone())),
            runner.clone(),
            MachineProfile::Standard,
        )),
        ComputeKind::MicroVm => Arc::new(HypervisorBackend::new(
            Arc::new(VirshSession::new(&cfg.libvirt_uri, runner.clone())),
            runner.clone(),
            MachineProfile::MicroVm {
                kernel: cfg.microvm_kernel.clone(),
            },
        )),
        ComputeKind::Noop => Arc::new(NoopCompute),
    };
    compute.ping(&ping).await?;
    info!(backend = compute.kind(), "compute backend ready");

    let (network, network_degraded): (Option<Arc<dyn NetworkBackend>>, bool) = match cfg.network {
        NetworkKind::Disabled => (None, false),
        NetworkKind::Noop => (Some(Arc::new(NoopNetwork)), false),
        NetworkKind::Ovs => {
            let ovs = OvsNetwork::new(runner.clone());
            match ovs.ping(&ping).await {
                Ok(()) => (Some(Arc::new(ovs)), false),
                Err(e) => {
                    warn!(error = %e, "ovs unavailable, falling back to noop network (degraded)");
                    (Some(Arc::new(NoopNetwork)), true)
                }
            }
        }
    };

    let (storage, proxy): (Arc<dyn StorageBackend>, Arc<dyn LbProxy>) = match cfg.compute {
        ComputeKind::Noop => (Arc::new(NoopStorage), Arc::new(NoopProxy)),
        _ => (
            Arc::new(LocalStorage::new(cfg.workdir.join("storage"), runner.clone())),
            Arc::new(NginxProxy::new(&cfg.workdir, compute.clone(), runner.clone())),
        ),
    };
    storage.ping(&ping).await?;

    let dns: Arc<dyn DnsBackend> = match cfg.dns {
        DnsKind::Noop => Arc::new(NoopDns),
        DnsKind::PowerDns => {
            let url = cfg
                .pdns_api_url
                .as_deref()
                .ok_or_else(|| BackendError::Unavailable("PDNS_API_URL is not set".into()))?;
            let dns = PowerDns::new(url, cfg.pdns_api_key.as_deref().unwrap_or(""))?;
            dns.ping(&ping).await?;
            Arc::new(dns)
        }
    };

    Ok(Backends {
        compute,
        network,
        storage,
        proxy,
        dns,
        network_degraded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use async_trait::async_trait;

    struct NoOvs;

    #[async_trait]
    impl CommandRunner for NoOvs {
        async fn run(&self, _ctx: &CallContext, program: &str, _args: &[&str]) -> crate::BackendResult<CommandOutput> {
            if program.starts_with("ovs") {
                Err(BackendError::BinaryMissing(program.to_string()))
            } else {
                Ok(CommandOutput::ok(""))
            }
        }
    }

    fn config(compute: ComputeKind, network: NetworkKind, workdir: PathBuf) -> BackendConfig {
        BackendConfig {
            compute,
            network,
            dns: DnsKind::Noop,
            workdir,
            libvirt_uri: "qemu:///system".into(),
            docker_socket: PathBuf::from("/nonexistent/docker.sock"),
            microvm_kernel: String::new(),
            pdns_api_url: None,
            pdns_api_key: None,
        }
    }

    #[tokio::test]
    async fn network_falls_back_to_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(ComputeKind::Noop, NetworkKind::Ovs, dir.path().to_path_buf());
        let backends = select_with_runner(&cfg, Arc::new(NoOvs)).await.unwrap();
        assert!(backends.network_degraded);
        assert_eq!(backends.network.map(|n| n.kind()), Some("noop"));
    }

    #[tokio::test]
    async fn compute_never_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(ComputeKind::ContainerRuntime, NetworkKind::Noop, dir.path().to_path_buf());
        assert!(matches!(
            select_with_runner(&cfg, Arc::new(NoOvs)).await,
            Err(BackendError::Unavailable(_))
        ));
    }

    #[test]
    fn kinds_parse() {
        assert_eq!("micro-vm".parse::<ComputeKind>(), Ok(ComputeKind::MicroVm));
        assert_eq!("none".parse::<NetworkKind>(), Ok(NetworkKind::Disabled));
        assert!("xen".parse::<ComputeKind>().is_err());
    }
}
