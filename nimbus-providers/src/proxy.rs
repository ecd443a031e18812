//! Host reverse-proxy adapter: one nginx process per load balancer, with its
//! configuration and PID file under `<workdir>/lb/<lb-id>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use minijinja::{context, AutoEscape, Environment};
use nimbus_common::LbAlgorithm;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::check_identifier;
use crate::inventory::{ProxySpec, ProxyTarget};
use crate::runner::CommandRunner;
use crate::{BackendError, BackendResult, CallContext, ComputeBackend, LbProxy};

const CONFIG_TEMPLATE: &str = r#"# nimbus load balancer {{ id }}
pid {{ pid_path }};
daemon on;
error_log {{ dir }}/error.log warn;

events {
    worker_connections 1024;
}

http {
    access_log off;

{% if upstreams %}
    upstream {{ pool }} {
{% if least_conn %}
        least_conn;
{% endif %}
{% for u in upstreams %}
        server {{ u.ip }}:{{ u.port }} weight={{ u.weight }};
{% endfor %}
    }

{% endif %}
    server {
        listen {{ port }};

        location / {
{% if upstreams %}
            proxy_pass http://{{ pool }};
            proxy_set_header Host $host;
            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
            proxy_next_upstream error timeout http_502 http_503;
{% else %}
            return 503 "No targets available";
{% endif %}
        }
    }
}
"#;

/// A target after address resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Upstream {
    pub ip: String,
    pub port: u16,
    pub weight: u32,
}

/// Renders the configuration for `lb` with the given resolved upstreams.
/// An empty upstream list yields a listener that answers 503.
pub fn render_config(lb: &ProxySpec, dir: &Path, upstreams: &[Upstream]) -> BackendResult<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_auto_escape_callback(|_| AutoEscape::None);
    env.add_template("nginx.conf", CONFIG_TEMPLATE)
        .map_err(|e| BackendError::Rejected(format!("proxy template: {e}")))?;
    let pid_path = dir.join("pid");
    env.get_template("nginx.conf")
        .and_then(|t| {
            t.render(context! {
                id => lb.id,
                pool => format!("lb_{}", lb.id.replace('-', "_")),
                port => lb.port,
                least_conn => lb.algorithm == LbAlgorithm::LeastConnections,
                upstreams => upstreams,
                dir => dir.display().to_string(),
                pid_path => pid_path.display().to_string(),
            })
        })
        .map_err(|e| BackendError::Rejected(format!("proxy template: {e}")))
}

/// Delivers signals to proxy processes.
pub trait ProcessSignals: Send + Sync {
    fn kill(&self, pid: i32, sig: Signal) -> Result<(), Errno>;
}

pub struct NixSignals;

impl ProcessSignals for NixSignals {
    fn kill(&self, pid: i32, sig: Signal) -> Result<(), Errno> {
        signal::kill(Pid::from_raw(pid), sig)
    }
}

pub struct NginxProxy {
    workdir: PathBuf,
    binary: String,
    compute: Arc<dyn ComputeBackend>,
    runner: Arc<dyn CommandRunner>,
    signals: Arc<dyn ProcessSignals>,
}

impl NginxProxy {
    pub fn new(workdir: impl Into<PathBuf>, compute: Arc<dyn ComputeBackend>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            workdir: workdir.into(),
            binary: "nginx".to_string(),
            compute,
            runner,
            signals: Arc::new(NixSignals),
        }
    }

    pub fn with_signals(mut self, signals: Arc<dyn ProcessSignals>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn lb_dir(&self, lb_id: &str) -> PathBuf {
        self.workdir.join("lb").join(lb_id)
    }

    /// Targets whose address lookup fails are left out of this rendering.
    async fn resolve(&self, ctx: &CallContext, lb_id: &str, targets: &[ProxyTarget]) -> Vec<Upstream> {
        let mut upstreams = Vec::with_capacity(targets.len());
        for t in targets {
            match self.compute.get_ip(ctx, &t.instance_handle).await {
                Ok(ip) => upstreams.push(Upstream {
                    ip,
                    port: t.port,
                    weight: t.weight.max(1),
                }),
                Err(e) => {
                    debug!(lb_id, handle = %t.instance_handle, error = %e, "target unresolved, omitted");
                }
            }
        }
        upstreams
    }

    async fn write_config(&self, ctx: &CallContext, lb: &ProxySpec, targets: &[ProxyTarget]) -> BackendResult<PathBuf> {
        check_identifier("lb_id", &lb.id)?;
        let upstreams = self.resolve(ctx, &lb.id, targets).await;
        let dir = self.lb_dir(&lb.id);
        let config = render_config(lb, &dir, &upstreams)?;
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("config");
        tokio::fs::write(&path, config).await?;
        debug!(lb_id = %lb.id, upstreams = upstreams.len(), "proxy config written");
        Ok(path)
    }

    /// Zero and negative values address process groups and are never used.
    async fn read_pid(&self, lb_id: &str) -> Option<i32> {
        let raw = tokio::fs::read_to_string(self.lb_dir(lb_id).join("pid")).await.ok()?;
        raw.trim().parse().ok().filter(|pid| *pid > 0)
    }

    /// `Ok(false)` when the process no longer exists.
    fn signal(&self, pid: i32, sig: Signal) -> BackendResult<bool> {
        match self.signals.kill(pid, sig) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(BackendError::Rejected(format!("{sig} to proxy pid {pid}: {e}"))),
        }
    }

    async fn launch_process(&self, ctx: &CallContext, lb_id: &str, config: &Path) -> BackendResult<()> {
        let dir = self.lb_dir(lb_id);
        let prefix = dir.display().to_string();
        let conf = config.display().to_string();
        self.runner
            .run(ctx, &self.binary, &["-p", &prefix, "-c", &conf])
            .await?
            .check(&self.binary)?;
        info!(lb_id, "proxy started");
        Ok(())
    }

    /// Reloads a live process, or starts one when none is running.
    async fn reload_or_start(&self, ctx: &CallContext, lb_id: &str, config: &Path) -> BackendResult<()> {
        if let Some(pid) = self.read_pid(lb_id).await {
            if self.signal(pid, Signal::SIGHUP)? {
                debug!(lb_id, pid, "proxy reloaded");
                return Ok(());
            }
            warn!(lb_id, pid, "stale pid file, restarting proxy");
        }
        self.launch_process(ctx, lb_id, config).await
    }
}

#[async_trait]
impl LbProxy for NginxProxy {
    fn kind(&self) -> &'static str {
        "nginx"
    }

    async fn deploy(&self, ctx: &CallContext, lb: &ProxySpec, targets: &[ProxyTarget]) -> BackendResult<String> {
        let config = self.write_config(ctx, lb, targets).await?;
        self.reload_or_start(ctx, &lb.id, &config).await?;
        Ok(lb.id.clone())
    }

    async fn update(&self, ctx: &CallContext, lb: &ProxySpec, targets: &[ProxyTarget]) -> BackendResult<()> {
        let config = self.write_config(ctx, lb, targets).await?;
        self.reload_or_start(ctx, &lb.id, &config).await
    }

    async fn remove(&self, _ctx: &CallContext, lb_id: &str) -> BackendResult<()> {
        check_identifier("lb_id", lb_id)?;
        if let Some(pid) = self.read_pid(lb_id).await {
            if !self.signal(pid, Signal::SIGTERM)? {
                debug!(lb_id, pid, "proxy already gone");
            }
        }
        match tokio::fs::remove_dir_all(self.lb_dir(lb_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(lb_id, "proxy removed");
        Ok(())
    }
}
