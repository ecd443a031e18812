use async_trait::async_trait;
use tokio::process::Command;

use crate::context::CallContext;
use crate::error::{BackendError, BackendResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turns a non-zero exit into `Rejected` carrying stderr.
    pub fn check(self, program: &str) -> BackendResult<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(BackendError::Rejected(format!(
                "{program} exited {}: {}",
                self.status,
                self.stderr.trim()
            )))
        }
    }

    pub fn mentions_not_found(&self) -> bool {
        let err = self.stderr.to_ascii_lowercase();
        err.contains("not found") || err.contains("no such") || err.contains("failed to get")
    }
}

/// Runs host binaries (virsh, nginx, ovs-vsctl, iptables, qemu-img, ...).
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, ctx: &CallContext, program: &str, args: &[&str]) -> BackendResult<CommandOutput>;
}

/// Real process runner. A cancelled or timed-out call kills the child.
#[derive(Debug, Default, Clone)]
pub struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, ctx: &CallContext, program: &str, args: &[&str]) -> BackendResult<CommandOutput> {
        tracing::debug!(program, ?args, "exec");
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        let fut = async {
            let out = cmd.output().await.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BackendError::BinaryMissing(program.to_string()),
                _ => BackendError::Unavailable(format!("{program}: {e}")),
            })?;
            Ok(CommandOutput {
                status: out.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            })
        };
        ctx.run(fut).await
    }
}
