//! Open vSwitch network adapter driven through `ovs-vsctl`, `ovs-ofctl` and `ip`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::check_identifier;
use crate::inventory::FlowRule;
use crate::runner::{CommandOutput, CommandRunner};
use crate::{BackendError, BackendResult, CallContext, NetworkBackend};

pub struct OvsNetwork {
    runner: Arc<dyn CommandRunner>,
}

impl OvsNetwork {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn vsctl(&self, ctx: &CallContext, args: &[&str]) -> BackendResult<CommandOutput> {
        self.runner.run(ctx, "ovs-vsctl", args).await?.check("ovs-vsctl")
    }

    async fn ofctl(&self, ctx: &CallContext, args: &[&str]) -> BackendResult<CommandOutput> {
        self.runner.run(ctx, "ovs-ofctl", args).await?.check("ovs-ofctl")
    }

    async fn ip(&self, ctx: &CallContext, args: &[&str]) -> BackendResult<CommandOutput> {
        self.runner.run(ctx, "ip", args).await?.check("ip")
    }
}

/// Flow lines from `dump-flows`, without the reply header.
fn parse_flows(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("NXST_FLOW") && !l.starts_with("OFPST_FLOW"))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl NetworkBackend for OvsNetwork {
    fn kind(&self) -> &'static str {
        "ovs"
    }

    async fn ping(&self, ctx: &CallContext) -> BackendResult<()> {
        match self.runner.run(ctx, "ovs-vsctl", &["show"]).await {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(BackendError::Unavailable(format!("ovs-vsctl show: {}", out.stderr.trim()))),
            Err(BackendError::BinaryMissing(b)) => Err(BackendError::Unavailable(format!("{b} not installed"))),
            Err(e) => Err(e),
        }
    }

    async fn create_bridge(&self, ctx: &CallContext, name: &str) -> BackendResult<()> {
        check_identifier("bridge", name)?;
        self.vsctl(ctx, &["--may-exist", "add-br", name]).await?;
        self.ip(ctx, &["link", "set", name, "up"]).await?;
        debug!(bridge = name, "bridge ready");
        Ok(())
    }

    async fn delete_bridge(&self, ctx: &CallContext, name: &str) -> BackendResult<()> {
        check_identifier("bridge", name)?;
        self.vsctl(ctx, &["--if-exists", "del-br", name]).await?;
        Ok(())
    }

    async fn list_bridges(&self, ctx: &CallContext) -> BackendResult<Vec<String>> {
        let out = self.vsctl(ctx, &["list-br"]).await?;
        Ok(out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    async fn add_port(&self, ctx: &CallContext, bridge: &str, port: &str) -> BackendResult<()> {
        check_identifier("bridge", bridge)?;
        check_identifier("port", port)?;
        self.vsctl(ctx, &["--may-exist", "add-port", bridge, port]).await?;
        Ok(())
    }

    async fn delete_port(&self, ctx: &CallContext, bridge: &str, port: &str) -> BackendResult<()> {
        check_identifier("bridge", bridge)?;
        check_identifier("port", port)?;
        self.vsctl(ctx, &["--if-exists", "del-port", bridge, port]).await?;
        Ok(())
    }

    async fn create_vxlan(&self, ctx: &CallContext, bridge: &str, port: &str, remote_ip: &str, vni: u32) -> BackendResult<()> {
        check_identifier("bridge", bridge)?;
        check_identifier("port", port)?;
        nimbus_common::validate::ipv4("remote_ip", remote_ip)
            .map_err(|_| BackendError::InvalidIdentifier { field: "remote_ip".into(), value: remote_ip.into() })?;
        let remote = format!("options:remote_ip={remote_ip}");
        let key = format!("options:key={vni}");
        self.vsctl(
            ctx,
            &["--may-exist", "add-port", bridge, port, "--", "set", "interface", port, "type=vxlan", &remote, &key],
        )
        .await?;
        Ok(())
    }

    async fn delete_vxlan(&self, ctx: &CallContext, bridge: &str, port: &str) -> BackendResult<()> {
        self.delete_port(ctx, bridge, port).await
    }

    async fn add_flow(&self, ctx: &CallContext, bridge: &str, rule: &FlowRule) -> BackendResult<()> {
        check_identifier("bridge", bridge)?;
        self.ofctl(ctx, &["add-flow", bridge, &rule.to_ofctl()]).await?;
        Ok(())
    }

    async fn delete_flows(&self, ctx: &CallContext, bridge: &str, matcher: &str) -> BackendResult<()> {
        check_identifier("bridge", bridge)?;
        if matcher.is_empty() {
            self.ofctl(ctx, &["del-flows", bridge]).await?;
        } else {
            self.ofctl(ctx, &["del-flows", bridge, matcher]).await?;
        }
        Ok(())
    }

    async fn list_flows(&self, ctx: &CallContext, bridge: &str) -> BackendResult<Vec<String>> {
        check_identifier("bridge", bridge)?;
        let out = self.ofctl(ctx, &["dump-flows", bridge]).await?;
        Ok(parse_flows(&out.stdout))
    }

    async fn create_veth_pair(&self, ctx: &CallContext, a: &str, b: &str) -> BackendResult<()> {
        check_identifier("veth", a)?;
        check_identifier("veth", b)?;
        self.ip(ctx, &["link", "add", a, "type", "veth", "peer", "name", b]).await?;
        self.ip(ctx, &["link", "set", a, "up"]).await?;
        self.ip(ctx, &["link", "set", b, "up"]).await?;
        Ok(())
    }

    async fn attach_veth(&self, ctx: &CallContext, bridge: &str, veth: &str) -> BackendResult<()> {
        self.add_port(ctx, bridge, veth).await
    }

    async fn delete_veth(&self, ctx: &CallContext, veth: &str) -> BackendResult<()> {
        check_identifier("veth", veth)?;
        let out = self.runner.run(ctx, "ip", &["link", "del", veth]).await?;
        if out.success() || out.stderr.contains("Cannot find device") {
            Ok(())
        } else {
            out.check("ip").map(|_| ())
        }
    }

    async fn set_veth_address(&self, ctx: &CallContext, veth: &str, cidr: &str) -> BackendResult<()> {
        check_identifier("veth", veth)?;
        self.ip(ctx, &["addr", "replace", cidr, "dev", veth]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_flows_header_is_dropped() {
        let out = "NXST_FLOW reply (xid=0x4):\n cookie=0x0, duration=1.2s, table=0, priority=100,tcp actions=NORMAL\n";
        let flows = parse_flows(out);
        assert_eq!(flows.len(), 1);
        assert!(flows[0].contains("priority=100"));
    }

    #[test]
    fn flow_rule_rendering() {
        let rule = FlowRule {
            priority: 200,
            matches: "tcp,nw_src=10.0.0.0/24,tp_dst=22".into(),
            actions: "NORMAL".into(),
        };
        assert_eq!(rule.to_ofctl(), "priority=200,tcp,nw_src=10.0.0.0/24,tp_dst=22,actions=NORMAL");
    }
}
