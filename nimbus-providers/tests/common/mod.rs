// Shared fakes for adapter tests: a scripted command runner and an in-memory
// hypervisor session.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nimbus_providers::hypervisor::{DhcpLease, DomainState, VirtSession};
use nimbus_providers::proxy::ProcessSignals;
use nimbus_providers::runner::{CommandOutput, CommandRunner};
use nimbus_providers::{BackendError, BackendResult, CallContext};

pub const TEST_MAC: &str = "52:54:00:aa:bb:cc";

/// Records every invocation; programs listed in `missing` behave as if not installed.
#[derive(Default)]
pub struct RecordingRunner {
    pub calls: Mutex<Vec<String>>,
    pub missing: HashSet<String>,
    pub failing: HashSet<String>,
}

impl RecordingRunner {
    pub fn without(programs: &[&str]) -> Self {
        Self {
            missing: programs.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split_whitespace().next() == Some(program))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, _ctx: &CallContext, program: &str, args: &[&str]) -> BackendResult<CommandOutput> {
        if self.missing.contains(program) {
            return Err(BackendError::BinaryMissing(program.to_string()));
        }
        self.calls.lock().unwrap().push(format!("{program} {}", args.join(" ")));
        if self.failing.contains(program) {
            return Ok(CommandOutput::failed(1, "boom"));
        }
        Ok(CommandOutput::ok(""))
    }
}

/// Records delivered signals; pids listed in `results` answer with that errno.
#[derive(Default)]
pub struct RecordingSignals {
    pub sent: Mutex<Vec<(i32, Signal)>>,
    pub results: HashMap<i32, Errno>,
}

impl RecordingSignals {
    pub fn answering(pid: i32, errno: Errno) -> Self {
        Self {
            results: HashMap::from([(pid, errno)]),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<(i32, Signal)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ProcessSignals for RecordingSignals {
    fn kill(&self, pid: i32, sig: Signal) -> Result<(), Errno> {
        self.sent.lock().unwrap().push((pid, sig));
        match self.results.get(&pid) {
            Some(errno) => Err(*errno),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct SessionState {
    pub pool_volumes: HashSet<String>,
    pub domains: HashMap<String, DomainState>,
    pub leases: Vec<DhcpLease>,
    pub memory: Vec<(u32, u64)>,
    pub attached: Vec<(String, String)>,
    pub graphics_port: Option<i32>,
    pub fail_start: bool,
    pub fail_clone: bool,
    pub fail_create_volume: bool,
    pub log: Vec<String>,
}

/// In-memory stand-in for a libvirt connection.
#[derive(Default)]
pub struct FakeSession {
    pub state: Mutex<SessionState>,
}

impl FakeSession {
    pub fn with_image(image: &str) -> Self {
        let s = Self::default();
        s.state.lock().unwrap().pool_volumes.insert(image.to_string());
        s
    }

    pub fn failing_start() -> Self {
        let s = Self::default();
        s.state.lock().unwrap().fail_start = true;
        s
    }

    /// Clones write a partial target and then fail.
    pub fn failing_clone(image: &str) -> Self {
        let s = Self::with_image(image);
        s.state.lock().unwrap().fail_clone = true;
        s
    }

    pub fn assign_lease(&self, ip: &str) {
        self.state.lock().unwrap().leases.push(DhcpLease {
            mac: TEST_MAC.to_string(),
            ip: ip.to_string(),
        });
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().unwrap().pool_volumes.contains(name)
    }

    pub fn has_domain(&self, name: &str) -> bool {
        self.state.lock().unwrap().domains.contains_key(name)
    }

    fn push(&self, entry: String) {
        self.state.lock().unwrap().log.push(entry);
    }
}

fn name_of(xml: &str) -> String {
    let doc = roxmltree::Document::parse(xml).unwrap();
    doc.descendants()
        .find(|n| n.has_tag_name("name"))
        .and_then(|n| n.text())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl VirtSession for FakeSession {
    async fn ping(&self, _ctx: &CallContext) -> BackendResult<()> {
        Ok(())
    }

    async fn default_pool(&self, _ctx: &CallContext) -> BackendResult<String> {
        Ok("default".into())
    }

    async fn volume_path(&self, _ctx: &CallContext, pool: &str, name: &str) -> BackendResult<Option<String>> {
        let st = self.state.lock().unwrap();
        Ok(st.pool_volumes.contains(name).then(|| format!("/pools/{pool}/{name}")))
    }

    async fn clone_volume(&self, _ctx: &CallContext, pool: &str, source: &str, target: &str) -> BackendResult<String> {
        self.push(format!("clone {source} {target}"));
        let mut st = self.state.lock().unwrap();
        st.pool_volumes.insert(target.to_string());
        if st.fail_clone {
            return Err(BackendError::Rejected("clone interrupted".into()));
        }
        Ok(format!("/pools/{pool}/{target}"))
    }

    async fn create_volume(&self, _ctx: &CallContext, pool: &str, name: &str, capacity_bytes: u64) -> BackendResult<String> {
        self.push(format!("create-volume {name} {capacity_bytes}"));
        let mut st = self.state.lock().unwrap();
        if st.fail_create_volume {
            return Err(BackendError::Rejected("pool is full".into()));
        }
        if !st.pool_volumes.insert(name.to_string()) {
            return Err(BackendError::Rejected(format!("storage volume '{name}' already exists")));
        }
        Ok(format!("/pools/{pool}/{name}"))
    }

    async fn delete_volume(&self, _ctx: &CallContext, _pool: &str, name: &str) -> BackendResult<()> {
        self.push(format!("delete-volume {name}"));
        if self.state.lock().unwrap().pool_volumes.remove(name) {
            Ok(())
        } else {
            Err(BackendError::NotFound(name.to_string()))
        }
    }

    async fn define_domain(&self, _ctx: &CallContext, xml: &str) -> BackendResult<()> {
        let name = name_of(xml);
        self.push(format!("define {name}"));
        self.state.lock().unwrap().domains.insert(name, DomainState::Shutoff);
        Ok(())
    }

    async fn start_domain(&self, _ctx: &CallContext, name: &str) -> BackendResult<()> {
        self.push(format!("start {name}"));
        let mut st = self.state.lock().unwrap();
        if st.fail_start {
            return Err(BackendError::Rejected("no bootable device".into()));
        }
        match st.domains.get_mut(name) {
            Some(s) => {
                *s = DomainState::Running;
                Ok(())
            }
            None => Err(BackendError::NotFound(name.to_string())),
        }
    }

    async fn shutdown_domain(&self, _ctx: &CallContext, name: &str) -> BackendResult<()> {
        self.push(format!("shutdown {name}"));
        if let Some(s) = self.state.lock().unwrap().domains.get_mut(name) {
            *s = DomainState::Shutoff;
        }
        Ok(())
    }

    async fn destroy_domain(&self, _ctx: &CallContext, name: &str) -> BackendResult<()> {
        self.push(format!("destroy {name}"));
        if let Some(s) = self.state.lock().unwrap().domains.get_mut(name) {
            *s = DomainState::Shutoff;
        }
        Ok(())
    }

    async fn undefine_domain(&self, _ctx: &CallContext, name: &str) -> BackendResult<()> {
        self.push(format!("undefine {name}"));
        match self.state.lock().unwrap().domains.remove(name) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(name.to_string())),
        }
    }

    async fn domain_state(&self, _ctx: &CallContext, name: &str) -> BackendResult<Option<DomainState>> {
        Ok(self.state.lock().unwrap().domains.get(name).copied())
    }

    async fn domain_xml(&self, _ctx: &CallContext, name: &str) -> BackendResult<String> {
        let st = self.state.lock().unwrap();
        if !st.domains.contains_key(name) {
            return Err(BackendError::NotFound(name.to_string()));
        }
        let disks: String = st
            .attached
            .iter()
            .map(|(src, dev)| format!("<disk type='file'><source file='{src}'/><target dev='{dev}'/></disk>"))
            .collect();
        let graphics = st
            .graphics_port
            .map(|p| format!("<graphics type='vnc' port='{p}' listen='127.0.0.1'/>"))
            .unwrap_or_default();
        Ok(format!(
            "<domain><name>{name}</name><devices>\
             <disk type='file'><source file='/pools/default/{name}-root'/><target dev='vda'/></disk>{disks}\
             <interface type='network'><mac address='{TEST_MAC}'/><source network='default'/></interface>\
             {graphics}</devices></domain>"
        ))
    }

    async fn memory_stats(&self, _ctx: &CallContext, _name: &str) -> BackendResult<Vec<(u32, u64)>> {
        Ok(self.state.lock().unwrap().memory.clone())
    }

    async fn attach_disk(&self, _ctx: &CallContext, name: &str, path: &str, target: &str) -> BackendResult<()> {
        self.push(format!("attach {name} {path} {target}"));
        self.state.lock().unwrap().attached.push((path.to_string(), target.to_string()));
        Ok(())
    }

    async fn detach_disk(&self, _ctx: &CallContext, name: &str, path: &str) -> BackendResult<()> {
        self.push(format!("detach {name} {path}"));
        let mut st = self.state.lock().unwrap();
        let before = st.attached.len();
        st.attached.retain(|(src, _)| src != path);
        if st.attached.len() == before {
            Err(BackendError::NotFound(path.to_string()))
        } else {
            Ok(())
        }
    }

    async fn dhcp_leases(&self, _ctx: &CallContext, _network: &str) -> BackendResult<Vec<DhcpLease>> {
        Ok(self.state.lock().unwrap().leases.clone())
    }
}
