// Shared fixtures: an in-memory store, no-op backends, a proxy that records
// what it was asked to realize and a compute backend with scripted launches.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nimbus_common::{Instance, InstanceState};
use nimbus_orchestrator::services::{InstanceRequest, Timeouts};
use nimbus_orchestrator::store::{MemoryStore, Store};
use nimbus_orchestrator::{EventPublisher, InstanceService};
use nimbus_providers::inventory::{LaunchInfo, LaunchOptions, ProxySpec, ProxyTarget};
use nimbus_providers::noop::NoopCompute;
use nimbus_providers::{
    BackendError, BackendResult, Backends, ByteStream, CallContext, ComputeBackend, LbProxy,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub enum ProxyCall {
    Deploy(String, Vec<ProxyTarget>),
    Update(String, Vec<ProxyTarget>),
    Remove(String),
}

#[derive(Default)]
pub struct RecordingProxy {
    pub calls: Mutex<Vec<ProxyCall>>,
}

impl RecordingProxy {
    pub fn calls(&self) -> Vec<ProxyCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<ProxyCall> {
        self.calls().last().cloned()
    }
}

#[async_trait]
impl LbProxy for RecordingProxy {
    fn kind(&self) -> &'static str {
        "recording"
    }

    async fn deploy(&self, _ctx: &CallContext, lb: &ProxySpec, targets: &[ProxyTarget]) -> BackendResult<String> {
        self.calls.lock().unwrap().push(ProxyCall::Deploy(lb.id.clone(), targets.to_vec()));
        Ok(lb.id.clone())
    }

    async fn update(&self, _ctx: &CallContext, lb: &ProxySpec, targets: &[ProxyTarget]) -> BackendResult<()> {
        self.calls.lock().unwrap().push(ProxyCall::Update(lb.id.clone(), targets.to_vec()));
        Ok(())
    }

    async fn remove(&self, _ctx: &CallContext, lb_id: &str) -> BackendResult<()> {
        self.calls.lock().unwrap().push(ProxyCall::Remove(lb_id.to_string()));
        Ok(())
    }
}

/// Holds the next launch inside the backend call until released.
#[derive(Clone, Default)]
pub struct LaunchGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// No-op compute whose launches fail with the queued errors first.
#[derive(Default)]
pub struct ScriptedCompute {
    pub inner: NoopCompute,
    pub launch_errors: Mutex<VecDeque<BackendError>>,
    pub launches: Mutex<u32>,
    pub launched: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    /// One-shot tasks never exit on their own; waits end only by cancellation.
    pub hold_tasks: bool,
    pub gate: Mutex<Option<LaunchGate>>,
}

impl ScriptedCompute {
    pub fn failing(errors: Vec<BackendError>) -> Self {
        Self {
            launch_errors: Mutex::new(errors.into()),
            ..Default::default()
        }
    }

    /// The next launch blocks until `release` is notified.
    pub fn gated() -> (Self, LaunchGate) {
        let gate = LaunchGate::default();
        let compute = Self {
            gate: Mutex::new(Some(gate.clone())),
            ..Default::default()
        };
        (compute, gate)
    }

    pub fn launches(&self) -> u32 {
        *self.launches.lock().unwrap()
    }

    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeBackend for ScriptedCompute {
    fn kind(&self) -> &'static str {
        "scripted"
    }

    async fn ping(&self, ctx: &CallContext) -> BackendResult<()> {
        self.inner.ping(ctx).await
    }

    async fn launch(&self, ctx: &CallContext, opts: &LaunchOptions) -> BackendResult<LaunchInfo> {
        *self.launches.lock().unwrap() += 1;
        if let Some(e) = self.launch_errors.lock().unwrap().pop_front() {
            return Err(e);
        }
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let info = self.inner.launch(ctx, opts).await?;
        self.launched.lock().unwrap().push(info.handle.clone());
        Ok(info)
    }

    async fn start(&self, ctx: &CallContext, handle: &str) -> BackendResult<()> {
        self.inner.start(ctx, handle).await
    }

    async fn stop(&self, ctx: &CallContext, handle: &str) -> BackendResult<()> {
        self.inner.stop(ctx, handle).await
    }

    async fn delete(&self, ctx: &CallContext, handle: &str) -> BackendResult<()> {
        if ctx.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        self.deleted.lock().unwrap().push(handle.to_string());
        Ok(())
    }

    async fn logs(&self, ctx: &CallContext, handle: &str) -> BackendResult<ByteStream> {
        self.inner.logs(ctx, handle).await
    }

    async fn stats(&self, ctx: &CallContext, handle: &str) -> BackendResult<ByteStream> {
        self.inner.stats(ctx, handle).await
    }

    async fn get_exposed_port(&self, ctx: &CallContext, handle: &str, internal_port: u16) -> BackendResult<u16> {
        self.inner.get_exposed_port(ctx, handle, internal_port).await
    }

    async fn get_ip(&self, ctx: &CallContext, handle: &str) -> BackendResult<String> {
        self.inner.get_ip(ctx, handle).await
    }

    async fn exec(&self, ctx: &CallContext, handle: &str, argv: &[String]) -> BackendResult<Vec<u8>> {
        self.inner.exec(ctx, handle, argv).await
    }

    async fn run_task(&self, ctx: &CallContext, opts: &LaunchOptions) -> BackendResult<LaunchInfo> {
        self.inner.run_task(ctx, opts).await
    }

    async fn wait_task(&self, ctx: &CallContext, handle: &str) -> BackendResult<i64> {
        if self.hold_tasks {
            return ctx.run(std::future::pending()).await;
        }
        self.inner.wait_task(ctx, handle).await
    }

    async fn attach_volume(&self, ctx: &CallContext, handle: &str, path: &str) -> BackendResult<()> {
        self.inner.attach_volume(ctx, handle, path).await
    }

    async fn detach_volume(&self, ctx: &CallContext, handle: &str, path: &str) -> BackendResult<()> {
        self.inner.detach_volume(ctx, handle, path).await
    }
}

pub struct Fixture {
    pub mem: Arc<MemoryStore>,
    pub store: Arc<dyn Store>,
    pub proxy: Arc<RecordingProxy>,
    pub compute: Arc<ScriptedCompute>,
    pub svc: InstanceService,
    pub token: CancellationToken,
}

pub fn fixture() -> Fixture {
    fixture_with(ScriptedCompute::default())
}

pub fn fixture_with(compute: ScriptedCompute) -> Fixture {
    let mem = Arc::new(MemoryStore::new());
    let store: Arc<dyn Store> = mem.clone();
    let proxy = Arc::new(RecordingProxy::default());
    let compute = Arc::new(compute);
    let backends = Backends {
        compute: compute.clone(),
        proxy: proxy.clone(),
        ..Backends::noop()
    };
    let token = CancellationToken::new();
    let svc = InstanceService::new(store.clone(), backends, EventPublisher::default(), token.clone()).with_timeouts(
        Timeouts {
            call: Duration::from_secs(5),
            ip_wait: Duration::from_secs(1),
        },
    );
    Fixture {
        mem,
        store,
        proxy,
        compute,
        svc,
        token,
    }
}

impl Fixture {
    /// Records and launches an instance; it ends Running with the no-op address.
    pub async fn running(&self, name: &str, vpc_id: Option<uuid::Uuid>) -> Instance {
        let inst = self
            .svc
            .create(InstanceRequest {
                name: name.into(),
                image: "alpine".into(),
                vpc_id,
                ..Default::default()
            })
            .await
            .unwrap();
        let running = self.svc.launch(inst.id).await.unwrap();
        assert_eq!(running.state, InstanceState::Running);
        running
    }

    pub async fn instance(&self, id: uuid::Uuid) -> Instance {
        self.store.get_instance(id).await.unwrap().unwrap()
    }
}

/// Lets spawned launches run to completion.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
}
