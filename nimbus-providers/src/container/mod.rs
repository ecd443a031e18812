//! Container-runtime compute adapter: the engine's JSON API over its Unix socket.

pub mod client;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use http::{Method, StatusCode};
use nimbus_common::validate::sanitize_domain_name;
use nimbus_common::PortMapping;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::check_identifier;
use crate::inventory::{LaunchInfo, LaunchOptions};
use crate::{BackendError, BackendResult, ByteStream, CallContext, ComputeBackend};

pub use client::{demux, EngineClient, EngineResponse};

pub const LABEL_MANAGED: &str = "nimbus.managed";
pub const LABEL_TENANT: &str = "nimbus.tenant";

pub struct ContainerBackend {
    client: EngineClient,
    poll_interval: Duration,
}

impl ContainerBackend {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            client: EngineClient::new(socket),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn call(&self, ctx: &CallContext, method: Method, path: &str, body: Option<&Value>) -> BackendResult<EngineResponse> {
        self.client.request(ctx, method, path, body).await
    }

    async fn inspect(&self, ctx: &CallContext, handle: &str) -> BackendResult<Value> {
        let resp = self.call(ctx, Method::GET, &format!("/containers/{handle}/json"), None).await?;
        if !resp.is_success() {
            return Err(resp.into_error("inspect"));
        }
        resp.json()
    }

    async fn pull(&self, ctx: &CallContext, image: &str) -> BackendResult<()> {
        let (repo, tag) = split_image(image);
        info!(image, "pulling image");
        let resp = self
            .call(ctx, Method::POST, &format!("/images/create?fromImage={repo}&tag={tag}"), None)
            .await?;
        if !resp.is_success() {
            return Err(resp.into_error("pull"));
        }
        Ok(())
    }

    async fn create(&self, ctx: &CallContext, name: &str, body: &Value, image: &str) -> BackendResult<String> {
        let path = format!("/containers/create?name={name}");
        let mut resp = self.call(ctx, Method::POST, &path, Some(body)).await?;
        if resp.status == StatusCode::NOT_FOUND {
            self.pull(ctx, image).await?;
            resp = self.call(ctx, Method::POST, &path, Some(body)).await?;
        }
        if !resp.is_success() {
            return Err(resp.into_error("create"));
        }
        let created: Value = resp.json()?;
        created
            .get("Id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::Rejected("create: response without Id".into()))
    }

    async fn remove(&self, ctx: &CallContext, handle: &str) -> BackendResult<()> {
        let resp = self
            .call(ctx, Method::DELETE, &format!("/containers/{handle}?force=true&v=true"), None)
            .await?;
        match resp.status {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            _ => Err(resp.into_error("delete")),
        }
    }

    async fn create_and_start(&self, ctx: &CallContext, opts: &LaunchOptions, task: bool) -> BackendResult<LaunchInfo> {
        let name = sanitize_domain_name(&opts.name);
        check_identifier("name", &name)?;
        if opts.image.trim().is_empty() {
            return Err(BackendError::Rejected("image reference is empty".into()));
        }
        let body = create_body(opts, task);
        let id = self.create(ctx, &name, &body, &opts.image).await?;
        if let Err(e) = self.start(ctx, &id).await {
            warn!(container = %name, error = %e, "start failed, removing container");
            if let Err(e) = self.remove(ctx, &id).await {
                warn!(container = %name, error = %e, "rollback: remove failed");
            }
            return Err(e);
        }
        info!(container = %name, id = %id, "container started");
        Ok(LaunchInfo {
            handle: id,
            info: json!({ "name": name }),
        })
    }
}

/// `repo[:tag]`; a colon inside the registry host is not a tag separator.
fn split_image(image: &str) -> (&str, &str) {
    match image.rfind(':') {
        Some(i) if !image[i..].contains('/') => (&image[..i], &image[i + 1..]),
        _ => (image, "latest"),
    }
}

fn create_body(opts: &LaunchOptions, task: bool) -> Value {
    let mut exposed = serde_json::Map::new();
    let mut bindings = serde_json::Map::new();
    for raw in &opts.ports {
        match PortMapping::parse(raw) {
            Some(p) => {
                let key = format!("{}/tcp", p.internal);
                exposed.insert(key.clone(), json!({}));
                bindings.insert(key, json!([{ "HostPort": p.external.to_string() }]));
            }
            None => warn!(mapping = %raw, "skipping malformed port mapping"),
        }
    }

    let mut labels: BTreeMap<String, String> = opts.labels.iter().cloned().collect();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    if let Some(tenant) = &opts.tenant {
        labels.insert(LABEL_TENANT.to_string(), tenant.clone());
    }
    if task {
        labels.insert("nimbus.task".to_string(), "true".to_string());
    }

    let env: Vec<String> = opts.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let mut host = json!({
        "PortBindings": bindings,
        "Binds": opts.volumes,
    });
    if let Some(cpus) = opts.cpus {
        host["NanoCpus"] = json!(u64::from(cpus) * 1_000_000_000);
    }
    if let Some(mem) = opts.memory_bytes {
        host["Memory"] = json!(mem);
    }
    if let Some(net) = &opts.network {
        host["NetworkMode"] = json!(net);
    }

    let mut body = json!({
        "Image": opts.image,
        "Env": env,
        "Labels": labels,
        "ExposedPorts": exposed,
        "HostConfig": host,
    });
    if !opts.command.is_empty() {
        body["Cmd"] = json!(opts.command);
    }
    body
}

fn container_ip(inspect: &Value) -> Option<String> {
    let settings = inspect.get("NetworkSettings")?;
    let direct = settings.get("IPAddress").and_then(Value::as_str).filter(|s| !s.is_empty());
    if let Some(ip) = direct {
        return Some(ip.to_string());
    }
    settings
        .get("Networks")?
        .as_object()?
        .values()
        .filter_map(|n| n.get("IPAddress").and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ComputeBackend for ContainerBackend {
    fn kind(&self) -> &'static str {
        "container-runtime"
    }

    async fn ping(&self, ctx: &CallContext) -> BackendResult<()> {
        let resp = self.call(ctx, Method::GET, "/_ping", None).await?;
        if resp.is_success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!("engine ping: {}", resp.status)))
        }
    }

    async fn launch(&self, ctx: &CallContext, opts: &LaunchOptions) -> BackendResult<LaunchInfo> {
        self.create_and_start(ctx, opts, false).await
    }

    async fn start(&self, ctx: &CallContext, handle: &str) -> BackendResult<()> {
        let resp = self.call(ctx, Method::POST, &format!("/containers/{handle}/start"), None).await?;
        match resp.status {
            s if s.is_success() || s == StatusCode::NOT_MODIFIED => Ok(()),
            _ => Err(resp.into_error("start")),
        }
    }

    async fn stop(&self, ctx: &CallContext, handle: &str) -> BackendResult<()> {
        let resp = self.call(ctx, Method::POST, &format!("/containers/{handle}/stop?t=10"), None).await?;
        match resp.status {
            s if s.is_success() || s == StatusCode::NOT_MODIFIED => Ok(()),
            _ => Err(resp.into_error("stop")),
        }
    }

    async fn delete(&self, ctx: &CallContext, handle: &str) -> BackendResult<()> {
        self.remove(ctx, handle).await
    }

    async fn logs(&self, ctx: &CallContext, handle: &str) -> BackendResult<ByteStream> {
        let resp = self
            .call(ctx, Method::GET, &format!("/containers/{handle}/logs?stdout=1&stderr=1"), None)
            .await?;
        if !resp.is_success() {
            return Err(resp.into_error("logs"));
        }
        Ok(stream::iter([Ok(Bytes::from(demux(&resp.body)))]).boxed())
    }

    async fn stats(&self, ctx: &CallContext, handle: &str) -> BackendResult<ByteStream> {
        let resp = self
            .call(ctx, Method::GET, &format!("/containers/{handle}/stats?stream=false"), None)
            .await?;
        if !resp.is_success() {
            return Err(resp.into_error("stats"));
        }
        Ok(stream::iter([Ok(resp.body)]).boxed())
    }

    async fn get_exposed_port(&self, ctx: &CallContext, handle: &str, internal_port: u16) -> BackendResult<u16> {
        let inspect = self.inspect(ctx, handle).await?;
        inspect
            .pointer(&format!("/NetworkSettings/Ports/{internal_port}~1tcp/0/HostPort"))
            .and_then(Value::as_str)
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| BackendError::NotFound(format!("{handle} port {internal_port}")))
    }

    async fn get_ip(&self, ctx: &CallContext, handle: &str) -> BackendResult<String> {
        loop {
            let inspect = match self.inspect(ctx, handle).await {
                Err(BackendError::DeadlineExceeded) => return Err(BackendError::IpNotAssigned(handle.to_string())),
                other => other?,
            };
            if let Some(ip) = container_ip(&inspect) {
                return Ok(ip);
            }
            match ctx.sleep(self.poll_interval).await {
                Err(BackendError::DeadlineExceeded) => return Err(BackendError::IpNotAssigned(handle.to_string())),
                other => other?,
            }
        }
    }

    async fn exec(&self, ctx: &CallContext, handle: &str, argv: &[String]) -> BackendResult<Vec<u8>> {
        let create = json!({ "AttachStdout": true, "AttachStderr": true, "Tty": false, "Cmd": argv });
        let resp = self
            .call(ctx, Method::POST, &format!("/containers/{handle}/exec"), Some(&create))
            .await?;
        if !resp.is_success() {
            return Err(resp.into_error("exec create"));
        }
        let exec_id = resp
            .json::<Value>()?
            .get("Id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BackendError::Rejected("exec: response without Id".into()))?;
        let start = json!({ "Detach": false, "Tty": false });
        let resp = self
            .call(ctx, Method::POST, &format!("/exec/{exec_id}/start"), Some(&start))
            .await?;
        if !resp.is_success() {
            return Err(resp.into_error("exec start"));
        }
        Ok(demux(&resp.body))
    }

    async fn run_task(&self, ctx: &CallContext, opts: &LaunchOptions) -> BackendResult<LaunchInfo> {
        self.create_and_start(ctx, opts, true).await
    }

    async fn wait_task(&self, ctx: &CallContext, handle: &str) -> BackendResult<i64> {
        let resp = self.call(ctx, Method::POST, &format!("/containers/{handle}/wait"), None).await?;
        if !resp.is_success() {
            return Err(resp.into_error("wait"));
        }
        resp.json::<Value>()?
            .get("StatusCode")
            .and_then(Value::as_i64)
            .ok_or_else(|| BackendError::Rejected("wait: response without StatusCode".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_reference_split() {
        assert_eq!(split_image("nginx"), ("nginx", "latest"));
        assert_eq!(split_image("nginx:1.25"), ("nginx", "1.25"));
        assert_eq!(split_image("registry:5000/app"), ("registry:5000/app", "latest"));
        assert_eq!(split_image("registry:5000/app:v2"), ("registry:5000/app", "v2"));
    }

    #[test]
    fn create_body_maps_options() {
        let opts = LaunchOptions {
            name: "web".into(),
            image: "nginx".into(),
            cpus: Some(2),
            memory_bytes: Some(256 * 1024 * 1024),
            ports: vec!["8080:80".into(), "bogus".into()],
            env: vec![("MODE".into(), "prod".into())],
            tenant: Some("acme".into()),
            ..Default::default()
        };
        let body = create_body(&opts, false);
        assert_eq!(body["HostConfig"]["PortBindings"]["80/tcp"][0]["HostPort"], "8080");
        assert_eq!(body["HostConfig"]["NanoCpus"], 2_000_000_000u64);
        assert_eq!(body["Env"][0], "MODE=prod");
        assert_eq!(body["Labels"][LABEL_TENANT], "acme");
        assert!(body.get("Cmd").is_none());
        assert_eq!(body["ExposedPorts"].as_object().map(|m| m.len()), Some(1));
    }

    #[test]
    fn ip_from_network_map() {
        let inspect = json!({"NetworkSettings": {"IPAddress": "", "Networks": {"br": {"IPAddress": "172.18.0.4"}}}});
        assert_eq!(container_ip(&inspect).as_deref(), Some("172.18.0.4"));
        assert_eq!(container_ip(&json!({"NetworkSettings": {"IPAddress": ""}})), None);
    }
}
