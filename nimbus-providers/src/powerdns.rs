use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::inventory::{RecordSpec, ZoneInfo};
use crate::{BackendError, BackendResult, CallContext, DnsBackend};

/// DNS adapter for the PowerDNS authoritative HTTP API.
pub struct PowerDns {
    client: Client,
    base_url: String,
    api_key: String,
}

impl PowerDns {
    pub fn new(api_url: &str, api_key: &str) -> BackendResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| BackendError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: format!("{}/api/v1/servers/localhost", api_url.trim_end_matches('/')),
            api_key: api_key.trim().to_string(),
        })
    }

    async fn send(&self, ctx: &CallContext, method: Method, path: &str, body: Option<Value>) -> BackendResult<(StatusCode, Value)> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("X-API-Key", &self.api_key)
            .timeout(ctx.remaining());
        if let Some(b) = body {
            req = req.json(&b);
        }
        ctx.run(async {
            let resp = req.send().await.map_err(|e| {
                if e.is_timeout() {
                    BackendError::DeadlineExceeded
                } else {
                    BackendError::Unavailable(format!("powerdns {method} {path}: {e}"))
                }
            })?;
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let value = if text.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };
            debug!(%status, %method, path, "powerdns call");
            Ok((status, value))
        })
        .await
    }

    fn rejected(status: StatusCode, body: &Value, what: &str) -> BackendError {
        let msg = body.get("error").and_then(Value::as_str).unwrap_or("");
        match status {
            StatusCode::NOT_FOUND => BackendError::NotFound(what.to_string()),
            s => BackendError::Rejected(format!("powerdns {what}: {s} {msg}")),
        }
    }

    async fn patch_rrset(&self, ctx: &CallContext, zone_id: &str, rrset: Value) -> BackendResult<()> {
        let (status, body) = self
            .send(ctx, Method::PATCH, &format!("/zones/{zone_id}"), Some(json!({ "rrsets": [rrset] })))
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::rejected(status, &body, "rrset"))
        }
    }
}

/// Absolute, dot-terminated name; relative names are placed inside the zone.
pub fn qualify(name: &str, zone: &str) -> String {
    let zone = zone.trim_end_matches('.');
    let name = name.trim_end_matches('.');
    if name == "@" || name.is_empty() {
        format!("{zone}.")
    } else if name.ends_with(zone) {
        format!("{name}.")
    } else {
        format!("{name}.{zone}.")
    }
}

fn replace_rrset(zone_id: &str, record: &RecordSpec) -> Value {
    json!({
        "name": qualify(&record.name, zone_id),
        "type": record.record_type,
        "ttl": record.ttl,
        "changetype": "REPLACE",
        "records": [{ "content": record.content, "disabled": false }],
    })
}

#[async_trait]
impl DnsBackend for PowerDns {
    fn kind(&self) -> &'static str {
        "powerdns"
    }

    async fn ping(&self, ctx: &CallContext) -> BackendResult<()> {
        let (status, body) = self.send(ctx, Method::GET, "", None).await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::rejected(status, &body, "server"))
        }
    }

    async fn create_zone(&self, ctx: &CallContext, name: &str) -> BackendResult<ZoneInfo> {
        let fqdn = qualify("@", name);
        let (status, body) = self
            .send(
                ctx,
                Method::POST,
                "/zones",
                Some(json!({ "name": fqdn, "kind": "Native", "nameservers": [] })),
            )
            .await?;
        if !status.is_success() {
            return Err(Self::rejected(status, &body, "zone"));
        }
        let id = body.get("id").and_then(Value::as_str).unwrap_or(&fqdn).to_string();
        Ok(ZoneInfo { id, name: fqdn })
    }

    async fn delete_zone(&self, ctx: &CallContext, zone_id: &str) -> BackendResult<()> {
        let (status, body) = self.send(ctx, Method::DELETE, &format!("/zones/{zone_id}"), None).await?;
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::rejected(status, &body, "zone"))
        }
    }

    async fn get_zone(&self, ctx: &CallContext, zone_id: &str) -> BackendResult<Option<ZoneInfo>> {
        let (status, body) = self.send(ctx, Method::GET, &format!("/zones/{zone_id}"), None).await?;
        match status {
            s if s.is_success() => Ok(Some(ZoneInfo {
                id: zone_id.to_string(),
                name: body.get("name").and_then(Value::as_str).unwrap_or(zone_id).to_string(),
            })),
            StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => Ok(None),
            s => Err(Self::rejected(s, &body, "zone")),
        }
    }

    async fn add_record(&self, ctx: &CallContext, zone_id: &str, record: &RecordSpec) -> BackendResult<()> {
        self.patch_rrset(ctx, zone_id, replace_rrset(zone_id, record)).await
    }

    async fn update_record(&self, ctx: &CallContext, zone_id: &str, record: &RecordSpec) -> BackendResult<()> {
        self.patch_rrset(ctx, zone_id, replace_rrset(zone_id, record)).await
    }

    async fn delete_record(&self, ctx: &CallContext, zone_id: &str, name: &str, record_type: &str) -> BackendResult<()> {
        let rrset = json!({
            "name": qualify(name, zone_id),
            "type": record_type,
            "changetype": "DELETE",
        });
        match self.patch_rrset(ctx, zone_id, rrset).await {
            Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_records(&self, ctx: &CallContext, zone_id: &str) -> BackendResult<Vec<RecordSpec>> {
        let (status, body) = self.send(ctx, Method::GET, &format!("/zones/{zone_id}"), None).await?;
        if !status.is_success() {
            return Err(Self::rejected(status, &body, "zone"));
        }
        let rrsets = body.get("rrsets").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(rrsets
            .iter()
            .flat_map(|set| {
                let name = set.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                let rtype = set.get("type").and_then(Value::as_str).unwrap_or("").to_string();
                let ttl = set.get("ttl").and_then(Value::as_u64).unwrap_or(0) as u32;
                set.get("records")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(move |r| {
                        Some(RecordSpec {
                            name: name.clone(),
                            record_type: rtype.clone(),
                            content: r.get("content")?.as_str()?.to_string(),
                            ttl,
                        })
                    })
            })
            .collect())
    }
}
