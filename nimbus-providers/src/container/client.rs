//! Minimal HTTP/1.1 client for the container engine's Unix socket.

use std::path::PathBuf;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::context::CallContext;
use crate::error::{BackendError, BackendResult};

pub const API_VERSION: &str = "v1.43";

#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl EngineResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> BackendResult<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| BackendError::Rejected(format!("engine returned malformed json: {e}")))
    }

    /// Error for a non-2xx answer, with the engine's `message` when present.
    pub fn into_error(self, what: &str) -> BackendError {
        let message = serde_json::from_slice::<serde_json::Value>(&self.body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(&self.body).trim().to_string());
        match self.status {
            StatusCode::NOT_FOUND => BackendError::NotFound(format!("{what}: {message}")),
            s =>BackendError::Rejected(format!("{what}: {s} {message}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineClient {
    socket: PathBuf,
}

impl EngineClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self { socket: socket.into() }
    }

    /// One request per connection; the engine closes idle connections anyway.
    pub async fn request(
        &self,
        ctx: &CallContext,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> BackendResult<EngineResponse> {
        let uri = format!("/{API_VERSION}{path}");
        let payload = match body {
            Some(v) => Bytes::from(serde_json::to_vec(v).map_err(|e| BackendError::Rejected(e.to_string()))?),
            None => Bytes::new(),
        };
        let socket = self.socket.clone();
        ctx.run(async move {
            let stream = tokio::net::UnixStream::connect(&socket)
                .await
                .map_err(|e| BackendError::Unavailable(format!("{}: {e}", socket.display())))?;
            let io = TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| BackendError::Unavailable(format!("engine handshake: {e}")))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "engine connection closed");
                }
            });

            let req = Request::builder()
                .method(method)
                .uri(&uri)
                .header("host", "docker")
                .header("content-type", "application/json")
                .body(Full::new(payload))
                .map_err(|e| BackendError::Rejected(format!("engine request: {e}")))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| BackendError::Unavailable(format!("engine request {uri}: {e}")))?;
            let status = resp.status();
            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| BackendError::Unavailable(format!("engine body: {e}")))?
                .to_bytes();
            debug!(%status, %uri, "engine call");
            Ok(EngineResponse { status, body })
        })
        .await
    }
}

/// Splits the engine's multiplexed stdout/stderr framing
/// (`[stream, 0, 0, 0, len_be32]` + payload) and concatenates the payloads.
/// Input without framing is returned as is.
pub fn demux(raw: &[u8]) -> Vec<u8> {
    let framed = raw.len() >= 8 && matches!(raw[0], 0..=2) && raw[1..4] == [0, 0, 0];
    if !framed {
        return raw.to_vec();
    }
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while rest.len() >= 8 {
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + len).min(rest.len());
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demux_frames() {
        let mut raw = vec![1, 0, 0, 0, 0, 0, 0, 3];
        raw.extend_from_slice(b"out");
        raw.extend_from_slice(&[2, 0, 0, 0, 0, 0, 0, 4]);
        raw.extend_from_slice(b"err\n");
        assert_eq!(demux(&raw), b"outerr\n");
        assert_eq!(demux(b"plain text"), b"plain text");
    }

    #[test]
    fn error_message_extraction() {
        let resp = EngineResponse {
            status: StatusCode::NOT_FOUND,
            body: Bytes::from_static(br#"{"message":"No such image: nginx:latest"}"#),
        };
        assert_eq!(
            resp.into_error("create"),
            BackendError::NotFound("create: No such image: nginx:latest".into())
        );
    }
}
