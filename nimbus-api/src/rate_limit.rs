//! Per-client token buckets.
//!
//! A client is keyed by the prefix of its API key when it sends one, else by
//! remote address. Every bucket gets the same rate and burst. The whole map
//! is dropped on each cleanup tick, so an idle client simply starts over
//! with a full bucket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use nimbus_common::CoreError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::app::AppState;
use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";
const KEY_PREFIX_LEN: usize = 8;
pub const CLEANUP_PERIOD: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate: f64::from(rate_per_sec.max(1)),
            burst: f64::from(burst.max(1)),
        }
    }

    /// Takes one token from `key`'s bucket. False when the bucket is empty.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let Ok(mut buckets) = self.buckets.lock() else {
            return true;
        };
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn wipe(&self) {
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.clear();
        }
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Wipes the bucket map every `period` until `token` is cancelled.
    pub fn spawn_cleanup(self: &Arc<Self>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let dropped = limiter.tracked_clients();
                        limiter.wipe();
                        tracing::debug!(dropped, "rate limiter buckets wiped");
                    }
                }
            }
        })
    }
}

/// Bucket key for a request: API-key prefix, else remote address.
pub fn client_key(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .map(str::trim)
        .filter(|k| !k.is_empty());

    match (api_key, remote) {
        (Some(k), _) => format!("key:{}", k.chars().take(KEY_PREFIX_LEN).collect::<String>()),
        (None, Some(addr)) => format!("ip:{}", addr.ip()),
        (None, None) => "anonymous".to_string(),
    }
}

pub async fn limit(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let remote = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
    let key = client_key(req.headers(), remote);
    if !state.limiter.check(&key) {
        tracing::debug!(client = %key, "request rate limited");
        return ApiError(CoreError::RateLimited).into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn burst_then_refill() {
        let limiter = RateLimiter::new(2, 3);
        let t0 = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check_at("c", t0));
        }
        assert!(!limiter.check_at("c", t0));
        // Less than 1/R later nothing has refilled.
        assert!(!limiter.check_at("c", t0 + Duration::from_millis(400)));
        assert!(limiter.check_at("c", t0 + Duration::from_millis(900)));
        assert!(!limiter.check_at("c", t0 + Duration::from_millis(900)));
    }

    #[test]
    fn clients_are_independent() {
        let limiter = RateLimiter::new(1, 1);
        let t0 = Instant::now();
        assert!(limiter.check_at("a", t0));
        assert!(!limiter.check_at("a", t0));
        assert!(limiter.check_at("b", t0));
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn wipe_restores_full_buckets() {
        let limiter = RateLimiter::new(1, 1);
        let t0 = Instant::now();
        assert!(limiter.check_at("a", t0));
        assert!(!limiter.check_at("a", t0));
        limiter.wipe();
        assert_eq!(limiter.tracked_clients(), 0);
        assert!(limiter.check_at("a", t0));
    }

    #[test]
    fn keys_prefer_api_key_prefix() {
        let addr: SocketAddr = "192.0.2.7:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, Some(addr)), "ip:192.0.2.7");
        assert_eq!(client_key(&headers, None), "anonymous");

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer nk_live_abcdef123"));
        assert_eq!(client_key(&headers, Some(addr)), "key:nk_live_");

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("zz"));
        assert_eq!(client_key(&headers, Some(addr)), "key:zz");
    }
}
