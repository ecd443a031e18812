//! Worker runtime: each reconciler runs as one long-lived task that ticks,
//! does one pass, and records when it last completed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nimbus_common::CoreResult;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;
    fn period(&self) -> Duration;

    /// One pass. Returns how many items were acted on. Per-item failures are
    /// logged inside; an `Err` means the pass itself could not run.
    async fn reconcile(&self, token: &CancellationToken) -> CoreResult<usize>;

    /// Runs once after the loop exits, before the worker task ends.
    async fn shutdown(&self) {}
}

/// Last completed iteration per worker.
#[derive(Clone, Default)]
pub struct WorkerHealth {
    ticks: Arc<RwLock<HashMap<&'static str, DateTime<Utc>>>>,
}

impl WorkerHealth {
    pub fn record(&self, name: &'static str) {
        if let Ok(mut m) = self.ticks.write() {
            m.insert(name, Utc::now());
        }
    }

    pub fn snapshot(&self) -> HashMap<&'static str, DateTime<Utc>> {
        self.ticks.read().map(|m| m.clone()).unwrap_or_default()
    }
}

/// Owns the worker tasks. Callers only start workers and wait for them.
#[derive(Default)]
pub struct Workers {
    set: JoinSet<()>,
    health: WorkerHealth,
}

impl Workers {
    pub fn new(health: WorkerHealth) -> Self {
        Self {
            set: JoinSet::new(),
            health,
        }
    }

    pub fn health(&self) -> WorkerHealth {
        self.health.clone()
    }

    pub fn spawn(&mut self, worker: Arc<dyn Reconciler>, token: CancellationToken) {
        let health = self.health.clone();
        self.set.spawn(run_loop(worker, token, health));
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Waits for every worker to exit.
    pub async fn join(mut self) {
        while let Some(res) = self.set.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
    }
}

async fn run_loop(worker: Arc<dyn Reconciler>, token: CancellationToken, health: WorkerHealth) {
    let name = worker.name();
    let mut interval = tokio::time::interval(worker.period());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(worker = name, period_ms = worker.period().as_millis() as u64, "worker started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        match worker.reconcile(&token).await {
            Ok(0) => tracing::debug!(worker = name, "nothing to do"),
            Ok(n) => tracing::info!(worker = name, items = n, "reconciled"),
            Err(e) => tracing::error!(worker = name, error = %e, "reconcile pass failed"),
        }
        health.record(name);
    }

    worker.shutdown().await;
    tracing::info!(worker = name, "worker stopped");
}
