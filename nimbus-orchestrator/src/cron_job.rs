use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;
use nimbus_common::bus::EventType;
use nimbus_common::validate::{sanitize_domain_name, short_id};
use nimbus_common::{CoreError, CoreResult, CronJob, CronTarget};
use nimbus_providers::inventory::LaunchOptions;
use nimbus_providers::CallContext;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::services::InstanceService;
use crate::worker::Reconciler;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const TASK_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Parses a five- or six-field schedule expression.
pub fn parse_schedule(expr: &str) -> CoreResult<Cron> {
    Cron::new(expr.trim())
        .with_seconds_optional()
        .parse()
        .map_err(|e| CoreError::validation("schedule", e.to_string()))
}

/// The first occurrence strictly after the job's last firing (or its creation).
pub fn next_fire(job: &CronJob) -> CoreResult<DateTime<Utc>> {
    let cron = parse_schedule(&job.schedule)?;
    let from = job.last_fired_at.unwrap_or(job.created_at);
    cron.find_next_occurrence(&from, false)
        .map_err(|e| CoreError::validation("schedule", e.to_string()))
}

/// Performs the job's side effect.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, job: &CronJob) -> CoreResult<()>;

    /// Waits for work started by earlier dispatches to finish.
    async fn drain(&self) {}
}

/// HTTP targets are called with `reqwest`; function targets run as one-shot
/// tasks on the compute backend and are deleted once they exit, even when
/// the wait is cut short by shutdown.
pub struct DefaultDispatcher {
    http: reqwest::Client,
    svc: InstanceService,
    tasks: Mutex<JoinSet<()>>,
}

impl DefaultDispatcher {
    pub fn new(svc: InstanceService) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            svc,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    async fn call_http(&self, job: &CronJob, url: &str, method: &str) -> CoreResult<()> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| CoreError::validation("method", format!("'{method}' is not an HTTP method")))?;
        let resp = self
            .http
            .request(method, url)
            .json(&json!({ "cron_job_id": job.id, "name": job.name, "fired_at": Utc::now() }))
            .send()
            .await
            .map_err(|e| CoreError::BackendUnavailable(format!("{url}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::BackendRejected(format!("{url} answered {status}")));
        }
        Ok(())
    }

    async fn run_function(&self, job: &CronJob, image: &str, args: &[String]) -> CoreResult<()> {
        let opts = LaunchOptions {
            name: format!("cron-{}-{}", sanitize_domain_name(&job.name), short_id()),
            image: image.to_string(),
            command: args.to_vec(),
            labels: vec![("nimbus.cron".to_string(), job.id.to_string())],
            ..Default::default()
        };
        let compute = self.svc.backends().compute.clone();
        let info = compute.run_task(&self.svc.call_context(), &opts).await?;

        let token = self.svc.token().child_token();
        let job_id = job.id;
        let mut tasks = self.tasks.lock().await;
        while let Some(res) = tasks.try_join_next() {
            if let Err(e) = res {
                tracing::error!(error = %e, "cron task watcher panicked");
            }
        }
        tasks.spawn(async move {
            let ctx = CallContext::new(token, TASK_TIMEOUT);
            match compute.wait_task(&ctx, &info.handle).await {
                Ok(code) => tracing::info!(cron_job_id = %job_id, handle = %info.handle, exit_code = code, "cron task finished"),
                Err(e) => tracing::warn!(cron_job_id = %job_id, handle = %info.handle, error = %e, "cron task did not finish"),
            }
            // Shutdown cancels the wait, never the cleanup.
            let cleanup = CallContext::new(CancellationToken::new(), CLEANUP_TIMEOUT);
            if let Err(e) = compute.delete(&cleanup, &info.handle).await {
                tracing::warn!(cron_job_id = %job_id, handle = %info.handle, error = %e, "cron task left behind");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl JobDispatcher for DefaultDispatcher {
    async fn dispatch(&self, job: &CronJob) -> CoreResult<()> {
        match &job.target.0 {
            CronTarget::Http { url, method } => self.call_http(job, url, method).await,
            CronTarget::Function { image, args } => self.run_function(job, image, args).await,
        }
    }

    async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        if !tasks.is_empty() {
            tracing::info!(pending = tasks.len(), "waiting for cron task cleanup");
        }
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!(error = %e, "cron task watcher panicked");
            }
        }
    }
}

/// Fires due cron jobs. At most one firing per job per tick, no backfill.
pub struct CronReconciler {
    svc: InstanceService,
    dispatcher: Arc<dyn JobDispatcher>,
    period: Duration,
}

impl CronReconciler {
    pub fn new(svc: InstanceService, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        Self {
            svc,
            dispatcher,
            period: Duration::from_secs(5),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub async fn reconcile_at(&self, now: DateTime<Utc>, token: &CancellationToken) -> CoreResult<usize> {
        let mut fired = 0;
        for job in self.svc.store().list_cron().await? {
            if token.is_cancelled() {
                break;
            }
            if job.paused {
                continue;
            }
            let due = match next_fire(&job) {
                Ok(at) => at <= now,
                Err(e) => {
                    tracing::warn!(cron_job_id = %job.id, error = %e, "unparseable schedule");
                    continue;
                }
            };
            if !due {
                continue;
            }
            if let Err(e) = self.dispatcher.dispatch(&job).await {
                tracing::warn!(cron_job_id = %job.id, error = %e, "cron job not fired, retrying next tick");
                continue;
            }
            self.svc.store().stamp_cron(job.id, now).await?;
            tracing::info!(cron_job_id = %job.id, name = %job.name, "cron job fired");
            self.svc
                .events()
                .publish(EventType::CronFired, json!({ "cron_job_id": job.id, "name": job.name, "fired_at": now }))
                .await;
            fired += 1;
        }
        Ok(fired)
    }
}

#[async_trait]
impl Reconciler for CronReconciler {
    fn name(&self) -> &'static str {
        "cron"
    }

    fn period(&self) -> Duration {
        self.period
    }

    async fn reconcile(&self, token: &CancellationToken) -> CoreResult<usize> {
        self.reconcile_at(Utc::now(), token).await
    }

    async fn shutdown(&self) {
        self.dispatcher.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use sqlx::types::Json;
    use uuid::Uuid;

    fn job(schedule: &str, created: DateTime<Utc>, last: Option<DateTime<Utc>>) -> CronJob {
        CronJob {
            id: Uuid::new_v4(),
            name: "nightly".into(),
            schedule: schedule.into(),
            target: Json(CronTarget::Http {
                url: "http://127.0.0.1:9/hook".into(),
                method: "POST".into(),
            }),
            paused: false,
            last_fired_at: last,
            created_at: created,
        }
    }

    #[test]
    fn rejects_garbage_schedules() {
        assert!(parse_schedule("every tuesday").is_err());
        assert!(parse_schedule("*/5 * * * *").is_ok());
    }

    #[test]
    fn next_fire_counts_from_last_firing() {
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 30).unwrap();
        let j = job("*/5 * * * *", created, None);
        assert_eq!(next_fire(&j).unwrap(), Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).unwrap());

        let last = Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).unwrap();
        let j = job("*/5 * * * *", created, Some(last));
        assert_eq!(next_fire(&j).unwrap(), Utc.with_ymd_and_hms(2026, 3, 1, 10, 10, 0).unwrap());
    }
}
