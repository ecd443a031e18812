mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Duration;
use common::{fixture, fixture_with, ScriptedCompute};
use nimbus_common::{CoreError, CoreResult, CronJob, CronTarget};
use nimbus_orchestrator::cron_job::{CronReconciler, DefaultDispatcher, JobDispatcher};
use nimbus_orchestrator::worker::Reconciler;
use uuid::Uuid;

#[derive(Default)]
struct RecordingDispatcher {
    fired: Mutex<Vec<Uuid>>,
    fail: bool,
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn dispatch(&self, job: &CronJob) -> CoreResult<()> {
        if self.fail {
            return Err(CoreError::BackendUnavailable("target down".into()));
        }
        self.fired.lock().unwrap().push(job.id);
        Ok(())
    }
}

fn hook() -> CronTarget {
    CronTarget::Http {
        url: "http://127.0.0.1:9/hook".into(),
        method: "POST".into(),
    }
}

#[tokio::test]
async fn fires_once_per_elapsed_schedule() {
    let f = fixture();
    let job = f.store.insert_cron("tick", "* * * * *", &hook()).await.unwrap();
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let cron = CronReconciler::new(f.svc.clone(), dispatcher.clone());

    // Nothing is due before the first minute boundary after creation.
    assert_eq!(cron.reconcile_at(job.created_at, &f.token).await.unwrap(), 0);

    // Several missed minutes still fire once: no backfill.
    let later = job.created_at + Duration::minutes(5);
    assert_eq!(cron.reconcile_at(later, &f.token).await.unwrap(), 1);
    assert_eq!(dispatcher.fired.lock().unwrap().clone(), vec![job.id]);

    let stamped = f.store.get_cron(job.id).await.unwrap().unwrap();
    assert_eq!(stamped.last_fired_at, Some(later));
    assert_eq!(cron.reconcile_at(later, &f.token).await.unwrap(), 0);
}

#[tokio::test]
async fn paused_jobs_never_fire() {
    let f = fixture();
    let job = f.store.insert_cron("tick", "* * * * *", &hook()).await.unwrap();
    f.store.set_cron_paused(job.id, true).await.unwrap();
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let cron = CronReconciler::new(f.svc.clone(), dispatcher.clone());

    let later = job.created_at + Duration::minutes(3);
    assert_eq!(cron.reconcile_at(later, &f.token).await.unwrap(), 0);

    f.store.set_cron_paused(job.id, false).await.unwrap();
    assert_eq!(cron.reconcile_at(later, &f.token).await.unwrap(), 1);
}

#[tokio::test]
async fn failed_dispatch_is_retried_next_tick() {
    let f = fixture();
    let job = f.store.insert_cron("tick", "* * * * *", &hook()).await.unwrap();
    let failing = Arc::new(RecordingDispatcher {
        fail: true,
        ..Default::default()
    });
    let cron = CronReconciler::new(f.svc.clone(), failing);

    let later = job.created_at + Duration::minutes(2);
    assert_eq!(cron.reconcile_at(later, &f.token).await.unwrap(), 0);
    assert!(f.store.get_cron(job.id).await.unwrap().unwrap().last_fired_at.is_none());

    let working = Arc::new(RecordingDispatcher::default());
    let cron = CronReconciler::new(f.svc.clone(), working.clone());
    assert_eq!(cron.reconcile_at(later, &f.token).await.unwrap(), 1);
}

#[tokio::test]
async fn function_task_is_deleted_after_shutdown() {
    let f = fixture_with(ScriptedCompute {
        hold_tasks: true,
        ..Default::default()
    });
    let target = CronTarget::Function {
        image: "busybox".into(),
        args: vec!["true".into()],
    };
    let job = f.store.insert_cron("batch", "* * * * *", &target).await.unwrap();
    let dispatcher = Arc::new(DefaultDispatcher::new(f.svc.clone()));
    let cron = CronReconciler::new(f.svc.clone(), dispatcher.clone());

    let later = job.created_at + Duration::minutes(1);
    assert_eq!(cron.reconcile_at(later, &f.token).await.unwrap(), 1);
    tokio::task::yield_now().await;
    assert!(f.compute.deleted().is_empty());

    // The task is still running when the service shuts down.
    f.token.cancel();
    cron.shutdown().await;

    let deleted = f.compute.deleted();
    assert_eq!(deleted.len(), 1);
    assert!(deleted[0].starts_with("cron-batch-"), "{deleted:?}");
}
