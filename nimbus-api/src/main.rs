use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use nimbus_api::config::database::create_pool;
use nimbus_api::config::redis::create_client;
use nimbus_api::config::AppConfig;
use nimbus_api::rate_limit::CLEANUP_PERIOD;
use nimbus_api::routes::create_app;
use nimbus_api::setup::run_migrations;
use nimbus_api::AppState;
use nimbus_orchestrator::store::{MemoryStore, PgStore, Store};
use nimbus_orchestrator::{start_workers, EventPublisher, Hub, InstanceService, WorkerHealth};
use nimbus_providers::select_backends;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nimbus", version, about = "Mini IaaS control plane")]
struct Args {
    /// Apply database migrations and exit without starting workers or the listener.
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let config = AppConfig::from_env();
    init_tracing(config.as_ref().is_ok_and(|c| c.is_production()));
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "nimbus stopped on an unrecoverable error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

async fn run(args: Args, config: AppConfig) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = if config.uses_memory_store() {
        if args.migrate_only {
            info!("in-memory store selected, nothing to migrate");
            return Ok(());
        }
        warn!("using the in-memory store; state is lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        let pool = create_pool(&config.database_url)
            .await
            .context("Failed to connect to Postgres")?;
        run_migrations(&pool).await.context("Failed to run migrations")?;
        if args.migrate_only {
            return Ok(());
        }
        Arc::new(PgStore::new(pool))
    };

    let redis_client = config
        .redis_url
        .as_deref()
        .map(create_client)
        .transpose()
        .context("Invalid REDIS_URL")?;

    let backends = select_backends(&config.backends)
        .await
        .context("Failed to initialize backends")?;
    if backends.network_degraded {
        warn!("network backend degraded; VPC bridges are not realized");
    }

    let root = CancellationToken::new();
    let (hub, hub_task) = Hub::spawn(root.child_token());
    let events = EventPublisher::new(Some(hub.clone()), redis_client.clone());
    let workers_token = root.child_token();
    let instances = InstanceService::new(store, backends.clone(), events, workers_token.clone());

    let health = WorkerHealth::default();
    let workers = config
        .role
        .runs_workers()
        .then(|| start_workers(&instances, health.clone(), &workers_token));

    let state = AppState::new(config.clone(), instances, Some(hub), health, redis_client);
    let cleanup = state.limiter.spawn_cleanup(CLEANUP_PERIOD, root.child_token());
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, role = ?config.role, "nimbus listening");

    let stop_accepting = CancellationToken::new();
    let mut server = tokio::spawn({
        let stop = stop_accepting.clone();
        async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(stop.cancelled_owned())
                .await
        }
    });

    let server_failed = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
        res = &mut server => Some(res),
    };

    // Listener first, bounded by the drain window; then the workers.
    stop_accepting.cancel();
    if server_failed.is_none() {
        match tokio::time::timeout(config.shutdown_drain, &mut server).await {
            Ok(Ok(Ok(()))) => info!("http listener drained"),
            Ok(Ok(Err(e))) => warn!(error = %e, "http server error during drain"),
            Ok(Err(e)) => warn!(error = %e, "http server task failed"),
            Err(_) => {
                warn!(drain_secs = config.shutdown_drain.as_secs(), "drain window elapsed, dropping open connections");
                server.abort();
            }
        }
    }

    root.cancel();
    if let Some(workers) = workers {
        workers.join().await;
    }
    let _ = cleanup.await;
    let _ = hub_task.await;
    backends.close().await;

    match server_failed {
        Some(Ok(Ok(()))) | None => {
            info!("nimbus stopped");
            Ok(())
        }
        Some(Ok(Err(e))) => Err(e).context("HTTP server failed"),
        Some(Err(e)) => Err(e).context("HTTP server task failed"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
