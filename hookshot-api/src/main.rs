use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hookshot_common::capture::ErrorCapture;
use hookshot_common::destination::MAX_TIMEOUT_SECS;
use hookshot_common::health::{Component, HealthRegistry};
use hookshot_common::metrics::setup_metrics_routes;
use hookshot_common::store::{MemoryStore, PgStore, Store};
use hookshot_common::transport::{HttpTransport, Transport};
use hookshot_janitor::{cleanup_loop, retention::RetentionCleaner};
use hookshot_worker::dispatcher::Dispatcher;
use hookshot_worker::limiter::ConcurrencyLimiter;
use hookshot_worker::queue::dispatch_queue;
use hookshot_worker::sweep::{sweep_loop, RetrySweep};
use hookshot_worker::worker::{AttemptExecutor, DispatchWorker};

mod config;
mod error;
mod handlers;
mod seed;

const WORKER_HEARTBEAT: std::time::Duration = std::time::Duration::from_secs(10);

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn connect_store(config: &Config) -> Result<Arc<dyn Store>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::new(url, config.max_pg_connections).await?;
            store
                .run_migrations()
                .await
                .wrap_err("failed to run migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL is not set, events and deliveries are kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// A liveness deadline covering `secs` plus a grace period.
fn deadline(secs: u64) -> time::Duration {
    time::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 2).saturating_add(60))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let store = connect_store(&config).await?;
    if let Some(path) = &config.destinations_file {
        let seeded = seed::seed_destinations(store.as_ref(), Path::new(path)).await?;
        info!("seeded {} destinations from {}", seeded, path);
    }

    let capture = ErrorCapture::new();
    let reporter = capture.spawn(config.error_capture_buffer);
    let liveness = HealthRegistry::new("liveness");

    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new().wrap_err("failed to construct http transport")?);
    let (queue, receiver) = dispatch_queue();

    let executor = AttemptExecutor::new(
        store.clone(),
        transport.clone(),
        queue.clone(),
        config.immediate_retry.retry_policy(),
    );
    executor.recover().await?;

    let worker_liveness = liveness
        .register(
            Component::DispatchWorker,
            deadline(MAX_TIMEOUT_SECS.unsigned_abs().into()),
        )
        .await;
    let worker = DispatchWorker::new(
        executor,
        ConcurrencyLimiter::new("dispatch", config.max_concurrent_dispatches),
        worker_liveness,
        WORKER_HEARTBEAT,
    );

    let sweep_liveness = liveness
        .register(
            Component::RetrySweep,
            deadline(config.retry_sweep_interval_secs),
        )
        .await;
    let sweep = RetrySweep::new(store.clone(), queue.clone(), config.retry_sweep_batch_size);

    let janitor_liveness = liveness
        .register(
            Component::RetentionJanitor,
            deadline(config.cleanup_interval_secs),
        )
        .await;
    let cleaner = Box::new(RetentionCleaner::new(store.clone(), config.retention_days));

    let state = handlers::AppState {
        store: store.clone(),
        dispatcher: Dispatcher::new(store, queue),
        transport,
        liveness,
        reporter: reporter.clone(),
    };
    let app = handlers::add_routes(Router::new(), state, config.max_payload_size);
    let app = setup_metrics_routes(app)?;

    info!("hookshot listening on {}", config.bind());

    tokio::select! {
        result = listen(app, config.bind()) => {
            result.wrap_err("http server stopped")?;
        }
        result = worker.run(receiver) => {
            result.wrap_err("dispatch worker stopped")?;
        }
        _ = sweep_loop(sweep, sweep_liveness, config.retry_sweep_interval(), reporter.clone()) => {
            error!("retry sweep exited");
        }
        _ = cleanup_loop(cleaner, config.cleanup_interval(), janitor_liveness, reporter) => {
            error!("retention janitor exited");
        }
    }

    Ok(())
}
