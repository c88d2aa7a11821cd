//! Process wiring for the data-mart replicator (spec.md §3, §6). Builds the
//! listener, dispatcher, and background sweepers in dependency order and
//! drives them to an orderly shutdown. Not a network service with exposed
//! endpoints — no axum/tower-http here, unlike the teacher's own daemon,
//! which serves a control API; this one only drives a worker pool to
//! convergence against the database.

pub mod handlers;

use dmr_config::{CoreLogLevel, MessageSource as SelectedSource, Options};
use dmr_db::DbPool;
use dmr_dispatcher::{Dispatcher, HandlerRegistry};
use dmr_engine::{HttpResolutionEngine, ResolutionEngine};
use dmr_listener::{ActionMap, Listener};
use dmr_scheduler::SchedulerConfig;
use dmr_stats::Stats;
use dmr_transport::{DbQueueSource, MessageSource};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// spec.md §4.E: "waits for in-flight handlers up to a shutdown deadline
/// (default 30s)".
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_secs(15);
const LOCK_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const LOCK_MAX_AGE: Duration = Duration::from_secs(300);
const MESSAGE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MESSAGE_BATCH_SIZE: i64 = 10;

pub fn init_tracing(level: CoreLogLevel) {
    let default_filter = match level {
        CoreLogLevel::Muted => "warn",
        CoreLogLevel::Verbose => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();
}

/// Build the message source named by `--sqs-info-uri` / `--rabbit-info-uri`
/// + `--rabbit-info-queue` / `--database-info-queue` (spec.md §6).
pub async fn build_message_source(options: &Options, pool: &DbPool) -> anyhow::Result<Arc<dyn MessageSource>> {
    match &options.message_source {
        SelectedSource::DatabaseQueue => {
            dmr_transport::db::ensure_schema(pool).await?;
            Ok(Arc::new(DbQueueSource::new(pool.clone())))
        }
        #[cfg(feature = "sqs")]
        SelectedSource::Sqs { uri } => Ok(Arc::new(dmr_transport::sqs::SqsSource::connect(uri.clone()).await)),
        #[cfg(not(feature = "sqs"))]
        SelectedSource::Sqs { .. } => anyhow::bail!("built without the sqs feature"),
        #[cfg(feature = "rabbitmq")]
        SelectedSource::Rabbit { uri, queue } => Ok(Arc::new(dmr_transport::rabbit::RabbitSource::connect(uri, queue.clone()).await?)),
        #[cfg(not(feature = "rabbitmq"))]
        SelectedSource::Rabbit { .. } => anyhow::bail!("built without the rabbitmq feature"),
    }
}

/// Build the resolution-engine client. The engine's own base URL lives at
/// `/ENGINE_URL` inside the already-loaded `--core-settings` document — that
/// document is otherwise opaque to this process (spec.md §1 treats the
/// engine as "an opaque API returning JSON for an entity id").
pub fn build_engine(options: &Options) -> Arc<dyn ResolutionEngine> {
    let base_url = options
        .core_settings
        .pointer("/ENGINE_URL")
        .and_then(|v| v.as_str())
        .unwrap_or("http://localhost:8080")
        .to_string();
    Arc::new(HttpResolutionEngine::new(base_url))
}

fn build_registry(engine: Arc<dyn ResolutionEngine>, stats: Arc<Stats>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register("refresh-entity", Arc::new(handlers::RefreshEntityHandler::new(engine, Arc::clone(&stats))));
    registry.register("update-report", Arc::new(handlers::UpdateReportHandler::new(Arc::clone(&stats))));
    registry.register("process-record", Arc::new(handlers::NoopHandler::new("process-record", Arc::clone(&stats))));
    registry.register("handle-interesting", Arc::new(handlers::NoopHandler::new("handle-interesting", Arc::clone(&stats))));
    registry.register("handle-notice", Arc::new(handlers::NoopHandler::new("handle-notice", Arc::clone(&stats))));
    registry
}

/// Run every component until `shutdown` resolves, then drain in order:
/// listener first (stop admitting new messages), then the dispatcher's
/// worker pool (finish in-flight tasks), then the background sweepers.
pub async fn run(options: Options, pool: DbPool, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let stats = Arc::new(Stats::new());
    let engine = build_engine(&options);
    let message_source = build_message_source(&options, &pool).await?;

    let listener = Arc::new(Listener::new(ActionMap::default()));
    listener.init().await?;

    let registry = build_registry(engine, Arc::clone(&stats));
    let scheduler_config = SchedulerConfig::default();
    let dispatcher = Arc::new(Dispatcher::new(pool.clone(), registry, Arc::clone(&stats), scheduler_config));
    let worker_handles = Arc::clone(&dispatcher).run(options.core_concurrency.max(1) as usize);

    let listener_task = tokio::spawn(run_listener_loop(
        Arc::clone(&listener),
        Arc::clone(&message_source),
        pool.clone(),
        Arc::clone(&stats),
    ));
    let lease_sweep_task = tokio::spawn(run_lease_sweep(pool.clone()));
    let lock_sweep_task = tokio::spawn(run_lock_sweep(pool.clone()));

    info!(core_concurrency = options.core_concurrency, "daemon started");
    shutdown.await;
    info!("shutdown signal received, draining");

    listener.destroy().await?;
    listener_task.abort();
    lease_sweep_task.abort();
    lock_sweep_task.abort();

    dispatcher.request_shutdown();
    for handle in worker_handles {
        if tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await.is_err() {
            warn!("a dispatcher worker did not stop within the shutdown deadline");
        }
    }

    info!(stats = ?stats.snapshot(), "daemon stopped");
    Ok(())
}

async fn run_listener_loop(listener: Arc<Listener>, source: Arc<dyn MessageSource>, pool: DbPool, stats: Arc<Stats>) {
    loop {
        match source.receive(MESSAGE_BATCH_SIZE).await {
            Ok(messages) if messages.is_empty() => {
                tokio::time::sleep(MESSAGE_POLL_INTERVAL).await;
            }
            Ok(messages) => {
                for message in messages {
                    match listener.process(&pool, &message.body).await {
                        Ok(_) => {
                            stats.record_message_processed();
                            if let Err(e) = source.ack(&message.receipt_handle).await {
                                error!(error = %e, "failed to ack processed message");
                            }
                        }
                        Err(e) => {
                            // Bad message (spec.md §7): logged with the raw body, not
                            // acked so the transport's own redelivery/dead-letter
                            // policy takes over.
                            error!(error = %e, body = %message.body, "listener rejected message");
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "message source receive failed, backing off");
                tokio::time::sleep(MESSAGE_POLL_INTERVAL).await;
            }
        }
    }
}

async fn run_lease_sweep(pool: DbPool) {
    loop {
        tokio::time::sleep(LEASE_SWEEP_INTERVAL).await;
        match dmr_scheduler::sweep_expired_leases(&pool).await {
            Ok(0) => {}
            Ok(n) => info!(reclaimed = n, "swept expired task leases"),
            Err(e) => error!(error = %e, "lease sweep failed"),
        }
    }
}

async fn run_lock_sweep(pool: DbPool) {
    loop {
        tokio::time::sleep(LOCK_SWEEP_INTERVAL).await;
        match dmr_locks::reap_stale_locks(&pool, LOCK_MAX_AGE).await {
            Ok(0) => {}
            Ok(n) => info!(reclaimed = n, "swept stale advisory locks"),
            Err(e) => error!(error = %e, "lock sweep failed"),
        }
    }
}
