//! Task-handler dispatcher (spec.md §4.E): a fixed worker pool that claims
//! tasks through `dmr-scheduler`, looks up the registered handler for the
//! action, and resolves success/retry/dead-letter. The queue row itself is
//! the transaction boundary — no in-memory condition variable coordinates
//! workers, matching spec.md §4.C's "the queue itself is the
//! synchronization primitive."

use async_trait::async_trait;
use dmr_db::{queue::QueueTask, Conn, DbPool};
use dmr_scheduler::{FailureKind, SchedulerConfig};
use dmr_stats::Stats;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// A handler's verdict on a task it processed but did not complete.
#[derive(Debug, Clone)]
pub enum HandlerError {
    Retryable(String),
    Fatal(String),
}

impl From<HandlerError> for FailureKind {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::Retryable(r) => FailureKind::Retryable(r),
            HandlerError::Fatal(r) => FailureKind::Fatal(r),
        }
    }
}

/// `conn` is the dispatcher's open transaction: everything a handler writes
/// through it commits or rolls back atomically with the task's completion
/// (spec.md §4.G). `pool` is passed alongside for work that must stay
/// outside that transaction, namely advisory lock acquire/release.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, conn: &mut Conn<'_>, pool: &DbPool, params_json: &str, multiplicity: i64) -> Result<(), HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action.into(), handler);
    }

    fn get(&self, action: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action).cloned()
    }
}

/// No tasks claimed this poll; wait before asking again rather than
/// busy-looping against the queue table.
const EMPTY_POLL_BACKOFF: Duration = Duration::from_millis(200);

pub struct Dispatcher {
    pool: DbPool,
    registry: HandlerRegistry,
    stats: Arc<Stats>,
    config: SchedulerConfig,
    shutting_down: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(pool: DbPool, registry: HandlerRegistry, stats: Arc<Stats>, config: SchedulerConfig) -> Self {
        Self {
            pool,
            registry,
            stats,
            config,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn `worker_count` worker loops, returning their join handles.
    pub fn run(self: Arc<Self>, worker_count: usize) -> Vec<JoinHandle<()>> {
        (0..worker_count)
            .map(|i| {
                let dispatcher = Arc::clone(&self);
                let worker_id = format!("worker-{i}");
                tokio::spawn(async move { dispatcher.worker_loop(worker_id).await })
            })
            .collect()
    }

    /// Signal every worker to stop after its current task (spec.md §4.E
    /// step 1 wording: "a worker checks for cancellation between tasks, not
    /// within a task"). Callers await the join handles from [`run`] with
    /// their own shutdown deadline.
    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    async fn worker_loop(&self, worker_id: String) {
        info!(worker_id, "dispatcher worker started");
        while !self.shutting_down.load(Ordering::Relaxed) {
            let claimed = dmr_scheduler::claim(&self.pool, &worker_id, 1, &self.config).await;
            let tasks = match claimed {
                Ok(tasks) => tasks,
                Err(err) => {
                    error!(worker_id, error = %err, "claim failed, backing off");
                    sleep(EMPTY_POLL_BACKOFF).await;
                    continue;
                }
            };

            if tasks.is_empty() {
                sleep(EMPTY_POLL_BACKOFF).await;
                continue;
            }

            for task in tasks {
                self.stats.record_task_claimed();
                self.run_task(&task).await;
                if self.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
            }
        }
        info!(worker_id, "dispatcher worker stopped");
    }

    async fn run_task(&self, task: &QueueTask) {
        let Some(handler) = self.registry.get(&task.action) else {
            warn!(task_id = task.task_id, action = %task.action, "no handler registered");
            if let Err(err) = dmr_scheduler::dead_letter_unknown_action(&self.pool, task).await {
                error!(task_id = task.task_id, error = %err, "dead_letter_unknown_action failed");
                return;
            }
            self.stats.record_task_dead_lettered();
            return;
        };

        debug!(task_id = task.task_id, action = %task.action, multiplicity = task.multiplicity, "dispatching task");

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                error!(task_id = task.task_id, error = %err, "failed to begin task transaction");
                return;
            }
        };

        let outcome = {
            let mut conn = Conn::Tx(&mut tx);
            handler.handle(&mut conn, &self.pool, &task.params_json, task.multiplicity).await
        };

        match outcome {
            Ok(()) => {
                let mut conn = Conn::Tx(&mut tx);
                if let Err(err) = dmr_scheduler::complete(&mut conn, task.task_id).await {
                    error!(task_id = task.task_id, error = %err, "complete failed");
                    let _ = tx.rollback().await;
                    return;
                }
                if let Err(err) = tx.commit().await {
                    error!(task_id = task.task_id, error = %err, "task transaction commit failed");
                    return;
                }
                self.stats.record_task_completed();
            }
            Err(handler_error) => {
                if let Err(err) = tx.rollback().await {
                    error!(task_id = task.task_id, error = %err, "task transaction rollback failed");
                    return;
                }
                let is_fatal = matches!(handler_error, HandlerError::Fatal(_));
                if let Err(err) = dmr_scheduler::fail(&self.pool, task, handler_error.into(), &self.config).await {
                    error!(task_id = task.task_id, error = %err, "fail() failed");
                    return;
                }
                if is_fatal {
                    self.stats.record_task_dead_lettered();
                } else {
                    self.stats.record_task_retried();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmr_db::schema::ensure_schema;
    use dmr_db::queue;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingHandler {
        calls: AtomicUsize,
        outcome: fn() -> Result<(), HandlerError>,
    }

    #[async_trait]
    impl ActionHandler for CountingHandler {
        async fn handle(&self, _conn: &mut Conn<'_>, _pool: &DbPool, _params_json: &str, _multiplicity: i64) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            (self.outcome)()
        }
    }

    async fn run_until_drained(dispatcher: Arc<Dispatcher>) {
        let handles = Arc::clone(&dispatcher).run(1);
        tokio::time::sleep(Duration::from_millis(300)).await;
        dispatcher.request_shutdown();
        for h in handles {
            let _ = tokio::time::timeout(Duration::from_secs(1), h).await;
        }
    }

    #[tokio::test]
    async fn successful_handler_completes_task_and_bumps_stats() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        queue::commit_task(&mut Conn::Pool(&pool), "sig-ok", "do-thing", "{}", 1, 0).await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register(
            "do-thing",
            Arc::new(CountingHandler {
                calls: AtomicUsize::new(0),
                outcome: || Ok(()),
            }),
        );
        let stats = Arc::new(Stats::new());
        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), registry, Arc::clone(&stats), SchedulerConfig::default()));
        run_until_drained(dispatcher).await;

        assert_eq!(queue::count_by_status(&pool, queue::STATUS_READY).await.unwrap(), 0);
        assert_eq!(stats.snapshot()["tasks.completed"], 1);
    }

    #[tokio::test]
    async fn unknown_action_is_dead_lettered_without_a_handler_call() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        queue::commit_task(&mut Conn::Pool(&pool), "sig-unknown", "XYZ", "{}", 1, 0).await.unwrap();

        let registry = HandlerRegistry::new();
        let stats = Arc::new(Stats::new());
        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), registry, Arc::clone(&stats), SchedulerConfig::default()));
        run_until_drained(dispatcher).await;

        assert_eq!(stats.snapshot()["tasks.dead_lettered"], 1);
        assert_eq!(queue::count_by_status(&pool, queue::STATUS_DEAD_LETTER).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fatal_handler_error_dead_letters_task() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        queue::commit_task(&mut Conn::Pool(&pool), "sig-fatal", "do-thing", "{}", 1, 0).await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register(
            "do-thing",
            Arc::new(CountingHandler {
                calls: AtomicUsize::new(0),
                outcome: || Err(HandlerError::Fatal("corrupt".into())),
            }),
        );
        let stats = Arc::new(Stats::new());
        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), registry, Arc::clone(&stats), SchedulerConfig::default()));
        run_until_drained(dispatcher).await;

        assert_eq!(queue::count_by_status(&pool, queue::STATUS_DEAD_LETTER).await.unwrap(), 1);
        assert_eq!(stats.snapshot()["tasks.dead_lettered"], 1);
    }

    #[tokio::test]
    async fn retryable_handler_error_requeues_task() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        queue::commit_task(&mut Conn::Pool(&pool), "sig-retry", "do-thing", "{}", 1, 0).await.unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register(
            "do-thing",
            Arc::new(CountingHandler {
                calls: AtomicUsize::new(0),
                outcome: || Err(HandlerError::Retryable("lock timeout".into())),
            }),
        );
        let stats = Arc::new(Stats::new());
        let config = SchedulerConfig { lease_ms: 0, max_attempts: 8 };
        let dispatcher = Arc::new(Dispatcher::new(pool.clone(), registry, Arc::clone(&stats), config));
        run_until_drained(dispatcher).await;

        assert_eq!(queue::count_by_status(&pool, queue::STATUS_READY).await.unwrap(), 1);
        assert!(stats.snapshot()["tasks.retried"] >= 1);
    }
}
