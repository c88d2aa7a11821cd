//! Scheduling service policy layer (spec.md §4.D) — dedup/lease/backoff/
//! dead-letter decisions built on top of the transactional primitives in
//! `dmr-db::queue`. The queue table itself is the synchronization
//! primitive; this crate only decides what happens to a task's status
//! after a claim attempt, the same separation the teacher keeps between
//! its outbox table and the policy that drives retries around it.

use dmr_db::queue::{self, QueueTask};
use dmr_db::{now_micros, Conn, DbPool};
use rand::Rng;
use tracing::{debug, warn};

/// Initial retry delay after a failed task (spec.md §4.D: "initial 500ms").
pub const INITIAL_BACKOFF_MS: u64 = 500;
/// Retry delay never exceeds this (spec.md §4.D: "cap 5min").
pub const MAX_BACKOFF_MS: u64 = 300_000;
/// Jitter applied to each computed delay, as a fraction either side.
pub const JITTER_FRACTION: f64 = 0.25;
/// Attempts allowed before a retryable failure is dead-lettered instead of
/// requeued. Not prescribed by spec.md ("a configured max attempts"); a
/// fixed default is used here and is overridable via [`SchedulerConfig`].
pub const DEFAULT_MAX_ATTEMPTS: i32 = 8;
/// Default lease duration granted to a claimed task.
pub const DEFAULT_LEASE_MS: i64 = 30_000;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub lease_ms: i64,
    pub max_attempts: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ms: DEFAULT_LEASE_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// A handler's verdict on a task it could not complete (spec.md §4.E).
#[derive(Debug, Clone)]
pub enum FailureKind {
    /// I/O, deadlock, lock timeout — requeue with backoff.
    Retryable(String),
    /// Data corruption, unknown action, programming error — dead-letter now.
    Fatal(String),
}

/// Claim up to `limit` ready tasks for `worker_id` under `config`'s lease.
pub async fn claim(pool: &DbPool, worker_id: &str, limit: i64, config: &SchedulerConfig) -> anyhow::Result<Vec<QueueTask>> {
    queue::claim_batch(pool, worker_id, limit, config.lease_ms).await
}

/// Successful completion: delete the row (spec.md §4.D state machine,
/// leased -> deleted). Takes a `Conn` so a dispatcher can complete the task
/// in the same transaction as the handler's mart writes (spec.md §4.G).
pub async fn complete(conn: &mut Conn<'_>, task_id: i64) -> anyhow::Result<()> {
    queue::complete_task(conn, task_id).await
}

/// Resolve a failed task: dead-letter on fatal or exhausted retries,
/// otherwise release it back to `ready` at `now + backoff(attempt_count)`.
pub async fn fail(pool: &DbPool, task: &QueueTask, outcome: FailureKind, config: &SchedulerConfig) -> anyhow::Result<()> {
    match outcome {
        FailureKind::Fatal(reason) => {
            warn!(task_id = task.task_id, action = %task.action, reason = %reason, "task dead-lettered: fatal error");
            queue::dead_letter_task(pool, task.task_id, &reason).await
        }
        FailureKind::Retryable(reason) => {
            if task.attempt_count >= config.max_attempts {
                warn!(task_id = task.task_id, action = %task.action, attempts = task.attempt_count, "task dead-lettered: max attempts exceeded");
                queue::dead_letter_task(pool, task.task_id, &format!("max attempts exceeded: {reason}")).await
            } else {
                let delay_micros = backoff_delay_micros(task.attempt_count);
                let next_visible_at = now_micros() + delay_micros;
                debug!(task_id = task.task_id, action = %task.action, attempt = task.attempt_count, delay_micros, "task released for retry");
                queue::release_for_retry(pool, task.task_id, next_visible_at).await
            }
        }
    }
}

/// Dead-letter a task whose action has no registered handler (spec.md §4.D
/// step 2, and scenario 6: "unknown action").
pub async fn dead_letter_unknown_action(pool: &DbPool, task: &QueueTask) -> anyhow::Result<()> {
    warn!(task_id = task.task_id, action = %task.action, "task dead-lettered: unknown action");
    queue::dead_letter_task(pool, task.task_id, "unknown action").await
}

/// Janitor sweep: reclaim tasks whose lease has expired without completion
/// (spec.md §4.D: "a janitor reclaims tasks whose lease_expires_at is in
/// the past").
pub async fn sweep_expired_leases(pool: &DbPool) -> anyhow::Result<u64> {
    queue::reap_expired_leases(pool).await
}

/// Exponential backoff with jitter for attempt `n` (1-based attempt_count,
/// as stored on a just-claimed task), in microseconds.
fn backoff_delay_micros(attempt_count: i32) -> i64 {
    let attempt = attempt_count.max(1) as u32 - 1;
    let base = (INITIAL_BACKOFF_MS.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))).min(MAX_BACKOFF_MS);
    let jitter_span = (base as f64 * JITTER_FRACTION) as i64;
    let jitter = if jitter_span > 0 { rand::thread_rng().gen_range(-jitter_span..=jitter_span) } else { 0 };
    let millis = (base as i64 + jitter).max(1);
    millis * 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmr_db::schema::ensure_schema;

    #[tokio::test]
    async fn dedup_bursts_collapse_into_one_ready_row() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();

        for _ in 0..50 {
            queue::commit_task(&mut Conn::Pool(&pool), "refresh-entity:100", "refresh-entity", "{}", 1, 0).await.unwrap();
        }
        assert_eq!(queue::count_by_status(&pool, queue::STATUS_READY).await.unwrap(), 1);

        let config = SchedulerConfig::default();
        let claimed = claim(&pool, "w1", 10, &config).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].multiplicity, 50);
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_backoff_and_increments_attempt() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        queue::commit_task(&mut Conn::Pool(&pool), "sig-retry", "refresh-entity", "{}", 1, 0).await.unwrap();

        let config = SchedulerConfig::default();
        let claimed = claim(&pool, "w1", 10, &config).await.unwrap();
        let task = &claimed[0];
        assert_eq!(task.attempt_count, 1);

        fail(&pool, task, FailureKind::Retryable("lock timeout".into()), &config).await.unwrap();
        let refreshed = queue::fetch_task(&pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(refreshed.status, queue::STATUS_READY);
        assert!(refreshed.visible_at > task.visible_at);
    }

    #[tokio::test]
    async fn retryable_failure_dead_letters_after_max_attempts() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        queue::commit_task(&mut Conn::Pool(&pool), "sig-exhaust", "refresh-entity", "{}", 1, 0).await.unwrap();

        let config = SchedulerConfig { lease_ms: 0, max_attempts: 2 };
        for _ in 0..2 {
            let claimed = claim(&pool, "w1", 10, &config).await.unwrap();
            let task = &claimed[0];
            fail(&pool, task, FailureKind::Retryable("transient".into()), &config).await.unwrap();
        }

        let claimed = claim(&pool, "w1", 10, &config).await.unwrap();
        let task = &claimed[0];
        assert_eq!(task.attempt_count, 3);
        fail(&pool, task, FailureKind::Retryable("transient".into()), &config).await.unwrap();
        let final_task = queue::fetch_task(&pool, task.task_id).await.unwrap().unwrap();
        assert_eq!(final_task.status, queue::STATUS_DEAD_LETTER);
    }

    #[tokio::test]
    async fn fatal_failure_dead_letters_immediately() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        queue::commit_task(&mut Conn::Pool(&pool), "sig-fatal", "refresh-entity", "{}", 1, 0).await.unwrap();
        let config = SchedulerConfig::default();
        let claimed = claim(&pool, "w1", 10, &config).await.unwrap();

        fail(&pool, &claimed[0], FailureKind::Fatal("corrupt state".into()), &config).await.unwrap();
        let task = queue::fetch_task(&pool, claimed[0].task_id).await.unwrap().unwrap();
        assert_eq!(task.status, queue::STATUS_DEAD_LETTER);
        assert_eq!(task.dead_letter_reason.as_deref(), Some("corrupt state"));
    }

    #[tokio::test]
    async fn unknown_action_is_dead_lettered() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        queue::commit_task(&mut Conn::Pool(&pool), "sig-unknown", "XYZ", "{}", 1, 0).await.unwrap();
        let config = SchedulerConfig::default();
        let claimed = claim(&pool, "w1", 10, &config).await.unwrap();

        dead_letter_unknown_action(&pool, &claimed[0]).await.unwrap();
        let task = queue::fetch_task(&pool, claimed[0].task_id).await.unwrap().unwrap();
        assert_eq!(task.status, queue::STATUS_DEAD_LETTER);
        assert_eq!(task.dead_letter_reason.as_deref(), Some("unknown action"));
    }

    #[test]
    fn backoff_delay_never_exceeds_cap_plus_jitter() {
        for attempt in 1..20 {
            let d = backoff_delay_micros(attempt) / 1000;
            assert!(d <= (MAX_BACKOFF_MS as f64 * (1.0 + JITTER_FRACTION)) as i64 + 1);
        }
    }
}
