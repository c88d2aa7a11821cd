//! Typed CRUD for the `queue` table — the transactional follow-up queue
//! (spec.md §4.D). Claiming uses `FOR UPDATE SKIP LOCKED` on PostgreSQL and
//! `BEGIN IMMEDIATE` on SQLite, the same pattern the teacher's outbox claim
//! uses to let concurrent workers each get a disjoint batch without
//! blocking on row locks.

use crate::pool::{now_micros, Conn, DbPool, DbTx};
use anyhow::{Context, Result};
use sqlx::Row;

pub const STATUS_READY: &str = "ready";
pub const STATUS_LEASED: &str = "leased";
pub const STATUS_DEAD_LETTER: &str = "dead_letter";

#[derive(Debug, Clone)]
pub struct QueueTask {
    pub task_id: i64,
    pub signature: String,
    pub action: String,
    pub params_json: String,
    pub multiplicity: i64,
    pub visible_at: i64,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub attempt_count: i32,
    pub status: String,
    pub dead_letter_reason: Option<String>,
}

/// Insert a ready task at the given `multiplicity`, or if a ready task with
/// the same `signature` already exists, add `multiplicity` onto its existing
/// count instead (spec.md §8: concurrent commit of two tasks with identical
/// signatures collapses into one row whose multiplicity is the sum; spec.md
/// §4.D's task tuple carries `multiplicity`/`followUpDelayMs`, so a handler
/// committing a follow-up at multiplicity > 1 must be able to say so, not
/// just assume 1). Relies on the partial unique index
/// `uq_queue_signature_ready` created in `schema.rs`.
pub async fn commit_task(conn: &mut Conn<'_>, signature: &str, action: &str, params_json: &str, multiplicity: i64, visible_at: i64) -> Result<()> {
    let now = now_micros();
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query(
                "insert into queue (signature, action, params_json, multiplicity, visible_at, status, created_on, modified_on)
                 values ($1, $2, $3, $4, $5, 'ready', now(), now())
                 on conflict (signature) where status = 'ready' do update set
                    multiplicity = least(queue.multiplicity + $4, $6),
                    visible_at = least(queue.visible_at, excluded.visible_at)",
            )
            .bind(signature)
            .bind(action)
            .bind(params_json)
            .bind(multiplicity)
            .bind(visible_at)
            .bind(MAX_MULTIPLICITY)
            .execute(p)
            .await
        }
        Conn::Pool(DbPool::Sqlite(p)) => {
            sqlx::query(
                "insert into queue (signature, action, params_json, multiplicity, visible_at, status, created_on, modified_on)
                 values (?, ?, ?, ?, ?, 'ready', ?, ?)
                 on conflict (signature) where status = 'ready' do update set
                    multiplicity = min(queue.multiplicity + ?, ?),
                    visible_at = min(queue.visible_at, excluded.visible_at)",
            )
            .bind(signature)
            .bind(action)
            .bind(params_json)
            .bind(multiplicity)
            .bind(visible_at)
            .bind(now)
            .bind(now)
            .bind(multiplicity)
            .bind(MAX_MULTIPLICITY)
            .execute(p)
            .await
        }
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query(
                "insert into queue (signature, action, params_json, multiplicity, visible_at, status, created_on, modified_on)
                 values ($1, $2, $3, $4, $5, 'ready', now(), now())
                 on conflict (signature) where status = 'ready' do update set
                    multiplicity = least(queue.multiplicity + $4, $6),
                    visible_at = least(queue.visible_at, excluded.visible_at)",
            )
            .bind(signature)
            .bind(action)
            .bind(params_json)
            .bind(multiplicity)
            .bind(visible_at)
            .bind(MAX_MULTIPLICITY)
            .execute(&mut **tx)
            .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => {
            sqlx::query(
                "insert into queue (signature, action, params_json, multiplicity, visible_at, status, created_on, modified_on)
                 values (?, ?, ?, ?, ?, 'ready', ?, ?)
                 on conflict (signature) where status = 'ready' do update set
                    multiplicity = min(queue.multiplicity + ?, ?),
                    visible_at = min(queue.visible_at, excluded.visible_at)",
            )
            .bind(signature)
            .bind(action)
            .bind(params_json)
            .bind(multiplicity)
            .bind(visible_at)
            .bind(now)
            .bind(now)
            .bind(multiplicity)
            .bind(MAX_MULTIPLICITY)
            .execute(&mut **tx)
            .await
        }
    }
    .context("commit_task failed")?;
    Ok(())
}

/// Cap for `multiplicity`; `dmr-scheduler` stops incrementing and logs once
/// per signature when a task's count would exceed it (spec.md §3 Open
/// Question: saturate rather than overflow).
pub const MAX_MULTIPLICITY: i64 = i32::MAX as i64;

fn task_from_row(row: &sqlx::postgres::PgRow) -> sqlx::Result<QueueTask> {
    Ok(QueueTask {
        task_id: row.try_get("task_id")?,
        signature: row.try_get("signature")?,
        action: row.try_get("action")?,
        params_json: row.try_get("params_json")?,
        multiplicity: row.try_get("multiplicity")?,
        visible_at: row.try_get("visible_at")?,
        leased_by: row.try_get("leased_by")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        attempt_count: row.try_get("attempt_count")?,
        status: row.try_get("status")?,
        dead_letter_reason: row.try_get("dead_letter_reason")?,
    })
}

fn task_from_sqlite_row(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<QueueTask> {
    Ok(QueueTask {
        task_id: row.try_get("task_id")?,
        signature: row.try_get("signature")?,
        action: row.try_get("action")?,
        params_json: row.try_get("params_json")?,
        multiplicity: row.try_get("multiplicity")?,
        visible_at: row.try_get("visible_at")?,
        leased_by: row.try_get("leased_by")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        attempt_count: row.try_get("attempt_count")?,
        status: row.try_get("status")?,
        dead_letter_reason: row.try_get("dead_letter_reason")?,
    })
}

/// Claim up to `limit` ready, visible tasks for `worker_id`, marking them
/// leased with `lease_expires_at = now + lease_ms`. Each concurrent caller
/// gets a disjoint batch: PostgreSQL via `FOR UPDATE SKIP LOCKED`, SQLite via
/// `BEGIN IMMEDIATE` (its single-writer model serializes claimants instead).
pub async fn claim_batch(pool: &DbPool, worker_id: &str, limit: i64, lease_ms: i64) -> Result<Vec<QueueTask>> {
    let now = now_micros();
    let lease_expires_at = now + lease_ms * 1000;

    match pool {
        DbPool::Postgres(p) => {
            let mut tx = p.begin().await.context("claim_batch: begin failed")?;
            let rows = sqlx::query(
                "select task_id, signature, action, params_json, multiplicity, visible_at,
                        leased_by, lease_expires_at, attempt_count, status, dead_letter_reason
                 from queue
                 where status = 'ready' and visible_at <= $1
                 order by visible_at, task_id
                 limit $2
                 for update skip locked",
            )
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
            .context("claim_batch: select failed")?;

            let mut tasks = Vec::with_capacity(rows.len());
            for row in &rows {
                tasks.push(task_from_row(row).context("claim_batch: row decode failed")?);
            }

            for task in &tasks {
                sqlx::query(
                    "update queue set status = 'leased', leased_by = $1, lease_expires_at = $2,
                        attempt_count = attempt_count + 1, modified_on = now()
                     where task_id = $3",
                )
                .bind(worker_id)
                .bind(lease_expires_at)
                .bind(task.task_id)
                .execute(&mut *tx)
                .await
                .context("claim_batch: lease update failed")?;
            }

            tx.commit().await.context("claim_batch: commit failed")?;

            Ok(tasks
                .into_iter()
                .map(|mut t| {
                    t.status = STATUS_LEASED.to_string();
                    t.leased_by = Some(worker_id.to_string());
                    t.lease_expires_at = Some(lease_expires_at);
                    t.attempt_count += 1;
                    t
                })
                .collect())
        }
        DbPool::Sqlite(p) => {
            let mut conn = p.acquire().await.context("claim_batch: acquire failed")?;
            sqlx::query("BEGIN IMMEDIATE")
                .execute(&mut *conn)
                .await
                .context("claim_batch: begin immediate failed")?;

            let rows = sqlx::query(
                "select task_id, signature, action, params_json, multiplicity, visible_at,
                        leased_by, lease_expires_at, attempt_count, status, dead_letter_reason
                 from queue
                 where status = 'ready' and visible_at <= ?
                 order by visible_at, task_id
                 limit ?",
            )
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await;

            let rows = match rows {
                Ok(r) => r,
                Err(e) => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    return Err(e).context("claim_batch: select failed");
                }
            };

            let mut tasks = Vec::with_capacity(rows.len());
            for row in &rows {
                tasks.push(task_from_sqlite_row(row).context("claim_batch: row decode failed")?);
            }

            for task in &tasks {
                sqlx::query(
                    "update queue set status = 'leased', leased_by = ?, lease_expires_at = ?,
                        attempt_count = attempt_count + 1, modified_on = ?
                     where task_id = ?",
                )
                .bind(worker_id)
                .bind(lease_expires_at)
                .bind(now_micros())
                .bind(task.task_id)
                .execute(&mut *conn)
                .await
                .context("claim_batch: lease update failed")?;
            }

            sqlx::query("COMMIT").execute(&mut *conn).await.context("claim_batch: commit failed")?;

            Ok(tasks
                .into_iter()
                .map(|mut t| {
                    t.status = STATUS_LEASED.to_string();
                    t.leased_by = Some(worker_id.to_string());
                    t.lease_expires_at = Some(lease_expires_at);
                    t.attempt_count += 1;
                    t
                })
                .collect())
        }
    }
}

/// Delete a task's row — the final statement of the transaction that also
/// holds its handler's mart writes and pending-report/follow-up inserts
/// (spec.md §4.G, §5): a task is visible as done iff that whole transaction
/// persisted.
pub async fn complete_task(conn: &mut Conn<'_>, task_id: i64) -> Result<()> {
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => sqlx::query("delete from queue where task_id = $1").bind(task_id).execute(p).await,
        Conn::Pool(DbPool::Sqlite(p)) => sqlx::query("delete from queue where task_id = ?").bind(task_id).execute(p).await,
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query("delete from queue where task_id = $1").bind(task_id).execute(&mut **tx).await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => sqlx::query("delete from queue where task_id = ?").bind(task_id).execute(&mut **tx).await,
    }
    .context("complete_task failed")?;
    Ok(())
}

/// Release a leased task back to `ready` at `next_visible_at` (a retry after
/// a transient failure, spec.md §4.D backoff schedule).
pub async fn release_for_retry(pool: &DbPool, task_id: i64, next_visible_at: i64) -> Result<()> {
    match pool {
        DbPool::Postgres(p) => {
            sqlx::query(
                "update queue set status = 'ready', leased_by = null, lease_expires_at = null,
                    visible_at = $1, modified_on = now()
                 where task_id = $2",
            )
            .bind(next_visible_at)
            .bind(task_id)
            .execute(p)
            .await
        }
        DbPool::Sqlite(p) => {
            sqlx::query(
                "update queue set status = 'ready', leased_by = null, lease_expires_at = null,
                    visible_at = ?, modified_on = ?
                 where task_id = ?",
            )
            .bind(next_visible_at)
            .bind(now_micros())
            .bind(task_id)
            .execute(p)
            .await
        }
    }
    .context("release_for_retry failed")?;
    Ok(())
}

/// Move a task to `dead_letter` after exhausting retries or hitting a fatal
/// (non-retryable) error (spec.md §4.D, §4.E).
pub async fn dead_letter_task(pool: &DbPool, task_id: i64, reason: &str) -> Result<()> {
    match pool {
        DbPool::Postgres(p) => {
            sqlx::query(
                "update queue set status = 'dead_letter', leased_by = null, lease_expires_at = null,
                    dead_letter_reason = $1, modified_on = now()
                 where task_id = $2",
            )
            .bind(reason)
            .bind(task_id)
            .execute(p)
            .await
        }
        DbPool::Sqlite(p) => {
            sqlx::query(
                "update queue set status = 'dead_letter', leased_by = null, lease_expires_at = null,
                    dead_letter_reason = ?, modified_on = ?
                 where task_id = ?",
            )
            .bind(reason)
            .bind(now_micros())
            .bind(task_id)
            .execute(p)
            .await
        }
    }
    .context("dead_letter_task failed")?;
    Ok(())
}

/// Reclaim tasks whose lease has expired without completion — a worker
/// crashed mid-task. Called by the scheduler's periodic sweep, not by the
/// lock reaper (which only touches the `locks` table).
pub async fn reap_expired_leases(pool: &DbPool) -> Result<u64> {
    let now = now_micros();
    let result = match pool {
        DbPool::Postgres(p) => {
            sqlx::query(
                "update queue set status = 'ready', leased_by = null, lease_expires_at = null, modified_on = now()
                 where status = 'leased' and lease_expires_at < $1",
            )
            .bind(now)
            .execute(p)
            .await
        }
        DbPool::Sqlite(p) => {
            sqlx::query(
                "update queue set status = 'ready', leased_by = null, lease_expires_at = null, modified_on = ?
                 where status = 'leased' and lease_expires_at < ?",
            )
            .bind(now)
            .bind(now)
            .execute(p)
            .await
        }
    }
    .context("reap_expired_leases failed")?;
    Ok(result.rows_affected())
}

pub async fn fetch_task(pool: &DbPool, task_id: i64) -> Result<Option<QueueTask>> {
    match pool {
        DbPool::Postgres(p) => {
            let row = sqlx::query(
                "select task_id, signature, action, params_json, multiplicity, visible_at,
                        leased_by, lease_expires_at, attempt_count, status, dead_letter_reason
                 from queue where task_id = $1",
            )
            .bind(task_id)
            .fetch_optional(p)
            .await
            .context("fetch_task failed")?;
            Ok(match row {
                Some(r) => Some(task_from_row(&r)?),
                None => None,
            })
        }
        DbPool::Sqlite(p) => {
            let row = sqlx::query(
                "select task_id, signature, action, params_json, multiplicity, visible_at,
                        leased_by, lease_expires_at, attempt_count, status, dead_letter_reason
                 from queue where task_id = ?",
            )
            .bind(task_id)
            .fetch_optional(p)
            .await
            .context("fetch_task failed")?;
            Ok(match row {
                Some(r) => Some(task_from_sqlite_row(&r)?),
                None => None,
            })
        }
    }
}

pub async fn count_by_status(pool: &DbPool, status: &str) -> Result<i64> {
    let row = match pool {
        DbPool::Postgres(p) => sqlx::query("select count(*) as n from queue where status = $1").bind(status).fetch_one(p).await,
        DbPool::Sqlite(p) => sqlx::query("select count(*) as n from queue where status = ?").bind(status).fetch_one(p).await,
    }
    .context("count_by_status failed")?;
    Ok(row.try_get("n")?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ensure_schema;

    #[tokio::test]
    async fn commit_task_dedups_concurrent_identical_signatures() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();

        commit_task(&mut Conn::Pool(&pool), "sig-1", "refresh_entity", "{}", 1, 0).await.unwrap();
        commit_task(&mut Conn::Pool(&pool), "sig-1", "refresh_entity", "{}", 1, 0).await.unwrap();

        assert_eq!(count_by_status(&pool, STATUS_READY).await.unwrap(), 1);
        let claimed = claim_batch(&pool, "w1", 10, 30_000).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].multiplicity, 2);
    }

    #[tokio::test]
    async fn commit_task_adds_multiplicity_onto_existing_ready_row() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();

        commit_task(&mut Conn::Pool(&pool), "sig-mult", "refresh_entity", "{}", 3, 0).await.unwrap();
        commit_task(&mut Conn::Pool(&pool), "sig-mult", "refresh_entity", "{}", 2, 0).await.unwrap();

        let claimed = claim_batch(&pool, "w1", 10, 30_000).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].multiplicity, 5);
    }

    #[tokio::test]
    async fn claim_batch_leases_and_complete_removes_row() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        commit_task(&mut Conn::Pool(&pool), "sig-2", "refresh_entity", "{}", 1, 0).await.unwrap();

        let claimed = claim_batch(&pool, "w1", 10, 30_000).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, STATUS_LEASED);

        let empty = claim_batch(&pool, "w2", 10, 30_000).await.unwrap();
        assert!(empty.is_empty(), "already-leased task must not be claimable again");

        complete_task(&mut Conn::Pool(&pool), claimed[0].task_id).await.unwrap();
        assert!(fetch_task(&pool, claimed[0].task_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letter_task_sets_status_and_reason() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        commit_task(&mut Conn::Pool(&pool), "sig-3", "refresh_entity", "{}", 1, 0).await.unwrap();
        let claimed = claim_batch(&pool, "w1", 10, 30_000).await.unwrap();

        dead_letter_task(&pool, claimed[0].task_id, "unknown action").await.unwrap();
        let task = fetch_task(&pool, claimed[0].task_id).await.unwrap().unwrap();
        assert_eq!(task.status, STATUS_DEAD_LETTER);
        assert_eq!(task.dead_letter_reason.as_deref(), Some("unknown action"));
    }

    #[tokio::test]
    async fn reap_expired_leases_returns_stuck_tasks_to_ready() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();
        commit_task(&mut Conn::Pool(&pool), "sig-4", "refresh_entity", "{}", 1, 0).await.unwrap();
        let claimed = claim_batch(&pool, "w1", 10, 0).await.unwrap();
        assert_eq!(claimed[0].status, STATUS_LEASED);

        let reaped = reap_expired_leases(&pool).await.unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(count_by_status(&pool, STATUS_READY).await.unwrap(), 1);
    }
}
