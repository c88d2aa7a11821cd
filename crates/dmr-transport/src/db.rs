//! `--database-info-queue`: the data-mart database itself acts as the
//! message source. Claiming uses the same `FOR UPDATE SKIP LOCKED` /
//! `BEGIN IMMEDIATE` split as `dmr_db::queue::claim_batch`, since an inbox
//! row and a follow-up task row are the same kind of thing: a row that must
//! be handed to exactly one consumer at a time.

use crate::{IncomingMessage, MessageSource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dmr_db::{now_micros, DbPool};
use sqlx::Row;

/// How long a claimed-but-unacked message stays invisible before another
/// consumer may pick it up again.
const REDELIVERY_MS: i64 = 30_000;

/// Create the `info_inbox` table if it does not already exist. Not part of
/// `dmr_db::schema::ensure_schema` — the inbox is transport-owned state, not
/// data-mart state (spec.md §1 excludes transport schemas from the core).
pub async fn ensure_schema(pool: &DbPool) -> Result<()> {
    match pool {
        DbPool::Postgres(p) => {
            sqlx::query(
                "create table if not exists info_inbox (
                    message_id bigserial primary key,
                    body text not null,
                    status text not null default 'ready',
                    visible_at bigint not null,
                    created_on bigint not null
                 )",
            )
            .execute(p)
            .await
        }
        DbPool::Sqlite(p) => {
            sqlx::query(
                "create table if not exists info_inbox (
                    message_id integer primary key autoincrement,
                    body text not null,
                    status text not null default 'ready',
                    visible_at bigint not null,
                    created_on bigint not null
                 )",
            )
            .execute(p)
            .await
        }
    }
    .context("info_inbox: create table failed")?;
    Ok(())
}

/// Seed one message. Stands in for whatever upstream publisher would push
/// into the real inbox; used by tests and by operators replaying messages.
pub async fn publish(pool: &DbPool, body: &str) -> Result<()> {
    let now = now_micros();
    match pool {
        DbPool::Postgres(p) => {
            sqlx::query("insert into info_inbox (body, status, visible_at, created_on) values ($1, 'ready', $2, $2)")
                .bind(body)
                .bind(now)
                .execute(p)
                .await
        }
        DbPool::Sqlite(p) => {
            sqlx::query("insert into info_inbox (body, status, visible_at, created_on) values (?, 'ready', ?, ?)")
                .bind(body)
                .bind(now)
                .bind(now)
                .execute(p)
                .await
        }
    }
    .context("info_inbox: publish failed")?;
    Ok(())
}

pub struct DbQueueSource {
    pool: DbPool,
}

impl DbQueueSource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageSource for DbQueueSource {
    async fn receive(&self, max_messages: i64) -> Result<Vec<IncomingMessage>> {
        let now = now_micros();
        let visible_at = now + REDELIVERY_MS * 1000;

        match &self.pool {
            DbPool::Postgres(p) => {
                let mut tx = p.begin().await.context("info_inbox receive: begin failed")?;
                let rows = sqlx::query(
                    "select message_id, body from info_inbox
                     where status = 'ready' and visible_at <= $1
                     order by message_id
                     limit $2
                     for update skip locked",
                )
                .bind(now)
                .bind(max_messages)
                .fetch_all(&mut *tx)
                .await
                .context("info_inbox receive: select failed")?;

                let mut out = Vec::with_capacity(rows.len());
                for row in &rows {
                    let message_id: i64 = row.try_get("message_id")?;
                    let body: String = row.try_get("body")?;
                    sqlx::query("update info_inbox set status = 'leased', visible_at = $1 where message_id = $2")
                        .bind(visible_at)
                        .bind(message_id)
                        .execute(&mut *tx)
                        .await
                        .context("info_inbox receive: lease update failed")?;
                    out.push(IncomingMessage { receipt_handle: message_id.to_string(), body });
                }
                tx.commit().await.context("info_inbox receive: commit failed")?;
                Ok(out)
            }
            DbPool::Sqlite(p) => {
                let mut conn = p.acquire().await.context("info_inbox receive: acquire failed")?;
                sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await.context("info_inbox receive: begin immediate failed")?;

                let rows = sqlx::query(
                    "select message_id, body from info_inbox
                     where status = 'ready' and visible_at <= ?
                     order by message_id
                     limit ?",
                )
                .bind(now)
                .bind(max_messages)
                .fetch_all(&mut *conn)
                .await;

                let rows = match rows {
                    Ok(r) => r,
                    Err(e) => {
                        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                        return Err(e).context("info_inbox receive: select failed");
                    }
                };

                let mut out = Vec::with_capacity(rows.len());
                for row in &rows {
                    let message_id: i64 = row.try_get("message_id")?;
                    let body: String = row.try_get("body")?;
                    sqlx::query("update info_inbox set status = 'leased', visible_at = ? where message_id = ?")
                        .bind(visible_at)
                        .bind(message_id)
                        .execute(&mut *conn)
                        .await
                        .context("info_inbox receive: lease update failed")?;
                    out.push(IncomingMessage { receipt_handle: message_id.to_string(), body });
                }
                sqlx::query("COMMIT").execute(&mut *conn).await.context("info_inbox receive: commit failed")?;
                Ok(out)
            }
        }
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let message_id: i64 = receipt_handle.parse().context("info_inbox ack: receipt handle is not a message id")?;
        match &self.pool {
            DbPool::Postgres(p) => sqlx::query("delete from info_inbox where message_id = $1").bind(message_id).execute(p).await,
            DbPool::Sqlite(p) => sqlx::query("delete from info_inbox where message_id = ?").bind(message_id).execute(p).await,
        }
        .context("info_inbox ack: delete failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn receive_leases_and_ack_deletes() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool).await.unwrap();
        publish(&pool, r#"{"AFFECTED_ENTITIES":[]}"#).await.unwrap();

        let source = DbQueueSource::new(pool.clone());
        let batch = source.receive(10).await.unwrap();
        assert_eq!(batch.len(), 1);

        let again = source.receive(10).await.unwrap();
        assert!(again.is_empty(), "leased message must not be redelivered before it expires");

        source.ack(&batch[0].receipt_handle).await.unwrap();
        let row_count: i64 = match &pool {
            DbPool::Sqlite(p) => sqlx::query_scalar("select count(*) from info_inbox").fetch_one(p).await.unwrap(),
            DbPool::Postgres(_) => unreachable!("tests run against sqlite"),
        };
        assert_eq!(row_count, 0);
    }

    #[tokio::test]
    async fn receive_respects_max_messages() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool).await.unwrap();
        publish(&pool, "one").await.unwrap();
        publish(&pool, "two").await.unwrap();
        publish(&pool, "three").await.unwrap();

        let source = DbQueueSource::new(pool);
        let batch = source.receive(2).await.unwrap();
        assert_eq!(batch.len(), 2);
    }
}
