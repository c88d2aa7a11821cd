//! Typed CRUD for the `locks` table — named mutual-exclusion rows guarding
//! per-entity critical sections (spec.md §4.C). A lock is a single row
//! keyed by `resource_key`; acquiring is `INSERT ... ON CONFLICT DO NOTHING`
//! and releasing is a delete scoped to the holder's `modifier_id`, so a
//! stale caller can never release a lock it no longer holds.

use crate::pool::{now_micros, DbPool};
use anyhow::{Context, Result};
use sqlx::Row;

/// Attempt to acquire `resource_key` for `modifier_id`. Returns `true` if
/// this call acquired it, `false` if another modifier already holds it.
pub async fn try_acquire(pool: &DbPool, resource_key: &str, modifier_id: &str) -> Result<bool> {
    let now = now_micros();
    let result = match pool {
        DbPool::Postgres(p) => {
            sqlx::query(
                "insert into locks (resource_key, modifier_id, created_on, modified_on)
                 values ($1, $2, now(), now())
                 on conflict (resource_key) do nothing",
            )
            .bind(resource_key)
            .bind(modifier_id)
            .execute(p)
            .await
        }
        DbPool::Sqlite(p) => {
            sqlx::query(
                "insert into locks (resource_key, modifier_id, created_on, modified_on)
                 values (?, ?, ?, ?)
                 on conflict (resource_key) do nothing",
            )
            .bind(resource_key)
            .bind(modifier_id)
            .bind(now)
            .bind(now)
            .execute(p)
            .await
        }
    }
    .context("try_acquire failed")?;
    Ok(result.rows_affected() == 1)
}

/// Release `resource_key`, but only if still held by `modifier_id`. Returns
/// `true` if this call released it.
pub async fn release(pool: &DbPool, resource_key: &str, modifier_id: &str) -> Result<bool> {
    let result = match pool {
        DbPool::Postgres(p) => {
            sqlx::query("delete from locks where resource_key = $1 and modifier_id = $2")
                .bind(resource_key)
                .bind(modifier_id)
                .execute(p)
                .await
        }
        DbPool::Sqlite(p) => {
            sqlx::query("delete from locks where resource_key = ? and modifier_id = ?")
                .bind(resource_key)
                .bind(modifier_id)
                .execute(p)
                .await
        }
    }
    .context("release failed")?;
    Ok(result.rows_affected() == 1)
}

pub async fn holder(pool: &DbPool, resource_key: &str) -> Result<Option<String>> {
    let row = match pool {
        DbPool::Postgres(p) => {
            sqlx::query("select modifier_id from locks where resource_key = $1")
                .bind(resource_key)
                .fetch_optional(p)
                .await
        }
        DbPool::Sqlite(p) => {
            sqlx::query("select modifier_id from locks where resource_key = ?")
                .bind(resource_key)
                .fetch_optional(p)
                .await
        }
    }
    .context("holder failed")?;
    Ok(match row {
        Some(r) => Some(r.try_get("modifier_id")?),
        None => None,
    })
}

/// Forcibly release every lock whose row is older than `max_age_micros`
/// (startup reaper, spec.md §4.C: a process that held a lock and crashed
/// without releasing it must not wedge that resource forever). Returns the
/// number of locks reaped.
pub async fn reap_stale(pool: &DbPool, max_age_micros: i64) -> Result<u64> {
    let cutoff_pg_interval_micros = max_age_micros;
    let result = match pool {
        DbPool::Postgres(p) => {
            sqlx::query("delete from locks where modified_on < now() - make_interval(secs => $1 / 1000000.0)")
                .bind(cutoff_pg_interval_micros)
                .execute(p)
                .await
        }
        DbPool::Sqlite(p) => {
            let cutoff = now_micros() - max_age_micros;
            sqlx::query("delete from locks where modified_on < ?").bind(cutoff).execute(p).await
        }
    }
    .context("reap_stale failed")?;
    Ok(result.rows_affected())
}
