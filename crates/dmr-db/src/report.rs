//! Typed CRUD for `report` / `report_detail` / `pending_report` — the
//! aggregate tables the report updater (spec.md §4.H) folds deltas into.

use crate::pool::{now_micros, Conn, DbPool, DbTx, Dialect};
use anyhow::{Context, Result};
use dmr_schemas::{EntityId, PendingReportDelta, ReportDetailRow, ReportRow};
use sqlx::Row;

/// Rewrite `?` placeholders into `$1`, `$2`, … for PostgreSQL.
fn rebind(sql: &str, dialect: Dialect) -> String {
    if dialect != Dialect::Postgres {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    for c in sql.chars() {
        if c == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(c);
        }
    }
    out
}

/// `related_id: None` is stored as the sentinel `0` (see schema.rs).
fn related_sentinel(related_id: Option<EntityId>) -> EntityId {
    related_id.unwrap_or(0)
}

pub async fn insert_pending_report(conn: &mut Conn<'_>, delta: &PendingReportDelta) -> Result<()> {
    let sql = "insert into pending_report (report_key, entity_id, related_id, entity_delta, record_delta, relation_delta, created_on, modified_on)
               values (?, ?, ?, ?, ?, ?, ?, ?)";
    let now = now_micros();
    let related = related_sentinel(delta.related_id);
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query(&rebind(sql, Dialect::Postgres))
                .bind(&delta.report_key)
                .bind(delta.entity_id)
                .bind(related)
                .bind(delta.entity_delta)
                .bind(delta.record_delta)
                .bind(delta.relation_delta)
                .bind(now)
                .bind(now)
                .execute(p)
                .await
        }
        Conn::Pool(DbPool::Sqlite(p)) => {
            sqlx::query(sql)
                .bind(&delta.report_key)
                .bind(delta.entity_id)
                .bind(related)
                .bind(delta.entity_delta)
                .bind(delta.record_delta)
                .bind(delta.relation_delta)
                .bind(now)
                .bind(now)
                .execute(p)
                .await
        }
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query(&rebind(sql, Dialect::Postgres))
                .bind(&delta.report_key)
                .bind(delta.entity_id)
                .bind(related)
                .bind(delta.entity_delta)
                .bind(delta.record_delta)
                .bind(delta.relation_delta)
                .bind(now)
                .bind(now)
                .execute(&mut **tx)
                .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => {
            sqlx::query(sql)
                .bind(&delta.report_key)
                .bind(delta.entity_id)
                .bind(related)
                .bind(delta.entity_delta)
                .bind(delta.record_delta)
                .bind(delta.relation_delta)
                .bind(now)
                .bind(now)
                .execute(&mut **tx)
                .await
        }
    }
    .context("insert_pending_report failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PendingReportRow {
    pub id: i64,
    pub delta: PendingReportDelta,
}

/// Select up to `batch_size` pending rows for one key, oldest id first
/// (spec.md §4.H step 1).
pub async fn select_pending_batch(pool: &DbPool, report_key: &str, batch_size: i64) -> Result<Vec<PendingReportRow>> {
    let sql = "select id, report_key, entity_id, related_id, entity_delta, record_delta, relation_delta
               from pending_report where report_key = ? order by id asc limit ?";
    let rows = match pool {
        DbPool::Postgres(p) => sqlx::query(&rebind(sql, Dialect::Postgres)).bind(report_key).bind(batch_size).fetch_all(p).await,
        DbPool::Sqlite(p) => sqlx::query(sql).bind(report_key).bind(batch_size).fetch_all(p).await,
    }
    .context("select_pending_batch failed")?;

    rows.into_iter()
        .map(|row| {
            let related_id: i64 = row.try_get("related_id")?;
            Ok(PendingReportRow {
                id: row.try_get("id")?,
                delta: PendingReportDelta {
                    report_key: row.try_get("report_key")?,
                    entity_id: row.try_get("entity_id")?,
                    related_id: if related_id == 0 { None } else { Some(related_id) },
                    entity_delta: row.try_get("entity_delta")?,
                    record_delta: row.try_get("record_delta")?,
                    relation_delta: row.try_get("relation_delta")?,
                },
            })
        })
        .collect()
}

/// Does at least one pending row remain for `report_key`? Takes `conn`
/// rather than a bare pool: callers check this right after deleting the
/// batch they just folded, and on an open transaction a pool-level read
/// would not see that uncommitted delete.
pub async fn has_pending(conn: &mut Conn<'_>, report_key: &str) -> Result<bool> {
    let sql = "select 1 as one from pending_report where report_key = ? limit 1";
    let row = match conn {
        Conn::Pool(DbPool::Postgres(p)) => sqlx::query(&rebind(sql, Dialect::Postgres)).bind(report_key).fetch_optional(p).await,
        Conn::Pool(DbPool::Sqlite(p)) => sqlx::query(sql).bind(report_key).fetch_optional(p).await,
        Conn::Tx(DbTx::Postgres(tx)) => sqlx::query(&rebind(sql, Dialect::Postgres)).bind(report_key).fetch_optional(&mut **tx).await,
        Conn::Tx(DbTx::Sqlite(tx)) => sqlx::query(sql).bind(report_key).fetch_optional(&mut **tx).await,
    }
    .context("has_pending failed")?;
    Ok(row.is_some())
}

pub async fn delete_pending_rows(conn: &mut Conn<'_>, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    for chunk in crate::dialect::chunk_for_dialect(conn.dialect(), ids) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("delete from pending_report where id in ({placeholders})");
        match conn {
            Conn::Pool(DbPool::Postgres(p)) => {
                let mut q = sqlx::query(&rebind(&sql, Dialect::Postgres));
                for id in chunk.iter() {
                    q = q.bind(*id);
                }
                q.execute(p).await
            }
            Conn::Pool(DbPool::Sqlite(p)) => {
                let mut q = sqlx::query(&sql);
                for id in chunk.iter() {
                    q = q.bind(*id);
                }
                q.execute(p).await
            }
            Conn::Tx(DbTx::Postgres(tx)) => {
                let mut q = sqlx::query(&rebind(&sql, Dialect::Postgres));
                for id in chunk.iter() {
                    q = q.bind(*id);
                }
                q.execute(&mut **tx).await
            }
            Conn::Tx(DbTx::Sqlite(tx)) => {
                let mut q = sqlx::query(&sql);
                for id in chunk.iter() {
                    q = q.bind(*id);
                }
                q.execute(&mut **tx).await
            }
        }
        .context("delete_pending_rows failed")?;
    }
    Ok(())
}

/// Upsert one detail row's absolute `record_count`/`match_key`/`principle`.
/// Called with the net folded value, not a delta (the caller has already
/// summed pending deltas onto the existing row).
pub async fn upsert_report_detail(conn: &mut Conn<'_>, row: &ReportDetailRow) -> Result<()> {
    let sql = "insert into report_detail (report_key, entity_id, related_id, record_count, match_key, principle)
               values (?, ?, ?, ?, ?, ?)
               on conflict (report_key, entity_id, related_id) do update set
                  record_count = excluded.record_count,
                  match_key = excluded.match_key,
                  principle = excluded.principle";
    let related = related_sentinel(row.related_id);
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query(&rebind(sql, Dialect::Postgres))
                .bind(&row.report_key)
                .bind(row.entity_id)
                .bind(related)
                .bind(row.record_count)
                .bind(&row.match_key)
                .bind(&row.principle)
                .execute(p)
                .await
        }
        Conn::Pool(DbPool::Sqlite(p)) => {
            sqlx::query(sql)
                .bind(&row.report_key)
                .bind(row.entity_id)
                .bind(related)
                .bind(row.record_count)
                .bind(&row.match_key)
                .bind(&row.principle)
                .execute(p)
                .await
        }
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query(&rebind(sql, Dialect::Postgres))
                .bind(&row.report_key)
                .bind(row.entity_id)
                .bind(related)
                .bind(row.record_count)
                .bind(&row.match_key)
                .bind(&row.principle)
                .execute(&mut **tx)
                .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => {
            sqlx::query(sql)
                .bind(&row.report_key)
                .bind(row.entity_id)
                .bind(related)
                .bind(row.record_count)
                .bind(&row.match_key)
                .bind(&row.principle)
                .execute(&mut **tx)
                .await
        }
    }
    .context("upsert_report_detail failed")?;
    Ok(())
}

pub async fn delete_report_detail(conn: &mut Conn<'_>, report_key: &str, entity_id: EntityId, related_id: Option<EntityId>) -> Result<()> {
    let sql = "delete from report_detail where report_key = ? and entity_id = ? and related_id = ?";
    let related = related_sentinel(related_id);
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query(&rebind(sql, Dialect::Postgres))
                .bind(report_key)
                .bind(entity_id)
                .bind(related)
                .execute(p)
                .await
        }
        Conn::Pool(DbPool::Sqlite(p)) => sqlx::query(sql).bind(report_key).bind(entity_id).bind(related).execute(p).await,
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query(&rebind(sql, Dialect::Postgres))
                .bind(report_key)
                .bind(entity_id)
                .bind(related)
                .execute(&mut **tx)
                .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => sqlx::query(sql).bind(report_key).bind(entity_id).bind(related).execute(&mut **tx).await,
    }
    .context("delete_report_detail failed")?;
    Ok(())
}

pub async fn fetch_report_detail(
    pool: &DbPool,
    report_key: &str,
    entity_id: EntityId,
    related_id: Option<EntityId>,
) -> Result<Option<ReportDetailRow>> {
    let sql = "select report_key, entity_id, related_id, record_count, match_key, principle
               from report_detail where report_key = ? and entity_id = ? and related_id = ?";
    let related = related_sentinel(related_id);
    let row = match pool {
        DbPool::Postgres(p) => {
            sqlx::query(&rebind(sql, Dialect::Postgres))
                .bind(report_key)
                .bind(entity_id)
                .bind(related)
                .fetch_optional(p)
                .await
        }
        DbPool::Sqlite(p) => sqlx::query(sql).bind(report_key).bind(entity_id).bind(related).fetch_optional(p).await,
    }
    .context("fetch_report_detail failed")?;

    Ok(match row {
        None => None,
        Some(row) => {
            let related_id: i64 = row.try_get("related_id")?;
            Some(ReportDetailRow {
                report_key: row.try_get("report_key")?,
                entity_id: row.try_get("entity_id")?,
                related_id: if related_id == 0 { None } else { Some(related_id) },
                record_count: row.try_get("record_count")?,
                match_key: row.try_get("match_key")?,
                principle: row.try_get("principle")?,
            })
        }
    })
}

/// Recompute `report`'s aggregate columns from `report_detail` as Σ
/// (spec.md §4.H step 3, invariant 4): entity_count = distinct entities with
/// a detail row, record_count = Σ detail.record_count, relation_count =
/// distinct (entity_id, related_id) pairs with related_id != 0.
pub async fn recompute_report(conn: &mut Conn<'_>, report_key: &str) -> Result<ReportRow> {
    let sql = "select
                 count(distinct entity_id) as entity_count,
                 coalesce(sum(record_count), 0) as record_count,
                 count(distinct case when related_id != 0 then entity_id * 1000000000 + related_id end) as relation_count
               from report_detail where report_key = ?";
    let row = match conn {
        Conn::Pool(DbPool::Postgres(p)) => sqlx::query(&rebind(sql, Dialect::Postgres)).bind(report_key).fetch_one(p).await,
        Conn::Pool(DbPool::Sqlite(p)) => sqlx::query(sql).bind(report_key).fetch_one(p).await,
        Conn::Tx(DbTx::Postgres(tx)) => sqlx::query(&rebind(sql, Dialect::Postgres)).bind(report_key).fetch_one(&mut **tx).await,
        Conn::Tx(DbTx::Sqlite(tx)) => sqlx::query(sql).bind(report_key).fetch_one(&mut **tx).await,
    }
    .context("recompute_report select failed")?;

    let report = ReportRow {
        entity_count: row.try_get("entity_count")?,
        record_count: row.try_get("record_count")?,
        relation_count: row.try_get("relation_count")?,
        statistic_count: 0,
    };

    let upsert_sql = "insert into report (report_key, entity_count, record_count, relation_count, statistic_count)
                      values (?, ?, ?, ?, ?)
                      on conflict (report_key) do update set
                         entity_count = excluded.entity_count,
                         record_count = excluded.record_count,
                         relation_count = excluded.relation_count,
                         statistic_count = excluded.statistic_count";
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query(&rebind(upsert_sql, Dialect::Postgres))
                .bind(report_key)
                .bind(report.entity_count)
                .bind(report.record_count)
                .bind(report.relation_count)
                .bind(report.statistic_count)
                .execute(p)
                .await
        }
        Conn::Pool(DbPool::Sqlite(p)) => {
            sqlx::query(upsert_sql)
                .bind(report_key)
                .bind(report.entity_count)
                .bind(report.record_count)
                .bind(report.relation_count)
                .bind(report.statistic_count)
                .execute(p)
                .await
        }
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query(&rebind(upsert_sql, Dialect::Postgres))
                .bind(report_key)
                .bind(report.entity_count)
                .bind(report.record_count)
                .bind(report.relation_count)
                .bind(report.statistic_count)
                .execute(&mut **tx)
                .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => {
            sqlx::query(upsert_sql)
                .bind(report_key)
                .bind(report.entity_count)
                .bind(report.record_count)
                .bind(report.relation_count)
                .bind(report.statistic_count)
                .execute(&mut **tx)
                .await
        }
    }
    .context("recompute_report upsert failed")?;

    Ok(report)
}

pub async fn fetch_report(pool: &DbPool, report_key: &str) -> Result<Option<ReportRow>> {
    let sql = "select entity_count, record_count, relation_count, statistic_count from report where report_key = ?";
    let row = match pool {
        DbPool::Postgres(p) => sqlx::query(&rebind(sql, Dialect::Postgres)).bind(report_key).fetch_optional(p).await,
        DbPool::Sqlite(p) => sqlx::query(sql).bind(report_key).fetch_optional(p).await,
    }
    .context("fetch_report failed")?;

    Ok(match row {
        None => None,
        Some(row) => Some(ReportRow {
            entity_count: row.try_get("entity_count")?,
            record_count: row.try_get("record_count")?,
            relation_count: row.try_get("relation_count")?,
            statistic_count: row.try_get("statistic_count")?,
        }),
    })
}
