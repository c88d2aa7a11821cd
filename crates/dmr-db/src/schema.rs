//! Schema builder (spec.md §4.B).
//!
//! `ensure_schema(pool, recreate)`: idempotently creates the data-mart
//! tables/indexes/triggers, or drops and recreates them in reverse-dependency
//! order when `recreate` is true. Dialect files are partitioned by object
//! kind, matching spec.md's "Dialect files are partitioned by object kind
//! (tables, indexes, triggers, functions)".
//!
//! On PostgreSQL a shared `sz_maintain_timestamps()` function is invoked by
//! before-insert/before-update triggers; on SQLite two triggers per table
//! mimic the same behavior without a function (SQLite has no trigger-shared
//! procedures). Above this module, timestamps are read-only (spec.md §9).

use crate::pool::{DbPool, Dialect};
use anyhow::{Context, Result};

/// Tables in dependency order (a table only references tables earlier in
/// this list). `recreate` drops them in reverse.
const TABLES_IN_ORDER: &[&str] = &[
    "locks",
    "entity",
    "record",
    "relation",
    "report",
    "report_detail",
    "pending_report",
    "queue",
];

pub async fn ensure_schema(pool: &DbPool, recreate: bool) -> Result<()> {
    if recreate {
        drop_all(pool).await.context("drop_all failed")?;
    }
    create_tables(pool).await.context("create_tables failed")?;
    create_indexes(pool).await.context("create_indexes failed")?;
    create_triggers(pool).await.context("create_triggers failed")?;
    Ok(())
}

async fn drop_all(pool: &DbPool) -> Result<()> {
    for table in TABLES_IN_ORDER.iter().rev() {
        let sql = format!("drop table if exists {table}");
        exec(pool, &sql).await?;
    }
    if pool.dialect() == Dialect::Postgres {
        exec(pool, "drop function if exists sz_maintain_timestamps()").await?;
    }
    Ok(())
}

async fn exec(pool: &DbPool, sql: &str) -> Result<()> {
    match pool {
        DbPool::Postgres(p) => {
            sqlx::query(sql).execute(p).await.with_context(|| format!("exec failed: {sql}"))?;
        }
        DbPool::Sqlite(p) => {
            sqlx::query(sql).execute(p).await.with_context(|| format!("exec failed: {sql}"))?;
        }
    }
    Ok(())
}

async fn create_tables(pool: &DbPool) -> Result<()> {
    let dialect = pool.dialect();
    let ts_cols = timestamp_columns(dialect);

    let ddl = vec![
        format!(
            "create table if not exists locks (
                resource_key text primary key,
                modifier_id text not null,
                {ts_cols}
            )"
        ),
        format!(
            "create table if not exists entity (
                entity_id bigint primary key,
                entity_name text,
                record_count bigint not null default 0,
                relation_count bigint not null default 0,
                entity_hash text not null,
                prev_entity_hash text,
                {ts_cols}
            )"
        ),
        format!(
            "create table if not exists record (
                data_source text not null,
                record_id text not null,
                entity_id bigint not null references entity(entity_id),
                match_key text,
                errule_code text,
                principle text,
                {ts_cols},
                primary key (data_source, record_id)
            )"
        ),
        format!(
            "create table if not exists relation (
                entity_id bigint not null references entity(entity_id),
                related_id bigint not null references entity(entity_id),
                match_type text not null,
                match_key text,
                errule_code text,
                principle text,
                is_ambiguous smallint not null default 0,
                is_disclosed smallint not null default 0,
                relation_hash text not null,
                {ts_cols},
                primary key (entity_id, related_id)
            )"
        ),
        format!(
            "create table if not exists report (
                report_key text primary key,
                entity_count bigint not null default 0,
                record_count bigint not null default 0,
                relation_count bigint not null default 0,
                statistic_count bigint not null default 0,
                {ts_cols}
            )"
        ),
        // related_id uses the sentinel 0 (not a valid engine entity_id) for
        // report-detail rows that describe a single entity rather than a
        // pair, so the composite key stays NOT NULL on every dialect.
        format!(
            "create table if not exists report_detail (
                report_key text not null references report(report_key),
                entity_id bigint not null,
                related_id bigint not null default 0,
                record_count bigint not null default 0,
                match_key text,
                principle text,
                {ts_cols},
                primary key (report_key, entity_id, related_id)
            )"
        ),
        format!(
            "create table if not exists pending_report ({} report_key text not null,
                entity_id bigint not null,
                related_id bigint,
                entity_delta bigint not null default 0,
                record_delta bigint not null default 0,
                relation_delta bigint not null default 0,
                {ts_cols}
            )",
            autoincrement_pk(dialect, "id")
        ),
        format!(
            "create table if not exists queue ({} signature text not null,
                action text not null,
                params_json text not null,
                multiplicity bigint not null default 1,
                visible_at bigint not null,
                leased_by text,
                lease_expires_at bigint,
                attempt_count integer not null default 0,
                status text not null default 'ready',
                dead_letter_reason text,
                {ts_cols}
            )",
            autoincrement_pk(dialect, "task_id")
        ),
    ];

    for stmt in ddl {
        exec(pool, &stmt).await?;
    }
    Ok(())
}

fn autoincrement_pk(dialect: Dialect, col: &str) -> String {
    match dialect {
        Dialect::Postgres => format!("{col} bigserial primary key,"),
        Dialect::Sqlite => format!("{col} integer primary key autoincrement,"),
    }
}

fn timestamp_columns(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Postgres => {
            "created_on timestamptz not null default now(),
             created_by text not null default current_user,
             modified_on timestamptz not null default now(),
             modified_by text not null default current_user"
        }
        Dialect::Sqlite => {
            "created_on bigint not null default (cast((julianday('now') - 2440587.5) * 86400000000 as integer)),
             created_by text not null default 'sqlite',
             modified_on bigint not null default (cast((julianday('now') - 2440587.5) * 86400000000 as integer)),
             modified_by text not null default 'sqlite'"
        }
    }
}

async fn create_indexes(pool: &DbPool) -> Result<()> {
    let stmts = [
        "create index if not exists idx_record_entity_id on record(entity_id)",
        "create index if not exists idx_relation_related_id on relation(related_id)",
        "create index if not exists idx_report_detail_report_key on report_detail(report_key)",
        "create index if not exists idx_pending_report_key on pending_report(report_key, id)",
        "create index if not exists idx_queue_visible_at on queue(status, visible_at, task_id)",
        // Enforces spec.md §8 boundary behavior: concurrent commit of two
        // tasks with identical signatures collapses into one ready row.
        "create unique index if not exists uq_queue_signature_ready on queue(signature) where status = 'ready'",
    ];
    for s in stmts {
        exec(pool, s).await?;
    }
    Ok(())
}

async fn create_triggers(pool: &DbPool) -> Result<()> {
    match pool.dialect() {
        Dialect::Postgres => create_triggers_pg(pool).await,
        Dialect::Sqlite => create_triggers_sqlite(pool).await,
    }
}

/// `sz_maintain_timestamps`: one shared function, invoked by a
/// before-update trigger on every mutable table.
async fn create_triggers_pg(pool: &DbPool) -> Result<()> {
    exec(
        pool,
        "create or replace function sz_maintain_timestamps() returns trigger as $$
         begin
             new.modified_on := now();
             new.modified_by := current_user;
             return new;
         end;
         $$ language plpgsql",
    )
    .await?;

    for table in TABLES_IN_ORDER {
        let trigger = format!("trg_{table}_maintain_ts");
        exec(pool, &format!("drop trigger if exists {trigger} on {table}")).await?;
        exec(
            pool,
            &format!(
                "create trigger {trigger}
                 before update on {table}
                 for each row execute function sz_maintain_timestamps()"
            ),
        )
        .await?;
    }
    Ok(())
}

/// SQLite has no shared trigger procedures, so two triggers per table
/// reproduce the same before-update timestamp maintenance inline.
async fn create_triggers_sqlite(pool: &DbPool) -> Result<()> {
    for table in TABLES_IN_ORDER {
        let pk = primary_key_columns(table);
        let update_trigger = format!("trg_{table}_maintain_ts_update");
        let where_clause = pk
            .iter()
            .map(|c| format!("{c} = old.{c}"))
            .collect::<Vec<_>>()
            .join(" and ");
        exec(
            pool,
            &format!(
                "create trigger if not exists {update_trigger}
                 after update on {table}
                 for each row
                 when new.modified_on = old.modified_on
                 begin
                     update {table}
                     set modified_on = cast((julianday('now') - 2440587.5) * 86400000000 as integer),
                         modified_by = 'sqlite'
                     where {where_clause};
                 end"
            ),
        )
        .await?;
    }
    Ok(())
}

fn primary_key_columns(table: &str) -> &'static [&'static str] {
    match table {
        "locks" => &["resource_key"],
        "entity" => &["entity_id"],
        "record" => &["data_source", "record_id"],
        "relation" => &["entity_id", "related_id"],
        "report" => &["report_key"],
        "report_detail" => &["report_key", "entity_id", "related_id"],
        "pending_report" => &["id"],
        "queue" => &["task_id"],
        _ => &[],
    }
}
