//! Typed CRUD for the `entity` / `record` / `relation` tables — the rows the
//! entity-refresh handler (spec.md §4.G) reads and mutates. Pure data
//! access: the diff/hash algorithm lives in `dmr-refresh`, not here, the
//! same separation the teacher keeps between `mqk-db` (typed SQL) and
//! `mqk-reconcile` (pure comparison logic).
//!
//! Reads stay pool-only — the per-entity advisory lock already serializes
//! concurrent writers, so a read never needs to join an in-flight write's
//! transaction. Writes take `&mut Conn` so they can run standalone or be
//! staged inside a caller-owned transaction (spec.md §4.G: all of one
//! refresh's row changes commit or roll back together).

use crate::pool::{bool_to_i32, i32_to_bool, Conn, DbPool, DbTx};
use anyhow::{Context, Result};
use dmr_schemas::{EntityId, EntityRow, MatchType, Record, RecordKey, Relation};
use sqlx::Row;

pub async fn fetch_entity(pool: &DbPool, entity_id: EntityId) -> Result<Option<EntityRow>> {
    let sql = "select entity_id, entity_name, record_count, relation_count, entity_hash, prev_entity_hash
                from entity where entity_id = ?";
    let row = match pool {
        DbPool::Postgres(p) => {
            sqlx::query(&rebind(sql, crate::pool::Dialect::Postgres))
                .bind(entity_id)
                .fetch_optional(p)
                .await
        }
        DbPool::Sqlite(p) => sqlx::query(sql).bind(entity_id).fetch_optional(p).await,
    }
    .context("fetch_entity failed")?;

    Ok(match row {
        None => None,
        Some(row) => Some(EntityRow {
            entity_id: row.try_get("entity_id")?,
            entity_name: row.try_get("entity_name")?,
            record_count: row.try_get("record_count")?,
            relation_count: row.try_get("relation_count")?,
            entity_hash: row.try_get("entity_hash")?,
            prev_entity_hash: row.try_get("prev_entity_hash")?,
        }),
    })
}

pub async fn list_records_for_entity(pool: &DbPool, entity_id: EntityId) -> Result<Vec<Record>> {
    let sql = "select data_source, record_id, entity_id, match_key, errule_code, principle
                from record where entity_id = ? order by data_source, record_id";
    let rows = match pool {
        DbPool::Postgres(p) => sqlx::query(&rebind(sql, crate::pool::Dialect::Postgres)).bind(entity_id).fetch_all(p).await,
        DbPool::Sqlite(p) => sqlx::query(sql).bind(entity_id).fetch_all(p).await,
    }
    .context("list_records_for_entity failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(Record {
                key: RecordKey::new(row.try_get::<String, _>("data_source")?, row.try_get::<String, _>("record_id")?),
                entity_id: row.try_get("entity_id")?,
                match_key: row.try_get("match_key")?,
                errule_code: row.try_get("errule_code")?,
                principle: row.try_get("principle")?,
            })
        })
        .collect()
}

/// Relations where `entity_id` appears on either side of the symmetric pair.
pub async fn list_relations_for_entity(pool: &DbPool, entity_id: EntityId) -> Result<Vec<Relation>> {
    let sql = "select entity_id, related_id, match_type, match_key, errule_code, principle, is_ambiguous, is_disclosed
                from relation where entity_id = ? or related_id = ?
                order by entity_id, related_id";
    let rows = match pool {
        DbPool::Postgres(p) => {
            sqlx::query(&rebind(sql, crate::pool::Dialect::Postgres))
                .bind(entity_id)
                .bind(entity_id)
                .fetch_all(p)
                .await
        }
        DbPool::Sqlite(p) => sqlx::query(sql).bind(entity_id).bind(entity_id).fetch_all(p).await,
    }
    .context("list_relations_for_entity failed")?;

    rows.into_iter()
        .map(|row| {
            let match_type_code: String = row.try_get("match_type")?;
            Ok(Relation {
                entity_id: row.try_get("entity_id")?,
                related_id: row.try_get("related_id")?,
                match_type: MatchType::from_code(&match_type_code)
                    .with_context(|| format!("unknown match_type in database: {match_type_code}"))?,
                match_key: row.try_get("match_key")?,
                errule_code: row.try_get("errule_code")?,
                principle: row.try_get("principle")?,
                is_ambiguous: i32_to_bool(row.try_get("is_ambiguous")?),
                is_disclosed: i32_to_bool(row.try_get("is_disclosed")?),
            })
        })
        .collect()
}

pub async fn upsert_entity(conn: &mut Conn<'_>, row: &EntityRow) -> Result<()> {
    let pg_sql = "insert into entity (entity_id, entity_name, record_count, relation_count, entity_hash, prev_entity_hash)
                 values ($1, $2, $3, $4, $5, $6)
                 on conflict (entity_id) do update set
                    entity_name = excluded.entity_name,
                    record_count = excluded.record_count,
                    relation_count = excluded.relation_count,
                    entity_hash = excluded.entity_hash,
                    prev_entity_hash = excluded.prev_entity_hash";
    let sqlite_sql = "insert into entity (entity_id, entity_name, record_count, relation_count, entity_hash, prev_entity_hash)
                 values (?, ?, ?, ?, ?, ?)
                 on conflict (entity_id) do update set
                    entity_name = excluded.entity_name,
                    record_count = excluded.record_count,
                    relation_count = excluded.relation_count,
                    entity_hash = excluded.entity_hash,
                    prev_entity_hash = excluded.prev_entity_hash";
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query(pg_sql)
                .bind(row.entity_id)
                .bind(&row.entity_name)
                .bind(row.record_count)
                .bind(row.relation_count)
                .bind(&row.entity_hash)
                .bind(&row.prev_entity_hash)
                .execute(p)
                .await
        }
        Conn::Pool(DbPool::Sqlite(p)) => {
            sqlx::query(sqlite_sql)
                .bind(row.entity_id)
                .bind(&row.entity_name)
                .bind(row.record_count)
                .bind(row.relation_count)
                .bind(&row.entity_hash)
                .bind(&row.prev_entity_hash)
                .execute(p)
                .await
        }
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query(pg_sql)
                .bind(row.entity_id)
                .bind(&row.entity_name)
                .bind(row.record_count)
                .bind(row.relation_count)
                .bind(&row.entity_hash)
                .bind(&row.prev_entity_hash)
                .execute(&mut **tx)
                .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => {
            sqlx::query(sqlite_sql)
                .bind(row.entity_id)
                .bind(&row.entity_name)
                .bind(row.record_count)
                .bind(row.relation_count)
                .bind(&row.entity_hash)
                .bind(&row.prev_entity_hash)
                .execute(&mut **tx)
                .await
        }
    }
    .context("upsert_entity failed")?;
    Ok(())
}

pub async fn delete_entity(conn: &mut Conn<'_>, entity_id: EntityId) -> Result<()> {
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query("delete from entity where entity_id = $1").bind(entity_id).execute(p).await
        }
        Conn::Pool(DbPool::Sqlite(p)) => sqlx::query("delete from entity where entity_id = ?").bind(entity_id).execute(p).await,
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query("delete from entity where entity_id = $1")
                .bind(entity_id)
                .execute(&mut **tx)
                .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => {
            sqlx::query("delete from entity where entity_id = ?")
                .bind(entity_id)
                .execute(&mut **tx)
                .await
        }
    }
    .context("delete_entity failed")?;
    Ok(())
}

/// Upsert, not a plain insert: a record that moved from another entity
/// already has a row under the same `(data_source, record_id)` primary key,
/// and that key is the only thing this statement can see (the refresh
/// handler diffs one entity's rows at a time). Re-parenting it here is what
/// implements "move = delete-from-old + insert-into-new" (spec.md §4.G) —
/// the old owner's own refresh later finds the row gone and deletes its
/// now-stale `entity` row.
pub async fn insert_record(conn: &mut Conn<'_>, record: &Record) -> Result<()> {
    let pg_sql = "insert into record (data_source, record_id, entity_id, match_key, errule_code, principle)
                 values ($1, $2, $3, $4, $5, $6)
                 on conflict (data_source, record_id) do update set
                    entity_id = excluded.entity_id,
                    match_key = excluded.match_key,
                    errule_code = excluded.errule_code,
                    principle = excluded.principle";
    let sqlite_sql = "insert into record (data_source, record_id, entity_id, match_key, errule_code, principle)
                 values (?, ?, ?, ?, ?, ?)
                 on conflict (data_source, record_id) do update set
                    entity_id = excluded.entity_id,
                    match_key = excluded.match_key,
                    errule_code = excluded.errule_code,
                    principle = excluded.principle";
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query(pg_sql)
                .bind(&record.key.data_source)
                .bind(&record.key.record_id)
                .bind(record.entity_id)
                .bind(&record.match_key)
                .bind(&record.errule_code)
                .bind(&record.principle)
                .execute(p)
                .await
        }
        Conn::Pool(DbPool::Sqlite(p)) => {
            sqlx::query(sqlite_sql)
                .bind(&record.key.data_source)
                .bind(&record.key.record_id)
                .bind(record.entity_id)
                .bind(&record.match_key)
                .bind(&record.errule_code)
                .bind(&record.principle)
                .execute(p)
                .await
        }
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query(pg_sql)
                .bind(&record.key.data_source)
                .bind(&record.key.record_id)
                .bind(record.entity_id)
                .bind(&record.match_key)
                .bind(&record.errule_code)
                .bind(&record.principle)
                .execute(&mut **tx)
                .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => {
            sqlx::query(sqlite_sql)
                .bind(&record.key.data_source)
                .bind(&record.key.record_id)
                .bind(record.entity_id)
                .bind(&record.match_key)
                .bind(&record.errule_code)
                .bind(&record.principle)
                .execute(&mut **tx)
                .await
        }
    }
    .context("insert_record failed")?;
    Ok(())
}

pub async fn update_record_entity(conn: &mut Conn<'_>, key: &RecordKey, new_entity_id: EntityId) -> Result<()> {
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query("update record set entity_id = $1 where data_source = $2 and record_id = $3")
                .bind(new_entity_id)
                .bind(&key.data_source)
                .bind(&key.record_id)
                .execute(p)
                .await
        }
        Conn::Pool(DbPool::Sqlite(p)) => {
            sqlx::query("update record set entity_id = ? where data_source = ? and record_id = ?")
                .bind(new_entity_id)
                .bind(&key.data_source)
                .bind(&key.record_id)
                .execute(p)
                .await
        }
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query("update record set entity_id = $1 where data_source = $2 and record_id = $3")
                .bind(new_entity_id)
                .bind(&key.data_source)
                .bind(&key.record_id)
                .execute(&mut **tx)
                .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => {
            sqlx::query("update record set entity_id = ? where data_source = ? and record_id = ?")
                .bind(new_entity_id)
                .bind(&key.data_source)
                .bind(&key.record_id)
                .execute(&mut **tx)
                .await
        }
    }
    .context("update_record_entity failed")?;
    Ok(())
}

pub async fn delete_record(conn: &mut Conn<'_>, key: &RecordKey) -> Result<()> {
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query("delete from record where data_source = $1 and record_id = $2")
                .bind(&key.data_source)
                .bind(&key.record_id)
                .execute(p)
                .await
        }
        Conn::Pool(DbPool::Sqlite(p)) => {
            sqlx::query("delete from record where data_source = ? and record_id = ?")
                .bind(&key.data_source)
                .bind(&key.record_id)
                .execute(p)
                .await
        }
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query("delete from record where data_source = $1 and record_id = $2")
                .bind(&key.data_source)
                .bind(&key.record_id)
                .execute(&mut **tx)
                .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => {
            sqlx::query("delete from record where data_source = ? and record_id = ?")
                .bind(&key.data_source)
                .bind(&key.record_id)
                .execute(&mut **tx)
                .await
        }
    }
    .context("delete_record failed")?;
    Ok(())
}

pub async fn insert_relation(conn: &mut Conn<'_>, rel: &Relation, relation_hash: &str) -> Result<()> {
    let pg_sql = "insert into relation
                 (entity_id, related_id, match_type, match_key, errule_code, principle, is_ambiguous, is_disclosed, relation_hash)
                 values ($1, $2, $3, $4, $5, $6, $7, $8, $9)";
    let sqlite_sql = "insert into relation
                 (entity_id, related_id, match_type, match_key, errule_code, principle, is_ambiguous, is_disclosed, relation_hash)
                 values (?, ?, ?, ?, ?, ?, ?, ?, ?)";
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query(pg_sql)
                .bind(rel.entity_id)
                .bind(rel.related_id)
                .bind(rel.match_type.as_code())
                .bind(&rel.match_key)
                .bind(&rel.errule_code)
                .bind(&rel.principle)
                .bind(bool_to_i32(rel.is_ambiguous))
                .bind(bool_to_i32(rel.is_disclosed))
                .bind(relation_hash)
                .execute(p)
                .await
        }
        Conn::Pool(DbPool::Sqlite(p)) => {
            sqlx::query(sqlite_sql)
                .bind(rel.entity_id)
                .bind(rel.related_id)
                .bind(rel.match_type.as_code())
                .bind(&rel.match_key)
                .bind(&rel.errule_code)
                .bind(&rel.principle)
                .bind(bool_to_i32(rel.is_ambiguous))
                .bind(bool_to_i32(rel.is_disclosed))
                .bind(relation_hash)
                .execute(p)
                .await
        }
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query(pg_sql)
                .bind(rel.entity_id)
                .bind(rel.related_id)
                .bind(rel.match_type.as_code())
                .bind(&rel.match_key)
                .bind(&rel.errule_code)
                .bind(&rel.principle)
                .bind(bool_to_i32(rel.is_ambiguous))
                .bind(bool_to_i32(rel.is_disclosed))
                .bind(relation_hash)
                .execute(&mut **tx)
                .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => {
            sqlx::query(sqlite_sql)
                .bind(rel.entity_id)
                .bind(rel.related_id)
                .bind(rel.match_type.as_code())
                .bind(&rel.match_key)
                .bind(&rel.errule_code)
                .bind(&rel.principle)
                .bind(bool_to_i32(rel.is_ambiguous))
                .bind(bool_to_i32(rel.is_disclosed))
                .bind(relation_hash)
                .execute(&mut **tx)
                .await
        }
    }
    .context("insert_relation failed")?;
    Ok(())
}

pub async fn delete_relation(conn: &mut Conn<'_>, entity_id: EntityId, related_id: EntityId) -> Result<()> {
    match conn {
        Conn::Pool(DbPool::Postgres(p)) => {
            sqlx::query("delete from relation where entity_id = $1 and related_id = $2")
                .bind(entity_id)
                .bind(related_id)
                .execute(p)
                .await
        }
        Conn::Pool(DbPool::Sqlite(p)) => {
            sqlx::query("delete from relation where entity_id = ? and related_id = ?")
                .bind(entity_id)
                .bind(related_id)
                .execute(p)
                .await
        }
        Conn::Tx(DbTx::Postgres(tx)) => {
            sqlx::query("delete from relation where entity_id = $1 and related_id = $2")
                .bind(entity_id)
                .bind(related_id)
                .execute(&mut **tx)
                .await
        }
        Conn::Tx(DbTx::Sqlite(tx)) => {
            sqlx::query("delete from relation where entity_id = ? and related_id = ?")
                .bind(entity_id)
                .bind(related_id)
                .execute(&mut **tx)
                .await
        }
    }
    .context("delete_relation failed")?;
    Ok(())
}

/// Total row count in `entity`. Used by the schema-recreate maintenance
/// command's guard: refusing to drop and rebuild the schema while the mart
/// is non-empty, the same shape as the teacher's "refuse to migrate while a
/// run is active" check.
pub async fn count_entities(pool: &DbPool) -> Result<i64> {
    match pool {
        DbPool::Postgres(p) => sqlx::query_scalar("select count(*) from entity").fetch_one(p).await,
        DbPool::Sqlite(p) => sqlx::query_scalar("select count(*) from entity").fetch_one(p).await,
    }
    .context("count_entities failed")
}

/// Rewrite `?` placeholders into `$1`, `$2`, … for PostgreSQL. Used by the
/// handful of read queries above that are written once with SQLite-style `?`
/// and shared between dialects.
fn rebind(sql: &str, dialect: crate::pool::Dialect) -> String {
    if dialect != crate::pool::Dialect::Postgres {
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
