//! Connection pool & dialect adapter (spec.md §4.A).
//!
//! Obtains bounded pool handles; abstracts PostgreSQL vs SQLite so the rest
//! of the workspace never branches on dialect directly. Grounded on
//! `mqk_db::connect_from_env` (pool construction) generalized from a single
//! hardcoded Postgres pool to a `DbPool` sum type over both dialects.

use anyhow::{Context, Result};
use dmr_config::ResolvedUri;
use sqlx::{postgres::PgPoolOptions, sqlite::SqlitePoolOptions, PgPool, SqlitePool};

pub const ENV_DB_URL: &str = "SZ_DMR_DATABASE_URL";

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// A handle to the data-mart database, whichever dialect backs it.
#[derive(Clone)]
pub enum DbPool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl DbPool {
    pub fn dialect(&self) -> Dialect {
        match self {
            DbPool::Postgres(_) => Dialect::Postgres,
            DbPool::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub async fn connect(uri: &ResolvedUri) -> Result<Self> {
        match uri {
            ResolvedUri::Postgres(p) => {
                let conn_str = format!(
                    "postgres://{}:{}@{}:{}/{}",
                    p.user, p.password, p.host, p.port, p.database
                );
                let pool = PgPoolOptions::new()
                    .max_connections(DEFAULT_MAX_CONNECTIONS)
                    .connect(&conn_str)
                    .await
                    .context("failed to connect to PostgreSQL data mart")?;
                if p.schema != "public" {
                    sqlx::query(&format!("set search_path to {}", p.schema))
                        .execute(&pool)
                        .await
                        .context("failed to set search_path")?;
                }
                Ok(DbPool::Postgres(pool))
            }
            ResolvedUri::Sqlite(s) => {
                let conn_str = format!("sqlite://{}?mode=rwc", s.path);
                let pool = SqlitePoolOptions::new()
                    // SQLite's single-writer model is the concurrency control
                    // mechanism for `BEGIN IMMEDIATE` claims (spec.md §4.D);
                    // a small pool keeps that invariant honest under tests.
                    .max_connections(DEFAULT_MAX_CONNECTIONS)
                    .connect(&conn_str)
                    .await
                    .context("failed to open SQLite data mart")?;
                sqlx::query("pragma foreign_keys = on")
                    .execute(&pool)
                    .await
                    .context("failed to enable sqlite foreign keys")?;
                Ok(DbPool::Sqlite(pool))
            }
        }
    }

    /// Open an in-memory SQLite pool; used by tests and `dmr-testkit`.
    pub async fn connect_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory sqlite pool")?;
        sqlx::query("pragma foreign_keys = on")
            .execute(&pool)
            .await
            .context("failed to enable sqlite foreign keys")?;
        Ok(DbPool::Sqlite(pool))
    }

    pub async fn connect_from_env() -> Result<Self> {
        let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
        if let Some(path) = url.strip_prefix("sqlite://") {
            let pool = SqlitePoolOptions::new()
                .max_connections(DEFAULT_MAX_CONNECTIONS)
                .connect(&format!("sqlite://{path}?mode=rwc"))
                .await
                .context("failed to open SQLite data mart from env")?;
            return Ok(DbPool::Sqlite(pool));
        }
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(&url)
            .await
            .context("failed to connect to PostgreSQL data mart from env")?;
        Ok(DbPool::Postgres(pool))
    }

    pub fn as_pg(&self) -> Option<&PgPool> {
        match self {
            DbPool::Postgres(p) => Some(p),
            DbPool::Sqlite(_) => None,
        }
    }

    pub fn as_sqlite(&self) -> Option<&SqlitePool> {
        match self {
            DbPool::Sqlite(p) => Some(p),
            DbPool::Postgres(_) => None,
        }
    }

    /// Begin a transaction on this pool's dialect. `sqlx::Pool::begin()`
    /// returns an owned, `'static` transaction handle, so `DbTx` carries no
    /// lifetime back to the pool.
    pub async fn begin(&self) -> Result<DbTx> {
        match self {
            DbPool::Postgres(p) => Ok(DbTx::Postgres(p.begin().await.context("failed to begin postgres transaction")?)),
            DbPool::Sqlite(p) => Ok(DbTx::Sqlite(p.begin().await.context("failed to begin sqlite transaction")?)),
        }
    }
}

/// An open transaction on either dialect (spec.md §4.G: mart writes, pending
/// report rows, follow-up task commits, and task completion all persist or
/// roll back together).
pub enum DbTx {
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
    Sqlite(sqlx::Transaction<'static, sqlx::Sqlite>),
}

impl DbTx {
    pub fn dialect(&self) -> Dialect {
        match self {
            DbTx::Postgres(_) => Dialect::Postgres,
            DbTx::Sqlite(_) => Dialect::Sqlite,
        }
    }

    pub async fn commit(self) -> Result<()> {
        match self {
            DbTx::Postgres(tx) => tx.commit().await.context("failed to commit postgres transaction"),
            DbTx::Sqlite(tx) => tx.commit().await.context("failed to commit sqlite transaction"),
        }
    }

    pub async fn rollback(self) -> Result<()> {
        match self {
            DbTx::Postgres(tx) => tx.rollback().await.context("failed to roll back postgres transaction"),
            DbTx::Sqlite(tx) => tx.rollback().await.context("failed to roll back sqlite transaction"),
        }
    }
}

/// A write destination: either autocommitted statements against a pool, or
/// statements staged inside a caller-owned transaction. Write functions in
/// `mart`, `report`, and `queue` take `&mut Conn` so the same code path
/// serves standalone callers (tests, maintenance commands) and the
/// transactional handler/listener pipelines alike.
pub enum Conn<'a> {
    Pool(&'a DbPool),
    Tx(&'a mut DbTx),
}

impl<'a> From<&'a DbPool> for Conn<'a> {
    fn from(pool: &'a DbPool) -> Self {
        Conn::Pool(pool)
    }
}

impl<'a> From<&'a mut DbTx> for Conn<'a> {
    fn from(tx: &'a mut DbTx) -> Self {
        Conn::Tx(tx)
    }
}

impl<'a> Conn<'a> {
    pub fn dialect(&self) -> Dialect {
        match self {
            Conn::Pool(pool) => pool.dialect(),
            Conn::Tx(tx) => tx.dialect(),
        }
    }
}

/// Booleans are stored as `SMALLINT`/`INTEGER` 0/1 everywhere (spec.md §4.A)
/// so the same schema is portable to SQLite, which has no native boolean.
pub fn bool_to_i32(b: bool) -> i32 {
    if b {
        1
    } else {
        0
    }
}

pub fn i32_to_bool(i: i32) -> bool {
    i != 0
}

/// Current time as UTC microseconds since the epoch (spec.md §4.A timestamp
/// storage convention).
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
