//! Connection-URI value objects.
//!
//! Re-architected per spec.md §9 away from the `ConnectionUri` /
//! `PostgreSqlUri` / `SQLiteUri` / `SzCoreSettingsUri` inheritance chain into
//! a single sum type with a `resolve` step for the `sz://` indirection.

use crate::error::ConfigError;
use serde_json::Value;

const DEFAULT_PG_PORT: u16 = 5432;
const DEFAULT_PG_SCHEMA: &str = "public";

/// A database URI as written on the command line or in an env var. The
/// `CoreSettings` variant is not directly usable until `resolve`d against
/// the already-loaded `--core-settings` document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUri {
    Postgres(PostgresUri),
    Sqlite(SqliteUri),
    CoreSettings { pointer: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresUri {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteUri {
    pub path: String,
}

/// The concrete, directly-connectable URI produced once `sz://` indirection
/// (if any) has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedUri {
    Postgres(PostgresUri),
    Sqlite(SqliteUri),
}

impl ConnectionUri {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        if let Some(rest) = s.strip_prefix("postgresql://") {
            return Ok(ConnectionUri::Postgres(parse_postgres(rest)?));
        }
        if let Some(rest) = s.strip_prefix("sqlite3://") {
            return Ok(ConnectionUri::Sqlite(parse_sqlite(rest)?));
        }
        if let Some(rest) = s.strip_prefix("sz://core-settings/") {
            return Ok(ConnectionUri::CoreSettings {
                pointer: rest.to_string(),
            });
        }
        Err(ConfigError::InvalidArgument {
            flag: "--database-uri",
            message: format!("unrecognized scheme in {s:?}"),
        })
    }

    /// Resolve `sz://` indirection against an already-loaded core-settings
    /// document; pass the value through unchanged otherwise.
    pub fn resolve(self, core_settings: Option<&Value>) -> Result<ResolvedUri, ConfigError> {
        match self {
            ConnectionUri::Postgres(p) => Ok(ResolvedUri::Postgres(p)),
            ConnectionUri::Sqlite(s) => Ok(ResolvedUri::Sqlite(s)),
            ConnectionUri::CoreSettings { pointer } => {
                let root = core_settings.ok_or_else(|| {
                    ConfigError::CoreSettingsUnavailable("--core-settings was not supplied".into())
                })?;
                let resolved = resolve_pointer(root, &pointer)?;
                let s = resolved.as_str().ok_or_else(|| {
                    ConfigError::CoreSettingsUnavailable(format!(
                        "value at pointer {pointer} is not a string"
                    ))
                })?;
                match ConnectionUri::parse(s)? {
                    ConnectionUri::Postgres(p) => Ok(ResolvedUri::Postgres(p)),
                    ConnectionUri::Sqlite(sq) => Ok(ResolvedUri::Sqlite(sq)),
                    ConnectionUri::CoreSettings { .. } => Err(ConfigError::CoreSettingsUnavailable(
                        format!("pointer {pointer} resolved to another sz:// indirection"),
                    )),
                }
            }
        }
    }
}

impl std::fmt::Display for ConnectionUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionUri::Postgres(p) => write!(f, "{p}"),
            ConnectionUri::Sqlite(s) => write!(f, "{s}"),
            ConnectionUri::CoreSettings { pointer } => write!(f, "sz://core-settings/{pointer}"),
        }
    }
}

impl std::fmt::Display for PostgresUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "postgresql://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )?;
        if self.schema != DEFAULT_PG_SCHEMA {
            write!(f, "?schema={}", self.schema)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for SqliteUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sqlite3://na:na@{}", self.path)
    }
}

fn parse_postgres(rest: &str) -> Result<PostgresUri, ConfigError> {
    let bad = |message: String| ConfigError::InvalidArgument {
        flag: "--database-uri",
        message,
    };

    let (userinfo, after_at) = rest
        .split_once('@')
        .ok_or_else(|| bad("postgresql URI missing user@host section".into()))?;
    let (user, password) = userinfo
        .split_once(':')
        .ok_or_else(|| bad("postgresql URI missing user:password".into()))?;

    let (host_port_db, query) = match after_at.split_once('?') {
        Some((a, b)) => (a, Some(b)),
        None => (after_at, None),
    };
    let (host_port, database) = host_port_db
        .split_once('/')
        .ok_or_else(|| bad("postgresql URI missing /database".into()))?;
    if database.is_empty() {
        return Err(bad("postgresql URI has empty database name".into()));
    }

    let (host, port) = match host_port.split_once(':') {
        Some((h, p)) => {
            let port: u16 = p
                .parse()
                .map_err(|_| bad(format!("invalid port {p:?}")))?;
            (h.to_string(), port)
        }
        None => (host_port.to_string(), DEFAULT_PG_PORT),
    };
    if host.is_empty() {
        return Err(bad("postgresql URI has empty host".into()));
    }

    let mut schema = DEFAULT_PG_SCHEMA.to_string();
    if let Some(q) = query {
        for kv in q.split('&') {
            if let Some((k, v)) = kv.split_once('=') {
                if k == "schema" {
                    schema = v.to_string();
                }
            }
        }
    }

    Ok(PostgresUri {
        user: user.to_string(),
        password: password.to_string(),
        host,
        port,
        database: database.to_string(),
        schema,
    })
}

fn parse_sqlite(rest: &str) -> Result<SqliteUri, ConfigError> {
    let bad = |message: String| ConfigError::InvalidArgument {
        flag: "--database-uri",
        message,
    };
    let path = rest
        .split_once('@')
        .map(|(_, p)| p)
        .unwrap_or(rest);
    if !path.starts_with('/') {
        return Err(bad(format!("sqlite3 URI path must be absolute, got {path:?}")));
    }
    Ok(SqliteUri { path: path.to_string() })
}

/// Resolve a `/`-separated JSON-pointer-like path against `root`. Array
/// elements are addressed by decimal index; negative indices are rejected;
/// out-of-bounds or missing keys yield `PointerNotFound`.
fn resolve_pointer(root: &Value, path: &str) -> Result<Value, ConfigError> {
    let mut cur = root;
    if path.is_empty() {
        return Ok(cur.clone());
    }
    for seg in path.split('/') {
        match cur {
            Value::Object(map) => {
                cur = map
                    .get(seg)
                    .ok_or_else(|| ConfigError::PointerNotFound(path.to_string()))?;
            }
            Value::Array(arr) => {
                if seg.starts_with('-') {
                    return Err(ConfigError::InvalidArgument {
                        flag: "--database-uri",
                        message: format!("negative array index in core-settings pointer: {seg}"),
                    });
                }
                let idx: usize = seg
                    .parse()
                    .map_err(|_| ConfigError::PointerNotFound(path.to_string()))?;
                cur = arr
                    .get(idx)
                    .ok_or_else(|| ConfigError::PointerNotFound(path.to_string()))?;
            }
            _ => return Err(ConfigError::PointerNotFound(path.to_string())),
        }
    }
    Ok(cur.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_defaults_port_and_schema() {
        let u = ConnectionUri::parse("postgresql://sz:sz@localhost/mart").unwrap();
        match u {
            ConnectionUri::Postgres(p) => {
                assert_eq!(p.port, 5432);
                assert_eq!(p.schema, "public");
            }
            _ => panic!("expected postgres"),
        }
    }

    #[test]
    fn postgres_round_trips_modulo_defaults() {
        let s = "postgresql://sz:sz@localhost/mart";
        let u = ConnectionUri::parse(s).unwrap();
        assert_eq!(u.to_string(), s);
    }

    #[test]
    fn postgres_custom_schema_round_trips() {
        let s = "postgresql://sz:sz@localhost:5433/mart?schema=analytics";
        let u = ConnectionUri::parse(s).unwrap();
        assert_eq!(u.to_string(), s);
    }

    #[test]
    fn sqlite_round_trips() {
        let s = "sqlite3://na:na@/tmp/mart.db";
        let u = ConnectionUri::parse(s).unwrap();
        assert_eq!(u.to_string(), s);
    }

    #[test]
    fn sqlite_requires_absolute_path() {
        let err = ConnectionUri::parse("sqlite3://na:na@relative.db").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidArgument { .. }));
    }

    #[test]
    fn core_settings_pointer_resolves_to_postgres() {
        let settings: Value = serde_json::json!({
            "SQL": { "CONNECTION": "postgresql://sz:sz@localhost/mart" }
        });
        let u = ConnectionUri::parse("sz://core-settings/SQL/CONNECTION").unwrap();
        let resolved = u.resolve(Some(&settings)).unwrap();
        assert_eq!(
            resolved,
            ResolvedUri::Postgres(PostgresUri {
                user: "sz".into(),
                password: "sz".into(),
                host: "localhost".into(),
                port: 5432,
                database: "mart".into(),
                schema: "public".into(),
            })
        );
    }

    #[test]
    fn core_settings_pointer_array_index() {
        let settings: Value = serde_json::json!({
            "CONNECTIONS": ["postgresql://sz:sz@localhost/mart"]
        });
        let u = ConnectionUri::parse("sz://core-settings/CONNECTIONS/0").unwrap();
        assert!(u.resolve(Some(&settings)).is_ok());
    }

    #[test]
    fn core_settings_negative_index_rejected() {
        let settings: Value = serde_json::json!({ "CONNECTIONS": ["x"] });
        let u = ConnectionUri::parse("sz://core-settings/CONNECTIONS/-1").unwrap();
        let err = u.resolve(Some(&settings)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidArgument { .. }));
    }

    #[test]
    fn core_settings_out_of_bounds_not_found() {
        let settings: Value = serde_json::json!({ "CONNECTIONS": ["x"] });
        let u = ConnectionUri::parse("sz://core-settings/CONNECTIONS/5").unwrap();
        let err = u.resolve(Some(&settings)).unwrap_err();
        assert!(matches!(err, ConfigError::PointerNotFound(_)));
    }
}
