//! Dialect-specific SQL fragments shared by the repository modules.
//!
//! PostgreSQL passes array parameters natively (`= ANY($1)`); SQLite has no
//! array bind type, so `selectArrayParam` is emulated with an expanded
//! `IN (?, ?, …)` template, chunked at a fixed width for large sets
//! (spec.md §4.A).

use crate::pool::Dialect;

/// SQLite chunk width for `IN (...)` expansion of array parameters.
pub const SQLITE_IN_CHUNK: usize = 500;

/// Render the `$1`/`?`-style placeholder for position `idx` (1-based).
pub fn placeholder(dialect: Dialect, idx: usize) -> String {
    match dialect {
        Dialect::Postgres => format!("${idx}"),
        Dialect::Sqlite => "?".to_string(),
    }
}

/// Render a list of placeholders starting at `start` (1-based, inclusive).
pub fn placeholder_list(dialect: Dialect, start: usize, count: usize) -> String {
    (0..count)
        .map(|i| placeholder(dialect, start + i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Split a parameter list into chunks no larger than `SQLITE_IN_CHUNK`.
/// PostgreSQL doesn't need chunking (it gets a single `= ANY($1)`), but
/// callers that want one code path for both dialects can chunk
/// unconditionally; `chunks` of size 1 are a no-op on Postgres.
pub fn chunk_for_dialect<'a, T>(dialect: Dialect, items: &'a [T]) -> Vec<&'a [T]> {
    match dialect {
        Dialect::Postgres => vec![items],
        Dialect::Sqlite => items.chunks(SQLITE_IN_CHUNK).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_placeholders() {
        assert_eq!(placeholder(Dialect::Postgres, 3), "$3");
        assert_eq!(placeholder_list(Dialect::Postgres, 2, 3), "$2, $3, $4");
    }

    #[test]
    fn sqlite_placeholders() {
        assert_eq!(placeholder(Dialect::Sqlite, 3), "?");
        assert_eq!(placeholder_list(Dialect::Sqlite, 2, 3), "?, ?, ?");
    }

    #[test]
    fn chunking_only_splits_sqlite() {
        let items: Vec<i32> = (0..1200).collect();
        assert_eq!(chunk_for_dialect(Dialect::Postgres, &items).len(), 1);
        assert_eq!(chunk_for_dialect(Dialect::Sqlite, &items).len(), 3);
    }
}
