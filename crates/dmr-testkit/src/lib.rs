//! Shared fixtures for scenario tests, dev-dependency only. Not referenced
//! from any production crate's `[dependencies]`, the same separation the
//! teacher enforces between its production crates and `mqk-testkit`.

use dmr_db::{schema::ensure_schema, DbPool};
use dmr_engine::FakeResolutionEngine;
use dmr_schemas::{EntityId, EntityResolution, MatchType, Record, RecordKey, Relation};

pub use dmr_engine::FakeResolutionEngine as ScriptedEngine;

/// A disposable, schema-initialized SQLite data mart for one test.
pub async fn disposable_mart() -> DbPool {
    let pool = DbPool::connect_memory().await.expect("open in-memory sqlite pool");
    ensure_schema(&pool, false).await.expect("ensure_schema");
    pool
}

/// An engine double pre-loaded with nothing; call `set_resolution` to script
/// per-entity responses before driving a refresh.
pub fn scripted_engine() -> ScriptedEngine {
    FakeResolutionEngine::new()
}

/// A minimal single-record, no-relation resolution, the shape most refresh
/// scenarios start from.
pub fn one_record_resolution(entity_id: EntityId, data_source: &str, record_id: &str, match_key: &str) -> EntityResolution {
    EntityResolution {
        entity_id,
        entity_name: None,
        records: vec![Record {
            key: RecordKey { data_source: data_source.to_string(), record_id: record_id.to_string() },
            entity_id,
            match_key: Some(match_key.to_string()),
            errule_code: None,
            principle: None,
        }],
        relations: vec![],
    }
}

/// A resolution carrying one relation to `related_id` and no records.
pub fn relation_only_resolution(entity_id: EntityId, related_id: EntityId, match_type: MatchType) -> EntityResolution {
    EntityResolution {
        entity_id,
        entity_name: None,
        records: vec![],
        relations: vec![Relation::new(
            entity_id,
            related_id,
            match_type,
            Some("NAME+DOB".to_string()),
            None,
            Some("MFF".to_string()),
            false,
            false,
        )],
    }
}

/// A canonical `INFO` message body naming one data source record and a set
/// of affected entities, in the field-name convention the upstream engine
/// actually emits (`DATA_SOURCE`, `RECORD_ID`, `AFFECTED_ENTITIES`).
pub fn canned_info_message(data_source: &str, record_id: &str, affected_entities: &[EntityId]) -> String {
    let entities = affected_entities
        .iter()
        .map(|id| format!(r#"{{"ENTITY_ID": {id}}}"#))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"{{"DATA_SOURCE": "{data_source}", "RECORD_ID": "{record_id}", "AFFECTED_ENTITIES": [{entities}]}}"#
    )
}

/// An `INFO` message carrying an `INTERESTING_ENTITIES` block with one
/// entity and one notice, for listener parse-and-route tests.
pub fn canned_interesting_message(entity_id: EntityId, notice_code: &str) -> String {
    format!(
        r#"{{"INTERESTING_ENTITIES": {{"ENTITIES": [{{"ENTITY_ID": {entity_id}, "DEGREES": 1, "FLAGS": []}}], "NOTICES": [{{"CODE": "{notice_code}"}}]}}}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disposable_mart_has_clean_schema() {
        let pool = disposable_mart().await;
        assert_eq!(dmr_db::queue::count_by_status(&pool, dmr_db::queue::STATUS_READY).await.unwrap(), 0);
    }

    #[test]
    fn canned_info_message_embeds_affected_entities() {
        let raw = canned_info_message("CUSTOMERS", "REC1", &[100, 200]);
        assert!(raw.contains(r#""RECORD_ID": "REC1""#));
        assert!(raw.contains("100"));
        assert!(raw.contains("200"));
    }
}
