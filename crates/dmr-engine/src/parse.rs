//! Wire shape of one `getEntityByEntityID`-style engine response, and its
//! conversion into `dmr_schemas::EntityResolution`.

use dmr_schemas::{EntityResolution, MatchType, Record, RecordKey, Relation};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct EngineResponse {
    #[serde(rename = "RESOLVED_ENTITY")]
    pub resolved_entity: Option<ResolvedEntity>,
    #[serde(rename = "RELATED_ENTITIES", default)]
    pub related_entities: Vec<RelatedEntity>,
}

#[derive(Debug, Deserialize)]
pub struct ResolvedEntity {
    #[serde(rename = "ENTITY_ID")]
    pub entity_id: i64,
    #[serde(rename = "ENTITY_NAME")]
    pub entity_name: Option<String>,
    #[serde(rename = "RECORDS", default)]
    pub records: Vec<EngineRecord>,
}

#[derive(Debug, Deserialize)]
pub struct EngineRecord {
    #[serde(rename = "DATA_SOURCE")]
    pub data_source: String,
    #[serde(rename = "RECORD_ID")]
    pub record_id: String,
    #[serde(rename = "MATCH_KEY")]
    pub match_key: Option<String>,
    #[serde(rename = "ERRULE_CODE")]
    pub errule_code: Option<String>,
    #[serde(rename = "PRINCIPLE")]
    pub principle: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RelatedEntity {
    #[serde(rename = "ENTITY_ID")]
    pub entity_id: i64,
    #[serde(rename = "MATCH_LEVEL_CODE")]
    pub match_level_code: Option<String>,
    #[serde(rename = "MATCH_KEY")]
    pub match_key: Option<String>,
    #[serde(rename = "ERRULE_CODE")]
    pub errule_code: Option<String>,
    #[serde(rename = "PRINCIPLE")]
    pub principle: Option<String>,
    #[serde(rename = "IS_AMBIGUOUS", default)]
    pub is_ambiguous: i32,
    #[serde(rename = "IS_DISCLOSED", default)]
    pub is_disclosed: i32,
}

/// `MATCH_KEY == ""` is normalized to `None` here the same way the listener
/// normalizes it on info messages (spec.md §4.F): an empty key is never a
/// meaningful value on either path.
fn normalize_match_key(key: Option<String>) -> Option<String> {
    match key {
        Some(s) if s.is_empty() => None,
        other => other,
    }
}

pub fn to_entity_resolution(response: EngineResponse) -> Option<EntityResolution> {
    let resolved = response.resolved_entity?;
    if resolved.records.is_empty() {
        return Some(EntityResolution {
            entity_id: resolved.entity_id,
            entity_name: resolved.entity_name,
            records: vec![],
            relations: vec![],
        });
    }

    let records = resolved
        .records
        .into_iter()
        .map(|r| Record {
            key: RecordKey::new(r.data_source, r.record_id),
            entity_id: resolved.entity_id,
            match_key: normalize_match_key(r.match_key),
            errule_code: r.errule_code,
            principle: r.principle,
        })
        .collect();

    let relations = response
        .related_entities
        .into_iter()
        .map(|re| {
            let match_type = MatchType::derive(re.match_level_code.as_deref(), re.is_ambiguous != 0, re.is_disclosed != 0);
            Relation::new(
                resolved.entity_id,
                re.entity_id,
                match_type,
                normalize_match_key(re.match_key),
                re.errule_code,
                re.principle,
                re.is_ambiguous != 0,
                re.is_disclosed != 0,
            )
        })
        .collect();

    Some(EntityResolution {
        entity_id: resolved.entity_id,
        entity_name: resolved.entity_name,
        records,
        relations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_match_key_normalizes_to_none() {
        let response: EngineResponse = serde_json::from_value(serde_json::json!({
            "RESOLVED_ENTITY": {
                "ENTITY_ID": 100,
                "ENTITY_NAME": "Acme",
                "RECORDS": [
                    {"DATA_SOURCE": "CUSTOMERS", "RECORD_ID": "REC1", "MATCH_KEY": ""}
                ]
            },
            "RELATED_ENTITIES": []
        }))
        .unwrap();

        let resolution = to_entity_resolution(response).unwrap();
        assert_eq!(resolution.records[0].match_key, None);
    }

    #[test]
    fn related_entity_with_ambiguous_flag_wins_over_match_level_code() {
        let response: EngineResponse = serde_json::from_value(serde_json::json!({
            "RESOLVED_ENTITY": {
                "ENTITY_ID": 100,
                "ENTITY_NAME": null,
                "RECORDS": [{"DATA_SOURCE": "CUSTOMERS", "RECORD_ID": "REC1"}]
            },
            "RELATED_ENTITIES": [
                {"ENTITY_ID": 200, "MATCH_LEVEL_CODE": "POSSIBLE_MATCH", "IS_AMBIGUOUS": 1}
            ]
        }))
        .unwrap();

        let resolution = to_entity_resolution(response).unwrap();
        assert_eq!(resolution.relations[0].match_type, MatchType::AmbiguousMatch);
        assert_eq!(resolution.relations[0].entity_id, 100);
        assert_eq!(resolution.relations[0].related_id, 200);
    }

    #[test]
    fn resolved_entity_with_no_records_has_empty_resolution() {
        let response: EngineResponse = serde_json::from_value(serde_json::json!({
            "RESOLVED_ENTITY": {"ENTITY_ID": 100, "ENTITY_NAME": null, "RECORDS": []}
        }))
        .unwrap();

        let resolution = to_entity_resolution(response).unwrap();
        assert!(resolution.is_empty());
    }

    #[test]
    fn missing_resolved_entity_returns_none() {
        let response: EngineResponse = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(to_entity_resolution(response).is_none());
    }
}
