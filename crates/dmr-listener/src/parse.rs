//! Info-message parsing (spec.md §4.F). Tolerant of the upstream engine's
//! alternate field names via serde `alias`, the same tolerance
//! `dmr-engine::parse` applies to resolution responses.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct InfoMessage {
    #[serde(rename = "DATA_SOURCE", alias = "dataSource")]
    pub data_source: Option<String>,
    #[serde(rename = "RECORD_ID", alias = "recordId")]
    pub record_id: Option<String>,
    #[serde(rename = "AFFECTED_ENTITIES", alias = "affectedEntities", default)]
    pub affected_entities: Vec<AffectedEntity>,
    #[serde(rename = "INTERESTING_ENTITIES", alias = "interestingEntities")]
    pub interesting_entities: Option<InterestingEntities>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AffectedEntity {
    #[serde(rename = "ENTITY_ID", alias = "id")]
    pub entity_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterestingEntities {
    #[serde(rename = "ENTITIES", default)]
    pub entities: Vec<InterestingEntity>,
    #[serde(rename = "NOTICES", default)]
    pub notices: Vec<Notice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterestingEntity {
    #[serde(rename = "ENTITY_ID", alias = "id")]
    pub entity_id: i64,
    #[serde(rename = "DEGREES", default)]
    pub degrees: Option<i64>,
    #[serde(rename = "FLAGS", default)]
    pub flags: Vec<String>,
    #[serde(rename = "SAMPLE_RECORDS", default)]
    pub sample_records: Vec<SampleRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SampleRecord {
    #[serde(rename = "DATA_SOURCE", alias = "dataSource")]
    pub data_source: String,
    #[serde(rename = "RECORD_ID", alias = "recordId")]
    pub record_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Notice {
    #[serde(rename = "CODE")]
    pub code: String,
    #[serde(rename = "DESCRIPTION", default)]
    pub description: Option<String>,
}

pub fn parse_info_message(raw_json: &str) -> anyhow::Result<InfoMessage> {
    Ok(serde_json::from_str(raw_json)?)
}
