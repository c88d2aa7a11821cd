//! Canonical hash of one entity's resolution (spec.md §4.G step 3): sorted
//! records + sorted relations with their match keys/principles, so that
//! hash equality is a cheap stand-in for row-by-row comparison.

use dmr_schemas::EntityResolution;
use sha2::{Digest, Sha256};

/// Render one field for hashing; `None` and `Some("")` are kept distinct
/// from any real value but collapse to the same canonical token so a
/// stored-null and a not-yet-seen field never accidentally hash equal to a
/// real value that happens to contain the sentinel text.
fn field(value: Option<&str>) -> String {
    match value {
        None => "\u{0}".to_string(),
        Some(s) => format!("{}\u{0}", s.len()) + s,
    }
}

/// Compute `entity_hash` from the engine's resolution for one entity. Two
/// resolutions that differ only in record/relation ordering hash equal;
/// any difference in content, membership, or match metadata hashes unequal.
pub fn hash_resolution(resolution: &EntityResolution) -> String {
    let mut records: Vec<_> = resolution.records.iter().collect();
    records.sort_by(|a, b| (&a.key.data_source, &a.key.record_id).cmp(&(&b.key.data_source, &b.key.record_id)));

    let mut relations: Vec<_> = resolution
        .relations
        .iter()
        .filter_map(|r| r.other(resolution.entity_id).map(|other| (other, r)))
        .collect();
    relations.sort_by_key(|(other, _)| *other);

    let mut hasher = Sha256::new();
    hasher.update(field(resolution.entity_name.as_deref()));

    for record in &records {
        hasher.update(field(Some(&record.key.data_source)));
        hasher.update(field(Some(&record.key.record_id)));
        hasher.update(field(record.match_key.as_deref()));
        hasher.update(field(record.errule_code.as_deref()));
        hasher.update(field(record.principle.as_deref()));
    }

    for (other, relation) in &relations {
        hasher.update(other.to_le_bytes());
        hasher.update(field(Some(relation.match_type.as_code())));
        hasher.update(field(relation.match_key.as_deref()));
        hasher.update(field(relation.errule_code.as_deref()));
        hasher.update(field(relation.principle.as_deref()));
        hasher.update([relation.is_ambiguous as u8, relation.is_disclosed as u8]);
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmr_schemas::{MatchType, Record, RecordKey, Relation};

    fn resolution_with_records(ids: &[&str]) -> EntityResolution {
        EntityResolution {
            entity_id: 100,
            entity_name: Some("Acme".to_string()),
            records: ids
                .iter()
                .map(|id| Record {
                    key: RecordKey::new("CUSTOMERS", *id),
                    entity_id: 100,
                    match_key: None,
                    errule_code: None,
                    principle: None,
                })
                .collect(),
            relations: vec![],
        }
    }

    #[test]
    fn hash_is_stable_under_record_reordering() {
        let a = resolution_with_records(&["REC1", "REC2"]);
        let b = resolution_with_records(&["REC2", "REC1"]);
        assert_eq!(hash_resolution(&a), hash_resolution(&b));
    }

    #[test]
    fn hash_differs_when_a_record_is_added() {
        let a = resolution_with_records(&["REC1"]);
        let b = resolution_with_records(&["REC1", "REC2"]);
        assert_ne!(hash_resolution(&a), hash_resolution(&b));
    }

    #[test]
    fn hash_differs_when_match_key_changes() {
        let mut a = resolution_with_records(&["REC1"]);
        let mut b = resolution_with_records(&["REC1"]);
        a.records[0].match_key = Some("NAME+DOB".to_string());
        b.records[0].match_key = Some("NAME".to_string());
        assert_ne!(hash_resolution(&a), hash_resolution(&b));
    }

    #[test]
    fn hash_accounts_for_relations() {
        let mut with_relation = resolution_with_records(&["REC1"]);
        with_relation.relations.push(Relation::new(100, 200, MatchType::PossibleMatch, None, None, None, false, false));
        let without_relation = resolution_with_records(&["REC1"]);
        assert_ne!(hash_resolution(&with_relation), hash_resolution(&without_relation));
    }
}
