//! Pure diff between the data mart's current rows and the engine's desired
//! resolution (spec.md §4.G step 5). No IO: callers decide how to apply the
//! result, mirroring the separation the teacher keeps between
//! `mqk-reconcile::engine::reconcile` (pure comparison) and whatever applies
//! its output.

use dmr_schemas::{EntityId, Record, RecordKey, Relation};
use std::collections::BTreeMap;

#[derive(Debug, Default, PartialEq)]
pub struct RecordDiff {
    pub to_insert: Vec<Record>,
    pub to_update: Vec<Record>,
    pub to_delete: Vec<RecordKey>,
}

pub fn diff_records(current: &[Record], desired: &[Record]) -> RecordDiff {
    let mut current_by_key: BTreeMap<&RecordKey, &Record> = BTreeMap::new();
    for r in current {
        current_by_key.insert(&r.key, r);
    }
    let mut desired_by_key: BTreeMap<&RecordKey, &Record> = BTreeMap::new();
    for r in desired {
        desired_by_key.insert(&r.key, r);
    }

    let mut diff = RecordDiff::default();

    for (key, desired_record) in &desired_by_key {
        match current_by_key.get(key) {
            None => diff.to_insert.push((*desired_record).clone()),
            Some(current_record) if record_content_equal(current_record, desired_record) => {}
            Some(_) => diff.to_update.push((*desired_record).clone()),
        }
    }

    for (key, _) in &current_by_key {
        if !desired_by_key.contains_key(key) {
            diff.to_delete.push((*key).clone());
        }
    }

    diff
}

fn record_content_equal(a: &Record, b: &Record) -> bool {
    a.entity_id == b.entity_id && a.match_key == b.match_key && a.errule_code == b.errule_code && a.principle == b.principle
}

#[derive(Debug, Default, PartialEq)]
pub struct RelationDiff {
    pub to_insert: Vec<Relation>,
    pub to_update: Vec<Relation>,
    /// Full rows, not just the key pair, so callers can still attribute
    /// report-key deltas to a deleted relation's match metadata.
    pub to_delete: Vec<Relation>,
}

pub fn diff_relations(current: &[Relation], desired: &[Relation]) -> RelationDiff {
    let mut current_by_pair: BTreeMap<(EntityId, EntityId), &Relation> = BTreeMap::new();
    for r in current {
        current_by_pair.insert((r.entity_id, r.related_id), r);
    }
    let mut desired_by_pair: BTreeMap<(EntityId, EntityId), &Relation> = BTreeMap::new();
    for r in desired {
        desired_by_pair.insert((r.entity_id, r.related_id), r);
    }

    let mut diff = RelationDiff::default();

    for (pair, desired_relation) in &desired_by_pair {
        match current_by_pair.get(pair) {
            None => diff.to_insert.push((*desired_relation).clone()),
            Some(current_relation) if relation_content_equal(current_relation, desired_relation) => {}
            Some(_) => diff.to_update.push((*desired_relation).clone()),
        }
    }

    for (pair, current_relation) in &current_by_pair {
        if !desired_by_pair.contains_key(pair) {
            diff.to_delete.push((*current_relation).clone());
        }
    }

    diff
}

fn relation_content_equal(a: &Relation, b: &Relation) -> bool {
    a.match_type == b.match_type
        && a.match_key == b.match_key
        && a.errule_code == b.errule_code
        && a.principle == b.principle
        && a.is_ambiguous == b.is_ambiguous
        && a.is_disclosed == b.is_disclosed
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmr_schemas::MatchType;

    fn record(id: &str, entity_id: EntityId) -> Record {
        Record {
            key: RecordKey::new("CUSTOMERS", id),
            entity_id,
            match_key: None,
            errule_code: None,
            principle: None,
        }
    }

    #[test]
    fn new_record_is_inserted() {
        let d = diff_records(&[], &[record("REC1", 100)]);
        assert_eq!(d.to_insert.len(), 1);
        assert!(d.to_update.is_empty());
        assert!(d.to_delete.is_empty());
    }

    #[test]
    fn vanished_record_is_deleted() {
        let d = diff_records(&[record("REC1", 100)], &[]);
        assert_eq!(d.to_delete, vec![RecordKey::new("CUSTOMERS", "REC1")]);
    }

    #[test]
    fn record_moved_to_new_entity_is_an_update() {
        let d = diff_records(&[record("REC1", 100)], &[record("REC1", 101)]);
        assert_eq!(d.to_update.len(), 1);
        assert_eq!(d.to_update[0].entity_id, 101);
    }

    #[test]
    fn identical_record_produces_no_diff() {
        let d = diff_records(&[record("REC1", 100)], &[record("REC1", 100)]);
        assert!(d.to_insert.is_empty() && d.to_update.is_empty() && d.to_delete.is_empty());
    }

    #[test]
    fn relation_diff_detects_insert_update_delete() {
        let r1 = Relation::new(100, 200, MatchType::PossibleMatch, None, None, None, false, false);
        let r1_changed = Relation::new(100, 200, MatchType::AmbiguousMatch, None, None, None, true, false);
        let r2 = Relation::new(100, 300, MatchType::PossibleMatch, None, None, None, false, false);

        let d = diff_relations(&[r1.clone()], &[r1_changed.clone(), r2.clone()]);
        assert_eq!(d.to_insert, vec![r2]);
        assert_eq!(d.to_update, vec![r1_changed]);

        let d2 = diff_relations(&[r1.clone()], &[]);
        assert_eq!(d2.to_delete, vec![r1]);
    }
}
