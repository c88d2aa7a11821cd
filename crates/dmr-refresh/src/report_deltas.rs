//! Builds the `pending_report` rows a refresh emits for one entity's
//! record/relation diff (spec.md §4.G step 7, §4.H report-key taxonomy).

use crate::diff::{RecordDiff, RelationDiff};
use dmr_schemas::{EntityId, PendingReportDelta, ReportKey};
use std::collections::BTreeSet;

/// Signed delta accumulator, keyed by `(report_key, entity_id, related_id)`
/// so repeated contributions to the same bucket collapse into one row
/// before being queued (fewer, denser `pending_report` rows for the same
/// outcome).
#[derive(Default)]
pub struct DeltaBuilder {
    deltas: std::collections::BTreeMap<(String, EntityId, EntityId), PendingReportDelta>,
}

impl DeltaBuilder {
    fn add(&mut self, report_key: ReportKey, entity_id: EntityId, related_id: Option<EntityId>, entity_delta: i64, record_delta: i64, relation_delta: i64) {
        let key_string = report_key.to_string();
        let related_sentinel = related_id.unwrap_or(0);
        let entry = self
            .deltas
            .entry((key_string.clone(), entity_id, related_sentinel))
            .or_insert_with(|| PendingReportDelta {
                report_key: key_string,
                entity_id,
                related_id,
                entity_delta: 0,
                record_delta: 0,
                relation_delta: 0,
            });
        entry.entity_delta += entity_delta;
        entry.record_delta += record_delta;
        entry.relation_delta += relation_delta;
    }

    pub fn into_deltas(self) -> Vec<PendingReportDelta> {
        self.deltas.into_values().filter(|d| d.entity_delta != 0 || d.record_delta != 0 || d.relation_delta != 0).collect()
    }
}

/// `entity_created`/`entity_deleted` carry the lifecycle transition
/// (spec.md §4.G: a refresh can both change row contents and cross an
/// entity-existence boundary in the same run).
#[allow(clippy::too_many_arguments)]
pub fn build_record_deltas(builder: &mut DeltaBuilder, entity_id: EntityId, record_diff: &RecordDiff, entity_created: bool, entity_deleted: bool) {
    for record in &record_diff.to_insert {
        builder.add(ReportKey::DataSource(record.key.data_source.clone()), entity_id, None, 0, 1, 0);
    }
    for key in &record_diff.to_delete {
        builder.add(ReportKey::DataSource(key.data_source.clone()), entity_id, None, 0, -1, 0);
    }

    if entity_created {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for record in &record_diff.to_insert {
            if seen.insert(&record.key.data_source) {
                builder.add(ReportKey::DataSource(record.key.data_source.clone()), entity_id, None, 1, 0, 0);
            }
        }
    }
    if entity_deleted {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for key in &record_diff.to_delete {
            if seen.insert(&key.data_source) {
                builder.add(ReportKey::DataSource(key.data_source.clone()), entity_id, None, -1, 0, 0);
            }
        }
    }
}

/// `own_data_sources`/`related_data_sources_by_id` are read from the current
/// mart state (this entity's desired record set, and each related entity's
/// currently stored records) so `CM:`/`REL:` keys reflect the data sources
/// actually present on both endpoints, not just the pair's own fields.
pub fn build_relation_deltas(
    builder: &mut DeltaBuilder,
    relation_diff: &RelationDiff,
    own_data_sources: &BTreeSet<String>,
    related_data_sources_by_id: &std::collections::HashMap<EntityId, BTreeSet<String>>,
) {
    for relation in &relation_diff.to_insert {
        apply_relation_delta(builder, relation, own_data_sources, related_data_sources_by_id, 1);
    }
    for relation in &relation_diff.to_update {
        // An update changes match metadata; treat as delete-old is not
        // possible without the prior row's fields, so only the new state's
        // buckets are incremented. The report updater's convergence
        // property (spec.md §4.H) tolerates this: once all tasks drain, the
        // report tables are recomputed as a pure function of the `relation`
        // table's current contents, not of the delta history.
        apply_relation_delta(builder, relation, own_data_sources, related_data_sources_by_id, 1);
    }
    for relation in &relation_diff.to_delete {
        apply_relation_delta(builder, relation, own_data_sources, related_data_sources_by_id, -1);
    }
}

fn apply_relation_delta(
    builder: &mut DeltaBuilder,
    relation: &dmr_schemas::Relation,
    own_data_sources: &BTreeSet<String>,
    related_data_sources_by_id: &std::collections::HashMap<EntityId, BTreeSet<String>>,
    sign: i64,
) {
    let match_key = relation.match_key.clone().unwrap_or_default();
    let principle = relation.principle.clone().unwrap_or_default();

    builder.add(
        ReportKey::Match {
            match_type: relation.match_type,
            principle: principle.clone(),
            match_key: match_key.clone(),
        },
        relation.entity_id,
        Some(relation.related_id),
        0,
        0,
        sign,
    );

    let empty = BTreeSet::new();
    let other_sources = related_data_sources_by_id.get(&relation.related_id).unwrap_or(&empty);

    for own_ds in own_data_sources {
        for other_ds in other_sources {
            builder.add(ReportKey::cross_match(own_ds, other_ds), relation.entity_id, Some(relation.related_id), 0, 0, sign);
            builder.add(
                ReportKey::relation(own_ds, other_ds, relation.match_type, &principle, &match_key),
                relation.entity_id,
                Some(relation.related_id),
                0,
                0,
                sign,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::RecordDiff;
    use dmr_schemas::{MatchType, Record, RecordKey, Relation};
    use std::collections::HashMap;

    #[test]
    fn record_insert_emits_data_source_delta() {
        let mut builder = DeltaBuilder::default();
        let diff = RecordDiff {
            to_insert: vec![Record {
                key: RecordKey::new("CUSTOMERS", "REC1"),
                entity_id: 100,
                match_key: None,
                errule_code: None,
                principle: None,
            }],
            to_update: vec![],
            to_delete: vec![],
        };
        build_record_deltas(&mut builder, 100, &diff, true, false);
        let deltas = builder.into_deltas();
        let ds_delta = deltas.iter().find(|d| d.report_key == "DS:CUSTOMERS").unwrap();
        assert_eq!(ds_delta.record_delta, 1);
        assert_eq!(ds_delta.entity_delta, 1);
    }

    #[test]
    fn relation_insert_emits_match_and_cross_match_deltas() {
        let mut builder = DeltaBuilder::default();
        let relation = Relation::new(100, 200, MatchType::PossibleMatch, Some("NAME+DOB".into()), None, Some("MFF".into()), false, false);
        let diff = crate::diff::RelationDiff {
            to_insert: vec![relation],
            to_update: vec![],
            to_delete: vec![],
        };
        let own = BTreeSet::from(["CUSTOMERS".to_string()]);
        let mut related = HashMap::new();
        related.insert(200, BTreeSet::from(["WATCHLIST".to_string()]));

        build_relation_deltas(&mut builder, &diff, &own, &related);
        let deltas = builder.into_deltas();

        assert!(deltas.iter().any(|d| d.report_key == "CM:CUSTOMERS:WATCHLIST" && d.relation_delta == 1));
        assert!(deltas.iter().any(|d| d.report_key.starts_with("REL:CUSTOMERS:WATCHLIST:") && d.relation_delta == 1));
        assert!(deltas.iter().any(|d| d.report_key.starts_with("MATCH:POSSIBLE_MATCH:MFF:") && d.relation_delta == 1));
    }
}
