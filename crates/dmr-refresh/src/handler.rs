//! `refresh-entity` handler (spec.md §4.G) — the heart of the replicator.
//! Reads the engine's current resolution for one entity, diffs it against
//! the data mart, applies row-level changes, and queues the pending-report
//! deltas the report updater later folds.

use crate::diff::{diff_records, diff_relations};
use crate::hash::hash_resolution;
use crate::report_deltas::{build_record_deltas, build_relation_deltas, DeltaBuilder};
use dmr_db::{mart, queue, Conn, DbPool};
use dmr_engine::{EngineLookup, ResolutionEngine};
use dmr_schemas::{EntityId, EntityResolution, EntityRow};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info};

/// Per-entity lock wait before giving up and leaving the task to be
/// reclaimed by the scheduler's retry path.
pub const LOCK_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefreshStats {
    pub changed: bool,
    pub entity_created: bool,
    pub entity_deleted: bool,
    pub records_inserted: usize,
    pub records_updated: usize,
    pub records_deleted: usize,
    pub relations_inserted: usize,
    pub relations_updated: usize,
    pub relations_deleted: usize,
    pub follow_ups_queued: usize,
}

/// Run one refresh of `entity_id`, multiplicity `N` collapsed upstream
/// notifications into this single call (spec.md §4.G). Returns `Ok(None)`
/// if the per-entity lock could not be acquired within [`LOCK_WAIT`] — the
/// caller should treat this as a retryable failure and leave the task for
/// reclamation. `conn` is the caller's write destination — its own open
/// transaction, or a bare pool handle for standalone callers — so every
/// mart write, pending-report insert, and follow-up commit this refresh
/// produces persists or rolls back together. Lock acquire/release always
/// goes through `pool` directly: the lock row must be independently
/// visible to other workers, not held hostage by this transaction.
pub async fn refresh_entity(conn: &mut Conn<'_>, pool: &DbPool, engine: &dyn ResolutionEngine, worker_id: &str, entity_id: EntityId) -> anyhow::Result<Option<RefreshStats>> {
    let resource_key = format!("entity:{entity_id}");
    let guard = match dmr_locks::acquire(pool, &resource_key, worker_id, LOCK_WAIT).await? {
        Some(g) => g,
        None => {
            debug!(entity_id, "could not acquire entity lock within deadline");
            return Ok(None);
        }
    };

    let stats = run_refresh(conn, pool, engine, entity_id).await;
    guard.release().await?;
    stats.map(Some)
}

async fn run_refresh(conn: &mut Conn<'_>, pool: &DbPool, engine: &dyn ResolutionEngine, entity_id: EntityId) -> anyhow::Result<RefreshStats> {
    let lookup = engine.fetch_entity(entity_id).await?;
    let desired = match &lookup {
        EngineLookup::Unknown | EngineLookup::EmptyResolution => empty_resolution(entity_id),
        EngineLookup::Resolved(r) => r.clone(),
    };

    let existing_entity = mart::fetch_entity(pool, entity_id).await?;
    let existing_records = mart::list_records_for_entity(pool, entity_id).await?;
    let existing_relations = mart::list_relations_for_entity(pool, entity_id).await?;

    if existing_entity.is_none() && desired.is_empty() {
        // spec.md §8 boundary: refreshing an entity with an empty engine
        // response and a data-mart row that never existed writes nothing.
        return Ok(RefreshStats::default());
    }

    let new_hash = if desired.is_empty() { None } else { Some(hash_resolution(&desired)) };
    let unchanged = match (&existing_entity, &new_hash) {
        (Some(existing), Some(hash)) => &existing.entity_hash == hash,
        _ => false,
    };
    if unchanged {
        return Ok(RefreshStats::default());
    }

    let record_diff = diff_records(&existing_records, &desired.records);
    let relation_diff = diff_relations(&existing_relations, &desired.relations);

    let entity_created = existing_entity.is_none() && !desired.is_empty();
    let entity_deleted = existing_entity.is_some() && desired.is_empty();

    apply_record_diff(conn, &record_diff).await?;
    apply_relation_diff(conn, &relation_diff).await?;
    apply_entity_row(conn, entity_id, &existing_entity, &desired, new_hash.as_deref()).await?;

    let mut builder = DeltaBuilder::default();
    build_record_deltas(&mut builder, entity_id, &record_diff, entity_created, entity_deleted);

    let own_data_sources: BTreeSet<String> = desired.records.iter().map(|r| r.key.data_source.clone()).collect();
    let related_ids = touched_related_ids(&relation_diff);
    let related_data_sources = load_related_data_sources(pool, &related_ids).await?;
    build_relation_deltas(&mut builder, &relation_diff, &own_data_sources, &related_data_sources);

    for delta in builder.into_deltas() {
        dmr_db::report::insert_pending_report(conn, &delta).await?;
    }

    let follow_ups_queued = queue_follow_ups(conn, entity_id, &related_ids).await?;

    info!(
        entity_id,
        records_inserted = record_diff.to_insert.len(),
        records_deleted = record_diff.to_delete.len(),
        relations_inserted = relation_diff.to_insert.len(),
        relations_deleted = relation_diff.to_delete.len(),
        follow_ups_queued,
        "entity refreshed"
    );

    Ok(RefreshStats {
        changed: true,
        entity_created,
        entity_deleted,
        records_inserted: record_diff.to_insert.len(),
        records_updated: record_diff.to_update.len(),
        records_deleted: record_diff.to_delete.len(),
        relations_inserted: relation_diff.to_insert.len(),
        relations_updated: relation_diff.to_update.len(),
        relations_deleted: relation_diff.to_delete.len(),
        follow_ups_queued,
    })
}

fn empty_resolution(entity_id: EntityId) -> EntityResolution {
    EntityResolution {
        entity_id,
        entity_name: None,
        records: vec![],
        relations: vec![],
    }
}

async fn apply_record_diff(conn: &mut Conn<'_>, diff: &crate::diff::RecordDiff) -> anyhow::Result<()> {
    for key in &diff.to_delete {
        mart::delete_record(conn, key).await?;
    }
    for record in &diff.to_insert {
        mart::insert_record(conn, record).await?;
    }
    for record in &diff.to_update {
        mart::update_record_entity(conn, &record.key, record.entity_id).await?;
    }
    Ok(())
}

async fn apply_relation_diff(conn: &mut Conn<'_>, diff: &crate::diff::RelationDiff) -> anyhow::Result<()> {
    // Relations deleted first so a record move that also drops a relation
    // never leaves a dangling foreign key (spec.md §4.G tie-breaking note).
    for relation in &diff.to_delete {
        mart::delete_relation(conn, relation.entity_id, relation.related_id).await?;
    }
    for relation in diff.to_insert.iter().chain(diff.to_update.iter()) {
        let relation_hash = crate::hash::hash_resolution(&EntityResolution {
            entity_id: relation.entity_id,
            entity_name: None,
            records: vec![],
            relations: vec![relation.clone()],
        });
        mart::delete_relation(conn, relation.entity_id, relation.related_id).await?;
        mart::insert_relation(conn, relation, &relation_hash).await?;
    }
    Ok(())
}

async fn apply_entity_row(
    conn: &mut Conn<'_>,
    entity_id: EntityId,
    existing: &Option<EntityRow>,
    desired: &EntityResolution,
    new_hash: Option<&str>,
) -> anyhow::Result<()> {
    match new_hash {
        None => {
            mart::delete_entity(conn, entity_id).await?;
        }
        Some(hash) => {
            let row = EntityRow {
                entity_id,
                entity_name: desired.entity_name.clone(),
                record_count: desired.records.len() as i64,
                relation_count: desired.relations.len() as i64,
                entity_hash: hash.to_string(),
                prev_entity_hash: existing.as_ref().map(|e| e.entity_hash.clone()),
            };
            mart::upsert_entity(conn, &row).await?;
        }
    }
    Ok(())
}

fn touched_related_ids(diff: &crate::diff::RelationDiff) -> BTreeSet<EntityId> {
    diff.to_insert
        .iter()
        .chain(diff.to_update.iter())
        .chain(diff.to_delete.iter())
        .map(|r| r.related_id)
        .collect()
}

async fn load_related_data_sources(pool: &DbPool, related_ids: &BTreeSet<EntityId>) -> anyhow::Result<HashMap<EntityId, BTreeSet<String>>> {
    let mut map = HashMap::new();
    for &id in related_ids {
        let records = mart::list_records_for_entity(pool, id).await?;
        map.insert(id, records.into_iter().map(|r| r.key.data_source).collect());
    }
    Ok(map)
}

/// Queue `refresh-entity` follow-ups for every other entity touched by a
/// relation change, so its own view of the relationship converges
/// (spec.md §4.G step 8). Each follow-up is committed with multiplicity 1:
/// this refresh produced exactly one notification per related entity,
/// regardless of how many upstream notifications collapsed into this run.
async fn queue_follow_ups(conn: &mut Conn<'_>, entity_id: EntityId, related_ids: &BTreeSet<EntityId>) -> anyhow::Result<usize> {
    let mut queued = 0;
    for &related_id in related_ids {
        if related_id == entity_id {
            continue;
        }
        let signature = format!("refresh-entity:{related_id}");
        let params = serde_json::json!({ "ENTITY_ID": related_id }).to_string();
        queue::commit_task(conn, &signature, "refresh-entity", &params, 1, dmr_db::now_micros()).await?;
        queued += 1;
    }
    Ok(queued)
}
