//! `update-report` handler (spec.md §4.H) — folds `pending_report` deltas
//! into `report_detail`, recomputes the `report` aggregate, and re-queues
//! itself if the batch did not drain the key.

use dmr_db::{queue, report, Conn, DbPool};
use dmr_schemas::{EntityId, ReportDetailRow, ReportKey};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

/// Per-key lock wait before giving up and leaving the task to be reclaimed.
pub const LOCK_WAIT: Duration = Duration::from_secs(10);
/// Default batch size (spec.md §4.H step 1: "batch size configurable,
/// default 100").
pub const DEFAULT_BATCH_SIZE: i64 = 100;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateStats {
    pub rows_folded: usize,
    pub details_upserted: usize,
    pub details_deleted: usize,
    pub requeued: bool,
}

/// Run one `update-report` pass for `report_key`. Returns `Ok(None)` if the
/// per-key lock could not be acquired within [`LOCK_WAIT`]. `conn` carries
/// the caller's open transaction (or a bare pool handle for standalone
/// callers) so every detail upsert, the report recompute, the pending-row
/// cleanup, and any requeue commit together (spec.md §4.G).
pub async fn update_report(conn: &mut Conn<'_>, pool: &DbPool, worker_id: &str, report_key: &str, batch_size: i64) -> anyhow::Result<Option<UpdateStats>> {
    let resource_key = format!("report:{report_key}");
    let guard = match dmr_locks::acquire(pool, &resource_key, worker_id, LOCK_WAIT).await? {
        Some(g) => g,
        None => {
            debug!(report_key, "could not acquire report lock within deadline");
            return Ok(None);
        }
    };

    let stats = run_update(conn, pool, report_key, batch_size).await;
    guard.release().await?;
    stats.map(Some)
}

async fn run_update(conn: &mut Conn<'_>, pool: &DbPool, report_key: &str, batch_size: i64) -> anyhow::Result<UpdateStats> {
    let batch = report::select_pending_batch(pool, report_key, batch_size).await?;
    if batch.is_empty() {
        return Ok(UpdateStats::default());
    }

    let parsed = ReportKey::parse(report_key);
    let is_data_source_key = matches!(parsed, Some(ReportKey::DataSource(_)));

    // Sum deltas by (entity_id, related_id) (spec.md §4.H step 2) into the
    // single `record_count` column. `entity_count` is never derived from
    // this sum — `recompute_report` counts distinct `entity_id`s across
    // `report_detail` rows instead — so only the column's own contribution
    // is folded here: `record_delta` for DS: keys, `relation_delta` for
    // MATCH:/CM:/REL: keys. `entity_delta` never enters this column.
    let mut net: BTreeMap<(EntityId, EntityId), i64> = BTreeMap::new();
    for row in &batch {
        let related = row.delta.related_id.unwrap_or(0);
        let contribution = if is_data_source_key { row.delta.record_delta } else { row.delta.relation_delta };
        *net.entry((row.delta.entity_id, related)).or_insert(0) += contribution;
    }

    let (match_key, principle) = match &parsed {
        Some(ReportKey::Match { match_key, principle, .. }) => (Some(match_key.clone()), Some(principle.clone())),
        Some(ReportKey::Relation { match_key, principle, .. }) => (Some(match_key.clone()), Some(principle.clone())),
        _ => (None, None),
    };

    let mut details_upserted = 0;
    let mut details_deleted = 0;
    for ((entity_id, related_sentinel), delta) in &net {
        let related_id = if *related_sentinel == 0 { None } else { Some(*related_sentinel) };
        let existing = report::fetch_report_detail(pool, report_key, *entity_id, related_id).await?;
        let new_count = existing.as_ref().map(|r| r.record_count).unwrap_or(0) + delta;

        if new_count <= 0 {
            if existing.is_some() {
                report::delete_report_detail(conn, report_key, *entity_id, related_id).await?;
                details_deleted += 1;
            }
        } else {
            report::upsert_report_detail(
                conn,
                &ReportDetailRow {
                    report_key: report_key.to_string(),
                    entity_id: *entity_id,
                    related_id,
                    record_count: new_count,
                    match_key: match_key.clone(),
                    principle: principle.clone(),
                },
            )
            .await?;
            details_upserted += 1;
        }
    }

    report::recompute_report(conn, report_key).await?;

    let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
    report::delete_pending_rows(conn, &ids).await?;

    let requeued = if report::has_pending(conn, report_key).await? {
        let signature = format!("update-report:{report_key}");
        let params = serde_json::json!({ "report_key": report_key }).to_string();
        queue::commit_task(conn, &signature, "update-report", &params, 1, dmr_db::now_micros()).await?;
        true
    } else {
        false
    };

    info!(report_key, rows_folded = batch.len(), details_upserted, details_deleted, requeued, "report updated");

    Ok(UpdateStats {
        rows_folded: batch.len(),
        details_upserted,
        details_deleted,
        requeued,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmr_db::schema::ensure_schema;
    use dmr_schemas::PendingReportDelta;

    async fn push_delta(pool: &DbPool, report_key: &str, entity_id: EntityId, related_id: Option<EntityId>, entity_delta: i64, record_delta: i64, relation_delta: i64) {
        report::insert_pending_report(
            &mut Conn::Pool(pool),
            &PendingReportDelta {
                report_key: report_key.to_string(),
                entity_id,
                related_id,
                entity_delta,
                record_delta,
                relation_delta,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn folds_data_source_deltas_into_report_and_detail() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();

        push_delta(&pool, "DS:CUSTOMERS", 100, None, 1, 1, 0).await;
        push_delta(&pool, "DS:CUSTOMERS", 200, None, 1, 2, 0).await;

        let stats = update_report(&mut Conn::Pool(&pool), &pool, "w1", "DS:CUSTOMERS", DEFAULT_BATCH_SIZE).await.unwrap().unwrap();
        assert_eq!(stats.rows_folded, 2);
        assert_eq!(stats.details_upserted, 2);
        assert!(!stats.requeued);

        let report = dmr_db::report::fetch_report(&pool, "DS:CUSTOMERS").await.unwrap().unwrap();
        assert_eq!(report.entity_count, 2);
        assert_eq!(report.record_count, 1 + 2);
    }

    #[tokio::test]
    async fn net_zero_delta_deletes_detail_row() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();

        push_delta(&pool, "DS:CUSTOMERS", 100, None, 1, 1, 0).await;
        update_report(&mut Conn::Pool(&pool), &pool, "w1", "DS:CUSTOMERS", DEFAULT_BATCH_SIZE).await.unwrap();

        push_delta(&pool, "DS:CUSTOMERS", 100, None, -1, -1, 0).await;
        let stats = update_report(&mut Conn::Pool(&pool), &pool, "w1", "DS:CUSTOMERS", DEFAULT_BATCH_SIZE).await.unwrap().unwrap();
        assert_eq!(stats.details_deleted, 1);

        let detail = report::fetch_report_detail(&pool, "DS:CUSTOMERS", 100, None).await.unwrap();
        assert!(detail.is_none());
        let report = dmr_db::report::fetch_report(&pool, "DS:CUSTOMERS").await.unwrap().unwrap();
        assert_eq!(report.entity_count, 0);
        assert_eq!(report.record_count, 0);
    }

    #[tokio::test]
    async fn requeues_follow_up_when_batch_does_not_drain_key() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();

        for i in 0..5 {
            push_delta(&pool, "DS:CUSTOMERS", 100 + i, None, 1, 1, 0).await;
        }

        let stats = update_report(&mut Conn::Pool(&pool), &pool, "w1", "DS:CUSTOMERS", 2).await.unwrap().unwrap();
        assert_eq!(stats.rows_folded, 2);
        assert!(stats.requeued);

        let queued = queue::count_by_status(&pool, queue::STATUS_READY).await.unwrap();
        assert_eq!(queued, 1);
    }

    #[tokio::test]
    async fn relation_delta_folds_into_match_key_detail_with_parsed_metadata() {
        let pool = DbPool::connect_memory().await.unwrap();
        ensure_schema(&pool, false).await.unwrap();

        // A relation is always stored with entity_id < related_id
        // (Relation::new normalizes both endpoints' views onto the same
        // pair), so both sides' refresh runs contribute to the same
        // (entity_id, related_id) bucket rather than a mirrored one.
        let key = "MATCH:POSSIBLE_MATCH:MFF:NAME+DOB";
        push_delta(&pool, key, 100, Some(200), 0, 0, 1).await;
        push_delta(&pool, key, 100, Some(200), 0, 0, 1).await;

        update_report(&mut Conn::Pool(&pool), &pool, "w1", key, DEFAULT_BATCH_SIZE).await.unwrap();

        let detail = report::fetch_report_detail(&pool, key, 100, Some(200)).await.unwrap().unwrap();
        assert_eq!(detail.match_key.as_deref(), Some("NAME+DOB"));
        assert_eq!(detail.principle.as_deref(), Some("MFF"));
        assert_eq!(detail.record_count, 2);

        let report = dmr_db::report::fetch_report(&pool, key).await.unwrap().unwrap();
        assert_eq!(report.relation_count, 1);
    }
}
