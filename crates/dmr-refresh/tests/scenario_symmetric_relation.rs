use dmr_db::{schema::ensure_schema, Conn, DbPool};
use dmr_engine::FakeResolutionEngine;
use dmr_refresh::refresh_entity;
use dmr_schemas::{EntityResolution, MatchType, Relation};

/// spec.md §8 scenario 3: engine reports 100 relates to 200 (possible
/// match, key "NAME+DOB", principle "MFF"). Both entities refresh.
/// Expected: exactly one relation row for the pair, symmetric regardless
/// of which side's resolution carried the relation.
#[tokio::test]
async fn symmetric_relation_converges_to_single_row() {
    let pool = DbPool::connect_memory().await.unwrap();
    ensure_schema(&pool, false).await.unwrap();
    let engine = FakeResolutionEngine::new();

    let relation = Relation::new(
        100,
        200,
        MatchType::PossibleMatch,
        Some("NAME+DOB".to_string()),
        None,
        Some("MFF".to_string()),
        false,
        false,
    );

    engine.set_resolution(EntityResolution {
        entity_id: 100,
        entity_name: None,
        records: vec![],
        relations: vec![relation.clone()],
    });
    engine.set_resolution(EntityResolution {
        entity_id: 200,
        entity_name: None,
        records: vec![],
        relations: vec![relation.clone()],
    });

    refresh_entity(&mut Conn::Pool(&pool), &pool, &engine, "worker-1", 100).await.unwrap().unwrap();
    refresh_entity(&mut Conn::Pool(&pool), &pool, &engine, "worker-1", 200).await.unwrap().unwrap();

    let from_100 = dmr_db::mart::list_relations_for_entity(&pool, 100).await.unwrap();
    let from_200 = dmr_db::mart::list_relations_for_entity(&pool, 200).await.unwrap();
    assert_eq!(from_100.len(), 1);
    assert_eq!(from_200.len(), 1);
    assert_eq!(from_100[0].entity_id, 100);
    assert_eq!(from_100[0].related_id, 200);
    assert_eq!(from_100[0].match_type, MatchType::PossibleMatch);

    // Neither entity carries any records here, so CM:/REL: keys (which need
    // a data source on both endpoints) stay empty; only MATCH: fires.
    let pending = dmr_db::report::select_pending_batch(&pool, "MATCH:POSSIBLE_MATCH:MFF:NAME+DOB", 100)
        .await
        .unwrap();
    assert!(!pending.is_empty(), "expected a MATCH: pending delta for the relation");
    let total_relation_delta: i64 = pending.iter().map(|p| p.delta.relation_delta).sum();
    assert_eq!(total_relation_delta, 2, "both sides of the symmetric relation each contribute +1");
}
