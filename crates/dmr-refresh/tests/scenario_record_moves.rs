use dmr_db::{schema::ensure_schema, Conn, DbPool};
use dmr_engine::FakeResolutionEngine;
use dmr_refresh::refresh_entity;
use dmr_schemas::{EntityResolution, Record, RecordKey};

#[tokio::test]
async fn record_moved_between_entities_converges_to_final_owner() {
    let pool = DbPool::connect_memory().await.unwrap();
    ensure_schema(&pool, false).await.unwrap();
    let engine = FakeResolutionEngine::new();

    engine.set_resolution(EntityResolution {
        entity_id: 100,
        entity_name: None,
        records: vec![Record {
            key: RecordKey::new("CUSTOMERS", "REC1"),
            entity_id: 100,
            match_key: None,
            errule_code: None,
            principle: None,
        }],
        relations: vec![],
    });
    refresh_entity(&mut Conn::Pool(&pool), &pool, &engine, "worker-1", 100).await.unwrap().unwrap();

    // Record re-resolved onto entity 101; entity 100 now has nothing.
    engine.remove_entity(100);
    engine.set_resolution(EntityResolution {
        entity_id: 101,
        entity_name: None,
        records: vec![Record {
            key: RecordKey::new("CUSTOMERS", "REC1"),
            entity_id: 101,
            match_key: None,
            errule_code: None,
            principle: None,
        }],
        relations: vec![],
    });

    refresh_entity(&mut Conn::Pool(&pool), &pool, &engine, "worker-1", 101).await.unwrap().unwrap();
    refresh_entity(&mut Conn::Pool(&pool), &pool, &engine, "worker-1", 100).await.unwrap().unwrap();

    assert!(dmr_db::mart::fetch_entity(&pool, 100).await.unwrap().is_none());
    let entity_101 = dmr_db::mart::fetch_entity(&pool, 101).await.unwrap().unwrap();
    assert_eq!(entity_101.record_count, 1);

    let records = dmr_db::mart::list_records_for_entity(&pool, 101).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, RecordKey::new("CUSTOMERS", "REC1"));
}
