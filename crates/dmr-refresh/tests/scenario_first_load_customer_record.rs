use dmr_db::{schema::ensure_schema, Conn, DbPool};
use dmr_engine::FakeResolutionEngine;
use dmr_refresh::refresh_entity;
use dmr_schemas::{EntityResolution, Record, RecordKey};

#[tokio::test]
async fn first_load_customer_record_creates_entity_and_report_rows() {
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

    let stats = refresh_entity(&mut Conn::Pool(&pool), &pool, &engine, "worker-1", 100).await.unwrap().unwrap();
    assert!(stats.changed);
    assert!(stats.entity_created);
    assert_eq!(stats.records_inserted, 1);

    let entity = dmr_db::mart::fetch_entity(&pool, 100).await.unwrap().unwrap();
    assert_eq!(entity.record_count, 1);
    assert_eq!(entity.relation_count, 0);

    let records = dmr_db::mart::list_records_for_entity(&pool, 100).await.unwrap();
    assert_eq!(records.len(), 1);

    let pending = dmr_db::report::select_pending_batch(&pool, "DS:CUSTOMERS", 100).await.unwrap();
    assert!(!pending.is_empty(), "expected a DS:CUSTOMERS pending delta");
    let total_entity_delta: i64 = pending.iter().map(|p| p.delta.entity_delta).sum();
    let total_record_delta: i64 = pending.iter().map(|p| p.delta.record_delta).sum();
    assert_eq!(total_entity_delta, 1);
    assert_eq!(total_record_delta, 1);

    dmr_report::update_report(&mut Conn::Pool(&pool), &pool, "worker-1", "DS:CUSTOMERS", dmr_report::DEFAULT_BATCH_SIZE)
        .await
        .unwrap()
        .unwrap();
    let report = dmr_db::report::fetch_report(&pool, "DS:CUSTOMERS").await.unwrap().unwrap();
    assert_eq!(report.entity_count, 1);
    assert_eq!(report.record_count, 1);
}
