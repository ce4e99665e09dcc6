// Time travel: snapshot strategies, strategy equivalence, the RECOVER TO
// state machine, and checkpoint triggers.

use std::sync::Arc;
use std::time::Duration;

use franco_db::buffer::{PartitionedBufferPool, ReplacerPolicy};
use franco_db::catalog::{Catalog, Schema};
use franco_db::common::value::{Value, ValueType};
use franco_db::common::current_timestamp;
use franco_db::recovery::{
    CheckpointManager, LogManager, LogRecord, Strategy, TimeTravelEngine,
};
use franco_db::storage::DiskManager;
use franco_db::{DbError, Engine, EngineConfig};
use tempfile::tempdir;

fn config(data_dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        data_dir: data_dir.to_str().unwrap().to_string(),
        database: "ttdb".to_string(),
        buffer_pool_size: 64,
        buffer_partitions: 4,
        checkpoint_interval_secs: 3600,
        checkpoint_ops_threshold: 0,
        ..EngineConfig::default()
    }
}

fn pair_schema() -> Schema {
    Schema::new(vec![("id", ValueType::Int), ("v", ValueType::Int)])
}

fn pair(id: i64, v: i64) -> Vec<Value> {
    vec![Value::Int(id), Value::Int(v)]
}

fn sorted(mut rows: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    rows.sort_by_key(|r| match &r[0] {
        Value::Int(v) => *v,
        _ => 0,
    });
    rows
}

/// The reverse-delta walkthrough: live table [(1,100),(2,250),(3,300)],
/// UPDATE (2,200)->(2,250) at t=1_000_100, INSERT (3,300) at t=1_000_200,
/// snapshot AS OF t=1_000_150 must undo the insert and keep the update.
#[test]
fn test_reverse_delta_snapshot_walkthrough() {
    let dir = tempdir().unwrap();
    let disk = Arc::new(DiskManager::new(dir.path().join("u")).unwrap());
    let bpm = Arc::new(PartitionedBufferPool::new(32, 4, ReplacerPolicy::Lru, disk).unwrap());
    let log = LogManager::new(dir.path().join("data")).unwrap();
    bpm.set_log_manager(log.clone());
    let catalog = Arc::new(Catalog::new(bpm.clone(), dir.path().join("data/system")).unwrap());
    let checkpoint = CheckpointManager::new(
        bpm.clone(),
        log.clone(),
        dir.path().join("data/system/master_record"),
    )
    .unwrap();
    let tte = TimeTravelEngine::new(log.clone(), catalog.clone(), bpm, checkpoint);

    let entry = catalog.create_table("u", pair_schema()).unwrap();

    let mut update = LogRecord::update(1, "u", pair(2, 200), pair(2, 250));
    update.timestamp = 1_000_100;
    let update_lsn = log.append(&mut update).unwrap();

    let mut insert = LogRecord::insert(1, "u", pair(3, 300));
    insert.timestamp = 1_000_200;
    let insert_lsn = log.append(&mut insert).unwrap();
    assert!(insert_lsn > update_lsn);
    log.flush(true).unwrap();

    // Live state reflects both operations.
    entry.heap.insert_row(&pair(1, 100), 1).unwrap();
    entry.heap.insert_row(&pair(2, 250), update_lsn).unwrap();
    entry.heap.insert_row(&pair(3, 300), insert_lsn).unwrap();

    let (heap, result) = tte
        .build_snapshot("u", 1_000_150, None, Strategy::ReverseDelta)
        .unwrap();
    assert_eq!(result.strategy_used, Strategy::ReverseDelta);
    assert_eq!(sorted(heap.into_rows()), vec![pair(1, 100), pair(2, 250)]);

    log.stop().unwrap();
}

#[test]
fn test_snapshot_strategies_agree() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    engine.create_table("t", pair_schema()).unwrap();

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "t", pair(1, 10)).unwrap();
    engine.insert(&txn, "t", pair(2, 20)).unwrap();
    engine.commit(&txn).unwrap();

    std::thread::sleep(Duration::from_millis(5));
    let target = current_timestamp();
    std::thread::sleep(Duration::from_millis(5));

    let txn = engine.begin().unwrap();
    engine.update(&txn, "t", pair(2, 20), pair(2, 25)).unwrap();
    engine.delete(&txn, "t", pair(1, 10)).unwrap();
    engine.insert(&txn, "t", pair(3, 30)).unwrap();
    engine.commit(&txn).unwrap();

    let (reverse, _) = engine
        .snapshot_at("t", target, Strategy::ReverseDelta)
        .unwrap();
    let (forward, _) = engine
        .snapshot_at("t", target, Strategy::ForwardReplay)
        .unwrap();

    assert_eq!(sorted(reverse.clone()), vec![pair(1, 10), pair(2, 20)]);
    assert_eq!(sorted(reverse), sorted(forward));
    engine.shutdown().unwrap();
}

#[test]
fn test_snapshot_now_equals_live_state() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    engine.create_table("t", pair_schema()).unwrap();

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "t", pair(1, 1)).unwrap();
    engine.insert(&txn, "t", pair(2, 2)).unwrap();
    engine.commit(&txn).unwrap();

    std::thread::sleep(Duration::from_millis(2));
    let (snapshot, _) = engine
        .snapshot_at("t", current_timestamp(), Strategy::ReverseDelta)
        .unwrap();
    assert_eq!(sorted(snapshot), sorted(engine.scan("t").unwrap()));
    engine.shutdown().unwrap();
}

#[test]
fn test_snapshot_before_history_is_empty() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    engine.create_table("t", pair_schema()).unwrap();

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "t", pair(1, 1)).unwrap();
    engine.commit(&txn).unwrap();

    let (snapshot, _) = engine.snapshot_at("t", 1, Strategy::ForwardReplay).unwrap();
    assert!(snapshot.is_empty());
    engine.shutdown().unwrap();
}

#[test]
fn test_recover_to_past_timestamp() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    engine.create_table("t", pair_schema()).unwrap();

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "t", pair(1, 10)).unwrap();
    engine.commit(&txn).unwrap();

    std::thread::sleep(Duration::from_millis(5));
    let target = current_timestamp();
    std::thread::sleep(Duration::from_millis(5));

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "t", pair(2, 20)).unwrap();
    engine.update(&txn, "t", pair(1, 10), pair(1, 11)).unwrap();
    engine.commit(&txn).unwrap();

    let result = engine.recover_to_timestamp(target).unwrap();
    assert!(result.records_processed > 0);
    assert_eq!(sorted(engine.scan("t").unwrap()), vec![pair(1, 10)]);

    // The rollback is durable across a clean restart.
    engine.shutdown().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    assert_eq!(sorted(engine.scan("t").unwrap()), vec![pair(1, 10)]);
    engine.shutdown().unwrap();
}

#[test]
fn test_recover_to_latest_is_a_noop() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    engine.create_table("t", pair_schema()).unwrap();

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "t", pair(1, 1)).unwrap();
    engine.commit(&txn).unwrap();
    let before = engine.scan("t").unwrap();

    let result = engine.recover_to("latest").unwrap();
    assert_eq!(result.records_processed, 0);
    assert_eq!(engine.scan("t").unwrap(), before);
    // Everything was flushed on the way.
    assert_eq!(engine.buffer_pool().stats().dirty_frames, 0);
    engine.shutdown().unwrap();
}

#[test]
fn test_recover_to_rejects_bad_targets() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();

    let future = current_timestamp() + 120_000_000;
    assert!(matches!(
        engine.recover_to_timestamp(future),
        Err(DbError::FutureTimestamp(_))
    ));
    assert!(matches!(
        engine.recover_to_timestamp(0),
        Err(DbError::InvalidTimestamp(_))
    ));
    engine.shutdown().unwrap();
}

/// Operation-count trigger: crossing the threshold fires exactly one
/// checkpoint, the master record is updated and every table is tagged with
/// the CHECKPOINT_END LSN.
#[test]
fn test_operation_threshold_fires_one_checkpoint() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.checkpoint_ops_threshold = 50;
    let engine = Engine::open(cfg).unwrap();
    engine.create_table("t", pair_schema()).unwrap();

    let txn = engine.begin().unwrap();
    for i in 0..48 {
        engine.insert(&txn, "t", pair(i, i)).unwrap();
    }
    engine.commit(&txn).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while engine.checkpoint_manager().checkpoint_count() == 0
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(engine.checkpoint_manager().checkpoint_count(), 1);

    let master = engine
        .checkpoint_manager()
        .master_record()
        .unwrap()
        .expect("master record must exist after a checkpoint");
    let entry = engine.catalog().table("t").unwrap();
    assert_eq!(entry.checkpoint_lsn(), master.checkpoint_lsn);
    engine.shutdown().unwrap();
}

#[test]
fn test_snapshot_of_unknown_table_fails() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    assert!(matches!(
        engine.snapshot_at("ghost", current_timestamp(), Strategy::ReverseDelta),
        Err(DbError::NotFound(_))
    ));
    engine.shutdown().unwrap();
}
