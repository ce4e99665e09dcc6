// Crash and restart scenarios: WAL ordering, mid-transaction crashes,
// durability of committed work, and idempotent recovery.
//
// A "crash" here is dropping the engine without calling shutdown: the
// background workers die with it and whatever the flush worker had not yet
// drained is lost, like a killed process.

use franco_db::catalog::Schema;
use franco_db::common::value::{Value, ValueType};
use franco_db::{Engine, EngineConfig};
use tempfile::tempdir;

fn config(data_dir: &std::path::Path) -> EngineConfig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    EngineConfig {
        data_dir: data_dir.to_str().unwrap().to_string(),
        database: "crashdb".to_string(),
        buffer_pool_size: 64,
        buffer_partitions: 4,
        // Keep the background triggers quiet so tests control checkpoints.
        checkpoint_interval_secs: 3600,
        checkpoint_ops_threshold: 0,
        ..EngineConfig::default()
    }
}

fn users_schema() -> Schema {
    Schema::new(vec![("id", ValueType::Int), ("v", ValueType::Text)])
}

fn row(id: i64, v: &str) -> Vec<Value> {
    vec![Value::Int(id), Value::Text(v.to_string())]
}

#[test]
fn test_wal_ordering_on_flush_page() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path())).unwrap();
    engine.create_table("t", users_schema()).unwrap();

    let txn = engine.begin().unwrap();
    engine.insert(&txn, "t", row(1, "a")).unwrap();

    let entry = engine.catalog().table("t").unwrap();
    let page_id = entry.heap.first_page_id();
    let page_lsn = entry.heap.max_page_lsn().unwrap();

    // Flushing the data page must force the log first.
    engine.buffer_pool().flush_page(page_id).unwrap();
    assert!(
        engine.log_manager().persistent_lsn() >= page_lsn,
        "log must be durable up to the page LSN before the page hits disk"
    );

    engine.commit(&txn).unwrap();
    drop(engine);

    let engine = Engine::open(config(dir.path())).unwrap();
    assert_eq!(engine.scan("t").unwrap(), vec![row(1, "a")]);
    engine.shutdown().unwrap();
}

#[test]
fn test_committed_work_survives_crash() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.create_table("t", users_schema()).unwrap();
        let txn = engine.begin().unwrap();
        engine.insert(&txn, "t", row(1, "a")).unwrap();
        engine.insert(&txn, "t", row(2, "b")).unwrap();
        engine.commit(&txn).unwrap();
        // Crash: no shutdown, no checkpoint, dirty pages never flushed.
    }

    let engine = Engine::open(config(dir.path())).unwrap();
    let mut rows = engine.scan("t").unwrap();
    rows.sort_by_key(|r| match &r[0] {
        Value::Int(v) => *v,
        _ => 0,
    });
    assert_eq!(rows, vec![row(1, "a"), row(2, "b")]);
    engine.shutdown().unwrap();
}

#[test]
fn test_crash_mid_transaction_rolls_back() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.create_table("t", users_schema()).unwrap();

        let committed = engine.begin().unwrap();
        engine.insert(&committed, "t", row(1, "keep")).unwrap();
        engine.commit(&committed).unwrap();

        // In-flight transaction: two inserts, never committed.
        let in_flight = engine.begin().unwrap();
        engine.insert(&in_flight, "t", row(2, "x")).unwrap();
        engine.insert(&in_flight, "t", row(3, "y")).unwrap();
        engine.log_manager().flush(true).unwrap();
        // Crash before COMMIT.
    }

    let engine = Engine::open(config(dir.path())).unwrap();
    assert_eq!(
        engine.scan("t").unwrap(),
        vec![row(1, "keep")],
        "uncommitted effects must be undone"
    );
    engine.shutdown().unwrap();
}

#[test]
fn test_recovery_is_idempotent() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.create_table("t", users_schema()).unwrap();
        let txn = engine.begin().unwrap();
        engine.insert(&txn, "t", row(1, "a")).unwrap();
        engine.commit(&txn).unwrap();

        let loser = engine.begin().unwrap();
        engine.insert(&loser, "t", row(2, "gone")).unwrap();
        engine.log_manager().flush(true).unwrap();
    }

    let first = {
        let engine = Engine::open(config(dir.path())).unwrap();
        let rows = engine.scan("t").unwrap();
        engine.shutdown().unwrap();
        rows
    };

    let second = {
        let engine = Engine::open(config(dir.path())).unwrap();
        let rows = engine.scan("t").unwrap();
        engine.shutdown().unwrap();
        rows
    };

    assert_eq!(first, vec![row(1, "a")]);
    assert_eq!(first, second);
}

#[test]
fn test_recovery_after_checkpoint_replays_only_the_tail() {
    let dir = tempdir().unwrap();
    {
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.create_table("t", users_schema()).unwrap();

        let txn = engine.begin().unwrap();
        engine.insert(&txn, "t", row(1, "pre")).unwrap();
        engine.commit(&txn).unwrap();

        engine.checkpoint().unwrap();

        let txn = engine.begin().unwrap();
        engine.insert(&txn, "t", row(2, "post")).unwrap();
        engine.commit(&txn).unwrap();
        // Crash after the checkpoint with a committed tail.
    }

    let engine = Engine::open(config(dir.path())).unwrap();
    let mut rows = engine.scan("t").unwrap();
    rows.sort_by_key(|r| match &r[0] {
        Value::Int(v) => *v,
        _ => 0,
    });
    assert_eq!(rows, vec![row(1, "pre"), row(2, "post")]);

    // Fresh appends must continue the LSN sequence, not restart it.
    let records = engine
        .log_manager()
        .read_records("crashdb", 0)
        .unwrap();
    let mut last = -1;
    for record in &records {
        assert!(record.lsn > last, "LSNs must be strictly increasing");
        last = record.lsn;
    }
    engine.shutdown().unwrap();
}

#[test]
fn test_lsn_allocation_resumes_across_restarts() {
    let dir = tempdir().unwrap();
    let max_before;
    {
        let engine = Engine::open(config(dir.path())).unwrap();
        engine.create_table("t", users_schema()).unwrap();
        let txn = engine.begin().unwrap();
        engine.insert(&txn, "t", row(1, "a")).unwrap();
        engine.commit(&txn).unwrap();
        max_before = engine.log_manager().next_lsn();
        engine.shutdown().unwrap();
    }

    let engine = Engine::open(config(dir.path())).unwrap();
    assert!(engine.log_manager().next_lsn() >= max_before);
    engine.shutdown().unwrap();
}
