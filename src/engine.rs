use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::buffer::{PartitionedBufferPool, ReplacerPolicy};
use crate::catalog::{Catalog, Schema, TableEntry};
use crate::common::value::Row;
use crate::common::INVALID_LSN;
use crate::error::{DbError, Result};
use crate::recovery::time_travel::{parse_timestamp, TimeTravelEngine, TimeTravelResult};
use crate::recovery::{
    CheckpointManager, LogManager, LogRecord, LogRecordKind, RecoveryManager, Strategy,
};
use crate::storage::DiskManager;
use crate::transaction::{Modification, ModificationKind, TransactionManager, TxnHandle};
use crate::EngineConfig;

/// How long shutdown waits for the final auto-save checkpoint.
const SHUTDOWN_CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(5);

/// The assembled storage engine.
///
/// `Engine` owns the component graph (disk, buffer pool, log, checkpoint,
/// catalog, transactions, time travel) and the process-wide engine lock:
/// ordinary statements take it shared, CHECKPOINT and RECOVER take it
/// exclusive. The fine-grained latches below it provide real parallelism in
/// shared mode.
pub struct Engine {
    config: EngineConfig,
    disk: Arc<DiskManager>,
    bpm: Arc<PartitionedBufferPool>,
    log: Arc<LogManager>,
    checkpoint: Arc<CheckpointManager>,
    catalog: Arc<Catalog>,
    txns: TransactionManager,
    time_travel: TimeTravelEngine,
    engine_lock: RwLock<()>,
}

impl Engine {
    /// Open (or create) a database and run crash recovery. On return the
    /// engine reflects every committed transaction and no aborted one.
    pub fn open(config: EngineConfig) -> Result<Self> {
        let data_dir = PathBuf::from(&config.data_dir);
        let db_dir = data_dir.join(&config.database);
        std::fs::create_dir_all(&db_dir)?;

        let disk = Arc::new(DiskManager::new(db_dir.join(&config.database))?);
        if let Some(key) = &config.encryption_key {
            disk.set_encryption_key(key);
        }

        let bpm = Arc::new(PartitionedBufferPool::new(
            config.buffer_pool_size,
            config.buffer_partitions,
            ReplacerPolicy::Lru,
            disk.clone(),
        )?);

        let log = LogManager::new(&data_dir)?;
        bpm.set_log_manager(log.clone());

        // Resume the LSN allocator past any recovered history before the
        // first append of this process.
        let mut max_lsn = INVALID_LSN;
        for stream in [crate::recovery::log_manager::SYSTEM_DB, config.database.as_str()] {
            if let Some(last) = log.read_records(stream, 0)?.last() {
                max_lsn = max_lsn.max(last.lsn);
            }
        }
        if max_lsn != INVALID_LSN {
            log.advance_next_lsn(max_lsn);
        }

        log.switch_database(&config.database)?;

        let catalog = Arc::new(Catalog::new(bpm.clone(), &db_dir)?);

        let checkpoint = CheckpointManager::new(
            bpm.clone(),
            log.clone(),
            data_dir.join("system").join("master_record"),
        )?;
        checkpoint.set_catalog(catalog.clone());
        checkpoint.set_operation_threshold(config.checkpoint_ops_threshold);

        let recovery = RecoveryManager::new(log.clone(), catalog.clone(), checkpoint.clone());
        recovery.recover(&config.database)?;

        let time_travel = TimeTravelEngine::new(
            log.clone(),
            catalog.clone(),
            bpm.clone(),
            checkpoint.clone(),
        );
        time_travel.set_reverse_delta_threshold(config.reverse_delta_threshold_us);

        let txns = TransactionManager::new(log.clone(), catalog.clone());

        // Operation-count checkpoint trigger, fed from every append. Weak so
        // the two managers do not keep each other alive.
        {
            let observer_target = Arc::downgrade(&checkpoint);
            log.set_ops_observer(Arc::new(move || {
                if let Some(checkpoint) = observer_target.upgrade() {
                    checkpoint.on_log_operation();
                }
            }));
        }
        checkpoint.start_background(config.checkpoint_interval_secs)?;

        info!(database = %config.database, "engine opened");
        Ok(Self {
            config,
            disk,
            bpm,
            log,
            checkpoint,
            catalog,
            txns,
            time_travel,
            engine_lock: RwLock::new(()),
        })
    }

    // ========================================================================
    // DDL
    // ========================================================================

    pub fn create_table(&self, name: &str, schema: Schema) -> Result<Arc<TableEntry>> {
        let _shared = self.engine_lock.read();
        if self.catalog.table(name).is_some() {
            return Err(DbError::AlreadyExists(format!("table {}", name)));
        }
        let mut record = LogRecord::ddl_table(LogRecordKind::CreateTable, 0, name);
        self.log.append(&mut record)?;
        let entry = self.catalog.create_table(name, schema)?;
        self.catalog.save()?;
        Ok(entry)
    }

    pub fn drop_table(&self, name: &str) -> Result<()> {
        let _shared = self.engine_lock.read();
        if self.catalog.table(name).is_none() {
            return Err(DbError::NotFound(format!("table {}", name)));
        }
        let mut record = LogRecord::ddl_table(LogRecordKind::DropTable, 0, name);
        self.log.append(&mut record)?;
        self.catalog.drop_table(name)?;
        self.catalog.save()
    }

    // ========================================================================
    // TRANSACTIONS & DML
    // ========================================================================

    pub fn begin(&self) -> Result<TxnHandle> {
        let _shared = self.engine_lock.read();
        self.txns.begin()
    }

    pub fn commit(&self, txn: &TxnHandle) -> Result<()> {
        let _shared = self.engine_lock.read();
        self.txns.commit(txn)
    }

    pub fn abort(&self, txn: &TxnHandle) -> Result<()> {
        let _shared = self.engine_lock.read();
        self.txns.abort(txn)
    }

    /// Insert a row: WAL first, then the heap, stamping the page with the
    /// record's LSN.
    pub fn insert(&self, txn: &TxnHandle, table: &str, row: Row) -> Result<()> {
        let _shared = self.engine_lock.read();
        let entry = self.table(table)?;
        let txn_id = txn.lock().id();

        let mut record = LogRecord::insert(txn_id, table, row.clone());
        let lsn = self.log.append(&mut record)?;
        entry.heap.insert_row(&row, lsn)?;

        txn.lock().record_modification(Modification {
            kind: ModificationKind::Insert,
            table: table.to_string(),
            old_row: None,
            new_row: Some(row),
            lsn,
        })
    }

    /// Update the first row equal to `old`. Returns whether a row matched.
    pub fn update(&self, txn: &TxnHandle, table: &str, old: Row, new: Row) -> Result<bool> {
        let _shared = self.engine_lock.read();
        let entry = self.table(table)?;
        let txn_id = txn.lock().id();

        let mut record = LogRecord::update(txn_id, table, old.clone(), new.clone());
        let lsn = self.log.append(&mut record)?;
        if !entry.heap.update_row(&old, &new, lsn)? {
            return Ok(false);
        }

        txn.lock().record_modification(Modification {
            kind: ModificationKind::Update,
            table: table.to_string(),
            old_row: Some(old),
            new_row: Some(new),
            lsn,
        })?;
        Ok(true)
    }

    /// Delete the first row equal to `row`. Returns whether a row matched.
    pub fn delete(&self, txn: &TxnHandle, table: &str, row: Row) -> Result<bool> {
        let _shared = self.engine_lock.read();
        let entry = self.table(table)?;
        let txn_id = txn.lock().id();

        let mut record = LogRecord::delete(LogRecordKind::MarkDelete, txn_id, table, row.clone());
        let lsn = self.log.append(&mut record)?;
        if !entry.heap.mark_delete(&row, lsn)? {
            return Ok(false);
        }

        txn.lock().record_modification(Modification {
            kind: ModificationKind::Delete,
            table: table.to_string(),
            old_row: Some(row),
            new_row: None,
            lsn,
        })?;
        Ok(true)
    }

    pub fn scan(&self, table: &str) -> Result<Vec<Row>> {
        let _shared = self.engine_lock.read();
        self.table(table)?.heap.scan()
    }

    // ========================================================================
    // CHECKPOINT & TIME TRAVEL
    // ========================================================================

    /// Explicit CHECKPOINT: exclusive over the engine.
    pub fn checkpoint(&self) -> Result<crate::common::Lsn> {
        let _exclusive = self.engine_lock.write();
        self.checkpoint.begin_checkpoint()
    }

    /// `SELECT ... AS OF`: read-only snapshot at a timestamp expression.
    pub fn snapshot_as_of(&self, table: &str, target: &str) -> Result<Vec<Row>> {
        let _shared = self.engine_lock.read();
        let target_time = parse_timestamp(target)?;
        let (heap, _result) =
            self.time_travel
                .build_snapshot(table, target_time, None, Strategy::Auto)?;
        Ok(heap.into_rows())
    }

    /// Snapshot at an exact microsecond timestamp with an explicit strategy.
    pub fn snapshot_at(
        &self,
        table: &str,
        target_time: crate::common::Timestamp,
        strategy: Strategy,
    ) -> Result<(Vec<Row>, TimeTravelResult)> {
        let _shared = self.engine_lock.read();
        let (heap, result) = self
            .time_travel
            .build_snapshot(table, target_time, None, strategy)?;
        Ok((heap.into_rows(), result))
    }

    /// `RECOVER TO` an exact microsecond timestamp.
    pub fn recover_to_timestamp(
        &self,
        target_time: crate::common::Timestamp,
    ) -> Result<TimeTravelResult> {
        let _exclusive = self.engine_lock.write();
        self.time_travel.recover_to(target_time, None)
    }

    /// `RECOVER TO`: revert the database to a past timestamp, or flush and
    /// no-op for `latest`.
    pub fn recover_to(&self, target: &str) -> Result<TimeTravelResult> {
        let _exclusive = self.engine_lock.write();

        if target.trim().eq_ignore_ascii_case("latest") {
            self.bpm.flush_all()?;
            self.log.flush(true)?;
            return Ok(TimeTravelResult {
                records_processed: 0,
                elapsed_ms: 0,
                strategy_used: Strategy::Auto,
            });
        }

        let target_time = parse_timestamp(target)?;
        self.time_travel.recover_to(target_time, None)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Stop the background workers, attempt a final checkpoint with a
    /// bounded wait, and flush everything down to disk.
    pub fn shutdown(&self) -> Result<()> {
        self.checkpoint.stop_background();
        self.txns.abort_all()?;

        // Final auto-save: never wait on it longer than the bound.
        let (tx, rx) = mpsc::channel();
        let checkpoint = self.checkpoint.clone();
        std::thread::spawn(move || {
            let _ = tx.send(checkpoint.begin_checkpoint());
        });
        match rx.recv_timeout(SHUTDOWN_CHECKPOINT_TIMEOUT) {
            Ok(Ok(lsn)) => info!(checkpoint_lsn = lsn, "shutdown checkpoint complete"),
            Ok(Err(e)) => warn!(error = %e, "shutdown checkpoint failed"),
            Err(_) => warn!("shutdown checkpoint timed out; proceeding"),
        }

        self.bpm.flush_all()?;
        self.log.stop()?;
        self.disk.shutdown()?;
        info!("engine shut down");
        Ok(())
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn buffer_pool(&self) -> &Arc<PartitionedBufferPool> {
        &self.bpm
    }

    pub fn checkpoint_manager(&self) -> &Arc<CheckpointManager> {
        &self.checkpoint
    }

    fn table(&self, name: &str) -> Result<Arc<TableEntry>> {
        self.catalog
            .table(name)
            .ok_or_else(|| DbError::NotFound(format!("table {}", name)))
    }
}
