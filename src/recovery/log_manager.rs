use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::buffer::LogSync;
use crate::common::{Lsn, TxnId, INVALID_LSN, LOG_BUFFER_SIZE, LOG_FLUSH_INTERVAL_MS};
use crate::error::{DbError, Result};
use crate::recovery::log_record::{ActiveTxnEntry, LogRecord, LogRecordKind};

/// Name of the stream that records database-level DDL.
pub const SYSTEM_DB: &str = "system";

const MAX_CONSECUTIVE_FLUSH_FAILURES: u32 = 10;

/// Per-transaction chain bookkeeping for the ARIES undo chain.
#[derive(Debug, Clone, Copy)]
struct TxnLogEntry {
    first_lsn: Lsn,
    last_lsn: Lsn,
}

/// State guarded by the append latch: the active buffer and the open stream.
struct LogState {
    buffer: Vec<u8>,
    buffer_end_lsn: Lsn,
    file: Option<File>,
    current_db: String,
    file_offset: u64,
}

/// Multi-stream write-ahead log manager.
///
/// Each database owns its own WAL file (`data/<db>/wal.log`); database-level
/// DDL goes to the system stream (`data/system/sys.log`). Appends land in an
/// in-memory buffer which a background worker drains to disk every ~30ms, or
/// sooner when the buffer grows large or a forced flush is requested. Data
/// mutations that name a table are additionally mirrored into a per-table
/// WAL file under `data/<db>/wal/<table>.wal` so time travel can scan one
/// table's history without reading the whole stream.
///
/// Lock order, where held together: write latch, then append latch (`state`),
/// then the transaction-table latch. Never the reverse.
pub struct LogManager {
    base_dir: PathBuf,
    next_lsn: AtomicI32,
    persistent_lsn: AtomicI32,
    state: Mutex<LogState>,
    flush_cv: Condvar,
    // Serializes buffer drains so file writes preserve LSN order.
    write_latch: Mutex<()>,
    txn_table: Mutex<HashMap<TxnId, TxnLogEntry>>,
    table_logs: Mutex<HashMap<String, File>>,
    stop_flush: AtomicBool,
    degraded: AtomicBool,
    flush_thread: Mutex<Option<JoinHandle<()>>>,
    ops_observer: RwLock<Option<Arc<dyn Fn() + Send + Sync>>>,
    self_ref: RwLock<Weak<LogManager>>,
}

impl LogManager {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(base_dir.join(SYSTEM_DB))?;

        let manager = Arc::new(Self {
            base_dir,
            next_lsn: AtomicI32::new(0),
            persistent_lsn: AtomicI32::new(INVALID_LSN),
            state: Mutex::new(LogState {
                buffer: Vec::with_capacity(LOG_BUFFER_SIZE),
                buffer_end_lsn: INVALID_LSN,
                file: None,
                current_db: SYSTEM_DB.to_string(),
                file_offset: 0,
            }),
            flush_cv: Condvar::new(),
            write_latch: Mutex::new(()),
            txn_table: Mutex::new(HashMap::new()),
            table_logs: Mutex::new(HashMap::new()),
            stop_flush: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            flush_thread: Mutex::new(None),
            ops_observer: RwLock::new(None),
            self_ref: RwLock::new(Weak::new()),
        });

        {
            let mut state = manager.state.lock();
            manager.open_stream_locked(&mut state, SYSTEM_DB)?;
        }
        *manager.self_ref.write() = Arc::downgrade(&manager);
        manager.spawn_flush_worker()?;
        info!(base_dir = %manager.base_dir.display(), "log manager initialized");
        Ok(manager)
    }

    // ========================================================================
    // CORE LOGGING API
    // ========================================================================

    /// Append a record to the active stream: assign its LSN, thread it onto
    /// its transaction's prev-LSN chain, buffer the bytes and mirror them to
    /// the per-table WAL when a table is named.
    pub fn append(&self, record: &mut LogRecord) -> Result<Lsn> {
        let buffer_is_large;
        {
            let mut state = self.state.lock();

            // The stream may have been closed by a database switch or a
            // reader; reopen in place and revive the flush worker if needed.
            if state.file.is_none() {
                let db = state.current_db.clone();
                self.open_stream_locked(&mut state, &db)?;
            }

            let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
            record.lsn = lsn;
            if record.db_name.is_empty() {
                record.db_name = state.current_db.clone();
            }

            {
                let mut txn_table = self.txn_table.lock();
                if let Some(entry) = txn_table.get_mut(&record.txn_id) {
                    record.prev_lsn = entry.last_lsn;
                    entry.last_lsn = lsn;
                    if entry.first_lsn == INVALID_LSN {
                        entry.first_lsn = lsn;
                    }
                }
            }

            let bytes = record.encode();
            record.size = bytes.len() as i32;
            state.buffer.extend_from_slice(&bytes);
            state.buffer_end_lsn = lsn;
            state.file_offset += bytes.len() as u64;

            if record.has_table() && record.kind.is_data_mutation() {
                self.append_to_table_log(&record.db_name, &record.table_name, &bytes)?;
            }

            buffer_is_large = state.buffer.len() >= LOG_BUFFER_SIZE;
        }

        if buffer_is_large {
            self.flush_cv.notify_one();
        }
        if self.stop_flush.load(Ordering::SeqCst) {
            self.restart_flush_worker()?;
        }

        let observer = self.ops_observer.read().clone();
        if let Some(observer) = observer {
            observer();
        }

        Ok(record.lsn)
    }

    /// Flush the buffer. `force` drains synchronously; otherwise the flush
    /// worker is nudged and the call returns immediately.
    pub fn flush(&self, force: bool) -> Result<()> {
        if force {
            self.sync_drain()
        } else {
            self.flush_cv.notify_one();
            Ok(())
        }
    }

    /// Block until the log is durable at least up to `target`. This is the
    /// WAL-rule entry point used before any data page write.
    pub fn flush_to_lsn(&self, target: Lsn) -> Result<()> {
        if target == INVALID_LSN || self.persistent_lsn() >= target {
            return Ok(());
        }
        self.sync_drain()?;
        if self.persistent_lsn() < target {
            // The target was never appended to this stream.
            return Err(DbError::LsnGap(target));
        }
        Ok(())
    }

    pub fn persistent_lsn(&self) -> Lsn {
        self.persistent_lsn.load(Ordering::SeqCst)
    }

    /// The next LSN that will be assigned.
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst)
    }

    /// Move the LSN allocator past `beyond`, used after scanning an existing
    /// log on startup so fresh records sort after the recovered history.
    /// `beyond` was read from disk, so the durability watermark advances
    /// with it: pages stamped with recovered LSNs must remain flushable.
    pub fn advance_next_lsn(&self, beyond: Lsn) {
        self.next_lsn.fetch_max(beyond + 1, Ordering::SeqCst);
        self.persistent_lsn.fetch_max(beyond, Ordering::SeqCst);
    }

    /// Byte offset appends will land at in the active stream.
    pub fn current_offset(&self) -> u64 {
        self.state.lock().file_offset
    }

    pub fn current_database(&self) -> String {
        self.state.lock().current_db.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Register the callback invoked after every append; the checkpoint
    /// manager uses it for its operation-count trigger.
    pub fn set_ops_observer(&self, observer: Arc<dyn Fn() + Send + Sync>) {
        *self.ops_observer.write() = Some(observer);
    }

    // ========================================================================
    // MULTI-DATABASE MANAGEMENT
    // ========================================================================

    /// Switch the active stream: drain and close the current file, open the
    /// target database's file and record the switch in the new stream.
    pub fn switch_database(&self, db: &str) -> Result<()> {
        {
            let _write = self.write_latch.lock();
            let mut state = self.state.lock();
            if state.current_db == db {
                return Ok(());
            }
            info!(from = %state.current_db, to = db, "switching log stream");
            self.drain_locked(&mut state)?;
            state.file = None;
            state.current_db = db.to_string();
            self.open_stream_locked(&mut state, db)?;
        }

        let mut record = LogRecord::ddl_db(LogRecordKind::SwitchDb, db);
        self.append(&mut record)?;
        Ok(())
    }

    /// Create the directory and stream for a new database and record the DDL
    /// in the system stream.
    pub fn create_database_log(&self, db: &str) -> Result<()> {
        std::fs::create_dir_all(self.base_dir.join(db))?;
        if self.current_database() != SYSTEM_DB {
            self.switch_database(SYSTEM_DB)?;
        }
        let mut record = LogRecord::ddl_db(LogRecordKind::CreateDb, db);
        self.append(&mut record)?;
        self.flush(true)
    }

    /// Record a DROP_DB in the system stream and remove the database's log
    /// directory.
    pub fn drop_database_log(&self, db: &str) -> Result<()> {
        if self.current_database() == db {
            self.switch_database(SYSTEM_DB)?;
        }
        let mut record = LogRecord::ddl_db(LogRecordKind::DropDb, db);
        self.append(&mut record)?;
        self.flush(true)?;

        let prefix = format!("{}/", db);
        self.table_logs.lock().retain(|key, _| !key.starts_with(&prefix));
        let db_dir = self.base_dir.join(db);
        if let Err(e) = std::fs::remove_dir_all(&db_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %db_dir.display(), error = %e, "failed to remove database directory");
            }
        }
        Ok(())
    }

    // ========================================================================
    // TRANSACTION TRACKING
    // ========================================================================

    /// Start tracking a transaction's LSN chain. Call before appending its
    /// BEGIN record so the chain terminates there.
    pub fn begin_transaction(&self, txn_id: TxnId) {
        self.txn_table.lock().insert(
            txn_id,
            TxnLogEntry {
                first_lsn: INVALID_LSN,
                last_lsn: INVALID_LSN,
            },
        );
    }

    /// Drop a committed transaction from the table, after its COMMIT record
    /// has been durably flushed.
    pub fn commit_transaction(&self, txn_id: TxnId) {
        self.txn_table.lock().remove(&txn_id);
    }

    pub fn abort_transaction(&self, txn_id: TxnId) {
        self.txn_table.lock().remove(&txn_id);
    }

    pub fn transaction_last_lsn(&self, txn_id: TxnId) -> Lsn {
        self.txn_table
            .lock()
            .get(&txn_id)
            .map(|e| e.last_lsn)
            .unwrap_or(INVALID_LSN)
    }

    /// Snapshot of the not-yet-committed transactions; the ATT half of a
    /// checkpoint record.
    pub fn active_transactions(&self) -> Vec<ActiveTxnEntry> {
        let mut entries: Vec<ActiveTxnEntry> = self
            .txn_table
            .lock()
            .iter()
            .map(|(&txn_id, entry)| ActiveTxnEntry {
                txn_id,
                last_lsn: entry.last_lsn,
                first_lsn: entry.first_lsn,
            })
            .collect();
        entries.sort_by_key(|e| e.txn_id);
        entries
    }

    // ========================================================================
    // FILE LAYOUT & SCANNING
    // ========================================================================

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn log_file_path(&self, db: &str) -> PathBuf {
        if db == SYSTEM_DB {
            self.base_dir.join(SYSTEM_DB).join("sys.log")
        } else {
            self.base_dir.join(db).join("wal.log")
        }
    }

    pub fn table_log_path(&self, db: &str, table: &str) -> PathBuf {
        self.base_dir
            .join(db)
            .join("wal")
            .join(format!("{}.wal", table))
    }

    pub fn has_table_log(&self, db: &str, table: &str) -> bool {
        self.table_log_path(db, table).exists()
    }

    /// Decode all records of one stream starting at `from_offset`. A torn
    /// tail (short or crc-invalid final record) ends the scan; an unknown
    /// kind inside the stream is an error.
    pub fn read_log_file(path: &Path, from_offset: u64) -> Result<Vec<LogRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(path)?;
        let mut pos = (from_offset as usize).min(bytes.len());
        let mut records = Vec::new();
        while pos < bytes.len() {
            match LogRecord::decode(&bytes[pos..]) {
                Ok((record, used)) => {
                    pos += used;
                    records.push(record);
                }
                Err(DbError::ShortRead(_)) | Err(DbError::Serialization(_)) => {
                    debug!(path = %path.display(), offset = pos, "stopping scan at torn tail");
                    break;
                }
                Err(DbError::ChecksumMismatch(_)) => {
                    warn!(path = %path.display(), offset = pos, "crc mismatch; truncating scan");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    /// Records of a database's main stream.
    pub fn read_records(&self, db: &str, from_offset: u64) -> Result<Vec<LogRecord>> {
        Self::read_log_file(&self.log_file_path(db), from_offset)
    }

    /// Records touching one table. Prefers the per-table mirror and falls
    /// back to filtering the main stream.
    pub fn table_records(&self, db: &str, table: &str) -> Result<Vec<LogRecord>> {
        if self.has_table_log(db, table) {
            return Self::read_log_file(&self.table_log_path(db, table), 0);
        }
        Ok(self
            .read_records(db, 0)?
            .into_iter()
            .filter(|r| r.table_name == table)
            .collect())
    }

    /// Check the per-table mirror against the main stream. The mirror must
    /// be the table-filtered subsequence of the main stream; when it is not,
    /// the main stream wins and the mirror is rebuilt from it.
    pub fn validate_table_log(&self, db: &str, table: &str) -> Result<()> {
        if !self.has_table_log(db, table) {
            return Ok(());
        }
        let main: Vec<LogRecord> = self
            .read_records(db, 0)?
            .into_iter()
            .filter(|r| r.table_name == table)
            .collect();
        let mirror = Self::read_log_file(&self.table_log_path(db, table), 0)?;

        let main_lsns: Vec<Lsn> = main.iter().map(|r| r.lsn).collect();
        let mirror_lsns: Vec<Lsn> = mirror.iter().map(|r| r.lsn).collect();
        if main_lsns == mirror_lsns {
            return Ok(());
        }

        warn!(db, table, "per-table WAL diverged from main stream; rebuilding");
        let mut table_logs = self.table_logs.lock();
        table_logs.remove(&format!("{}/{}", db, table));
        let path = self.table_log_path(db, table);
        let mut bytes = Vec::new();
        for record in &main {
            bytes.extend_from_slice(&record.encode());
        }
        std::fs::write(&path, bytes)?;
        Ok(())
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Stop the flush worker, drain what remains and close the stream.
    pub fn stop(&self) -> Result<()> {
        self.stop_flush.store(true, Ordering::SeqCst);
        self.flush_cv.notify_all();
        if let Some(handle) = self.flush_thread.lock().take() {
            let _ = handle.join();
        }
        self.sync_drain()?;
        {
            let _write = self.write_latch.lock();
            let mut state = self.state.lock();
            state.file = None;
        }
        info!("log manager stopped");
        Ok(())
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn spawn_flush_worker(self: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("wal-flush".to_string())
            .spawn(move || Self::flush_loop(weak))
            .map_err(DbError::Io)?;
        *self.flush_thread.lock() = Some(handle);
        Ok(())
    }

    fn restart_flush_worker(&self) -> Result<()> {
        if let Some(me) = self.self_ref.read().upgrade() {
            if let Some(old) = me.flush_thread.lock().take() {
                let _ = old.join();
            }
            me.stop_flush.store(false, Ordering::SeqCst);
            me.degraded.store(false, Ordering::SeqCst);
            me.spawn_flush_worker()?;
        }
        Ok(())
    }

    /// Background drain loop: wake every interval or on signal, write the
    /// buffered records out, and retry on I/O failure. Ten consecutive
    /// failures stop the worker and mark the manager degraded.
    ///
    /// The worker holds only a weak handle between iterations so it dies
    /// with the manager instead of keeping it alive.
    fn flush_loop(weak: Weak<LogManager>) {
        info!("log flush worker started");
        let mut consecutive_failures = 0u32;
        loop {
            let me = match weak.upgrade() {
                Some(me) => me,
                None => break,
            };
            {
                let mut state = me.state.lock();
                if !me.stop_flush.load(Ordering::SeqCst) && state.buffer.is_empty() {
                    me.flush_cv
                        .wait_for(&mut state, Duration::from_millis(LOG_FLUSH_INTERVAL_MS));
                }
            }
            if me.stop_flush.load(Ordering::SeqCst) {
                break;
            }
            match me.sync_drain() {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(error = %e, attempt = consecutive_failures, "log flush failed; retrying");
                    if consecutive_failures >= MAX_CONSECUTIVE_FLUSH_FAILURES {
                        error!("log flush worker entering degraded mode");
                        me.degraded.store(true, Ordering::SeqCst);
                        me.stop_flush.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
        info!("log flush worker stopped");
    }

    /// Swap the active buffer out and write it under the write latch, so the
    /// append latch is released during the disk write and drains stay in LSN
    /// order. On failure the chunk is spliced back in front of the buffer.
    fn sync_drain(&self) -> Result<()> {
        let _write = self.write_latch.lock();
        let (chunk, end_lsn, file) = {
            let mut state = self.state.lock();
            if state.buffer.is_empty() {
                return Ok(());
            }
            let file = match &state.file {
                Some(file) => file.try_clone()?,
                None => return Ok(()),
            };
            (
                std::mem::take(&mut state.buffer),
                state.buffer_end_lsn,
                file,
            )
        };

        let result = Self::write_chunk(file, &chunk);
        match result {
            Ok(()) => {
                self.persistent_lsn.fetch_max(end_lsn, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                // Put the unwritten bytes back ahead of anything appended
                // meanwhile, preserving LSN order for the retry.
                let mut state = self.state.lock();
                let mut restored = chunk;
                restored.extend_from_slice(&state.buffer);
                state.buffer = restored;
                Err(e)
            }
        }
    }

    fn write_chunk(mut file: File, chunk: &[u8]) -> Result<()> {
        file.write_all(chunk)?;
        file.sync_all()?;
        Ok(())
    }

    /// Drain the buffer inline while both latches are already held.
    fn drain_locked(&self, state: &mut LogState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        if let Some(file) = &mut state.file {
            file.write_all(&state.buffer)?;
            file.sync_all()?;
            self.persistent_lsn
                .fetch_max(state.buffer_end_lsn, Ordering::SeqCst);
        }
        state.buffer.clear();
        Ok(())
    }

    fn open_stream_locked(&self, state: &mut LogState, db: &str) -> Result<()> {
        let path = self.log_file_path(db);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        state.file_offset = file.metadata()?.len();
        state.file = Some(file);
        debug!(path = %path.display(), offset = state.file_offset, "opened log stream");
        Ok(())
    }

    /// Mirror serialized record bytes into the per-table WAL. Called under
    /// the append latch.
    fn append_to_table_log(&self, db: &str, table: &str, bytes: &[u8]) -> Result<()> {
        let key = format!("{}/{}", db, table);
        let mut table_logs = self.table_logs.lock();
        if !table_logs.contains_key(&key) {
            let path = self.table_log_path(db, table);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            table_logs.insert(key.clone(), file);
        }
        if let Some(file) = table_logs.get_mut(&key) {
            file.write_all(bytes)?;
        }
        Ok(())
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        // Signal only; `stop` joins. Joining here could deadlock when the
        // worker itself drops the last strong reference.
        self.stop_flush.store(true, Ordering::SeqCst);
        self.flush_cv.notify_all();
    }
}

impl LogSync for LogManager {
    fn flush_to_lsn(&self, lsn: Lsn) -> Result<()> {
        LogManager::flush_to_lsn(self, lsn)
    }

    fn flush(&self) -> Result<()> {
        LogManager::flush(self, true)
    }

    fn persistent_lsn(&self) -> Lsn {
        LogManager::persistent_lsn(self)
    }
}
