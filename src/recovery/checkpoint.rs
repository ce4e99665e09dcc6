use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{info, warn};

use crate::buffer::PartitionedBufferPool;
use crate::catalog::Catalog;
use crate::common::{Lsn, Timestamp, INVALID_LSN};
use crate::error::{DbError, Result};
use crate::recovery::log_manager::LogManager;
use crate::recovery::log_record::{DirtyPageEntry, LogRecord};

/// The master record points recovery at the last durable checkpoint.
/// On disk: `[version:u32][checkpoint_lsn:i32][offset:u64][timestamp:u64]`,
/// updated atomically by writing a temp file and renaming over the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterRecord {
    pub version: u32,
    pub checkpoint_lsn: Lsn,
    pub checkpoint_offset: u64,
    pub timestamp: Timestamp,
}

impl MasterRecord {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u32_le(self.version);
        buf.put_i32_le(self.checkpoint_lsn);
        buf.put_u64_le(self.checkpoint_offset);
        buf.put_u64_le(self.timestamp);
        buf.to_vec()
    }

    pub fn decode(input: &[u8]) -> Result<Self> {
        if input.len() < 24 {
            return Err(DbError::ShortRead(format!(
                "master record of {} bytes",
                input.len()
            )));
        }
        let mut buf = input;
        let record = Self {
            version: buf.get_u32_le(),
            checkpoint_lsn: buf.get_i32_le(),
            checkpoint_offset: buf.get_u64_le(),
            timestamp: buf.get_u64_le(),
        };
        if record.version > Self::CURRENT_VERSION {
            warn!(
                version = record.version,
                "master record written by a newer engine version"
            );
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CheckpointState {
    offset: u64,
    timestamp: Timestamp,
}

/// Fuzzy ARIES checkpointing.
///
/// `begin_checkpoint` walks the classic sequence: CHECKPOINT_BEGIN, ATT and
/// DPT capture, a full buffer-pool flush, CHECKPOINT_END carrying both
/// tables, a forced log flush, the atomic master-record update, and finally
/// checkpoint-LSN tagging of every catalog table followed by a catalog save.
///
/// Checkpoints fire three ways: the explicit call, a background thread on a
/// configurable interval, and an appended-record counter the log manager
/// feeds through a callback.
pub struct CheckpointManager {
    bpm: Arc<PartitionedBufferPool>,
    log: Arc<LogManager>,
    catalog: RwLock<Option<Arc<Catalog>>>,
    master_path: PathBuf,
    state: Mutex<CheckpointState>,
    checkpoint_count: AtomicU64,
    interval_secs: AtomicU64,
    ops_threshold: AtomicU32,
    ops_since: AtomicU32,
    // Pending-trigger flag for the background thread.
    bg_pending: Mutex<bool>,
    bg_cv: Condvar,
    bg_enabled: AtomicBool,
    bg_stop: AtomicBool,
    bg_thread: Mutex<Option<JoinHandle<()>>>,
    self_ref: RwLock<Weak<CheckpointManager>>,
}

impl CheckpointManager {
    pub fn new(
        bpm: Arc<PartitionedBufferPool>,
        log: Arc<LogManager>,
        master_path: impl AsRef<Path>,
    ) -> Result<Arc<Self>> {
        let master_path = master_path.as_ref().to_path_buf();
        if let Some(parent) = master_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = Arc::new(Self {
            bpm,
            log,
            catalog: RwLock::new(None),
            master_path,
            state: Mutex::new(CheckpointState::default()),
            checkpoint_count: AtomicU64::new(0),
            interval_secs: AtomicU64::new(crate::common::CHECKPOINT_INTERVAL_SECS),
            ops_threshold: AtomicU32::new(crate::common::CHECKPOINT_OPS_THRESHOLD),
            ops_since: AtomicU32::new(0),
            bg_pending: Mutex::new(false),
            bg_cv: Condvar::new(),
            bg_enabled: AtomicBool::new(false),
            bg_stop: AtomicBool::new(false),
            bg_thread: Mutex::new(None),
            self_ref: RwLock::new(Weak::new()),
        });
        *manager.self_ref.write() = Arc::downgrade(&manager);
        Ok(manager)
    }

    /// Late-bound catalog handle for checkpoint-LSN tagging.
    pub fn set_catalog(&self, catalog: Arc<Catalog>) {
        *self.catalog.write() = Some(catalog);
    }

    // ========================================================================
    // CORE CHECKPOINTING
    // ========================================================================

    /// Run one fuzzy checkpoint. Returns the LSN of its CHECKPOINT_END.
    pub fn begin_checkpoint(&self) -> Result<Lsn> {
        let mut state = self.state.lock();
        info!(
            number = self.checkpoint_count.load(Ordering::SeqCst) + 1,
            "starting checkpoint"
        );

        let mut begin = LogRecord::checkpoint_begin();
        self.log.append(&mut begin)?;

        let active_txns = self.log.active_transactions();
        let dirty_pages: Vec<DirtyPageEntry> = self
            .bpm
            .dirty_pages()
            .into_iter()
            .map(|(page_id, recovery_lsn)| DirtyPageEntry {
                page_id,
                recovery_lsn,
            })
            .collect();

        self.bpm.flush_all()?;

        let offset = self.log.current_offset();

        let mut end = LogRecord::checkpoint_end(active_txns, dirty_pages);
        let checkpoint_lsn = self.log.append(&mut end)?;
        let timestamp = end.timestamp;

        self.log.flush(true)?;

        self.write_master_record(checkpoint_lsn, offset, timestamp)?;
        state.offset = offset;
        state.timestamp = timestamp;

        if let Some(catalog) = self.catalog.read().clone() {
            catalog.set_all_checkpoint_lsns(checkpoint_lsn);
            catalog.save()?;
        } else {
            warn!("no catalog attached; table checkpoint LSNs not updated");
        }

        self.checkpoint_count.fetch_add(1, Ordering::SeqCst);
        info!(
            checkpoint_lsn,
            offset, "checkpoint complete"
        );
        Ok(checkpoint_lsn)
    }

    // ========================================================================
    // RECOVERY API
    // ========================================================================

    /// Read the master record from disk, or `None` when no checkpoint has
    /// ever completed.
    pub fn master_record(&self) -> Result<Option<MasterRecord>> {
        if !self.master_path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.master_path)?;
        let record = MasterRecord::decode(&bytes)?;
        let mut state = self.state.lock();
        state.offset = record.checkpoint_offset;
        state.timestamp = record.timestamp;
        Ok(Some(record))
    }

    pub fn last_checkpoint_lsn(&self) -> Lsn {
        match self.master_record() {
            Ok(Some(record)) => record.checkpoint_lsn,
            _ => INVALID_LSN,
        }
    }

    pub fn checkpoint_offset(&self) -> u64 {
        self.state.lock().offset
    }

    pub fn last_checkpoint_timestamp(&self) -> Timestamp {
        self.state.lock().timestamp
    }

    pub fn checkpoint_count(&self) -> u64 {
        self.checkpoint_count.load(Ordering::SeqCst)
    }

    // ========================================================================
    // TRIGGERS
    // ========================================================================

    /// Appended-record trigger, invoked by the log manager after every
    /// append. Crossing the threshold wakes the background thread rather
    /// than checkpointing on the writer's thread.
    pub fn on_log_operation(&self) {
        let threshold = self.ops_threshold.load(Ordering::SeqCst);
        if threshold == 0 {
            return;
        }
        let count = self.ops_since.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= threshold {
            self.ops_since.store(0, Ordering::SeqCst);
            if self.bg_enabled.load(Ordering::SeqCst) {
                *self.bg_pending.lock() = true;
                self.bg_cv.notify_one();
            }
        }
    }

    pub fn set_operation_threshold(&self, threshold: u32) {
        self.ops_threshold.store(threshold, Ordering::SeqCst);
    }

    pub fn operation_threshold(&self) -> u32 {
        self.ops_threshold.load(Ordering::SeqCst)
    }

    pub fn set_checkpoint_interval(&self, secs: u64) {
        self.interval_secs.store(secs, Ordering::SeqCst);
    }

    pub fn start_background(&self, interval_secs: u64) -> Result<()> {
        if self.bg_enabled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.interval_secs.store(interval_secs, Ordering::SeqCst);
        self.bg_stop.store(false, Ordering::SeqCst);

        let weak = self.self_ref.read().clone();
        let handle = std::thread::Builder::new()
            .name("checkpointer".to_string())
            .spawn(move || Self::background_loop(weak))
            .map_err(DbError::Io)?;
        *self.bg_thread.lock() = Some(handle);
        info!(interval_secs, "background checkpointing started");
        Ok(())
    }

    pub fn stop_background(&self) {
        if !self.bg_enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        self.bg_stop.store(true, Ordering::SeqCst);
        self.bg_cv.notify_all();
        if let Some(handle) = self.bg_thread.lock().take() {
            let _ = handle.join();
        }
        info!("background checkpointing stopped");
    }

    pub fn is_background_enabled(&self) -> bool {
        self.bg_enabled.load(Ordering::SeqCst)
    }

    /// Holds only a weak handle between iterations so the worker dies with
    /// the manager.
    fn background_loop(weak: Weak<CheckpointManager>) {
        info!("checkpoint worker started");
        loop {
            let me = match weak.upgrade() {
                Some(me) => me,
                None => break,
            };
            {
                let mut pending = me.bg_pending.lock();
                if !*pending && !me.bg_stop.load(Ordering::SeqCst) {
                    let interval = me.interval_secs.load(Ordering::SeqCst);
                    me.bg_cv
                        .wait_for(&mut pending, Duration::from_secs(interval.max(1)));
                }
                if me.bg_stop.load(Ordering::SeqCst) {
                    break;
                }
                *pending = false;
            }
            if let Err(e) = me.begin_checkpoint() {
                warn!(error = %e, "background checkpoint failed");
            }
        }
        info!("checkpoint worker stopped");
    }

    // ========================================================================
    // MASTER RECORD
    // ========================================================================

    fn write_master_record(&self, checkpoint_lsn: Lsn, offset: u64, timestamp: Timestamp) -> Result<()> {
        let record = MasterRecord {
            version: MasterRecord::CURRENT_VERSION,
            checkpoint_lsn,
            checkpoint_offset: offset,
            timestamp,
        };

        let tmp_path = self.master_path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&record.encode())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.master_path)?;
        Ok(())
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        // Signal only; `stop_background` joins.
        self.bg_stop.store(true, Ordering::SeqCst);
        self.bg_cv.notify_all();
    }
}
