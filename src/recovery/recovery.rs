use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::catalog::{Catalog, Schema};
use crate::common::{Lsn, TxnId, INVALID_LSN};
use crate::error::Result;
use crate::recovery::checkpoint::CheckpointManager;
use crate::recovery::log_manager::LogManager;
use crate::recovery::log_record::{LogRecord, LogRecordKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveredTxnState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryStats {
    pub records_scanned: usize,
    pub records_redone: usize,
    pub records_undone: usize,
    pub transactions_rolled_back: usize,
}

/// Crash recovery: redo history from the last checkpoint, then roll back
/// every transaction that never reached COMMIT or ABORT.
///
/// Redo is logical: records replay into the live heaps, and a per-table
/// watermark (the highest page LSN already on disk) keeps replay from
/// double-applying effects that reached their pages before the crash. Undo
/// walks each loser transaction's records newest-first, applies the inverse
/// operation and writes a CLR per step, then closes the transaction with an
/// ABORT record. Running recovery twice yields the same state.
pub struct RecoveryManager {
    log: Arc<LogManager>,
    catalog: Arc<Catalog>,
    checkpoint: Arc<CheckpointManager>,
}

impl RecoveryManager {
    pub fn new(
        log: Arc<LogManager>,
        catalog: Arc<Catalog>,
        checkpoint: Arc<CheckpointManager>,
    ) -> Self {
        Self {
            log,
            catalog,
            checkpoint,
        }
    }

    /// Run crash recovery for one database stream.
    pub fn recover(&self, db: &str) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();

        let master = self.checkpoint.master_record()?;
        let offset = master.map(|m| m.checkpoint_offset).unwrap_or(0);
        let records = self.log.read_records(db, offset)?;

        if records.is_empty() && master.is_none() {
            info!(db, "no log history; nothing to recover");
            return Ok(stats);
        }
        info!(db, offset, records = records.len(), "recovery started");

        // Loser detection: seed with the checkpoint ATT, then track
        // lifecycle records seen during the scan.
        let mut txn_states: HashMap<TxnId, RecoveredTxnState> = HashMap::new();
        let mut max_lsn = master.map(|m| m.checkpoint_lsn).unwrap_or(INVALID_LSN);
        for record in &records {
            stats.records_scanned += 1;
            max_lsn = max_lsn.max(record.lsn);
            match record.kind {
                LogRecordKind::Begin => {
                    txn_states.insert(record.txn_id, RecoveredTxnState::Active);
                }
                LogRecordKind::Commit => {
                    txn_states.insert(record.txn_id, RecoveredTxnState::Committed);
                }
                LogRecordKind::Abort => {
                    txn_states.insert(record.txn_id, RecoveredTxnState::Aborted);
                }
                LogRecordKind::CheckpointEnd => {
                    for entry in &record.active_txns {
                        txn_states
                            .entry(entry.txn_id)
                            .or_insert(RecoveredTxnState::Active);
                    }
                }
                _ => {
                    if record.kind.is_data_mutation() {
                        txn_states
                            .entry(record.txn_id)
                            .or_insert(RecoveredTxnState::Active);
                    }
                }
            }
        }

        // New appends (CLRs, ABORTs) must sort after everything recovered.
        self.log.advance_next_lsn(max_lsn);

        // Redo history. The watermark skips records whose effects already
        // reached the table's pages before the crash.
        let mut watermarks: HashMap<String, Lsn> = HashMap::new();
        for record in &records {
            if !record.kind.is_data_mutation() && !matches!(
                record.kind,
                LogRecordKind::CreateTable | LogRecordKind::DropTable
            ) {
                continue;
            }
            let redone = self.redo_record(record, &mut watermarks)?;
            if redone {
                stats.records_redone += 1;
            }
        }

        // Undo losers (no terminal record), and re-apply the undo of
        // transactions whose ABORT is in the log: their CLR effects may not
        // have reached the pages before the crash.
        let losers: Vec<TxnId> = txn_states
            .iter()
            .filter(|(_, &state)| state == RecoveredTxnState::Active)
            .map(|(&txn_id, _)| txn_id)
            .collect();
        let aborted: Vec<TxnId> = txn_states
            .iter()
            .filter(|(_, &state)| state == RecoveredTxnState::Aborted)
            .map(|(&txn_id, _)| txn_id)
            .collect();

        if !losers.is_empty() || !aborted.is_empty() {
            // These transactions may have records before the checkpoint
            // offset; undo works over the full stream.
            let full = if offset > 0 {
                self.log.read_records(db, 0)?
            } else {
                records
            };
            for txn_id in losers {
                let undone = self.undo_transaction(txn_id, &full)?;
                stats.records_undone += undone;
                stats.transactions_rolled_back += 1;
            }
            for txn_id in aborted {
                self.repair_aborted(txn_id, &full, max_lsn)?;
            }
            self.log.flush(true)?;
        }

        // The mirrors may trail or outrun the main stream after a crash.
        for table in self.catalog.table_names() {
            self.log.validate_table_log(db, &table)?;
        }

        info!(
            scanned = stats.records_scanned,
            redone = stats.records_redone,
            undone = stats.records_undone,
            rolled_back = stats.transactions_rolled_back,
            "recovery complete"
        );
        Ok(stats)
    }

    fn redo_record(
        &self,
        record: &LogRecord,
        watermarks: &mut HashMap<String, Lsn>,
    ) -> Result<bool> {
        match record.kind {
            LogRecordKind::CreateTable => {
                if self.catalog.table(&record.table_name).is_none() {
                    self.catalog
                        .create_table(&record.table_name, Schema::default())?;
                }
                return Ok(true);
            }
            LogRecordKind::DropTable => {
                if self.catalog.table(&record.table_name).is_some() {
                    self.catalog.drop_table(&record.table_name)?;
                }
                return Ok(true);
            }
            _ => {}
        }

        let entry = match self.catalog.table(&record.table_name) {
            Some(entry) => entry,
            None => {
                warn!(table = %record.table_name, lsn = record.lsn, "redo for unknown table");
                return Ok(false);
            }
        };

        let watermark = match watermarks.get(&record.table_name) {
            Some(&lsn) => lsn,
            None => {
                let lsn = entry.heap.max_page_lsn()?;
                watermarks.insert(record.table_name.clone(), lsn);
                lsn
            }
        };
        if record.lsn <= watermark {
            return Ok(false);
        }

        match record.kind {
            LogRecordKind::Insert => {
                if let Some(new_row) = &record.new_value {
                    entry.heap.insert_row(new_row, record.lsn)?;
                }
            }
            LogRecordKind::Update => {
                if let (Some(old_row), Some(new_row)) = (&record.old_value, &record.new_value) {
                    entry.heap.update_row(old_row, new_row, record.lsn)?;
                }
            }
            LogRecordKind::MarkDelete | LogRecordKind::ApplyDelete => {
                if let Some(old_row) = &record.old_value {
                    entry.heap.mark_delete(old_row, record.lsn)?;
                }
            }
            LogRecordKind::RollbackDelete => {
                if let Some(old_row) = &record.old_value {
                    entry.heap.insert_row(old_row, record.lsn)?;
                }
            }
            // CLRs describe undo steps that the undo pass re-derives; they
            // are markers here.
            LogRecordKind::Clr => return Ok(false),
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Roll back one loser: walk its records newest-first, apply inverses
    /// and write a CLR per step, then close it with an ABORT record.
    fn undo_transaction(&self, txn_id: TxnId, records: &[LogRecord]) -> Result<usize> {
        let mut own: Vec<&LogRecord> = records
            .iter()
            .filter(|r| r.txn_id == txn_id && r.kind.is_data_mutation() && r.kind != LogRecordKind::Clr)
            .collect();
        own.sort_by_key(|r| std::cmp::Reverse(r.lsn));

        let mut undone = 0;
        for record in own {
            let entry = match self.catalog.table(&record.table_name) {
                Some(entry) => entry,
                None => continue,
            };

            match record.kind {
                LogRecordKind::Insert => {
                    if let Some(new_row) = &record.new_value {
                        let mut clr =
                            LogRecord::clr(txn_id, &record.table_name, new_row.clone(), record.prev_lsn);
                        let clr_lsn = self.log.append(&mut clr)?;
                        entry.heap.mark_delete(new_row, clr_lsn)?;
                    }
                }
                LogRecordKind::Update => {
                    if let (Some(old_row), Some(new_row)) =
                        (&record.old_value, &record.new_value)
                    {
                        let mut clr =
                            LogRecord::clr(txn_id, &record.table_name, old_row.clone(), record.prev_lsn);
                        let clr_lsn = self.log.append(&mut clr)?;
                        entry.heap.update_row(new_row, old_row, clr_lsn)?;
                    }
                }
                LogRecordKind::MarkDelete | LogRecordKind::ApplyDelete => {
                    if let Some(old_row) = &record.old_value {
                        let mut clr =
                            LogRecord::clr(txn_id, &record.table_name, old_row.clone(), record.prev_lsn);
                        let clr_lsn = self.log.append(&mut clr)?;
                        entry.heap.insert_row(old_row, clr_lsn)?;
                    }
                }
                LogRecordKind::RollbackDelete => {
                    if let Some(old_row) = &record.old_value {
                        let mut clr =
                            LogRecord::clr(txn_id, &record.table_name, old_row.clone(), record.prev_lsn);
                        let clr_lsn = self.log.append(&mut clr)?;
                        entry.heap.mark_delete(old_row, clr_lsn)?;
                    }
                }
                _ => continue,
            }
            undone += 1;
        }

        let mut abort = LogRecord::lifecycle(txn_id, LogRecordKind::Abort);
        self.log.append(&mut abort)?;
        self.log.abort_transaction(txn_id);
        Ok(undone)
    }

    /// Re-apply an already-logged rollback without writing new CLRs. Every
    /// step checks the current state first, so repeating it is a no-op.
    fn repair_aborted(&self, txn_id: TxnId, records: &[LogRecord], stamp: Lsn) -> Result<()> {
        let mut own: Vec<&LogRecord> = records
            .iter()
            .filter(|r| {
                r.txn_id == txn_id
                    && r.kind.is_data_mutation()
                    && r.kind != LogRecordKind::Clr
            })
            .collect();
        own.sort_by_key(|r| std::cmp::Reverse(r.lsn));

        for record in own {
            let entry = match self.catalog.table(&record.table_name) {
                Some(entry) => entry,
                None => continue,
            };
            match record.kind {
                LogRecordKind::Insert | LogRecordKind::RollbackDelete => {
                    let row = record
                        .new_value
                        .as_ref()
                        .or(record.old_value.as_ref());
                    if let Some(row) = row {
                        entry.heap.mark_delete(row, stamp)?;
                    }
                }
                LogRecordKind::Update => {
                    if let (Some(old_row), Some(new_row)) =
                        (&record.old_value, &record.new_value)
                    {
                        entry.heap.update_row(new_row, old_row, stamp)?;
                    }
                }
                LogRecordKind::MarkDelete | LogRecordKind::ApplyDelete => {
                    if let Some(old_row) = &record.old_value {
                        if !entry.heap.contains(old_row)? {
                            entry.heap.insert_row(old_row, stamp)?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}
