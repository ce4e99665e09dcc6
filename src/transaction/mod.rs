use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::catalog::Catalog;
use crate::common::value::Row;
use crate::common::{Lsn, TxnId, INVALID_LSN};
use crate::error::{DbError, Result};
use crate::recovery::log_manager::LogManager;
use crate::recovery::log_record::{LogRecord, LogRecordKind};

/// Closed transaction state set; transitions are checked in `transition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Running,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationKind {
    Insert,
    Update,
    Delete,
}

/// One logged change, retained for undo on abort.
#[derive(Debug, Clone)]
pub struct Modification {
    pub kind: ModificationKind,
    pub table: String,
    pub old_row: Option<Row>,
    pub new_row: Option<Row>,
    pub lsn: Lsn,
}

pub struct Transaction {
    id: TxnId,
    state: TransactionState,
    prev_lsn: Lsn,
    modifications: Vec<Modification>,
}

impl Transaction {
    fn new(id: TxnId) -> Self {
        Self {
            id,
            state: TransactionState::Running,
            prev_lsn: INVALID_LSN,
            modifications: Vec::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn prev_lsn(&self) -> Lsn {
        self.prev_lsn
    }

    pub fn set_prev_lsn(&mut self, lsn: Lsn) {
        self.prev_lsn = lsn;
    }

    /// Record a change for potential undo. Only legal while RUNNING.
    pub fn record_modification(&mut self, modification: Modification) -> Result<()> {
        if self.state != TransactionState::Running {
            return Err(DbError::Aborted(format!(
                "transaction {} is no longer running",
                self.id
            )));
        }
        self.prev_lsn = modification.lsn;
        self.modifications.push(modification);
        Ok(())
    }

    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    /// Checked state transition: RUNNING may move to either terminal state;
    /// terminal states are immutable.
    fn transition(&mut self, next: TransactionState) -> Result<()> {
        match (self.state, next) {
            (TransactionState::Running, TransactionState::Committed)
            | (TransactionState::Running, TransactionState::Aborted) => {
                self.state = next;
                Ok(())
            }
            (from, to) => Err(DbError::InvalidOperation(format!(
                "transaction {} cannot move from {:?} to {:?}",
                self.id, from, to
            ))),
        }
    }
}

pub type TxnHandle = Arc<Mutex<Transaction>>;

/// Transaction lifecycle: id allocation, BEGIN/COMMIT/ABORT records, the
/// forced flush on commit, and heap-level undo with CLRs on abort.
pub struct TransactionManager {
    log: Arc<LogManager>,
    catalog: Arc<Catalog>,
    next_txn_id: AtomicI32,
    active: Mutex<HashMap<TxnId, TxnHandle>>,
}

impl TransactionManager {
    pub fn new(log: Arc<LogManager>, catalog: Arc<Catalog>) -> Self {
        Self {
            log,
            catalog,
            next_txn_id: AtomicI32::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self) -> Result<TxnHandle> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);

        // Register the chain first so the BEGIN record becomes its anchor.
        self.log.begin_transaction(txn_id);
        let mut record = LogRecord::lifecycle(txn_id, LogRecordKind::Begin);
        let lsn = self.log.append(&mut record)?;

        let mut txn = Transaction::new(txn_id);
        txn.set_prev_lsn(lsn);
        let handle = Arc::new(Mutex::new(txn));
        self.active.lock().insert(txn_id, handle.clone());
        debug!(txn_id, "transaction started");
        Ok(handle)
    }

    /// Commit: append COMMIT, force the log durable, then drop the
    /// transaction from the active table.
    pub fn commit(&self, handle: &TxnHandle) -> Result<()> {
        let txn_id = {
            let mut txn = handle.lock();
            txn.transition(TransactionState::Committed)?;
            txn.id()
        };

        let mut record = LogRecord::lifecycle(txn_id, LogRecordKind::Commit);
        self.log.append(&mut record)?;
        self.log.flush(true)?;
        self.log.commit_transaction(txn_id);

        self.active.lock().remove(&txn_id);
        debug!(txn_id, "transaction committed");
        Ok(())
    }

    /// Abort: undo this transaction's modifications newest-first, writing a
    /// CLR per step, then append ABORT.
    pub fn abort(&self, handle: &TxnHandle) -> Result<()> {
        let (txn_id, modifications) = {
            let mut txn = handle.lock();
            txn.transition(TransactionState::Aborted)?;
            (txn.id(), txn.modifications().to_vec())
        };

        for (index, modification) in modifications.iter().enumerate().rev() {
            let entry = match self.catalog.table(&modification.table) {
                Some(entry) => entry,
                None => continue,
            };
            // The next record this rollback will undo, for the CLR chain.
            let undo_next = if index > 0 {
                modifications[index - 1].lsn
            } else {
                INVALID_LSN
            };

            match modification.kind {
                ModificationKind::Insert => {
                    if let Some(new_row) = &modification.new_row {
                        let mut clr = LogRecord::clr(
                            txn_id,
                            &modification.table,
                            new_row.clone(),
                            undo_next,
                        );
                        let clr_lsn = self.log.append(&mut clr)?;
                        entry.heap.mark_delete(new_row, clr_lsn)?;
                    }
                }
                ModificationKind::Update => {
                    if let (Some(old_row), Some(new_row)) =
                        (&modification.old_row, &modification.new_row)
                    {
                        let mut clr = LogRecord::clr(
                            txn_id,
                            &modification.table,
                            old_row.clone(),
                            undo_next,
                        );
                        let clr_lsn = self.log.append(&mut clr)?;
                        entry.heap.update_row(new_row, old_row, clr_lsn)?;
                    }
                }
                ModificationKind::Delete => {
                    if let Some(old_row) = &modification.old_row {
                        let mut clr = LogRecord::clr(
                            txn_id,
                            &modification.table,
                            old_row.clone(),
                            undo_next,
                        );
                        let clr_lsn = self.log.append(&mut clr)?;
                        entry.heap.insert_row(old_row, clr_lsn)?;
                    }
                }
            }
        }

        let mut record = LogRecord::lifecycle(txn_id, LogRecordKind::Abort);
        self.log.append(&mut record)?;
        self.log.abort_transaction(txn_id);

        self.active.lock().remove(&txn_id);
        debug!(txn_id, "transaction aborted");
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.active.lock().contains_key(&txn_id)
    }

    /// Abort everything still running, e.g. at shutdown.
    pub fn abort_all(&self) -> Result<()> {
        let handles: Vec<TxnHandle> = self.active.lock().values().cloned().collect();
        for handle in handles {
            self.abort(&handle)?;
        }
        Ok(())
    }
}
