use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDateTime};
use tracing::{debug, info};

use crate::buffer::PartitionedBufferPool;
use crate::catalog::Catalog;
use crate::common::{current_timestamp, Timestamp, REVERSE_DELTA_THRESHOLD_US};
use crate::error::{DbError, Result};
use crate::recovery::checkpoint::CheckpointManager;
use crate::recovery::log_manager::LogManager;
use crate::recovery::log_record::{LogRecord, LogRecordKind};
use crate::storage::SnapshotHeap;

/// Allowed clock skew before a target timestamp counts as "the future".
const FUTURE_SLACK_US: u64 = 60_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Start from the live state and undo operations newer than the target.
    ReverseDelta,
    /// Rebuild from scratch by replaying history up to the target.
    ForwardReplay,
    /// Pick per request based on the checkpoint timestamp and the cutoff.
    Auto,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeTravelResult {
    pub records_processed: usize,
    pub elapsed_ms: u64,
    pub strategy_used: Strategy,
}

/// Time travel over the WAL: read-only snapshots (`SELECT ... AS OF`) and
/// persistent rollback (`RECOVER TO`).
///
/// Reverse delta exploits the fact that the live heap contains every effect
/// up to "now": clone it, then undo each logged operation newer than the
/// target, newest first. Forward replay rebuilds from an empty heap instead
/// and is preferred for targets older than the last checkpoint.
pub struct TimeTravelEngine {
    log: Arc<LogManager>,
    catalog: Arc<Catalog>,
    bpm: Arc<PartitionedBufferPool>,
    checkpoint: Arc<CheckpointManager>,
    reverse_delta_threshold_us: AtomicU64,
}

impl TimeTravelEngine {
    pub fn new(
        log: Arc<LogManager>,
        catalog: Arc<Catalog>,
        bpm: Arc<PartitionedBufferPool>,
        checkpoint: Arc<CheckpointManager>,
    ) -> Self {
        Self {
            log,
            catalog,
            bpm,
            checkpoint,
            reverse_delta_threshold_us: AtomicU64::new(REVERSE_DELTA_THRESHOLD_US),
        }
    }

    pub fn set_reverse_delta_threshold(&self, micros: u64) {
        self.reverse_delta_threshold_us.store(micros, Ordering::SeqCst);
    }

    pub fn reverse_delta_threshold(&self) -> u64 {
        self.reverse_delta_threshold_us.load(Ordering::SeqCst)
    }

    /// Pick a strategy: recent targets (at or after the last checkpoint)
    /// take the reverse-delta path, distant ones replay forward.
    pub fn choose_strategy(&self, target_time: Timestamp) -> Strategy {
        let checkpoint_ts = self.checkpoint.last_checkpoint_timestamp();
        if checkpoint_ts > 0 && target_time >= checkpoint_ts {
            return Strategy::ReverseDelta;
        }
        let now = current_timestamp();
        if now.saturating_sub(target_time) > self.reverse_delta_threshold() {
            return Strategy::ForwardReplay;
        }
        Strategy::ReverseDelta
    }

    // ========================================================================
    // SELECT ... AS OF
    // ========================================================================

    /// Build a read-only snapshot of `table` as of `target_time`.
    pub fn build_snapshot(
        &self,
        table: &str,
        target_time: Timestamp,
        db: Option<&str>,
        strategy: Strategy,
    ) -> Result<(SnapshotHeap, TimeTravelResult)> {
        let db = db
            .map(str::to_string)
            .unwrap_or_else(|| self.log.current_database());
        let start = Instant::now();

        let strategy = match strategy {
            Strategy::Auto => self.choose_strategy(target_time),
            explicit => explicit,
        };

        let (heap, processed) = match strategy {
            Strategy::ReverseDelta => self.snapshot_reverse_delta(table, target_time, &db)?,
            Strategy::ForwardReplay | Strategy::Auto => {
                self.snapshot_forward_replay(table, target_time, &db)?
            }
        };

        let result = TimeTravelResult {
            records_processed: processed,
            elapsed_ms: start.elapsed().as_millis() as u64,
            strategy_used: strategy,
        };
        debug!(
            table,
            target_time,
            ?strategy,
            records = processed,
            "snapshot built"
        );
        Ok((heap, result))
    }

    fn snapshot_reverse_delta(
        &self,
        table: &str,
        target_time: Timestamp,
        db: &str,
    ) -> Result<(SnapshotHeap, usize)> {
        let entry = self
            .catalog
            .table(table)
            .ok_or_else(|| DbError::NotFound(format!("table {}", table)))?;

        let mut heap = SnapshotHeap::from_rows(entry.heap.scan()?);

        let mut newer: Vec<LogRecord> = self
            .log
            .table_records(db, table)?
            .into_iter()
            .filter(|r| {
                r.kind.is_data_mutation()
                    && r.kind != LogRecordKind::Clr
                    && r.timestamp > target_time
            })
            .collect();
        newer.sort_by_key(|r| std::cmp::Reverse(r.lsn));

        let processed = newer.len();
        for record in &newer {
            Self::apply_inverse(&mut heap, record);
        }
        Ok((heap, processed))
    }

    fn snapshot_forward_replay(
        &self,
        table: &str,
        target_time: Timestamp,
        db: &str,
    ) -> Result<(SnapshotHeap, usize)> {
        if self.catalog.table(table).is_none() {
            return Err(DbError::NotFound(format!("table {}", table)));
        }

        let mut older: Vec<LogRecord> = self
            .log
            .table_records(db, table)?
            .into_iter()
            .filter(|r| {
                r.kind.is_data_mutation()
                    && r.kind != LogRecordKind::Clr
                    && r.timestamp <= target_time
            })
            .collect();
        older.sort_by_key(|r| r.lsn);

        let mut heap = SnapshotHeap::new();
        let processed = older.len();
        for record in &older {
            Self::apply_forward(&mut heap, record);
        }
        Ok((heap, processed))
    }

    /// Undo one operation against a snapshot heap:
    /// INSERT removes the inserted row, the DELETE variants re-insert the
    /// old row, UPDATE finds the new value and restores the old one.
    fn apply_inverse(heap: &mut SnapshotHeap, record: &LogRecord) {
        match record.kind {
            LogRecordKind::Insert => {
                if let Some(new_row) = &record.new_value {
                    heap.delete_matching(new_row);
                }
            }
            LogRecordKind::Update => {
                if let (Some(old_row), Some(new_row)) = (&record.old_value, &record.new_value) {
                    heap.replace_matching(new_row, old_row);
                }
            }
            LogRecordKind::MarkDelete
            | LogRecordKind::ApplyDelete
            | LogRecordKind::RollbackDelete => {
                if let Some(old_row) = &record.old_value {
                    heap.insert(old_row.clone());
                }
            }
            _ => {}
        }
    }

    fn apply_forward(heap: &mut SnapshotHeap, record: &LogRecord) {
        match record.kind {
            LogRecordKind::Insert => {
                if let Some(new_row) = &record.new_value {
                    heap.insert(new_row.clone());
                }
            }
            LogRecordKind::Update => {
                if let (Some(old_row), Some(new_row)) = (&record.old_value, &record.new_value) {
                    heap.replace_matching(old_row, new_row);
                }
            }
            LogRecordKind::MarkDelete | LogRecordKind::ApplyDelete => {
                if let Some(old_row) = &record.old_value {
                    heap.delete_matching(old_row);
                }
            }
            LogRecordKind::RollbackDelete => {
                if let Some(old_row) = &record.old_value {
                    heap.insert(old_row.clone());
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // RECOVER TO
    // ========================================================================

    /// Permanently revert every table to its state at `target_time`.
    ///
    /// All snapshots are built in memory before any live table is touched;
    /// a failure there leaves the live state untouched. The caller holds the
    /// engine lock exclusively around this call.
    pub fn recover_to(&self, target_time: Timestamp, db: Option<&str>) -> Result<TimeTravelResult> {
        let now = current_timestamp();
        if target_time == 0 {
            return Err(DbError::InvalidTimestamp(
                "recovery target must be non-zero".to_string(),
            ));
        }
        if target_time > now + FUTURE_SLACK_US {
            return Err(DbError::FutureTimestamp(target_time));
        }

        let db = db
            .map(str::to_string)
            .unwrap_or_else(|| self.log.current_database());
        let start = Instant::now();
        let strategy = self.choose_strategy(target_time);

        // Phase 1: build all snapshots in memory, no live side effects.
        let mut staged = Vec::new();
        let mut processed = 0;
        for entry in self.catalog.all_tables() {
            let (heap, count) = match strategy {
                Strategy::ReverseDelta => {
                    self.snapshot_reverse_delta(&entry.name, target_time, &db)?
                }
                _ => self.snapshot_forward_replay(&entry.name, target_time, &db)?,
            };
            processed += count;
            staged.push((entry, heap));
        }

        // Phase 2: swap each table to its staged contents.
        let stamp = self.log.next_lsn().saturating_sub(1);
        for (entry, heap) in &staged {
            entry.heap.truncate(stamp)?;
            entry.heap.bulk_insert(heap.rows(), stamp)?;
        }

        // Phase 3: make it durable.
        self.bpm.flush_all()?;
        self.log.flush(true)?;
        self.catalog.save()?;

        let result = TimeTravelResult {
            records_processed: processed,
            elapsed_ms: start.elapsed().as_millis() as u64,
            strategy_used: strategy,
        };
        info!(
            target_time,
            ?strategy,
            records = processed,
            tables = staged.len(),
            "recovered to point in time"
        );
        Ok(result)
    }
}

/// Parse a user-facing timestamp: `"N <seconds|minutes|hours|days> ago"`,
/// plain epoch seconds, or `YYYY-MM-DD HH:MM:SS`.
pub fn parse_timestamp(input: &str) -> Result<Timestamp> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DbError::InvalidTimestamp("empty timestamp".to_string()));
    }

    if trimmed.contains("ago") {
        let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
        let amount: u64 = digits
            .parse()
            .map_err(|_| DbError::InvalidTimestamp(trimmed.to_string()))?;
        let unit_us = if trimmed.contains("second") {
            1_000_000
        } else if trimmed.contains("minute") {
            60 * 1_000_000
        } else if trimmed.contains("hour") {
            3_600 * 1_000_000
        } else if trimmed.contains("day") {
            86_400 * 1_000_000
        } else {
            return Err(DbError::InvalidTimestamp(trimmed.to_string()));
        };
        return Ok(current_timestamp().saturating_sub(amount * unit_us));
    }

    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        let seconds: u64 = trimmed
            .parse()
            .map_err(|_| DbError::InvalidTimestamp(trimmed.to_string()))?;
        return Ok(seconds * 1_000_000);
    }

    let parsed = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
        .map_err(|_| DbError::InvalidTimestamp(trimmed.to_string()))?;
    Ok(parsed.and_utc().timestamp_micros() as Timestamp)
}

/// Render a timestamp for logs and result messages.
pub fn timestamp_to_string(timestamp: Timestamp) -> String {
    DateTime::from_timestamp_micros(timestamp as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relative_timestamp() {
        let now = current_timestamp();
        let five_min = parse_timestamp("5 minutes ago").unwrap();
        assert!(five_min < now);
        assert!(now - five_min >= 5 * 60 * 1_000_000);
        assert!(now - five_min < 6 * 60 * 1_000_000);
    }

    #[test]
    fn test_parse_epoch_seconds() {
        assert_eq!(parse_timestamp("1700000000").unwrap(), 1_700_000_000_000_000);
    }

    #[test]
    fn test_parse_iso_datetime() {
        let ts = parse_timestamp("2024-01-02 03:04:05").unwrap();
        assert_eq!(timestamp_to_string(ts), "2024-01-02 03:04:05");
    }

    #[test]
    fn test_parse_garbage_is_rejected() {
        assert!(matches!(
            parse_timestamp("yesterday-ish"),
            Err(DbError::InvalidTimestamp(_))
        ));
    }
}
