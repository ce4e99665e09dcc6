pub mod value;

use std::time::{SystemTime, UNIX_EPOCH};

// Signed id types so invalid markers can be negative, matching the on-disk
// formats which store them as little-endian i32.
pub type PageId = i32;
pub type FrameId = i32;
pub type TxnId = i32;
pub type Lsn = i32;

/// Microseconds since the Unix epoch.
pub type Timestamp = u64;

// ============================================================================
// STORAGE LAYOUT
// ============================================================================

/// 4KB page size matches typical OS page size.
pub const PAGE_SIZE: usize = 4096;

// Reserved page ids.
pub const METADATA_PAGE_ID: PageId = 0;
pub const CATALOG_PAGE_ID: PageId = 1;
pub const BITMAP_PAGE_ID: PageId = 2;
pub const FIRST_DATA_PAGE_ID: PageId = 3;

pub const INVALID_PAGE_ID: PageId = -1;
pub const INVALID_TXN_ID: TxnId = -1;
pub const INVALID_LSN: Lsn = -1;

// Data page header:
// [page_id (4)] [prev_page (4)] [next_page (4)] [free_space_ptr (4)]
// [tuple_count (4)] [checksum (4)] [page_lsn (4)] = 28 bytes
pub const PAGE_HEADER_SIZE: usize = 28;

/// Maximum tuple size (page size - header - slot length prefix).
pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - 4;

// ============================================================================
// BUFFER POOL
// ============================================================================

pub const BUFFER_POOL_SIZE: usize = 100;
pub const BUFFER_POOL_PARTITIONS: usize = 16;

// ============================================================================
// LOGGING & RECOVERY
// ============================================================================

/// Log buffer size before the flush worker is nudged (64KB).
pub const LOG_BUFFER_SIZE: usize = 64 * 1024;

/// Flush worker wakeup interval.
pub const LOG_FLUSH_INTERVAL_MS: u64 = 30;

/// Maximum log record size accepted by the decoder.
pub const MAX_LOG_RECORD_SIZE: usize = 10_000_000;

pub const CHECKPOINT_OPS_THRESHOLD: u32 = 1000;
pub const CHECKPOINT_INTERVAL_SECS: u64 = 30;

/// Reverse-delta cutoff: one hour, in microseconds.
pub const REVERSE_DELTA_THRESHOLD_US: u64 = 3_600_000_000;

/// Current wall-clock time in microseconds since the epoch.
pub fn current_timestamp() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_is_monotonic_enough() {
        let a = current_timestamp();
        let b = current_timestamp();
        assert!(b >= a);
    }

    #[test]
    fn test_page_header_fits() {
        assert!(PAGE_HEADER_SIZE < PAGE_SIZE);
        assert!(MAX_TUPLE_SIZE > 0);
    }
}
