use std::sync::Arc;

use bytes::BytesMut;

use crate::buffer::PartitionedBufferPool;
use crate::common::value::{decode_row, encode_row, Row};
use crate::common::{Lsn, PageId, INVALID_PAGE_ID, MAX_TUPLE_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::error::{DbError, Result};

// High bit of a slot's length prefix marks a deleted tuple.
const TOMBSTONE_BIT: u32 = 0x8000_0000;

/// Page-backed tuple heap for a live table.
///
/// Tuples are appended into a chain of data pages as
/// `[len:u32][row bytes]` slots growing from the header towards the end of
/// the page. Deletion tombstones the slot in place. Every mutation stamps the
/// touched page's `page_lsn` with the LSN of the log record describing it, so
/// the buffer pool can enforce the WAL rule on flush.
pub struct TableHeap {
    bpm: Arc<PartitionedBufferPool>,
    first_page_id: PageId,
}

impl TableHeap {
    /// Create a heap with a fresh first page.
    pub fn create(bpm: Arc<PartitionedBufferPool>) -> Result<Self> {
        let (page_id, page) = bpm.new_page()?;
        page.write().init_data_page();
        bpm.unpin_page(page_id, true);
        Ok(Self {
            bpm,
            first_page_id: page_id,
        })
    }

    /// Reattach to an existing heap by its first page id.
    pub fn open(bpm: Arc<PartitionedBufferPool>, first_page_id: PageId) -> Self {
        Self {
            bpm,
            first_page_id,
        }
    }

    pub fn first_page_id(&self) -> PageId {
        self.first_page_id
    }

    pub fn insert_row(&self, row: &Row, lsn: Lsn) -> Result<()> {
        let bytes = Self::encode(row);
        if bytes.len() > MAX_TUPLE_SIZE {
            return Err(DbError::InvalidOperation(format!(
                "tuple of {} bytes exceeds the page capacity",
                bytes.len()
            )));
        }

        let mut page_id = self.first_page_id;
        loop {
            let page = self.bpm.fetch_page(page_id)?;
            {
                // A page that never reached disk before a crash reads back
                // zeroed; give it a header before using it.
                let mut guard = page.write();
                if guard.free_ptr() < PAGE_HEADER_SIZE {
                    guard.init_data_page();
                }
            }
            let (fits, next) = {
                let guard = page.read();
                (
                    guard.free_ptr() + 4 + bytes.len() <= PAGE_SIZE,
                    Self::chain_next(&guard),
                )
            };

            if fits {
                let mut guard = page.write();
                Self::append_slot(&mut guard, &bytes);
                guard.set_page_lsn(lsn);
                drop(guard);
                self.bpm.unpin_page(page_id, true);
                return Ok(());
            }

            if next != INVALID_PAGE_ID {
                self.bpm.unpin_page(page_id, false);
                page_id = next;
                continue;
            }

            // Tail page is full: grow the chain.
            let (new_id, new_page) = self.bpm.new_page()?;
            {
                let mut guard = new_page.write();
                guard.init_data_page();
                guard.set_prev_page(page_id);
                Self::append_slot(&mut guard, &bytes);
                guard.set_page_lsn(lsn);
            }
            {
                let mut guard = page.write();
                guard.set_next_page(new_id);
                guard.set_page_lsn(lsn);
            }
            self.bpm.unpin_page(page_id, true);
            self.bpm.unpin_page(new_id, true);
            return Ok(());
        }
    }

    /// Tombstone the first tuple equal to `row`. Returns whether a match was
    /// found.
    pub fn mark_delete(&self, row: &Row, lsn: Lsn) -> Result<bool> {
        let mut page_id = self.first_page_id;
        while page_id != INVALID_PAGE_ID {
            let page = self.bpm.fetch_page(page_id)?;
            let mut match_offset = None;
            let next;
            {
                let guard = page.read();
                next = Self::chain_next(&guard);
                for (offset, len, tuple) in SlotIter::new(guard.data(), guard.free_ptr()) {
                    if tuple.as_ref() == Some(row) {
                        match_offset = Some((offset, len));
                        break;
                    }
                }
            }

            if let Some((offset, len)) = match_offset {
                let mut guard = page.write();
                let tombstoned = (len | TOMBSTONE_BIT).to_le_bytes();
                guard.data_mut()[offset..offset + 4].copy_from_slice(&tombstoned);
                let count = guard.tuple_count();
                guard.set_tuple_count(count.saturating_sub(1));
                guard.set_page_lsn(lsn);
                drop(guard);
                self.bpm.unpin_page(page_id, true);
                return Ok(true);
            }

            self.bpm.unpin_page(page_id, false);
            page_id = next;
        }
        Ok(false)
    }

    /// Replace the first tuple equal to `old` with `new`. Returns whether a
    /// match was found.
    pub fn update_row(&self, old: &Row, new: &Row, lsn: Lsn) -> Result<bool> {
        if !self.mark_delete(old, lsn)? {
            return Ok(false);
        }
        self.insert_row(new, lsn)?;
        Ok(true)
    }

    /// All live tuples, in chain order.
    pub fn scan(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        let mut page_id = self.first_page_id;
        while page_id != INVALID_PAGE_ID {
            let page = self.bpm.fetch_page(page_id)?;
            {
                let guard = page.read();
                for (_, _, tuple) in SlotIter::new(guard.data(), guard.free_ptr()) {
                    if let Some(row) = tuple {
                        rows.push(row);
                    }
                }
                page_id = Self::chain_next(&guard);
            }
            self.bpm.unpin_page(page.read().id(), false);
        }
        Ok(rows)
    }

    pub fn len(&self) -> Result<usize> {
        let mut total = 0usize;
        let mut page_id = self.first_page_id;
        while page_id != INVALID_PAGE_ID {
            let page = self.bpm.fetch_page(page_id)?;
            let next;
            {
                let guard = page.read();
                total += guard.tuple_count() as usize;
                next = Self::chain_next(&guard);
            }
            self.bpm.unpin_page(page_id, false);
            page_id = next;
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop every tuple, releasing all chained pages except the first.
    pub fn truncate(&self, lsn: Lsn) -> Result<()> {
        let mut chained = Vec::new();
        let mut page_id;
        {
            let page = self.bpm.fetch_page(self.first_page_id)?;
            {
                let mut guard = page.write();
                page_id = Self::chain_next(&guard);
                guard.init_data_page();
                guard.set_page_lsn(lsn);
            }
            self.bpm.unpin_page(self.first_page_id, true);
        }
        while page_id != INVALID_PAGE_ID {
            let page = self.bpm.fetch_page(page_id)?;
            let next = Self::chain_next(&page.read());
            self.bpm.unpin_page(page_id, false);
            chained.push(page_id);
            page_id = next;
        }
        for id in chained {
            self.bpm.delete_page(id)?;
        }
        Ok(())
    }

    /// Whether any live tuple equals `row`.
    pub fn contains(&self, row: &Row) -> Result<bool> {
        Ok(self.scan()?.iter().any(|r| r == row))
    }

    /// Bulk-load rows into an empty heap under a single LSN stamp.
    pub fn bulk_insert(&self, rows: &[Row], lsn: Lsn) -> Result<()> {
        for row in rows {
            self.insert_row(row, lsn)?;
        }
        Ok(())
    }

    /// Highest page LSN across the chain; the redo watermark for this table.
    pub fn max_page_lsn(&self) -> Result<Lsn> {
        let mut max = crate::common::INVALID_LSN;
        let mut page_id = self.first_page_id;
        while page_id != INVALID_PAGE_ID {
            let page = self.bpm.fetch_page(page_id)?;
            let next;
            {
                let guard = page.read();
                if guard.free_ptr() >= PAGE_HEADER_SIZE {
                    max = max.max(guard.page_lsn());
                }
                next = Self::chain_next(&guard);
            }
            self.bpm.unpin_page(page_id, false);
            page_id = next;
        }
        Ok(max)
    }

    /// Follow a chain link. A page that was never flushed reads back as
    /// zeros, where the next-page slot is 0 rather than INVALID; both mean
    /// the chain ends.
    fn chain_next(guard: &crate::storage::Page) -> PageId {
        let next = guard.next_page();
        if next <= 0 {
            INVALID_PAGE_ID
        } else {
            next
        }
    }

    fn encode(row: &Row) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_row(&mut buf, row);
        buf.to_vec()
    }

    fn append_slot(guard: &mut crate::storage::Page, bytes: &[u8]) {
        let offset = guard.free_ptr();
        let data = guard.data_mut();
        data[offset..offset + 4].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
        data[offset + 4..offset + 4 + bytes.len()].copy_from_slice(bytes);
        guard.set_free_ptr(offset + 4 + bytes.len());
        let count = guard.tuple_count();
        guard.set_tuple_count(count + 1);
    }
}

/// Iterator over `(offset, len, decoded row)` slots of one page image.
/// Tombstoned slots yield `None` rows.
struct SlotIter<'a> {
    data: &'a [u8],
    offset: usize,
    free_ptr: usize,
}

impl<'a> SlotIter<'a> {
    fn new(data: &'a [u8], free_ptr: usize) -> Self {
        Self {
            data,
            offset: PAGE_HEADER_SIZE,
            free_ptr: free_ptr.min(data.len()),
        }
    }
}

impl Iterator for SlotIter<'_> {
    type Item = (usize, u32, Option<Row>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + 4 > self.free_ptr {
            return None;
        }
        let raw = u32::from_le_bytes(
            self.data[self.offset..self.offset + 4]
                .try_into()
                .unwrap(),
        );
        let len = (raw & !TOMBSTONE_BIT) as usize;
        if len == 0 || self.offset + 4 + len > self.free_ptr {
            return None;
        }
        let slot_offset = self.offset;
        let body = &self.data[self.offset + 4..self.offset + 4 + len];
        self.offset += 4 + len;

        let row = if raw & TOMBSTONE_BIT != 0 {
            None
        } else {
            let mut cursor = body;
            decode_row(&mut cursor).ok()
        };
        Some((slot_offset, raw & !TOMBSTONE_BIT, row))
    }
}

/// In-memory heap used by time travel: snapshot bases, forward-replay
/// targets and recovery staging all build here, away from the buffer pool.
#[derive(Debug, Clone, Default)]
pub struct SnapshotHeap {
    rows: Vec<Row>,
}

impl SnapshotHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn insert(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// Remove the first row equal to `row`. Returns whether a match existed.
    pub fn delete_matching(&mut self, row: &Row) -> bool {
        if let Some(pos) = self.rows.iter().position(|r| r == row) {
            self.rows.remove(pos);
            true
        } else {
            false
        }
    }

    /// Replace the first row equal to `find` with `replacement`.
    pub fn replace_matching(&mut self, find: &Row, replacement: &Row) -> bool {
        if let Some(pos) = self.rows.iter().position(|r| r == find) {
            self.rows[pos] = replacement.clone();
            true
        } else {
            false
        }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ReplacerPolicy;
    use crate::common::value::Value;
    use crate::storage::DiskManager;
    use tempfile::tempdir;

    fn make_heap() -> (tempfile::TempDir, TableHeap) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().join("heap")).unwrap());
        let bpm =
            Arc::new(PartitionedBufferPool::new(32, 4, ReplacerPolicy::Lru, disk).unwrap());
        let heap = TableHeap::create(bpm).unwrap();
        (dir, heap)
    }

    fn row(id: i64, text: &str) -> Row {
        vec![Value::Int(id), Value::Text(text.to_string())]
    }

    #[test]
    fn test_insert_and_scan() {
        let (_dir, heap) = make_heap();
        heap.insert_row(&row(1, "a"), 10).unwrap();
        heap.insert_row(&row(2, "b"), 11).unwrap();

        let rows = heap.scan().unwrap();
        assert_eq!(rows, vec![row(1, "a"), row(2, "b")]);
        assert_eq!(heap.len().unwrap(), 2);
        assert_eq!(heap.max_page_lsn().unwrap(), 11);
    }

    #[test]
    fn test_mark_delete_tombstones_in_place() {
        let (_dir, heap) = make_heap();
        heap.insert_row(&row(1, "a"), 1).unwrap();
        heap.insert_row(&row(2, "b"), 2).unwrap();

        assert!(heap.mark_delete(&row(1, "a"), 3).unwrap());
        assert!(!heap.mark_delete(&row(9, "zz"), 4).unwrap());

        assert_eq!(heap.scan().unwrap(), vec![row(2, "b")]);
        assert_eq!(heap.len().unwrap(), 1);
    }

    #[test]
    fn test_update_replaces_matching_row() {
        let (_dir, heap) = make_heap();
        heap.insert_row(&row(2, "old"), 1).unwrap();
        assert!(heap.update_row(&row(2, "old"), &row(2, "new"), 2).unwrap());
        assert_eq!(heap.scan().unwrap(), vec![row(2, "new")]);
    }

    #[test]
    fn test_heap_grows_across_pages() {
        let (_dir, heap) = make_heap();
        let wide = "x".repeat(600);
        for i in 0..32 {
            heap.insert_row(&row(i, &wide), i as Lsn).unwrap();
        }
        assert_eq!(heap.len().unwrap(), 32);
        assert_eq!(heap.scan().unwrap().len(), 32);
    }

    #[test]
    fn test_oversized_tuple_is_rejected() {
        let (_dir, heap) = make_heap();
        let huge = vec![Value::Text("y".repeat(PAGE_SIZE))];
        assert!(heap.insert_row(&huge, 1).is_err());
    }

    #[test]
    fn test_truncate_empties_the_chain() {
        let (_dir, heap) = make_heap();
        let wide = "w".repeat(900);
        for i in 0..16 {
            heap.insert_row(&row(i, &wide), i as Lsn).unwrap();
        }
        heap.truncate(99).unwrap();
        assert!(heap.is_empty().unwrap());
        assert!(heap.scan().unwrap().is_empty());

        // The heap stays usable after truncation.
        heap.insert_row(&row(1, "back"), 100).unwrap();
        assert_eq!(heap.scan().unwrap(), vec![row(1, "back")]);
    }

    #[test]
    fn test_snapshot_heap_operations() {
        let mut heap = SnapshotHeap::new();
        heap.insert(row(1, "a"));
        heap.insert(row(2, "b"));

        assert!(heap.replace_matching(&row(2, "b"), &row(2, "c")));
        assert!(heap.delete_matching(&row(1, "a")));
        assert!(!heap.delete_matching(&row(1, "a")));
        assert_eq!(heap.rows(), &[row(2, "c")]);
    }
}
