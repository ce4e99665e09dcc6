use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::buffer::replacer::{create_replacer, Replacer, ReplacerPolicy};
use crate::common::{
    FrameId, Lsn, PageId, BITMAP_PAGE_ID, FIRST_DATA_PAGE_ID, INVALID_LSN, INVALID_PAGE_ID,
    PAGE_HEADER_SIZE,
};
use crate::error::{DbError, Result};
use crate::storage::{DiskManager, Page};

/// Narrow log capability the buffer pool needs to honor the WAL rule. The
/// log manager implements it; the buffer pool never sees the full log API.
pub trait LogSync: Send + Sync {
    /// Block until the log is durable up to `lsn`.
    fn flush_to_lsn(&self, lsn: Lsn) -> Result<()>;
    /// Force the whole log buffer to disk.
    fn flush(&self) -> Result<()>;
    /// Highest LSN known durable.
    fn persistent_lsn(&self) -> Lsn;
}

/// Shared handle to a resident page. Callers hold one only while pinned.
pub type PageRef = Arc<RwLock<Page>>;

struct Frame {
    page: PageRef,
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
    // First LSN that dirtied the current contents; feeds the DPT.
    recovery_lsn: Lsn,
}

impl Frame {
    fn new() -> Self {
        Self {
            page: Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))),
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
            recovery_lsn: INVALID_LSN,
        }
    }

    fn clear(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.pin_count = 0;
        self.is_dirty = false;
        self.recovery_lsn = INVALID_LSN;
    }
}

struct Partition {
    frames: Vec<Frame>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: Box<dyn Replacer>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BufferPoolStats {
    pub total_frames: usize,
    pub used_frames: usize,
    pub dirty_frames: usize,
    pub pinned_frames: usize,
}

/// Buffer pool with partitioned latching.
///
/// Pages are spread across `num_partitions` independent segments by
/// `page_id % num_partitions`, each with its own latch, page table, free list
/// and replacer, so concurrent fetches only contend when they hash to the
/// same partition. Partitioning is purely a contention optimization;
/// correctness never depends on it.
pub struct PartitionedBufferPool {
    partitions: Vec<Mutex<Partition>>,
    num_partitions: usize,
    disk: Arc<DiskManager>,
    log: RwLock<Option<Arc<dyn LogSync>>>,
    next_page_id: AtomicI32,
    // Serializes read-modify-write cycles on the free-page bitmap (page 2).
    bitmap_latch: Mutex<()>,
}

impl PartitionedBufferPool {
    pub fn new(
        pool_size: usize,
        num_partitions: usize,
        policy: ReplacerPolicy,
        disk: Arc<DiskManager>,
    ) -> Result<Self> {
        let num_partitions = num_partitions.max(1);
        let frames_per_partition = (pool_size / num_partitions).max(1);

        let mut partitions = Vec::with_capacity(num_partitions);
        for _ in 0..num_partitions {
            let mut frames = Vec::with_capacity(frames_per_partition);
            let mut free_list = VecDeque::with_capacity(frames_per_partition);
            for frame_id in 0..frames_per_partition {
                frames.push(Frame::new());
                free_list.push_back(frame_id as FrameId);
            }
            partitions.push(Mutex::new(Partition {
                frames,
                page_table: HashMap::new(),
                free_list,
                replacer: create_replacer(policy, frames_per_partition),
            }));
        }

        let next_page_id = (disk.num_pages()? as PageId).max(FIRST_DATA_PAGE_ID);

        Ok(Self {
            partitions,
            num_partitions,
            disk,
            log: RwLock::new(None),
            next_page_id: AtomicI32::new(next_page_id),
            bitmap_latch: Mutex::new(()),
        })
    }

    /// Late-bound WAL capability; see `LogSync`.
    pub fn set_log_manager(&self, log: Arc<dyn LogSync>) {
        *self.log.write() = Some(log);
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn partition_of(&self, page_id: PageId) -> &Mutex<Partition> {
        &self.partitions[page_id as usize % self.num_partitions]
    }

    /// Fetch a page, pinning it for the caller. The caller must pair this
    /// with `unpin_page`.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageRef> {
        if page_id <= 0 {
            return Err(DbError::InvalidPageId(page_id));
        }

        let mut partition = self.partition_of(page_id).lock();

        if let Some(&frame_id) = partition.page_table.get(&page_id) {
            let frame = &mut partition.frames[frame_id as usize];
            frame.pin_count += 1;
            let page = frame.page.clone();
            partition.replacer.pin(frame_id);
            return Ok(page);
        }

        let frame_id = self.find_free_frame(&mut partition)?;

        let data = match self.disk.read_page(page_id) {
            Ok(data) => data,
            Err(e) => {
                partition.free_list.push_back(frame_id);
                return Err(e);
            }
        };

        let frame = &mut partition.frames[frame_id as usize];
        frame.page = Arc::new(RwLock::new(Page::from_bytes(page_id, data)));
        frame.page_id = page_id;
        frame.pin_count = 1;
        frame.is_dirty = false;
        frame.recovery_lsn = INVALID_LSN;
        let page = frame.page.clone();

        partition.page_table.insert(page_id, frame_id);
        partition.replacer.pin(frame_id);

        Ok(page)
    }

    /// Allocate a page id (recycled from the bitmap or by extending the
    /// file) and install a zeroed, pinned frame for it.
    pub fn new_page(&self) -> Result<(PageId, PageRef)> {
        let page_id = self.allocate_page_id()?;

        let mut partition = self.partition_of(page_id).lock();
        let frame_id = match self.find_free_frame(&mut partition) {
            Ok(frame_id) => frame_id,
            Err(e) => {
                drop(partition);
                self.release_page_id(page_id)?;
                return Err(e);
            }
        };

        let frame = &mut partition.frames[frame_id as usize];
        frame.page = Arc::new(RwLock::new(Page::new(page_id)));
        frame.page_id = page_id;
        frame.pin_count = 1;
        frame.is_dirty = false;
        frame.recovery_lsn = INVALID_LSN;
        let page = frame.page.clone();

        partition.page_table.insert(page_id, frame_id);
        partition.replacer.pin(frame_id);

        Ok((page_id, page))
    }

    /// Drop one pin. Once the count reaches zero the frame becomes an
    /// eviction candidate. A `true` dirty flag sticks; it is never reset
    /// here.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut partition = self.partition_of(page_id).lock();
        let frame_id = match partition.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return false,
        };
        let frame = &mut partition.frames[frame_id as usize];

        if is_dirty {
            if !frame.is_dirty {
                frame.recovery_lsn = frame.page.read().page_lsn();
            }
            frame.is_dirty = true;
        }

        if frame.pin_count == 0 {
            return false;
        }
        frame.pin_count -= 1;
        if frame.pin_count == 0 {
            partition.replacer.unpin(frame_id);
        }
        true
    }

    /// Flush one resident page: log first (WAL rule), then checksum and
    /// write. Page 0 is never flushed through this path.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        if page_id <= 0 {
            return Err(DbError::InvalidPageId(page_id));
        }

        let mut partition = self.partition_of(page_id).lock();
        let frame_id = match partition.page_table.get(&page_id) {
            Some(&frame_id) => frame_id,
            None => return Ok(()),
        };
        let frame = &mut partition.frames[frame_id as usize];
        if !frame.is_dirty {
            return Ok(());
        }

        let mut image = frame.page.read().clone();
        self.enforce_wal_rule(image.page_lsn())?;
        image.update_checksum();
        self.disk.write_page(page_id, image.data())?;

        frame.is_dirty = false;
        frame.recovery_lsn = INVALID_LSN;
        Ok(())
    }

    /// Force the log, then write out every dirty page except page 0.
    pub fn flush_all(&self) -> Result<()> {
        if let Some(log) = self.log.read().clone() {
            log.flush()?;
        }

        for partition in &self.partitions {
            let mut partition = partition.lock();
            let resident: Vec<(PageId, FrameId)> = partition
                .page_table
                .iter()
                .map(|(&page_id, &frame_id)| (page_id, frame_id))
                .collect();
            for (page_id, frame_id) in resident {
                if page_id == 0 {
                    continue;
                }
                let frame = &mut partition.frames[frame_id as usize];
                if !frame.is_dirty {
                    continue;
                }
                let mut image = frame.page.read().clone();
                image.update_checksum();
                self.disk.write_page(page_id, image.data())?;
                frame.is_dirty = false;
                frame.recovery_lsn = INVALID_LSN;
            }
        }
        Ok(())
    }

    /// Remove a page from the pool and return its id to the free-page
    /// bitmap. Fails (returns `false`) while the page is pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool> {
        if page_id < FIRST_DATA_PAGE_ID {
            return Err(DbError::InvalidPageId(page_id));
        }

        {
            let mut partition = self.partition_of(page_id).lock();
            if let Some(&frame_id) = partition.page_table.get(&page_id) {
                if partition.frames[frame_id as usize].pin_count > 0 {
                    return Ok(false);
                }
                partition.page_table.remove(&page_id);
                partition.frames[frame_id as usize].clear();
                partition.replacer.pin(frame_id);
                partition.free_list.push_back(frame_id);
            }
        }

        self.release_page_id(page_id)?;
        Ok(true)
    }

    /// Snapshot of (page_id, recovery_lsn) for every dirty frame; the DPT
    /// half of a checkpoint record.
    pub fn dirty_pages(&self) -> Vec<(PageId, Lsn)> {
        let mut result = Vec::new();
        for partition in &self.partitions {
            let partition = partition.lock();
            for (&page_id, &frame_id) in &partition.page_table {
                let frame = &partition.frames[frame_id as usize];
                if frame.is_dirty {
                    result.push((page_id, frame.recovery_lsn));
                }
            }
        }
        result.sort_unstable();
        result
    }

    pub fn stats(&self) -> BufferPoolStats {
        let mut stats = BufferPoolStats::default();
        for partition in &self.partitions {
            let partition = partition.lock();
            stats.total_frames += partition.frames.len();
            stats.used_frames += partition.page_table.len();
            for frame in &partition.frames {
                if frame.page_id == INVALID_PAGE_ID {
                    continue;
                }
                if frame.is_dirty {
                    stats.dirty_frames += 1;
                }
                if frame.pin_count > 0 {
                    stats.pinned_frames += 1;
                }
            }
        }
        stats
    }

    /// Take a frame from the free list, or evict a victim. The victim's
    /// page-table entry is erased before any I/O, while the partition latch
    /// is held, so a concurrent fetch can never observe a half-evicted page.
    fn find_free_frame(&self, partition: &mut Partition) -> Result<FrameId> {
        if let Some(frame_id) = partition.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = partition.replacer.victim().ok_or(DbError::NoFreeFrame)?;
        let frame = &mut partition.frames[frame_id as usize];
        let victim_page_id = frame.page_id;

        partition.page_table.remove(&victim_page_id);

        let frame = &mut partition.frames[frame_id as usize];
        if frame.is_dirty {
            let mut image = frame.page.read().clone();
            self.enforce_wal_rule(image.page_lsn())?;
            image.update_checksum();
            self.disk.write_page(victim_page_id, image.data())?;
            debug!(page_id = victim_page_id, "evicted dirty page");
        }
        frame.clear();

        Ok(frame_id)
    }

    fn enforce_wal_rule(&self, page_lsn: Lsn) -> Result<()> {
        if page_lsn == INVALID_LSN {
            return Ok(());
        }
        if let Some(log) = self.log.read().clone() {
            log.flush_to_lsn(page_lsn)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Free-page bitmap (page 2). Bit i covers page id FIRST_DATA_PAGE_ID+i;
    // a set bit means the id is free for reuse. The bitmap bytes start past
    // the page header so the checksum slot is never aliased.
    // ------------------------------------------------------------------

    fn allocate_page_id(&self) -> Result<PageId> {
        let _guard = self.bitmap_latch.lock();
        let mut bitmap = self.disk.read_page(BITMAP_PAGE_ID)?;

        for byte_idx in PAGE_HEADER_SIZE..bitmap.len() {
            if bitmap[byte_idx] != 0 {
                let bit = bitmap[byte_idx].trailing_zeros() as usize;
                bitmap[byte_idx] &= !(1 << bit);
                crate::storage::checksum::update_page_checksum(&mut bitmap);
                self.disk.write_page(BITMAP_PAGE_ID, &bitmap)?;
                let index = (byte_idx - PAGE_HEADER_SIZE) * 8 + bit;
                return Ok(FIRST_DATA_PAGE_ID + index as PageId);
            }
        }

        Ok(self.next_page_id.fetch_add(1, Ordering::SeqCst))
    }

    fn release_page_id(&self, page_id: PageId) -> Result<()> {
        if page_id < FIRST_DATA_PAGE_ID {
            return Ok(());
        }
        let _guard = self.bitmap_latch.lock();
        let mut bitmap = self.disk.read_page(BITMAP_PAGE_ID)?;
        let index = (page_id - FIRST_DATA_PAGE_ID) as usize;
        let byte_idx = PAGE_HEADER_SIZE + index / 8;
        if byte_idx >= bitmap.len() {
            return Ok(());
        }
        bitmap[byte_idx] |= 1 << (index % 8);
        crate::storage::checksum::update_page_checksum(&mut bitmap);
        self.disk.write_page(BITMAP_PAGE_ID, &bitmap)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use tempfile::tempdir;

    struct RecordingLog {
        flushed_to: Mutex<Vec<Lsn>>,
        persistent: AtomicI32,
    }

    impl RecordingLog {
        fn new() -> Self {
            Self {
                flushed_to: Mutex::new(Vec::new()),
                persistent: AtomicI32::new(INVALID_LSN),
            }
        }
    }

    impl LogSync for RecordingLog {
        fn flush_to_lsn(&self, lsn: Lsn) -> Result<()> {
            self.flushed_to.lock().push(lsn);
            self.persistent.fetch_max(lsn, Ordering::SeqCst);
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }

        fn persistent_lsn(&self) -> Lsn {
            self.persistent.load(Ordering::SeqCst)
        }
    }

    fn make_pool(frames: usize, partitions: usize) -> (tempfile::TempDir, PartitionedBufferPool) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().join("pool")).unwrap());
        let pool =
            PartitionedBufferPool::new(frames, partitions, ReplacerPolicy::Lru, disk).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_new_page_starts_at_first_data_page() {
        let (_dir, pool) = make_pool(8, 2);
        let (page_id, page) = pool.new_page().unwrap();
        assert_eq!(page_id, FIRST_DATA_PAGE_ID);
        assert_eq!(page.read().id(), page_id);
        pool.unpin_page(page_id, false);
    }

    #[test]
    fn test_fetch_round_trip_through_eviction() {
        let (_dir, pool) = make_pool(2, 1);
        let (id_a, page_a) = pool.new_page().unwrap();
        page_a.write().init_data_page();
        page_a.write().data_mut()[100] = 0xEE;
        pool.unpin_page(id_a, true);

        // Fill the pool so page A gets evicted and written out.
        for _ in 0..3 {
            let (id, _page) = pool.new_page().unwrap();
            pool.unpin_page(id, false);
        }

        let fetched = pool.fetch_page(id_a).unwrap();
        assert_eq!(fetched.read().data()[100], 0xEE);
        pool.unpin_page(id_a, false);
    }

    #[test]
    fn test_all_pinned_means_no_free_frame() {
        let (_dir, pool) = make_pool(2, 1);
        let (a, _pa) = pool.new_page().unwrap();
        let (b, _pb) = pool.new_page().unwrap();
        assert!(matches!(pool.new_page(), Err(DbError::NoFreeFrame)));

        // Releasing one pin frees a frame again.
        pool.unpin_page(a, false);
        let (c, _pc) = pool.new_page().unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn test_wal_rule_enforced_before_eviction() {
        let (_dir, pool) = make_pool(1, 1);
        let log = Arc::new(RecordingLog::new());
        pool.set_log_manager(log.clone());

        let (id, page) = pool.new_page().unwrap();
        {
            let mut guard = page.write();
            guard.init_data_page();
            guard.set_page_lsn(10);
        }
        pool.unpin_page(id, true);

        // Next allocation must evict the dirty page, flushing the log first.
        let (next, _page) = pool.new_page().unwrap();
        pool.unpin_page(next, false);
        assert_eq!(log.flushed_to.lock().as_slice(), &[10]);
    }

    #[test]
    fn test_flush_page_clears_dirty() {
        let (_dir, pool) = make_pool(4, 2);
        let log = Arc::new(RecordingLog::new());
        pool.set_log_manager(log.clone());

        let (id, page) = pool.new_page().unwrap();
        {
            let mut guard = page.write();
            guard.init_data_page();
            guard.set_page_lsn(7);
        }
        pool.unpin_page(id, true);
        assert_eq!(pool.stats().dirty_frames, 1);

        pool.flush_page(id).unwrap();
        assert_eq!(pool.stats().dirty_frames, 0);
        assert_eq!(log.flushed_to.lock().as_slice(), &[7]);
    }

    #[test]
    fn test_flush_all_leaves_no_dirty_frames() {
        let (_dir, pool) = make_pool(8, 2);
        for _ in 0..4 {
            let (id, page) = pool.new_page().unwrap();
            page.write().init_data_page();
            pool.unpin_page(id, true);
        }
        assert_eq!(pool.stats().dirty_frames, 4);
        pool.flush_all().unwrap();
        assert_eq!(pool.stats().dirty_frames, 0);
    }

    #[test]
    fn test_delete_page_recycles_id() {
        let (_dir, pool) = make_pool(8, 2);
        let (id, page) = pool.new_page().unwrap();
        page.write().init_data_page();

        // Still pinned: delete refuses.
        assert!(!pool.delete_page(id).unwrap());
        pool.unpin_page(id, false);
        assert!(pool.delete_page(id).unwrap());

        // The freed id is handed out again before the file grows.
        let (recycled, _page) = pool.new_page().unwrap();
        assert_eq!(recycled, id);
        pool.unpin_page(recycled, false);
    }

    #[test]
    fn test_dirty_pages_snapshot_tracks_recovery_lsn() {
        let (_dir, pool) = make_pool(8, 2);
        let (id, page) = pool.new_page().unwrap();
        {
            let mut guard = page.write();
            guard.init_data_page();
            guard.set_page_lsn(21);
        }
        pool.unpin_page(id, true);

        let dirty = pool.dirty_pages();
        assert_eq!(dirty, vec![(id, 21)]);
    }
}
