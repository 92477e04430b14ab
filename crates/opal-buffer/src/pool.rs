//! Buffer pool manager.

use crate::disk::DiskManager;
use crate::frame::{BufferFrame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::{ClockReplacer, Replacer};
use opal_common::page::{PageId, PAGE_SIZE};
use opal_common::{OpalError, Result};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use sysinfo::System;

/// Configuration for the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub num_frames: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_frames: 1024 }
    }
}

/// Buffer pool manager.
///
/// Manages a fixed-size pool of page frames with:
/// - Page ID to frame ID mapping (lock-free page table)
/// - Free frame list for new pages
/// - Clock replacement for eviction, writing dirty victims back to disk
/// - Pin counting for concurrent access
/// - Page id allocation with recycling of deleted pages
///
/// Pages are handed out as RAII guards that hold both the pin and the
/// page latch (the frame's RwLock) for their whole lifetime.
pub struct BufferPool {
    /// Configuration.
    config: BufferPoolConfig,
    /// Array of buffer frames.
    frames: Vec<BufferFrame>,
    /// Page ID to frame ID mapping (lock-free reads).
    page_table: PageTable,
    /// List of free frame IDs.
    free_list: Mutex<Vec<FrameId>>,
    /// Page replacement policy.
    replacer: ClockReplacer,
    /// Backing store for page loads and dirty write-back.
    disk: Arc<DiskManager>,
    /// Next page id to hand out when the recycle list is empty.
    next_page_id: AtomicU32,
    /// Page ids freed by delete_page, reused before extending the file.
    free_page_ids: Mutex<Vec<PageId>>,
    /// Serializes the miss path: frame allocation, eviction, disk loads,
    /// and page deletion. Page-table hits stay lock-free.
    miss_lock: Mutex<()>,
}

impl BufferPool {
    /// Creates a new buffer pool over the given disk manager.
    pub fn new(config: BufferPoolConfig, disk: Arc<DiskManager>) -> Self {
        let num_frames = config.num_frames;

        let frames: Vec<_> = (0..num_frames)
            .map(|i| BufferFrame::new(FrameId(i as u32)))
            .collect();

        // All frames start in the free list
        let free_list: Vec<_> = (0..num_frames).map(|i| FrameId(i as u32)).collect();

        let next_page_id = disk.num_pages();

        Self {
            config,
            frames,
            page_table: PageTable::new(num_frames),
            free_list: Mutex::new(free_list),
            replacer: ClockReplacer::new(num_frames),
            disk,
            next_page_id: AtomicU32::new(next_page_id),
            free_page_ids: Mutex::new(Vec::new()),
            miss_lock: Mutex::new(()),
        }
    }

    /// Creates a buffer pool sized to 25% of available system RAM.
    ///
    /// Minimum 1,000 frames to ensure useful caching even on low-memory
    /// systems.
    pub fn auto_sized(disk: Arc<DiskManager>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_bytes = sys.available_memory() as usize;
        let target_bytes = available_bytes / 4;
        let num_frames = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(BufferPoolConfig { num_frames }, disk)
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.config.num_frames
    }

    /// Returns the number of free frames.
    pub fn free_count(&self) -> usize {
        self.free_list.lock().len()
    }

    /// Returns the number of pages currently in the pool.
    pub fn page_count(&self) -> usize {
        self.page_table.len()
    }

    /// Checks if a page is resident in the buffer pool.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.contains(page_id)
    }

    /// Pins an already-resident page, validating the mapping after the pin.
    ///
    /// The post-pin validation pairs with `begin_evict`: a pin that lands
    /// after eviction started sees either the flag or a changed page id and
    /// backs off.
    fn pin_existing(&self, page_id: PageId) -> Option<&BufferFrame> {
        loop {
            let frame_id = self.page_table.get(page_id)?;
            let frame = &self.frames[frame_id.0 as usize];
            frame.pin();
            if !frame.is_evicting() && frame.page_id() == Some(page_id) {
                self.replacer.record_access(frame_id);
                return Some(frame);
            }
            frame.unpin();
            std::thread::yield_now();
        }
    }

    /// Allocates a frame, evicting an unpinned victim if necessary.
    ///
    /// Caller must hold `miss_lock`. A dirty victim is written back to
    /// disk before the frame is reused.
    fn allocate_frame(&self) -> Result<FrameId> {
        if let Some(frame_id) = self.free_list.lock().pop() {
            return Ok(frame_id);
        }

        for _ in 0..self.config.num_frames {
            let victim = self
                .replacer
                .evict(&|fid| {
                    let f = &self.frames[fid.0 as usize];
                    f.pin_count() == 0 && !f.is_empty()
                })
                .ok_or(OpalError::BufferPoolFull)?;

            let frame = &self.frames[victim.0 as usize];
            let old_page_id = match frame.page_id() {
                Some(pid) => pid,
                None => continue,
            };

            self.page_table.remove(old_page_id);
            frame.begin_evict();
            if frame.pin_count() != 0 {
                // Lost the race to a concurrent pin; put the mapping back.
                frame.end_evict();
                self.page_table.insert(old_page_id, victim);
                continue;
            }

            if frame.is_dirty() {
                let data = frame.read_data();
                if let Err(e) = self.disk.write_page(old_page_id, &**data) {
                    drop(data);
                    frame.end_evict();
                    self.page_table.insert(old_page_id, victim);
                    return Err(e);
                }
            }

            frame.reset();
            return Ok(victim);
        }

        Err(OpalError::BufferPoolFull)
    }

    /// Brings a page into a frame, pinned. Caller-visible miss path.
    ///
    /// With `zero_fill` the frame is left zeroed instead of loaded from
    /// disk (fresh page allocation).
    fn load_into_frame(&self, page_id: PageId, zero_fill: bool) -> Result<&BufferFrame> {
        let _miss = self.miss_lock.lock();

        // Another thread may have loaded the page while we waited.
        if let Some(frame) = self.pin_existing(page_id) {
            return Ok(frame);
        }

        let frame_id = self.allocate_frame()?;
        let frame = &self.frames[frame_id.0 as usize];

        if !zero_fill {
            match self.disk.read_page(page_id) {
                Ok(data) => frame.copy_from(&data),
                Err(e) => {
                    self.free_list.lock().push(frame_id);
                    return Err(e);
                }
            }
        }

        frame.set_page_id(Some(page_id));
        frame.pin();
        self.page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        Ok(frame)
    }

    /// Allocates a page id, preferring ids recycled by `delete_page`.
    fn allocate_page_id(&self) -> PageId {
        if let Some(page_id) = self.free_page_ids.lock().pop() {
            return page_id;
        }
        PageId::new(self.next_page_id.fetch_add(1, Ordering::AcqRel))
    }

    /// Allocates a new page and returns it pinned and write-latched.
    ///
    /// The page contents start zeroed.
    pub fn new_page(&self) -> Result<PageWriteGuard<'_>> {
        let page_id = self.allocate_page_id();
        match self.load_into_frame(page_id, true) {
            Ok(frame) => {
                // A fresh page must reach disk even if the caller never
                // writes through the guard.
                frame.set_dirty(true);
                Ok(PageWriteGuard {
                    page_id,
                    frame,
                    latch: frame.write_data(),
                })
            }
            Err(e) => {
                self.free_page_ids.lock().push(page_id);
                Err(e)
            }
        }
    }

    /// Fetches a page and returns it pinned with the read latch held.
    pub fn fetch_page_read(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        if !page_id.is_valid() {
            return Err(OpalError::PageNotFound {
                page_id: page_id.as_u32(),
            });
        }
        let frame = match self.pin_existing(page_id) {
            Some(frame) => frame,
            None => self.load_into_frame(page_id, false)?,
        };
        Ok(PageReadGuard {
            page_id,
            frame,
            latch: frame.read_data(),
        })
    }

    /// Fetches a page and returns it pinned with the write latch held.
    pub fn fetch_page_write(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        if !page_id.is_valid() {
            return Err(OpalError::PageNotFound {
                page_id: page_id.as_u32(),
            });
        }
        let frame = match self.pin_existing(page_id) {
            Some(frame) => frame,
            None => self.load_into_frame(page_id, false)?,
        };
        Ok(PageWriteGuard {
            page_id,
            frame,
            latch: frame.write_data(),
        })
    }

    /// Deletes a page from the buffer pool and recycles its id.
    ///
    /// Returns false if the page is currently pinned.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let _miss = self.miss_lock.lock();

        if let Some(frame_id) = self.page_table.remove(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            frame.begin_evict();
            if frame.is_pinned() {
                frame.end_evict();
                self.page_table.insert(page_id, frame_id);
                return false;
            }

            self.replacer.remove(frame_id);
            frame.reset();
            self.free_list.lock().push(frame_id);
        }

        self.free_page_ids.lock().push(page_id);
        true
    }

    /// Writes a page's data to disk if dirty.
    ///
    /// Returns true if the page was flushed.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool> {
        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_dirty() {
                let data = frame.read_data();
                self.disk.write_page(page_id, &**data)?;
                frame.set_dirty(false);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Flushes all dirty pages.
    ///
    /// Returns the number of pages flushed.
    pub fn flush_all(&self) -> Result<usize> {
        let mut resident = Vec::new();
        self.page_table.for_each(|page_id, _| {
            resident.push(page_id);
            true
        });

        let mut flushed = 0;
        for page_id in resident {
            if self.flush_page(page_id)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Returns statistics about the buffer pool.
    pub fn stats(&self) -> BufferPoolStats {
        let mut pinned_count = 0;
        let mut dirty_count = 0;

        self.page_table.for_each(|_, frame_id| {
            let frame = &self.frames[frame_id.0 as usize];
            if frame.is_pinned() {
                pinned_count += 1;
            }
            if frame.is_dirty() {
                dirty_count += 1;
            }
            true
        });

        BufferPoolStats {
            total_frames: self.config.num_frames,
            free_frames: self.free_count(),
            used_frames: self.page_table.len(),
            pinned_frames: pinned_count,
            dirty_frames: dirty_count,
        }
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone)]
pub struct BufferPoolStats {
    /// Total number of frames.
    pub total_frames: usize,
    /// Number of free frames.
    pub free_frames: usize,
    /// Number of frames with pages.
    pub used_frames: usize,
    /// Number of pinned frames.
    pub pinned_frames: usize,
    /// Number of dirty frames.
    pub dirty_frames: usize,
}

/// RAII guard conferring shared access to one page.
///
/// Holds the pin and the read latch for its whole lifetime; dropping the
/// guard releases the latch and unpins the page.
pub struct PageReadGuard<'a> {
    page_id: PageId,
    frame: &'a BufferFrame,
    latch: RwLockReadGuard<'a, Box<[u8; PAGE_SIZE]>>,
}

impl PageReadGuard<'_> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.latch
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        // The latch field is released right after this runs.
        self.frame.unpin();
    }
}

/// RAII guard conferring exclusive access to one page.
///
/// Holds the pin and the write latch for its whole lifetime. The frame is
/// marked dirty on first mutable access, before the guard can drop.
pub struct PageWriteGuard<'a> {
    page_id: PageId,
    frame: &'a BufferFrame,
    latch: RwLockWriteGuard<'a, Box<[u8; PAGE_SIZE]>>,
}

impl PageWriteGuard<'_> {
    /// Returns the page ID.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.latch
    }

    /// Returns mutable page data, marking the frame dirty.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        self.frame.set_dirty(true);
        &mut self.latch
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        // The latch field is released right after this runs.
        self.frame.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManagerConfig;
    use tempfile::tempdir;

    fn create_test_pool(num_frames: usize) -> (tempfile::TempDir, BufferPool) {
        let dir = tempdir().unwrap();
        let disk = Arc::new(
            DiskManager::new(DiskManagerConfig {
                path: dir.path().join("pool.dat"),
                fsync_enabled: false,
            })
            .unwrap(),
        );
        (dir, BufferPool::new(BufferPoolConfig { num_frames }, disk))
    }

    #[test]
    fn test_buffer_pool_new() {
        let (_dir, pool) = create_test_pool(10);

        assert_eq!(pool.num_frames(), 10);
        assert_eq!(pool.free_count(), 10);
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn test_buffer_pool_new_page() {
        let (_dir, pool) = create_test_pool(10);

        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();

        assert!(page_id.is_valid());
        assert_eq!(guard.data()[0], 0);
        drop(guard);

        assert_eq!(pool.free_count(), 9);
        assert_eq!(pool.page_count(), 1);
        assert!(pool.contains(page_id));
    }

    #[test]
    fn test_buffer_pool_sequential_page_ids() {
        let (_dir, pool) = create_test_pool(10);

        let a = pool.new_page().unwrap().page_id();
        let b = pool.new_page().unwrap().page_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_buffer_pool_write_then_read() {
        let (_dir, pool) = create_test_pool(10);

        let page_id = {
            let mut guard = pool.new_page().unwrap();
            guard.data_mut()[0] = 0xAB;
            guard.page_id()
        };

        let guard = pool.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0], 0xAB);
    }

    #[test]
    fn test_buffer_pool_fetch_invalid() {
        let (_dir, pool) = create_test_pool(10);
        assert!(pool.fetch_page_read(PageId::INVALID).is_err());
    }

    #[test]
    fn test_buffer_pool_fetch_nonexistent() {
        let (_dir, pool) = create_test_pool(10);
        assert!(pool.fetch_page_read(PageId::new(99)).is_err());
    }

    #[test]
    fn test_buffer_pool_eviction_roundtrip() {
        let (_dir, pool) = create_test_pool(3);

        // Fill the pool with distinct marked pages
        let mut ids = Vec::new();
        for i in 0..3u8 {
            let mut guard = pool.new_page().unwrap();
            guard.data_mut()[0] = 0x10 + i;
            ids.push(guard.page_id());
        }

        // A fourth page forces an eviction (all guards dropped)
        let mut guard = pool.new_page().unwrap();
        guard.data_mut()[0] = 0x99;
        drop(guard);

        assert_eq!(pool.page_count(), 3);

        // Every earlier page must still read back correctly, reloaded
        // from disk if it was the victim.
        for (i, id) in ids.iter().enumerate() {
            let guard = pool.fetch_page_read(*id).unwrap();
            assert_eq!(guard.data()[0], 0x10 + i as u8);
        }
    }

    #[test]
    fn test_buffer_pool_full_all_pinned() {
        let (_dir, pool) = create_test_pool(2);

        let _g1 = pool.new_page().unwrap();
        let _g2 = pool.new_page().unwrap();

        let result = pool.new_page();
        assert!(matches!(result, Err(OpalError::BufferPoolFull)));
    }

    #[test]
    fn test_buffer_pool_delete_page() {
        let (_dir, pool) = create_test_pool(10);

        let page_id = pool.new_page().unwrap().page_id();
        assert!(pool.contains(page_id));

        assert!(pool.delete_page(page_id));
        assert!(!pool.contains(page_id));
        assert_eq!(pool.free_count(), 10);
    }

    #[test]
    fn test_buffer_pool_delete_pinned_page() {
        let (_dir, pool) = create_test_pool(10);

        let guard = pool.new_page().unwrap();
        let page_id = guard.page_id();

        assert!(!pool.delete_page(page_id));
        assert!(pool.contains(page_id));
        drop(guard);

        assert!(pool.delete_page(page_id));
    }

    #[test]
    fn test_buffer_pool_recycles_deleted_ids() {
        let (_dir, pool) = create_test_pool(10);

        let page_id = pool.new_page().unwrap().page_id();
        pool.delete_page(page_id);

        let recycled = pool.new_page().unwrap();
        assert_eq!(recycled.page_id(), page_id);
        // Recycled pages come back zeroed
        assert_eq!(recycled.data()[0], 0);
    }

    #[test]
    fn test_buffer_pool_flush_page() {
        let (_dir, pool) = create_test_pool(10);

        let page_id = {
            let mut guard = pool.new_page().unwrap();
            guard.data_mut()[7] = 0x77;
            guard.page_id()
        };

        assert!(pool.flush_page(page_id).unwrap());
        // Second flush is a no-op: page is clean now
        assert!(!pool.flush_page(page_id).unwrap());
    }

    #[test]
    fn test_buffer_pool_flush_all() {
        let (_dir, pool) = create_test_pool(10);

        for _ in 0..5 {
            let mut guard = pool.new_page().unwrap();
            guard.data_mut()[0] = 1;
        }

        assert_eq!(pool.flush_all().unwrap(), 5);
        assert_eq!(pool.flush_all().unwrap(), 0);
    }

    #[test]
    fn test_buffer_pool_read_guard_releases() {
        let (_dir, pool) = create_test_pool(10);

        let page_id = pool.new_page().unwrap().page_id();

        {
            let _guard = pool.fetch_page_read(page_id).unwrap();
        }

        // After the guard drops the page is unpinned and deletable
        assert!(pool.delete_page(page_id));
    }

    #[test]
    fn test_buffer_pool_concurrent_readers() {
        let (_dir, pool) = create_test_pool(10);
        let page_id = pool.new_page().unwrap().page_id();

        // Two read guards may coexist
        let g1 = pool.fetch_page_read(page_id).unwrap();
        let g2 = pool.fetch_page_read(page_id).unwrap();
        assert_eq!(g1.data()[0], g2.data()[0]);
    }

    #[test]
    fn test_buffer_pool_stats() {
        let (_dir, pool) = create_test_pool(10);

        let _pinned = pool.new_page().unwrap();
        let unpinned_id = pool.new_page().unwrap().page_id();
        let _ = unpinned_id;

        let stats = pool.stats();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.used_frames, 2);
        assert_eq!(stats.free_frames, 8);
        assert_eq!(stats.pinned_frames, 1);
        assert_eq!(stats.dirty_frames, 2);
    }
}
