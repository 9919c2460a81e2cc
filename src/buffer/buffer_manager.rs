use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{atomic::AtomicBool, RwLock};
use std::sync::{Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};

use anyhow::Result;

use crate::common::{PageNo, INVALID_PAGE_NO, PAGE_SIZE};
use crate::storage::disk_manager::DiskManager;

use super::clock_replacer::ClockReplacer;
use super::PoolPos;

/// A pinned page frame. The page stays resident while the guard lives and is
/// unpinned when the guard drops, so a pin can never leak past its scope.
pub struct BufferGuard<'a> {
    buffer_manager: &'a BufferManager,
    buffer: &'a Buffer,
}

impl<'a> BufferGuard<'a> {
    fn new(buffer_manager: &'a BufferManager, buffer: &'a Buffer) -> Self {
        Self {
            buffer_manager,
            buffer,
        }
    }

    pub fn read(&self) -> RwLockReadGuard<[u8]> {
        self.buffer.data().read().unwrap()
    }

    /// Grants mutable access to the frame and marks it dirty, so the page is
    /// written back before the frame is reused.
    pub fn write(&self) -> RwLockWriteGuard<[u8]> {
        self.buffer.mark_dirty();
        self.buffer.data().write().unwrap()
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        self.buffer_manager.unpin(self.buffer)
    }
}

struct Buffer {
    pool_pos: PoolPos,
    page_no: RwLock<PageNo>,
    dirty: AtomicBool,
    data: RwLock<[u8; PAGE_SIZE]>,
}

impl Buffer {
    fn new(pool_pos: PoolPos) -> Self {
        Self {
            pool_pos,
            page_no: RwLock::new(INVALID_PAGE_NO),
            dirty: AtomicBool::new(false),
            data: RwLock::new([0; PAGE_SIZE]),
        }
    }

    fn page_no(&self) -> PageNo {
        *self.page_no.read().unwrap()
    }

    fn change_page(&self, new_page_no: PageNo) {
        self.dirty.store(false, Ordering::Relaxed);
        let mut page_no = self.page_no.write().unwrap();
        *page_no = new_page_no;
    }

    fn data(&self) -> &RwLock<[u8]> {
        &self.data
    }

    fn dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }
}

/// BufferManager caches disk pages in a fixed pool of frames and tracks which
/// frames are pinned. Frames are handed out as [BufferGuard]s; an unpinned
/// frame may be evicted to make room, with dirty contents written back first.
pub struct BufferManager {
    pool: Box<[Buffer]>,
    clock_replacer: Mutex<ClockReplacer>,
    page_no_to_pool_pos: Mutex<HashMap<PageNo, PoolPos>>,
    disk_manager: DiskManager,
}

impl BufferManager {
    pub fn new(disk_manager: DiskManager, pool_size: usize) -> Self {
        let clock_replacer = ClockReplacer::new(pool_size);
        let pool = (0..pool_size).map(Buffer::new).collect();

        Self {
            pool,
            clock_replacer: Mutex::new(clock_replacer),
            page_no_to_pool_pos: Mutex::new(HashMap::new()),
            disk_manager,
        }
    }

    pub fn disk(&self) -> &DiskManager {
        &self.disk_manager
    }

    /// Pins the given page, reading it from disk unless it is already frame
    /// resident. Returns None if every frame is currently pinned.
    pub fn fetch(&self, page_no: PageNo) -> Result<Option<BufferGuard>> {
        let mut page_no_to_pool_pos = self.page_no_to_pool_pos.lock().unwrap();
        let mut clock_replacer = self.clock_replacer.lock().unwrap();

        if let Some(&pool_pos) = page_no_to_pool_pos.get(&page_no) {
            let buffer = self.pool.get(pool_pos).unwrap();
            clock_replacer.pin(pool_pos);
            let guard = BufferGuard::new(self, buffer);
            return Ok(Some(guard));
        }

        if let Some(free_pool_pos) = clock_replacer.victim() {
            let buffer = &self.pool[free_pool_pos];
            self.remove_page(&mut page_no_to_pool_pos, buffer)?;
            let mut data = buffer.data.write().unwrap();
            self.disk_manager.read_page(page_no, data.as_mut_slice())?;
            drop(data);
            buffer.change_page(page_no);
            page_no_to_pool_pos.insert(page_no, free_pool_pos);
            clock_replacer.pin(free_pool_pos);
            let guard = BufferGuard::new(self, buffer);
            Ok(Some(guard))
        } else {
            Ok(None)
        }
    }

    /// Pins the given page and overwrites its frame with the provided image,
    /// skipping the disk read entirely. Used to install freshly allocated
    /// pages whose on-disk contents are irrelevant. The frame is marked dirty
    /// so the image survives eviction. Returns None if every frame is pinned.
    pub fn install_page(&self, page_no: PageNo, image: &[u8]) -> Result<Option<BufferGuard>> {
        let mut page_no_to_pool_pos = self.page_no_to_pool_pos.lock().unwrap();
        let mut clock_replacer = self.clock_replacer.lock().unwrap();
        debug_assert!(
            !page_no_to_pool_pos.contains_key(&page_no),
            "page {} is already frame resident",
            page_no
        );

        if let Some(free_pool_pos) = clock_replacer.victim() {
            let buffer = &self.pool[free_pool_pos];
            self.remove_page(&mut page_no_to_pool_pos, buffer)?;
            let mut data = buffer.data.write().unwrap();
            data.copy_from_slice(image);
            drop(data);
            buffer.change_page(page_no);
            buffer.mark_dirty();
            page_no_to_pool_pos.insert(page_no, free_pool_pos);
            clock_replacer.pin(free_pool_pos);
            let guard = BufferGuard::new(self, buffer);
            Ok(Some(guard))
        } else {
            Ok(None)
        }
    }

    /// Drops the page from the pool without writing it back and returns it to
    /// the disk manager. The page must not be pinned.
    pub fn free_page(&self, page_no: PageNo) -> Result<()> {
        let mut page_no_to_pool_pos = self.page_no_to_pool_pos.lock().unwrap();
        let clock_replacer = self.clock_replacer.lock().unwrap();

        if let Some(pool_pos) = page_no_to_pool_pos.remove(&page_no) {
            debug_assert_eq!(
                clock_replacer.pin_count(pool_pos),
                0,
                "page {} is freed while pinned",
                page_no
            );
            self.pool[pool_pos].change_page(INVALID_PAGE_NO);
        }
        drop(clock_replacer);
        drop(page_no_to_pool_pos);

        self.disk_manager.deallocate_page(page_no)
    }

    /// Number of distinct frames currently pinned. Every operation of the
    /// storage layer must leave this value the way it found it.
    pub fn pinned_page_count(&self) -> usize {
        self.clock_replacer.lock().unwrap().pinned()
    }

    fn unpin(&self, buffer: &Buffer) {
        let pool_pos = buffer.pool_pos;
        let mut clock_replacer = self.clock_replacer.lock().unwrap();
        clock_replacer.unpin(pool_pos);
    }

    fn remove_page(
        &self,
        page_no_to_pool_pos: &mut MutexGuard<HashMap<PageNo, PoolPos>>,
        buffer: &Buffer,
    ) -> Result<()> {
        let page_no = buffer.page_no();
        if page_no != INVALID_PAGE_NO {
            page_no_to_pool_pos.remove(&page_no);
            if buffer.dirty() {
                let data = buffer.data.read().unwrap();
                self.disk_manager.write_page(page_no, data.as_slice())?;
            }
        }
        Ok(())
    }
}
