use std::fmt;

use anyhow::{Error, Result};
use lazy_static::lazy_static;

use crate::buffer::buffer_manager::{BufferGuard, BufferManager};
use crate::common::{PageNo, INVALID_PAGE_NO, PAGE_SIZE};
use crate::storage::RecordId;

use super::data_page::{DataPage, MAX_RECORD_SIZE, SLOT_SIZE};
use super::dir_page::{DirEntry, DirPage, MAX_ENTRIES};
use super::error::HeapFileError;
use super::scan::HeapScan;

lazy_static! {
    static ref EMPTY_DATA_PAGE: [u8; PAGE_SIZE] = {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = DataPage::new(data.as_mut_slice());
        page.init(INVALID_PAGE_NO);
        data
    };
    static ref EMPTY_DIR_PAGE: [u8; PAGE_SIZE] = {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = DirPage::new(data.as_mut_slice());
        page.init(INVALID_PAGE_NO);
        data
    };
}

/// A heap file: an unordered collection of variable-length records spread
/// over data pages, with a linked list of directory pages tracking every
/// data page's record count and free space.
///
/// Named files are registered with the disk manager and can be reopened by
/// name. A temporary file has no registry entry and destroys itself when the
/// handle drops. The head directory page exists for the whole life of the
/// file; it is never freed, even once every entry is gone.
pub struct HeapFile<'a> {
    buffer_manager: &'a BufferManager,
    name: Option<String>,
    head_id: PageNo,
    destroyed: bool,
}

impl<'a> HeapFile<'a> {
    /// Opens the named heap file, creating and registering it first if the
    /// name is unknown.
    pub fn open(buffer_manager: &'a BufferManager, name: &str) -> Result<Self> {
        let head_id = match buffer_manager.disk().get_file_entry(name) {
            Some(head_id) => head_id,
            None => {
                let head_id = Self::create_empty(buffer_manager)?;
                buffer_manager.disk().add_file_entry(name, head_id)?;
                log::debug!("created heap file {name} with head directory page {head_id}");
                head_id
            }
        };
        Ok(Self {
            buffer_manager,
            name: Some(name.to_owned()),
            head_id,
            destroyed: false,
        })
    }

    /// Creates a heap file with no registry entry. Its pages are given back
    /// when the handle drops.
    pub fn temporary(buffer_manager: &'a BufferManager) -> Result<Self> {
        let head_id = Self::create_empty(buffer_manager)?;
        log::debug!("created temporary heap file with head directory page {head_id}");
        Ok(Self {
            buffer_manager,
            name: None,
            head_id,
            destroyed: false,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Frees every page of the file and removes its registry entry. The
    /// handle is consumed; nothing can be called on the file afterwards.
    pub fn destroy(mut self) -> Result<()> {
        self.destroyed = true;
        self.destroy_pages()?;
        if let Some(name) = self.name.take() {
            self.buffer_manager.disk().delete_file_entry(&name)?;
            log::debug!("destroyed heap file {name}");
        }
        Ok(())
    }

    /// Stores the record and returns its record id.
    pub fn insert_record(&self, record: &[u8]) -> Result<RecordId> {
        if record.len() > MAX_RECORD_SIZE {
            return Err(HeapFileError::RecordTooLarge {
                size: record.len(),
                max: MAX_RECORD_SIZE,
            }
            .into());
        }

        let page_no = self.avail_page(record.len())?;
        let guard = self.fetch_page(page_no)?;
        let (slot, free_count) = {
            let mut data = guard.write();
            let mut page = DataPage::new(&mut *data);
            let slot = page.insert(record).ok_or_else(|| {
                Error::msg(format!(
                    "Directory advertised room for {} bytes on page {} but the insert did not fit",
                    record.len(),
                    page_no
                ))
            })?;
            (slot, page.free_space() as u16)
        };
        drop(guard);

        self.update_dir_entry(page_no, 1, free_count)?;
        Ok((page_no, slot))
    }

    /// Returns a copy of the record's bytes. The copy is taken while the
    /// page is pinned; the frame may be reused for another page right after.
    pub fn select_record(&self, rid: RecordId) -> Result<Vec<u8>> {
        let guard = self.fetch_data_page(rid)?;
        let data = guard.read();
        let page = DataPage::new(&*data);
        let record = page.record(rid.1).ok_or(HeapFileError::InvalidRid {
            page_no: rid.0,
            slot: rid.1,
        })?;
        Ok(record.to_vec())
    }

    /// Replaces the record's bytes in place. The new record must have the
    /// same length as the stored one.
    pub fn update_record(&self, rid: RecordId, record: &[u8]) -> Result<()> {
        let guard = self.fetch_data_page(rid)?;
        {
            // Validate against the read view, so a bad rid leaves the frame clean.
            let data = guard.read();
            let page = DataPage::new(&*data);
            let existing = page.record(rid.1).ok_or(HeapFileError::InvalidRid {
                page_no: rid.0,
                slot: rid.1,
            })?;
            if existing.len() != record.len() {
                return Err(HeapFileError::RecordLengthMismatch {
                    expected: existing.len(),
                    actual: record.len(),
                }
                .into());
            }
        }
        let mut data = guard.write();
        DataPage::new(&mut *data).overwrite(rid.1, record);
        Ok(())
    }

    /// Deletes the record. A data page left without records is given back to
    /// the disk manager, and so is a directory page left without entries,
    /// unless it is the head.
    pub fn delete_record(&self, rid: RecordId) -> Result<()> {
        let guard = self.fetch_data_page(rid)?;
        {
            let data = guard.read();
            if DataPage::new(&*data).record(rid.1).is_none() {
                return Err(HeapFileError::InvalidRid {
                    page_no: rid.0,
                    slot: rid.1,
                }
                .into());
            }
        }
        let free_count = {
            let mut data = guard.write();
            let mut page = DataPage::new(&mut *data);
            page.remove(rid.1);
            page.free_space() as u16
        };
        drop(guard);

        self.update_dir_entry(rid.0, -1, free_count)
    }

    /// Number of live records, summed over every directory entry.
    pub fn record_count(&self) -> Result<u64> {
        let mut count = 0u64;
        let mut dir_no = self.head_id;
        while dir_no != INVALID_PAGE_NO {
            let guard = self.fetch_page(dir_no)?;
            let data = guard.read();
            let page = DirPage::new(&*data);
            for index in 0..page.entry_count() {
                count += page.entry(index).record_count as u64;
            }
            dir_no = page.next_page();
        }
        Ok(count)
    }

    /// Starts a sequential scan over every live record.
    pub fn scan(&self) -> Result<HeapScan<'a>> {
        HeapScan::open(self.buffer_manager, self.head_id)
    }

    /// Finds the first data page with at least `record_len` plus one slot's
    /// worth of free bytes, walking the directory in list order. Allocates a
    /// fresh data page when no existing one qualifies.
    fn avail_page(&self, record_len: usize) -> Result<PageNo> {
        let needed = record_len + SLOT_SIZE;
        let mut dir_no = self.head_id;
        while dir_no != INVALID_PAGE_NO {
            let guard = self.fetch_page(dir_no)?;
            let data = guard.read();
            let page = DirPage::new(&*data);
            for index in 0..page.entry_count() {
                let entry = page.entry(index);
                if entry.free_count as usize >= needed {
                    return Ok(entry.page_no);
                }
            }
            dir_no = page.next_page();
        }
        self.insert_page()
    }

    /// Locates the directory entry describing the given data page. The
    /// returned directory page is still pinned; dropping the guard unpins
    /// it, so the caller decides whether the entry gets mutated first.
    fn find_dir_entry(&self, page_no: PageNo) -> Result<Option<(BufferGuard<'a>, u16)>> {
        let mut dir_no = self.head_id;
        while dir_no != INVALID_PAGE_NO {
            let guard = self.fetch_page(dir_no)?;
            let (found, next) = {
                let data = guard.read();
                let page = DirPage::new(&*data);
                (page.find_entry(page_no), page.next_page())
            };
            if let Some(index) = found {
                return Ok(Some((guard, index)));
            }
            dir_no = next;
        }
        Ok(None)
    }

    /// Applies a record-count delta and the new free count to the data
    /// page's directory entry. A record count that drops below one hands the
    /// page over to [Self::delete_page].
    fn update_dir_entry(&self, page_no: PageNo, delta_rec: i32, free_count: u16) -> Result<()> {
        let (guard, index) = self.find_dir_entry(page_no)?.ok_or_else(|| {
            Error::msg(format!("No directory entry for data page {}", page_no))
        })?;

        let record_count = {
            let mut data = guard.write();
            let mut page = DirPage::new(&mut *data);
            let mut entry = page.entry(index);
            let new_count = entry.record_count as i32 + delta_rec;
            debug_assert!(new_count >= 0, "record count of page {} went negative", page_no);
            entry.record_count = new_count.max(0) as u16;
            entry.free_count = free_count;
            page.set_entry(index, entry);
            entry.record_count
        };

        if record_count < 1 {
            self.delete_page(page_no, guard, index)?;
        }
        Ok(())
    }

    /// Allocates one data page and installs an entry for it on the first
    /// directory page with spare capacity, chaining a new directory page at
    /// the tail when every existing one is full. Returns the data page's
    /// number with all pages unpinned.
    fn insert_page(&self) -> Result<PageNo> {
        let mut dir_no = self.head_id;
        loop {
            let guard = self.fetch_page(dir_no)?;
            let (entry_count, next) = {
                let data = guard.read();
                let page = DirPage::new(&*data);
                (page.entry_count(), page.next_page())
            };

            if entry_count < MAX_ENTRIES {
                let data_page_no = self.buffer_manager.disk().allocate_page()?;
                let data_guard = self.install_page(data_page_no, EMPTY_DATA_PAGE.as_slice())?;
                let free_count = {
                    let mut data = data_guard.write();
                    let mut page = DataPage::new(&mut *data);
                    page.set_page_no(data_page_no);
                    page.free_space() as u16
                };
                drop(data_guard);

                let mut data = guard.write();
                DirPage::new(&mut *data).push_entry(DirEntry {
                    page_no: data_page_no,
                    record_count: 0,
                    free_count,
                });
                log::debug!("added data page {data_page_no} to directory page {dir_no}");
                return Ok(data_page_no);
            }

            if next != INVALID_PAGE_NO {
                dir_no = next;
                continue;
            }

            // Every directory page is full: chain a fresh one at the tail and
            // let the next iteration place the data page on it.
            let new_dir_no = self.buffer_manager.disk().allocate_page()?;
            {
                let mut data = guard.write();
                DirPage::new(&mut *data).set_next_page(new_dir_no);
            }
            drop(guard);

            let new_guard = self.install_page(new_dir_no, EMPTY_DIR_PAGE.as_slice())?;
            {
                let mut data = new_guard.write();
                let mut page = DirPage::new(&mut *data);
                page.set_page_no(new_dir_no);
                page.set_prev_page(dir_no);
            }
            log::debug!("chained new directory page {new_dir_no} after {dir_no}");
            dir_no = new_dir_no;
        }
    }

    /// Reclaims an empty data page and removes its directory entry. A
    /// directory page this leaves without entries is spliced out of the list
    /// and freed, except for the head, which is kept for the life of the
    /// file with its entry cleared.
    fn delete_page(&self, data_page_no: PageNo, dir_guard: BufferGuard<'a>, index: u16) -> Result<()> {
        let (dir_no, prev, next, entry_count) = {
            let data = dir_guard.read();
            let page = DirPage::new(&*data);
            (
                page.page_no(),
                page.prev_page(),
                page.next_page(),
                page.entry_count(),
            )
        };

        if entry_count < 2 && dir_no != self.head_id {
            if prev != INVALID_PAGE_NO {
                let prev_guard = self.fetch_page(prev)?;
                let mut data = prev_guard.write();
                DirPage::new(&mut *data).set_next_page(next);
            }
            if next != INVALID_PAGE_NO {
                let next_guard = self.fetch_page(next)?;
                let mut data = next_guard.write();
                DirPage::new(&mut *data).set_prev_page(prev);
            }
            drop(dir_guard);
            self.buffer_manager.free_page(dir_no)?;
            log::debug!("spliced empty directory page {dir_no} out of the list");
        } else {
            let mut data = dir_guard.write();
            DirPage::new(&mut *data).remove_entry(index);
        }

        log::debug!("reclaimed empty data page {data_page_no}");
        self.buffer_manager.free_page(data_page_no)
    }

    /// Pins the data page a record id points at, rejecting page numbers that
    /// are unallocated or do not hold a data page.
    fn fetch_data_page(&self, rid: RecordId) -> Result<BufferGuard<'a>> {
        let (page_no, slot) = rid;
        if page_no == INVALID_PAGE_NO || !self.buffer_manager.disk().is_allocated(page_no) {
            return Err(HeapFileError::InvalidRid { page_no, slot }.into());
        }
        let guard = self.fetch_page(page_no)?;
        {
            let data = guard.read();
            if !DataPage::new(&*data).is_data_page() {
                return Err(HeapFileError::InvalidRid { page_no, slot }.into());
            }
        }
        Ok(guard)
    }

    fn fetch_page(&self, page_no: PageNo) -> Result<BufferGuard<'a>> {
        let buffer = self.buffer_manager.fetch(page_no)?;
        match buffer {
            None => Err(Error::msg(format!(
                "Could not fetch page {}. All buffers in buffer manager are pinned.",
                page_no
            ))),
            Some(buffer) => Ok(buffer),
        }
    }

    fn install_page(&self, page_no: PageNo, image: &[u8]) -> Result<BufferGuard<'a>> {
        let buffer = self.buffer_manager.install_page(page_no, image)?;
        match buffer {
            None => Err(Error::msg(format!(
                "Could not install page {}. All buffers in buffer manager are pinned.",
                page_no
            ))),
            Some(buffer) => Ok(buffer),
        }
    }

    fn create_empty(buffer_manager: &BufferManager) -> Result<PageNo> {
        let head_id = buffer_manager.disk().allocate_page()?;
        let guard = buffer_manager
            .install_page(head_id, EMPTY_DIR_PAGE.as_slice())?
            .ok_or_else(|| {
                Error::msg(format!(
                    "Could not install page {}. All buffers in buffer manager are pinned.",
                    head_id
                ))
            })?;
        let mut data = guard.write();
        DirPage::new(&mut *data).set_page_no(head_id);
        Ok(head_id)
    }

    fn destroy_pages(&mut self) -> Result<()> {
        let mut dir_no = self.head_id;
        while dir_no != INVALID_PAGE_NO {
            let next;
            {
                let guard = self.fetch_page(dir_no)?;
                let data = guard.read();
                let page = DirPage::new(&*data);
                for index in 0..page.entry_count() {
                    self.buffer_manager.free_page(page.entry(index).page_no)?;
                }
                next = page.next_page();
            }
            self.buffer_manager.free_page(dir_no)?;
            dir_no = next;
        }
        Ok(())
    }
}

impl fmt::Display for HeapFile<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name),
            None => f.write_str("(temporary)"),
        }
    }
}

impl Drop for HeapFile<'_> {
    fn drop(&mut self) {
        if self.name.is_none() && !self.destroyed {
            if let Err(error) = self.destroy_pages() {
                log::error!("could not destroy temporary heap file: {error:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use std::collections::HashMap;
    use std::sync::Once;

    use anyhow::Result;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::{tempdir, TempDir};

    use super::{DirPage, HeapFile, MAX_ENTRIES, MAX_RECORD_SIZE};
    use crate::buffer::buffer_manager::BufferManager;
    use crate::common::INVALID_PAGE_NO;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::heap::HeapFileError;
    use crate::storage::RecordId;

    static INIT: Once = Once::new();

    fn setup(pool_size: usize) -> Result<(TempDir, BufferManager)> {
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
        let data_dir = tempdir()?;
        let disk_manager = DiskManager::new(data_dir.path().join("heap.db"))?;
        Ok((data_dir, BufferManager::new(disk_manager, pool_size)))
    }

    fn random_record(rng: &mut StdRng, len: usize) -> Vec<u8> {
        (0..len).map(|_| rng.gen()).collect()
    }

    /// Big enough that no two of them share a data page.
    const ONE_PER_PAGE: usize = MAX_RECORD_SIZE / 2 + 32;

    #[test]
    fn a_new_file_is_empty() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "fresh")?;

        assert_eq!(file.record_count()?, 0);
        assert_eq!(file.scan()?.count(), 0);
        assert_eq!(file.to_string(), "fresh");
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }

    #[test]
    fn records_round_trip() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "roundtrip")?;
        let mut rng = StdRng::seed_from_u64(7);

        for len in [0usize, 1, 100, 4096, MAX_RECORD_SIZE] {
            let record = random_record(&mut rng, len);
            let rid = file.insert_record(&record)?;
            assert_eq!(file.select_record(rid)?, record);
        }
        assert_eq!(file.record_count()?, 5);
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }

    #[test]
    fn fixed_length_records_fill_the_first_page_sequentially() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "sequential")?;

        let rids = (0..3)
            .map(|i| file.insert_record(&[i as u8; 100]))
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(rids[0].0, rids[1].0, "Same-length records should share the first page");
        assert_eq!(rids[1].0, rids[2].0);
        assert_eq!((rids[0].1, rids[1].1, rids[2].1), (0, 1, 2));
        assert_eq!(file.record_count()?, 3);

        Ok(())
    }

    #[test]
    fn oversized_records_are_rejected() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "bounds")?;

        let exactly_max = vec![1u8; MAX_RECORD_SIZE];
        let rid = file.insert_record(&exactly_max)?;
        assert_eq!(file.select_record(rid)?, exactly_max);

        let error = file.insert_record(&vec![1u8; MAX_RECORD_SIZE + 1]).unwrap_err();
        assert_eq!(
            error.downcast_ref::<HeapFileError>(),
            Some(&HeapFileError::RecordTooLarge {
                size: MAX_RECORD_SIZE + 1,
                max: MAX_RECORD_SIZE
            })
        );
        assert_eq!(file.record_count()?, 1);
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }

    #[test]
    fn updates_replace_bytes_in_place() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "updates")?;

        let rid = file.insert_record(b"original")?;
        file.update_record(rid, b"replaced")?;
        assert_eq!(file.select_record(rid)?, b"replaced");

        let error = file.update_record(rid, b"wrong length").unwrap_err();
        assert_eq!(
            error.downcast_ref::<HeapFileError>(),
            Some(&HeapFileError::RecordLengthMismatch {
                expected: 8,
                actual: 12
            })
        );
        assert_eq!(file.select_record(rid)?, b"replaced");
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }

    #[test]
    fn stale_and_unknown_rids_are_invalid() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "rids")?;

        let rid = file.insert_record(b"here and gone")?;
        let other = file.insert_record(b"stays")?;
        file.delete_record(rid)?;

        for bad in [rid, (rid.0, 99), (9999, 0), (INVALID_PAGE_NO, 0)] {
            let error = file.select_record(bad).unwrap_err();
            assert!(
                matches!(
                    error.downcast_ref::<HeapFileError>(),
                    Some(HeapFileError::InvalidRid { .. })
                ),
                "Expected InvalidRid for {:?}, got {:?}",
                bad,
                error
            );
        }
        assert!(file.delete_record(rid).is_err());
        assert!(file.update_record(rid, b"nope").is_err());

        // A directory page is not a data page, so its number is no valid rid
        // target either.
        let error = file.select_record((file.head_id, 0)).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<HeapFileError>(),
            Some(HeapFileError::InvalidRid { .. })
        ));

        assert_eq!(file.select_record(other)?, b"stays");
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }

    #[test]
    fn record_count_follows_inserts_and_deletes() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "counted")?;
        let mut rng = StdRng::seed_from_u64(99);

        let mut live: HashMap<RecordId, Vec<u8>> = HashMap::new();
        for _ in 0..200 {
            let len = rng.gen_range(1..600);
            let record = random_record(&mut rng, len);
            let rid = file.insert_record(&record)?;
            assert!(live.insert(rid, record).is_none(), "Live rids must be unique");
        }
        let doomed: Vec<RecordId> = live
            .keys()
            .copied()
            .filter(|_| rng.gen_bool(0.4))
            .collect();
        for rid in doomed {
            file.delete_record(rid)?;
            live.remove(&rid);
        }

        assert_eq!(file.record_count()?, live.len() as u64);
        for (rid, record) in &live {
            assert_eq!(&file.select_record(*rid)?, record);
        }

        let mut seen = HashMap::new();
        for item in file.scan()? {
            let (rid, record) = item?;
            assert!(seen.insert(rid, record).is_none());
        }
        assert_eq!(seen, live);
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }

    #[test]
    fn a_full_data_page_forces_a_second_one() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "growing")?;

        // Four of these fit on one page; the fifth does not.
        let record = [7u8; 2000];
        let rids = (0..5)
            .map(|_| file.insert_record(&record))
            .collect::<Result<Vec<_>>>()?;

        let first_page = rids[0].0;
        assert!(rids[..4].iter().all(|rid| rid.0 == first_page));
        assert_ne!(rids[4].0, first_page, "The fifth record needs a new data page");

        let head = file.fetch_page(file.head_id)?;
        let data = head.read();
        let page = DirPage::new(&*data);
        assert_eq!(page.entry_count(), 2);
        assert_eq!(page.entry(0).page_no, first_page);
        assert_eq!(page.entry(0).record_count, 4);
        assert_eq!(page.entry(1).page_no, rids[4].0);
        assert_eq!(page.entry(1).record_count, 1);
        drop(data);
        drop(head);

        assert_eq!(file.scan()?.count(), 5);

        Ok(())
    }

    #[test]
    fn an_emptied_data_page_is_reclaimed() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "reclaim")?;

        let first = file.insert_record(&[1u8; ONE_PER_PAGE])?;
        let second = file.insert_record(&[2u8; ONE_PER_PAGE])?;
        assert_ne!(first.0, second.0);
        let pages_before = buffer_manager.disk().allocated_page_count();

        file.delete_record(second)?;

        assert!(!buffer_manager.disk().is_allocated(second.0));
        assert_eq!(buffer_manager.disk().allocated_page_count(), pages_before - 1);
        {
            let head = file.fetch_page(file.head_id)?;
            let data = head.read();
            let page = DirPage::new(&*data);
            assert_eq!(page.entry_count(), 1);
            assert_eq!(page.entry(0).page_no, first.0);
        }
        assert_eq!(file.record_count()?, 1);
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }

    #[test]
    fn the_head_directory_page_is_never_freed() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "headstrong")?;
        let head_id = file.head_id;

        let rid = file.insert_record(b"only one")?;
        file.delete_record(rid)?;

        assert!(buffer_manager.disk().is_allocated(head_id));
        {
            let head = file.fetch_page(head_id)?;
            let data = head.read();
            let page = DirPage::new(&*data);
            assert_eq!(page.entry_count(), 0);
            assert_eq!(page.next_page(), INVALID_PAGE_NO);
        }
        assert_eq!(file.record_count()?, 0);

        // The file stays fully usable through its retained head page.
        let rid = file.insert_record(b"back again")?;
        assert_eq!(file.select_record(rid)?, b"back again");
        assert_eq!(file.head_id, head_id);

        Ok(())
    }

    #[test]
    fn slot_reuse_after_delete_keeps_the_file_consistent() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "churn")?;

        let keeper = file.insert_record(b"keeper")?;
        let first = file.insert_record(b"roundone")?;
        file.delete_record(first)?;
        let second = file.insert_record(b"roundtwo")?;

        assert_eq!(file.record_count()?, 2);
        assert_eq!(file.select_record(second)?, b"roundtwo");
        assert_eq!(file.select_record(keeper)?, b"keeper");

        Ok(())
    }

    #[test]
    fn a_full_head_directory_page_chains_a_second_one() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(16)?;
        let file = HeapFile::open(&buffer_manager, "chained")?;

        // One record per data page; the head directory page holds MAX_ENTRIES
        // of them, so one more spills onto a freshly chained directory page.
        let record = vec![3u8; ONE_PER_PAGE];
        let mut rids = Vec::new();
        for _ in 0..MAX_ENTRIES as usize + 1 {
            rids.push(file.insert_record(&record)?);
        }

        let second_dir_no = {
            let head = file.fetch_page(file.head_id)?;
            let data = head.read();
            let page = DirPage::new(&*data);
            assert_eq!(page.entry_count(), MAX_ENTRIES);
            assert_eq!(page.prev_page(), INVALID_PAGE_NO);
            page.next_page()
        };
        assert_ne!(second_dir_no, INVALID_PAGE_NO);
        {
            let second = file.fetch_page(second_dir_no)?;
            let data = second.read();
            let page = DirPage::new(&*data);
            assert_eq!(page.prev_page(), file.head_id);
            assert_eq!(page.next_page(), INVALID_PAGE_NO);
            assert_eq!(page.entry_count(), 1);
            assert_eq!(page.entry(0).page_no, rids.last().unwrap().0);
        }

        assert_eq!(file.record_count()?, MAX_ENTRIES as u64 + 1);
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }

    #[test]
    fn emptied_directory_pages_are_spliced_out_of_the_list() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(16)?;
        let file = HeapFile::open(&buffer_manager, "spliced")?;

        // Three directory pages: the head and the second full, the third with
        // a single entry.
        let record = vec![9u8; ONE_PER_PAGE];
        let mut rids = Vec::new();
        for _ in 0..2 * MAX_ENTRIES as usize + 1 {
            rids.push(file.insert_record(&record)?);
        }

        let (second_dir_no, third_dir_no) = {
            let head = file.fetch_page(file.head_id)?;
            let data = head.read();
            let second_dir_no = DirPage::new(&*data).next_page();
            drop(data);
            drop(head);
            let second = file.fetch_page(second_dir_no)?;
            let data = second.read();
            let third_dir_no = DirPage::new(&*data).next_page();
            (second_dir_no, third_dir_no)
        };
        assert_ne!(third_dir_no, INVALID_PAGE_NO);

        // Emptying every data page of the middle directory page splices it
        // out: the head and the tail join up.
        for rid in &rids[MAX_ENTRIES as usize..2 * MAX_ENTRIES as usize] {
            file.delete_record(*rid)?;
        }
        assert!(!buffer_manager.disk().is_allocated(second_dir_no));
        {
            let head = file.fetch_page(file.head_id)?;
            let data = head.read();
            assert_eq!(DirPage::new(&*data).next_page(), third_dir_no);
        }
        {
            let third = file.fetch_page(third_dir_no)?;
            let data = third.read();
            assert_eq!(DirPage::new(&*data).prev_page(), file.head_id);
        }

        // Emptying the tail directory page splices it as well, leaving the
        // head alone at the end of the list.
        file.delete_record(*rids.last().unwrap())?;
        assert!(!buffer_manager.disk().is_allocated(third_dir_no));
        {
            let head = file.fetch_page(file.head_id)?;
            let data = head.read();
            assert_eq!(DirPage::new(&*data).next_page(), INVALID_PAGE_NO);
        }

        assert_eq!(file.record_count()?, MAX_ENTRIES as u64);
        assert_eq!(file.scan()?.count(), MAX_ENTRIES as usize);
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }

    #[test]
    fn destroy_frees_every_page_and_the_registry_entry() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "doomed")?;

        for i in 0..30u8 {
            file.insert_record(&[i; 1500])?;
        }
        assert!(buffer_manager.disk().allocated_page_count() > 1);

        file.destroy()?;

        assert_eq!(buffer_manager.disk().allocated_page_count(), 0);
        assert_eq!(buffer_manager.disk().get_file_entry("doomed"), None);
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        // The name is free for a brand new file.
        let reborn = HeapFile::open(&buffer_manager, "doomed")?;
        assert_eq!(reborn.record_count()?, 0);

        Ok(())
    }

    #[test]
    fn temporary_files_destroy_themselves_on_drop() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;

        {
            let temp = HeapFile::temporary(&buffer_manager)?;
            assert_eq!(temp.to_string(), "(temporary)");
            assert_eq!(temp.name(), None);
            for i in 0..100u8 {
                temp.insert_record(&[i; 500])?;
            }
            assert!(buffer_manager.disk().allocated_page_count() > 1);
        }

        assert_eq!(buffer_manager.disk().allocated_page_count(), 0);
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }

    #[test]
    fn named_files_reopen_by_name() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;

        let head_id = {
            let file = HeapFile::open(&buffer_manager, "persistent")?;
            let rid = file.insert_record(b"going away")?;
            file.delete_record(rid)?;
            assert_eq!(file.record_count()?, 0);
            file.head_id
            // Dropping a named handle leaves the file alone.
        };

        assert_eq!(
            buffer_manager.disk().get_file_entry("persistent"),
            Some(head_id)
        );

        let file = HeapFile::open(&buffer_manager, "persistent")?;
        assert_eq!(file.head_id, head_id);
        assert_eq!(file.record_count()?, 0);
        assert_eq!(file.scan()?.count(), 0);

        let rid = file.insert_record(b"still here")?;
        assert_eq!(file.select_record(rid)?, b"still here");
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }

    #[test]
    fn every_operation_leaves_the_pin_counts_balanced() -> Result<()> {
        let (_data_dir, buffer_manager) = setup(8)?;
        let file = HeapFile::open(&buffer_manager, "balanced")?;

        let rid = file.insert_record(b"pinned down")?;
        assert_eq!(buffer_manager.pinned_page_count(), 0);
        file.select_record(rid)?;
        assert_eq!(buffer_manager.pinned_page_count(), 0);
        file.update_record(rid, b"pinned down")?;
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        // Error paths release their pins too.
        assert!(file.select_record((rid.0, 77)).is_err());
        assert_eq!(buffer_manager.pinned_page_count(), 0);
        assert!(file.update_record(rid, b"too short").is_err());
        assert_eq!(buffer_manager.pinned_page_count(), 0);
        assert!(file.insert_record(&vec![0u8; MAX_RECORD_SIZE + 1]).is_err());
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        file.delete_record(rid)?;
        assert_eq!(buffer_manager.pinned_page_count(), 0);
        file.record_count()?;
        assert_eq!(buffer_manager.pinned_page_count(), 0);

        Ok(())
    }
}
