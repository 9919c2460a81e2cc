use anyhow::{Error, Result};

use crate::buffer::buffer_manager::{BufferGuard, BufferManager};
use crate::common::{PageNo, INVALID_PAGE_NO};
use crate::storage::{RecordId, SlotNo};

use super::data_page::DataPage;
use super::dir_page::DirPage;

enum Step {
    Descend(PageNo),
    Advance(PageNo),
}

/// Sequential scan over every live record of a heap file.
///
/// Directory pages are visited in list order, their entries in index order
/// and each data page's slots in ascending slot number. At most one
/// directory page and one data page are pinned at a time; each is unpinned
/// before the scan moves past it. Mutating the file while a scan is active
/// yields undefined results.
pub struct HeapScan<'a> {
    buffer_manager: &'a BufferManager,
    dir_guard: Option<BufferGuard<'a>>,
    entry_index: u16,
    data_guard: Option<BufferGuard<'a>>,
    slot: SlotNo,
}

impl<'a> HeapScan<'a> {
    pub(in crate::storage::heap) fn open(
        buffer_manager: &'a BufferManager,
        head_id: PageNo,
    ) -> Result<Self> {
        let dir_guard = Self::pin(buffer_manager, head_id)?;
        Ok(Self {
            buffer_manager,
            dir_guard: Some(dir_guard),
            entry_index: 0,
            data_guard: None,
            slot: 0,
        })
    }

    fn pin(buffer_manager: &'a BufferManager, page_no: PageNo) -> Result<BufferGuard<'a>> {
        let buffer = buffer_manager.fetch(page_no)?;
        match buffer {
            None => Err(Error::msg(format!(
                "Could not fetch page {}. All buffers in buffer manager are pinned.",
                page_no
            ))),
            Some(buffer) => Ok(buffer),
        }
    }

    fn fetch_next(&mut self) -> Result<Option<(RecordId, Vec<u8>)>> {
        loop {
            if let Some(data_guard) = &self.data_guard {
                let found = {
                    let data = data_guard.read();
                    let page = DataPage::new(&*data);
                    let mut found = None;
                    while self.slot < page.slot_count() {
                        let slot = self.slot;
                        self.slot += 1;
                        if let Some(record) = page.record(slot) {
                            found = Some(((page.page_no(), slot), record.to_vec()));
                            break;
                        }
                    }
                    found
                };
                if found.is_some() {
                    return Ok(found);
                }
                // Data page exhausted: unpin it and move to the next entry.
                self.data_guard = None;
                self.entry_index += 1;
            } else if let Some(dir_guard) = &self.dir_guard {
                let step = {
                    let data = dir_guard.read();
                    let page = DirPage::new(&*data);
                    if self.entry_index < page.entry_count() {
                        Step::Descend(page.entry(self.entry_index).page_no)
                    } else {
                        Step::Advance(page.next_page())
                    }
                };
                match step {
                    Step::Descend(page_no) => {
                        self.slot = 0;
                        self.data_guard = Some(Self::pin(self.buffer_manager, page_no)?);
                    }
                    Step::Advance(next) => {
                        // Unpin the exhausted directory page before pinning
                        // its successor.
                        self.dir_guard = None;
                        self.entry_index = 0;
                        if next != INVALID_PAGE_NO {
                            self.dir_guard = Some(Self::pin(self.buffer_manager, next)?);
                        }
                    }
                }
            } else {
                return Ok(None);
            }
        }
    }
}

impl Iterator for HeapScan<'_> {
    type Item = Result<(RecordId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fetch_next().transpose()
    }
}
