use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::os::unix::prelude::FileExt;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Error, Result};

use crate::common::{PageNo, INVALID_PAGE_NO, PAGE_SIZE};

struct DiskState {
    /// Page number handed out by the next file-extending allocation.
    next_page_no: PageNo,
    /// Deallocated pages, reused lowest-first.
    free_pages: BTreeSet<PageNo>,
    /// Registry of named files: name to head page number.
    file_entries: HashMap<String, PageNo>,
}

/// DiskManager owns the database file and hands out fixed-size pages from it.
/// Pages are addressed by page number, starting at 1; page number 0 is the
/// invalid sentinel. It also keeps the registry mapping a file name to the
/// head page of that file.
///
/// The registry lives in memory for the lifetime of this DiskManager. Making
/// it survive a crash is recovery territory and out of scope here.
pub struct DiskManager {
    db_file: File,
    state: Mutex<DiskState>,
}

impl DiskManager {
    /// Opens the database file at the given path, creating it if absent.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        let db_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&db_path)
            .with_context(|| format!("Could not open database file {}", db_path.display()))?;

        let size = db_file
            .metadata()
            .with_context(|| format!("Could not read size of database file {}", db_path.display()))?
            .len();
        if size % PAGE_SIZE as u64 != 0 {
            return Err(Error::msg(format!(
                "Boundary check for database file {} failed. {} is not divisable by page size {}",
                db_path.display(),
                size,
                PAGE_SIZE
            )));
        }

        let next_page_no = (size / PAGE_SIZE as u64).max(1) as PageNo;
        Ok(Self {
            db_file,
            state: Mutex::new(DiskState {
                next_page_no,
                free_pages: BTreeSet::new(),
                file_entries: HashMap::new(),
            }),
        })
    }

    /// Reserves a fresh page and returns its page number. A previously
    /// deallocated page is reused if one exists, lowest number first;
    /// otherwise the file grows by one page. Extended regions read as zeroes.
    pub fn allocate_page(&self) -> Result<PageNo> {
        let mut state = self.state.lock().unwrap();
        let page_no = match state.free_pages.pop_first() {
            Some(page_no) => page_no,
            None => {
                let page_no = state.next_page_no;
                state.next_page_no += 1;
                self.db_file
                    .set_len((page_no as u64 + 1) * PAGE_SIZE as u64)
                    .with_context(|| format!("Could not grow database file for page {}", page_no))?;
                page_no
            }
        };
        log::trace!("allocated page {page_no}");
        Ok(page_no)
    }

    /// Returns a page to the free set. Freeing a page that was never
    /// allocated, or freeing it twice, is an error.
    pub fn deallocate_page(&self, page_no: PageNo) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if page_no == INVALID_PAGE_NO || page_no >= state.next_page_no {
            return Err(Error::msg(format!(
                "Attempted to deallocate page {} which was never allocated",
                page_no
            )));
        }
        if !state.free_pages.insert(page_no) {
            return Err(Error::msg(format!(
                "Attempted to deallocate page {} twice",
                page_no
            )));
        }
        log::trace!("deallocated page {page_no}");
        Ok(())
    }

    /// True iff the page is currently allocated to some caller.
    pub fn is_allocated(&self, page_no: PageNo) -> bool {
        let state = self.state.lock().unwrap();
        page_no != INVALID_PAGE_NO
            && page_no < state.next_page_no
            && !state.free_pages.contains(&page_no)
    }

    /// Number of currently allocated pages.
    pub fn allocated_page_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        (state.next_page_no as usize - 1) - state.free_pages.len()
    }

    /// Reads the given page into the buffer.
    pub fn read_page(&self, page_no: PageNo, buffer: &mut [u8]) -> Result<()> {
        let offset = page_no as u64 * PAGE_SIZE as u64;
        self.db_file
            .read_exact_at(buffer, offset)
            .with_context(|| format!("Could not read page {}", page_no))?;
        Ok(())
    }

    /// Writes the buffer to the given page.
    pub fn write_page(&self, page_no: PageNo, buffer: &[u8]) -> Result<()> {
        let offset = page_no as u64 * PAGE_SIZE as u64;
        self.db_file
            .write_all_at(buffer, offset)
            .with_context(|| format!("Could not write page {}", page_no))?;
        Ok(())
    }

    /// Flushes all written pages to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.db_file
            .sync_all()
            .context("Could not sync database file")
    }

    /// Looks up the head page of a named file.
    pub fn get_file_entry(&self, name: &str) -> Option<PageNo> {
        let state = self.state.lock().unwrap();
        state.file_entries.get(name).copied()
    }

    /// Registers a named file. Registering a name twice is an error.
    pub fn add_file_entry(&self, name: &str, page_no: PageNo) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.file_entries.contains_key(name) {
            return Err(Error::msg(format!("File {} already exists", name)));
        }
        state.file_entries.insert(name.to_owned(), page_no);
        Ok(())
    }

    /// Removes a named file from the registry.
    pub fn delete_file_entry(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .file_entries
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::msg(format!("No file entry for {}", name)))
    }
}
