//! Sources of guest physical pages for lazily populated memory

use anyhow::{Context, Result};

use crate::addrs::{PhysAddr, PAGE_SIZE};

use std::collections::BTreeMap;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Supplies guest physical pages on demand.
///
/// Absence (`Ok(None)`) is how a snapshot declines to provide a page, which stops a
/// trace with [`Status::ForbiddenAddress`](crate::Status::ForbiddenAddress). Errors are
/// reserved for host failures.
pub trait PageFetcher {
    /// Fetch the page containing `gpa`. `gva` is the virtual address whose access
    /// faulted, `0` when there is none.
    ///
    /// # Errors
    ///
    /// * Reading the backing source failed
    fn fetch(&mut self, gpa: u64, gva: u64) -> Result<Option<Vec<u8>>>;
}

impl<F: PageFetcher + ?Sized> PageFetcher for Box<F> {
    fn fetch(&mut self, gpa: u64, gva: u64) -> Result<Option<Vec<u8>>> {
        (**self).fetch(gpa, gva)
    }
}

/// A raw physical memory dump: byte `n` of the file is guest physical address `n`
#[derive(Debug)]
pub struct DumpSnapshot {
    /// The dump file
    file: File,

    /// Size of the dump file
    size: u64,
}

impl DumpSnapshot {
    /// Open the dump at `path`
    ///
    /// # Errors
    ///
    /// * The file can't be opened or its size read
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open physical memory dump {path:?}"))?;
        let size = file.metadata()?.len();

        log::info!("Opened physical memory dump {path:?} ({size:#x} bytes)");

        Ok(Self { file, size })
    }

    /// Size of the dump in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl PageFetcher for DumpSnapshot {
    fn fetch(&mut self, gpa: u64, _gva: u64) -> Result<Option<Vec<u8>>> {
        let page = PhysAddr(gpa).page();
        if page.0 + PAGE_SIZE > self.size {
            return Ok(None);
        }

        let mut data = vec![0_u8; PAGE_SIZE as usize];
        self.file
            .read_exact_at(&mut data, page.0)
            .with_context(|| format!("Failed to read page {:#x} of the dump", page.0))?;

        Ok(Some(data))
    }
}

/// Pages held in memory, keyed by page address
#[derive(Debug, Default, Clone)]
pub struct PageCache {
    /// Cached pages
    pages: BTreeMap<u64, Vec<u8>>,
}

impl PageCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) the page containing `gpa`. Short data is zero padded.
    pub fn insert(&mut self, gpa: u64, data: &[u8]) {
        let mut page = vec![0_u8; PAGE_SIZE as usize];
        let len = data.len().min(page.len());
        page[..len].copy_from_slice(&data[..len]);
        self.pages.insert(PhysAddr(gpa).page().0, page);
    }

    /// Number of cached pages
    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns `true` if no page is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl PageFetcher for PageCache {
    fn fetch(&mut self, gpa: u64, _gva: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.pages.get(&PhysAddr(gpa).page().0).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_pages() {
        let path = std::env::temp_dir().join(format!("snaptrace_dump_{}", std::process::id()));
        let mut dump = vec![0_u8; 0x2800];
        dump[0x1000] = 0x41;
        dump[0x1fff] = 0x42;
        std::fs::write(&path, &dump).unwrap();

        let mut snapshot = DumpSnapshot::open(&path).unwrap();
        assert_eq!(snapshot.size(), 0x2800);

        let page = snapshot.fetch(0x1234, 0).unwrap().unwrap();
        assert_eq!(page.len(), 0x1000);
        assert_eq!((page[0], page[0xfff]), (0x41, 0x42));

        // The partial last page and everything after it are absent
        assert_eq!(snapshot.fetch(0x2000, 0).unwrap(), None);
        assert_eq!(snapshot.fetch(0x10_0000, 0).unwrap(), None);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn cached_pages() {
        let mut cache = PageCache::new();
        cache.insert(0x5123, &[1, 2, 3]);

        let page = cache.fetch(0x5fff, 0xffff_8000_0000_5fff).unwrap().unwrap();
        assert_eq!(&page[..4], &[1, 2, 3, 0]);
        assert_eq!(cache.fetch(0x6000, 0).unwrap(), None);
        assert_eq!(cache.len(), 1);
    }
}
