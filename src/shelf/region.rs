//! Typed shelf region with a persisted verification header.
//!
//! A region is a [`ShelfFile`] whose first 4 KB hold a little-endian
//! header: magic, format version, and the logical payload size. Everything
//! after the header is payload; [`ShelfRegion::map`] hides the header so
//! payload offset 0 is what mapped callers see.

use crate::error::{Error, Result};
use crate::shelf::ShelfFile;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Region header magic: `"NVMMSHEL"`.
pub const REGION_MAGIC: u64 = 0x4E56_4D4D_5348_454C;

/// Current region format version.
pub const REGION_VERSION: u64 = 1;

/// Size of the on-disk region header.
pub const REGION_HEADER_SIZE: u64 = 4096;

/// On-disk header at file offset 0. All fields little-endian u64, written
/// through 64-bit atomics on the mapped page.
#[repr(C)]
struct RegionHeader {
    magic: AtomicU64,
    version: AtomicU64,
    payload_size: AtomicU64,
    // Remainder of the 4 KB page is reserved and stays zero.
}

/// A shelf file carrying a verification header and a logical payload size.
pub struct ShelfRegion {
    shelf: ShelfFile,
}

impl ShelfRegion {
    /// Wrap a pathname. No filesystem access happens here.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            shelf: ShelfFile::new(path),
        }
    }

    /// The wrapped pathname.
    pub fn path(&self) -> &Path {
        self.shelf.path()
    }

    /// Whether a descriptor is held.
    pub fn is_open(&self) -> bool {
        self.shelf.is_open()
    }

    /// Format the region: create the backing file if needed, size it to
    /// `size` plus the header, and persist the header.
    ///
    /// Fails with [`Error::InvalidArg`] for a zero payload size and with
    /// [`Error::ShelfFileOpened`] if the region is currently open.
    pub fn create(&mut self, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArg("region size must be > 0".into()));
        }
        if self.is_open() {
            return Err(Error::ShelfFileOpened(self.path().display().to_string()));
        }
        if !self.shelf.exists() {
            self.shelf.create(0o600)?;
        }
        self.shelf.open(false)?;
        let result = self.format(size);
        self.shelf.close()?;
        result
    }

    fn format(&mut self, size: u64) -> Result<()> {
        self.shelf.truncate(size + REGION_HEADER_SIZE)?;
        let base = self.shelf.map(None, REGION_HEADER_SIZE as usize, 0, false)?;
        let header = unsafe { &*base.as_ptr().cast::<RegionHeader>() };
        header.payload_size.store(size, Ordering::Release);
        header.version.store(REGION_VERSION, Ordering::Release);
        // Magic last: a region is valid only once fully formatted.
        header.magic.store(REGION_MAGIC, Ordering::Release);
        self.shelf.sync(base, REGION_HEADER_SIZE as usize)?;
        unsafe { self.shelf.unmap(base, REGION_HEADER_SIZE as usize)? };
        tracing::debug!("formatted region {} ({} bytes)", self.path().display(), size);
        Ok(())
    }

    /// Remove the backing file.
    pub fn destroy(&mut self) -> Result<()> {
        self.shelf.destroy()
    }

    /// Reopen read-only and check magic and version.
    ///
    /// Corruption is reported, never repaired.
    pub fn verify(&mut self) -> Result<()> {
        self.shelf.open(true)?;
        let result = self.check_header();
        self.shelf.close()?;
        result
    }

    fn check_header(&self) -> Result<()> {
        // A creator truncates before it writes the header; a shorter file
        // is one we caught mid-format (or not a region at all).
        if self.shelf.size()? < REGION_HEADER_SIZE {
            return Err(Error::Corrupted(format!(
                "{}: shorter than a region header",
                self.path().display()
            )));
        }
        let base = self.shelf.map(None, REGION_HEADER_SIZE as usize, 0, true)?;
        let header = unsafe { &*base.as_ptr().cast::<RegionHeader>() };
        let magic = header.magic.load(Ordering::Acquire);
        let version = header.version.load(Ordering::Acquire);
        unsafe { self.shelf.unmap(base, REGION_HEADER_SIZE as usize)? };
        if magic != REGION_MAGIC {
            return Err(Error::Corrupted(format!(
                "{}: bad magic {:#018x}",
                self.path().display(),
                magic
            )));
        }
        if version != REGION_VERSION {
            return Err(Error::Corrupted(format!(
                "{}: unsupported version {}",
                self.path().display(),
                version
            )));
        }
        Ok(())
    }

    /// Open a descriptor on the region.
    pub fn open(&mut self, read_only: bool) -> Result<()> {
        self.shelf.open(read_only)
    }

    /// Close the descriptor. Mappings stay valid.
    pub fn close(&mut self) -> Result<()> {
        self.shelf.close()
    }

    /// Logical payload size recorded in the header (not the file size).
    pub fn size(&self) -> Result<u64> {
        let base = self.shelf.map(None, REGION_HEADER_SIZE as usize, 0, true)?;
        let header = unsafe { &*base.as_ptr().cast::<RegionHeader>() };
        let size = header.payload_size.load(Ordering::Acquire);
        unsafe { self.shelf.unmap(base, REGION_HEADER_SIZE as usize)? };
        Ok(size)
    }

    /// Map `length` payload bytes starting at payload offset `offset`.
    ///
    /// The header is skipped; the returned base points at the payload.
    /// `offset` must be a multiple of the page size.
    pub fn map(
        &self,
        hint: Option<NonNull<u8>>,
        length: usize,
        offset: u64,
        read_only: bool,
    ) -> Result<NonNull<u8>> {
        self.shelf
            .map(hint, length, offset + REGION_HEADER_SIZE, read_only)
    }

    /// Unmap a payload range previously returned by [`map`](Self::map).
    ///
    /// # Safety
    ///
    /// The caller must guarantee no live references into the mapping remain.
    pub unsafe fn unmap(&self, base: NonNull<u8>, length: usize) -> Result<()> {
        // SAFETY: forwarded contract.
        unsafe { self.shelf.unmap(base, length) }
    }

    /// Flush a mapped payload range to the backing file.
    pub fn sync(&self, base: NonNull<u8>, length: usize) -> Result<()> {
        self.shelf.sync(base, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_verify_destroy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region");
        let mut region = ShelfRegion::new(&path);

        region.create(1 << 20).unwrap();
        region.verify().unwrap();
        region.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_open_missing() {
        let dir = TempDir::new().unwrap();
        let mut region = ShelfRegion::new(dir.path().join("absent"));
        match region.open(false) {
            Err(Error::ShelfFileNotFound(_)) => {}
            other => panic!("expected ShelfFileNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_size_reads_header_not_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region");
        let mut region = ShelfRegion::new(&path);
        region.create(1 << 20).unwrap();

        region.open(false).unwrap();
        assert_eq!(region.size().unwrap(), 1 << 20);
        region.close().unwrap();

        // File itself is payload + header.
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            (1 << 20) + REGION_HEADER_SIZE
        );
    }

    #[test]
    fn test_verify_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region");
        let mut region = ShelfRegion::new(&path);
        region.create(1 << 20).unwrap();

        // Stomp the magic.
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&[0u8; 8]).unwrap();
        drop(file);

        match region.verify() {
            Err(Error::Corrupted(_)) => {}
            other => panic!("expected Corrupted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_map_roundtrip_through_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("region");
        let size = 128 * 1024 * 1024u64;
        let mut region = ShelfRegion::new(&path);
        region.create(size).unwrap();

        // Write an atomically visible value at the payload base.
        region.open(false).unwrap();
        let base = region.map(None, size as usize, 0, false).unwrap();
        unsafe {
            (*base.as_ptr().cast::<AtomicU64>()).store(123, Ordering::Release);
        }
        unsafe { region.unmap(base, size as usize).unwrap() };
        region.close().unwrap();

        // Read it back through a fresh mapping.
        region.open(false).unwrap();
        let base = region.map(None, size as usize, 0, false).unwrap();
        let value = unsafe { (*base.as_ptr().cast::<AtomicU64>()).load(Ordering::Acquire) };
        assert_eq!(value, 123);
        unsafe { region.unmap(base, size as usize).unwrap() };
        region.close().unwrap();
        region.destroy().unwrap();
    }
}
