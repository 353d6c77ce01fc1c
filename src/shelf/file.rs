//! A single shelf backing file.
//!
//! [`ShelfFile`] owns the create/destroy/open/close/truncate/map lifecycle
//! of one named file. It deliberately knows nothing about headers or
//! registration; [`ShelfRegion`](crate::shelf::ShelfRegion) and
//! [`ShelfManager`](crate::shelf::ShelfManager) layer those on top.

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Lifecycle manager for one shelf backing file.
///
/// At most one open file descriptor per `ShelfFile`; a second `open` while
/// one is held fails with [`Error::ShelfFileOpened`]. Mappings outlive
/// `close` (the kernel keeps pages alive for the mapping), so callers may
/// close the descriptor as soon as the mapping is established.
pub struct ShelfFile {
    path: PathBuf,
    fd: Option<OwnedFd>,
}

impl ShelfFile {
    /// Wrap a pathname. No filesystem access happens here.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            fd: None,
        }
    }

    /// The wrapped pathname.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the backing file currently exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Whether a descriptor is held.
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Create the backing file as an empty file with `mode` permissions.
    ///
    /// Fails with [`Error::ShelfExists`] if the pathname already exists.
    pub fn create(&mut self, mode: u32) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let fd = rustix::fs::open(
            &self.path,
            OFlags::RDWR | OFlags::CREATE | OFlags::EXCL,
            Mode::from_raw_mode(mode),
        )
        .map_err(|e| {
            if e == rustix::io::Errno::EXIST {
                Error::ShelfExists(self.path.display().to_string())
            } else {
                Error::System(e)
            }
        })?;
        drop(fd);
        tracing::debug!("created shelf {}", self.path.display());
        Ok(())
    }

    /// Remove the backing file.
    ///
    /// Fails with [`Error::ShelfFileNotFound`] if it does not exist.
    pub fn destroy(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::ShelfFileOpened(self.path.display().to_string()));
        }
        rustix::fs::unlink(&self.path).map_err(|e| {
            if e == rustix::io::Errno::NOENT {
                Error::ShelfFileNotFound(self.path.display().to_string())
            } else {
                Error::System(e)
            }
        })?;
        tracing::debug!("destroyed shelf {}", self.path.display());
        Ok(())
    }

    /// Open a descriptor on the backing file.
    ///
    /// Fails with [`Error::ShelfFileOpened`] if one is already held in this
    /// process, and [`Error::ShelfFileNotFound`] if the file is absent.
    pub fn open(&mut self, read_only: bool) -> Result<()> {
        if self.is_open() {
            return Err(Error::ShelfFileOpened(self.path.display().to_string()));
        }
        let flags = if read_only {
            OFlags::RDONLY
        } else {
            OFlags::RDWR
        };
        let fd = rustix::fs::open(&self.path, flags, Mode::empty()).map_err(|e| {
            if e == rustix::io::Errno::NOENT {
                Error::ShelfFileNotFound(self.path.display().to_string())
            } else {
                Error::System(e)
            }
        })?;
        self.fd = Some(fd);
        Ok(())
    }

    /// Close the held descriptor. Established mappings stay valid.
    pub fn close(&mut self) -> Result<()> {
        if self.fd.take().is_none() {
            return Err(Error::InvalidArg("shelf is not open".into()));
        }
        Ok(())
    }

    /// Set the logical file size. Requires an open writable descriptor.
    pub fn truncate(&mut self, size: u64) -> Result<()> {
        let fd = self.open_fd()?;
        rustix::fs::ftruncate(fd, size)?;
        Ok(())
    }

    /// Current file size from `fstat`. Requires an open descriptor.
    pub fn size(&self) -> Result<u64> {
        let fd = self.open_fd()?;
        let stat = rustix::fs::fstat(fd)?;
        Ok(stat.st_size as u64)
    }

    /// Map `length` bytes of the file starting at `offset`, `MAP_SHARED`.
    ///
    /// The whole requested range maps or the call fails; there are no
    /// partial mappings. `hint` is a placement suggestion only.
    pub fn map(
        &self,
        hint: Option<NonNull<u8>>,
        length: usize,
        offset: u64,
        read_only: bool,
    ) -> Result<NonNull<u8>> {
        let fd = self.open_fd()?;
        if length == 0 {
            return Err(Error::InvalidArg("mapping length must be > 0".into()));
        }
        let prot = if read_only {
            ProtFlags::READ
        } else {
            ProtFlags::READ | ProtFlags::WRITE
        };
        let addr = hint.map_or(std::ptr::null_mut(), |p| p.as_ptr().cast());
        let ptr = unsafe { rustix::mm::mmap(addr, length, prot, MapFlags::SHARED, fd, offset)? };
        NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidArg("mmap returned null".into()))
    }

    /// Unmap a range previously returned by [`map`](Self::map).
    ///
    /// `base` and `length` must cover exactly the mapped range.
    ///
    /// # Safety
    ///
    /// The caller must guarantee no live references into the mapping remain.
    pub unsafe fn unmap(&self, base: NonNull<u8>, length: usize) -> Result<()> {
        // SAFETY: caller guarantees `base..base+length` is a whole mapping
        // with no outstanding references.
        unsafe { rustix::mm::munmap(base.as_ptr().cast(), length)? };
        Ok(())
    }

    /// Flush a mapped range to the backing file.
    pub fn sync(&self, base: NonNull<u8>, length: usize) -> Result<()> {
        unsafe {
            rustix::mm::msync(base.as_ptr().cast(), length, rustix::mm::MsyncFlags::SYNC)?;
        }
        Ok(())
    }

    fn open_fd(&self) -> Result<&OwnedFd> {
        self.fd
            .as_ref()
            .ok_or_else(|| Error::InvalidArg("shelf is not open".into()))
    }
}
