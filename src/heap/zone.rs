//! Buddy-style zone heap laid out inside one shelf.
//!
//! The shelf payload is treated as a run of 64-byte blocks:
//!
//! ```text
//! blocks [0, 8):            zone header (magic, levels, dirty, heads)
//! blocks [B, 2B):           merge bitmap, B = payload/64/8/64
//! everything else:          allocatable zones
//! ```
//!
//! Level `l` manages chunks of `2^l` blocks. Each level below the top
//! three keeps a lock-free Treiber stack of free chunks; the top three
//! levels track their few possible chunks in per-level occupancy masks.
//! Allocation pops its level or splits from above; free pushes back. The
//! merge pass rebuilds the whole free structure from the bitmap, which is
//! also exactly the crash-recovery path: the header's dirty flag is set on
//! open and cleared on clean close, and an open that finds it already set
//! rebuilds before handing the heap out.
//!
//! Concurrency: alloc and free hold the read side of their level's
//! distributed RW lock around the paired list-CAS and bitmap update; merge
//! is the only writer and takes every level in ascending order. Alloc and
//! free never block each other. The locks are process-local: concurrent
//! alloc/free from other processes is safe against everything except a
//! merge, which callers coordinate across processes.

use crate::epoch::DistRwLock;
use crate::error::{Error, Result};
use crate::heap::bitmap::MergeBitmap;
use crate::heap::freelist::FreeList;
use crate::ptr::{GlobalPtr, ShelfId};
use crate::shelf::{ShelfManager, ShelfRegion};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Zone header magic: `"ZONEHEAP"`.
pub const ZONE_MAGIC: u64 = 0x5A4F_4E45_4845_4150;

/// Minimum allocation unit, bytes.
pub const MIN_OBJ_SIZE: u64 = 64;

/// Smallest heap payload accepted by [`ZoneHeap::create`].
pub const MIN_HEAP_SIZE: u64 = 1 << 20;

/// Largest heap payload; offsets must fit the pointer's 48-bit field.
pub const MAX_HEAP_SIZE: u64 = 1 << 47;

const HEADER_BLOCKS: u64 = 8;
const MAX_LEVELS: usize = 48;
const LOCK_CAPACITY: usize = 64;

#[repr(C)]
struct ZoneHeader {
    magic: AtomicU64,
    min_obj_size: AtomicU64,
    levels: AtomicU32,
    dirty: AtomicU32,
    payload_size: AtomicU64,
    /// Per-level head words: tagged free-list heads below the top three
    /// levels, occupancy masks for the top three.
    heads: [AtomicU64; MAX_LEVELS],
}

const _: () = assert!(
    std::mem::size_of::<ZoneHeader>() as u64 <= HEADER_BLOCKS * MIN_OBJ_SIZE,
    "zone header must fit its reserved blocks"
);

/// Buddy allocator over one shelf.
///
/// The heap holds its shelf by id and resolves the local base through the
/// [`ShelfManager`] on every operation, so a handle stays valid no matter
/// where the shelf lands in other processes.
pub struct ZoneHeap {
    shelf_id: ShelfId,
    manager: Arc<ShelfManager>,
    path: PathBuf,
    payload_size: u64,
    levels: u32,
    locks: Box<[DistRwLock]>,
}

struct LevelRead<'a>(&'a DistRwLock);

impl<'a> LevelRead<'a> {
    fn acquire(lock: &'a DistRwLock) -> Self {
        lock.read_acquire();
        Self(lock)
    }
}

impl Drop for LevelRead<'_> {
    fn drop(&mut self) {
        self.0.read_release();
    }
}

impl ZoneHeap {
    /// Format a new heap of `size` payload bytes at `path`.
    ///
    /// `size` must be a power of two in `[MIN_HEAP_SIZE, MAX_HEAP_SIZE]`.
    /// Fails with [`Error::ShelfExists`] if the pathname is taken.
    pub fn create<P: AsRef<Path>>(path: P, size: u64) -> Result<()> {
        let path = path.as_ref();
        if !size.is_power_of_two() || !(MIN_HEAP_SIZE..=MAX_HEAP_SIZE).contains(&size) {
            return Err(Error::InvalidArg(format!(
                "heap size must be a power of two in [{}, {}], got {}",
                MIN_HEAP_SIZE, MAX_HEAP_SIZE, size
            )));
        }
        if path.exists() {
            return Err(Error::ShelfExists(path.display().to_string()));
        }

        let mut region = ShelfRegion::new(path);
        region.create(size)?;
        region.open(false)?;
        let mapped = region.map(None, size as usize, 0, false);
        region.close()?;
        let base = mapped?;

        format_payload(base, size);
        region.sync(base, size as usize)?;
        // SAFETY: the mapping was created above and nothing else refers
        // into it.
        unsafe { region.unmap(base, size as usize)? };
        tracing::info!("created zone heap {} ({} bytes)", path.display(), size);
        Ok(())
    }

    /// Remove a heap's backing file. The caller must have unregistered and
    /// unmapped the shelf in this process.
    pub fn destroy<P: AsRef<Path>>(path: P) -> Result<()> {
        ShelfRegion::new(path.as_ref()).destroy()
    }

    /// Attach to the heap at `path`, registering its mapping under
    /// `shelf_id`.
    ///
    /// An open that finds the dirty flag already set (a crash, or an
    /// unclean close) rebuilds the free structure from the bitmap before
    /// returning.
    pub fn open<P: AsRef<Path>>(
        path: P,
        shelf_id: ShelfId,
        manager: Arc<ShelfManager>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !shelf_id.is_valid() {
            return Err(Error::InvalidArg("invalid shelf id".into()));
        }
        let base = manager.find_base_from_path(&path, shelf_id)?;

        let header = header_at(base);
        if header.magic.load(Ordering::Acquire) != ZONE_MAGIC {
            return Err(Error::Corrupted(format!(
                "{}: bad zone magic",
                path.display()
            )));
        }
        if header.min_obj_size.load(Ordering::Acquire) != MIN_OBJ_SIZE {
            return Err(Error::Corrupted(format!(
                "{}: unsupported block size",
                path.display()
            )));
        }
        let payload_size = header.payload_size.load(Ordering::Acquire);
        let levels = header.levels.load(Ordering::Acquire);
        if levels as usize >= MAX_LEVELS || payload_size != (MIN_OBJ_SIZE << levels) {
            return Err(Error::Corrupted(format!(
                "{}: inconsistent geometry",
                path.display()
            )));
        }

        let heap = Self {
            shelf_id,
            manager,
            path,
            payload_size,
            levels,
            locks: (0..=levels)
                .map(|_| DistRwLock::with_capacity(LOCK_CAPACITY))
                .collect(),
        };

        if header.dirty.swap(1, Ordering::AcqRel) == 1 {
            tracing::warn!(
                "zone heap {} was not closed cleanly; rebuilding free lists",
                heap.path.display()
            );
            heap.merge();
        }
        Ok(heap)
    }

    /// Mark the heap cleanly closed and flush its metadata.
    ///
    /// The mapping stays registered; reopening in this process reuses it.
    pub fn close(&self) -> Result<()> {
        let base = self
            .base()
            .ok_or_else(|| Error::IdNotFound(self.shelf_id.to_string()))?;
        header_at(base).dirty.store(0, Ordering::Release);
        let region = ShelfRegion::new(&self.path);
        region.sync(base, self.payload_size as usize)?;
        Ok(())
    }

    /// The shelf this heap allocates from.
    pub fn shelf_id(&self) -> ShelfId {
        self.shelf_id
    }

    /// Backing pathname.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Payload bytes under management.
    pub fn size(&self) -> u64 {
        self.payload_size
    }

    /// Highest level; chunks there span the whole payload.
    pub fn levels(&self) -> u32 {
        self.levels
    }

    /// Smallest allocation unit.
    pub fn min_alloc_size(&self) -> u64 {
        MIN_OBJ_SIZE
    }

    /// Allocate at least `bytes` bytes.
    ///
    /// The request rounds up to the smallest power-of-two chunk; exhaustion
    /// returns an invalid pointer rather than an error. The returned
    /// pointer's reserve byte carries the chunk's level, which
    /// [`free`](Self::free) relies on.
    pub fn alloc(&self, bytes: u64) -> GlobalPtr {
        let Some(base) = self.base() else {
            debug_assert!(false, "heap shelf is not registered");
            return GlobalPtr::NULL;
        };
        let level = level_for_size(bytes);
        if level > self.levels {
            return GlobalPtr::NULL;
        }
        match self.alloc_level(base, level) {
            Some(block) => {
                GlobalPtr::with_reserve(self.shelf_id, level as u8, block * MIN_OBJ_SIZE)
            }
            None => GlobalPtr::NULL,
        }
    }

    /// Return `ptr`'s chunk to its level. Immediate-free variant: the
    /// chunk is reusable by the very next allocation of its size.
    pub fn free(&self, ptr: GlobalPtr) {
        let Some(base) = self.base() else {
            debug_assert!(false, "heap shelf is not registered");
            return;
        };
        if !ptr.is_valid() || ptr.shelf_id() != self.shelf_id {
            debug_assert!(false, "free of foreign or invalid pointer {}", ptr);
            return;
        }
        let level = ptr.reserve() as u32;
        let offset = ptr.offset();
        let block = offset / MIN_OBJ_SIZE;
        if level > self.levels
            || offset % MIN_OBJ_SIZE != 0
            || block % (1u64 << level) != 0
            || block + (1u64 << level) > self.blocks()
        {
            debug_assert!(false, "free of malformed pointer {}", ptr);
            return;
        }

        let _hold = LevelRead::acquire(&self.locks[level as usize]);
        self.bitmap(base).set_range(block as usize, 1 << level);
        if self.is_top_level(level) {
            self.mask_word(base, level)
                .fetch_or(1 << (block >> level), Ordering::AcqRel);
        } else {
            self.freelist(base, level).push(offset);
        }
    }

    /// Coalesce adjacent free buddies by rebuilding every free list from
    /// the merge bitmap.
    ///
    /// Idempotent, and safe to run concurrently with alloc and free in
    /// this process: it takes every level's write lock, so it only ever
    /// sees chunks whose list and bitmap state agree. Frees still in
    /// flight are simply picked up by the next pass.
    pub fn merge(&self) {
        let Some(base) = self.base() else {
            debug_assert!(false, "heap shelf is not registered");
            return;
        };
        let _guards: Vec<_> = self.locks.iter().map(|lock| lock.write()).collect();
        rebuild_free_structure(base, self.payload_size);
        tracing::debug!("merged zone heap {}", self.path.display());
    }

    /// Translate one of this heap's pointers to a local address.
    pub fn to_local(&self, ptr: GlobalPtr) -> Option<NonNull<u8>> {
        if !ptr.is_valid() || ptr.shelf_id() != self.shelf_id {
            return None;
        }
        let base = self.base()?;
        // SAFETY: offset is within the mapped payload for any pointer this
        // heap handed out.
        NonNull::new(unsafe { base.as_ptr().add(ptr.offset() as usize) })
    }

    /// Number of free blocks according to the bitmap. A snapshot.
    pub fn free_blocks(&self) -> usize {
        match self.base() {
            Some(base) => self.bitmap(base).count_set(),
            None => 0,
        }
    }

    /// Total payload blocks, including header and bitmap blocks.
    pub fn total_blocks(&self) -> u64 {
        self.blocks()
    }

    fn base(&self) -> Option<NonNull<u8>> {
        self.manager.find_base(self.shelf_id)
    }

    fn blocks(&self) -> u64 {
        self.payload_size / MIN_OBJ_SIZE
    }

    fn is_top_level(&self, level: u32) -> bool {
        level + 2 >= self.levels
    }

    fn bitmap(&self, base: NonNull<u8>) -> MergeBitmap {
        bitmap_at(base, self.payload_size)
    }

    fn freelist<'a>(&self, base: NonNull<u8>, level: u32) -> FreeList<'a> {
        freelist_at(base, level)
    }

    fn mask_word(&self, base: NonNull<u8>, level: u32) -> &AtomicU64 {
        &header_at(base).heads[level as usize]
    }

    fn alloc_level(&self, base: NonNull<u8>, level: u32) -> Option<u64> {
        if level > self.levels {
            return None;
        }

        // Fast path: claim a chunk already free at this level.
        {
            let _hold = LevelRead::acquire(&self.locks[level as usize]);
            let block = if self.is_top_level(level) {
                self.pop_mask(base, level)
            } else {
                self.freelist(base, level)
                    .pop()
                    .map(|offset| offset / MIN_OBJ_SIZE)
            };
            if let Some(block) = block {
                self.bitmap(base).clear_range(block as usize, 1 << level);
                return Some(block);
            }
        }

        // Split a parent chunk: keep the low half, free the buddy.
        let parent = self.alloc_level(base, level + 1)?;
        let buddy = parent + (1 << level);
        {
            let _hold = LevelRead::acquire(&self.locks[level as usize]);
            self.bitmap(base).set_range(buddy as usize, 1 << level);
            if self.is_top_level(level) {
                self.mask_word(base, level)
                    .fetch_or(1 << (buddy >> level), Ordering::AcqRel);
            } else {
                self.freelist(base, level).push(buddy * MIN_OBJ_SIZE);
            }
        }
        Some(parent)
    }

    fn pop_mask(&self, base: NonNull<u8>, level: u32) -> Option<u64> {
        let word = self.mask_word(base, level);
        loop {
            let mask = word.load(Ordering::Acquire);
            if mask == 0 {
                return None;
            }
            // Lowest set bit first keeps top-level allocation
            // address-ordered.
            let bit = mask.trailing_zeros() as u64;
            if word
                .compare_exchange_weak(
                    mask,
                    mask & !(1 << bit),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Some(bit << level);
            }
        }
    }
}

fn header_at<'a>(base: NonNull<u8>) -> &'a ZoneHeader {
    // SAFETY: the first header blocks of every formatted heap payload hold
    // a ZoneHeader, and the mapping outlives the heap handle.
    unsafe { &*base.as_ptr().cast::<ZoneHeader>() }
}

fn bitmap_at(base: NonNull<u8>, payload_size: u64) -> MergeBitmap {
    let blocks = payload_size / MIN_OBJ_SIZE;
    let bitmap_bytes = blocks / 8;
    // SAFETY: the bitmap occupies [bitmap_bytes, 2 * bitmap_bytes) of the
    // payload, within the mapping.
    unsafe {
        MergeBitmap::from_base(
            NonNull::new_unchecked(base.as_ptr().add(bitmap_bytes as usize)),
            blocks as usize,
        )
    }
}

fn freelist_at<'a>(base: NonNull<u8>, level: u32) -> FreeList<'a> {
    // SAFETY: head words live in the zone header; offsets on the list stay
    // inside the same payload mapping.
    unsafe { FreeList::from_parts(&header_at(base).heads[level as usize], base) }
}

/// Blocks reserved at the front of the payload: header plus bitmap.
fn reserved_ranges(payload_size: u64) -> ((u64, u64), (u64, u64)) {
    let blocks = payload_size / MIN_OBJ_SIZE;
    let bitmap_bytes = blocks / 8;
    let bitmap_start = bitmap_bytes / MIN_OBJ_SIZE;
    let bitmap_end = 2 * bitmap_start;
    ((0, HEADER_BLOCKS), (bitmap_start, bitmap_end))
}

fn format_payload(base: NonNull<u8>, payload_size: u64) {
    let blocks = payload_size / MIN_OBJ_SIZE;
    let levels = blocks.trailing_zeros();
    let header = header_at(base);

    header.min_obj_size.store(MIN_OBJ_SIZE, Ordering::Release);
    header.levels.store(levels, Ordering::Release);
    header.payload_size.store(payload_size, Ordering::Release);
    header.dirty.store(0, Ordering::Release);

    // Everything outside the header and the bitmap starts out free.
    let ((_, header_end), (bitmap_start, bitmap_end)) = reserved_ranges(payload_size);
    let bitmap = bitmap_at(base, payload_size);
    bitmap.set_range(header_end as usize, (bitmap_start - header_end) as usize);
    bitmap.set_range(bitmap_end as usize, (blocks - bitmap_end) as usize);

    rebuild_free_structure(base, payload_size);
    // Magic last: a heap is valid only once fully formatted.
    header.magic.store(ZONE_MAGIC, Ordering::Release);
}

/// Recompute every free list and occupancy mask from the bitmap.
///
/// The caller must hold every level's write lock (or otherwise have
/// exclusive access, as the formatter and crash recovery do). Free space
/// is carved greedily into maximal aligned chunks in address order, so the
/// resulting lists are address-ordered and a second pass reproduces the
/// same structure.
fn rebuild_free_structure(base: NonNull<u8>, payload_size: u64) {
    let blocks = payload_size / MIN_OBJ_SIZE;
    let levels = blocks.trailing_zeros();
    let bitmap = bitmap_at(base, payload_size);

    let mut per_level: Vec<Vec<u64>> = vec![Vec::new(); levels as usize + 1];
    let mut block = 0u64;
    while let Some(found) = bitmap.next_set(block as usize) {
        let found = found as u64;
        let max_align = if found == 0 {
            levels
        } else {
            found.trailing_zeros().min(levels)
        };
        let mut level = max_align;
        while level > 0
            && (found + (1 << level) > blocks
                || !bitmap.all_set(found as usize, 1 << level))
        {
            level -= 1;
        }
        per_level[level as usize].push(found);
        block = found + (1 << level);
    }

    let header = header_at(base);
    for level in 0..=levels {
        let chunks = &per_level[level as usize];
        if level + 2 >= levels {
            let mut mask = 0u64;
            for &chunk in chunks {
                mask |= 1 << (chunk >> level);
            }
            header.heads[level as usize].store(mask, Ordering::Release);
        } else {
            let offsets: Vec<u64> = chunks.iter().map(|&b| b * MIN_OBJ_SIZE).collect();
            freelist_at(base, level).set_entries(&offsets);
        }
    }
}

/// Smallest level whose chunks hold `bytes` bytes.
fn level_for_size(bytes: u64) -> u32 {
    let chunks = bytes.div_ceil(MIN_OBJ_SIZE).max(1);
    chunks.next_power_of_two().trailing_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_heap(dir: &TempDir, size: u64) -> ZoneHeap {
        let path = dir.path().join("heap");
        ZoneHeap::create(&path, size).unwrap();
        ZoneHeap::open(&path, ShelfId::new(1, 1), Arc::new(ShelfManager::new())).unwrap()
    }

    #[test]
    fn test_level_for_size() {
        assert_eq!(level_for_size(0), 0);
        assert_eq!(level_for_size(1), 0);
        assert_eq!(level_for_size(64), 0);
        assert_eq!(level_for_size(65), 1);
        assert_eq!(level_for_size(128), 1);
        assert_eq!(level_for_size(1024), 4);
        assert_eq!(level_for_size(16 * 1024 * 1024), 18);
    }

    #[test]
    fn test_create_validates_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heap");
        assert!(matches!(
            ZoneHeap::create(&path, 3 << 20),
            Err(Error::InvalidArg(_))
        ));
        assert!(matches!(
            ZoneHeap::create(&path, 1 << 10),
            Err(Error::InvalidArg(_))
        ));
        ZoneHeap::create(&path, 1 << 20).unwrap();
        assert!(matches!(
            ZoneHeap::create(&path, 1 << 20),
            Err(Error::ShelfExists(_))
        ));
    }

    #[test]
    fn test_first_alloc_lands_after_header() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 1 << 20);
        let ptr = heap.alloc(4);
        assert!(ptr.is_valid());
        assert_eq!(ptr.offset(), HEADER_BLOCKS * MIN_OBJ_SIZE);
        assert_eq!(ptr.shelf_id(), ShelfId::new(1, 1));
    }

    #[test]
    fn test_immediate_reuse() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 1 << 20);

        let ptr = heap.alloc(4);
        assert!(ptr.is_valid());
        heap.free(ptr);
        let again = heap.alloc(4);
        assert_eq!(ptr, again);
    }

    #[test]
    fn test_sequential_small_allocs_are_adjacent() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 1 << 20);

        for i in 0..24 {
            let ptr = heap.alloc(64);
            assert_eq!(ptr.offset(), (HEADER_BLOCKS + i) * MIN_OBJ_SIZE);
        }
    }

    #[test]
    fn test_oversized_request_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 1 << 20);
        let ptr = heap.alloc(2 << 20);
        assert!(!ptr.is_valid());
        assert_eq!(ptr.offset(), 0);
    }

    #[test]
    fn test_exhaustion_returns_invalid() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 1 << 20);

        // The largest possible chunk is half the heap (the reserved
        // prefix fragments the rest), and only one fits.
        let half = heap.alloc(1 << 19);
        assert!(half.is_valid());
        let another = heap.alloc(1 << 19);
        assert!(!another.is_valid());

        heap.free(half);
        assert!(heap.alloc(1 << 19).is_valid());
    }

    #[test]
    fn test_distinct_allocations_disjoint() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 1 << 20);

        let mut intervals = Vec::new();
        for i in 0..64 {
            let bytes = 64 << (i % 4);
            let ptr = heap.alloc(bytes);
            assert!(ptr.is_valid());
            let level = ptr.reserve() as u32;
            intervals.push((ptr.offset(), ptr.offset() + (MIN_OBJ_SIZE << level)));
        }
        intervals.sort_unstable();
        for pair in intervals.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap: {:?}", pair);
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 1 << 20);

        let ptrs: Vec<_> = (0..24).map(|_| heap.alloc(64)).collect();
        for &ptr in &ptrs {
            heap.free(ptr);
        }

        heap.merge();
        let base = heap.base().unwrap();
        let after_first: Vec<Vec<u64>> = (0..=heap.levels())
            .map(|l| {
                if heap.is_top_level(l) {
                    vec![heap.mask_word(base, l).load(Ordering::Acquire)]
                } else {
                    heap.freelist(base, l).entries()
                }
            })
            .collect();

        heap.merge();
        let after_second: Vec<Vec<u64>> = (0..=heap.levels())
            .map(|l| {
                if heap.is_top_level(l) {
                    vec![heap.mask_word(base, l).load(Ordering::Acquire)]
                } else {
                    heap.freelist(base, l).entries()
                }
            })
            .collect();

        assert_eq!(after_first, after_second);
    }

    #[test]
    fn test_free_accounting_balances() {
        let dir = TempDir::new().unwrap();
        let heap = open_heap(&dir, 1 << 20);

        let before = heap.free_blocks();
        let ptrs: Vec<_> = (0..32).map(|i| heap.alloc(64 * (1 + i % 3))).collect();
        assert!(heap.free_blocks() < before);
        for ptr in ptrs {
            heap.free(ptr);
        }
        assert_eq!(heap.free_blocks(), before);
    }
}
