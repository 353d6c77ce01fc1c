//! Process-wide shelf registry.
//!
//! The [`ShelfManager`] records which shelves are mapped in this process
//! and where, in two directions: shelf id to `(base, length)` and base
//! address back to shelf id. The reverse direction is what makes
//! local-pointer to [`GlobalPtr`](crate::ptr::GlobalPtr) translation
//! possible.
//!
//! A shelf is registered iff its payload is mapped entirely; registered
//! intervals are pairwise disjoint. Ownership is explicit: create one
//! manager at startup and hand references to the heaps. A process-wide
//! instance is available through [`ShelfManager::global`] for callers that
//! need the shared form.

use crate::error::{Error, Result};
use crate::ptr::ShelfId;
use crate::shelf::ShelfRegion;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Mutex, MutexGuard, OnceLock};

#[derive(Default)]
struct Registry {
    // shelf id => (base, length)
    forward: HashMap<ShelfId, (usize, usize)>,
    // base => (shelf id, length), ordered by base for predecessor lookup
    reverse: BTreeMap<usize, (ShelfId, usize)>,
}

impl Registry {
    fn overlaps(&self, base: usize, length: usize) -> bool {
        if let Some((&prev_base, &(_, prev_len))) = self.reverse.range(..=base).next_back() {
            if prev_base + prev_len > base {
                return true;
            }
        }
        if let Some((&next_base, _)) = self.reverse.range(base..).next() {
            if base + length > next_base {
                return true;
            }
        }
        false
    }

    fn find_shelf(&self, ptr: usize) -> Option<(ShelfId, NonNull<u8>)> {
        let (&base, &(shelf_id, length)) = self.reverse.range(..=ptr).next_back()?;
        if ptr < base + length {
            Some((shelf_id, NonNull::new(base as *mut u8)?))
        } else {
            None
        }
    }
}

/// Registry of every shelf mapped in this process.
pub struct ShelfManager {
    registry: Mutex<Registry>,
}

impl Default for ShelfManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShelfManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
        }
    }

    /// The process-wide instance.
    pub fn global() -> &'static ShelfManager {
        static GLOBAL: OnceLock<ShelfManager> = OnceLock::new();
        GLOBAL.get_or_init(ShelfManager::new)
    }

    /// Record a fully mapped shelf.
    ///
    /// Fails with [`Error::IdFound`] if `shelf_id` is already registered and
    /// [`Error::InvalidArg`] if `[base, base+length)` overlaps a registered
    /// interval or `length` is zero. State is unchanged on failure.
    pub fn register(&self, shelf_id: ShelfId, base: NonNull<u8>, length: usize) -> Result<()> {
        if length == 0 {
            return Err(Error::InvalidArg("mapping length must be > 0".into()));
        }
        let mut registry = self.lock();
        if registry.forward.contains_key(&shelf_id) {
            return Err(Error::IdFound(shelf_id.to_string()));
        }
        let addr = base.as_ptr() as usize;
        if registry.overlaps(addr, length) {
            return Err(Error::InvalidArg(format!(
                "mapping for shelf {} overlaps a registered shelf",
                shelf_id
            )));
        }
        registry.forward.insert(shelf_id, (addr, length));
        registry.reverse.insert(addr, (shelf_id, length));
        Ok(())
    }

    /// Remove a shelf's entries; returns the base that was registered.
    pub fn unregister(&self, shelf_id: ShelfId) -> Result<NonNull<u8>> {
        let mut registry = self.lock();
        let (base, _) = registry
            .forward
            .remove(&shelf_id)
            .ok_or_else(|| Error::IdNotFound(shelf_id.to_string()))?;
        registry.reverse.remove(&base);
        Ok(NonNull::new(base as *mut u8).expect("registered base is never null"))
    }

    /// The registered base for `shelf_id`, if any.
    pub fn lookup(&self, shelf_id: ShelfId) -> Option<NonNull<u8>> {
        let registry = self.lock();
        let &(base, _) = registry.forward.get(&shelf_id)?;
        NonNull::new(base as *mut u8)
    }

    /// Alias of [`lookup`](Self::lookup) for the common deref path.
    pub fn find_base(&self, shelf_id: ShelfId) -> Option<NonNull<u8>> {
        self.lookup(shelf_id)
    }

    /// The registered base for `shelf_id`, mapping the shelf on demand.
    ///
    /// If the shelf is not yet registered, its region at `path` is opened,
    /// the whole payload is mapped, and the mapping is registered. This is
    /// how a freshly attached process makes cross-process shelves visible.
    pub fn find_base_from_path<P: AsRef<Path>>(
        &self,
        path: P,
        shelf_id: ShelfId,
    ) -> Result<NonNull<u8>> {
        let mut registry = self.lock();
        if let Some(&(base, _)) = registry.forward.get(&shelf_id) {
            return NonNull::new(base as *mut u8)
                .ok_or_else(|| Error::IdNotFound(shelf_id.to_string()));
        }

        let mut region = ShelfRegion::new(path.as_ref());
        region.open(false)?;
        let length = region.size()? as usize;
        let mapped = region.map(None, length, 0, false);
        region.close()?;
        let base = mapped?;

        let addr = base.as_ptr() as usize;
        if registry.overlaps(addr, length) {
            // A fresh MAP_SHARED mapping landing inside a registered
            // interval means the bookkeeping no longer matches the address
            // space; drop the new mapping and report it.
            unsafe { region.unmap(base, length)? };
            return Err(Error::InvalidArg(format!(
                "mapping for shelf {} overlaps a registered shelf",
                shelf_id
            )));
        }
        registry.forward.insert(shelf_id, (addr, length));
        registry.reverse.insert(addr, (shelf_id, length));
        tracing::debug!(
            "mapped shelf {} at {:p} (+{} bytes)",
            shelf_id,
            base.as_ptr(),
            length
        );
        Ok(base)
    }

    /// The shelf containing `ptr`, with its base, if any.
    pub fn find_shelf(&self, ptr: NonNull<u8>) -> Option<(ShelfId, NonNull<u8>)> {
        self.lock().find_shelf(ptr.as_ptr() as usize)
    }

    /// Hold the registry lock across several lookups.
    ///
    /// Registration and unregistration block until the guard drops, so a
    /// caller translating a batch of pointers sees one consistent
    /// snapshot.
    pub fn locked(&self) -> RegistryGuard<'_> {
        RegistryGuard(self.lock())
    }

    /// Unmap every registered shelf and clear both maps.
    ///
    /// Tests and teardown only: the caller must guarantee nothing still
    /// dereferences the registered bases.
    pub fn reset(&self) -> Result<()> {
        let mut registry = self.lock();
        for (&base, &(_, length)) in registry.reverse.iter() {
            unsafe {
                rustix::mm::munmap((base as *mut u8).cast(), length)?;
            }
        }
        registry.forward.clear();
        registry.reverse.clear();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive view of the registry for atomic multi-lookup sequences.
pub struct RegistryGuard<'a>(MutexGuard<'a, Registry>);

impl RegistryGuard<'_> {
    /// The registered base for `shelf_id`, if any.
    pub fn lookup(&self, shelf_id: ShelfId) -> Option<NonNull<u8>> {
        let &(base, _) = self.0.forward.get(&shelf_id)?;
        NonNull::new(base as *mut u8)
    }

    /// The shelf containing `ptr`, with its base, if any.
    pub fn find_shelf(&self, ptr: NonNull<u8>) -> Option<(ShelfId, NonNull<u8>)> {
        self.0.find_shelf(ptr.as_ptr() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(addr: usize) -> NonNull<u8> {
        NonNull::new(addr as *mut u8).unwrap()
    }

    #[test]
    fn test_register_lookup_unregister() {
        let manager = ShelfManager::new();
        let id = ShelfId::new(1, 1);

        assert!(manager.lookup(id).is_none());
        manager.register(id, ptr(0x1000), 0x1000).unwrap();
        assert_eq!(manager.lookup(id), Some(ptr(0x1000)));
        assert_eq!(manager.find_base(id), Some(ptr(0x1000)));

        let base = manager.unregister(id).unwrap();
        assert_eq!(base, ptr(0x1000));
        assert!(manager.lookup(id).is_none());
        assert!(matches!(manager.unregister(id), Err(Error::IdNotFound(_))));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let manager = ShelfManager::new();
        let id = ShelfId::new(1, 1);
        manager.register(id, ptr(0x1000), 0x1000).unwrap();
        assert!(matches!(
            manager.register(id, ptr(0x10000), 0x1000),
            Err(Error::IdFound(_))
        ));
        // State unchanged.
        assert_eq!(manager.lookup(id), Some(ptr(0x1000)));
    }

    #[test]
    fn test_overlap_rejected() {
        let manager = ShelfManager::new();
        manager
            .register(ShelfId::new(1, 1), ptr(0x2000), 0x1000)
            .unwrap();

        // Overlapping from below, above, inside, and exactly equal.
        for (base, len) in [
            (0x1800, 0x1000),
            (0x2800, 0x1000),
            (0x2100, 0x100),
            (0x2000, 0x1000),
        ] {
            assert!(
                matches!(
                    manager.register(ShelfId::new(1, 2), ptr(base), len),
                    Err(Error::InvalidArg(_))
                ),
                "[{:#x}, +{:#x}) should overlap",
                base,
                len
            );
        }

        // Adjacent intervals are fine.
        manager
            .register(ShelfId::new(1, 2), ptr(0x1000), 0x1000)
            .unwrap();
        manager
            .register(ShelfId::new(1, 3), ptr(0x3000), 0x1000)
            .unwrap();
    }

    #[test]
    fn test_locked_guard_consistent_view() {
        let manager = ShelfManager::new();
        let id = ShelfId::new(1, 1);
        manager.register(id, ptr(0x1000), 0x1000).unwrap();

        let guard = manager.locked();
        let base = guard.lookup(id).unwrap();
        assert_eq!(guard.find_shelf(base), Some((id, base)));
        drop(guard);

        manager.unregister(id).unwrap();
    }

    #[test]
    fn test_find_shelf_predecessor_lookup() {
        let manager = ShelfManager::new();
        let a = ShelfId::new(1, 1);
        let b = ShelfId::new(1, 2);
        manager.register(a, ptr(0x1000), 0x1000).unwrap();
        manager.register(b, ptr(0x4000), 0x1000).unwrap();

        assert_eq!(manager.find_shelf(ptr(0x1000)), Some((a, ptr(0x1000))));
        assert_eq!(manager.find_shelf(ptr(0x1fff)), Some((a, ptr(0x1000))));
        assert_eq!(manager.find_shelf(ptr(0x4234)), Some((b, ptr(0x4000))));
        assert!(manager.find_shelf(ptr(0x2000)).is_none());
        assert!(manager.find_shelf(ptr(0x800)).is_none());
        assert!(manager.find_shelf(ptr(0x5000)).is_none());
    }
}
