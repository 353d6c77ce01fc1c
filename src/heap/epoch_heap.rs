//! Zone heap with epoch-delayed reclamation.
//!
//! [`EpochZoneHeap`] layers delayed frees over [`ZoneHeap`]: a free made
//! inside a critical region is queued under the region's reported epoch
//! instead of hitting the free lists, and a background worker returns the
//! chunk only once the shared frontier proves every possible observer has
//! moved on. The frontier can run at most two epochs past a still-active
//! region's report (advancement only demands that every participant sit
//! within one epoch of the frontier), so a free at epoch `E` is
//! reclaimable strictly after the frontier passes `E + 2`.

use crate::epoch::{EpochManager, EpochOp};
use crate::heap::zone::ZoneHeap;
use crate::ptr::GlobalPtr;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Reclamation worker period, microseconds.
pub const RECLAIM_INTERVAL_US: u64 = 1000;

/// A free at epoch `e` becomes reclaimable once the frontier exceeds
/// `e + 2`, i.e. reaches `e + RECLAIM_MARGIN`.
const RECLAIM_MARGIN: u64 = 3;

type PendingQueue = Mutex<BTreeMap<u64, Vec<GlobalPtr>>>;

/// Buddy heap whose frees can be deferred until epoch-safe.
pub struct EpochZoneHeap {
    zone: Arc<ZoneHeap>,
    epochs: Arc<EpochManager>,
    pending: Arc<PendingQueue>,
    terminate_worker: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl EpochZoneHeap {
    /// Wrap an open zone heap and start the reclamation worker.
    pub fn new(zone: ZoneHeap, epochs: Arc<EpochManager>) -> Self {
        let zone = Arc::new(zone);
        let pending: Arc<PendingQueue> = Arc::new(Mutex::new(BTreeMap::new()));
        let terminate_worker = Arc::new(AtomicBool::new(false));
        let worker = spawn_reclaimer(
            Arc::clone(&zone),
            Arc::clone(&epochs),
            Arc::clone(&pending),
            Arc::clone(&terminate_worker),
        );
        Self {
            zone,
            epochs,
            pending,
            terminate_worker,
            worker: Some(worker),
        }
    }

    /// The underlying zone heap.
    pub fn zone(&self) -> &ZoneHeap {
        &self.zone
    }

    /// The epoch manager coordinating this heap's reclamation.
    pub fn epochs(&self) -> &Arc<EpochManager> {
        &self.epochs
    }

    /// Smallest allocation unit.
    pub fn min_alloc_size(&self) -> u64 {
        self.zone.min_alloc_size()
    }

    /// Allocate inside a critical region.
    pub fn alloc(&self, _op: &EpochOp<'_>, bytes: u64) -> GlobalPtr {
        self.zone.alloc(bytes)
    }

    /// Allocate outside any critical region, for memory the caller knows
    /// is not shared yet.
    pub fn alloc_now(&self, bytes: u64) -> GlobalPtr {
        self.zone.alloc(bytes)
    }

    /// Defer the free of `ptr` until every participant has left the
    /// region's epoch.
    ///
    /// The chunk stays unavailable to allocation at least until the
    /// frontier reaches `op.reported_epoch() + 2`.
    pub fn free(&self, op: &EpochOp<'_>, ptr: GlobalPtr) {
        if !ptr.is_valid() {
            debug_assert!(false, "deferred free of invalid pointer");
            return;
        }
        lock(&self.pending)
            .entry(op.reported_epoch())
            .or_default()
            .push(ptr);
    }

    /// Free immediately, bypassing the queue. Only for chunks the caller
    /// knows no other participant can still observe.
    pub fn free_now(&self, ptr: GlobalPtr) {
        self.zone.free(ptr);
    }

    /// Coalesce adjacent free buddies; see [`ZoneHeap::merge`].
    pub fn merge(&self) {
        self.zone.merge();
    }

    /// Number of frees still waiting for the frontier.
    pub fn pending(&self) -> usize {
        lock(&self.pending).values().map(Vec::len).sum()
    }

    /// Stop the worker, flush every already-safe entry, and mark the heap
    /// cleanly closed.
    ///
    /// Entries whose epoch is still too young are dropped: their chunks
    /// stay allocated on the shelf until something frees them again.
    pub fn close(mut self) -> crate::error::Result<()> {
        self.stop_worker();
        let frontier = self.epochs.frontier_epoch();
        let (ripe, unripe) = split_reclaimable(&self.pending, frontier);
        for ptr in ripe {
            self.zone.free(ptr);
        }
        if unripe > 0 {
            tracing::warn!(
                "closing with {} deferred frees not yet reclaimable; their chunks leak",
                unripe
            );
        }
        self.zone.close()
    }

    fn stop_worker(&mut self) {
        self.terminate_worker.store(true, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EpochZoneHeap {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn lock(pending: &PendingQueue) -> MutexGuard<'_, BTreeMap<u64, Vec<GlobalPtr>>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pull every entry whose epoch satisfies the reclaim margin. Entries of
/// one epoch come back newest-first so that replaying them through the
/// LIFO free lists reproduces immediate-free reuse order. Also returns the
/// count of entries left queued.
fn split_reclaimable(pending: &PendingQueue, frontier: u64) -> (Vec<GlobalPtr>, usize) {
    let mut queue = lock(pending);
    if frontier < RECLAIM_MARGIN {
        let remaining = queue.values().map(Vec::len).sum();
        return (Vec::new(), remaining);
    }
    // Keys strictly below `frontier - 2` satisfy epoch + 2 < frontier.
    let keep = queue.split_off(&(frontier - 2));
    let ripe = std::mem::replace(&mut *queue, keep);
    let remaining = queue.values().map(Vec::len).sum();
    drop(queue);

    let mut chunks = Vec::new();
    for (_, entries) in ripe {
        chunks.extend(entries.into_iter().rev());
    }
    (chunks, remaining)
}

fn spawn_reclaimer(
    zone: Arc<ZoneHeap>,
    epochs: Arc<EpochManager>,
    pending: Arc<PendingQueue>,
    terminate: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("shelfheap-reclaim".into())
        .spawn(move || {
            let interval = Duration::from_micros(RECLAIM_INTERVAL_US);
            while !terminate.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                let frontier = epochs.frontier_epoch();
                let (ripe, _) = split_reclaimable(&pending, frontier);
                if !ripe.is_empty() {
                    tracing::trace!(
                        "reclaiming {} chunks at frontier {}",
                        ripe.len(),
                        frontier
                    );
                }
                for ptr in ripe {
                    zone.free(ptr);
                }
            }
        })
        .expect("failed to spawn reclamation thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptr::{GlobalPtr, ShelfId};

    fn ptr(offset: u64) -> GlobalPtr {
        GlobalPtr::new(ShelfId::new(1, 1), offset)
    }

    #[test]
    fn test_split_reclaimable_honors_margin() {
        let pending: PendingQueue = Mutex::new(BTreeMap::new());
        {
            let mut queue = pending.lock().unwrap();
            queue.insert(1, vec![ptr(64)]);
            queue.insert(2, vec![ptr(128)]);
            queue.insert(3, vec![ptr(192)]);
        }

        // Frontier 3: an epoch-1 region may still be live; nothing ripens.
        let (ripe, remaining) = split_reclaimable(&pending, 3);
        assert!(ripe.is_empty());
        assert_eq!(remaining, 3);

        // Frontier 4: only epoch 1 satisfies e + 2 < frontier.
        let (ripe, remaining) = split_reclaimable(&pending, 4);
        assert_eq!(ripe, vec![ptr(64)]);
        assert_eq!(remaining, 2);

        // Frontier 6: epochs 2 and 3 follow.
        let (ripe, remaining) = split_reclaimable(&pending, 6);
        assert_eq!(ripe, vec![ptr(128), ptr(192)]);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_split_reclaimable_replays_epoch_newest_first() {
        let pending: PendingQueue = Mutex::new(BTreeMap::new());
        pending
            .lock()
            .unwrap()
            .insert(1, vec![ptr(64), ptr(128), ptr(192)]);

        let (ripe, _) = split_reclaimable(&pending, 4);
        assert_eq!(ripe, vec![ptr(192), ptr(128), ptr(64)]);
    }

    #[test]
    fn test_split_reclaimable_low_frontier() {
        let pending: PendingQueue = Mutex::new(BTreeMap::new());
        pending.lock().unwrap().insert(1, vec![ptr(64)]);

        let (ripe, remaining) = split_reclaimable(&pending, 2);
        assert!(ripe.is_empty());
        assert_eq!(remaining, 1);
    }
}
