//! Distributed-counter reader-writer lock.
//!
//! Readers touch only their own slot, so uncontended read acquire and
//! release are a single atomic add each and never pass a cache line
//! between reader threads. The writer sets a flag and then waits for every
//! slot to drain. This is the lock protecting local-epoch advancement:
//! critical regions take the read side, the monitor's epoch report takes
//! the write side.
//!
//! Slots live in a fixed-capacity slab, open-addressed by a process-local
//! thread id; a thread claims its slot on first use and keeps it for the
//! life of the lock. Because a slot has exactly one owner, a nested read
//! acquire can observe its own outstanding hold and skip the writer
//! back-off: the writer cannot have passed a slot whose count it is still
//! waiting to see reach zero. No allocation or dynamic dispatch after
//! construction.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

const DEFAULT_SLOTS: usize = 256;

#[repr(align(64))]
struct Slot {
    /// Process-local thread key owning this slot; 0 = unclaimed.
    owner: AtomicU64,
    /// Outstanding read holds by the owner.
    count: AtomicU64,
}

fn thread_key() -> u64 {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    thread_local! {
        static KEY: u64 = NEXT.fetch_add(1, Ordering::Relaxed) as u64;
    }
    KEY.with(|k| *k)
}

/// Reader-writer lock with per-thread reader counters.
///
/// The read side is acquired and released with explicit calls so a hold
/// can span a critical region whose begin and end are separate method
/// calls; both must happen on the same thread. The write side is an RAII
/// guard.
pub struct DistRwLock {
    slots: Box<[Slot]>,
    writer_active: AtomicBool,
    writer_serial: Mutex<()>,
}

impl DistRwLock {
    /// Create a lock with the default slot capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SLOTS)
    }

    /// Create a lock with room for `capacity` distinct reader threads.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    owner: AtomicU64::new(0),
                    count: AtomicU64::new(0),
                })
                .collect(),
            writer_active: AtomicBool::new(false),
            writer_serial: Mutex::new(()),
        }
    }

    /// This thread's slot, claiming one by linear probing on first use.
    ///
    /// Panics if more than `capacity` distinct threads ever take the read
    /// side of this lock.
    fn slot(&self) -> &Slot {
        let key = thread_key();
        let len = self.slots.len();
        let start = (key as usize) % len;
        for probe in 0..len {
            let slot = &self.slots[(start + probe) % len];
            let owner = slot.owner.load(Ordering::Acquire);
            if owner == key {
                return slot;
            }
            if owner == 0
                && slot
                    .owner
                    .compare_exchange(0, key, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return slot;
            }
        }
        panic!("reader slot capacity ({}) exhausted", len);
    }

    /// Acquire a read hold. Pair with [`read_release`](Self::read_release)
    /// on the same thread.
    ///
    /// Non-blocking unless a writer is active, and reentrant: a thread
    /// already holding the read side never waits.
    pub fn read_acquire(&self) {
        let slot = self.slot();
        loop {
            let prev = slot.count.fetch_add(1, Ordering::AcqRel);
            if prev > 0 || !self.writer_active.load(Ordering::Acquire) {
                return;
            }
            // A writer is draining slots and ours just went 0 -> 1;
            // back off so it can finish.
            slot.count.fetch_sub(1, Ordering::Release);
            while self.writer_active.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
        }
    }

    /// Release a read hold acquired on this thread.
    pub fn read_release(&self) {
        let prev = self.slot().count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0, "read_release without matching read_acquire");
    }

    /// Acquire the write side, waiting for every reader slot to drain.
    pub fn write(&self) -> WriteGuard<'_> {
        let serial = self
            .writer_serial
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.writer_active.store(true, Ordering::Release);
        for slot in self.slots.iter() {
            let mut spins = 0u32;
            while slot.count.load(Ordering::Acquire) != 0 {
                spins = spins.wrapping_add(1);
                if spins % 1024 == 0 {
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }
        WriteGuard {
            lock: self,
            _serial: serial,
        }
    }
}

impl Default for DistRwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII write hold; readers resume when this drops.
pub struct WriteGuard<'a> {
    lock: &'a DistRwLock,
    _serial: MutexGuard<'a, ()>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.writer_active.store(false, Ordering::Release);
    }
}
