//! Shared on-shelf vector of per-participant epoch counters.
//!
//! The vector lives in the metadata shelf's payload and is shared by every
//! process attached to the pool family. Payload layout, little-endian:
//!
//! ```text
//! offset 0:  frontier epoch (u64)
//! offset 8:  slot 0 .. slot N-1, 32 bytes each:
//!            ┌──────────┬──────┬───────────┬───────────┬───────────┬──────┐
//!            │ pid: u32 │ pad  │ epoch:u64 │   ts:u64  │ flags:u32 │ pad  │
//!            └──────────┴──────┴───────────┴───────────┴───────────┴──────┘
//! ```
//!
//! Every field is read and written through 32/64-bit atomics on the mapped
//! page. Slots are never compacted, so a claimed slot's address is stable
//! for as long as the participant holds it.

use crate::error::{Error, Result};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed slot capacity of the vector.
pub const MAX_PARTICIPANTS: usize = 256;

/// Payload bytes the vector occupies.
pub const VECTOR_PAYLOAD_SIZE: u64 = (8 + MAX_PARTICIPANTS * SLOT_SIZE) as u64;

/// A participant slot whose liveness timestamp lags `now` by more than
/// this many microseconds is considered dead and may be evicted.
pub const TIMEOUT_US: u64 = 1_000_000;

const SLOT_SIZE: usize = 32;

const FLAG_FREE: u32 = 0;
const FLAG_LIVE: u32 = 1;
// Claimed but not yet initialized; treated as dead once its ts goes stale.
const FLAG_INIT: u32 = 2;

/// Microseconds since the Unix epoch, the vector's liveness clock.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[repr(C)]
struct SlotRepr {
    pid: AtomicU32,
    _pad0: u32,
    epoch: AtomicU64,
    ts: AtomicU64,
    flags: AtomicU32,
    _pad1: u32,
}

/// Handle to one claimed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    index: usize,
    pid: u32,
}

impl Participant {
    /// Slot index within the vector.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Participant id recorded in the slot.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// View over the mapped epoch-vector payload.
///
/// Copyable: the view holds no resources, only the payload base.
#[derive(Clone, Copy)]
pub struct EpochVector {
    base: NonNull<u8>,
}

// SAFETY: the view points into a MAP_SHARED mapping accessed exclusively
// through atomics; it carries no thread-affine state.
unsafe impl Send for EpochVector {}
unsafe impl Sync for EpochVector {}

impl EpochVector {
    /// Wrap a mapped payload of at least [`VECTOR_PAYLOAD_SIZE`] bytes.
    ///
    /// # Safety
    ///
    /// `base` must point at a live `MAP_SHARED` mapping of the vector
    /// payload, 8-byte aligned, valid for the lifetime of all use of the
    /// returned view.
    pub unsafe fn from_base(base: NonNull<u8>) -> Self {
        Self { base }
    }

    fn frontier_word(&self) -> &AtomicU64 {
        // SAFETY: offset 0 of the payload is the frontier word; the
        // mapping outlives the view per `from_base`'s contract.
        unsafe { &*self.base.as_ptr().cast::<AtomicU64>() }
    }

    fn slot(&self, index: usize) -> &SlotRepr {
        debug_assert!(index < MAX_PARTICIPANTS);
        // SAFETY: slots start at payload offset 8 and the index is in
        // bounds, so the reference stays inside the mapping.
        unsafe {
            &*self
                .base
                .as_ptr()
                .add(8 + index * SLOT_SIZE)
                .cast::<SlotRepr>()
        }
    }

    /// One-time (idempotent) initialization: the frontier starts at 1 so
    /// that epoch 0 can mean "never".
    pub fn init(&self) {
        let _ = self
            .frontier_word()
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
    }

    /// The current frontier epoch.
    pub fn frontier(&self) -> u64 {
        self.frontier_word().load(Ordering::Acquire)
    }

    /// Claim a slot for `pid`.
    ///
    /// Preference order: reclaim a slot already carrying `pid` (a restart
    /// after eviction or crash), then the lowest free slot, then a dead
    /// slot evicted on the spot. Fails with [`Error::PoolFull`] when every
    /// slot is live.
    pub fn join(&self, pid: u32) -> Result<Participant> {
        let now = now_micros();

        // A participant id owns at most one live slot: take ours back if a
        // previous incarnation left one behind.
        for index in 0..MAX_PARTICIPANTS {
            let slot = self.slot(index);
            if slot.flags.load(Ordering::Acquire) == FLAG_LIVE
                && slot.pid.load(Ordering::Acquire) == pid
            {
                slot.epoch.store(self.frontier(), Ordering::Release);
                slot.ts.store(now, Ordering::Release);
                tracing::debug!("participant {} reclaimed slot {}", pid, index);
                return Ok(Participant { index, pid });
            }
        }

        for attempt in 0..2 {
            for index in 0..MAX_PARTICIPANTS {
                let slot = self.slot(index);
                if slot
                    .flags
                    .compare_exchange(FLAG_FREE, FLAG_INIT, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    slot.pid.store(pid, Ordering::Release);
                    slot.epoch.store(self.frontier(), Ordering::Release);
                    slot.ts.store(now, Ordering::Release);
                    slot.flags.store(FLAG_LIVE, Ordering::Release);
                    tracing::debug!("participant {} joined slot {}", pid, index);
                    return Ok(Participant { index, pid });
                }
            }
            // No free slot; evict stragglers and retry once.
            if attempt == 0 && self.evict_dead(now) == 0 {
                break;
            }
        }
        Err(Error::PoolFull)
    }

    /// Release a slot. Idempotent: releasing an already-free slot is a
    /// no-op, so a crashed participant's restart can call this safely.
    pub fn leave(&self, participant: Participant) {
        let slot = self.slot(participant.index);
        if slot.pid.load(Ordering::Acquire) == participant.pid {
            slot.flags.store(FLAG_FREE, Ordering::Release);
        }
    }

    /// Refresh the slot's liveness timestamp.
    pub fn heartbeat(&self, participant: Participant) {
        self.slot(participant.index)
            .ts
            .store(now_micros(), Ordering::Release);
    }

    /// Persist the participant's view of its current epoch.
    pub fn report_local_epoch(&self, participant: Participant, epoch: u64) {
        self.slot(participant.index)
            .epoch
            .store(epoch, Ordering::Release);
    }

    /// The last epoch this participant reported.
    pub fn reported_epoch(&self, participant: Participant) -> u64 {
        self.slot(participant.index).epoch.load(Ordering::Acquire)
    }

    /// Minimum epoch over live slots, and the frontier. With no live
    /// participants the minimum equals the frontier.
    pub fn snapshot_min(&self) -> (u64, u64) {
        let frontier = self.frontier();
        let mut min = u64::MAX;
        for index in 0..MAX_PARTICIPANTS {
            let slot = self.slot(index);
            if slot.flags.load(Ordering::Acquire) == FLAG_LIVE {
                min = min.min(slot.epoch.load(Ordering::Acquire));
            }
        }
        if min == u64::MAX {
            min = frontier;
        }
        (min, frontier)
    }

    /// Advance the frontier by one if every live slot has reported an
    /// epoch at least `frontier - 1`. Returns the resulting frontier.
    pub fn advance_frontier(&self) -> u64 {
        let frontier = self.frontier();
        let (min, _) = self.snapshot_min();
        if min + 1 >= frontier {
            match self.frontier_word().compare_exchange(
                frontier,
                frontier + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => frontier + 1,
                Err(current) => current,
            }
        } else {
            frontier
        }
    }

    /// Evict every slot whose liveness timestamp is older than
    /// [`TIMEOUT_US`]. Returns the number of slots evicted.
    pub fn evict_dead(&self, now: u64) -> usize {
        let mut evicted = 0;
        for index in 0..MAX_PARTICIPANTS {
            if self.try_evict(index, now) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Evict slot `index` if it is claimed and stale. Returns whether the
    /// eviction happened.
    pub fn try_evict(&self, index: usize, now: u64) -> bool {
        let slot = self.slot(index);
        let flags = slot.flags.load(Ordering::Acquire);
        if flags == FLAG_FREE {
            return false;
        }
        let ts = slot.ts.load(Ordering::Acquire);
        if now.saturating_sub(ts) <= TIMEOUT_US {
            return false;
        }
        // Only one evictor wins the CAS; the timestamp re-check bounds the
        // window in which a merely-slow participant can be evicted.
        if slot.ts.load(Ordering::Acquire) != ts {
            return false;
        }
        if slot
            .flags
            .compare_exchange(flags, FLAG_FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::warn!(
                "evicted dead participant {} from slot {}",
                slot.pid.load(Ordering::Acquire),
                index
            );
            return true;
        }
        false
    }

    /// Pid and reported epoch of each live slot, for diagnostics and for
    /// identifying the participant stalling the frontier.
    pub fn live_participants(&self) -> Vec<(u32, u64)> {
        let mut live = Vec::new();
        for index in 0..MAX_PARTICIPANTS {
            let slot = self.slot(index);
            if slot.flags.load(Ordering::Acquire) == FLAG_LIVE {
                live.push((
                    slot.pid.load(Ordering::Acquire),
                    slot.epoch.load(Ordering::Acquire),
                ));
            }
        }
        live
    }

    /// Zero every slot and restart the frontier at 1. Tests and teardown
    /// only; callers must guarantee no other process is attached.
    pub fn reset(&self) {
        for index in 0..MAX_PARTICIPANTS {
            let slot = self.slot(index);
            slot.flags.store(FLAG_FREE, Ordering::Release);
            slot.pid.store(0, Ordering::Release);
            slot.epoch.store(0, Ordering::Release);
            slot.ts.store(0, Ordering::Release);
        }
        self.frontier_word().store(1, Ordering::Release);
    }

    /// [`reset`](Self::reset), but keep `survivor`'s slot claimed and
    /// restart it at epoch 1. Tests and teardown only.
    pub fn reset_except(&self, survivor: Participant) {
        for index in 0..MAX_PARTICIPANTS {
            if index == survivor.index {
                continue;
            }
            let slot = self.slot(index);
            slot.flags.store(FLAG_FREE, Ordering::Release);
            slot.pid.store(0, Ordering::Release);
            slot.epoch.store(0, Ordering::Release);
            slot.ts.store(0, Ordering::Release);
        }
        let survivor_slot = self.slot(survivor.index);
        survivor_slot.epoch.store(1, Ordering::Release);
        survivor_slot.ts.store(now_micros(), Ordering::Release);
        self.frontier_word().store(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Backing {
        mem: Vec<u64>,
    }

    impl Backing {
        fn new() -> Self {
            Self {
                mem: vec![0u64; (VECTOR_PAYLOAD_SIZE as usize) / 8],
            }
        }

        fn vector(&self) -> EpochVector {
            let base = NonNull::new(self.mem.as_ptr() as *mut u8).unwrap();
            // SAFETY: the Vec is 8-byte aligned, large enough, and outlives
            // every view handed out by the test.
            unsafe { EpochVector::from_base(base) }
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        let backing = Backing::new();
        let vector = backing.vector();
        vector.init();
        assert_eq!(vector.frontier(), 1);
        vector.init();
        assert_eq!(vector.frontier(), 1);
    }

    #[test]
    fn test_join_leave() {
        let backing = Backing::new();
        let vector = backing.vector();
        vector.init();

        let a = vector.join(100).unwrap();
        let b = vector.join(200).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(vector.live_participants().len(), 2);

        vector.leave(a);
        assert_eq!(vector.live_participants().len(), 1);
        // Idempotent under a crashed restart.
        vector.leave(a);

        // The freed slot is the lowest again.
        let c = vector.join(300).unwrap();
        assert_eq!(c.index(), 0);
    }

    #[test]
    fn test_rejoin_same_pid_reclaims_slot() {
        let backing = Backing::new();
        let vector = backing.vector();
        vector.init();

        let a = vector.join(100).unwrap();
        // Same pid joining again (post-crash restart) reuses the slot
        // instead of claiming a second one.
        let b = vector.join(100).unwrap();
        assert_eq!(a.index(), b.index());
        assert_eq!(vector.live_participants().len(), 1);
    }

    #[test]
    fn test_advance_requires_reports() {
        let backing = Backing::new();
        let vector = backing.vector();
        vector.init();

        let a = vector.join(1).unwrap();
        let b = vector.join(2).unwrap();
        assert_eq!(vector.frontier(), 1);

        // Both at epoch 1 (= frontier): advance to 2.
        assert_eq!(vector.advance_frontier(), 2);
        // a reports 2, b still at 1 = frontier - 1: advance to 3.
        vector.report_local_epoch(a, 2);
        assert_eq!(vector.advance_frontier(), 3);
        // b is now two behind: stall.
        assert_eq!(vector.advance_frontier(), 3);
        vector.report_local_epoch(b, 3);
        vector.report_local_epoch(a, 3);
        assert_eq!(vector.advance_frontier(), 4);

        let (min, frontier) = vector.snapshot_min();
        assert_eq!(min, 3);
        assert_eq!(frontier, 4);
    }

    #[test]
    fn test_eviction_frees_stale_slot() {
        let backing = Backing::new();
        let vector = backing.vector();
        vector.init();

        let a = vector.join(1).unwrap();
        let now = now_micros();

        // Fresh heartbeat: not evictable.
        vector.heartbeat(a);
        assert_eq!(vector.evict_dead(now_micros()), 0);

        // Age the slot past the timeout.
        assert!(!vector.try_evict(a.index(), now));
        vector.slot(a.index())
            .ts
            .store(now - TIMEOUT_US - 1, Ordering::Release);
        assert!(vector.try_evict(a.index(), now));
        assert!(vector.live_participants().is_empty());

        // Re-join with the same pid afterwards is allowed.
        vector.join(1).unwrap();
    }

    #[test]
    fn test_pool_full() {
        let backing = Backing::new();
        let vector = backing.vector();
        vector.init();

        for pid in 0..MAX_PARTICIPANTS as u32 {
            vector.join(pid + 1).unwrap();
        }
        assert!(matches!(vector.join(9999), Err(Error::PoolFull)));
    }
}
