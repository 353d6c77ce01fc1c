//! Per-process epoch participant driver.
//!
//! An [`EpochManager`] claims a slot in the shared epoch vector and keeps
//! it alive with two background workers:
//!
//! - the **heartbeat** thread refreshes the slot's liveness timestamp and
//!   re-reports the local epoch every [`HEARTBEAT_INTERVAL_US`];
//! - the **monitor** thread advances the local epoch (write side of the
//!   local-epoch lock, so it never overtakes an active critical region),
//!   tries to advance the shared frontier, watches for a stalled frontier,
//!   and evicts dead participants.
//!
//! Critical regions are entered through [`EpochOp`], an RAII guard whose
//! reported epoch keys delayed frees.

use crate::config;
use crate::epoch::rwlock::DistRwLock;
use crate::epoch::vector::{now_micros, EpochVector, Participant, TIMEOUT_US, VECTOR_PAYLOAD_SIZE};
use crate::error::{Error, Result};
use crate::shelf::ShelfRegion;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Heartbeat period, microseconds.
pub const HEARTBEAT_INTERVAL_US: u64 = 1000;

/// Monitor period, microseconds.
pub const MONITOR_INTERVAL_US: u64 = 1000;

/// Period of the monitor's debug report, microseconds.
pub const DEBUG_INTERVAL_US: u64 = 1_000_000;

/// Payload size of the metadata region backing the epoch vector.
const VECTOR_REGION_SIZE: u64 = 16384;

/// Invoked with the offending participant id when the frontier stalls
/// past the liveness timeout.
pub type FailureCallback = Box<dyn Fn(u32) + Send + Sync>;

struct Shared {
    vector: EpochVector,
    participant: Participant,
    epoch_lock: DistRwLock,
    active: Mutex<u32>,
    local_epoch: AtomicU64,
    terminate_heartbeat: AtomicBool,
    terminate_monitor: AtomicBool,
    callback: Mutex<Option<FailureCallback>>,
}

impl Shared {
    /// Report the current frontier as this process's local epoch.
    ///
    /// Takes the write side of the local-epoch lock: by the time the store
    /// lands, no critical region opened under an older epoch is active,
    /// and none can open until the report is done.
    fn advance_local(&self) {
        let _writer = self.epoch_lock.write();
        let frontier = self.vector.frontier();
        self.local_epoch.store(frontier, Ordering::Release);
        self.vector.report_local_epoch(self.participant, frontier);
    }
}

/// Per-process driver for the shared epoch vector.
pub struct EpochManager {
    shared: Arc<Shared>,
    base: NonNull<u8>,
    mapped_len: usize,
    path: PathBuf,
    heartbeat: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
}

// SAFETY: the mapping base is only used for the final munmap; all shared
// state is behind atomics or mutexes.
unsafe impl Send for EpochManager {}
unsafe impl Sync for EpochManager {}

impl EpochManager {
    /// Join the epoch vector at its configured location
    /// (`NVM_SHELF_BASE/NVM_EPOCH_VECTOR`), creating it on first use.
    pub fn new() -> Result<Self> {
        Self::with_path(config::epoch_vector_path())
    }

    /// Join an epoch vector at an explicit pathname.
    ///
    /// Fails with [`Error::PoolFull`] when every slot is held by a live
    /// participant.
    pub fn with_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut region = ShelfRegion::new(&path);

        if !path.exists() {
            match region.create(VECTOR_REGION_SIZE) {
                Ok(()) | Err(Error::ShelfExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        // Another process may still be formatting; wait for a valid header.
        let mut verified = region.verify();
        for _ in 0..1000 {
            if verified.is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
            verified = region.verify();
        }
        verified?;
        region.open(false)?;
        let mapped_len = VECTOR_PAYLOAD_SIZE as usize;
        let mapped = region.map(None, mapped_len, 0, false);
        region.close()?;
        let base = mapped?;

        // SAFETY: `base` maps the vector payload MAP_SHARED and stays
        // mapped until Drop unmaps it after joining the workers.
        let vector = unsafe { EpochVector::from_base(base) };
        vector.init();
        let pid = std::process::id();
        let participant = match vector.join(pid) {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    let _ = rustix::mm::munmap(base.as_ptr().cast(), mapped_len);
                }
                return Err(e);
            }
        };

        let frontier = vector.frontier();
        vector.report_local_epoch(participant, frontier);
        let shared = Arc::new(Shared {
            vector,
            participant,
            epoch_lock: DistRwLock::new(),
            active: Mutex::new(0),
            local_epoch: AtomicU64::new(frontier),
            terminate_heartbeat: AtomicBool::new(false),
            terminate_monitor: AtomicBool::new(false),
            callback: Mutex::new(None),
        });

        let heartbeat = spawn_heartbeat(Arc::clone(&shared));
        let monitor = spawn_monitor(Arc::clone(&shared));
        tracing::info!(
            "epoch participant {} joined {} (slot {})",
            pid,
            path.display(),
            participant.index()
        );

        Ok(Self {
            shared,
            base,
            mapped_len,
            path,
            heartbeat: Some(heartbeat),
            monitor: Some(monitor),
        })
    }

    /// Pathname of the metadata shelf this manager is attached to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// This process's participant id.
    pub fn self_id(&self) -> u32 {
        self.shared.participant.pid()
    }

    /// Enter an epoch-protected critical region.
    ///
    /// Prefer [`EpochOp`], which pairs the exit automatically. Exit must
    /// happen on the same thread.
    pub fn enter_critical(&self) {
        let shared = &*self.shared;
        shared.epoch_lock.read_acquire();
        let mut active = lock(&shared.active);
        *active += 1;
        if *active == 1 {
            // First region in the process: pin the local epoch to the
            // frontier and publish it.
            let frontier = shared.vector.frontier();
            shared.local_epoch.store(frontier, Ordering::Release);
            shared.vector.report_local_epoch(shared.participant, frontier);
        }
    }

    /// Exit an epoch-protected critical region.
    pub fn exit_critical(&self) {
        let shared = &*self.shared;
        {
            let mut active = lock(&shared.active);
            debug_assert!(*active > 0, "exit_critical without enter_critical");
            *active -= 1;
        }
        shared.epoch_lock.read_release();
    }

    /// Whether at least one critical region is active. Inherently racy:
    /// a region may end before the caller looks at the answer.
    pub fn exists_active_critical(&self) -> bool {
        *lock(&self.shared.active) > 0
    }

    /// The last epoch this process reported.
    pub fn reported_epoch(&self) -> u64 {
        self.shared.local_epoch.load(Ordering::Acquire)
    }

    /// The shared frontier epoch.
    pub fn frontier_epoch(&self) -> u64 {
        self.shared.vector.frontier()
    }

    /// Register the callback the monitor invokes with the pid of a
    /// participant stalling the frontier past the liveness timeout.
    pub fn register_failure_callback(&self, callback: impl Fn(u32) + Send + Sync + 'static) {
        *lock(&self.shared.callback) = Some(Box::new(callback));
    }

    /// Stop and join the monitor thread. Heartbeats continue; the frontier
    /// then only advances when another participant drives it.
    pub fn disable_monitor(&mut self) {
        self.shared.terminate_monitor.store(true, Ordering::Release);
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
    }

    /// Clear every other participant's slot and restart the frontier.
    /// Tests and teardown only.
    pub fn reset_vector(&self) {
        let shared = &*self.shared;
        shared.vector.reset_except(shared.participant);
        shared.local_epoch.store(1, Ordering::Release);
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        self.shared.terminate_heartbeat.store(true, Ordering::Release);
        self.shared.terminate_monitor.store(true, Ordering::Release);
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.monitor.take() {
            let _ = handle.join();
        }
        self.shared.vector.leave(self.shared.participant);
        // SAFETY: both workers are joined and the participant has left;
        // nothing dereferences the mapping past this point.
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.mapped_len);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_heartbeat(shared: Arc<Shared>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("shelfheap-heartbeat".into())
        .spawn(move || {
            let interval = Duration::from_micros(HEARTBEAT_INTERVAL_US);
            while !shared.terminate_heartbeat.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                shared.vector.heartbeat(shared.participant);
                shared.vector.report_local_epoch(
                    shared.participant,
                    shared.local_epoch.load(Ordering::Acquire),
                );
            }
        })
        .expect("failed to spawn heartbeat thread")
}

fn spawn_monitor(shared: Arc<Shared>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("shelfheap-monitor".into())
        .spawn(move || {
            let interval = Duration::from_micros(MONITOR_INTERVAL_US);
            let debug_interval = Duration::from_micros(DEBUG_INTERVAL_US);
            let stall_timeout = Duration::from_micros(TIMEOUT_US);
            let debug_level = config::debug_level();
            let mut last_frontier = shared.vector.frontier();
            let mut last_change = Instant::now();
            let mut last_debug = Instant::now();

            while !shared.terminate_monitor.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                shared.advance_local();
                let frontier = shared.vector.advance_frontier();

                if frontier != last_frontier {
                    last_frontier = frontier;
                    last_change = Instant::now();
                } else if last_change.elapsed() >= stall_timeout {
                    report_stall(&shared, frontier);
                    shared.vector.evict_dead(now_micros());
                    last_change = Instant::now();
                }

                if debug_level > 0 && last_debug.elapsed() >= debug_interval {
                    let (min, frontier) = shared.vector.snapshot_min();
                    tracing::debug!(
                        frontier,
                        min_epoch = min,
                        live = shared.vector.live_participants().len(),
                        "epoch monitor"
                    );
                    last_debug = Instant::now();
                }
            }
        })
        .expect("failed to spawn monitor thread")
}

fn report_stall(shared: &Shared, frontier: u64) {
    // The straggler is the live participant with the oldest report.
    let Some(&(pid, epoch)) = shared
        .vector
        .live_participants()
        .iter()
        .min_by_key(|&&(_, epoch)| epoch)
    else {
        return;
    };
    tracing::warn!(
        "frontier stalled at {} by participant {} (epoch {})",
        frontier,
        pid,
        epoch
    );
    if let Some(callback) = lock(&shared.callback).as_ref() {
        callback(pid);
    }
}

/// RAII critical-region guard.
///
/// Construction enters a critical region and snapshots the epoch under
/// which this process is operating; dropping the guard exits the region.
/// The guard is not `Send`: a region must exit on the thread that
/// entered it.
pub struct EpochOp<'a> {
    manager: &'a EpochManager,
    epoch: u64,
    _not_send: PhantomData<*const ()>,
}

impl<'a> EpochOp<'a> {
    /// Enter a critical region.
    pub fn new(manager: &'a EpochManager) -> Self {
        manager.enter_critical();
        Self {
            manager,
            epoch: manager.reported_epoch(),
            _not_send: PhantomData,
        }
    }

    /// The epoch this region operates under. Delayed frees made through
    /// this guard are keyed by this value.
    pub fn reported_epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for EpochOp<'_> {
    fn drop(&mut self) {
        self.manager.exit_critical();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> EpochManager {
        EpochManager::with_path(dir.path().join("epoch-vector")).unwrap()
    }

    #[test]
    fn test_frontier_advances_over_time() {
        let dir = TempDir::new().unwrap();
        let em = manager(&dir);

        let start = em.frontier_epoch();
        let deadline = Instant::now() + Duration::from_secs(5);
        while em.frontier_epoch() < start + 3 {
            assert!(Instant::now() < deadline, "frontier stalled");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_critical_region_pins_reported_epoch() {
        let dir = TempDir::new().unwrap();
        let em = manager(&dir);

        let epoch = {
            let op = EpochOp::new(&em);
            assert!(em.exists_active_critical());
            let epoch = op.reported_epoch();
            // While the region is open, the report cannot move.
            std::thread::sleep(Duration::from_millis(10));
            assert_eq!(em.reported_epoch(), epoch);
            epoch
        };
        assert!(!em.exists_active_critical());

        // After exit, the monitor catches the report back up.
        let deadline = Instant::now() + Duration::from_secs(5);
        while em.reported_epoch() <= epoch {
            assert!(Instant::now() < deadline, "local epoch stalled");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_nested_regions_share_epoch() {
        let dir = TempDir::new().unwrap();
        let em = manager(&dir);

        let outer = EpochOp::new(&em);
        let inner = EpochOp::new(&em);
        assert_eq!(outer.reported_epoch(), inner.reported_epoch());
        drop(inner);
        assert!(em.exists_active_critical());
        drop(outer);
        assert!(!em.exists_active_critical());
    }

    #[test]
    fn test_reported_epoch_trails_frontier_by_at_most_two() {
        let dir = TempDir::new().unwrap();
        let em = manager(&dir);

        for _ in 0..50 {
            let op = EpochOp::new(&em);
            let frontier = em.frontier_epoch();
            // The report is pinned at or behind the frontier, and the
            // frontier can run at most two ahead before it must wait.
            assert!(op.reported_epoch() <= frontier);
            assert!(frontier - op.reported_epoch() <= 2);
            drop(op);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_failure_callback_on_stalled_participant() {
        let dir = TempDir::new().unwrap();
        let em = manager(&dir);
        let fired = Arc::new(AtomicU32::new(0));
        {
            let fired = Arc::clone(&fired);
            em.register_failure_callback(move |pid| {
                fired.store(pid, Ordering::SeqCst);
            });
        }

        // Forge a participant that reports an ancient epoch and never
        // heartbeats: the frontier stalls behind it.
        let vector = em.shared.vector;
        let ghost_pid = em.self_id() + 1;
        let ghost = vector.join(ghost_pid).unwrap();
        vector.report_local_epoch(ghost, 0);

        // The monitor must name the straggler and evict it once its
        // heartbeat goes stale, after which the frontier moves again.
        let deadline = Instant::now() + Duration::from_secs(10);
        while fired.load(Ordering::SeqCst) != ghost_pid {
            assert!(Instant::now() < deadline, "failure callback never fired");
            std::thread::sleep(Duration::from_millis(10));
        }

        let deadline = Instant::now() + Duration::from_secs(10);
        let stalled = em.frontier_epoch();
        while em.frontier_epoch() == stalled {
            assert!(Instant::now() < deadline, "frontier never resumed");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
