//! Epoch-based reclamation across cooperating processes.
//!
//! Participants register in a shared on-shelf [`EpochVector`] and advance
//! a global *frontier* epoch together. A freed region may be reused only
//! once the frontier proves that every observer has left the epoch in
//! which the region was live; [`EpochManager`] drives the protocol for one
//! process and [`EpochOp`] marks the critical regions.

mod manager;
mod rwlock;
mod vector;

pub use manager::{
    EpochManager, EpochOp, FailureCallback, DEBUG_INTERVAL_US, HEARTBEAT_INTERVAL_US,
    MONITOR_INTERVAL_US,
};
pub use rwlock::{DistRwLock, WriteGuard};
pub use vector::{EpochVector, Participant, MAX_PARTICIPANTS, TIMEOUT_US, VECTOR_PAYLOAD_SIZE};
