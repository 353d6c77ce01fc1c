//! # shelfheap
//!
//! Heap-style allocation over persistent, byte-addressable memory
//! organized as named files ("shelves"). Allocations come back as
//! [`GlobalPtr`]s that stay valid across process restarts and across
//! cooperating processes that map the same shelf at different local
//! addresses.
//!
//! Three subsystems cooperate:
//!
//! - **shelf**: backing-file lifecycle, whole-file mapping, and the
//!   per-process registry translating between local pointers and shelf
//!   offsets.
//! - **heap**: a crash-consistent buddy allocator laid out inside one
//!   shelf, with lock-free per-level free lists and an offline/online
//!   coalescing pass.
//! - **epoch**: a distributed epoch protocol so that memory freed by one
//!   process is reused only after every observer has provably moved on.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use shelfheap::prelude::*;
//! use std::sync::Arc;
//!
//! let manager = Arc::new(ShelfManager::new());
//! ZoneHeap::create("/dev/shm/pool/1_1", 128 << 20)?;
//! let heap = ZoneHeap::open("/dev/shm/pool/1_1", ShelfId::new(1, 1), manager)?;
//!
//! let ptr = heap.alloc(256);
//! assert!(ptr.is_valid());
//! heap.free(ptr);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod epoch;
pub mod error;
pub mod heap;
pub mod ptr;
pub mod shelf;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::epoch::{EpochManager, EpochOp};
    pub use crate::error::{Error, Result};
    pub use crate::heap::{EpochZoneHeap, ZoneHeap};
    pub use crate::ptr::{GlobalPtr, PoolId, ShelfId, ShelfIndex};
    pub use crate::shelf::{ShelfFile, ShelfManager, ShelfRegion};
}

pub use error::{Error, Result};
pub use ptr::{GlobalPtr, ShelfId};
