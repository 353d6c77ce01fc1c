//! Heap allocation over shelves.
//!
//! [`ZoneHeap`] is the buddy allocator laid out inside a single shelf;
//! [`EpochZoneHeap`] wraps it with epoch-delayed frees for memory shared
//! between processes. The bitmap and free-list primitives they share are
//! views over the mapped payload and carry no state of their own.

mod bitmap;
mod epoch_heap;
mod freelist;
mod zone;

pub use bitmap::MergeBitmap;
pub use epoch_heap::{EpochZoneHeap, RECLAIM_INTERVAL_US};
pub use freelist::FreeList;
pub use zone::{ZoneHeap, MAX_HEAP_SIZE, MIN_HEAP_SIZE, MIN_OBJ_SIZE, ZONE_MAGIC};
