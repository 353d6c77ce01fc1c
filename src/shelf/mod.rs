//! Shelf management: backing files, regions, and the process-wide registry.
//!
//! A *shelf* is a named, byte-addressable persistent file acting as a
//! memory region. [`ShelfFile`] handles the raw file lifecycle,
//! [`ShelfRegion`] adds the verification header and payload addressing,
//! and [`ShelfManager`] keeps the per-process map between shelf ids and
//! local base addresses.

mod file;
mod manager;
mod region;

pub use file::ShelfFile;
pub use manager::{RegistryGuard, ShelfManager};
pub use region::{ShelfRegion, REGION_HEADER_SIZE, REGION_MAGIC, REGION_VERSION};
