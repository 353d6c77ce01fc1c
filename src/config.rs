//! Environment-driven configuration.
//!
//! Two environment variables control shelfheap:
//!
//! - `NVM_SHELF_BASE`: directory under which pool shelves and the epoch
//!   vector live. Defaults to `/tmp/shelfheap`.
//! - `NVMM_DEBUG_LEVEL`: integer verbosity for the epoch monitor's periodic
//!   report. Defaults to 0 (silent).

use crate::ptr::ShelfId;
use std::path::PathBuf;

/// Environment variable naming the shelf root directory.
pub const SHELF_BASE_ENV: &str = "NVM_SHELF_BASE";

/// Environment variable holding the debug verbosity.
pub const DEBUG_LEVEL_ENV: &str = "NVMM_DEBUG_LEVEL";

/// Default shelf root when `NVM_SHELF_BASE` is unset.
pub const DEFAULT_SHELF_BASE: &str = "/tmp/shelfheap";

/// Pathname of the epoch-vector shelf, relative to the shelf base.
pub const EPOCH_VECTOR_SHELF: &str = "NVM_EPOCH_VECTOR";

/// Directory root for shelves.
pub fn shelf_base() -> PathBuf {
    std::env::var_os(SHELF_BASE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SHELF_BASE))
}

/// Pathname of the shelf backing `shelf_id`: `<base>/<pool>_<index>`.
pub fn shelf_path(shelf_id: ShelfId) -> PathBuf {
    shelf_base().join(format!("{}", shelf_id))
}

/// Pathname of the epoch-vector shelf.
pub fn epoch_vector_path() -> PathBuf {
    shelf_base().join(EPOCH_VECTOR_SHELF)
}

/// Debug verbosity from `NVMM_DEBUG_LEVEL`; 0 when unset or unparsable.
pub fn debug_level() -> i32 {
    std::env::var(DEBUG_LEVEL_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptr::ShelfId;

    #[test]
    fn test_shelf_path_form() {
        let path = shelf_path(ShelfId::new(3, 7));
        assert!(path.ends_with("3_7"));
    }

    #[test]
    fn test_epoch_vector_path_form() {
        assert!(epoch_vector_path().ends_with(EPOCH_VECTOR_SHELF));
    }
}
