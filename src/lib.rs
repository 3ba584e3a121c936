// rotation-lock: an orientation-gated range reader-writer lock manager.
//
// Coordinates access to the circular degree space `0..360` among readers
// and writers whose eligibility depends on both a shared orientation
// scalar and classic reader/writer exclusion over their requested degree
// range. See `RotationLockManager` for the primary entry point.
//
// ```
// use rotation_lock::{LockMode, RotationLockManager};
//
// let manager = RotationLockManager::new();
// manager.set_orientation(45).unwrap();
//
// let id = manager.rotation_lock(/* owner */ 1, 0, 90, LockMode::Read).unwrap();
// manager.rotation_unlock(1, id).unwrap();
// ```

pub mod common;
pub mod counters;
pub mod error;
pub mod manager;
pub mod orientation;
pub mod registry;

pub use common::ProcessId;
pub use error::{RotationError, RotationResult};
pub use manager::{CancelToken, RotationLockManager};
pub use registry::{LockEntry, LockId, LockMode};
