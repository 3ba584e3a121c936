// Orientation state (component O, spec §4.1).
//
// A single mutable scalar guarded by its own lock, independent of the
// admission engine's manager-wide lock `M`. `RotationLockManager` acquires
// this lock and `M` together, always in the order `orientation -> M`, when
// a request needs to read the orientation consistently with the counters.

use parking_lot::{Mutex, MutexGuard};

use crate::common::is_valid_degree;
use crate::error::{RotationError, RotationResult};

/// The current device/world orientation, a scalar in `[0, 360)`.
pub struct OrientationState {
    degree: Mutex<u16>,
}

impl OrientationState {
    pub fn new() -> Self {
        Self {
            degree: Mutex::new(0),
        }
    }

    /// Replaces the orientation scalar.
    ///
    /// Returns `InvalidArgument` if `degree` is not `0 <= degree < 360`.
    /// Does not itself wake any waiters; the caller (the manager) is
    /// responsible for broadcasting the wake after this returns, so that
    /// the wake happens without `orientation`'s lock held.
    pub fn set(&self, degree: u16) -> RotationResult<()> {
        if !is_valid_degree(degree) {
            return Err(RotationError::InvalidArgument(format!(
                "degree {degree} is outside 0..360"
            )));
        }
        *self.degree.lock() = degree;
        Ok(())
    }

    /// Returns the current orientation value.
    pub fn read(&self) -> u16 {
        *self.degree.lock()
    }

    /// Acquires the orientation lock and returns a guard over the current
    /// value. Used by the admission engine to pair the orientation read
    /// with acquiring `M`, per the `orientation -> M` lock ordering rule:
    /// the guard must be taken, and dropped, outside of `M`'s guard scope.
    pub(crate) fn lock(&self) -> MutexGuard<'_, u16> {
        self.degree.lock()
    }
}

impl Default for OrientationState {
    fn default() -> Self {
        Self::new()
    }
}
