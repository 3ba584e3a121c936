// Lock registry (component R, spec §4.3).
//
// Keyed by `LockId` the way this codebase's 2PL lock manager keys its
// `lock_table` by resource name, with a secondary owner index so the exit
// hook's `drain_by_owner` does not need a full scan.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::common::ProcessId;
use crate::error::{RotationError, RotationResult};

/// The two access modes a `rotation_lock` request can claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared access (`ROT_READ`).
    Read,
    /// Exclusive access (`ROT_WRITE`).
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "Read"),
            LockMode::Write => write!(f, "Write"),
        }
    }
}

/// Opaque, monotonically increasing identifier for a granted lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

impl LockId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    /// The underlying integer value, guaranteed non-negative by construction.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A granted, not-yet-released lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockEntry {
    pub id: LockId,
    pub owner: ProcessId,
    pub low: u16,
    pub high: u16,
    pub mode: LockMode,
}

/// The set of currently granted locks, keyed by [`LockId`].
///
/// Accessed only while the admission engine holds its manager-wide lock.
#[derive(Default)]
pub struct LockRegistry {
    entries: HashMap<LockId, LockEntry>,
    by_owner: HashMap<ProcessId, HashSet<LockId>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves capacity for one more entry owned by `owner`, surfacing
    /// allocation failure as `OutOfMemory` instead of aborting. Callers
    /// invoke this before mutating any other state on the grant path, so a
    /// failure here leaves the manager's counters untouched.
    pub fn try_reserve(&mut self, owner: ProcessId) -> RotationResult<()> {
        self.entries
            .try_reserve(1)
            .map_err(|_| RotationError::OutOfMemory)?;
        self.by_owner
            .try_reserve(1)
            .map_err(|_| RotationError::OutOfMemory)?;
        self.by_owner
            .entry(owner)
            .or_default()
            .try_reserve(1)
            .map_err(|_| RotationError::OutOfMemory)?;
        Ok(())
    }

    pub fn insert(&mut self, entry: LockEntry) {
        self.by_owner.entry(entry.owner).or_default().insert(entry.id);
        self.entries.insert(entry.id, entry);
    }

    /// Detaches and returns the entry for `id` if `requesting_owner` is its
    /// owner. `InvalidArgument` if no such id exists; `PermissionDenied` if
    /// the caller is not the owner.
    pub fn remove_by_id(
        &mut self,
        id: LockId,
        requesting_owner: ProcessId,
    ) -> RotationResult<LockEntry> {
        let entry = self
            .entries
            .get(&id)
            .copied()
            .ok_or_else(|| RotationError::InvalidArgument(format!("no such lock id {id}")))?;

        if entry.owner != requesting_owner {
            return Err(RotationError::PermissionDenied(format!(
                "lock {id} is owned by a different process"
            )));
        }

        self.entries.remove(&id);
        if let Some(owned) = self.by_owner.get_mut(&entry.owner) {
            owned.remove(&id);
            if owned.is_empty() {
                self.by_owner.remove(&entry.owner);
            }
        }
        Ok(entry)
    }

    /// Detaches and returns every entry owned by `owner`, for the exit hook.
    pub fn drain_by_owner(&mut self, owner: ProcessId) -> Vec<LockEntry> {
        let Some(ids) = self.by_owner.remove(&owner) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    pub fn get(&self, id: LockId) -> Option<&LockEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
