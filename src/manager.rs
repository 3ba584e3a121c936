// Admission engine (component A) and exit hook (component X), spec §4.4.
//
// Structured the way this codebase's `LockManager` pairs a `parking_lot`
// `Mutex` with a `Condvar` for blocking lock waits, generalized here to a
// per-degree range predicate instead of a single named resource.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::common::{is_valid_degree, ProcessId};
use crate::counters::DegreeCounters;
use crate::error::{RotationError, RotationResult};
use crate::orientation::OrientationState;
use crate::registry::{LockEntry, LockId, LockMode, LockRegistry};

/// A handle a caller can use to interrupt its own blocked [`RotationLockManager::rotation_lock_cancellable`]
/// call from another thread.
///
/// This is the userspace analogue of the original syscall's POSIX-signal
/// based cancellation (spec §5): there is no signal delivery mechanism in
/// a library, so callers that need to bound how long they wait hand a
/// `CancelToken` to the blocked call and flip it from elsewhere (a timer
/// thread, a request-cancellation handler, ...).
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn mark_cancelled(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// A suspended request, tracked so the exit hook can find and cancel the
/// waiters belonging to a terminating owner (spec §4.4.5). Lives only in
/// `ManagerState::waiters` while its thread is parked in the admission loop.
struct WaitSlot {
    owner: ProcessId,
    mode: LockMode,
    low: u16,
    high: u16,
    writer_registered: bool,
    cancelled: bool,
}

/// Everything mutated only while holding the admission engine's
/// manager-wide lock `M`.
struct ManagerState {
    counters: DegreeCounters,
    registry: LockRegistry,
    waiters: HashMap<u64, WaitSlot>,
    next_lock_id: u64,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            counters: DegreeCounters::new(),
            registry: LockRegistry::new(),
            waiters: HashMap::new(),
            next_lock_id: 0,
        }
    }

    fn mint_lock_id(&mut self) -> LockId {
        let id = self.next_lock_id;
        self.next_lock_id += 1;
        LockId::new(id)
    }
}

/// The orientation-gated range reader-writer lock manager.
///
/// One value of this type is created per host (spec §9: "constructor-owned
/// manager struct" rather than module-level statics). All three public
/// operations, plus the exit hook, are methods on this value and are safe
/// to call concurrently from any number of threads.
pub struct RotationLockManager {
    orientation: OrientationState,
    state: Mutex<ManagerState>,
    condvar: Condvar,
    next_waiter_id: AtomicU64,
}

impl RotationLockManager {
    pub fn new() -> Self {
        Self {
            orientation: OrientationState::new(),
            state: Mutex::new(ManagerState::new()),
            condvar: Condvar::new(),
            next_waiter_id: AtomicU64::new(0),
        }
    }

    /// Replaces the current orientation (spec §4.1).
    ///
    /// On success, broadcast-wakes every suspended `rotation_lock` call so
    /// it can re-test admission; no specific waiter is guaranteed to be
    /// admitted by this call alone.
    pub fn set_orientation(&self, degree: u16) -> RotationResult<()> {
        self.orientation.set(degree)?;
        // Take M before notifying: a waiter that already saw the old
        // orientation and failed admission still holds M until it parks in
        // `condvar.wait`, which atomically releases M. Acquiring M here
        // blocks until that happens, so the notify can never land in the
        // gap between the waiter's failed re-check and its call to `wait`
        // (a lost wakeup, not just a delayed one).
        let _state = self.state.lock();
        trace!(degree, "orientation updated, broadcasting wake");
        self.condvar.notify_all();
        Ok(())
    }

    /// Returns the current orientation value.
    pub fn read_orientation(&self) -> u16 {
        self.orientation.read()
    }

    /// Claims read or write access over `[low, high]`, blocking the caller
    /// until the admission predicate (spec §4.4.1) holds.
    ///
    /// Equivalent to `rotation_lock_cancellable` with no [`CancelToken`].
    pub fn rotation_lock(&self, owner: ProcessId, low: u16, high: u16, mode: LockMode) -> RotationResult<LockId> {
        self.rotation_lock_cancellable(owner, low, high, mode, None)
    }

    /// Claims read or write access over `[low, high]`, blocking the caller
    /// until admission succeeds or `cancel` is flipped via
    /// [`RotationLockManager::cancel`].
    pub fn rotation_lock_cancellable(
        &self,
        owner: ProcessId,
        low: u16,
        high: u16,
        mode: LockMode,
        cancel: Option<&CancelToken>,
    ) -> RotationResult<LockId> {
        if !is_valid_degree(low) || !is_valid_degree(high) {
            return Err(RotationError::InvalidArgument(format!(
                "low={low}, high={high} must both be in 0..360"
            )));
        }

        let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let mut writer_registered = false;

        loop {
            // Lock ordering: orientation -> M. `orientation_guard` is
            // declared before `state`, so it is dropped after `state` is
            // dropped (Rust drops locals in reverse declaration order),
            // matching "release in reverse" from spec §5.
            let orientation_guard = self.orientation.lock();
            let mut state = self.state.lock();
            let orientation = *orientation_guard;

            let slot_cancelled = state.waiters.get(&waiter_id).is_some_and(|s| s.cancelled);
            if slot_cancelled || cancel.is_some_and(CancelToken::is_cancelled) {
                // The exit hook may already have rolled back this waiter's
                // `waiting_writers` contribution when it cancelled the slot
                // (spec §4.4.5); only the slot's own flag is authoritative
                // here, never the caller-local `writer_registered`.
                let still_registered = state
                    .waiters
                    .get(&waiter_id)
                    .map(|s| s.writer_registered)
                    .unwrap_or(writer_registered);
                if still_registered {
                    state.counters.adjust_waiting_writers(low, high, -1);
                }
                state.waiters.remove(&waiter_id);
                return Err(RotationError::Interrupted);
            }

            if state.counters.can_admit(orientation, low, high, mode) {
                // Reserve before mutating anything: a failure here leaves
                // the grant path all-or-nothing, per §7's transactional
                // guarantee.
                state.registry.try_reserve(owner)?;

                if writer_registered {
                    state.counters.adjust_waiting_writers(low, high, -1);
                }
                state.counters.adjust_active(low, high, mode, 1);

                let id = state.mint_lock_id();
                state.registry.insert(LockEntry {
                    id,
                    owner,
                    low,
                    high,
                    mode,
                });
                state.waiters.remove(&waiter_id);

                debug!(owner, low, high, %mode, %id, "lock granted");
                return Ok(id);
            }

            trace!(owner, low, high, %mode, "admission predicate failed, queueing");

            state
                .waiters
                .try_reserve(1)
                .map_err(|_| RotationError::OutOfMemory)?;

            if mode == LockMode::Write && !writer_registered {
                state.counters.adjust_waiting_writers(low, high, 1);
                writer_registered = true;
            }
            state.waiters.insert(
                waiter_id,
                WaitSlot {
                    owner,
                    mode,
                    low,
                    high,
                    writer_registered,
                    cancelled: false,
                },
            );

            drop(orientation_guard);
            self.condvar.wait(&mut state);
        }
    }

    /// Flips `token` and wakes every suspended caller so the one holding
    /// `token` observes the cancellation on its next re-test.
    pub fn cancel(&self, token: &CancelToken) {
        token.mark_cancelled();
        // Same reasoning as `set_orientation`: serialize the notify against
        // M so it cannot land before a racing waiter reaches `condvar.wait`.
        let _state = self.state.lock();
        self.condvar.notify_all();
    }

    /// Releases the lock identified by `id`, owned by `owner` (spec §4.4.4).
    pub fn rotation_unlock(&self, owner: ProcessId, id: LockId) -> RotationResult<()> {
        {
            let mut state = self.state.lock();
            let entry = state.registry.remove_by_id(id, owner)?;
            state.counters.adjust_active(entry.low, entry.high, entry.mode, -1);
            debug!(owner, %id, "lock released");
        }
        self.condvar.notify_all();
        Ok(())
    }

    /// Releases every lock owned by `owner` and cancels its pending
    /// requests (spec §4.4.5). Called by the host when a task terminates.
    /// Cannot fail.
    pub fn on_process_exit(&self, owner: ProcessId) {
        let drained = {
            let mut state = self.state.lock();
            let drained = state.registry.drain_by_owner(owner);
            for entry in &drained {
                state
                    .counters
                    .adjust_active(entry.low, entry.high, entry.mode, -1);
            }

            let state = &mut *state;
            for slot in state.waiters.values_mut() {
                if slot.owner == owner && !slot.cancelled {
                    if slot.writer_registered {
                        state
                            .counters
                            .adjust_waiting_writers(slot.low, slot.high, -1);
                        slot.writer_registered = false;
                    }
                    slot.cancelled = true;
                }
            }
            drained
        };

        if !drained.is_empty() {
            warn!(owner, released = drained.len() as u64, "process exited holding locks");
        }
        self.condvar.notify_all();
    }

    /// Number of currently granted locks. Diagnostic / test helper.
    pub fn granted_lock_count(&self) -> usize {
        self.state.lock().registry.len()
    }
}

impl Default for RotationLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn simple_read_grant_and_unlock() {
        let m = RotationLockManager::new();
        m.set_orientation(45).unwrap();

        let id = m.rotation_lock(1, 0, 90, LockMode::Read).unwrap();
        for d in 0..=90u16 {
            assert_eq!(1, m.state.lock().counters.get(d).active_readers);
        }
        assert!(m.rotation_unlock(1, id).is_ok());
        assert_eq!(0, m.state.lock().counters.get(0).active_readers);
    }

    #[test]
    fn unlock_unknown_id_is_invalid_argument() {
        let m = RotationLockManager::new();
        assert_eq!(
            m.rotation_unlock(1, LockId::new(999)),
            Err(RotationError::InvalidArgument(
                "no such lock id 999".to_string()
            ))
        );
    }

    #[test]
    fn non_owner_cannot_unlock() {
        let m = RotationLockManager::new();
        m.set_orientation(0).unwrap();
        let id = m.rotation_lock(1, 0, 10, LockMode::Read).unwrap();

        assert_eq!(
            m.rotation_unlock(2, id),
            Err(RotationError::PermissionDenied(
                format!("lock {id} is owned by a different process")
            ))
        );
        assert!(m.rotation_unlock(1, id).is_ok());
    }

    #[test]
    fn out_of_range_arguments_are_rejected() {
        let m = RotationLockManager::new();
        assert!(matches!(
            m.rotation_lock(1, 0, 360, LockMode::Read),
            Err(RotationError::InvalidArgument(_))
        ));
    }

    #[test]
    fn orientation_change_wakes_blocked_reader() {
        let m = Arc::new(RotationLockManager::new());
        m.set_orientation(200).unwrap();

        let blocked = Arc::clone(&m);
        let handle = thread::spawn(move || blocked.rotation_lock(1, 0, 90, LockMode::Read));

        thread::sleep(Duration::from_millis(50));
        m.set_orientation(30).unwrap();

        let id = handle.join().unwrap().unwrap();
        assert!(m.rotation_unlock(1, id).is_ok());
    }

    #[test]
    fn writer_preference_blocks_new_readers() {
        let m = Arc::new(RotationLockManager::new());
        m.set_orientation(0).unwrap();

        let reader_id = m.rotation_lock(1, 0, 10, LockMode::Read).unwrap();

        let writer_mgr = Arc::clone(&m);
        let writer_handle =
            thread::spawn(move || writer_mgr.rotation_lock(2, 0, 10, LockMode::Write));
        thread::sleep(Duration::from_millis(50));

        let reader2_mgr = Arc::clone(&m);
        let reader2_handle =
            thread::spawn(move || reader2_mgr.rotation_lock(3, 5, 7, LockMode::Read));
        thread::sleep(Duration::from_millis(50));

        assert!(!writer_handle.is_finished());
        assert!(!reader2_handle.is_finished());

        m.rotation_unlock(1, reader_id).unwrap();

        let writer_id = writer_handle.join().unwrap().unwrap();
        m.rotation_unlock(2, writer_id).unwrap();

        let reader2_id = reader2_handle.join().unwrap().unwrap();
        m.rotation_unlock(3, reader2_id).unwrap();
    }

    #[test]
    fn wraparound_range_is_admitted() {
        let m = RotationLockManager::new();
        m.set_orientation(355).unwrap();
        let id = m.rotation_lock(1, 350, 10, LockMode::Read).unwrap();
        assert!(m.rotation_unlock(1, id).is_ok());
    }

    #[test]
    fn exit_hook_releases_held_locks_and_cancels_waiters() {
        let m = Arc::new(RotationLockManager::new());
        m.set_orientation(0).unwrap();

        let held_id = m.rotation_lock(1, 0, 10, LockMode::Read).unwrap();

        let blocked_mgr = Arc::clone(&m);
        let blocked = thread::spawn(move || {
            blocked_mgr.rotation_lock(1, 0, 10, LockMode::Write)
        });
        thread::sleep(Duration::from_millis(50));

        m.on_process_exit(1);

        let result = blocked.join().unwrap();
        assert_eq!(result, Err(RotationError::Interrupted));
        assert_eq!(m.granted_lock_count(), 0);
        assert_eq!(m.state.lock().counters.get(0).waiting_writers, 0);
        let _ = held_id;
    }

    #[test]
    fn cancel_token_interrupts_blocked_caller() {
        let m = Arc::new(RotationLockManager::new());
        m.set_orientation(200).unwrap();

        let token = CancelToken::new();
        let token_clone = token.clone();
        let blocked_mgr = Arc::clone(&m);
        let handle = thread::spawn(move || {
            blocked_mgr.rotation_lock_cancellable(1, 0, 10, LockMode::Read, Some(&token_clone))
        });

        thread::sleep(Duration::from_millis(50));
        m.cancel(&token);

        assert_eq!(handle.join().unwrap(), Err(RotationError::Interrupted));
    }

    /// Randomized concurrent workload checking the quantified properties of
    /// spec §8 rather than a single literal scenario: P1 (compatibility),
    /// P6 (id uniqueness), and — once everything has drained — P2 (counter
    /// accuracy against the registry) and P7 (no leak on exit).
    #[test]
    fn randomized_workload_upholds_p1_p2_p6_p7() {
        use std::collections::HashSet;

        let m = Arc::new(RotationLockManager::new());
        m.set_orientation(0).unwrap();

        let seen_ids = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = Vec::new();

        for owner in 0..6u64 {
            let m = Arc::clone(&m);
            let seen_ids = Arc::clone(&seen_ids);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let low = rand::random::<u16>() % 360;
                    let span = rand::random::<u16>() % 30;
                    let high = (low + span) % 360;
                    let mode = if rand::random::<bool>() {
                        LockMode::Read
                    } else {
                        LockMode::Write
                    };

                    let id = match m.rotation_lock(owner, low, high, mode) {
                        Ok(id) => id,
                        Err(_) => continue,
                    };

                    assert!(
                        seen_ids.lock().insert(id),
                        "P6 violated: duplicate lock id {id}"
                    );

                    // P1: compatibility must hold at every degree while
                    // this lock (and whatever else is concurrently held)
                    // is live.
                    {
                        let state = m.state.lock();
                        for d in 0..crate::common::DEGREE_COUNT {
                            let c = state.counters.get(d);
                            assert!(
                                c.active_writers <= 1,
                                "P1 violated: active_writers[{d}] = {}",
                                c.active_writers
                            );
                            assert!(
                                c.active_writers == 0 || c.active_readers == 0,
                                "P1 violated: reader/writer overlap at degree {d}"
                            );
                        }
                    }

                    m.rotation_unlock(owner, id).unwrap();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        // P2: with every lock released, the counters and the registry
        // agree there is nothing outstanding.
        assert_eq!(m.granted_lock_count(), 0);
        {
            let state = m.state.lock();
            assert_eq!(state.counters.total_active(LockMode::Read), 0);
            assert_eq!(state.counters.total_active(LockMode::Write), 0);
        }

        // P7: the exit hook leaves no registry entry for the owner and
        // rolls back its counter contribution.
        let held = m.rotation_lock(99, 0, 10, LockMode::Write).unwrap();
        m.on_process_exit(99);
        assert_eq!(m.granted_lock_count(), 0);
        {
            let state = m.state.lock();
            for d in 0..=10u16 {
                assert_eq!(state.counters.get(d).active_writers, 0);
            }
        }
        let _ = held;
    }
}
