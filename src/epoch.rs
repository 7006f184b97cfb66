//! Epoch-based memory reclamation.
//!
//! The engine tracks a monotonically increasing global epoch and, per
//! registered thread, the epoch that thread last observed when entering a
//! critical section. A record unlinked during epoch `e` is retired into bin
//! `e % 3` of the retiring thread's slot. The global epoch may only advance
//! once every registered thread is either quiescent or has caught up with
//! it; after two advances no thread can still hold a reference obtained
//! during `e`, so the bin may be emptied.
//!
//! Retire bins are strictly single-writer: a thread only ever pushes to and
//! drains the bins of its own slot. The slot-claim CAS in
//! [`register`](Ebr::register) is the engine's only inter-thread
//! coordination point.

#[cfg(feature = "std")]
use std::error;

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};

use crate::retired::{Retired, RetiredBag};

/// The maximum number of concurrently registered threads.
pub const MAX_THREADS: usize = 64;

/// The number of rotating retire bins.
///
/// Two successful epoch advances prove quiescence, so three bins suffice and
/// the scheme relies on exactly three.
pub const EPOCH_COUNT: usize = 3;

/// The epoch published by threads outside any critical section.
const QUIESCENT: u64 = u64::MAX;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Ebr
////////////////////////////////////////////////////////////////////////////////////////////////////

/// An epoch-based reclamation engine with a fixed table of thread slots.
pub struct Ebr {
    global_epoch: AtomicU64,
    threads: [ThreadState; MAX_THREADS],
}

/********** impl inherent *************************************************************************/

impl Ebr {
    /// Creates a new engine with no registered threads.
    #[inline]
    pub const fn new() -> Self {
        const INIT: ThreadState = ThreadState::new();
        Self { global_epoch: AtomicU64::new(0), threads: [INIT; MAX_THREADS] }
    }

    /// Claims a free thread slot and publishes the current global epoch as
    /// the slot's observed epoch.
    ///
    /// # Errors
    ///
    /// Fails when all [`MAX_THREADS`] slots are claimed.
    #[inline]
    pub fn register(&self) -> Result<usize, RegisterError> {
        for (slot, thread) in self.threads.iter().enumerate() {
            if thread.active.compare_exchange(false, true, AcqRel, Relaxed).is_ok() {
                thread.epoch.store(self.global_epoch.load(Acquire), Release);
                return Ok(slot);
            }
        }

        Err(RegisterError)
    }

    /// Drains all three retire bins of `slot` and releases the slot.
    ///
    /// # Safety
    ///
    /// `slot` must have been returned by [`register`](Ebr::register) and must
    /// not be used concurrently or after this call.
    pub unsafe fn unregister(&self, slot: usize) {
        if slot >= MAX_THREADS {
            return;
        }

        // only this thread ever wrote the bins, draining needs no sync
        for bag in &self.threads[slot].bags {
            (*bag.get()).reclaim_all();
        }

        self.threads[slot].active.store(false, Release);
    }

    /// Enters a critical section and returns the observed epoch.
    ///
    /// Publishing the observed epoch keeps every record that is reachable at
    /// that epoch alive until this thread exits or re-enters. Entering also
    /// attempts to advance the global epoch and opportunistically empties the
    /// slot's bin that has become unobservable.
    ///
    /// # Safety
    ///
    /// `slot` must be owned by the calling thread, see
    /// [`register`](Ebr::register).
    pub unsafe fn enter(&self, slot: usize) -> u64 {
        if slot >= MAX_THREADS {
            return QUIESCENT;
        }

        let observed = self.global_epoch.load(Acquire);
        self.threads[slot].epoch.store(observed, Release);

        self.try_advance(slot);

        // the bin filled two epochs ago can no longer be observed
        if observed >= 2 {
            let safe = ((observed - 2) % EPOCH_COUNT as u64) as usize;
            let bag = &mut *self.threads[slot].bags[safe].get();
            if !bag.is_empty() {
                bag.reclaim_all();
            }
        }

        observed
    }

    /// Exits the critical section by publishing the quiescent sentinel.
    ///
    /// # Safety
    ///
    /// `slot` must be owned by the calling thread.
    #[inline]
    pub unsafe fn exit(&self, slot: usize) {
        if slot >= MAX_THREADS {
            return;
        }

        self.threads[slot].epoch.store(QUIESCENT, Release);
    }

    /// Defers reclamation of `retired` until two further epoch advances.
    ///
    /// An out-of-range `slot` drops (and thereby frees) the record right
    /// away: without a claimed slot there is no bin whose emptying can be
    /// proven safe, so the eager free trades safety under concurrent readers
    /// against not leaking.
    ///
    /// # Safety
    ///
    /// `slot` must be owned by the calling thread.
    pub unsafe fn retire(&self, slot: usize, retired: Retired) {
        if slot >= MAX_THREADS {
            return;
        }

        let bin = (self.global_epoch.load(Acquire) % EPOCH_COUNT as u64) as usize;
        (*self.threads[slot].bags[bin].get()).push(retired);
    }

    /// Attempts to advance the global epoch by one.
    ///
    /// The advance succeeds only if every registered thread is quiescent or
    /// has observed the current epoch. On success the calling slot's bin
    /// filled two epochs before the new epoch is emptied; other threads empty
    /// theirs on their next [`enter`](Ebr::enter).
    ///
    /// # Safety
    ///
    /// `slot` must be owned by the calling thread.
    pub unsafe fn try_advance(&self, slot: usize) {
        let global = self.global_epoch.load(Acquire);
        for thread in &self.threads {
            if !thread.active.load(Acquire) {
                continue;
            }

            let epoch = thread.epoch.load(Acquire);
            if epoch != QUIESCENT && epoch < global {
                return;
            }
        }

        let advanced =
            self.global_epoch.compare_exchange(global, global + 1, AcqRel, Acquire).is_ok();
        if advanced && global >= 1 && slot < MAX_THREADS {
            let safe = ((global - 1) % EPOCH_COUNT as u64) as usize;
            (*self.threads[slot].bags[safe].get()).reclaim_all();
        }
    }
}

/********** impl Default **************************************************************************/

impl Default for Ebr {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for Ebr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Ebr").field("global_epoch", &self.global_epoch.load(Relaxed)).finish()
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for Ebr {
    #[inline]
    fn drop(&mut self) {
        for thread in &mut self.threads {
            for bag in &mut thread.bags {
                bag.get_mut().reclaim_all();
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ThreadState
////////////////////////////////////////////////////////////////////////////////////////////////////

/// One slot of the per-thread record table.
struct ThreadState {
    active: AtomicBool,
    epoch: AtomicU64,
    bags: [UnsafeCell<RetiredBag>; EPOCH_COUNT],
}

// the bags are only accessed by the thread owning the slot (claimed through
// the `active` CAS) or with exclusive access to the whole engine
unsafe impl Sync for ThreadState {}

/********** impl inherent *************************************************************************/

impl ThreadState {
    const fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            bags: [
                UnsafeCell::new(RetiredBag::new()),
                UnsafeCell::new(RetiredBag::new()),
                UnsafeCell::new(RetiredBag::new()),
            ],
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RegisterError
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Error type returned when all thread slots are already claimed.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct RegisterError;

/********** impl Display **************************************************************************/

impl fmt::Display for RegisterError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "all {} thread slots are already claimed", MAX_THREADS)
    }
}

#[cfg(feature = "std")]
impl error::Error for RegisterError {}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    use matches::assert_matches;

    use crate::retired::Retired;

    use super::{Ebr, RegisterError, MAX_THREADS};

    struct DropCount(Arc<AtomicUsize>);
    impl Drop for DropCount {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn retire_count(ebr: &Ebr, slot: usize, count: &Arc<AtomicUsize>) {
        let record = Box::leak(Box::new(DropCount(Arc::clone(count))));
        unsafe { ebr.retire(slot, Retired::new_unchecked(NonNull::from(record))) };
    }

    #[test]
    fn register_exhaustion() {
        let ebr = Ebr::new();

        let slots: Vec<_> = (0..MAX_THREADS).map(|_| ebr.register().unwrap()).collect();
        assert_eq!(slots, (0..MAX_THREADS).collect::<Vec<_>>());
        assert_matches!(ebr.register(), Err(RegisterError));

        // releasing a slot makes it claimable again
        unsafe { ebr.unregister(7) };
        assert_eq!(ebr.register(), Ok(7));
    }

    #[test]
    fn retire_and_advance() {
        let count = Arc::new(AtomicUsize::new(0));
        let ebr = Ebr::new();
        let slot = ebr.register().unwrap();

        unsafe {
            ebr.enter(slot);
            for _ in 0..10 {
                retire_count(&ebr, slot, &count);
            }
            ebr.exit(slot);
        }
        assert_eq!(count.load(Ordering::Relaxed), 0);

        for _ in 0..5 {
            unsafe {
                ebr.enter(slot);
                ebr.exit(slot);
            }
        }
        assert_eq!(count.load(Ordering::Relaxed), 10);

        unsafe { ebr.unregister(slot) };
    }

    #[test]
    fn unregister_drains_pending_bins() {
        let count = Arc::new(AtomicUsize::new(0));
        let ebr = Ebr::new();
        let slot = ebr.register().unwrap();

        unsafe {
            ebr.enter(slot);
            retire_count(&ebr, slot, &count);
            ebr.exit(slot);
            ebr.unregister(slot);
        }
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drop_drains_pending_bins() {
        let count = Arc::new(AtomicUsize::new(0));
        let ebr = Ebr::new();
        let slot = ebr.register().unwrap();

        unsafe {
            ebr.enter(slot);
            retire_count(&ebr, slot, &count);
            ebr.exit(slot);
        }

        drop(ebr);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reader_blocks_reclamation() {
        let count = Arc::new(AtomicUsize::new(0));
        let ebr = Ebr::new();
        let reader = ebr.register().unwrap();
        let writer = ebr.register().unwrap();

        unsafe {
            ebr.enter(reader);

            ebr.enter(writer);
            retire_count(&ebr, writer, &count);
            ebr.exit(writer);

            // the pinned reader keeps the epoch from advancing far enough
            for _ in 0..8 {
                ebr.enter(writer);
                ebr.exit(writer);
            }
            assert_eq!(count.load(Ordering::Relaxed), 0);

            ebr.exit(reader);

            // two further advances after the reader left make the record
            // unobservable
            ebr.enter(writer);
            ebr.exit(writer);
            assert_eq!(count.load(Ordering::Relaxed), 0);
            ebr.enter(writer);
            ebr.exit(writer);
            assert_eq!(count.load(Ordering::Relaxed), 1);

            ebr.unregister(reader);
            ebr.unregister(writer);
        }
    }

    #[test]
    fn concurrent_retire_churn() {
        const THREADS: usize = 4;
        const RETIRES: usize = 1_000;

        let count = Arc::new(AtomicUsize::new(0));
        let ebr = Arc::new(Ebr::new());

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let count = Arc::clone(&count);
                let ebr = Arc::clone(&ebr);
                thread::spawn(move || {
                    let slot = ebr.register().unwrap();
                    for _ in 0..RETIRES {
                        unsafe {
                            ebr.enter(slot);
                            retire_count(&ebr, slot, &count);
                            ebr.exit(slot);
                        }
                    }
                    unsafe { ebr.unregister(slot) };
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(count.load(Ordering::Relaxed), THREADS * RETIRES);
    }
}
