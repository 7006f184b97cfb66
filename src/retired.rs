//! Records for deferred reclamation.
//!
//! A [`Retired`] owns a type-erased heap pointer together with the function
//! that reclaims it. Records are collected in per-epoch [`RetiredBag`]s and
//! dropped in bulk once their epoch can no longer be observed by any thread.
//!
//! Reclaiming a map node releases only the node itself; the value handle it
//! carried is owned by the caller and is never dereferenced or freed.

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec::Vec};

use core::fmt;
use core::ptr::NonNull;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Retired
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A type-erased pointer whose pointee is dropped and deallocated when the
/// record itself is dropped.
pub struct Retired {
    ptr: NonNull<()>,
    reclaim: unsafe fn(*mut ()),
}

// records may be drained by whichever thread owns (or tears down) the slot
// they were retired to; `new_unchecked` requires the pointee to tolerate that
unsafe impl Send for Retired {}

/********** impl inherent *************************************************************************/

impl Retired {
    /// Creates a record that drops and deallocates the `Box` behind `ptr`
    /// when it is itself dropped.
    ///
    /// # Safety
    ///
    /// `ptr` must stem from [`Box::into_raw`] and must not be freed through
    /// any other path. The pointee must be safe to drop on a thread other
    /// than the one retiring it.
    #[inline]
    pub unsafe fn new_unchecked<T>(ptr: NonNull<T>) -> Self {
        Self { ptr: ptr.cast(), reclaim: reclaim_boxed::<T> }
    }

    /// Returns the memory address of the retired record.
    #[inline]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for Retired {
    #[inline]
    fn drop(&mut self) {
        unsafe { (self.reclaim)(self.ptr.as_ptr()) };
    }
}

/********** impl Debug ****************************************************************************/

impl fmt::Debug for Retired {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Retired").field("address", &self.address()).finish()
    }
}

unsafe fn reclaim_boxed<T>(ptr: *mut ()) {
    drop(Box::from_raw(ptr as *mut T));
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// RetiredBag
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Collects the records retired while a particular epoch was current.
///
/// Each bag has exactly one writing thread, so pushes require no
/// synchronization; the bag is emptied wholesale when its epoch becomes
/// unobservable.
#[derive(Debug)]
pub struct RetiredBag {
    inner: Vec<Retired>,
}

/********** impl inherent *************************************************************************/

impl RetiredBag {
    /// Creates a new empty bag without allocating.
    #[inline]
    pub const fn new() -> Self {
        Self { inner: Vec::new() }
    }

    /// Appends `retired` to the bag.
    #[inline]
    pub fn push(&mut self, retired: Retired) {
        self.inner.push(retired);
    }

    /// Drops every record in the bag and returns how many were reclaimed.
    #[inline]
    pub fn reclaim_all(&mut self) -> usize {
        let reclaimed = self.inner.len();
        self.inner.clear();
        reclaimed
    }

    /// Returns `true` if no records are pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{Retired, RetiredBag};

    struct DropCount<'a>(&'a AtomicUsize);
    impl Drop for DropCount<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn retire_count(count: &AtomicUsize) -> Retired {
        let record = Box::leak(Box::new(DropCount(count)));
        unsafe { Retired::new_unchecked(NonNull::from(record)) }
    }

    #[test]
    fn drop_reclaims() {
        let count = AtomicUsize::new(0);
        let retired = retire_count(&count);
        assert_ne!(retired.address(), 0);
        drop(retired);
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn bag_reclaims_in_bulk() {
        let count = AtomicUsize::new(0);
        let mut bag = RetiredBag::new();
        assert!(bag.is_empty());

        for _ in 0..16 {
            bag.push(retire_count(&count));
        }
        assert_eq!(count.load(Ordering::Relaxed), 0);

        assert_eq!(bag.reclaim_all(), 16);
        assert_eq!(count.load(Ordering::Relaxed), 16);
        assert!(bag.is_empty());
    }
}
