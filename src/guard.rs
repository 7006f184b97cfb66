//! RAII guard for epoch critical sections.

use core::ptr::NonNull;

use crate::epoch::Ebr;
use crate::retired::Retired;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Guard
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Keeps the calling thread inside an epoch critical section for its
/// lifetime.
///
/// A guard without a slot belongs to an unregistered caller: operations
/// still function, but retiring through it frees eagerly and the caller must
/// not retain references across later mutations.
#[derive(Debug)]
pub(crate) struct Guard<'a> {
    ebr: &'a Ebr,
    slot: Option<usize>,
}

/********** impl inherent *************************************************************************/

impl<'a> Guard<'a> {
    /// Enters a critical section on `slot`, if one is given.
    ///
    /// # Safety
    ///
    /// A `Some` slot must be owned by the calling thread.
    #[inline]
    pub unsafe fn enter(ebr: &'a Ebr, slot: Option<usize>) -> Self {
        if let Some(slot) = slot {
            ebr.enter(slot);
        }

        Self { ebr, slot }
    }

    /// Hands `ptr` to the reclamation engine, or frees it eagerly when the
    /// guard is unregistered.
    ///
    /// # Safety
    ///
    /// `ptr` must stem from `Box::into_raw` and must be unreachable for
    /// every thread entering a critical section after this call.
    #[inline]
    pub unsafe fn retire<T>(&self, ptr: NonNull<T>) {
        let retired = Retired::new_unchecked(ptr);
        match self.slot {
            Some(slot) => self.ebr.retire(slot, retired),
            None => drop(retired),
        }
    }
}

/********** impl Drop *****************************************************************************/

impl Drop for Guard<'_> {
    #[inline]
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            // the slot is owned by this thread for the guard's lifetime
            unsafe { self.ebr.exit(slot) };
        }
    }
}
