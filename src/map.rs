//! The concurrent hash map tying buckets, list and reclamation together.
//!
//! Buckets are shortcut pointers into the single split-ordered list. A
//! bucket is materialized on first use by inserting its sentinel at the
//! position given by the bit-reversed bucket index, so doubling the bucket
//! array never rehashes or moves an entry: the new buckets simply fill in
//! lazily.

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, vec::Vec};

#[cfg(feature = "std")]
use core::cell::Cell;
use core::fmt;
use core::ptr::{self, NonNull};
use core::sync::atomic::{
    AtomicPtr, AtomicUsize,
    Ordering::{AcqRel, Acquire, Relaxed, Release},
};

use crate::config::{Config, ConfigBuilder};
use crate::epoch::Ebr;
#[cfg(feature = "std")]
use crate::epoch::RegisterError;
use crate::guard::Guard;
use crate::list::{self, Insert, Node};
use crate::order;
use crate::sanitize;

#[cfg(feature = "std")]
std::thread_local! {
    /// The slot bound by `register_thread`, keyed by map identity.
    static BOUND_SLOT: Cell<Option<BoundSlot>> = Cell::new(None);
}

#[cfg(feature = "std")]
#[derive(Copy, Clone)]
struct BoundSlot {
    map: usize,
    slot: usize,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// Map
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A lock-free concurrent hash map from non-zero 64-bit keys to caller-owned
/// value handles.
///
/// The map stores and returns raw [`NonNull`] handles but never
/// dereferences, clones or frees them; their lifetime is entirely the
/// caller's concern. Key 0 is reserved for the internal sentinels and is
/// rejected by every operation.
///
/// Threads should claim a reclamation slot with
/// [`register_thread`](Map::register_thread) before operating on the map.
/// Unregistered threads still function, but memory unlinked on their behalf
/// is freed eagerly, so they must not hold returned references across later
/// mutations.
pub struct Map<V> {
    buckets: AtomicPtr<BucketArray<V>>,
    capacity: AtomicUsize,
    count: AtomicUsize,
    head: Box<Node<V>>,
    config: Config,
    epoch: Ebr,
}

// the map hands out raw value handles but never dereferences them itself
unsafe impl<V: Send + Sync> Send for Map<V> {}
unsafe impl<V: Send + Sync> Sync for Map<V> {}

/********** impl inherent *************************************************************************/

impl<V> Map<V> {
    /// Creates an empty map with the default configuration.
    #[inline]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an empty map with `capacity` initial buckets (must be a power
    /// of two).
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_config(ConfigBuilder::new().init_capacity(capacity).build())
    }

    /// Creates an empty map configured by `config`.
    pub fn with_config(config: Config) -> Self {
        let head = Node::head();
        let buckets = BucketArray::alloc(config.init_capacity());
        // bucket 0 is the head itself and is never lazily materialized
        unsafe {
            (*buckets).slot(0).store(&*head as *const Node<V> as *mut Node<V>, Release);
        }

        Self {
            buckets: AtomicPtr::new(buckets),
            capacity: AtomicUsize::new(config.init_capacity()),
            count: AtomicUsize::new(0),
            head,
            config,
            epoch: Ebr::new(),
        }
    }

    /// Returns the number of elements in the map.
    ///
    /// The count may lag behind in-flight mutations; it is an eventually
    /// consistent estimate.
    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(sanitize::RELAXED_LOAD)
    }

    /// Returns `true` if the map holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the current number of buckets.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Acquire)
    }

    /// Claims a reclamation slot for the calling thread and binds it to this
    /// map. Returns the already bound slot if the thread is registered.
    ///
    /// # Errors
    ///
    /// Fails when all [`MAX_THREADS`](crate::MAX_THREADS) slots are claimed.
    #[cfg(feature = "std")]
    pub fn register_thread(&self) -> Result<usize, RegisterError> {
        if let Some(bound) = BOUND_SLOT.with(Cell::get) {
            if bound.map == self.id() {
                return Ok(bound.slot);
            }
        }

        let slot = self.epoch.register()?;
        BOUND_SLOT.with(|cell| cell.set(Some(BoundSlot { map: self.id(), slot })));
        Ok(slot)
    }

    /// Releases the calling thread's slot, draining its pending retires.
    ///
    /// Does nothing if the thread is not registered with this map.
    #[cfg(feature = "std")]
    pub fn unregister_thread(&self) {
        if let Some(bound) = BOUND_SLOT.with(Cell::get) {
            if bound.map == self.id() {
                BOUND_SLOT.with(|cell| cell.set(None));
                // the slot was claimed by this thread in `register_thread`
                unsafe { self.epoch.unregister(bound.slot) };
            }
        }
    }

    /// Inserts or updates the entry for `key` and returns the prior value
    /// handle, or `None` for a fresh insertion.
    ///
    /// `key` 0 is rejected with `None` and no effect.
    pub fn insert(&self, key: u64, value: NonNull<V>) -> Option<NonNull<V>> {
        if key == 0 {
            return None;
        }

        let guard = self.pin();
        let hash = order::hash(key);
        let so_key = order::regular_key(hash);
        let start = self.bucket_head(hash, &guard);

        unsafe {
            let pos = list::find(&*start, so_key, key, &guard);
            if pos.found {
                let prior = (*pos.curr).value.swap(value.as_ptr(), AcqRel);
                return NonNull::new(prior);
            }

            let node = Box::into_raw(Node::regular(key, so_key, value));
            match list::insert(&*start, node, &guard) {
                Insert::Replaced(prior) => NonNull::new(prior),
                Insert::Linked => {
                    self.count.fetch_add(1, sanitize::RELAXED_RMW);
                    self.try_grow(&guard);
                    None
                }
            }
        }
    }

    /// Returns the value handle stored for `key`, if any.
    pub fn get(&self, key: u64) -> Option<NonNull<V>> {
        if key == 0 {
            return None;
        }

        let guard = self.pin();
        let hash = order::hash(key);
        let start = self.bucket_head(hash, &guard);

        unsafe {
            let pos = list::find(&*start, order::regular_key(hash), key, &guard);
            if pos.found {
                NonNull::new((*pos.curr).value.load(Acquire))
            } else {
                None
            }
        }
    }

    /// Removes the entry for `key` and returns its value handle, if any.
    pub fn remove(&self, key: u64) -> Option<NonNull<V>> {
        if key == 0 {
            return None;
        }

        let guard = self.pin();
        let hash = order::hash(key);
        let start = self.bucket_head(hash, &guard);

        let prior = unsafe { list::delete(&*start, order::regular_key(hash), key, &guard) };
        if prior.is_some() {
            self.count.fetch_sub(1, sanitize::RELAXED_RMW);
        }

        prior
    }

    #[cfg(feature = "std")]
    #[inline]
    fn id(&self) -> usize {
        &self.epoch as *const Ebr as usize
    }

    #[cfg(feature = "std")]
    #[inline]
    fn thread_slot(&self) -> Option<usize> {
        match BOUND_SLOT.with(Cell::get) {
            Some(bound) if bound.map == self.id() => Some(bound.slot),
            _ => None,
        }
    }

    #[cfg(not(feature = "std"))]
    #[inline]
    fn thread_slot(&self) -> Option<usize> {
        None
    }

    #[inline]
    fn pin(&self) -> Guard<'_> {
        // a bound slot is always owned by the calling thread
        unsafe { Guard::enter(&self.epoch, self.thread_slot()) }
    }

    /// Returns the sentinel to start the search for `hash` from,
    /// materializing it (and transitively its parents) first if necessary.
    fn bucket_head(&self, hash: u64, guard: &Guard<'_>) -> *const Node<V> {
        let buckets = unsafe { &*self.buckets.load(Acquire) };
        let idx = (hash & (buckets.len() as u64 - 1)) as usize;
        self.initialize_bucket(idx, guard);

        // reload, the array may have been swapped while the sentinel was
        // materialized
        let buckets = unsafe { &*self.buckets.load(Acquire) };
        if idx < buckets.len() {
            let sentinel = buckets.slot(idx).load(Acquire);
            if !sentinel.is_null() {
                return sentinel;
            }
        }

        &*self.head
    }

    fn initialize_bucket(&self, idx: usize, guard: &Guard<'_>) {
        let buckets = unsafe { &*self.buckets.load(Acquire) };
        if idx >= buckets.len() || !buckets.slot(idx).load(Acquire).is_null() {
            return;
        }

        // the parent's sentinel delimits the region this bucket splits off;
        // idx > 0 here since bucket 0 is never empty
        let parent = order::parent_bucket(idx);
        self.initialize_bucket(parent, guard);

        let dummy = Box::into_raw(Node::dummy(order::dummy_key(idx)));
        let sentinel = unsafe { list::insert_dummy(&*self.head, dummy, guard) };
        // competing initializers agree on the sentinel, the CAS outcome is
        // irrelevant
        let _ = buckets.slot(idx).compare_exchange(ptr::null_mut(), sentinel, AcqRel, Acquire);
    }

    /// Doubles the bucket array once the load factor is exceeded.
    ///
    /// The list is untouched; existing sentinel pointers are carried over
    /// and the upper half fills in lazily. Losing the swap race means a
    /// competitor resized first.
    fn try_grow(&self, guard: &Guard<'_>) {
        let count = self.count.load(sanitize::RELAXED_LOAD);
        let capacity = self.capacity.load(Relaxed);
        if count * 100 < capacity * self.config.load_factor_pct() {
            return;
        }

        let old = self.buckets.load(Acquire);
        let new = unsafe { (*old).alloc_doubled() };
        if self.buckets.compare_exchange(old, new, AcqRel, Acquire).is_ok() {
            unsafe {
                self.capacity.store((*new).len(), Release);
                // readers pinned in earlier epochs may still traverse the
                // old array
                guard.retire(NonNull::new_unchecked(old));
            }
        } else {
            // never published, no deferred reclamation needed
            drop(unsafe { Box::from_raw(new) });
        }
    }
}

/********** impl Default **************************************************************************/

impl<V> Default for Map<V> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/********** impl Debug ****************************************************************************/

impl<V> fmt::Debug for Map<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Map").field("len", &self.len()).field("capacity", &self.capacity()).finish()
    }
}

/********** impl Drop *****************************************************************************/

impl<V> Drop for Map<V> {
    fn drop(&mut self) {
        // the caller guarantees quiescence; walk the chain and free every
        // node still linked
        let mut curr = self.head.next.load(Relaxed).as_ptr();
        while !curr.is_null() {
            let node = unsafe { Box::from_raw(curr) };
            curr = node.next.load(Relaxed).as_ptr();
        }

        drop(unsafe { Box::from_raw(self.buckets.load(Relaxed)) });
        // dropping the engine afterwards reclaims all pending retires
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// BucketArray
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A power-of-two array of sentinel shortcuts into the list.
///
/// A null slot means the bucket has not been materialized at this capacity
/// yet. Indexing is always bounded by the array's own length, never by the
/// separately published map capacity.
struct BucketArray<V> {
    slots: Box<[AtomicPtr<Node<V>>]>,
}

/********** impl inherent *************************************************************************/

impl<V> BucketArray<V> {
    fn alloc(len: usize) -> *mut Self {
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, || AtomicPtr::new(ptr::null_mut()));
        Box::into_raw(Box::new(Self { slots: slots.into_boxed_slice() }))
    }

    /// Allocates an array of twice the length with all current slots copied
    /// into the lower half.
    fn alloc_doubled(&self) -> *mut Self {
        let doubled = Self::alloc(self.len() * 2);
        for (idx, slot) in self.slots.iter().enumerate() {
            unsafe { (*doubled).slots[idx].store(slot.load(Acquire), Relaxed) };
        }
        doubled
    }

    #[inline]
    fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, idx: usize) -> &AtomicPtr<Node<V>> {
        &self.slots[idx]
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::{self, NonNull};
    use std::sync::atomic::Ordering::Relaxed;

    use crate::config::ConfigBuilder;

    use super::Map;

    #[test]
    fn bucket_zero_is_head() {
        let map: Map<i32> = Map::new();
        let buckets = unsafe { &*map.buckets.load(Relaxed) };
        assert!(ptr::eq(buckets.slot(0).load(Relaxed), &*map.head));
        assert_eq!(map.capacity(), 16);
        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn chain_invariants_hold_after_churn() {
        let map: Map<i32> = Map::with_capacity(8);
        let values: Vec<i32> = (0..64).collect();

        for (i, value) in values.iter().enumerate() {
            assert_eq!(map.insert(i as u64 + 1, NonNull::from(value)), None);
        }
        for i in 0..16usize {
            assert!(map.remove(i as u64 + 1).is_some());
        }
        assert_eq!(map.len(), 48);

        // walk the raw chain: split-ordered keys never decrease, sentinels
        // precede their payload runs, and the unmarked payload count matches
        unsafe {
            let mut payload = 0;
            let mut last_so = 0u64;
            let mut curr = map.head.next.load(Relaxed).as_ptr();
            while !curr.is_null() {
                let node = &*curr;
                assert!(node.so_key >= last_so);
                last_so = node.so_key;
                if !node.is_dummy && !node.next.load(Relaxed).is_marked() {
                    payload += 1;
                }
                curr = node.next.load(Relaxed).as_ptr();
            }
            assert_eq!(payload, 48);
        }
    }

    #[test]
    fn grows_past_load_factor() {
        let config = ConfigBuilder::new().init_capacity(4).load_factor_pct(75).build();
        let map: Map<i32> = Map::with_config(config);
        let values: Vec<i32> = (0..32).collect();

        assert_eq!(map.capacity(), 4);
        for (i, value) in values.iter().enumerate() {
            map.insert(i as u64 + 1, NonNull::from(value));
        }
        assert!(map.capacity() >= 32);

        for (i, value) in values.iter().enumerate() {
            assert_eq!(map.get(i as u64 + 1), Some(NonNull::from(value)));
        }
    }

    #[test]
    fn unregistered_threads_still_function() {
        let map: Map<i32> = Map::new();
        let value = 1;

        assert_eq!(map.insert(3, NonNull::from(&value)), None);
        assert_eq!(map.get(3), Some(NonNull::from(&value)));
        assert_eq!(map.remove(3), Some(NonNull::from(&value)));
        assert_eq!(map.get(3), None);
    }
}
