//! Memory orderings for the map's statistics counters.
//!
//! The element count is an eventually-consistent statistic and tolerates
//! relaxed ordering. Thread sanitizers can not always prove that, so the
//! `sanitize-threads` feature substitutes stronger orderings.

use core::sync::atomic::Ordering;

cfg_if::cfg_if! {
    if #[cfg(feature = "sanitize-threads")] {
        pub const RELAXED_LOAD: Ordering = Ordering::Acquire;
        pub const RELAXED_RMW: Ordering = Ordering::AcqRel;
    } else {
        pub const RELAXED_LOAD: Ordering = Ordering::Relaxed;
        pub const RELAXED_RMW: Ordering = Ordering::Relaxed;
    }
}
