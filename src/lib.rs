//! A lock-free concurrent hash map for 64-bit keys based on split-ordered
//! lists, backed by epoch-based memory reclamation.
//!
//! All entries live in a single linked list sorted by bit-reversed hash.
//! Buckets are lazily materialized sentinel pointers into that list, so
//! doubling the bucket array never rehashes or moves an entry. Deleted
//! nodes are unlinked with a single marked-pointer CAS and handed to the
//! epoch engine, which frees them once no thread can still observe them.
//!
//! Values are opaque, caller-owned handles: the map stores and returns
//! [`NonNull`](core::ptr::NonNull) pointers but never dereferences or frees
//! them.
//!
//! # Example
//!
//! ```
//! use core::ptr::NonNull;
//!
//! use splitmap::Map;
//!
//! let map: Map<u64> = Map::new();
//! map.register_thread().unwrap();
//!
//! let value = NonNull::from(Box::leak(Box::new(42u64)));
//! assert_eq!(map.insert(7, value), None);
//! assert_eq!(map.get(7), Some(value));
//!
//! let prior = map.remove(7).unwrap();
//! assert_eq!(map.get(7), None);
//! unsafe { drop(Box::from_raw(prior.as_ptr())) };
//!
//! map.unregister_thread();
//! ```

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

mod config;
mod epoch;
mod guard;
mod list;
mod map;
mod marked;
mod order;
mod retired;
mod sanitize;

pub use crate::config::{Config, ConfigBuilder};
pub use crate::epoch::{Ebr, RegisterError, EPOCH_COUNT, MAX_THREADS};
pub use crate::map::Map;
pub use crate::retired::Retired;
