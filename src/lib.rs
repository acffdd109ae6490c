//! # reusemap
//!
//! A hash map for churn-heavy workloads: removing a key tombstones its slot
//! instead of freeing it, so the old value stays readable until an explicit
//! [`ReuseMap::compact`] reclaims the slot into an internal free list.
//! Re-inserting a removed key resurrects its slot in place, and reclaimed
//! slots are reused before the table ever grows, so steady-state
//! insert/remove/re-insert cycles allocate nothing.
//!
//! Storage is split into fixed-size pages of 4096 slots, so a table holding
//! millions of entries is backed by a list of modest allocations rather than
//! one giant contiguous array.
//!
//! Capacity changes in exactly two ways: growth (doubling, when insertion
//! exhausts both the free list and the never-used slot region, or via
//! [`ReuseMap::try_reserve`]) and compaction. Nothing happens in the
//! background, and the map is single-threaded by construction: all mutation
//! goes through `&mut self`.
//!
//! ## Example
//!
//! ```rust
//! use reusemap::ReuseMap;
//!
//! let mut map: ReuseMap<u32, &str> = ReuseMap::new();
//! map.set(1, "alpha")?;
//! map.set(2, "beta")?;
//!
//! map.remove(&1);
//! assert_eq!(map.try_get(&1), None);
//! assert_eq!(map.try_get_old(&1), Some(&"alpha"));
//! assert_eq!(map.len(), 1);
//!
//! map.set(1, "alpha2")?; // resurrects the same slot
//! assert_eq!(map.try_get(&1), Some(&"alpha2"));
//!
//! map.remove(&2);
//! map.compact(); // now slot 2 is truly gone and will be reused
//! assert_eq!(map.try_get_old(&2), None);
//! # Ok::<(), reusemap::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod map;
mod paged;

pub use map::{Iter, Keys, ReuseMap, Values};

use std::collections::TryReserveError;
use std::fmt;

/// Errors surfaced by table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Strict insert hit a key that is already live.
    ///
    /// Recoverable: use [`ReuseMap::set`] to overwrite instead.
    DuplicateKey,
    /// Demanding read on a key with no live entry.
    ///
    /// The `try_*` read variants return `Option` and never fail.
    KeyNotFound,
    /// Growth could not allocate new pages, or the slot-index ceiling
    /// (2^31 slots) would be exceeded. The table is left at its pre-growth
    /// state.
    CapacityExhausted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey => write!(f, "key already exists"),
            Self::KeyNotFound => write!(f, "key not found"),
            Self::CapacityExhausted => write!(f, "table growth failed to allocate"),
        }
    }
}

impl std::error::Error for Error {}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::CapacityExhausted
    }
}

/// Snapshot of a table's physical slot occupancy.
///
/// Every slot is in exactly one state:
/// `live + tombstones + free + untouched == capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Total slot count (bucket count is the same).
    pub capacity: usize,
    /// Live entries.
    pub live: usize,
    /// Removed entries still readable as old values.
    pub tombstones: usize,
    /// Reclaimed slots waiting on the free list.
    pub free: usize,
    /// Slots the bump cursor has never handed out.
    pub untouched: usize,
    /// Pages backing the slot store.
    pub slot_pages: usize,
    /// Pages backing the bucket index.
    pub bucket_pages: usize,
    /// Bytes held by slot pages.
    pub slot_bytes: usize,
    /// Bytes held by bucket pages.
    pub bucket_bytes: usize,
}

#[cfg(test)]
mod proptests;
