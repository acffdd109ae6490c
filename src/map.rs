//! The slot-recycling table engine.
//!
//! Entries live in fixed slots inside a [`PagedVec`]; a parallel paged array
//! of chain heads maps each hash bucket to its first slot. Removal only
//! tombstones a slot, keeping the old value readable, and [`ReuseMap::compact`]
//! is the single operation that returns slots to the free list. Growth is the
//! single operation that changes capacity.

use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::mem;

use ahash::RandomState;

use crate::paged::PagedVec;
use crate::{Error, MemoryStats};

/// Hard ceiling on slot count, keeping every valid index clear of the
/// [`SlotIdx`] sentinel.
pub(crate) const MAX_CAPACITY: usize = 1 << 31;

/// Capacity multiplier applied when an insertion exhausts the table.
const GROWTH_FACTOR: usize = 2;

/// Compressed reference to a slot.
///
/// `u32::MAX` is the one reserved "none" value, terminating empty buckets,
/// bucket chains, and the free list alike.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub(crate) struct SlotIdx(u32);

impl SlotIdx {
    pub(crate) const NONE: SlotIdx = SlotIdx(u32::MAX);

    #[inline]
    fn from_usize(index: usize) -> Self {
        debug_assert!(index < MAX_CAPACITY);
        SlotIdx(index as u32)
    }

    #[inline]
    fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    fn index(self) -> usize {
        debug_assert!(!self.is_none());
        self.0 as usize
    }
}

/// One chained entry.
#[derive(Clone)]
struct Slot<K, V> {
    key: K,
    value: V,
    /// Next slot in the same bucket chain.
    next: SlotIdx,
    /// Live if true; tombstoned (removed, value still readable) if false.
    used: bool,
}

/// Physical state of a slot cell.
///
/// An `Occupied` cell is linked into exactly one bucket chain. A `Vacant`
/// cell is on the free list, or still in the untouched bump region with
/// `next_free` at `NONE`; it is never reachable from both structures.
#[derive(Clone)]
enum Entry<K, V> {
    Vacant { next_free: SlotIdx },
    Occupied(Slot<K, V>),
}

#[inline]
fn vacant<K, V>() -> Entry<K, V> {
    Entry::Vacant {
        next_free: SlotIdx::NONE,
    }
}

/// A hash map that recycles slot memory instead of freeing it.
///
/// Removing a key tombstones its slot: the entry stops counting as live but
/// its value stays readable through [`ReuseMap::try_get_old`] until either
/// the key is re-inserted (resurrection, in place) or [`ReuseMap::compact`]
/// reclaims the slot. Reclaimed slots are reused LIFO before the bump cursor
/// advances, so steady-state churn allocates nothing.
///
/// Storage is paged: no single allocation ever exceeds 4096 cells, so a
/// multi-million-entry table grows as a page list rather than one huge
/// array.
pub struct ReuseMap<K, V, S = RandomState> {
    /// Entry storage; cells `bump..capacity` have never been handed out.
    slots: PagedVec<Entry<K, V>>,
    /// Chain heads, one bucket per slot.
    buckets: PagedVec<SlotIdx>,
    /// `capacity - 1`; folds a hash into a bucket index.
    bucket_mask: usize,
    /// Head of the LIFO list of reclaimed cells.
    free_head: SlotIdx,
    /// Cells currently on the free list.
    free_len: usize,
    /// Next never-used cell.
    bump: usize,
    /// Entries with `used == true`.
    live: usize,
    hash_builder: S,
}

impl<K: Hash + Eq, V> ReuseMap<K, V, RandomState> {
    /// Create an empty map with the minimum capacity.
    pub fn new() -> Self {
        Self::with_capacity(1)
    }

    /// Create an empty map with room for at least `capacity` entries before
    /// the first growth.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, RandomState::new())
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> ReuseMap<K, V, S> {
    /// Create an empty map using `hash_builder` for key hashing.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_capacity_and_hasher(1, hash_builder)
    }

    /// Create an empty map with the given capacity hint and hasher.
    ///
    /// Capacity is rounded up to the smallest power of two ≥ max(1, hint).
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        assert!(capacity <= MAX_CAPACITY, "capacity exceeds 2^31 slots");
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: PagedVec::with_capacity(capacity, vacant),
            buckets: PagedVec::with_capacity(capacity, || SlotIdx::NONE),
            bucket_mask: capacity - 1,
            free_head: SlotIdx::NONE,
            free_len: 0,
            bump: 0,
            live: 0,
            hash_builder,
        }
    }

    /// Number of live entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    /// True if no entry is live (tombstones may still exist).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Total slot count. Always a power of two; bucket count is the same.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// The map's hasher.
    #[inline]
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & self.bucket_mask
    }

    /// First chained slot whose key matches, live or tombstoned.
    fn find<Q>(&self, hash: u64, key: &Q) -> SlotIdx
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut cur = *self.buckets.get(self.bucket_of(hash));
        while !cur.is_none() {
            let Entry::Occupied(slot) = self.slots.get(cur.index()) else {
                unreachable!("vacant cell linked into a bucket chain");
            };
            if slot.key.borrow() == key {
                return cur;
            }
            cur = slot.next;
        }
        SlotIdx::NONE
    }

    fn lookup<Q>(&self, key: &Q) -> Option<&Slot<K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.find(self.hash_builder.hash_one(key), key);
        if idx.is_none() {
            return None;
        }
        let Entry::Occupied(slot) = self.slots.get(idx.index()) else {
            unreachable!("vacant cell linked into a bucket chain");
        };
        Some(slot)
    }

    /// Insert a fresh key, failing with [`Error::DuplicateKey`] if the key is
    /// already live. A tombstoned key is resurrected in place.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), Error> {
        self.upsert(key, value, true)
    }

    /// Insert, overwrite, or resurrect; never fails on duplicates.
    ///
    /// The only possible failure is [`Error::CapacityExhausted`] when growth
    /// cannot allocate.
    pub fn set(&mut self, key: K, value: V) -> Result<(), Error> {
        self.upsert(key, value, false)
    }

    fn upsert(&mut self, key: K, value: V, strict: bool) -> Result<(), Error> {
        let hash = self.hash_builder.hash_one(&key);
        let found = self.find(hash, &key);
        if !found.is_none() {
            let Entry::Occupied(slot) = self.slots.get_mut(found.index()) else {
                unreachable!("vacant cell linked into a bucket chain");
            };
            if slot.used {
                if strict {
                    return Err(Error::DuplicateKey);
                }
            } else {
                // Resurrection: the slot keeps its chain position.
                slot.used = true;
                self.live += 1;
            }
            slot.value = value;
            return Ok(());
        }

        let idx = match self.allocate_slot() {
            Some(idx) => idx,
            None => {
                self.grow(self.capacity() + 1)?;
                match self.allocate_slot() {
                    Some(idx) => idx,
                    None => unreachable!("grown table has no vacant cells"),
                }
            }
        };
        // Chains grow by prepending: the new slot becomes the bucket head.
        let bucket = self.bucket_of(hash);
        let head = *self.buckets.get(bucket);
        *self.slots.get_mut(idx) = Entry::Occupied(Slot {
            key,
            value,
            next: head,
            used: true,
        });
        *self.buckets.get_mut(bucket) = SlotIdx::from_usize(idx);
        self.live += 1;
        Ok(())
    }

    /// Pop the free list, falling back to the bump cursor.
    fn allocate_slot(&mut self) -> Option<usize> {
        if !self.free_head.is_none() {
            let idx = self.free_head.index();
            let next_free = match self.slots.get(idx) {
                Entry::Vacant { next_free } => *next_free,
                Entry::Occupied(_) => unreachable!("occupied cell on the free list"),
            };
            self.free_head = next_free;
            self.free_len -= 1;
            return Some(idx);
        }
        if self.bump < self.capacity() {
            let idx = self.bump;
            self.bump += 1;
            return Some(idx);
        }
        None
    }

    /// Rebuild at a larger capacity, replaying every chained slot (live and
    /// tombstoned) through the prepend path.
    ///
    /// The complete new page set is allocated before the table is touched,
    /// so an allocation failure leaves the pre-growth state intact.
    fn grow(&mut self, min_capacity: usize) -> Result<(), Error> {
        let target = min_capacity.max(self.capacity().saturating_mul(GROWTH_FACTOR));
        if target > MAX_CAPACITY {
            return Err(Error::CapacityExhausted);
        }
        let new_capacity = target.next_power_of_two();
        let new_slots = PagedVec::try_with_capacity(new_capacity, vacant)?;
        let new_buckets = PagedVec::try_with_capacity(new_capacity, || SlotIdx::NONE)?;

        let old_slots = mem::replace(&mut self.slots, new_slots);
        self.buckets = new_buckets;
        self.bucket_mask = new_capacity - 1;
        self.free_head = SlotIdx::NONE;
        self.free_len = 0;
        let old_bump = mem::replace(&mut self.bump, 0);

        for entry in old_slots.into_cells().take(old_bump) {
            if let Entry::Occupied(mut slot) = entry {
                let bucket = self.bucket_of(self.hash_builder.hash_one(&slot.key));
                let idx = self.bump;
                self.bump += 1;
                slot.next = *self.buckets.get(bucket);
                *self.slots.get_mut(idx) = Entry::Occupied(slot);
                *self.buckets.get_mut(bucket) = SlotIdx::from_usize(idx);
            }
        }
        Ok(())
    }

    /// Ensure `additional` fresh keys fit without another allocation.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), Error> {
        let chained = self.bump - self.free_len;
        let available = self.capacity() - chained;
        if additional <= available {
            return Ok(());
        }
        let needed = chained
            .checked_add(additional)
            .ok_or(Error::CapacityExhausted)?;
        self.grow(needed)
    }

    /// Value of a live entry, failing with [`Error::KeyNotFound`] otherwise.
    ///
    /// [`ReuseMap::try_get`] is the non-failing variant.
    pub fn get<Q>(&self, key: &Q) -> Result<&V, Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.try_get(key).ok_or(Error::KeyNotFound)
    }

    /// Value of a live entry.
    pub fn try_get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.lookup(key) {
            Some(slot) if slot.used => Some(&slot.value),
            _ => None,
        }
    }

    /// Mutable value of a live entry.
    pub fn try_get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.find(self.hash_builder.hash_one(key), key);
        if idx.is_none() {
            return None;
        }
        match self.slots.get_mut(idx.index()) {
            Entry::Occupied(slot) if slot.used => Some(&mut slot.value),
            Entry::Occupied(_) => None,
            Entry::Vacant { .. } => unreachable!("vacant cell linked into a bucket chain"),
        }
    }

    /// Value of a removed-but-not-yet-compacted entry.
    ///
    /// This is the distinguishing read path: deleted values stay addressable
    /// until the key is re-inserted or [`ReuseMap::compact`] runs.
    pub fn try_get_old<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.lookup(key) {
            Some(slot) if !slot.used => Some(&slot.value),
            _ => None,
        }
    }

    /// True if the key has a live entry.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lookup(key).is_some_and(|slot| slot.used)
    }

    /// True if the key has a tombstoned entry.
    pub fn contains_old_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lookup(key).is_some_and(|slot| !slot.used)
    }

    /// Tombstone a live entry, keeping its value readable as an old value.
    ///
    /// Returns false if the key is absent or already tombstoned. Chain links
    /// and the free list are untouched; reclamation is `compact`'s job.
    pub fn remove<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.find(self.hash_builder.hash_one(key), key);
        if idx.is_none() {
            return false;
        }
        match self.slots.get_mut(idx.index()) {
            Entry::Occupied(slot) if slot.used => {
                slot.used = false;
                self.live -= 1;
                true
            }
            Entry::Occupied(_) => false,
            Entry::Vacant { .. } => unreachable!("vacant cell linked into a bucket chain"),
        }
    }

    /// Tombstone every live entry. Slots are not reclaimed.
    pub fn clear(&mut self) {
        let bump = self.bump;
        for entry in self.slots.iter_mut().take(bump) {
            if let Entry::Occupied(slot) = entry {
                slot.used = false;
            }
        }
        self.live = 0;
    }

    /// Unlink every tombstone and push its cell onto the free list.
    ///
    /// Keys and values of reclaimed cells are dropped here; live slots keep
    /// their relative chain order. Capacity never changes.
    pub fn compact(&mut self) {
        for bucket in 0..self.buckets.len() {
            let mut prev = SlotIdx::NONE;
            let mut cur = *self.buckets.get(bucket);
            while !cur.is_none() {
                let (next, dead) = match self.slots.get(cur.index()) {
                    Entry::Occupied(slot) => (slot.next, !slot.used),
                    Entry::Vacant { .. } => {
                        unreachable!("vacant cell linked into a bucket chain")
                    }
                };
                if dead {
                    if prev.is_none() {
                        *self.buckets.get_mut(bucket) = next;
                    } else {
                        let Entry::Occupied(prev_slot) = self.slots.get_mut(prev.index()) else {
                            unreachable!("vacant cell linked into a bucket chain");
                        };
                        prev_slot.next = next;
                    }
                    // Dropping the old cell releases the key and value.
                    *self.slots.get_mut(cur.index()) = Entry::Vacant {
                        next_free: self.free_head,
                    };
                    self.free_head = cur;
                    self.free_len += 1;
                } else {
                    prev = cur;
                }
                cur = next;
            }
        }
    }

    /// Snapshot of physical slot occupancy.
    pub fn memory_stats(&self) -> MemoryStats {
        let tombstones = self.bump - self.free_len - self.live;
        MemoryStats {
            capacity: self.capacity(),
            live: self.live,
            tombstones,
            free: self.free_len,
            untouched: self.capacity() - self.bump,
            slot_pages: self.slots.page_count(),
            bucket_pages: self.buckets.page_count(),
            slot_bytes: self.capacity() * mem::size_of::<Entry<K, V>>(),
            bucket_bytes: self.capacity() * mem::size_of::<SlotIdx>(),
        }
    }

    /// Lazy iterator over live entries, in bucket order then chain order.
    ///
    /// Chain order is most-recently-inserted first; there is no global key
    /// ordering. A fresh call restarts from the beginning.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            map: self,
            bucket: 0,
            cur: SlotIdx::NONE,
            remaining: self.live,
        }
    }

    /// Lazy iterator over live keys.
    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys { inner: self.iter() }
    }

    /// Lazy iterator over live values.
    pub fn values(&self) -> Values<'_, K, V, S> {
        Values { inner: self.iter() }
    }
}

impl<K: Hash + Eq, V, S: BuildHasher + Default> Default for ReuseMap<K, V, S> {
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> Clone for ReuseMap<K, V, S>
where
    K: Clone,
    V: Clone,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            buckets: self.buckets.clone(),
            bucket_mask: self.bucket_mask,
            free_head: self.free_head,
            free_len: self.free_len,
            bump: self.bump,
            live: self.live,
            hash_builder: self.hash_builder.clone(),
        }
    }
}

impl<K, V, S> fmt::Debug for ReuseMap<K, V, S>
where
    K: fmt::Debug + Hash + Eq,
    V: fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Iterator over a map's live `(key, value)` pairs.
pub struct Iter<'a, K, V, S = RandomState> {
    map: &'a ReuseMap<K, V, S>,
    /// Next bucket to pull a chain head from.
    bucket: usize,
    cur: SlotIdx,
    remaining: usize,
}

impl<'a, K, V, S> Iterator for Iter<'a, K, V, S> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        loop {
            while self.cur.is_none() {
                debug_assert!(self.bucket < self.map.buckets.len());
                self.cur = *self.map.buckets.get(self.bucket);
                self.bucket += 1;
            }
            let Entry::Occupied(slot) = self.map.slots.get(self.cur.index()) else {
                unreachable!("vacant cell linked into a bucket chain");
            };
            self.cur = slot.next;
            if slot.used {
                self.remaining -= 1;
                return Some((&slot.key, &slot.value));
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V, S> ExactSizeIterator for Iter<'_, K, V, S> {}

impl<'a, K: Hash + Eq, V, S: BuildHasher> IntoIterator for &'a ReuseMap<K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a map's live keys.
pub struct Keys<'a, K, V, S = RandomState> {
    inner: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Iterator for Keys<'a, K, V, S> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, _)| k)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K, V, S> ExactSizeIterator for Keys<'_, K, V, S> {}

/// Iterator over a map's live values.
pub struct Values<'a, K, V, S = RandomState> {
    inner: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Iterator for Values<'a, K, V, S> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, v)| v)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<K, V, S> ExactSizeIterator for Values<'_, K, V, S> {}

#[cfg(test)]
impl<K: Hash + Eq, V, S: BuildHasher> ReuseMap<K, V, S> {
    /// Assert the slot-partition invariants: every cell below the bump
    /// cursor is reachable from exactly one of (a bucket chain, the free
    /// list), counters match a full scan, and untouched cells are pristine.
    pub(crate) fn check_invariants(&self) {
        const UNSEEN: u8 = 0;
        const CHAINED: u8 = 1;
        const FREE: u8 = 2;

        let mut marks = vec![UNSEEN; self.bump];
        let mut live_seen = 0usize;

        for bucket in 0..self.buckets.len() {
            let mut cur = *self.buckets.get(bucket);
            while !cur.is_none() {
                let idx = cur.index();
                assert!(idx < self.bump, "chain reaches an unallocated cell");
                assert_eq!(marks[idx], UNSEEN, "cell reachable twice");
                marks[idx] = CHAINED;
                match self.slots.get(idx) {
                    Entry::Occupied(slot) => {
                        if slot.used {
                            live_seen += 1;
                        }
                        cur = slot.next;
                    }
                    Entry::Vacant { .. } => panic!("vacant cell linked into a bucket chain"),
                }
            }
        }
        assert_eq!(live_seen, self.live, "live counter out of sync");

        let mut free_seen = 0usize;
        let mut cur = self.free_head;
        while !cur.is_none() {
            let idx = cur.index();
            assert!(idx < self.bump, "free list reaches an unallocated cell");
            assert_eq!(marks[idx], UNSEEN, "cell reachable twice");
            marks[idx] = FREE;
            free_seen += 1;
            match self.slots.get(idx) {
                Entry::Vacant { next_free } => cur = *next_free,
                Entry::Occupied(_) => panic!("occupied cell on the free list"),
            }
        }
        assert_eq!(free_seen, self.free_len, "free counter out of sync");

        assert!(
            marks.iter().all(|&m| m != UNSEEN),
            "allocated cell unreachable from both chains and free list"
        );
        for idx in self.bump..self.capacity() {
            match self.slots.get(idx) {
                Entry::Vacant { next_free } => {
                    assert!(next_free.is_none(), "untouched cell carries a link")
                }
                Entry::Occupied(_) => panic!("occupied cell beyond the bump cursor"),
            }
        }
    }
}
