#![allow(unused_unsafe, clippy::inline_always)]
#![warn(rust_2018_idioms, missing_debug_implementations)]
#![forbid(unsafe_op_in_unsafe_fn, clippy::undocumented_unsafe_blocks)]

use core::{
    borrow::Borrow,
    fmt,
    hash::{BuildHasher, Hash},
    hint,
    iter::FusedIterator,
    mem,
    ptr,
    sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release},
};
use std::thread;

use crate::{
    slot::{Slot, Slots},
    wait::{Backoff, WaiterSet},
};

pub use crate::atomic::{Atomic, AtomicWord, Atomicity, NonAtomic, NonAtomicWord, SlotIndex, Word};
pub use fxhash::FxBuildHasher;

mod alloc;
mod atomic;
mod slot;
mod wait;

/// The slot index used to signify the end of a chain.
const NIL: usize = 0;

/// The number of low state-word bits that carry a slot's construction
/// state.
const STATE_BITS: u32 = 2;

/// The mask for a slot's construction state.
pub(crate) const STATE_MASK: usize = 0b11;

/// The state of a slot that holds nothing.
const EMPTY: usize = 0b00;

/// The state of a slot whose writer is still moving the key and value in.
const CONSTRUCTING: usize = 0b01;

/// The state of a slot whose key and value are fully constructed and which
/// has been spliced into its bucket's chain.
const LINKED: usize = 0b10;

/// CONSTRUCTING with at least one reader parked on the slot; the
/// publishing writer is obligated to wake them.
const WAITING: usize = 0b11;

/// How many spin-loop iterations a reader burns on a CONSTRUCTING slot
/// before it parks.
const MAX_SPINS: u32 = 512;

/// The fraction of slots that may be occupied before emplace starts
/// failing, unless a constructor is given a different one.
pub const DEFAULT_MAX_LOAD_FACTOR: f32 = 0.8;

/// `InsertMap` with 16-bit packed indices; at most 2^14 − 1 slots.
pub type InsertMap16<K, V, S = FxBuildHasher> = InsertMap<K, V, S, u16>;

/// `InsertMap` with 64-bit packed indices, for tables beyond the 2^30-slot
/// reach of the default width.
pub type InsertMap64<K, V, S = FxBuildHasher> = InsertMap<K, V, S, u64>;

/// `InsertMap` confined to a single thread, with the synchronization
/// compiled out.
pub type NonAtomicInsertMap<K, V, S = FxBuildHasher> = InsertMap<K, V, S, u32, NonAtomic>;

/// A concurrent, insert-only hash map.
///
/// Keys are written once and read many times; nothing is ever removed.
/// Both the key and the value of an entry stay at a stable address until
/// the map is dropped, so lookups hand out plain references bounded by the
/// map's lifetime.
pub struct InsertMap<K, V, S = FxBuildHasher, I: SlotIndex = u32, M: Atomicity = Atomic> {
    /// ```compile_fail,E0597
    /// let r;
    /// {
    ///     let map = concurrent_insertmap::InsertMap::<u32, u32>::new(4);
    ///     let _ = map.emplace(1, 2);
    ///     r = map.get(&1);
    /// }
    /// dbg!(r);
    /// ```
    slots: Slots<K, V, I, M>,
    /// The number of usable slots; real data occupies indices
    /// 1..=slot_count, index 0 is the sentinel.
    slot_count: usize,
    capacity: usize,
    hash_builder: S,
    hot: HotData<M>,
    waiters: WaiterSet,
}

#[repr(align(128))]
struct HotData<M: Atomicity> {
    /// Slots dispensed by the bump allocator so far; never exceeds
    /// `slot_count`.
    used: M::Cell<usize>,
    /// The number of LINKED entries.
    len: M::Cell<usize>,
}

// SAFETY: `InsertMap` is an owned collection: sending it moves the keys and
// values along, so both must be `Send`, as must the hasher. The cell bounds
// rule out nothing for real atomics and are vacuous for `NonAtomic`, whose
// cells are `Send` as well.
unsafe impl<K: Send, V: Send, S: Send, I: SlotIndex, M: Atomicity> Send for InsertMap<K, V, S, I, M>
where
    M::Cell<I>: Send,
    M::Cell<usize>: Send,
{
}

// SAFETY: a shared `InsertMap` lets any thread insert keys and values
// (which therefore must be `Send`) and read them from any thread (which
// therefore must be `Sync`); hashing goes through `&S` concurrently. The
// cell bounds hold for real atomics and fail for `NonAtomic`, which is how
// the single-threaded mode loses `Sync`.
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync, I: SlotIndex, M: Atomicity> Sync
    for InsertMap<K, V, S, I, M>
where
    M::Cell<I>: Sync,
    M::Cell<usize>: Sync,
{
}

impl<K, V, S: BuildHasher + Default, I: SlotIndex, M: Atomicity> InsertMap<K, V, S, I, M> {
    /// Creates a map that can hold at least `capacity` distinct keys.
    ///
    /// # Panics
    ///
    /// Panics if the slot count for `capacity` exceeds what the index
    /// width can address.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        handle_config(Self::try_with(capacity, DEFAULT_MAX_LOAD_FACTOR, S::default()))
    }

    /// Fallible [`new`].
    ///
    /// # Errors
    ///
    /// Returns an error if the slot count for `capacity` exceeds what the
    /// index width can address.
    ///
    /// [`new`]: Self::new
    pub fn try_with_capacity(capacity: usize) -> Result<Self, ConfigError> {
        Self::try_with(capacity, DEFAULT_MAX_LOAD_FACTOR, S::default())
    }
}

impl<K, V, S: BuildHasher, I: SlotIndex, M: Atomicity> InsertMap<K, V, S, I, M> {
    /// # Panics
    ///
    /// Panics if the slot count for `capacity` exceeds what the index
    /// width can address.
    #[must_use]
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        handle_config(Self::try_with(capacity, DEFAULT_MAX_LOAD_FACTOR, hash_builder))
    }

    /// Creates a map that can hold at least `capacity` distinct keys, with
    /// the slot array oversized by `1 / max_load_factor`.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_load_factor` lies outside `(0, 1]` or the
    /// resulting slot count exceeds what the index width can address.
    pub fn try_with(
        capacity: usize,
        max_load_factor: f32,
        hash_builder: S,
    ) -> Result<Self, ConfigError> {
        if !(max_load_factor > 0.0 && max_load_factor <= 1.0) {
            return Err(ConfigError {
                kind: ConfigErrorKind::LoadFactor(max_load_factor),
            });
        }

        // The byte-size bound keeps the slot array allocatable; the extra
        // record backs the reserved sentinel index 0.
        let max_records = isize::MAX as usize / mem::size_of::<Slot<K, V, I, M>>();
        let slot_count = slot_count_for::<I>(capacity, max_load_factor, max_records)?;

        Ok(InsertMap {
            slots: Slots::new(slot_count + 1),
            slot_count,
            capacity,
            hash_builder,
            hot: HotData {
                used: <M::Cell<usize> as AtomicWord<usize>>::new(0),
                len: <M::Cell<usize> as AtomicWord<usize>>::new(0),
            },
            waiters: WaiterSet::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }
}

impl<K, V, S, I: SlotIndex, M: Atomicity> InsertMap<K, V, S, I, M> {
    /// The number of distinct keys the map was asked to hold.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of slots backing the map; emplace fails once this many
    /// have been dispensed.
    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.hot.len.load(Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the entries in slot-index order.
    ///
    /// Entries published while the iterator is live may or may not be
    /// yielded; every entry yielded is fully constructed at the moment it
    /// is visited. The iterator never waits.
    #[inline]
    #[must_use]
    pub fn iter(&self) -> Iter<'_, K, V, I, M> {
        Iter {
            slots: &self.slots,
            index: 1,
            end: self.hot.used.load(Acquire) + 1,
        }
    }

    /// Dispenses the next free slot index, or `None` once the array is
    /// exhausted.
    fn claim_slot(&self) -> Option<usize> {
        let mut used = self.hot.used.load(Relaxed);
        let mut backoff = Backoff::new();

        loop {
            if used == self.slot_count {
                return None;
            }

            match self
                .hot
                .used
                .compare_exchange_weak(used, used + 1, Relaxed, Relaxed)
            {
                Ok(_) => return Some(used + 1),
                Err(observed) => {
                    used = observed;
                    backoff.spin();
                }
            }
        }
    }

    /// Walks the chain starting at `first` looking for `key`, returning
    /// the index of the LINKED slot that holds it.
    fn search<Q>(&self, first: usize, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut index = first;

        while index != NIL {
            let slot = self.slots.get(index);
            let word = self.wait_until_legible(index, slot);

            if word & STATE_MASK != LINKED {
                // A non-linked slot on the walk means the chain ends here.
                return None;
            }

            // SAFETY: LINKED slots have fully constructed keys, and the
            // Acquire load that observed the state pairs with the Release
            // exchange that published it.
            if unsafe { slot.key_unchecked() }.borrow() == key {
                return Some(index);
            }

            index = slot.next.load(Acquire).to_usize();
        }

        None
    }

    /// Loads `slot`'s state word, waiting out CONSTRUCTING with a bounded
    /// spin followed by a park. The returned word's state is LINKED or
    /// EMPTY.
    fn wait_until_legible(&self, index: usize, slot: &Slot<K, V, I, M>) -> usize {
        let mut word = slot.head_and_state.load(Acquire).to_usize();

        if !is_under_construction(word) {
            return word;
        }

        for _ in 0..MAX_SPINS {
            hint::spin_loop();

            word = slot.head_and_state.load(Acquire).to_usize();

            if !is_under_construction(word) {
                return word;
            }
        }

        loop {
            match word & STATE_MASK {
                CONSTRUCTING => {
                    let waiting = (word & !STATE_MASK) | WAITING;

                    match slot.head_and_state.compare_exchange(
                        I::from_usize(word),
                        I::from_usize(waiting),
                        AcqRel,
                        Acquire,
                    ) {
                        Ok(_) => word = waiting,
                        Err(observed) => word = observed.to_usize(),
                    }
                }
                WAITING => {
                    self.waiters.register(index);

                    // Re-check after registering; the writer drains the set
                    // only when it leaves WAITING, so the wakeup cannot
                    // slip between this check and the park.
                    word = slot.head_and_state.load(Acquire).to_usize();

                    while word & STATE_MASK == WAITING {
                        thread::park();

                        word = slot.head_and_state.load(Acquire).to_usize();
                    }

                    self.waiters.deregister(index);
                }
                _ => return word,
            }
        }
    }
}

impl<K, V, S: BuildHasher, I: SlotIndex, M: Atomicity> InsertMap<K, V, S, I, M> {
    /// Index of the slot anchoring the chain for `hash`'s bucket. Buckets
    /// are 0..slot_count; their anchors are slots 1..=slot_count, past the
    /// sentinel.
    #[inline]
    fn bucket_head(&self, hash: u64) -> usize {
        (hash % self.slot_count as u64) as usize + 1
    }

    fn find_index<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let head = self.slots.get(self.bucket_head(self.hash_builder.hash_one(key)));
        let first = head.head_and_state.load(Acquire).to_usize() >> STATE_BITS;

        self.search(first, key)
    }

    /// Returns a reference to the value stored for `key`.
    #[inline]
    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.slots.get(self.find_index(key)?);

        // SAFETY: `search` only returns LINKED slots.
        Some(unsafe { slot.value_unchecked() })
    }

    #[inline]
    #[must_use]
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.slots.get(self.find_index(key)?);

        // SAFETY: `search` only returns LINKED slots.
        Some(unsafe { (slot.key_unchecked(), slot.value_unchecked()) })
    }

    /// Inserts `key` with `value` unless the key is already present.
    ///
    /// Returns a reference to the stored value — the freshly inserted one,
    /// or the existing one if the key was already there — and whether the
    /// insert happened. The reference stays valid for the life of the map.
    ///
    /// # Errors
    ///
    /// Returns an error if every slot has been dispensed; the map's
    /// existing entries are unaffected.
    #[inline]
    pub fn emplace(&self, key: K, value: V) -> Result<(&V, bool), CapacityError>
    where
        K: Hash + Eq,
    {
        self.emplace_with(key, move || value)
    }

    /// [`emplace`] with the value constructed only if the key turns out to
    /// be missing.
    ///
    /// If two writers race on the same key, both may run their
    /// constructors, but only the winner's value is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if every slot has been dispensed.
    ///
    /// [`emplace`]: Self::emplace
    pub fn emplace_with<F>(&self, key: K, f: F) -> Result<(&V, bool), CapacityError>
    where
        K: Hash + Eq,
        F: FnOnce() -> V,
    {
        let head_index = self.bucket_head(self.hash_builder.hash_one(&key));
        let head = self.slots.get(head_index);
        let mut prev = head.head_and_state.load(Acquire).to_usize();

        if let Some(existing) = self.search(prev >> STATE_BITS, &key) {
            // SAFETY: `search` only returns LINKED slots.
            return Ok((unsafe { self.slots.get(existing).value_unchecked() }, false));
        }

        let index = self.claim_slot().ok_or(CapacityError)?;
        let slot = self.slots.get(index);

        // The claimed slot's upper bits may anchor a live chain for the
        // bucket it addresses, so the state flip has to preserve them.
        let claimed = slot.state_update(CONSTRUCTING);
        debug_assert_eq!(claimed & STATE_MASK, EMPTY);

        // SAFETY: the bump counter dispensed `index` to this call alone,
        // and the slot is not on any chain yet, so the raw storage is ours
        // to initialize.
        unsafe {
            slot.key.get().cast::<K>().write(key);
            slot.value.get().cast::<V>().write(f());
        }

        // SAFETY: the key was initialized right above and is only dropped
        // by this call or by the map's destructor.
        let key = unsafe { slot.key_unchecked() };

        let mut backoff = Backoff::new();

        loop {
            slot.next.store(I::from_usize(prev >> STATE_BITS), Relaxed);

            let mut after = index << STATE_BITS;

            if index == head_index {
                // The new entry heads its own bucket: splicing and
                // publishing collapse into one exchange.
                after |= LINKED;
            } else {
                after |= prev & STATE_MASK;
            }

            match head.head_and_state.compare_exchange(
                I::from_usize(prev),
                I::from_usize(after),
                Release,
                Acquire,
            ) {
                Ok(_) => {
                    let prior = if index == head_index {
                        prev
                    } else {
                        slot.state_update(LINKED)
                    };

                    if prior & STATE_MASK == WAITING {
                        self.waiters.wake_all(index);
                    }

                    self.hot.len.fetch_add(1, Relaxed);

                    // SAFETY: the value was initialized above.
                    return Ok((unsafe { slot.value_unchecked() }, true));
                }
                Err(observed) => {
                    prev = observed.to_usize();

                    if let Some(existing) = self.search(prev >> STATE_BITS, key) {
                        // A racer published the same key first. Drop our
                        // pair and abandon the slot; it is on no chain and
                        // the bump counter never hands it out again.
                        //
                        // SAFETY: both cells were initialized above and
                        // nothing else can reach this slot.
                        unsafe {
                            ptr::drop_in_place(slot.key.get().cast::<K>());
                            ptr::drop_in_place(slot.value.get().cast::<V>());
                        }

                        let abandoned = slot.state_update(EMPTY);
                        debug_assert_eq!(abandoned & STATE_MASK, CONSTRUCTING);

                        // SAFETY: `search` only returns LINKED slots.
                        return Ok((
                            unsafe { self.slots.get(existing).value_unchecked() },
                            false,
                        ));
                    }

                    backoff.spin();
                }
            }
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug, S, I: SlotIndex, M: Atomicity> fmt::Debug
    for InsertMap<K, V, S, I, M>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S, I: SlotIndex, M: Atomicity> Drop for InsertMap<K, V, S, I, M> {
    fn drop(&mut self) {
        if !mem::needs_drop::<K>() && !mem::needs_drop::<V>() {
            // Trivially destructible pairs: release the region without
            // scanning it.
            return;
        }

        let used = *self.hot.used.get_mut();

        for index in 1..=used {
            let slot = self.slots.get_mut(index);

            if (*slot.head_and_state.get_mut()).to_usize() & STATE_MASK == LINKED {
                // SAFETY: LINKED slots hold initialized pairs, and the
                // mutable reference makes the access exclusive. Abandoned
                // slots went back to EMPTY when their pair was dropped.
                unsafe {
                    ptr::drop_in_place(slot.key.get_mut().as_mut_ptr());
                    ptr::drop_in_place(slot.value.get_mut().as_mut_ptr());
                }
            }
        }
    }
}

impl<'a, K, V, S, I: SlotIndex, M: Atomicity> IntoIterator for &'a InsertMap<K, V, S, I, M> {
    type Item = (&'a K, &'a V);

    type IntoIter = Iter<'a, K, V, I, M>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A forward cursor over a map's entries in slot-index order, skipping
/// slots that are not LINKED without waiting on them.
pub struct Iter<'a, K, V, I: SlotIndex = u32, M: Atomicity = Atomic> {
    slots: &'a Slots<K, V, I, M>,
    index: usize,
    end: usize,
}

// SAFETY: `Iter` semantically holds a reference to all keys and values, and
// references are safe to send to another thread as long as the referent is
// `Sync`. The cell bound confines `NonAtomic` iterators to their thread.
unsafe impl<K: Sync, V: Sync, I: SlotIndex, M: Atomicity> Send for Iter<'_, K, V, I, M> where
    M::Cell<I>: Sync
{
}

// SAFETY: same as `Send` above; a shared `Iter` hands out the same
// references.
unsafe impl<K: Sync, V: Sync, I: SlotIndex, M: Atomicity> Sync for Iter<'_, K, V, I, M> where
    M::Cell<I>: Sync
{
}

impl<K, V, I: SlotIndex, M: Atomicity> fmt::Debug for Iter<'_, K, V, I, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").finish_non_exhaustive()
    }
}

impl<'a, K, V, I: SlotIndex, M: Atomicity> Iterator for Iter<'a, K, V, I, M> {
    type Item = (&'a K, &'a V);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.end {
            let slot = self.slots.get(self.index);
            self.index += 1;

            let word = slot.head_and_state.load(Acquire).to_usize();

            if word & STATE_MASK == LINKED {
                // SAFETY: the Acquire load that observed LINKED pairs with
                // the Release exchange that published the slot, so the key
                // and value are fully constructed and visible.
                return Some(unsafe { (slot.key_unchecked(), slot.value_unchecked()) });
            }
        }

        None
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.end - self.index))
    }
}

impl<K, V, I: SlotIndex, M: Atomicity> FusedIterator for Iter<'_, K, V, I, M> {}

const fn is_under_construction(word: usize) -> bool {
    matches!(word & STATE_MASK, CONSTRUCTING | WAITING)
}

/// The slot count for `capacity`: the smallest prime at or above
/// `capacity / max_load_factor` that still leaves room past `capacity`,
/// bounded by what the index width can address and by `max_records`
/// allocatable slot records (including the sentinel).
fn slot_count_for<I: SlotIndex>(
    capacity: usize,
    max_load_factor: f32,
    max_records: usize,
) -> Result<usize, ConfigError> {
    let overflow = || ConfigError {
        kind: ConfigErrorKind::CapacityOverflow,
    };

    let max = if I::MAX_INDEX < usize::MAX as u64 {
        I::MAX_INDEX as usize
    } else {
        usize::MAX
    };
    let max = max.min(max_records - 1);

    let spread = (capacity as f64 / f64::from(max_load_factor)).ceil() as usize;
    let target = spread.max(capacity.checked_add(1).ok_or_else(overflow)?);

    if target > max {
        // The requested spread does not fit the index width; fall back to
        // the widest table that does, as long as the capacity itself fits.
        return if capacity < max { Ok(max) } else { Err(overflow()) };
    }

    Ok(next_prime(target).min(max))
}

/// The smallest prime at or above `n`.
fn next_prime(mut n: usize) -> usize {
    if n <= 2 {
        return 2;
    }

    n |= 1;

    while !is_prime(n) {
        n += 2;
    }

    n
}

fn is_prime(n: usize) -> bool {
    if n % 3 == 0 {
        return n == 3;
    }

    let mut divisor = 5;

    while divisor <= n / divisor {
        if n % divisor == 0 || n % (divisor + 2) == 0 {
            return false;
        }

        divisor += 6;
    }

    true
}

#[inline]
fn handle_config<T>(result: Result<T, ConfigError>) -> T {
    match result {
        Ok(map) => map,
        Err(err) => invalid_config(err),
    }
}

#[inline(never)]
#[cold]
fn invalid_config(err: ConfigError) -> ! {
    panic!("{err}");
}

/// The error returned when a map cannot be constructed with the requested
/// parameters.
#[derive(Debug)]
pub struct ConfigError {
    kind: ConfigErrorKind,
}

#[derive(Debug)]
enum ConfigErrorKind {
    LoadFactor(f32),
    CapacityOverflow,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConfigErrorKind::LoadFactor(factor) => {
                write!(f, "max load factor must lie in (0, 1], got {factor}")
            }
            ConfigErrorKind::CapacityOverflow => f.write_str(
                "slot count must fit in the index width with 2 bits left over",
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// The error returned by the emplace operations once every slot has been
/// dispensed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapacityError;

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("slot array exhausted")
    }
}

impl std::error::Error for CapacityError {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::{
        array,
        cell::Cell,
        hash::Hasher,
        sync::atomic::{AtomicU32, AtomicUsize},
    };
    use std::collections::HashSet;

    /// Hashes everything to bucket 0.
    #[derive(Clone, Copy, Debug, Default)]
    struct OneBucket;

    impl BuildHasher for OneBucket {
        type Hasher = OneBucketHasher;

        fn build_hasher(&self) -> Self::Hasher {
            OneBucketHasher
        }
    }

    #[derive(Debug)]
    struct OneBucketHasher;

    impl Hasher for OneBucketHasher {
        fn finish(&self) -> u64 {
            0
        }

        fn write(&mut self, _bytes: &[u8]) {}
    }

    #[test]
    fn basic() {
        let map = InsertMap::<&str, &str>::new(100);

        let (value, inserted) = map.emplace("abc", "ABC").unwrap();
        assert!(inserted);
        assert_eq!(*value, "ABC");

        assert_eq!(map.get("abc"), Some(&"ABC"));
        assert_eq!(map.get_key_value("abc"), Some((&"abc", &"ABC")));
        assert!(map.get("def").is_none());

        let mut iter = map.iter();
        assert_eq!(iter.next(), Some((&"abc", &"ABC")));
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());

        assert_eq!(map.len(), 1);
    }

    #[test]
    fn empty_map() {
        let map = InsertMap::<u32, u32>::new(8);

        assert!(map.get(&1).is_none());
        assert!(map.iter().next().is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn owned_string_keys() {
        let map = InsertMap::<String, String>::new(16);

        map.emplace(String::from("abc"), String::from("ABC")).unwrap();

        assert_eq!(map.get("abc"), Some(&String::from("ABC")));
        assert!(map.get("ab").is_none());
    }

    #[test]
    fn duplicate_emplace_is_identity_stable() {
        let map = InsertMap::<u32, u32>::new(16);

        let (first, inserted) = map.emplace(1, 10).unwrap();
        assert!(inserted);

        let (second, inserted) = map.emplace(1, 99).unwrap();
        assert!(!inserted);
        assert_eq!(*second, 10);
        assert!(ptr::eq(first, second));

        let found = map.get(&1).unwrap();
        assert!(ptr::eq(first, found));
    }

    #[test]
    fn emplace_with_skips_constructor_on_hit() {
        let map = InsertMap::<u32, u32>::new(8);

        map.emplace(1, 5).unwrap();

        let (value, inserted) = map
            .emplace_with(1, || panic!("constructor must not run"))
            .unwrap();
        assert!(!inserted);
        assert_eq!(*value, 5);
    }

    #[test]
    fn load_factor_inflates_slot_count() {
        let map =
            InsertMap::<u32, bool>::try_with(5000, 0.5, FxBuildHasher::default()).unwrap();
        assert!(map.slot_count() > 10_000);

        // Far more than the nominal capacity fits thanks to the load
        // factor request.
        for i in 0..10_000 {
            map.emplace(i, true).unwrap();
        }
    }

    #[test]
    fn capacity_exceeded() {
        let map =
            InsertMap::<u32, bool>::try_with(5000, 1.0, FxBuildHasher::default()).unwrap();

        let mut failed_at = None;

        for i in 0..6000 {
            if map.emplace(i, false).is_err() {
                failed_at = Some(i);
                break;
            }
        }

        let failed_at = failed_at.unwrap();
        assert!(failed_at >= 5000);

        // Prior entries stay intact and findable.
        for i in 0..failed_at {
            assert_eq!(map.get(&i), Some(&false));
        }
    }

    #[test]
    fn final_slot_succeeds_next_fails() {
        let map =
            InsertMap::<u32, u32>::try_with(100, 1.0, FxBuildHasher::default()).unwrap();
        let slot_count = map.slot_count() as u32;

        for i in 0..slot_count {
            map.emplace(i, i).unwrap();
        }

        assert_eq!(map.emplace(slot_count, 0), Err(CapacityError));
        assert_eq!(map.len(), slot_count as usize);

        // Re-emplacing an existing key still succeeds on a full map.
        let (value, inserted) = map.emplace(0, 7).unwrap();
        assert!(!inserted);
        assert_eq!(*value, 0);
    }

    #[test]
    fn index_width_bounds() {
        // u16 packs indices into 14 bits: 16383 slots.
        assert_eq!(<u16 as SlotIndex>::MAX_INDEX, 16383);

        let map = InsertMap16::<u32, u32>::try_with_capacity(13_000).unwrap();
        assert!(map.slot_count() <= 16383);

        // A capacity that fits the width, whose spread does not, clamps to
        // the widest table the width can address.
        let clamped = InsertMap16::<u32, u32>::try_with_capacity(16_000).unwrap();
        assert_eq!(clamped.slot_count(), 16383);

        assert!(InsertMap16::<u32, u32>::try_with_capacity(20_000).is_err());

        let wide = InsertMap64::<u64, u64>::new(1000);
        for i in 0..1000 {
            wide.emplace(i, i).unwrap();
        }
        assert_eq!(wide.get(&999), Some(&999));
    }

    #[test]
    fn rejects_bad_load_factors() {
        for factor in [0.0, -1.0, 1.5, f32::NAN] {
            assert!(InsertMap::<u32, u32>::try_with(
                100,
                factor,
                FxBuildHasher::default()
            )
            .is_err());
        }
    }

    #[test]
    fn forced_collisions_chain_in_one_bucket() {
        let map = InsertMap::<u32, u32, OneBucket>::with_capacity_and_hasher(64, OneBucket);

        for i in 0..64 {
            map.emplace(i, i * 2).unwrap();
        }

        for i in 0..64 {
            assert_eq!(map.get(&i), Some(&(i * 2)));
        }

        assert_eq!(map.iter().count(), 64);
    }

    #[test]
    fn value_mutation_through_shared_lookups() {
        let map = InsertMap::<u32, AtomicU32>::new(100);

        for i in 0..50 {
            map.emplace_with(i, || AtomicU32::new(i)).unwrap();
        }

        map.get(&1).unwrap().fetch_add(1, Relaxed);

        assert_eq!(map.get(&1).unwrap().load(Relaxed), 2);

        for i in 2..50 {
            assert_eq!(map.get(&i).unwrap().load(Relaxed), i);
        }
    }

    #[test]
    fn references_stay_stable_across_later_inserts() {
        let map = InsertMap::<u32, Cell<(u32, u32)>>::new(100_000);

        for i in 0..50 {
            map.emplace_with(i, || Cell::new((i, i))).unwrap();
        }

        let it = map.get(&48).unwrap();
        let it2 = map.get(&49).unwrap();

        for i in 50..1000 {
            map.emplace_with(i, || Cell::new((i, i))).unwrap();
        }

        // Mutating one entry through a fresh lookup disturbs nothing else.
        map.get(&1).unwrap().set((2, 1));
        assert_eq!(map.get(&1).unwrap().get(), (2, 1));

        // The references taken before the extra inserts still point at the
        // same addresses and see the same contents.
        assert_eq!(it.get(), (48, 48));
        assert_eq!(it2.get(), (49, 49));
        assert!(ptr::eq(it, map.get(&48).unwrap()));
        assert!(ptr::eq(it2, map.get(&49).unwrap()));

        map.get(&1).unwrap().set((1, 1));

        for i in 0..50 {
            assert_eq!(map.get(&i).unwrap().get(), (i, i));
        }
    }

    #[test]
    fn non_atomic_mode() {
        let map = NonAtomicInsertMap::<u64, u64>::new(10_000);

        for i in 0..10_000 {
            map.emplace(i, i * 3).unwrap();
        }

        for i in 0..10_000 {
            assert_eq!(map.get(&i), Some(&(i * 3)));
        }

        assert_eq!(map.iter().count(), 10_000);
    }

    #[test]
    fn drops_each_linked_pair_once() {
        static DROPPED: AtomicUsize = AtomicUsize::new(0);

        struct Tracked;

        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Relaxed);
            }
        }

        {
            let map = InsertMap::<String, Tracked>::new(100);

            for i in 0..10 {
                map.emplace(i.to_string(), Tracked).unwrap();
            }

            // The duplicate's unused value is dropped immediately.
            map.emplace(String::from("3"), Tracked).unwrap();
            assert_eq!(DROPPED.load(Relaxed), 1);
        }

        assert_eq!(DROPPED.load(Relaxed), 11);
    }

    const THREADS: usize = if cfg!(miri) { 4 } else { 32 };

    #[test]
    fn concurrent_same_key_emplaces_insert_exactly_once() {
        const KEYS: u32 = 50;

        let map = InsertMap::<u32, u32>::new(100);
        let inserted: [AtomicUsize; KEYS as usize] = array::from_fn(|_| AtomicUsize::new(0));

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for k in 0..KEYS {
                        let (value, fresh) = map.emplace(k, k).unwrap();
                        assert_eq!(*value, k);

                        if fresh {
                            inserted[k as usize].fetch_add(1, Relaxed);
                        }

                        assert_eq!(map.get(&k), Some(&k));
                    }
                });
            }
        });

        for count in &inserted {
            assert_eq!(count.load(Relaxed), 1);
        }

        assert_eq!(map.len(), KEYS as usize);
    }

    #[test]
    fn racing_duplicates_drop_cleanly() {
        static DROPPED: AtomicUsize = AtomicUsize::new(0);

        struct Loud;

        impl Drop for Loud {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, Relaxed);
            }
        }

        {
            let map = InsertMap::<u32, Loud>::new(8);

            thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(|| {
                        map.emplace(7, Loud).unwrap();
                    });
                }
            });

            assert_eq!(map.len(), 1);
            // Every loser's value was dropped, the winner's retained.
            assert_eq!(DROPPED.load(Relaxed), THREADS - 1);
        }

        assert_eq!(DROPPED.load(Relaxed), THREADS);
    }

    #[test]
    fn concurrent_chain_hammer() {
        const KEYS: u64 = if cfg!(miri) { 32 } else { 256 };
        const WRITERS: u64 = if cfg!(miri) { 2 } else { 8 };

        // Everything collides into one bucket, so readers routinely walk
        // the chain heads mid-splice.
        let map = InsertMap::<u64, [u64; 4], OneBucket>::with_capacity_and_hasher(
            KEYS as usize,
            OneBucket,
        );

        thread::scope(|s| {
            for t in 0..WRITERS {
                let map = &map;

                s.spawn(move || {
                    for k in (t..KEYS).step_by(WRITERS as usize) {
                        map.emplace(k, [k, !k, k.wrapping_mul(31), k ^ 0xABCD]).unwrap();
                    }

                    for k in 0..KEYS {
                        if let Some(value) = map.get(&k) {
                            assert_eq!(*value, [k, !k, k.wrapping_mul(31), k ^ 0xABCD]);
                        }
                    }
                });
            }
        });

        assert_eq!(map.len(), KEYS as usize);

        for k in 0..KEYS {
            assert_eq!(map.get(&k).unwrap()[0], k);
        }
    }

    #[test]
    fn iteration_during_inserts_yields_complete_entries_once() {
        const KEYS: u32 = if cfg!(miri) { 100 } else { 10_000 };

        let map = InsertMap::<u32, u32>::new(KEYS as usize);

        thread::scope(|s| {
            s.spawn(|| {
                for k in 0..KEYS {
                    map.emplace(k, k * 2).unwrap();
                }
            });

            s.spawn(|| {
                for _ in 0..20 {
                    let mut seen = HashSet::new();

                    for (key, value) in &map {
                        assert_eq!(*value, *key * 2);
                        assert!(seen.insert(*key));
                    }
                }
            });
        });

        assert_eq!(map.iter().count(), KEYS as usize);
    }

    #[test]
    fn mega_map() {
        let capacity: usize = if cfg!(miri) { 2_000 } else { 2_000_000 };

        let map = InsertMap64::<u64, u64>::new(capacity);

        for i in (0..2 * capacity as u64).step_by(2) {
            map.emplace(i, i * 10).unwrap();
        }

        // The +1 keeps the stride odd, so misses below the inserted range
        // get probed, and keeps `step_by` non-zero at the miri-scaled
        // capacity.
        let step = capacity / 1000 + 1;

        for i in (0..3 * capacity).step_by(step) {
            let i = i as u64;

            if i % 2 == 0 && i < 2 * capacity as u64 {
                assert_eq!(map.get(&i), Some(&(i * 10)));
            } else {
                assert!(map.get(&i).is_none());
            }
        }
    }

    #[test]
    fn sizing_helpers() {
        assert_eq!(next_prime(1), 2);
        assert_eq!(next_prime(2), 2);
        assert_eq!(next_prime(3), 3);
        assert_eq!(next_prime(4), 5);
        assert_eq!(next_prime(5000), 5003);
        assert_eq!(next_prime(10_000), 10_007);

        assert!(is_prime(2_147_483_647));
        assert!(!is_prime(2_147_483_649));
    }
}
