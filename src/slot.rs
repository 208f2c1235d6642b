use crate::{
    alloc::Region,
    atomic::{AtomicWord, Atomicity, SlotIndex},
    STATE_MASK,
};
use core::{
    alloc::Layout,
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    mem::MaybeUninit,
    sync::atomic::Ordering::{Acquire, Release},
};

/// One record of the fixed backing array; holds at most one key-value
/// pair.
pub(crate) struct Slot<K, V, I: SlotIndex, M: Atomicity> {
    /// Low two bits: this slot's construction state. Upper bits: index of
    /// the first entry in the chain of the bucket this slot addresses.
    pub(crate) head_and_state: M::Cell<I>,
    /// Forward link within the chain this slot was spliced into.
    ///
    /// Written with `Relaxed` by the one writer that owns the slot; the
    /// happens-before edge for readers rides on the release exchange that
    /// splices the slot into its chain.
    pub(crate) next: M::Cell<I>,
    pub(crate) key: UnsafeCell<MaybeUninit<K>>,
    pub(crate) value: UnsafeCell<MaybeUninit<V>>,
}

impl<K, V, I: SlotIndex, M: Atomicity> Slot<K, V, I, M> {
    /// Replaces this slot's state bits with `state`, preserving the chain
    /// head packed into the upper bits, which other writers may be
    /// exchanging concurrently. Returns the word observed just before the
    /// successful exchange.
    pub(crate) fn state_update(&self, state: usize) -> usize {
        let mut word = self.head_and_state.load(Acquire).to_usize();

        loop {
            let new = (word & !STATE_MASK) | state;

            match self.head_and_state.compare_exchange_weak(
                I::from_usize(word),
                I::from_usize(new),
                Release,
                Acquire,
            ) {
                Ok(_) => return word,
                Err(observed) => word = observed.to_usize(),
            }
        }
    }

    /// # Safety
    ///
    /// The key must be initialized. Observing the slot's state as LINKED
    /// establishes that, as does being the writer that constructed it.
    #[inline(always)]
    pub(crate) unsafe fn key_unchecked(&self) -> &K {
        // SAFETY: the caller must ensure that access to the cell's inner
        // value is synchronized.
        let key = unsafe { &*self.key.get() };

        // SAFETY: the caller must ensure that the key has been initialized.
        unsafe { key.assume_init_ref() }
    }

    /// # Safety
    ///
    /// The value must be initialized. Observing the slot's state as LINKED
    /// establishes that, as does being the writer that constructed it.
    #[inline(always)]
    pub(crate) unsafe fn value_unchecked(&self) -> &V {
        // SAFETY: the caller must ensure that access to the cell's inner
        // value is synchronized.
        let value = unsafe { &*self.value.get() };

        // SAFETY: the caller must ensure that the value has been
        // initialized.
        unsafe { value.assume_init_ref() }
    }
}

impl<K, V, I: SlotIndex, M: Atomicity> fmt::Debug for Slot<K, V, I, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").finish_non_exhaustive()
    }
}

/// The fixed slot array: record 0 backs the reserved sentinel index, real
/// data occupies records 1 onwards.
pub(crate) struct Slots<K, V, I: SlotIndex, M: Atomicity> {
    region: Region,
    len: usize,
    marker: PhantomData<Slot<K, V, I, M>>,
}

impl<K, V, I: SlotIndex, M: Atomicity> Slots<K, V, I, M> {
    /// Allocates `len` zeroed slot records.
    ///
    /// The all-zero byte pattern is the valid initial slot: state EMPTY,
    /// chain head and forward link at the sentinel, key and value
    /// uninitialized. No initialization pass runs over the region.
    pub(crate) fn new(len: usize) -> Self {
        let Ok(layout) = Layout::array::<Slot<K, V, I, M>>(len) else {
            capacity_overflow();
        };

        Slots {
            region: Region::zeroed(layout),
            len,
            marker: PhantomData,
        }
    }

    #[inline]
    fn ptr(&self) -> *mut Slot<K, V, I, M> {
        self.region.as_ptr().cast()
    }

    #[inline(always)]
    pub(crate) fn get(&self, index: usize) -> &Slot<K, V, I, M> {
        debug_assert!(index < self.len);

        // SAFETY: every index the bump counter dispenses or a chain packs
        // is in bounds, and the region lives as long as `self`.
        unsafe { &*self.ptr().add(index) }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, index: usize) -> &mut Slot<K, V, I, M> {
        debug_assert!(index < self.len);

        // SAFETY: same as in `get` above, and the mutable reference makes
        // the access exclusive.
        unsafe { &mut *self.ptr().add(index) }
    }
}

#[cold]
fn capacity_overflow() -> ! {
    panic!("capacity overflow");
}
