use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    thread::{self, Thread},
};

const SPIN_LIMIT: u32 = 6;

/// Exponential backoff for contended compare-exchange loops.
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Backoff { step: 0 }
    }

    pub(crate) fn spin(&mut self) {
        for _ in 0..1 << self.step {
            core::hint::spin_loop();
        }

        if self.step <= SPIN_LIMIT {
            self.step += 1;
        }
    }
}

/// Threads parked on slots whose construction they are waiting out, keyed
/// by slot index.
///
/// A reader registers itself before its final state check, and the
/// publishing writer drains the set only after leaving the waited-on
/// state, so a wakeup cannot slip between the check and the park.
pub(crate) struct WaiterSet {
    parked: Mutex<Vec<Waiter>>,
}

struct Waiter {
    slot: usize,
    thread: Thread,
}

impl WaiterSet {
    pub(crate) const fn new() -> Self {
        WaiterSet {
            parked: Mutex::new(Vec::new()),
        }
    }

    /// Registers the current thread as parked on `slot`.
    pub(crate) fn register(&self, slot: usize) {
        let thread = thread::current();

        self.lock().push(Waiter { slot, thread });
    }

    /// Removes the current thread's registration for `slot`, unless the
    /// waking writer already drained it.
    pub(crate) fn deregister(&self, slot: usize) {
        let id = thread::current().id();

        self.lock()
            .retain(|waiter| waiter.slot != slot || waiter.thread.id() != id);
    }

    /// Unparks every thread registered on `slot`.
    pub(crate) fn wake_all(&self, slot: usize) {
        self.lock().retain(|waiter| {
            if waiter.slot == slot {
                waiter.thread.unpark();

                false
            } else {
                true
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Waiter>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
