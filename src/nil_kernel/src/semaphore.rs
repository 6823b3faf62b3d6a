//! Counting semaphores.
use core::fmt;
use core::ptr;

use crate::{
    klock::{self, CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    sched,
    thread::ThreadSt,
    KernelTraits, Message, SemCount, Timeout,
};

/// A counting semaphore.
///
/// The counter encodes the entire state: a positive or zero value is the
/// number of available permits, while a negative value is the negated number
/// of threads currently asleep on the semaphore. Semaphores live in static
/// storage and are never destroyed.
///
/// When several threads are asleep on the same semaphore, [`signal`]
/// releases them in **priority order, not arrival order**: the table scan
/// that matches a waiter runs from the highest priority down.
///
/// [`signal`]: Semaphore::signal
pub struct Semaphore<Traits> {
    count: CpuLockCell<Traits, SemCount>,
}

impl<Traits> Semaphore<Traits> {
    /// Create a semaphore holding `initial` permits.
    pub const fn new(initial: SemCount) -> Self {
        assert!(
            initial >= 0,
            "initial semaphore counter must be non-negative"
        );
        Self {
            count: CpuLockCell::new(initial),
        }
    }
}

impl<Traits> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count)
            .finish()
    }
}

impl<Traits: KernelTraits> Semaphore<Traits> {
    /// Take a permit, going to sleep until one is signaled if none is
    /// available.
    ///
    /// Returns [`Message::Ok`] when a permit was taken, [`Message::Timeout`]
    /// when `timeout` elapsed first (or immediately, for
    /// [`Timeout::Immediate`] with no permit available), and
    /// [`Message::Reset`] when the semaphore was reset while waiting.
    pub fn wait(&'static self, timeout: Timeout) -> Message {
        let lock = klock::lock_cpu::<Traits>();
        sched::expect_waitable_context::<Traits>();
        let (lock, msg) = self.wait_locked(lock, timeout);
        drop(lock);
        msg
    }

    pub(crate) fn wait_locked(
        &'static self,
        mut lock: CpuLockGuard<Traits>,
        timeout: Timeout,
    ) -> (CpuLockGuard<Traits>, Message) {
        let count = self.count.get(&*lock);
        if count <= 0 {
            if let Timeout::Immediate = timeout {
                return (lock, Message::Timeout);
            }
            self.count.replace(&mut *lock, count - 1);
            return sched::go_to_sleep(lock, ThreadSt::WaitingSemaphore(self), timeout);
        }
        self.count.replace(&mut *lock, count - 1);
        (lock, Message::Ok)
    }

    /// Release a permit, waking the highest-priority waiter if there is one.
    /// The switch to the woken thread happens before this returns.
    pub fn signal(&'static self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.signal_locked(lock.borrow_mut());
        drop(sched::reschedule_locked(lock));
    }

    /// [`signal`](Self::signal) for interrupt handlers; the switch is left
    /// to the interrupt epilogue.
    pub fn signal_from_isr(&'static self) {
        let mut lock = klock::lock_cpu_from_isr::<Traits>();
        self.signal_locked(lock.borrow_mut());
    }

    pub(crate) fn signal_locked(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        let count = self.count.get(&*lock) + 1;
        self.count.replace(&mut *lock, count);
        if count <= 0 {
            // A waiter owes us a wakeup. Scanning in table order makes the
            // highest-priority waiter win.
            let pool = Traits::thread_cb_pool();
            let mut index = 0;
            loop {
                if index >= pool.len() {
                    Traits::halt("sem: waiter not found");
                }
                if let ThreadSt::WaitingSemaphore(waited_on) = pool[index].st.get(&*lock) {
                    if ptr::eq(waited_on, self) {
                        sched::ready(lock, index, Message::Ok);
                        return;
                    }
                }
                index += 1;
            }
        }
    }

    /// Set the counter to `n` (≥ 0) and wake every thread currently waiting
    /// on the semaphore with [`Message::Reset`]. The switches to the woken
    /// threads happen before this returns.
    pub fn reset(&'static self, n: SemCount) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.reset_locked(lock.borrow_mut(), n);
        drop(sched::reschedule_locked(lock));
    }

    /// [`reset`](Self::reset) for interrupt handlers; the switch is left to
    /// the interrupt epilogue.
    pub fn reset_from_isr(&'static self, n: SemCount) {
        let mut lock = klock::lock_cpu_from_isr::<Traits>();
        self.reset_locked(lock.borrow_mut(), n);
    }

    pub(crate) fn reset_locked(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, n: SemCount) {
        kassert!(Traits, n >= 0, "sem: negative reset");
        // The negated old counter bounds how many waiters have to be found.
        let mut owed = self.count.get(&*lock);
        self.count.replace(&mut *lock, n);
        let pool = Traits::thread_cb_pool();
        let mut index = 0;
        while owed < 0 {
            if index >= pool.len() {
                Traits::halt("sem: waiter not found");
            }
            if let ThreadSt::WaitingSemaphore(waited_on) = pool[index].st.get(&*lock) {
                if ptr::eq(waited_on, self) {
                    owed += 1;
                    sched::ready(lock.borrow_mut(), index, Message::Reset);
                }
            }
            index += 1;
        }
    }

    /// Undo the counter decrement of a waiter whose wait timed out.
    pub(crate) fn restore_count(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        self.count.replace_with(&mut *lock, |c| *c + 1);
    }

    /// The current counter value. Diagnostic use only; the value may be
    /// stale by the time the caller looks at it.
    pub fn count(&'static self) -> SemCount {
        let lock = klock::lock_cpu::<Traits>();
        let count = self.count.get(&*lock);
        count
    }

    #[cfg(test)]
    pub(crate) fn force_count(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, n: SemCount) {
        self.count.replace(&mut *lock, n);
    }
}
