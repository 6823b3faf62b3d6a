//! Scheduler core: the priority-ordered ready-scan and the context-switch
//! decision points.
//!
//! The scheduling algorithm is a linear scan of the thread table in place of
//! a priority queue: the table is immutably ordered by descending static
//! priority and the idle slot is always ready, so the first ready entry
//! found from index 0 is the highest-priority runnable thread and the scan
//! always terminates. Ties are impossible because table order is a total
//! order; whichever of several simultaneously readied threads has the lowest
//! index wins the next scheduling decision regardless of readying order.
use crate::{
    klock::{self, CpuLockGuard, CpuLockTokenRefMut},
    thread::ThreadSt,
    timeout, KernelTraits, Message, Timeout,
};

/// Halt unless called from thread context. Blocking operations only make
/// sense there.
pub(crate) fn expect_waitable_context<Traits: KernelTraits>() {
    kassert!(
        Traits,
        !Traits::is_interrupt_context(),
        "sched: blocking call in isr"
    );
}

/// Transition a non-ready thread to the ready state, storing `msg` as its
/// wakeup message and disarming its timeout (I-class: the context switch is
/// deferred to the caller's reschedule point).
///
/// If the thread outranks the currently scheduled `next`, it becomes the new
/// `next`.
pub(crate) fn ready<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    index: usize,
    msg: Message,
) {
    let Some(cb) = Traits::thread_cb(index) else {
        Traits::halt("sched: thread index out of range")
    };
    let state = Traits::state();
    kassert!(Traits, !cb.st.read(&*lock).is_ready(), "sched: already ready");
    kassert!(
        Traits,
        state.next.get(&*lock) <= state.current.get(&*lock),
        "sched: priority ordering"
    );

    cb.st.replace(&mut *lock, ThreadSt::Ready(msg));
    cb.timeout.replace(&mut *lock, 0);
    if index < state.next.get(&*lock) {
        state.next.replace(&mut *lock, index);
    }
}

/// Switch to `next` if it differs from the running thread (S-class). Returns
/// with the lock still held, possibly after the calling thread was suspended
/// and resumed an arbitrary time later.
pub(crate) fn reschedule_locked<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
) -> CpuLockGuard<Traits> {
    kassert!(
        Traits,
        !Traits::is_interrupt_context(),
        "sched: reschedule in isr"
    );
    let state = Traits::state();
    let next = state.next.get(&*lock);
    let current = state.current.get(&*lock);
    if next != current {
        state.current.replace(&mut *lock, next);
        let pool = Traits::thread_cb_pool();
        // Safety: CPU Lock is active; it is handed over across the switch
        unsafe { Traits::context_switch(&pool[next], &pool[current]) };
    }
    lock
}

/// Evaluate whether a higher-priority thread became ready and switch to it
/// (thread context).
///
/// Must be called after any sequence of I-class operations performed in
/// thread context; interrupt epilogues arrange the equivalent switch
/// unconditionally.
pub fn reschedule<Traits: KernelTraits>() {
    let lock = klock::lock_cpu::<Traits>();
    drop(reschedule_locked(lock));
}

/// Put the running thread to sleep in `new_st`, arm `timeout`, and hand the
/// processor to the first ready entry of the table.
///
/// Returns once the thread is scheduled again, yielding the wakeup message
/// stored by whoever readied it. The wait happens inside the port's context
/// switch: this function's continuation runs on the sleeping thread's own
/// stack when it is resumed, with CPU Lock held across both edges of the
/// switch.
///
/// Callers must handle [`Timeout::Immediate`] themselves, before going to
/// sleep.
pub(crate) fn go_to_sleep<Traits: KernelTraits>(
    mut lock: CpuLockGuard<Traits>,
    new_st: ThreadSt<Traits>,
    timeout: Timeout,
) -> (CpuLockGuard<Traits>, Message) {
    debug_assert!(!new_st.is_ready());
    debug_assert!(!matches!(timeout, Timeout::Immediate));

    let state = Traits::state();
    let pool = Traits::thread_cb_pool();
    let previous = state.current.get(&*lock);
    kassert!(Traits, previous != Traits::NUM_THREADS, "sched: idle cannot sleep");

    pool[previous].st.replace(&mut *lock, new_st);
    if let Timeout::After(ticks) = timeout {
        if ticks > 0 {
            timeout::arm_current(lock.borrow_mut(), ticks);
        }
    }

    // Ready-scan.
    let mut index = 0;
    let found = loop {
        if index >= pool.len() {
            Traits::halt("sched: scan out of range");
        }
        if pool[index].st.read(&*lock).is_ready() {
            break index;
        }
        index += 1;
    };
    state.current.replace(&mut *lock, found);
    state.next.replace(&mut *lock, found);

    // Safety: CPU Lock is active; it is handed over across the switch
    unsafe { Traits::context_switch(&pool[found], &pool[previous]) };

    // Resumed. The wakeup message is stored in our (now ready) state.
    let ThreadSt::Ready(msg) = pool[previous].st.get(&*lock) else {
        Traits::halt("sched: resumed while not ready")
    };
    (lock, msg)
}
