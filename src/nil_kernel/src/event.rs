//! Per-thread event flags.
//!
//! Every thread owns a mask of pending events. Interrupt handlers and other
//! threads OR bits into it; the owning thread consumes events by waiting for
//! any bit of an interest mask. Pending events persist across state
//! transitions until consumed.
use crate::{
    klock::{self, CpuLockTokenRefMut},
    sched,
    thread::ThreadSt,
    EventMask, KernelTraits, Message, ThreadId, Timeout,
};

/// Signal `events` to the given thread, waking it if it is waiting on an
/// intersecting interest mask. The switch to the woken thread happens before
/// this returns.
pub fn signal<Traits: KernelTraits>(thread: ThreadId, events: EventMask) {
    let mut lock = klock::lock_cpu::<Traits>();
    signal_locked::<Traits>(lock.borrow_mut(), thread, events);
    drop(sched::reschedule_locked(lock));
}

/// [`signal`] for interrupt handlers; the switch is left to the interrupt
/// epilogue.
pub fn signal_from_isr<Traits: KernelTraits>(thread: ThreadId, events: EventMask) {
    let mut lock = klock::lock_cpu_from_isr::<Traits>();
    signal_locked::<Traits>(lock.borrow_mut(), thread, events);
}

pub(crate) fn signal_locked<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    thread: ThreadId,
    events: EventMask,
) {
    let Some(cb) = Traits::thread_cb(thread.get()) else {
        Traits::halt("evt: thread index out of range")
    };
    let pending = cb.pending_events.get(&*lock) | events;
    cb.pending_events.replace(&mut *lock, pending);

    if let ThreadSt::WaitingEvent(interest) = cb.st.get(&*lock) {
        if pending & interest != 0 {
            sched::ready(lock, thread.get(), Message::Ok);
        }
    }
}

/// Wait until any event in `events` is pending, then atomically clear and
/// return the matching subset. Returns the empty mask on timeout.
pub fn wait_any<Traits: KernelTraits>(events: EventMask, timeout: Timeout) -> EventMask {
    let mut lock = klock::lock_cpu::<Traits>();
    sched::expect_waitable_context::<Traits>();

    let current = Traits::state().current.get(&*lock);
    let cb = &Traits::thread_cb_pool()[current];

    let mut matched = cb.pending_events.get(&*lock) & events;
    if matched == 0 {
        if let Timeout::Immediate = timeout {
            return 0;
        }
        let (resumed, msg) = sched::go_to_sleep(lock, ThreadSt::WaitingEvent(events), timeout);
        lock = resumed;
        if msg != Message::Ok {
            return 0;
        }
        matched = cb.pending_events.get(&*lock) & events;
    }
    cb.pending_events.replace_with(&mut *lock, |p| *p & !matched);
    matched
}

/// Get and clear the pending events of the calling thread matching `events`,
/// without blocking.
pub fn take<Traits: KernelTraits>(events: EventMask) -> EventMask {
    let mut lock = klock::lock_cpu::<Traits>();
    let current = Traits::state().current.get(&*lock);
    let cb = &Traits::thread_cb_pool()[current];
    let matched = cb.pending_events.get(&*lock) & events;
    cb.pending_events.replace_with(&mut *lock, |p| *p & !matched);
    matched
}
