//! Virtual-time management: timeout arming and the two timer disciplines.
//!
//! The kernel supports two mutually exclusive timing disciplines, selected
//! by [`KernelCfg::TICK_MODE`](crate::KernelCfg::TICK_MODE):
//!
//!  - **Periodic**: a fixed-frequency tick interrupt. Every pending timeout
//!    is a plain down-counter decremented on each tick.
//!
//!  - **Tick-less**: no periodic interrupt. A hardware alarm comparator is
//!    programmed to the nearest pending deadline; each pending timeout
//!    stores ticks remaining relative to `lasttime`, the time of the last
//!    alarm service. Going to sleep compares the new deadline against the
//!    programmed alarm and reprograms only when the new deadline is sooner.
//!
//! Both disciplines present the same two operations to the rest of the
//! kernel: [`arm_current`], called on the way to sleep, and [`handle_tick`],
//! the interrupt-context batch that wakes expired sleepers. A timeout is
//! disarmed the instant its thread becomes ready through any other means, so
//! a nonzero `timeout` field implies a non-ready thread. This is the core safety
//! invariant of this module, checked on every scan.
use crate::{
    klock::{self, CpuLockCell, CpuLockIsrGuard, CpuLockTokenRefMut},
    sched,
    thread::ThreadSt,
    utils::Init,
    KernelTraits, Message, SysTime, TickMode, Ticks,
};

/// Kernel-global timekeeping state.
pub(crate) struct TimeoutGlobals<Traits> {
    /// Periodic discipline: the tick counter. Wraps silently.
    systime: CpuLockCell<Traits, SysTime>,
    /// Tick-less discipline: time of the last alarm service.
    lasttime: CpuLockCell<Traits, SysTime>,
    /// Tick-less discipline: absolute time of the programmed alarm. Equal to
    /// `lasttime` while no alarm is pending.
    nexttime: CpuLockCell<Traits, SysTime>,
}

impl<Traits> Init for TimeoutGlobals<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        systime: Init::INIT,
        lasttime: Init::INIT,
        nexttime: Init::INIT,
    };
}

/// An internal utility to access `TimeoutGlobals`.
trait KernelTimeoutGlobalsExt: KernelTraits {
    /// Shortcut for `&Self::state().timeout`.
    #[inline(always)]
    fn g_timeout() -> &'static TimeoutGlobals<Self> {
        &Self::state().timeout
    }
}

impl<T: KernelTraits> KernelTimeoutGlobalsExt for T {}

/// Check if `time` lies within the window `[start, end)`, taking wrap-around
/// into account. An empty window (`start == end`) contains nothing.
#[inline]
pub fn time_is_in_range(time: SysTime, start: SysTime, end: SysTime) -> bool {
    time.wrapping_sub(start) < end.wrapping_sub(start)
}

/// Initialize timekeeping at boot.
///
/// In the tick-less discipline the service interval collapses onto the
/// current hardware time, so that the first armed timeout finds
/// `lasttime == nexttime` and starts the alarm.
pub(crate) fn init<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    if let TickMode::Tickless { .. } = Traits::TICK_MODE {
        let now = Traits::timer_now();
        Traits::g_timeout().lasttime.replace(&mut *lock, now);
        Traits::g_timeout().nexttime.replace(&mut *lock, now);
    }
}

/// The current virtual time (I/S-class).
pub(crate) fn current_time<Traits: KernelTraits>(lock: CpuLockTokenRefMut<'_, Traits>) -> SysTime {
    match Traits::TICK_MODE {
        TickMode::Periodic => Traits::g_timeout().systime.get(&*lock),
        TickMode::Tickless { .. } => Traits::timer_now(),
    }
}

/// The current virtual time: the tick counter in the periodic discipline,
/// the free-running hardware counter in the tick-less one.
pub fn system_time<Traits: KernelTraits>() -> SysTime {
    let mut lock = klock::lock_cpu::<Traits>();
    let time = current_time::<Traits>(lock.borrow_mut());
    time
}

/// Convert seconds to ticks at the configured tick frequency.
pub fn ticks_from_secs<Traits: KernelTraits>(secs: u32) -> Ticks {
    (u64::from(secs) * u64::from(Traits::TICK_FREQUENCY)) as Ticks
}

/// Convert milliseconds to ticks at the configured tick frequency, rounding
/// up.
pub fn ticks_from_millis<Traits: KernelTraits>(millis: u32) -> Ticks {
    ((u64::from(millis) * u64::from(Traits::TICK_FREQUENCY) + 999) / 1_000) as Ticks
}

/// Convert microseconds to ticks at the configured tick frequency, rounding
/// up.
pub fn ticks_from_micros<Traits: KernelTraits>(micros: u32) -> Ticks {
    ((u64::from(micros) * u64::from(Traits::TICK_FREQUENCY) + 999_999) / 1_000_000) as Ticks
}

/// Arm the running thread's wakeup timeout on its way to sleep (I/S-class;
/// `ticks` must be nonzero).
pub(crate) fn arm_current<Traits: KernelTraits>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    ticks: Ticks,
) {
    debug_assert_ne!(ticks, 0);
    let current = Traits::state().current.get(&*lock);
    let cb = &Traits::thread_cb_pool()[current];

    match Traits::TICK_MODE {
        TickMode::Periodic => {
            cb.timeout.replace(&mut *lock, ticks);
        }
        TickMode::Tickless { min_delta } => {
            // Give the hardware enough headroom to reprogram the comparator
            // before the free-running counter passes the deadline.
            let ticks = if ticks < min_delta { min_delta } else { ticks };

            let g = Traits::g_timeout();
            let abstime = Traits::timer_now().wrapping_add(ticks);
            let lasttime = g.lasttime.get(&*lock);
            let nexttime = g.nexttime.get(&*lock);

            if lasttime == nexttime {
                // First thread asking for a timeout; the alarm is stopped.
                // Safety: CPU Lock active
                unsafe { Traits::timer_start_alarm(abstime) };
                g.nexttime.replace(&mut *lock, abstime);
            } else if time_is_in_range(abstime, lasttime, nexttime) {
                // The new deadline precedes the programmed alarm.
                // Safety: CPU Lock active
                unsafe { Traits::timer_set_alarm(abstime) };
                g.nexttime.replace(&mut *lock, abstime);
            }

            cb.timeout.replace(&mut *lock, abstime.wrapping_sub(lasttime));
        }
    }
}

/// Serve expired timeouts: the body of the tick interrupt (periodic) or of
/// the alarm interrupt (tick-less).
///
/// When [`KernelCfg::PREEMPTIBLE_TICK_SCAN`](crate::KernelCfg) is set, the
/// lock is released and re-acquired around each per-thread step so that
/// ports with preemptible interrupt handlers keep a bounded worst-case
/// latency.
pub(crate) fn handle_tick<Traits: KernelTraits>(
    lock: CpuLockIsrGuard<Traits>,
) -> CpuLockIsrGuard<Traits> {
    match Traits::TICK_MODE {
        TickMode::Periodic => handle_periodic_tick(lock),
        TickMode::Tickless { min_delta } => handle_alarm(lock, min_delta),
    }
}

fn handle_periodic_tick<Traits: KernelTraits>(
    mut lock: CpuLockIsrGuard<Traits>,
) -> CpuLockIsrGuard<Traits> {
    Traits::g_timeout()
        .systime
        .replace_with(&mut *lock, |t| t.wrapping_add(1));

    let mut index = 0;
    while index < Traits::thread_cb_pool().len() {
        let cb = &Traits::thread_cb_pool()[index];
        let remaining = cb.timeout.get(&*lock);
        if remaining > 0 {
            kassert!(
                Traits,
                !cb.st.read(&*lock).is_ready(),
                "tm: ready with timeout armed"
            );

            let remaining = remaining - 1;
            cb.timeout.replace(&mut *lock, remaining);
            if remaining == 0 {
                wake_timed_out(lock.borrow_mut(), index);
            }
        }
        index += 1;

        if Traits::PREEMPTIBLE_TICK_SCAN {
            lock = relax(lock);
        }
    }
    lock
}

fn handle_alarm<Traits: KernelTraits>(
    mut lock: CpuLockIsrGuard<Traits>,
    min_delta: Ticks,
) -> CpuLockIsrGuard<Traits> {
    let g = Traits::g_timeout();
    kassert!(
        Traits,
        g.nexttime.get(&*lock) == Traits::timer_alarm(),
        "tm: alarm mismatch"
    );

    let elapsed = g.nexttime.get(&*lock).wrapping_sub(g.lasttime.get(&*lock));
    let mut nearest: Ticks = 0;

    let mut index = 0;
    while index < Traits::thread_cb_pool().len() {
        let cb = &Traits::thread_cb_pool()[index];
        let remaining = cb.timeout.get(&*lock);
        if remaining > 0 {
            kassert!(
                Traits,
                !cb.st.read(&*lock).is_ready(),
                "tm: ready with timeout armed"
            );
            kassert!(Traits, remaining >= elapsed, "tm: deadline skipped");

            let remaining = remaining - elapsed;
            cb.timeout.replace(&mut *lock, remaining);
            if remaining == 0 {
                wake_timed_out(lock.borrow_mut(), index);
            } else if nearest == 0 || remaining < nearest {
                nearest = remaining;
            }
        }
        index += 1;

        if Traits::PREEMPTIBLE_TICK_SCAN {
            lock = relax(lock);
        }
    }

    let serviced = g.nexttime.get(&*lock);
    g.lasttime.replace(&mut *lock, serviced);
    if nearest > 0 {
        let nearest = if nearest < min_delta { min_delta } else { nearest };
        let nexttime = serviced.wrapping_add(nearest);
        g.nexttime.replace(&mut *lock, nexttime);
        // Safety: CPU Lock active
        unsafe { Traits::timer_set_alarm(nexttime) };
    } else {
        // No pending timeouts left.
        // Safety: CPU Lock active
        unsafe { Traits::timer_stop_alarm() };
    }
    lock
}

/// Deliver a timeout wakeup, undoing the side effects of the wait the thread
/// was parked in.
fn wake_timed_out<Traits: KernelTraits>(mut lock: CpuLockTokenRefMut<'_, Traits>, index: usize) {
    match Traits::thread_cb_pool()[index].st.get(&*lock) {
        ThreadSt::WaitingSemaphore(sem) => {
            // The counter was decremented when the thread went to sleep.
            sem.restore_count(lock.borrow_mut());
        }
        ThreadSt::Suspended(slot) => {
            slot.clear(lock.borrow_mut());
        }
        _ => {}
    }
    sched::ready(lock, index, Message::Timeout);
}

/// Re-open a preemption window between per-thread steps of a timer scan.
#[inline]
fn relax<Traits: KernelTraits>(lock: CpuLockIsrGuard<Traits>) -> CpuLockIsrGuard<Traits> {
    drop(lock);
    klock::lock_cpu_from_isr()
}
