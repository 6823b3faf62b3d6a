//! Simulation environment for running the Nil kernel on a hosted target.
//!
//! Each kernel thread is backed by an OS thread parked on a condition
//! variable; a context switch wakes the target and parks the caller, so at
//! most one backing thread executes kernel or application code at any
//! moment, preserving the kernel's single-core model. CPU Lock is a real
//! mutual-exclusion primitive: a simulated interrupt handler trying to enter
//! it while a thread is inside a critical section blocks, exactly like a
//! masked interrupt stays pending.
//!
//! The port also provides a virtual free-running counter with an alarm
//! comparator, so both timing disciplines can be driven deterministically
//! from a test: [`tick`] delivers one periodic tick interrupt, and
//! [`advance_time`] steps the counter, firing the alarm interrupt at every
//! comparator match on the way.
//!
//! Interrupt preemption is simulated at thread-context scheduling points:
//! the interrupt epilogue performs the deferred switch on the driving
//! thread, which by construction is the idle thread. Control comes back to
//! the driver once every woken thread has blocked again.
#![deny(unsafe_op_in_unsafe_fn)]
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use nil_kernel::{
    utils::Init, KernelTraits, PortThreading, PortToKernel, SysTime, ThreadAttr, ThreadCb, Ticks,
};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate nil_kernel;

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by `use_port!`.
pub unsafe trait PortInstance: KernelTraits + PortThreading<PortContext = ThreadContext> {
    fn port_state() -> &'static State;
}

/// Per-thread port context: the parking spot of the backing OS thread.
pub struct ThreadContext {
    resumed: Mutex<bool>,
    wakeup: Condvar,
    spawned: AtomicBool,
}

impl Init for ThreadContext {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        resumed: Mutex::new(false),
        wakeup: Condvar::new(),
        spawned: AtomicBool::new(false),
    };
}

/// The internal state of the port. One instance per system type, created by
/// [`use_port!`].
pub struct State {
    /// The CPU Lock flag; `true` while some context holds the lock.
    cpu_lock: Mutex<bool>,
    cpu_lock_released: Condvar,
    /// The virtual free-running counter and alarm comparator.
    clock: Mutex<Clock>,
}

#[derive(Clone, Copy, Debug)]
struct Clock {
    now: SysTime,
    /// Programmed comparator value while the alarm is running.
    alarm: Option<SysTime>,
}

impl State {
    pub const fn new() -> Self {
        Self {
            cpu_lock: Mutex::new(false),
            cpu_lock_released: Condvar::new(),
            clock: Mutex::new(Clock {
                now: 0,
                alarm: None,
            }),
        }
    }
}

thread_local! {
    /// Whether the current OS thread is simulating an interrupt handler.
    static IN_ISR: Cell<bool> = const { Cell::new(false) };
}

#[doc(hidden)]
pub fn enter_cpu_lock<Traits: PortInstance>() {
    let state = Traits::port_state();
    let mut locked = state.cpu_lock.lock().unwrap();
    while *locked {
        locked = state.cpu_lock_released.wait(locked).unwrap();
    }
    *locked = true;
}

#[doc(hidden)]
pub fn leave_cpu_lock<Traits: PortInstance>() {
    let state = Traits::port_state();
    let mut locked = state.cpu_lock.lock().unwrap();
    debug_assert!(*locked);
    *locked = false;
    drop(locked);
    state.cpu_lock_released.notify_one();
}

#[doc(hidden)]
pub fn is_cpu_lock_active<Traits: PortInstance>() -> bool {
    *Traits::port_state().cpu_lock.lock().unwrap()
}

#[doc(hidden)]
pub fn is_interrupt_context() -> bool {
    IN_ISR.with(|flag| flag.get())
}

#[doc(hidden)]
pub fn setup_context<Traits: PortInstance>(
    cb: &'static ThreadCb<Traits>,
    attr: &'static ThreadAttr,
) {
    // The backing thread outlives the test that booted the kernel; spawning
    // twice would mean the kernel re-ran boot, which it never does.
    let already_spawned = cb.port_context.spawned.swap(true, Ordering::Relaxed);
    assert!(!already_spawned, "thread slot is already backed");

    let entry = attr.entry.expect("the idle slot has no entry function");
    let param = attr.param;
    std::thread::Builder::new()
        .name(attr.name.to_owned())
        .spawn(move || thread_main::<Traits>(cb, entry, param))
        .expect("failed to spawn a backing thread");
}

fn thread_main<Traits: PortInstance>(
    cb: &'static ThreadCb<Traits>,
    entry: fn(usize),
    param: usize,
) {
    park_until_resumed(&cb.port_context);

    // The first switch into a thread leaves CPU Lock active, exactly like
    // resuming one that slept. A real port's context initializer builds a
    // frame that drops to thread level on entry; here that means releasing
    // the lock before the entry function runs.
    leave_cpu_lock::<Traits>();

    log::trace!("{}: started", thread_name());
    entry(param);

    // The kernel has no thread-exit primitive; an entry function that
    // returns is treated as if it had gone to sleep forever.
    log::warn!("{}: entry function returned; sleeping forever", thread_name());
    loop {
        nil_kernel::sleep::<Traits>(0);
    }
}

fn thread_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("<unnamed>")
        .to_owned()
}

fn park_until_resumed(context: &ThreadContext) {
    let mut resumed = context.resumed.lock().unwrap();
    while !*resumed {
        resumed = context.wakeup.wait(resumed).unwrap();
    }
    *resumed = false;
}

#[doc(hidden)]
pub fn context_switch<Traits: PortInstance>(
    next: &'static ThreadCb<Traits>,
    previous: &'static ThreadCb<Traits>,
) {
    log::trace!("{}: switching away", thread_name());
    {
        let mut resumed = next.port_context.resumed.lock().unwrap();
        *resumed = true;
        next.port_context.wakeup.notify_one();
    }
    park_until_resumed(&previous.port_context);
    log::trace!("{}: resumed", thread_name());
}

#[doc(hidden)]
pub fn timer_now<Traits: PortInstance>() -> SysTime {
    Traits::port_state().clock.lock().unwrap().now
}

#[doc(hidden)]
pub fn timer_set_alarm<Traits: PortInstance>(at: SysTime) {
    let mut clock = Traits::port_state().clock.lock().unwrap();
    debug_assert!(clock.alarm.is_some(), "set_alarm while the alarm is stopped");
    clock.alarm = Some(at);
}

#[doc(hidden)]
pub fn timer_start_alarm<Traits: PortInstance>(at: SysTime) {
    let mut clock = Traits::port_state().clock.lock().unwrap();
    debug_assert!(clock.alarm.is_none(), "start_alarm while the alarm is running");
    clock.alarm = Some(at);
}

#[doc(hidden)]
pub fn timer_stop_alarm<Traits: PortInstance>() {
    Traits::port_state().clock.lock().unwrap().alarm = None;
}

#[doc(hidden)]
pub fn timer_alarm<Traits: PortInstance>() -> SysTime {
    Traits::port_state()
        .clock
        .lock()
        .unwrap()
        .alarm
        .expect("alarm is stopped")
}

/// Boot the kernel on the calling OS thread, which becomes the idle thread.
///
/// Returns once every configured thread has blocked. From then on the caller
/// drives the system: it may invoke non-blocking kernel operations and the
/// interrupt simulation helpers, but never a blocking one.
pub fn boot_kernel<Traits: PortInstance>() {
    let _ = env_logger::Builder::from_default_env().try_init();
    enter_cpu_lock::<Traits>();
    // Safety: CPU Lock is active and this is the environment's one boot call
    unsafe { <Traits as PortToKernel>::boot() };
}

/// Run `f` as a simulated interrupt handler at the kernel interrupt level,
/// then perform the deferred reschedule an interrupt epilogue would perform.
///
/// Must be called from the thread that booted the kernel, while it is the
/// running (idle) thread.
pub fn with_isr<Traits: PortInstance>(f: impl FnOnce()) {
    IN_ISR.with(|flag| flag.set(true));
    f();
    IN_ISR.with(|flag| flag.set(false));

    // Interrupt epilogue: switch if the handler readied a thread that
    // outranks the interrupted (idle) one.
    // Safety: CPU Lock inactive, thread context
    if unsafe { <Traits as PortToKernel>::is_preemption_required() } {
        nil_kernel::reschedule::<Traits>();
    }
}

/// Deliver one periodic tick interrupt.
pub fn tick<Traits: PortInstance>() {
    // Safety: called from a simulated interrupt context with CPU Lock
    // inactive
    with_isr::<Traits>(|| unsafe { <Traits as PortToKernel>::timer_tick() });
}

/// Advance the virtual hardware counter by `span` ticks, delivering the
/// alarm interrupt at every comparator match on the way (tick-less
/// discipline).
pub fn advance_time<Traits: PortInstance>(span: Ticks) {
    let state = Traits::port_state();
    let mut remaining = span;
    loop {
        let fired = {
            let mut clock = state.clock.lock().unwrap();
            match clock.alarm {
                Some(at) => {
                    let distance = at.wrapping_sub(clock.now);
                    if distance <= remaining {
                        clock.now = at;
                        remaining -= distance;
                        true
                    } else {
                        clock.now = clock.now.wrapping_add(remaining);
                        false
                    }
                }
                None => {
                    clock.now = clock.now.wrapping_add(remaining);
                    false
                }
            }
        };
        if !fired {
            break;
        }
        // Safety: see `tick`
        with_isr::<Traits>(|| unsafe { <Traits as PortToKernel>::timer_tick() });
    }
}

/// The current value of the virtual free-running counter.
pub fn now<Traits: PortInstance>() -> SysTime {
    timer_now::<Traits>()
}

/// Define a system type and attach this port to it.
#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $Traits:ident) => {
        $vis struct $Traits;

        // Safety: `State::new()` yields a fresh port state for this system
        // type, and every trait method forwards to this crate's
        // implementation.
        unsafe impl $crate::PortInstance for $Traits {
            fn port_state() -> &'static $crate::State {
                static STATE: $crate::State = $crate::State::new();
                &STATE
            }
        }

        unsafe impl $crate::nil_kernel::PortThreading for $Traits {
            type PortContext = $crate::ThreadContext;

            unsafe fn port_init() {}

            unsafe fn enter_cpu_lock() {
                $crate::enter_cpu_lock::<Self>();
            }

            unsafe fn leave_cpu_lock() {
                $crate::leave_cpu_lock::<Self>();
            }

            fn is_cpu_lock_active() -> bool {
                $crate::is_cpu_lock_active::<Self>()
            }

            fn is_interrupt_context() -> bool {
                $crate::is_interrupt_context()
            }

            unsafe fn setup_context(
                thread: &'static $crate::nil_kernel::ThreadCb<Self>,
                attr: &'static $crate::nil_kernel::ThreadAttr,
            ) {
                $crate::setup_context::<Self>(thread, attr);
            }

            unsafe fn context_switch(
                next: &'static $crate::nil_kernel::ThreadCb<Self>,
                previous: &'static $crate::nil_kernel::ThreadCb<Self>,
            ) {
                $crate::context_switch::<Self>(next, previous);
            }

            fn halt(reason: &'static str) -> ! {
                panic!("kernel halted: {}", reason);
            }
        }

        unsafe impl $crate::nil_kernel::PortTimer for $Traits {
            fn timer_now() -> $crate::nil_kernel::SysTime {
                $crate::timer_now::<Self>()
            }

            unsafe fn timer_set_alarm(at: $crate::nil_kernel::SysTime) {
                $crate::timer_set_alarm::<Self>(at);
            }

            unsafe fn timer_start_alarm(at: $crate::nil_kernel::SysTime) {
                $crate::timer_start_alarm::<Self>(at);
            }

            unsafe fn timer_stop_alarm() {
                $crate::timer_stop_alarm::<Self>();
            }

            fn timer_alarm() -> $crate::nil_kernel::SysTime {
                $crate::timer_alarm::<Self>()
            }
        }
    };
}
