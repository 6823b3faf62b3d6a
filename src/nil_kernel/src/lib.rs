//! A static-footprint real-time kernel for deeply resource-constrained
//! targets.
//!
//! The full set of threads is fixed at build time: the kernel operates on a
//! statically allocated thread table ordered by descending priority, uses a
//! linear ready-scan in place of a priority queue, and performs exactly one
//! stack switch per scheduling decision. There is no heap, no dynamic thread
//! creation, and no unbounded data structure anywhere in the kernel.
//!
//! # Static configuration
//!
//! An application attaches a port to a *system type* with the port's
//! `use_port!` macro and then instantiates the kernel for it with [`build!`]:
//!
//! ```ignore
//! nil_port_std::use_port!(unsafe struct SystemTraits);
//!
//! static BLINK_STACK: nil_kernel::Stack<1024> = nil_kernel::Stack::new();
//!
//! nil_kernel::build! {
//!     system: SystemTraits,
//!     tick_mode: nil_kernel::TickMode::Periodic,
//!     threads: [
//!         { name: "blink", entry: blink, param: 0, stack: &BLINK_STACK },
//!     ],
//! }
//! ```
//!
//! Configuration mistakes (no threads, an invalid tick-less delta, a thread
//! count the linear scheduler cannot sensibly serve) are compile-time errors.
//!
//! # Calling-context conventions
//!
//! Ordinary API functions assume the kernel lock is not held and acquire it
//! internally. Functions suffixed `_from_isr` are meant for interrupt
//! handlers running at the kernel interrupt level; they never perform a
//! context switch themselves, leaving it to the interrupt epilogue
//! ([`PortToKernel::is_preemption_required`] followed by [`reschedule`]).
//! Blocking operations are only legal in thread context; calling one from an
//! interrupt handler is a contract violation and halts the system.
#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

/// Runtime invariant check. Compiled out when the configuration disables
/// assertions; a failed check halts the system with the given tag.
macro_rules! kassert {
    ($Traits:ty, $cond:expr, $tag:expr) => {
        if <$Traits as $crate::KernelCfg>::ASSERTIONS && !$cond {
            <$Traits as $crate::PortThreading>::halt($tag);
        }
    };
}

#[cfg(test)]
#[macro_use]
mod test_utils;

mod cfg;
mod klock;
mod sched;
mod semaphore;
mod thread;
mod timeout;

pub mod event;
pub mod utils;

pub use self::{
    sched::reschedule,
    semaphore::Semaphore,
    thread::{
        current_thread, sleep, sleep_until, thread_ext, Stack, StackRegion, ThreadAttr, ThreadCb,
        ThreadRef,
    },
    timeout::{
        system_time, ticks_from_micros, ticks_from_millis, ticks_from_secs, time_is_in_range,
    },
};

use crate::{thread::ThreadSt, utils::Init};

/// Integer type used to measure spans of virtual time, in ticks.
pub type Ticks = u32;

/// Wrapping absolute virtual time, in ticks.
pub type SysTime = u32;

/// Bitmask of per-thread event flags.
pub type EventMask = u32;

/// Signed counter type used by [`Semaphore`].
pub type SemCount = i32;

/// Upper bound on the configurable thread count. The kernel's O(n) table
/// scans stop being a sensible trade-off above this.
pub const MAX_THREADS: usize = 32;

/// Identifies a thread by its index in the thread table.
///
/// The table is ordered by strictly descending static priority, so a smaller
/// index always denotes a higher priority. The index one past the last
/// application thread denotes the idle thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ThreadId(usize);

impl ThreadId {
    /// Construct a `ThreadId` from a table index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// The table index.
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Wakeup message delivered to a thread when it leaves a waiting state.
///
/// Expected outcomes of blocking operations are reported through this type;
/// they are never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// The wait condition was satisfied normally.
    Ok,
    /// The wait timed out.
    Timeout,
    /// The waited-on object was reset while the thread was asleep.
    Reset,
    /// User-defined payload, delivered through [`ThreadRef::resume`].
    Custom(i32),
}

/// Relative timeout accepted by blocking operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Do not block: if the operation would wait, give up immediately.
    Immediate,
    /// Block for at most the given number of ticks. A zero count is
    /// equivalent to [`Timeout::Infinite`].
    After(Ticks),
    /// Block until explicitly woken.
    Infinite,
}

/// Timing discipline, chosen at configuration time.
///
/// Both disciplines deliver the same observable timeout behavior; they differ
/// in the interrupt load they place on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickMode {
    /// A fixed-frequency tick interrupt; every pending timeout is counted
    /// down on each tick.
    Periodic,
    /// No periodic interrupt; a hardware alarm comparator is programmed to
    /// the nearest pending deadline. `min_delta` is the smallest interval the
    /// hardware can reliably be reprogrammed within and must be at least 2.
    Tickless {
        /// Minimum safety delta, in ticks.
        min_delta: Ticks,
    },
}

impl TickMode {
    /// Whether the configuration is accepted. Used by the static checks
    /// emitted by [`build!`].
    pub const fn is_valid(self) -> bool {
        match self {
            TickMode::Periodic => true,
            // A delta below 2 cannot be met by real comparator hardware.
            TickMode::Tickless { min_delta } => min_delta >= 2,
        }
    }
}

/// Implemented by a port. Provides the architecture-specific mechanisms the
/// kernel core is built on: interrupt masking, context switching, and the
/// fatal-error sink.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because the kernel trusts it to
/// provide real mutual exclusion and correct register-level context handling.
/// These methods are only meant to be called by the kernel.
pub unsafe trait PortThreading: Sized + 'static {
    /// Port-owned saved-context block embedded in every thread control block.
    /// The kernel stores it but never interprets it.
    type PortContext: Init + Send + Sync + 'static;

    /// One-time hardware initialization, invoked by [`PortToKernel::boot`]
    /// before the scheduler starts.
    unsafe fn port_init();

    /// Raise the interrupt mask to the kernel critical level.
    ///
    /// Precondition: CPU Lock inactive.
    unsafe fn enter_cpu_lock();

    /// Lower the interrupt mask, deactivating the CPU Lock state.
    ///
    /// Precondition: CPU Lock active.
    unsafe fn leave_cpu_lock();

    /// The variant of [`Self::enter_cpu_lock`] usable inside an interrupt
    /// handler running at or below the kernel interrupt level.
    unsafe fn enter_cpu_lock_from_isr() {
        unsafe { Self::enter_cpu_lock() }
    }

    /// The counterpart of [`Self::enter_cpu_lock_from_isr`].
    unsafe fn leave_cpu_lock_from_isr() {
        unsafe { Self::leave_cpu_lock() }
    }

    /// Return a flag indicating whether CPU Lock is currently active.
    fn is_cpu_lock_active() -> bool;

    /// Return a flag indicating whether the calling context is an interrupt
    /// handler. Consumed by context checks and by OS-adapter layers.
    fn is_interrupt_context() -> bool;

    /// Initialize `thread`'s saved context so that the first switch into it
    /// starts executing `attr.entry` with `attr.param`, with CPU Lock
    /// released on entry.
    ///
    /// Precondition: CPU Lock active; `thread` has never run.
    unsafe fn setup_context(thread: &'static ThreadCb<Self>, attr: &'static ThreadAttr);

    /// Save the full register context of `previous`, restore that of `next`,
    /// and transfer control. Returns when `previous` is scheduled again.
    ///
    /// Precondition: CPU Lock active. The lock is logically handed over to
    /// `next` and handed back when `previous` resumes; it is never released
    /// across the switch.
    unsafe fn context_switch(next: &'static ThreadCb<Self>, previous: &'static ThreadCb<Self>);

    /// Handle an unrecoverable kernel error. `reason` is a short tag naming
    /// the violated check and call site; it must remain reachable by a
    /// debugger or panic hook. Must not return.
    fn halt(reason: &'static str) -> !;
}

/// Hardware timer services consumed by the tick-less timing discipline.
///
/// Ports that only support [`TickMode::Periodic`] can rely on the default
/// method bodies; the kernel never calls them unless [`TickMode::Tickless`]
/// is configured.
///
/// # Safety
///
/// Only meant to be called by the kernel, with CPU Lock active.
pub unsafe trait PortTimer: Sized + 'static {
    /// Current value of the free-running counter.
    fn timer_now() -> SysTime {
        panic!("tick-less timer not supported by this port")
    }

    /// Program the alarm comparator. The alarm must already be running.
    unsafe fn timer_set_alarm(_at: SysTime) {
        panic!("tick-less timer not supported by this port")
    }

    /// Start the alarm comparator.
    unsafe fn timer_start_alarm(_at: SysTime) {
        panic!("tick-less timer not supported by this port")
    }

    /// Stop the alarm comparator.
    unsafe fn timer_stop_alarm() {
        panic!("tick-less timer not supported by this port")
    }

    /// The currently programmed alarm time. Diagnostic use only.
    fn timer_alarm() -> SysTime {
        panic!("tick-less timer not supported by this port")
    }
}

/// Associates a system type with its static configuration. Implemented by
/// [`build!`].
///
/// # Safety
///
/// Only meant to be implemented by `build!`, which instantiates every table
/// consistently.
pub unsafe trait KernelCfg: PortThreading + Sized + 'static {
    /// Opaque per-thread payload reserved for the application; the kernel
    /// allocates one per thread slot but never interprets it.
    type ThreadExt: utils::Init + Send + Sync + 'static;

    /// The number of application threads, not counting the idle thread.
    const NUM_THREADS: usize;

    /// The timing discipline.
    const TICK_MODE: TickMode;

    /// Nominal tick frequency in hertz, used by the time-conversion helpers.
    const TICK_FREQUENCY: Ticks;

    /// Whether kernel invariants are checked at runtime. A violated check
    /// halts the system through [`PortThreading::halt`].
    const ASSERTIONS: bool;

    /// Whether the timer handler re-opens a preemption window between
    /// per-thread steps of its scan, bounding worst-case interrupt latency on
    /// ports with nested interrupts.
    const PREEMPTIBLE_TICK_SCAN: bool;

    /// The kernel's global state.
    fn state() -> &'static State<Self>;

    /// The thread table: `NUM_THREADS` application slots in descending
    /// priority order, followed by the idle slot.
    fn thread_cb_pool() -> &'static [ThreadCb<Self>];

    /// Static attributes matching [`Self::thread_cb_pool`] slot for slot.
    fn thread_attr_pool() -> &'static [ThreadAttr];

    /// Per-thread extension payloads matching [`Self::thread_cb_pool`] slot
    /// for slot.
    fn thread_ext_pool() -> &'static [Self::ThreadExt];

    #[doc(hidden)]
    #[inline(always)]
    fn thread_cb(index: usize) -> Option<&'static ThreadCb<Self>> {
        Self::thread_cb_pool().get(index)
    }
}

/// Represents "system" types having sufficient trait `impl`s to instantiate
/// the kernel.
pub trait KernelTraits: PortThreading + PortTimer + KernelCfg {}
impl<T: PortThreading + PortTimer + KernelCfg> KernelTraits for T {}

/// Global mutable kernel state. One instance per system type, created by
/// [`build!`].
pub struct State<Traits: PortThreading> {
    /// Table index of the running thread.
    pub(crate) current: klock::CpuLockCell<Traits, usize>,
    /// Table index of the thread to run next. Never refers to a
    /// lower-priority thread than the one picked by the last ready-scan.
    pub(crate) next: klock::CpuLockCell<Traits, usize>,
    /// Timekeeping state shared by both timing disciplines.
    pub(crate) timeout: timeout::TimeoutGlobals<Traits>,
}

impl<Traits: PortThreading> Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        current: Init::INIT,
        next: Init::INIT,
        timeout: Init::INIT,
    };
}

/// Methods intended to be called by a port's startup and interrupt glue.
///
/// # Safety
///
/// Only meant to be called by the port, from the contexts stated on each
/// method.
pub trait PortToKernel {
    /// Initialize the kernel and start the configured threads. The calling
    /// flow of control becomes the idle thread: this function returns once
    /// every configured thread has blocked, and from then on the caller must
    /// never invoke an operation able to block.
    ///
    /// Precondition: CPU Lock active (the port enters it before calling).
    /// Postcondition: CPU Lock inactive.
    unsafe fn boot();

    /// The body of the tick interrupt handler (periodic discipline) or of
    /// the alarm interrupt handler (tick-less discipline).
    ///
    /// Precondition: interrupt context, CPU Lock inactive.
    unsafe fn timer_tick();

    /// Check whether an interrupt handler readied a thread that outranks the
    /// interrupted one. The interrupt epilogue must arrange a context switch
    /// whenever this returns `true`.
    ///
    /// Precondition: CPU Lock inactive.
    unsafe fn is_preemption_required() -> bool;
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() {
        // Safety: boot is the designated caller of `port_init`
        unsafe { Traits::port_init() };

        // Safety: the caller entered CPU Lock
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        // The boot flow of control becomes the idle thread, which may change
        // after the first reschedule. The idle slot is always ready.
        let idle = Traits::NUM_THREADS;
        let state = Traits::state();
        state.current.replace(&mut *lock, idle);
        state.next.replace(&mut *lock, idle);
        Traits::thread_cb_pool()[idle]
            .st
            .replace(&mut *lock, ThreadSt::Ready(Message::Ok));

        timeout::init(lock.borrow_mut());

        // Start every configured thread.
        for index in 0..Traits::NUM_THREADS {
            let cb = &Traits::thread_cb_pool()[index];
            let attr = &Traits::thread_attr_pool()[index];
            // Safety: CPU Lock is active and `cb` has never run
            unsafe { Traits::setup_context(cb, attr) };
            sched::ready(lock.borrow_mut(), index, Message::Ok);
        }

        // Starting the dance.
        let lock = sched::reschedule_locked(lock);
        drop(lock);
    }

    unsafe fn timer_tick() {
        let lock = klock::lock_cpu_from_isr::<Traits>();
        let lock = timeout::handle_tick(lock);
        drop(lock);
    }

    unsafe fn is_preemption_required() -> bool {
        let lock = klock::lock_cpu_from_isr::<Traits>();
        let state = Traits::state();
        let required = state.next.get(&*lock) != state.current.get(&*lock);
        drop(lock);
        required
    }
}
