//! Thread table entries and the thread-level API.
use core::cell::UnsafeCell;
use core::fmt;

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    sched, timeout,
    utils::Init,
    EventMask, KernelTraits, Message, PortThreading, Semaphore, SysTime, ThreadId, Ticks, Timeout,
};

/// Thread states, fused with the wait payload tied to each of them so that
/// only the payload matching the current state can ever be observed.
pub(crate) enum ThreadSt<Traits: PortThreading> {
    /// Runnable or running (the running one is designated by
    /// `State::current`). Holds the wakeup message consumed when the thread
    /// resumes from the scheduler.
    Ready(Message),
    /// Sleeping until the armed timeout fires, or forever.
    Sleeping,
    /// Suspended on a thread reference slot.
    Suspended(&'static ThreadRef<Traits>),
    /// Asleep on a semaphore. The counter was already decremented on the way
    /// to sleep.
    WaitingSemaphore(&'static Semaphore<Traits>),
    /// Waiting for any event in the stored interest mask.
    WaitingEvent(EventMask),
}

impl<Traits: PortThreading> ThreadSt<Traits> {
    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl<Traits: PortThreading> Clone for ThreadSt<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: PortThreading> Copy for ThreadSt<Traits> {}

impl<Traits: PortThreading> Init for ThreadSt<Traits> {
    const INIT: Self = Self::Sleeping;
}

impl<Traits: PortThreading> fmt::Debug for ThreadSt<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(msg) => f.debug_tuple("Ready").field(msg).finish(),
            Self::Sleeping => f.write_str("Sleeping"),
            Self::Suspended(_) => f.write_str("Suspended"),
            Self::WaitingSemaphore(_) => f.write_str("WaitingSemaphore"),
            Self::WaitingEvent(mask) => f.debug_tuple("WaitingEvent").field(mask).finish(),
        }
    }
}

/// *Thread control block*: one statically allocated entry of the thread
/// table. Entries never move and are never created or destroyed after boot.
pub struct ThreadCb<Traits: PortThreading> {
    /// Port-owned saved context. Only the port reads or writes this.
    pub port_context: Traits::PortContext,

    /// Current state, fused with the wait payload belonging to it.
    pub(crate) st: CpuLockCell<Traits, ThreadSt<Traits>>,

    /// Ticks remaining before a forced wakeup; zero when no timeout is
    /// armed. In the tick-less discipline the value is relative to the last
    /// alarm service time.
    pub(crate) timeout: CpuLockCell<Traits, Ticks>,

    /// Events signaled to this thread and not yet consumed. Persists across
    /// state transitions.
    pub(crate) pending_events: CpuLockCell<Traits, EventMask>,
}

impl<Traits: PortThreading> Init for ThreadCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        port_context: Init::INIT,
        st: Init::INIT,
        timeout: Init::INIT,
        pending_events: Init::INIT,
    };
}

impl<Traits: PortThreading> fmt::Debug for ThreadCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("self", &(self as *const _))
            .field("st", &self.st)
            .field("timeout", &self.timeout)
            .field("pending_events", &self.pending_events)
            .finish()
    }
}

/// Static configuration of one thread-table slot.
pub struct ThreadAttr {
    /// Thread name, for diagnostics.
    pub name: &'static str,
    /// Entry function; `None` only for the idle slot.
    pub entry: Option<fn(usize)>,
    /// Argument passed to the entry function.
    pub param: usize,
    /// Stack region handed to the port's context initializer.
    pub stack: StackRegion,
}

impl ThreadAttr {
    /// The attribute of the implicit idle slot. The idle thread inherits the
    /// boot context and stack.
    pub const fn idle() -> Self {
        Self {
            name: "idle",
            entry: None,
            param: 0,
            stack: StackRegion::empty(),
        }
    }
}

/// Statically allocated stack memory for one thread.
#[repr(align(16))]
pub struct Stack<const LEN: usize>(UnsafeCell<[u8; LEN]>);

// Safety: the contained memory is only accessed by the port's context
// initializer and by the one thread running on it.
unsafe impl<const LEN: usize> Sync for Stack<LEN> {}

impl<const LEN: usize> Stack<LEN> {
    pub const fn new() -> Self {
        Self(UnsafeCell::new([0; LEN]))
    }

    /// The base/extent view passed to the port.
    pub const fn region(&'static self) -> StackRegion {
        StackRegion {
            base: self.0.get() as *mut u8,
            len: LEN,
        }
    }
}

/// Base and extent of a thread's stack memory.
#[derive(Clone, Copy, Debug)]
pub struct StackRegion {
    pub base: *mut u8,
    pub len: usize,
}

// Safety: the region is a plain description; only the port dereferences it.
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl StackRegion {
    pub const fn empty() -> Self {
        Self {
            base: core::ptr::null_mut(),
            len: 0,
        }
    }
}

/// A one-slot indirection used to suspend the calling thread and let another
/// party resume it with a message, without either side knowing the other's
/// identity beyond the slot itself.
///
/// At most one thread can be suspended on a given slot at a time.
pub struct ThreadRef<Traits> {
    slot: CpuLockCell<Traits, Option<usize>>,
}

impl<Traits> ThreadRef<Traits> {
    pub const fn new() -> Self {
        Self {
            slot: CpuLockCell::new(None),
        }
    }
}

impl<Traits> Init for ThreadRef<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: PortThreading> ThreadRef<Traits> {
    /// Disarm the slot on a timed-out wakeup.
    pub(crate) fn clear(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        self.slot.replace(&mut *lock, None);
    }

    #[cfg(test)]
    pub(crate) fn stage_occupant(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        index: usize,
    ) {
        self.slot.replace(&mut *lock, Some(index));
    }
}

impl<Traits: KernelTraits> ThreadRef<Traits> {
    /// Suspend the calling thread on this slot until another party calls
    /// [`resume`](Self::resume), or until `timeout` elapses.
    ///
    /// Returns the message passed to `resume`, or [`Message::Timeout`]. The
    /// slot is empty again by the time either happens.
    pub fn suspend(&'static self, timeout: Timeout) -> Message {
        let mut lock = klock::lock_cpu::<Traits>();
        sched::expect_waitable_context::<Traits>();
        kassert!(Traits, self.slot.get(&*lock).is_none(), "thd: slot occupied");

        if let Timeout::Immediate = timeout {
            return Message::Timeout;
        }

        let current = Traits::state().current.get(&*lock);
        self.slot.replace(&mut *lock, Some(current));
        let (lock, msg) = sched::go_to_sleep(lock, ThreadSt::Suspended(self), timeout);
        drop(lock);
        msg
    }

    /// Wake up the thread suspended on this slot, if any, delivering `msg`.
    /// The switch to the woken thread happens before this returns.
    pub fn resume(&'static self, msg: Message) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.resume_locked(lock.borrow_mut(), msg);
        drop(sched::reschedule_locked(lock));
    }

    /// [`resume`](Self::resume) for interrupt handlers; the switch is left
    /// to the interrupt epilogue.
    pub fn resume_from_isr(&'static self, msg: Message) {
        let mut lock = klock::lock_cpu_from_isr::<Traits>();
        self.resume_locked(lock.borrow_mut(), msg);
    }

    pub(crate) fn resume_locked(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        msg: Message,
    ) {
        if let Some(index) = self.slot.get(&*lock) {
            let Some(cb) = Traits::thread_cb(index) else {
                Traits::halt("thd: slot index out of range")
            };
            kassert!(
                Traits,
                matches!(cb.st.read(&*lock), ThreadSt::Suspended(_)),
                "thd: not suspended"
            );
            self.slot.replace(&mut *lock, None);
            sched::ready(lock, index, msg);
        }
    }

    /// Whether a thread is currently suspended on this slot.
    pub fn is_occupied(&'static self) -> bool {
        let lock = klock::lock_cpu::<Traits>();
        let occupied = self.slot.get(&*lock).is_some();
        occupied
    }
}

/// Suspend the calling thread for the given number of ticks. A zero count
/// sleeps forever.
pub fn sleep<Traits: KernelTraits>(ticks: Ticks) {
    let lock = klock::lock_cpu::<Traits>();
    sched::expect_waitable_context::<Traits>();
    let timeout = if ticks == 0 {
        Timeout::Infinite
    } else {
        Timeout::After(ticks)
    };
    let (lock, _) = sched::go_to_sleep(lock, ThreadSt::Sleeping, timeout);
    drop(lock);
}

/// Suspend the calling thread until the virtual time reaches `abstime`.
/// Returns immediately if it already has.
pub fn sleep_until<Traits: KernelTraits>(abstime: SysTime) {
    let mut lock = klock::lock_cpu::<Traits>();
    sched::expect_waitable_context::<Traits>();
    let now = timeout::current_time::<Traits>(lock.borrow_mut());
    let delta = abstime.wrapping_sub(now);
    if delta == 0 {
        return;
    }
    let (lock, _) = sched::go_to_sleep(lock, ThreadSt::Sleeping, Timeout::After(delta));
    drop(lock);
}

/// The table index of the calling thread.
pub fn current_thread<Traits: KernelTraits>() -> ThreadId {
    let lock = klock::lock_cpu::<Traits>();
    let index = Traits::state().current.get(&*lock);
    ThreadId::new(index)
}

/// Borrow the opaque extension payload of the given thread slot. The kernel
/// never touches these payloads; their type is chosen in [`build!`].
///
/// [`build!`]: crate::build
pub fn thread_ext<Traits: KernelTraits>(thread: ThreadId) -> &'static Traits::ThreadExt {
    match Traits::thread_ext_pool().get(thread.get()) {
        Some(ext) => ext,
        None => Traits::halt("thd: thread index out of range"),
    }
}
