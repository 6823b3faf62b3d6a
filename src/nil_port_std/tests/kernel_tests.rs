//! End-to-end kernel scenarios running on the hosted simulation port.
//!
//! Each module instantiates its own system type, so the scenarios are fully
//! isolated from each other. The `#[test]` function boots the kernel on the
//! test thread (which becomes the idle thread) and then drives interrupts
//! and I-class operations from there.
use std::sync::Mutex;

mod semaphore_wakeup_order {
    use super::*;
    use nil_kernel::{Message, Semaphore, Stack, Timeout};

    nil_port_std::use_port!(unsafe struct System);

    static SEM: Semaphore<System> = Semaphore::new(0);
    static TRACE: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static WAITER_STACK: Stack<4096> = Stack::new();
    static SIGNALER_STACK: Stack<4096> = Stack::new();

    fn waiter(_: usize) {
        TRACE.lock().unwrap().push("waiter: waiting");
        let msg = SEM.wait(Timeout::Infinite);
        assert_eq!(msg, Message::Ok);
        TRACE.lock().unwrap().push("waiter: woken");
        nil_kernel::sleep::<System>(0);
    }

    fn signaler(_: usize) {
        TRACE.lock().unwrap().push("signaler: signaling");
        SEM.signal();
        TRACE.lock().unwrap().push("signaler: done");
        nil_kernel::sleep::<System>(0);
    }

    nil_kernel::build! {
        system: System,
        tick_mode: nil_kernel::TickMode::Periodic,
        threads: [
            { name: "waiter", entry: waiter, param: 0, stack: &WAITER_STACK },
            { name: "signaler", entry: signaler, param: 0, stack: &SIGNALER_STACK },
        ],
    }

    /// A signal hands the processor to the higher-priority waiter before the
    /// signaling thread continues.
    #[test]
    fn signal_preempts_in_favor_of_the_waiter() {
        nil_port_std::boot_kernel::<System>();
        assert_eq!(
            TRACE.lock().unwrap().as_slice(),
            [
                "waiter: waiting",
                "signaler: signaling",
                "waiter: woken",
                "signaler: done",
            ]
        );
    }
}

mod timeout_wakeup {
    use super::*;
    use nil_kernel::{Message, Stack, ThreadRef, Timeout};

    nil_port_std::use_port!(unsafe struct System);

    static SLOT: ThreadRef<System> = ThreadRef::new();
    static WAKEUPS: Mutex<Vec<Message>> = Mutex::new(Vec::new());
    static SLEEPER_STACK: Stack<4096> = Stack::new();

    fn sleeper(_: usize) {
        let msg = SLOT.suspend(Timeout::After(5));
        WAKEUPS.lock().unwrap().push(msg);
        nil_kernel::sleep::<System>(0);
    }

    nil_kernel::build! {
        system: System,
        tick_mode: nil_kernel::TickMode::Periodic,
        threads: [
            { name: "sleeper", entry: sleeper, param: 0, stack: &SLEEPER_STACK },
        ],
    }

    /// A five-tick timeout fires on exactly the fifth tick, not before.
    #[test]
    fn exact_tick_count_wakes_the_sleeper() {
        nil_port_std::boot_kernel::<System>();

        for _ in 0..4 {
            nil_port_std::tick::<System>();
        }
        assert!(WAKEUPS.lock().unwrap().is_empty());
        assert!(SLOT.is_occupied());

        nil_port_std::tick::<System>();
        assert_eq!(WAKEUPS.lock().unwrap().as_slice(), [Message::Timeout]);
        assert!(!SLOT.is_occupied());
        assert_eq!(nil_kernel::system_time::<System>(), 5);
    }
}

mod semaphore_permit_accounting {
    use super::*;
    use nil_kernel::{Message, Semaphore, Stack, Timeout};

    nil_port_std::use_port!(unsafe struct System);

    static SEM: Semaphore<System> = Semaphore::new(2);
    static TRACE: Mutex<Vec<(usize, Message)>> = Mutex::new(Vec::new());
    static STACK0: Stack<4096> = Stack::new();
    static STACK1: Stack<4096> = Stack::new();
    static STACK2: Stack<4096> = Stack::new();

    fn contender(id: usize) {
        let msg = SEM.wait(Timeout::Infinite);
        TRACE.lock().unwrap().push((id, msg));
        nil_kernel::sleep::<System>(0);
    }

    nil_kernel::build! {
        system: System,
        tick_mode: nil_kernel::TickMode::Periodic,
        threads: [
            { name: "c0", entry: contender, param: 0, stack: &STACK0 },
            { name: "c1", entry: contender, param: 1, stack: &STACK1 },
            { name: "c2", entry: contender, param: 2, stack: &STACK2 },
        ],
    }

    /// Two permits satisfy the first two contenders immediately; the third
    /// blocks until a signal arrives and is then the only one woken.
    #[test]
    fn third_contender_blocks_until_signaled() {
        nil_port_std::boot_kernel::<System>();

        assert_eq!(
            TRACE.lock().unwrap().as_slice(),
            [(0, Message::Ok), (1, Message::Ok)]
        );
        assert_eq!(SEM.count(), -1);

        SEM.signal();
        assert_eq!(
            TRACE.lock().unwrap().as_slice(),
            [(0, Message::Ok), (1, Message::Ok), (2, Message::Ok)]
        );
        assert_eq!(SEM.count(), 0);
    }
}

mod semaphore_reset {
    use super::*;
    use nil_kernel::{Message, Semaphore, Stack, Timeout};

    nil_port_std::use_port!(unsafe struct System);

    static SEM: Semaphore<System> = Semaphore::new(0);
    static TRACE: Mutex<Vec<(usize, Message)>> = Mutex::new(Vec::new());
    static STACK0: Stack<4096> = Stack::new();
    static STACK1: Stack<4096> = Stack::new();

    fn waiter(id: usize) {
        let msg = SEM.wait(Timeout::Infinite);
        TRACE.lock().unwrap().push((id, msg));
        nil_kernel::sleep::<System>(0);
    }

    nil_kernel::build! {
        system: System,
        tick_mode: nil_kernel::TickMode::Periodic,
        threads: [
            { name: "w0", entry: waiter, param: 0, stack: &STACK0 },
            { name: "w1", entry: waiter, param: 1, stack: &STACK1 },
        ],
    }

    /// Resetting a semaphore with two sleepers releases both with `Reset`,
    /// in priority order, and installs the new counter.
    #[test]
    fn reset_releases_all_waiters() {
        nil_port_std::boot_kernel::<System>();
        assert_eq!(SEM.count(), -2);

        SEM.reset(3);
        assert_eq!(
            TRACE.lock().unwrap().as_slice(),
            [(0, Message::Reset), (1, Message::Reset)]
        );
        assert_eq!(SEM.count(), 3);
    }
}

mod suspend_resume_round_trip {
    use super::*;
    use nil_kernel::{Message, Stack, ThreadRef, Timeout};

    nil_port_std::use_port!(unsafe struct System);

    static SLOT: ThreadRef<System> = ThreadRef::new();
    static WAKEUPS: Mutex<Vec<Message>> = Mutex::new(Vec::new());
    static STACK0: Stack<4096> = Stack::new();

    fn suspender(_: usize) {
        assert!(!SLOT.is_occupied());
        let msg = SLOT.suspend(Timeout::Infinite);
        WAKEUPS.lock().unwrap().push(msg);
        nil_kernel::sleep::<System>(0);
    }

    nil_kernel::build! {
        system: System,
        tick_mode: nil_kernel::TickMode::Periodic,
        threads: [
            { name: "suspender", entry: suspender, param: 0, stack: &STACK0 },
        ],
    }

    /// Resuming with a message delivers exactly that message, and the slot
    /// is empty again afterwards.
    #[test]
    fn resume_message_arrives_verbatim() {
        nil_port_std::boot_kernel::<System>();
        assert!(SLOT.is_occupied());

        SLOT.resume(Message::Custom(42));
        assert_eq!(WAKEUPS.lock().unwrap().as_slice(), [Message::Custom(42)]);
        assert!(!SLOT.is_occupied());
    }
}

mod event_delivery {
    use super::*;
    use nil_kernel::{event, Stack, ThreadId, Timeout};

    nil_port_std::use_port!(unsafe struct System);

    static TRACE: Mutex<Vec<(usize, u32)>> = Mutex::new(Vec::new());
    static STACK0: Stack<4096> = Stack::new();
    static STACK1: Stack<4096> = Stack::new();

    fn listener(id: usize) {
        let got = event::wait_any::<System>(0b11, Timeout::Infinite);
        TRACE.lock().unwrap().push((id, got));
        let got = event::wait_any::<System>(0b100, Timeout::After(2));
        TRACE.lock().unwrap().push((id, got));
        nil_kernel::sleep::<System>(0);
    }

    fn other(id: usize) {
        let got = event::wait_any::<System>(0b1000, Timeout::Infinite);
        TRACE.lock().unwrap().push((id, got));
        nil_kernel::sleep::<System>(0);
    }

    nil_kernel::build! {
        system: System,
        tick_mode: nil_kernel::TickMode::Periodic,
        threads: [
            { name: "listener", entry: listener, param: 0, stack: &STACK0 },
            { name: "other", entry: other, param: 1, stack: &STACK1 },
        ],
    }

    #[test]
    fn events_wake_only_intersecting_waiters() {
        nil_port_std::boot_kernel::<System>();
        assert!(TRACE.lock().unwrap().is_empty());

        // Wakes the listener with the intersecting subset only.
        event::signal::<System>(ThreadId::new(0), 0b01);
        assert_eq!(TRACE.lock().unwrap().as_slice(), [(0, 0b01)]);

        // The second wait times out and reports an empty mask.
        nil_port_std::tick::<System>();
        nil_port_std::tick::<System>();
        assert_eq!(TRACE.lock().unwrap().as_slice(), [(0, 0b01), (0, 0)]);

        // The other thread's interest mask is disjoint from what was
        // signaled so far; a matching signal wakes it.
        event::signal::<System>(ThreadId::new(1), 0b1000);
        assert_eq!(
            TRACE.lock().unwrap().as_slice(),
            [(0, 0b01), (0, 0), (1, 0b1000)]
        );
    }
}

mod tick_wakeup_priority {
    use super::*;
    use nil_kernel::{Stack, Timeout, ThreadRef};

    nil_port_std::use_port!(unsafe struct System);

    static SLOT_HIGH: ThreadRef<System> = ThreadRef::new();
    static SLOT_LOW: ThreadRef<System> = ThreadRef::new();
    static TRACE: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static STACK0: Stack<4096> = Stack::new();
    static STACK1: Stack<4096> = Stack::new();

    fn high(_: usize) {
        let _ = SLOT_HIGH.suspend(Timeout::After(3));
        TRACE.lock().unwrap().push("high");
        nil_kernel::sleep::<System>(0);
    }

    fn low(_: usize) {
        let _ = SLOT_LOW.suspend(Timeout::After(3));
        TRACE.lock().unwrap().push("low");
        nil_kernel::sleep::<System>(0);
    }

    nil_kernel::build! {
        system: System,
        tick_mode: nil_kernel::TickMode::Periodic,
        threads: [
            { name: "high", entry: high, param: 0, stack: &STACK0 },
            { name: "low", entry: low, param: 0, stack: &STACK1 },
        ],
    }

    /// When one tick expires two timeouts at once, the threads run in table
    /// (priority) order regardless of how the scan readied them.
    #[test]
    fn simultaneous_timeouts_run_in_priority_order() {
        nil_port_std::boot_kernel::<System>();
        for _ in 0..3 {
            nil_port_std::tick::<System>();
        }
        assert_eq!(TRACE.lock().unwrap().as_slice(), ["high", "low"]);
    }
}

mod tickless_equivalence {
    use super::*;
    use nil_kernel::{Message, Stack, ThreadRef, Timeout};

    nil_port_std::use_port!(unsafe struct Periodic);
    nil_port_std::use_port!(unsafe struct Tickless);

    static TRACE_P: Mutex<Vec<(usize, Message)>> = Mutex::new(Vec::new());
    static TRACE_T: Mutex<Vec<(usize, Message)>> = Mutex::new(Vec::new());

    static SLOTS_P: [ThreadRef<Periodic>; 3] =
        [ThreadRef::new(), ThreadRef::new(), ThreadRef::new()];
    static SLOTS_T: [ThreadRef<Tickless>; 3] =
        [ThreadRef::new(), ThreadRef::new(), ThreadRef::new()];

    static P0: Stack<4096> = Stack::new();
    static P1: Stack<4096> = Stack::new();
    static P2: Stack<4096> = Stack::new();
    static T0: Stack<4096> = Stack::new();
    static T1: Stack<4096> = Stack::new();
    static T2: Stack<4096> = Stack::new();

    const DELAYS: [u32; 3] = [9, 3, 5];

    fn sleeper_p(id: usize) {
        let msg = SLOTS_P[id].suspend(Timeout::After(DELAYS[id]));
        TRACE_P.lock().unwrap().push((id, msg));
        nil_kernel::sleep::<Periodic>(0);
    }

    fn sleeper_t(id: usize) {
        let msg = SLOTS_T[id].suspend(Timeout::After(DELAYS[id]));
        TRACE_T.lock().unwrap().push((id, msg));
        nil_kernel::sleep::<Tickless>(0);
    }

    nil_kernel::build! {
        system: Periodic,
        tick_mode: nil_kernel::TickMode::Periodic,
        threads: [
            { name: "p0", entry: sleeper_p, param: 0, stack: &P0 },
            { name: "p1", entry: sleeper_p, param: 1, stack: &P1 },
            { name: "p2", entry: sleeper_p, param: 2, stack: &P2 },
        ],
    }

    nil_kernel::build! {
        system: Tickless,
        tick_mode: nil_kernel::TickMode::Tickless { min_delta: 2 },
        threads: [
            { name: "t0", entry: sleeper_t, param: 0, stack: &T0 },
            { name: "t1", entry: sleeper_t, param: 1, stack: &T1 },
            { name: "t2", entry: sleeper_t, param: 2, stack: &T2 },
        ],
    }

    /// The same timeout script produces the same set and order of timeout
    /// wakeups under both timing disciplines.
    #[test]
    fn wakeup_order_is_independent_of_the_discipline() {
        nil_port_std::boot_kernel::<Periodic>();
        for _ in 0..12 {
            nil_port_std::tick::<Periodic>();
        }

        nil_port_std::boot_kernel::<Tickless>();
        nil_port_std::advance_time::<Tickless>(12);

        let expected = [
            (1, Message::Timeout),
            (2, Message::Timeout),
            (0, Message::Timeout),
        ];
        assert_eq!(TRACE_P.lock().unwrap().as_slice(), expected);
        assert_eq!(TRACE_T.lock().unwrap().as_slice(), expected);
    }
}
