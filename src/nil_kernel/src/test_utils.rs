//! A minimal mock port for state-machine-level unit tests.
//!
//! The mock never performs a real stack switch; `context_switch` records the
//! request and returns. Tests therefore drive the kernel through its I-class
//! and immediate paths and assert on the resulting table state.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{KernelTraits, SysTime, ThreadCb};

pub(crate) struct MockPortState {
    pub(crate) cpu_lock: AtomicBool,
    /// `(to, from)` pairs, by table index.
    pub(crate) switches: Mutex<Vec<(usize, usize)>>,
    now: AtomicU32,
    alarm: Mutex<Option<SysTime>>,
}

impl MockPortState {
    pub(crate) const fn new() -> Self {
        Self {
            cpu_lock: AtomicBool::new(false),
            switches: Mutex::new(Vec::new()),
            now: AtomicU32::new(0),
            alarm: Mutex::new(None),
        }
    }

    pub(crate) fn set_now(&self, now: SysTime) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub(crate) fn now(&self) -> SysTime {
        self.now.load(Ordering::Relaxed)
    }

    pub(crate) fn alarm(&self) -> Option<SysTime> {
        *self.alarm.lock().unwrap()
    }

    pub(crate) fn force_alarm(&self, at: Option<SysTime>) {
        *self.alarm.lock().unwrap() = at;
    }

    pub(crate) fn set_alarm(&self, at: SysTime) {
        let mut alarm = self.alarm.lock().unwrap();
        assert!(alarm.is_some(), "set_alarm while the alarm is stopped");
        *alarm = Some(at);
    }

    pub(crate) fn start_alarm(&self, at: SysTime) {
        let mut alarm = self.alarm.lock().unwrap();
        assert!(alarm.is_none(), "start_alarm while the alarm is running");
        *alarm = Some(at);
    }

    pub(crate) fn stop_alarm(&self) {
        *self.alarm.lock().unwrap() = None;
    }

    pub(crate) fn programmed_alarm(&self) -> SysTime {
        self.alarm.lock().unwrap().expect("alarm is stopped")
    }
}

/// Serialize tests that share a mock system's static state.
pub(crate) fn serialized() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Table index of a control block, for switch logging.
pub(crate) fn cb_index<Traits: KernelTraits>(cb: &ThreadCb<Traits>) -> usize {
    Traits::thread_cb_pool()
        .iter()
        .position(|entry| core::ptr::eq(entry, cb))
        .unwrap()
}

/// Define a system type backed by [`MockPortState`].
macro_rules! mock_port {
    (struct $Traits:ident) => {
        struct $Traits;

        impl $Traits {
            fn mock_state() -> &'static crate::test_utils::MockPortState {
                static STATE: crate::test_utils::MockPortState =
                    crate::test_utils::MockPortState::new();
                &STATE
            }
        }

        unsafe impl crate::PortThreading for $Traits {
            type PortContext = ();

            unsafe fn port_init() {}

            unsafe fn enter_cpu_lock() {
                let was_locked = Self::mock_state()
                    .cpu_lock
                    .swap(true, ::std::sync::atomic::Ordering::Relaxed);
                assert!(!was_locked, "CPU Lock is already active");
            }

            unsafe fn leave_cpu_lock() {
                let was_locked = Self::mock_state()
                    .cpu_lock
                    .swap(false, ::std::sync::atomic::Ordering::Relaxed);
                assert!(was_locked, "CPU Lock is not active");
            }

            fn is_cpu_lock_active() -> bool {
                Self::mock_state()
                    .cpu_lock
                    .load(::std::sync::atomic::Ordering::Relaxed)
            }

            fn is_interrupt_context() -> bool {
                false
            }

            unsafe fn setup_context(
                _thread: &'static crate::ThreadCb<Self>,
                _attr: &'static crate::ThreadAttr,
            ) {
            }

            unsafe fn context_switch(
                next: &'static crate::ThreadCb<Self>,
                previous: &'static crate::ThreadCb<Self>,
            ) {
                Self::mock_state().switches.lock().unwrap().push((
                    crate::test_utils::cb_index::<Self>(next),
                    crate::test_utils::cb_index::<Self>(previous),
                ));
            }

            fn halt(reason: &'static str) -> ! {
                panic!("{}", reason)
            }
        }

        unsafe impl crate::PortTimer for $Traits {
            fn timer_now() -> crate::SysTime {
                Self::mock_state().now()
            }

            unsafe fn timer_set_alarm(at: crate::SysTime) {
                Self::mock_state().set_alarm(at);
            }

            unsafe fn timer_start_alarm(at: crate::SysTime) {
                Self::mock_state().start_alarm(at);
            }

            unsafe fn timer_stop_alarm() {
                Self::mock_state().stop_alarm();
            }

            fn timer_alarm() -> crate::SysTime {
                Self::mock_state().programmed_alarm()
            }
        }
    };
}
