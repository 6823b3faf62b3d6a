//! Kernel state locking mechanism.
//!
//! The kernel critical section, an interrupt mask/unmask pair provided by
//! the port, is reified as a token type so that access to shared kernel
//! state is checked by the compiler: every piece of mutable kernel state
//! lives in a [`CpuLockCell`], which can only be read or written through a
//! token proving that CPU Lock is active.
//!
//! Thread-context code obtains the token with [`lock_cpu`]; interrupt
//! handlers use [`lock_cpu_from_isr`], which maps to the port's `_from_isr`
//! masking primitives. The single place where a token outlives its critical
//! section is the scheduler's context switch, where the lock is handed over
//! to the next thread rather than released; the dormant guard on the
//! suspended thread's stack is not used again until that thread owns the
//! lock once more.
use core::{fmt, ops};
use tokenlock::UnsyncTokenLock;

use crate::{utils::Init, PortThreading};

pub(crate) struct CpuLockTag<Traits>(Traits);

/// The key that "unlocks" [`CpuLockCell`].
pub(crate) type CpuLockToken<Traits> = tokenlock::UnsyncSingletonToken<CpuLockTag<Traits>>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(crate) type CpuLockKeyhole<Traits> = tokenlock::SingletonTokenId<CpuLockTag<Traits>>;

/// Borrowed version of [`CpuLockGuard`]. This is equivalent to
/// `&'a mut CpuLockGuard` but does not consume memory.
///
/// When passing a guard down a call chain, reborrow it manually with
/// [`CpuLockGuard::borrow_mut`]; the compiler does not insert the reborrow
/// automatically like it does for `&mut _`.
pub(crate) type CpuLockTokenRefMut<'a, Traits> =
    tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag<Traits>>;

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`] or [`lock_cpu_from_isr`]).
pub(crate) struct CpuLockCell<Traits, T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole<Traits>>);

impl<Traits, T> CpuLockCell<Traits, T> {
    pub(crate) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::INIT, x))
    }
}

impl<Traits, T: Init> Init for CpuLockCell<Traits, T> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self(Init::INIT);
}

impl<Traits, T: ?Sized> fmt::Debug for CpuLockCell<Traits, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The contents can only be read while CPU Lock is active.
        f.write_str("CpuLockCell(< locked >)")
    }
}

impl<Traits, T> ops::Deref for CpuLockCell<Traits, T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole<Traits>>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Traits, T> ops::DerefMut for CpuLockCell<Traits, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Enter CPU Lock from thread context and get an RAII guard.
pub(crate) fn lock_cpu<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    // Safety: `enter_cpu_lock` is only meant to be called by the kernel
    unsafe { Traits::enter_cpu_lock() };
    // Safety: we just entered CPU Lock, so no other token exists
    unsafe { assume_cpu_lock() }
}

/// Enter CPU Lock from an interrupt handler and get an RAII guard.
pub(crate) fn lock_cpu_from_isr<Traits: PortThreading>() -> CpuLockIsrGuard<Traits> {
    // Safety: `enter_cpu_lock_from_isr` is only meant to be called by the
    // kernel
    unsafe { Traits::enter_cpu_lock_from_isr() };
    CpuLockIsrGuard {
        // Safety: an interrupt handler masked to the kernel level is the
        // sole owner of the processor; no other token can be in use
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// Assume a CPU Lock state and get a `CpuLockGuard`.
///
/// # Safety
///
/// The system must really be in a CPU Lock state. There must be no usable
/// instance of `CpuLockGuard` existing at the point of the call.
pub(crate) unsafe fn assume_cpu_lock<Traits: PortThreading>() -> CpuLockGuard<Traits> {
    debug_assert!(Traits::is_cpu_lock_active());

    CpuLockGuard {
        // Safety: upheld by the caller
        token: unsafe { CpuLockToken::new_unchecked() },
    }
}

/// RAII guard for a CPU Lock state entered from thread context.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(crate) struct CpuLockGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockGuard<Traits> {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is active, and the kernel is the one controlling
        // it
        unsafe { Traits::leave_cpu_lock() };
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// RAII guard for a CPU Lock state entered from an interrupt handler.
///
/// Identical to [`CpuLockGuard`] except that dropping it lowers the mask
/// through the port's `_from_isr` primitive.
pub(crate) struct CpuLockIsrGuard<Traits: PortThreading> {
    token: CpuLockToken<Traits>,
}

impl<Traits: PortThreading> CpuLockIsrGuard<Traits> {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub(crate) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_, Traits> {
        self.token.borrow_mut()
    }
}

impl<Traits: PortThreading> Drop for CpuLockIsrGuard<Traits> {
    fn drop(&mut self) {
        // Safety: CPU Lock is active, and the kernel is the one controlling
        // it
        unsafe { Traits::leave_cpu_lock_from_isr() };
    }
}

impl<Traits: PortThreading> ops::Deref for CpuLockIsrGuard<Traits> {
    type Target = CpuLockToken<Traits>;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl<Traits: PortThreading> ops::DerefMut for CpuLockIsrGuard<Traits> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}
