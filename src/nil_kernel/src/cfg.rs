//! Static configuration mechanism for the kernel.

/// Attach a static configuration to a "system" type by implementing
/// [`KernelCfg`](crate::KernelCfg) on it.
///
/// The thread list is given in descending priority order; the idle slot is
/// appended implicitly. Stacks are declared by the application as
/// [`Stack`](crate::Stack) statics and referenced per thread, so their sizes
/// stay visible at the use site.
///
/// `tick_mode` is a [`TickMode`](crate::TickMode) constant. Optional
/// settings, in order: `frequency` (nominal tick rate in hertz backing the
/// time-conversion helpers, default 1000), `thread_ext` (opaque per-thread
/// payload type, default `()`), `assertions` (runtime invariant checks,
/// default `true`), and `preemptible_tick_scan` (re-open a preemption window
/// between per-thread steps of the timer scan, default `true`).
///
/// Invalid configurations (an empty thread list, a thread count the linear
/// scheduler cannot sensibly serve, a zero tick frequency, a tick-less
/// safety delta below 2) fail to compile.
#[macro_export]
macro_rules! build {
    (
        system: $Traits:ty,
        tick_mode: $tick_mode:expr,
        $( frequency: $frequency:expr, )?
        $( thread_ext: $ThreadExt:ty, )?
        $( assertions: $assertions:expr, )?
        $( preemptible_tick_scan: $preemptible:expr, )?
        threads: [
            $( {
                name: $name:expr,
                entry: $entry:expr,
                param: $param:expr,
                stack: $stack:expr $(,)?
            } ),* $(,)?
        ] $(,)?
    ) => {
        // Safety: this macro is the only intended implementor of
        // `KernelCfg`, and it instantiates every table consistently.
        unsafe impl $crate::KernelCfg for $Traits {
            type ThreadExt = $crate::__opt_or_ty!($( $ThreadExt )?, ());

            const NUM_THREADS: usize = (&[$( $name ),*] as &[&'static str]).len();
            const TICK_MODE: $crate::TickMode = $tick_mode;
            const TICK_FREQUENCY: $crate::Ticks = $crate::__opt_or!($( $frequency )?, 1000);
            const ASSERTIONS: bool = $crate::__opt_or!($( $assertions )?, true);
            const PREEMPTIBLE_TICK_SCAN: bool = $crate::__opt_or!($( $preemptible )?, true);

            fn state() -> &'static $crate::State<Self> {
                static STATE: $crate::State<$Traits> =
                    <$crate::State<$Traits> as $crate::utils::Init>::INIT;
                &STATE
            }

            fn thread_cb_pool() -> &'static [$crate::ThreadCb<Self>] {
                static POOL: [$crate::ThreadCb<$Traits>;
                    <$Traits as $crate::KernelCfg>::NUM_THREADS + 1] =
                    <[$crate::ThreadCb<$Traits>;
                        <$Traits as $crate::KernelCfg>::NUM_THREADS + 1]
                        as $crate::utils::Init>::INIT;
                &POOL
            }

            fn thread_attr_pool() -> &'static [$crate::ThreadAttr] {
                static ATTRS: [$crate::ThreadAttr;
                    <$Traits as $crate::KernelCfg>::NUM_THREADS + 1] = [
                    $(
                        $crate::ThreadAttr {
                            name: $name,
                            entry: ::core::option::Option::Some($entry),
                            param: $param,
                            stack: $crate::Stack::region($stack),
                        },
                    )*
                    $crate::ThreadAttr::idle(),
                ];
                &ATTRS
            }

            fn thread_ext_pool() -> &'static [Self::ThreadExt] {
                static EXT: [<$Traits as $crate::KernelCfg>::ThreadExt;
                    <$Traits as $crate::KernelCfg>::NUM_THREADS + 1] =
                    <[<$Traits as $crate::KernelCfg>::ThreadExt;
                        <$Traits as $crate::KernelCfg>::NUM_THREADS + 1]
                        as $crate::utils::Init>::INIT;
                &EXT
            }
        }

        const _: () = {
            assert!(
                <$Traits as $crate::KernelCfg>::NUM_THREADS >= 1,
                "at least one thread must be defined"
            );
            assert!(
                <$Traits as $crate::KernelCfg>::NUM_THREADS <= $crate::MAX_THREADS,
                "too many threads for the linear scheduler"
            );
            assert!(
                <$Traits as $crate::KernelCfg>::TICK_FREQUENCY > 0,
                "invalid tick frequency"
            );
            assert!(
                <$Traits as $crate::KernelCfg>::TICK_MODE.is_valid(),
                "invalid tick-less minimum delta"
            );
        };
    };
}

/// Used by [`build!`] to default optional types.
#[doc(hidden)]
#[macro_export]
macro_rules! __opt_or_ty {
    (, $default:ty) => {
        $default
    };
    ($value:ty, $default:ty) => {
        $value
    };
}

/// Used by [`build!`] to default optional settings.
#[doc(hidden)]
#[macro_export]
macro_rules! __opt_or {
    (, $default:expr) => {
        $default
    };
    ($value:expr, $default:expr) => {
        $value
    };
}
