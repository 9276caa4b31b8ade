//! Atomics, switchable to loom for model checking.

cfg_if::cfg_if! {
    if #[cfg(feature = "check-loom")] {
        pub(crate) use loom::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};
    } else {
        pub(crate) use core::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};
    }
}
