//! Lock-free atomic shared pointers.
//!
//! The atomic slot stores one strong count on behalf of whatever it points
//! at. `load` mints a fresh count for the caller under hazard protection;
//! stores and successful CASes transfer the incoming pointer's count into
//! the slot and release the old one. Both the plain and the marked variant
//! run on the same word-sized core.

use core::marker::PhantomData;
use core::mem;

use crossbeam_utils::Backoff;

use crate::hazard_pointer::make_hazard_pointer;
use crate::marked_ptr::MarkedPtr;
use crate::sync::{AtomicUsize, Ordering};

use super::control_block::{ref_count_domain, ControlBlock};
use super::marked::MarkedSharedPtr;
use super::SharedPtr;

/// The failure ordering the original interface derives from a success
/// ordering: `AcqRel → Acquire`, `Release → Relaxed`, otherwise unchanged.
pub fn default_failure_ordering(success: Ordering) -> Ordering {
    match success {
        Ordering::AcqRel => Ordering::Acquire,
        Ordering::Release => Ordering::Relaxed,
        other => other,
    }
}

/// Strong pointers representable as one machine word.
///
/// # Safety
///
/// `into_repr`/`from_repr` must transfer exactly one strong count, and
/// `block_of` must return the control block a repr's count is held on.
unsafe trait RefCounted: Sized {
    fn as_repr(&self) -> usize;
    fn into_repr(self) -> usize;
    unsafe fn from_repr(repr: usize) -> Self;
    fn block_of(repr: usize) -> *mut ControlBlock;
}

unsafe impl<T> RefCounted for SharedPtr<T> {
    fn as_repr(&self) -> usize {
        self.control_block() as usize
    }

    fn into_repr(self) -> usize {
        self.release() as usize
    }

    unsafe fn from_repr(repr: usize) -> Self {
        SharedPtr::from_control_block(repr as *mut ControlBlock)
    }

    fn block_of(repr: usize) -> *mut ControlBlock {
        repr as *mut ControlBlock
    }
}

unsafe impl<T> RefCounted for MarkedSharedPtr<T> {
    fn as_repr(&self) -> usize {
        self.marked_block().into_usize()
    }

    fn into_repr(self) -> usize {
        self.release_marked().into_usize()
    }

    unsafe fn from_repr(repr: usize) -> Self {
        MarkedSharedPtr::from_marked(MarkedPtr::from_usize(repr))
    }

    fn block_of(repr: usize) -> *mut ControlBlock {
        MarkedPtr::<ControlBlock>::from_usize(repr).ptr()
    }
}

struct AtomicRefCounted<P: RefCounted> {
    repr: AtomicUsize,
    _marker: PhantomData<P>,
}

impl<P: RefCounted> AtomicRefCounted<P> {
    fn new(pointer: P) -> Self {
        Self {
            repr: AtomicUsize::new(pointer.into_repr()),
            _marker: PhantomData,
        }
    }

    fn store(&self, desired: P, order: Ordering) {
        let old = self.repr.swap(desired.into_repr(), order);
        let block = P::block_of(old);
        if !block.is_null() {
            unsafe { ControlBlock::dec_strong(block) };
        }
    }

    /// Takes a fresh strong reference to the current pointee.
    fn load(&self) -> P {
        let guard = make_hazard_pointer(ref_count_domain());
        let backoff = Backoff::new();
        loop {
            // publish the block address, then make sure it is still stored
            let mut repr = self.repr.load(Ordering::Relaxed);
            loop {
                guard.reset_protection(P::block_of(repr) as *const ControlBlock);
                let current = self.repr.load(Ordering::Acquire);
                if current == repr {
                    break;
                }
                repr = current;
            }

            let block = P::block_of(repr);
            if block.is_null() {
                guard.clear_protection();
                return unsafe { P::from_repr(repr) };
            }
            if unsafe { (*block).inc_strong_if_nonzero() } {
                guard.clear_protection();
                return unsafe { P::from_repr(repr) };
            }
            // the stored value is being replaced with its count at zero;
            // wait for the writer to finish
            backoff.snooze();
        }
    }

    fn exchange(&self, desired: P, order: Ordering) -> P {
        let old = self.repr.swap(desired.into_repr(), order);
        unsafe { P::from_repr(old) }
    }

    fn compare_exchange_impl(
        &self,
        expected: &mut P,
        desired: P,
        success: Ordering,
        failure: Ordering,
        weak: bool,
    ) -> bool {
        let expected_repr = expected.as_repr();
        let desired_repr = desired.as_repr();
        let result = if weak {
            self.repr
                .compare_exchange_weak(expected_repr, desired_repr, success, failure)
        } else {
            self.repr
                .compare_exchange(expected_repr, desired_repr, success, failure)
        };
        match result {
            Ok(_) => {
                // the slot adopted desired's count and released its old one
                mem::forget(desired);
                let old = P::block_of(expected_repr);
                if !old.is_null() {
                    unsafe { ControlBlock::dec_strong(old) };
                }
                true
            }
            Err(_) => {
                *expected = self.load();
                false
            }
        }
    }

    fn compare_exchange(
        &self,
        expected: &mut P,
        desired: P,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.compare_exchange_impl(expected, desired, success, failure, false)
    }

    fn compare_exchange_weak(
        &self,
        expected: &mut P,
        desired: P,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.compare_exchange_impl(expected, desired, success, failure, true)
    }
}

impl<P: RefCounted> Drop for AtomicRefCounted<P> {
    fn drop(&mut self) {
        let block = P::block_of(self.repr.load(Ordering::Relaxed));
        if !block.is_null() {
            unsafe { ControlBlock::dec_strong(block) };
        }
    }
}

/// A lock-free atomic [`SharedPtr`] slot.
///
/// All operations take explicit orderings; `SeqCst` is the conventional
/// choice and the one every cross-thread protocol here is specified for.
pub struct AtomicSharedPtr<T> {
    inner: AtomicRefCounted<SharedPtr<T>>,
}

impl<T> AtomicSharedPtr<T> {
    pub fn new(pointer: SharedPtr<T>) -> Self {
        Self {
            inner: AtomicRefCounted::new(pointer),
        }
    }

    pub fn null() -> Self {
        Self::new(SharedPtr::null())
    }

    /// Replaces the stored pointer, releasing the old reference.
    pub fn store(&self, desired: SharedPtr<T>, order: Ordering) {
        self.inner.store(desired, order);
    }

    /// Returns a fresh strong reference to the stored value, or null.
    pub fn load(&self) -> SharedPtr<T> {
        self.inner.load()
    }

    /// Replaces the stored pointer, returning the old reference.
    pub fn exchange(&self, desired: SharedPtr<T>, order: Ordering) -> SharedPtr<T> {
        self.inner.exchange(desired, order)
    }

    /// On success the slot adopts `desired`; on failure `desired`'s
    /// reference is released and `expected` is refreshed with a live
    /// reference to the actual value.
    pub fn compare_exchange(
        &self,
        expected: &mut SharedPtr<T>,
        desired: SharedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.inner.compare_exchange(expected, desired, success, failure)
    }

    pub fn compare_exchange_weak(
        &self,
        expected: &mut SharedPtr<T>,
        desired: SharedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.inner
            .compare_exchange_weak(expected, desired, success, failure)
    }
}

impl<T> Default for AtomicSharedPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<SharedPtr<T>> for AtomicSharedPtr<T> {
    fn from(pointer: SharedPtr<T>) -> Self {
        Self::new(pointer)
    }
}

unsafe impl<T: Send + Sync> Send for AtomicSharedPtr<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicSharedPtr<T> {}

/// A lock-free atomic [`MarkedSharedPtr`] slot: one CAS switches pointer
/// and mark together.
pub struct AtomicMarkedSharedPtr<T> {
    inner: AtomicRefCounted<MarkedSharedPtr<T>>,
}

impl<T> AtomicMarkedSharedPtr<T> {
    pub fn new(pointer: MarkedSharedPtr<T>) -> Self {
        Self {
            inner: AtomicRefCounted::new(pointer),
        }
    }

    pub fn null() -> Self {
        Self::new(MarkedSharedPtr::null())
    }

    pub fn store(&self, desired: MarkedSharedPtr<T>, order: Ordering) {
        self.inner.store(desired, order);
    }

    pub fn load(&self) -> MarkedSharedPtr<T> {
        self.inner.load()
    }

    pub fn exchange(&self, desired: MarkedSharedPtr<T>, order: Ordering) -> MarkedSharedPtr<T> {
        self.inner.exchange(desired, order)
    }

    /// Succeeds only if both the pointer and the mark of `expected` match.
    pub fn compare_exchange(
        &self,
        expected: &mut MarkedSharedPtr<T>,
        desired: MarkedSharedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.inner.compare_exchange(expected, desired, success, failure)
    }

    pub fn compare_exchange_weak(
        &self,
        expected: &mut MarkedSharedPtr<T>,
        desired: MarkedSharedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.inner
            .compare_exchange_weak(expected, desired, success, failure)
    }
}

impl<T> Default for AtomicMarkedSharedPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<MarkedSharedPtr<T>> for AtomicMarkedSharedPtr<T> {
    fn from(pointer: MarkedSharedPtr<T>) -> Self {
        Self::new(pointer)
    }
}

unsafe impl<T: Send + Sync> Send for AtomicMarkedSharedPtr<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicMarkedSharedPtr<T> {}

#[cfg(all(test, not(feature = "check-loom")))]
mod tests {
    use super::super::make_shared;
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc;

    struct Tally {
        value: i64,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tally {
        fn drop(&mut self) {
            self.drops.fetch_add(1, StdOrdering::Relaxed);
        }
    }

    fn tallied(value: i64, drops: &Arc<AtomicUsize>) -> SharedPtr<Tally> {
        make_shared(Tally {
            value,
            drops: Arc::clone(drops),
        })
    }

    #[test]
    fn store_releases_the_old_reference() {
        let drops = Arc::new(AtomicUsize::new(0));
        let slot = AtomicSharedPtr::new(tallied(1, &drops));
        slot.store(tallied(2, &drops), Ordering::SeqCst);
        assert_eq!(drops.load(StdOrdering::Relaxed), 1);
        let current = slot.load();
        assert_eq!(current.as_ref().unwrap().value, 2);
        drop(current);
        drop(slot);
        assert_eq!(drops.load(StdOrdering::Relaxed), 2);
    }

    #[test]
    fn load_from_null_is_null() {
        let slot = AtomicSharedPtr::<i64>::null();
        assert!(slot.load().is_null());
    }

    #[test]
    fn exchange_hands_back_the_old_reference() {
        let drops = Arc::new(AtomicUsize::new(0));
        let slot = AtomicSharedPtr::new(tallied(1, &drops));
        let old = slot.exchange(tallied(2, &drops), Ordering::SeqCst);
        assert_eq!(old.as_ref().unwrap().value, 1);
        assert_eq!(drops.load(StdOrdering::Relaxed), 0);
        drop(old);
        assert_eq!(drops.load(StdOrdering::Relaxed), 1);
    }

    #[test]
    fn failed_cas_refreshes_expected() {
        let slot = AtomicSharedPtr::new(make_shared(10i64));
        let mut expected = make_shared(99i64); // wrong guess
        let desired = make_shared(11i64);
        assert!(!slot.compare_exchange(
            &mut expected,
            desired,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ));
        // expected now refers to the stored value
        assert_eq!(expected.as_ref().copied(), Some(10));
        assert!(slot.compare_exchange(
            &mut expected,
            make_shared(11i64),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ));
        assert_eq!(slot.load().as_ref().copied(), Some(11));
    }

    #[test]
    fn default_failure_ordering_mapping() {
        assert_eq!(
            default_failure_ordering(Ordering::AcqRel),
            Ordering::Acquire
        );
        assert_eq!(
            default_failure_ordering(Ordering::Release),
            Ordering::Relaxed
        );
        assert_eq!(default_failure_ordering(Ordering::SeqCst), Ordering::SeqCst);
    }

    // One writer publishes increasing values while readers continuously
    // load and dereference; nothing may be freed early or leaked.
    #[test]
    fn contended_load_store() {
        const VALUES: i64 = 2000;
        const READERS: usize = 8;

        let drops = Arc::new(AtomicUsize::new(0));
        let slot = AtomicSharedPtr::<Tally>::null();
        let done = AtomicBool::new(false);

        crossbeam_utils::thread::scope(|scope| {
            for _ in 0..READERS {
                let slot = &slot;
                let done = &done;
                scope.spawn(move |_| {
                    while !done.load(StdOrdering::Acquire) {
                        let current = slot.load();
                        if let Some(seen) = current.as_ref() {
                            assert!(seen.value >= 0 && seen.value < VALUES);
                        }
                    }
                });
            }

            for i in 0..VALUES {
                slot.store(tallied(i, &drops), Ordering::SeqCst);
            }
            slot.store(SharedPtr::null(), Ordering::SeqCst);
            done.store(true, StdOrdering::Release);
        })
        .unwrap();

        // every published value was destroyed exactly once
        assert_eq!(drops.load(StdOrdering::Relaxed), VALUES as usize);
    }

    #[test]
    fn marked_cas_switches_pointer_and_mark_together() {
        let x = make_shared(1i64);
        let slot = AtomicMarkedSharedPtr::new(MarkedSharedPtr::from(x.clone()));

        // marking the current entry succeeds only with the right mark
        let mut expected = MarkedSharedPtr::with_mark(x.clone(), true);
        assert!(!slot.compare_exchange(
            &mut expected,
            MarkedSharedPtr::with_mark(x.clone(), true),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ));
        assert!(!expected.is_marked());

        assert!(slot.compare_exchange(
            &mut expected,
            MarkedSharedPtr::with_mark(x.clone(), true),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ));
        let now = slot.load();
        assert!(now.is_marked());
        assert_eq!(now.get(), x.get());
    }

    // Two CASes race from the same expected state; exactly one wins and
    // the loser observes the winner's outcome.
    #[test]
    fn racing_marked_cas_has_one_winner() {
        for _ in 0..64 {
            let x = make_shared(1i64);
            let y = make_shared(2i64);
            let slot = AtomicMarkedSharedPtr::new(MarkedSharedPtr::from(x.clone()));

            let outcomes = crossbeam_utils::thread::scope(|scope| {
                let mark_it = {
                    let slot = &slot;
                    let x = x.clone();
                    scope.spawn(move |_| {
                        let mut expected = MarkedSharedPtr::from(x.clone());
                        slot.compare_exchange(
                            &mut expected,
                            MarkedSharedPtr::with_mark(x, true),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                    })
                };
                let swing_it = {
                    let slot = &slot;
                    let x = x.clone();
                    let y = y.clone();
                    scope.spawn(move |_| {
                        let mut expected = MarkedSharedPtr::from(x);
                        slot.compare_exchange(
                            &mut expected,
                            MarkedSharedPtr::from(y),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                    })
                };
                (mark_it.join().unwrap(), swing_it.join().unwrap())
            })
            .unwrap();

            assert!(outcomes.0 ^ outcomes.1, "exactly one CAS must win");
            let now = slot.load();
            if outcomes.0 {
                assert_eq!(now.get(), x.get());
                assert!(now.is_marked());
            } else {
                assert_eq!(now.get(), y.get());
                assert!(!now.is_marked());
            }
        }
    }
}
