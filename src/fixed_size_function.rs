//! Type-erased callable stored in a fixed inline buffer.
//!
//! Works like a boxed closure without the box: the callable is copied into
//! an inline buffer and dispatched through a value-stored vtable. Used for
//! the deleters and factories of thread-local slots, which must live inside
//! intrusive hooks and be callable from any thread.

use core::fmt;
use core::mem::{self, MaybeUninit};

const BUFFER_WORDS: usize = 8;

/// Error returned when invoking a [`FixedSizeFunction`] that holds no
/// callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyCall;

impl fmt::Display for EmptyCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "called an empty fixed-size function")
    }
}

impl std::error::Error for EmptyCall {}

struct VTable<A, R> {
    call: unsafe fn(*const (), A) -> R,
    drop: unsafe fn(*mut ()),
    clone: unsafe fn(*const (), *mut ()),
}

impl<A, R> Clone for VTable<A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A, R> Copy for VTable<A, R> {}

unsafe fn call_shim<A, R, F: Fn(A) -> R>(buffer: *const (), arg: A) -> R {
    (*(buffer as *const F))(arg)
}

unsafe fn drop_shim<F>(buffer: *mut ()) {
    core::ptr::drop_in_place(buffer as *mut F);
}

unsafe fn clone_shim<F: Clone>(src: *const (), dst: *mut ()) {
    (dst as *mut F).write((*(src as *const F)).clone());
}

/// A `Fn(A) -> R` stored inline in a 64-byte buffer.
///
/// The callable must fit the buffer and must not exceed word alignment;
/// both are checked at construction. Nullary callables use `A = ()`.
pub struct FixedSizeFunction<A, R> {
    vtable: Option<VTable<A, R>>,
    buffer: [MaybeUninit<usize>; BUFFER_WORDS],
}

impl<A, R> FixedSizeFunction<A, R> {
    /// An empty function; calling it reports [`EmptyCall`].
    pub fn empty() -> Self {
        Self {
            vtable: None,
            buffer: [MaybeUninit::uninit(); BUFFER_WORDS],
        }
    }

    /// Stores `f` inline.
    ///
    /// Panics if `f` does not fit the buffer or requires more than word
    /// alignment.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(A) -> R + Clone + Send + Sync + 'static,
    {
        assert!(
            mem::size_of::<F>() <= BUFFER_WORDS * mem::size_of::<usize>(),
            "callable does not fit the inline buffer"
        );
        assert!(
            mem::align_of::<F>() <= mem::align_of::<usize>(),
            "callable is over-aligned for the inline buffer"
        );

        let mut this = Self::empty();
        unsafe {
            (this.buffer.as_mut_ptr() as *mut F).write(f);
        }
        this.vtable = Some(VTable {
            call: call_shim::<A, R, F>,
            drop: drop_shim::<F>,
            clone: clone_shim::<F>,
        });
        this
    }

    pub fn is_empty(&self) -> bool {
        self.vtable.is_none()
    }

    /// Invokes the stored callable, panicking if there is none.
    pub fn call(&self, arg: A) -> R {
        match self.try_call(arg) {
            Ok(result) => result,
            Err(err) => panic!("{}", err),
        }
    }

    /// Invokes the stored callable.
    pub fn try_call(&self, arg: A) -> Result<R, EmptyCall> {
        match &self.vtable {
            Some(vtable) => Ok(unsafe { (vtable.call)(self.buffer.as_ptr() as *const (), arg) }),
            None => Err(EmptyCall),
        }
    }
}

impl<A, R> Clone for FixedSizeFunction<A, R> {
    fn clone(&self) -> Self {
        let mut copy = Self::empty();
        if let Some(vtable) = self.vtable {
            unsafe {
                (vtable.clone)(
                    self.buffer.as_ptr() as *const (),
                    copy.buffer.as_mut_ptr() as *mut (),
                );
            }
            copy.vtable = Some(vtable);
        }
        copy
    }
}

impl<A, R> Drop for FixedSizeFunction<A, R> {
    fn drop(&mut self) {
        if let Some(vtable) = self.vtable.take() {
            unsafe {
                (vtable.drop)(self.buffer.as_mut_ptr() as *mut ());
            }
        }
    }
}

impl<A, R> Default for FixedSizeFunction<A, R> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<A, R> fmt::Debug for FixedSizeFunction<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedSizeFunction")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

// Construction requires the callable to be Send + Sync.
unsafe impl<A, R> Send for FixedSizeFunction<A, R> {}
unsafe impl<A, R> Sync for FixedSizeFunction<A, R> {}

#[cfg(all(test, not(feature = "check-loom")))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn calls_captured_closure() {
        let base = 10usize;
        let f = FixedSizeFunction::new(move |x: usize| base + x);
        assert_eq!(f.call(5), 15);
        assert_eq!(f.try_call(1), Ok(11));
    }

    #[test]
    fn empty_call_reports_error() {
        let f = FixedSizeFunction::<usize, usize>::empty();
        assert!(f.is_empty());
        assert_eq!(f.try_call(1), Err(EmptyCall));
    }

    #[test]
    #[should_panic]
    fn empty_call_panics() {
        FixedSizeFunction::<(), ()>::empty().call(());
    }

    #[test]
    fn clone_behaves_like_original() {
        let hits = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::clone(&hits);
        let f = FixedSizeFunction::new(move |n: usize| {
            recorder.fetch_add(n, Ordering::Relaxed);
        });
        let g = f.clone();
        f.call(1);
        g.call(2);
        drop(f);
        g.call(4);
        assert_eq!(hits.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn drops_captured_state() {
        let state = Arc::new(());
        let f = FixedSizeFunction::new({
            let state = Arc::clone(&state);
            move |_: ()| {
                let _ = &state;
            }
        });
        assert_eq!(Arc::strong_count(&state), 2);
        drop(f);
        assert_eq!(Arc::strong_count(&state), 1);
    }

    #[test]
    #[should_panic]
    fn rejects_oversized_callable() {
        let blob = [0u8; 128];
        let _ = FixedSizeFunction::new(move |_: ()| blob[0]);
    }

    #[test]
    fn works_as_nullary_factory() {
        let factory = FixedSizeFunction::new(|()| Box::into_raw(Box::new(42i32)));
        let raw = factory.call(());
        assert_eq!(unsafe { *Box::from_raw(raw) }, 42);
    }
}
