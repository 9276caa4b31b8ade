use core::cell::UnsafeCell;
use core::mem::{self, MaybeUninit};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Returns a small nonzero id unique to the calling thread.
///
/// Unlike `std::thread::ThreadId`, the id is a plain word that can be stored
/// in an atomic and compared cheaply on the free-list fast path.
pub(crate) fn current_thread_id() -> usize {
    static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(1);

    thread_local! {
        static THREAD_ID: usize = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    }

    THREAD_ID.with(|id| *id)
}

/// Hashes a pointer by dropping the always-zero alignment bits.
pub(crate) fn pointer_hash<T>(ptr: *const T) -> usize {
    let align = mem::align_of::<T>().max(1);
    (ptr as usize) >> align.trailing_zeros()
}

/// Inline storage for a `V` that is constructed and destroyed manually.
pub(crate) struct AlignedStorage<V> {
    inner: UnsafeCell<MaybeUninit<V>>,
}

impl<V> AlignedStorage<V> {
    pub(crate) fn new() -> Self {
        Self {
            inner: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut V {
        self.inner.get() as *mut V
    }

    /// Writes `value` into the storage and returns a pointer to it.
    ///
    /// # Safety
    ///
    /// The storage must not already hold a live value.
    pub(crate) unsafe fn write(&self, value: V) -> *mut V {
        let ptr = self.as_ptr();
        ptr.write(value);
        ptr
    }

    /// Runs the destructor of the stored value in place.
    ///
    /// # Safety
    ///
    /// The storage must hold a live value, and it must not be used again
    /// afterwards.
    pub(crate) unsafe fn drop_in_place(&self) {
        core::ptr::drop_in_place(self.as_ptr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_are_distinct() {
        let here = current_thread_id();
        assert_ne!(here, 0);
        let there = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, there);
        // stable within a thread
        assert_eq!(here, current_thread_id());
    }

    #[test]
    fn pointer_hash_strips_alignment() {
        let x = 0u64;
        let hash = pointer_hash(&x);
        assert_eq!(hash << 3, &x as *const u64 as usize);
    }

    #[test]
    fn aligned_storage_roundtrip() {
        let storage = AlignedStorage::<String>::new();
        unsafe {
            storage.write("stored".to_owned());
            assert_eq!(*storage.as_ptr(), "stored");
            storage.drop_in_place();
        }
    }
}
