//! Reference-count control blocks, reclaimed through a dedicated hazard
//! domain.
//!
//! A block owns its value either inline (`make_shared`) or through a raw
//! pointer plus deleter. The strong count drives value destruction; the
//! weak count (strong existence holds one) drives destruction of the block
//! itself, which is *retired* rather than freed so lock-free readers can
//! still validate a block they are about to bump.

use core::cell::Cell;
use core::mem;
use core::ptr;

use lazy_static::lazy_static;
use static_assertions::const_assert;

use crate::hazard_pointer::{HazardDomain, HazardEntry, HazardObject};
use crate::sync::{AtomicUsize, Ordering};
use crate::utils::AlignedStorage;

lazy_static! {
    // One record per thread: only `load` of the atomic pointers publishes
    // through this domain, and never more than one hazard at a time.
    static ref REF_COUNT_DOMAIN: HazardDomain = HazardDomain::with_config(1, 64, 64);
}

/// The domain control blocks are retired through. Loads of atomic shared
/// pointers must take their hazards here so scans observe them.
pub(crate) fn ref_count_domain() -> &'static HazardDomain {
    &REF_COUNT_DOMAIN
}

pub(crate) struct ControlBlock {
    entry: HazardEntry,
    strong: AtomicUsize,
    weak: AtomicUsize,
    value: Cell<*mut ()>,
    destroy_value: unsafe fn(*mut ControlBlock),
    destroy_block: unsafe fn(*mut ControlBlock),
    next_dead: Cell<*mut ControlBlock>,
}

const_assert!(mem::align_of::<ControlBlock>() >= 2); // low bit of a block address carries the mark

impl ControlBlock {
    fn new(
        destroy_value: unsafe fn(*mut ControlBlock),
        destroy_block: unsafe fn(*mut ControlBlock),
    ) -> Self {
        Self {
            entry: HazardEntry::new(),
            strong: AtomicUsize::new(1),
            weak: AtomicUsize::new(1),
            value: Cell::new(ptr::null_mut()),
            destroy_value,
            destroy_block,
            next_dead: Cell::new(ptr::null_mut()),
        }
    }

    pub(crate) fn value_ptr(&self) -> *mut () {
        self.value.get()
    }

    pub(crate) fn use_count(&self) -> usize {
        self.strong.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_strong(&self) {
        self.strong.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a strong reference unless the value is already dying.
    pub(crate) fn inc_strong_if_nonzero(&self) -> bool {
        let mut count = self.strong.load(Ordering::Relaxed);
        while count != 0 {
            match self.strong.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => count = current,
            }
        }
        false
    }

    pub(crate) fn inc_weak(&self) {
        self.weak.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops a strong reference; the last one destroys the value (through
    /// the deferred queue) and releases the strong-existence weak.
    ///
    /// # Safety
    ///
    /// The caller must own a strong reference on `block`.
    pub(crate) unsafe fn dec_strong(block: *mut ControlBlock) {
        if (*block).strong.fetch_sub(1, Ordering::AcqRel) == 1 {
            destroy_value_deferred(block);
        }
    }

    /// Drops a weak reference; the last one retires the block.
    ///
    /// # Safety
    ///
    /// The caller must own a weak reference on `block`.
    pub(crate) unsafe fn dec_weak(block: *mut ControlBlock) {
        if (*block).weak.fetch_sub(1, Ordering::AcqRel) == 1 {
            ControlBlock::retire_in(block, ref_count_domain());
        }
    }
}

unsafe impl HazardObject for ControlBlock {
    fn hazard_entry(&self) -> &HazardEntry {
        &self.entry
    }

    unsafe fn reclaim(this: *mut Self) {
        ((*this).destroy_block)(this);
    }
}

// Counter updates are atomic; the value pointer and destroy hooks are
// immutable after construction.
unsafe impl Send for ControlBlock {}
unsafe impl Sync for ControlBlock {}

thread_local! {
    static DEAD_LIST: Cell<*mut ControlBlock> = Cell::new(ptr::null_mut());
    static DESTROY_IN_PROGRESS: Cell<bool> = Cell::new(false);
}

/// Runs `destroy_value` (and the matching `dec_weak`) without recursing:
/// the outermost call on a thread drains a queue the nested calls feed.
unsafe fn destroy_value_deferred(block: *mut ControlBlock) {
    let queued = DEAD_LIST
        .try_with(|list| unsafe {
            (*block).next_dead.set(list.get());
            list.set(block);
        })
        .is_ok();
    if !queued {
        // thread-local storage is already gone; destroy directly
        ((*block).destroy_value)(block);
        ControlBlock::dec_weak(block);
        return;
    }

    let outermost = DESTROY_IN_PROGRESS
        .try_with(|flag| {
            if flag.get() {
                false
            } else {
                flag.set(true);
                true
            }
        })
        .unwrap_or(false);
    if !outermost {
        return;
    }

    loop {
        let head = DEAD_LIST.with(|list| {
            let head = list.get();
            if !head.is_null() {
                list.set(unsafe { (*head).next_dead.get() });
            }
            head
        });
        if head.is_null() {
            break;
        }
        ((*head).destroy_value)(head);
        ControlBlock::dec_weak(head);
    }
    DESTROY_IN_PROGRESS.with(|flag| flag.set(false));
}

#[repr(C)]
struct InplaceBlock<T> {
    header: ControlBlock,
    storage: AlignedStorage<T>,
}

unsafe fn destroy_value_inplace<T>(block: *mut ControlBlock) {
    let this = block as *mut InplaceBlock<T>;
    (*this).storage.drop_in_place();
}

unsafe fn destroy_block_inplace<T>(block: *mut ControlBlock) {
    drop(Box::from_raw(block as *mut InplaceBlock<T>));
}

/// Allocates a block holding `value` inline.
pub(crate) fn make_inplace<T>(value: T) -> *mut ControlBlock {
    let block = Box::into_raw(Box::new(InplaceBlock {
        header: ControlBlock::new(destroy_value_inplace::<T>, destroy_block_inplace::<T>),
        storage: AlignedStorage::new(),
    }));
    unsafe {
        let value_ptr = (*block).storage.write(value);
        (*block).header.value.set(value_ptr as *mut ());
    }
    block as *mut ControlBlock
}

#[repr(C)]
struct OutplaceBlock<T, D> {
    header: ControlBlock,
    ptr: *mut T,
    deleter: D,
}

unsafe fn destroy_value_outplace<T, D: Fn(*mut T)>(block: *mut ControlBlock) {
    let this = block as *mut OutplaceBlock<T, D>;
    ((*this).deleter)((*this).ptr);
}

unsafe fn destroy_block_outplace<T, D: Fn(*mut T)>(block: *mut ControlBlock) {
    drop(Box::from_raw(block as *mut OutplaceBlock<T, D>));
}

/// Allocates a block owning `ptr` through `deleter`.
pub(crate) fn make_outplace<T, D>(ptr: *mut T, deleter: D) -> *mut ControlBlock
where
    D: Fn(*mut T) + Send + 'static,
{
    let block = Box::into_raw(Box::new(OutplaceBlock {
        header: ControlBlock::new(
            destroy_value_outplace::<T, D>,
            destroy_block_outplace::<T, D>,
        ),
        ptr,
        deleter,
    }));
    unsafe {
        (*block).header.value.set(ptr as *mut ());
    }
    block as *mut ControlBlock
}
