//! Hazard record storage of a per-thread slot.

use core::cell::Cell;
use core::ptr;

use crate::free_list::{FreeLink, FreeList, FreeListNode};
use crate::sync::{AtomicPtr, Ordering};

/// One published "do not reclaim" address.
pub(crate) struct HazardRecord {
    protected: AtomicPtr<()>,
    link: FreeLink<HazardRecord>,
    owner: Cell<*const FreeList<HazardRecord>>,
}

impl HazardRecord {
    fn new() -> Self {
        Self {
            protected: AtomicPtr::new(ptr::null_mut()),
            link: FreeLink::new(),
            owner: Cell::new(ptr::null()),
        }
    }

    pub(crate) fn protect(&self, ptr: *const ()) {
        self.protected.store(ptr as *mut (), Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        self.protected.store(ptr::null_mut(), Ordering::Release);
    }

    pub(crate) fn get(&self) -> *const () {
        self.protected.load(Ordering::Acquire)
    }

    /// Clears the record and returns it to the pool it was allocated from.
    /// The pool's free list routes the push by the calling thread.
    ///
    /// # Safety
    ///
    /// `record` must have been handed out by `HazardRecords::acquire` and
    /// not yet returned; its pool must still be alive.
    pub(crate) unsafe fn release_to_owner(record: *mut HazardRecord) {
        (*record).clear();
        let owner = (*record).owner.get();
        debug_assert!(!owner.is_null(), "record was never bound to a pool");
        (*owner).push(record);
    }
}

unsafe impl FreeListNode for HazardRecord {
    fn free_link(&self) -> &FreeLink<Self> {
        &self.link
    }
}

unsafe impl Send for HazardRecord {}
unsafe impl Sync for HazardRecord {}

/// Fixed array of records plus the free list handing them out.
pub(crate) struct HazardRecords {
    slots: Box<[HazardRecord]>,
    free: FreeList<HazardRecord>,
}

impl HazardRecords {
    pub(crate) fn new(count: usize) -> Self {
        let this = Self {
            slots: (0..count).map(|_| HazardRecord::new()).collect(),
            free: FreeList::new(),
        };
        for slot in this.slots.iter() {
            // records live in the boxed slice, so their addresses are
            // already stable
            unsafe { this.free.push_local(slot as *const HazardRecord as *mut HazardRecord) };
        }
        this
    }

    /// Points every record back at the free list. Must be called once the
    /// containing allocation has reached its final address.
    pub(crate) fn bind(&self) {
        for slot in self.slots.iter() {
            slot.owner.set(&self.free);
        }
    }

    /// Re-stamps the free list's owner to the calling thread. Called when a
    /// per-thread slot changes hands.
    pub(crate) fn set_owner_thread(&self) {
        self.free.set_owner();
    }

    /// Pops a free record; null when the pool is exhausted.
    pub(crate) fn acquire(&self) -> *mut HazardRecord {
        unsafe { self.free.pop() }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &HazardRecord> {
        self.slots.iter()
    }
}
