//! Lock-free list of claimable entries.
//!
//! Nodes are pushed once and never unlinked, which makes concurrent
//! traversal ABA-free. Each node carries an `active` flag; a thread claims a
//! node with `try_acquire` and hands it back with `release`, so the list
//! doubles as a pool of per-thread slots.

use core::marker::PhantomData;
use core::ptr;

use crossbeam_utils::CachePadded;

use crate::sync::{AtomicBool, AtomicPtr, Ordering};

/// Link embedded in nodes of an [`ActiveList`].
pub(crate) struct ActiveLink<T> {
    next: AtomicPtr<T>,
    active: AtomicBool,
}

impl<T> ActiveLink<T> {
    pub(crate) fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_acquired(&self, order: Ordering) -> bool {
        self.active.load(order)
    }

    /// Claims the node; succeeds iff it was free.
    pub(crate) fn try_acquire(&self) -> bool {
        if self.active.load(Ordering::Relaxed) {
            return false;
        }
        !self.active.swap(true, Ordering::Acquire)
    }

    pub(crate) fn release(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Types that embed an [`ActiveLink`].
///
/// # Safety
///
/// `active_link` must return the same embedded link for the lifetime of the
/// value.
pub(crate) unsafe trait ActiveNode: Sized {
    fn active_link(&self) -> &ActiveLink<Self>;
}

pub(crate) struct ActiveList<T> {
    head: CachePadded<AtomicPtr<T>>,
}

impl<T: ActiveNode> ActiveList<T> {
    pub(crate) fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Publishes `node`, already marked acquired by the caller's claim.
    ///
    /// # Safety
    ///
    /// `node` must be valid, never pushed before, and must outlive the
    /// list. Its memory must be fully initialized: other threads may
    /// observe it as soon as the push completes.
    pub(crate) unsafe fn push(&self, node: *mut T) {
        let link = (*node).active_link();
        link.active.store(true, Ordering::Relaxed);

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            link.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Claims and returns the first free node, or null if every node is
    /// taken.
    pub(crate) fn acquire_free(&self) -> *mut T {
        let mut current = self.head.load(Ordering::Acquire);
        while !current.is_null() {
            let link = unsafe { (*current).active_link() };
            if link.try_acquire() {
                break;
            }
            current = link.next.load(Ordering::Acquire);
        }
        current
    }

    /// Iterates over every node ever pushed, acquired or not.
    pub(crate) fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head.load(Ordering::Acquire),
            _marker: PhantomData,
        }
    }
}

unsafe impl<T: Send + Sync> Send for ActiveList<T> {}
unsafe impl<T: Send + Sync> Sync for ActiveList<T> {}

pub(crate) struct Iter<'a, T> {
    current: *mut T,
    _marker: PhantomData<&'a ActiveList<T>>,
}

impl<'a, T: ActiveNode> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current.is_null() {
            return None;
        }
        let item = unsafe { &*self.current };
        self.current = item.active_link().next.load(Ordering::Acquire);
        Some(item)
    }
}

#[cfg(test)]
struct Slot {
    link: ActiveLink<Slot>,
    id: usize,
}

#[cfg(test)]
unsafe impl ActiveNode for Slot {
    fn active_link(&self) -> &ActiveLink<Self> {
        &self.link
    }
}
