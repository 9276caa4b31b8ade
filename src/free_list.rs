//! Intrusive free list with a lock-free global side and an owner-private
//! local side.
//!
//! Any thread may `push`; only the owner thread pops. A pop first drains the
//! local stack and otherwise steals the whole global stack with a single
//! exchange, so pops never contend with each other. Ownership can be handed
//! to another thread with `set_owner` while no pop is in flight.

use core::cell::Cell;
use core::ptr;

use crossbeam_utils::CachePadded;

use crate::sync::{AtomicPtr, AtomicUsize, Ordering};
use crate::utils::current_thread_id;

/// Link embedded in nodes of a [`FreeList`].
pub(crate) struct FreeLink<T> {
    next: Cell<*mut T>,
}

impl<T> FreeLink<T> {
    pub(crate) fn new() -> Self {
        Self {
            next: Cell::new(ptr::null_mut()),
        }
    }
}

/// Types that embed a [`FreeLink`].
///
/// # Safety
///
/// `free_link` must return the same embedded link for the lifetime of the
/// value, and a node must not be pushed onto two lists at once.
pub(crate) unsafe trait FreeListNode: Sized {
    fn free_link(&self) -> &FreeLink<Self>;
}

pub(crate) struct FreeList<T> {
    global_head: CachePadded<AtomicPtr<T>>,
    local_head: Cell<*mut T>,
    owner: AtomicUsize,
}

impl<T: FreeListNode> FreeList<T> {
    pub(crate) fn new() -> Self {
        Self {
            global_head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            local_head: Cell::new(ptr::null_mut()),
            owner: AtomicUsize::new(current_thread_id()),
        }
    }

    /// Makes the calling thread the owner. Must not race with a `pop`.
    pub(crate) fn set_owner(&self) {
        self.owner.store(current_thread_id(), Ordering::Relaxed);
    }

    fn is_owner(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread_id()
    }

    /// Returns `node` to the list, picking the local or global side by the
    /// calling thread.
    ///
    /// # Safety
    ///
    /// `node` must be valid, not currently linked, and must outlive the
    /// list.
    pub(crate) unsafe fn push(&self, node: *mut T) {
        if self.is_owner() {
            self.push_local(node);
        } else {
            self.push_global(node);
        }
    }

    /// # Safety
    ///
    /// Owner thread only; same node requirements as `push`.
    pub(crate) unsafe fn push_local(&self, node: *mut T) {
        debug_assert!(self.is_owner());
        (*node).free_link().next.set(self.local_head.get());
        self.local_head.set(node);
    }

    /// # Safety
    ///
    /// Same node requirements as `push`; any thread may call.
    pub(crate) unsafe fn push_global(&self, node: *mut T) {
        let mut head = self.global_head.load(Ordering::Relaxed);
        loop {
            (*node).free_link().next.set(head);
            match self.global_head.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Pops a node, stealing the global stack if the local one is empty.
    /// Returns null when both are empty.
    ///
    /// # Safety
    ///
    /// Owner thread only.
    pub(crate) unsafe fn pop(&self) -> *mut T {
        debug_assert!(self.is_owner());
        if self.local_head.get().is_null() {
            self.local_head
                .set(self.global_head.swap(ptr::null_mut(), Ordering::Acquire));
        }
        let result = self.local_head.get();
        if !result.is_null() {
            self.local_head.set((*result).free_link().next.get());
        }
        result
    }

    /// Fast approximate emptiness check.
    pub(crate) fn is_empty(&self) -> bool {
        self.local_head.get().is_null() && self.global_head.load(Ordering::Relaxed).is_null()
    }
}

unsafe impl<T: Send> Send for FreeList<T> {}
unsafe impl<T: Send> Sync for FreeList<T> {}

#[cfg(all(test, not(feature = "check-loom")))]
mod tests {
    use super::*;

    struct Node {
        link: FreeLink<Node>,
        value: usize,
    }

    unsafe impl Send for Node {}

    unsafe impl FreeListNode for Node {
        fn free_link(&self) -> &FreeLink<Self> {
            &self.link
        }
    }

    fn node(value: usize) -> *mut Node {
        Box::into_raw(Box::new(Node {
            link: FreeLink::new(),
            value,
        }))
    }

    unsafe fn free(node: *mut Node) {
        drop(Box::from_raw(node));
    }

    #[test]
    fn owner_push_pop_is_lifo() {
        let list = FreeList::new();
        let nodes: Vec<_> = (0..4).map(node).collect();
        unsafe {
            for &n in &nodes {
                list.push(n);
            }
            for expected in (0..4).rev() {
                let popped = list.pop();
                assert_eq!((*popped).value, expected);
                free(popped);
            }
            assert!(list.pop().is_null());
        }
        assert!(list.is_empty());
    }

    #[test]
    fn foreign_pushes_reach_the_owner() {
        let list = FreeList::new();
        crossbeam_utils::thread::scope(|scope| {
            for value in 0..8 {
                let list = &list;
                scope.spawn(move |_| unsafe {
                    list.push(node(value));
                });
            }
        })
        .unwrap();

        assert!(!list.is_empty());
        let mut seen = Vec::new();
        unsafe {
            loop {
                let popped = list.pop();
                if popped.is_null() {
                    break;
                }
                seen.push((*popped).value);
                free(popped);
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn owner_handoff() {
        let list = FreeList::new();
        unsafe {
            list.push(node(1));
        }
        crossbeam_utils::thread::scope(|scope| {
            let list = &list;
            scope.spawn(move |_| unsafe {
                // this thread becomes the owner and drains the list
                list.set_owner();
                let popped = list.pop();
                assert_eq!((*popped).value, 1);
                free(popped);
                assert!(list.pop().is_null());
            });
        })
        .unwrap();
        list.set_owner();
        assert!(list.is_empty());
    }
}
