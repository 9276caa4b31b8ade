//! Intrusive chained hash set keyed by raw pointers.
//!
//! Nodes live inside their host objects; the set only owns the bucket
//! array. The set itself is single-threaded — callers serialize access by
//! thread-local ownership or by claiming the owning slot on an active list.

use core::cell::Cell;
use core::ptr;

use crate::utils::pointer_hash;

/// Link embedded in nodes of a [`HashSet`].
pub(crate) struct SetLink<T> {
    next: Cell<*mut T>,
    linked: Cell<bool>,
}

impl<T> SetLink<T> {
    pub(crate) fn new() -> Self {
        Self {
            next: Cell::new(ptr::null_mut()),
            linked: Cell::new(false),
        }
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.linked.get()
    }
}

/// Types that embed a [`SetLink`] and expose a stable key.
///
/// # Safety
///
/// `set_link` must return the same embedded link for the lifetime of the
/// value, and `key` must stay constant while the node is linked.
pub(crate) unsafe trait HashSetNode: Sized {
    fn set_link(&self) -> &SetLink<Self>;
    fn key(&self) -> *const ();
}

fn bucket_index(key: *const (), mask: usize) -> usize {
    // keys point at word-aligned objects; drop the dead bits
    pointer_hash(key as *const usize) & mask
}

pub(crate) struct HashSet<T> {
    buckets: Box<[Cell<*mut T>]>,
    len: Cell<usize>,
}

impl<T: HashSetNode> HashSet<T> {
    pub(crate) fn with_buckets(count: usize) -> Self {
        assert!(count.is_power_of_two(), "bucket count must be a power of two");
        let buckets = (0..count).map(|_| Cell::new(ptr::null_mut())).collect();
        Self {
            buckets,
            len: Cell::new(0),
        }
    }

    fn bucket(&self, key: *const ()) -> &Cell<*mut T> {
        &self.buckets[bucket_index(key, self.buckets.len() - 1)]
    }

    pub(crate) fn len(&self) -> usize {
        self.len.get()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len.get() == 0
    }

    /// Links `node` into the set.
    ///
    /// # Safety
    ///
    /// `node` must be valid, unlinked, and must stay valid while linked.
    pub(crate) unsafe fn insert(&self, node: *mut T) {
        let link = (*node).set_link();
        debug_assert!(!link.is_linked());
        let bucket = self.bucket((*node).key());
        link.next.set(bucket.get());
        link.linked.set(true);
        bucket.set(node);
        self.len.set(self.len.get() + 1);
    }

    /// Returns some linked node, or null if the set is empty.
    pub(crate) fn any(&self) -> *mut T {
        for bucket in self.buckets.iter() {
            let head = bucket.get();
            if !head.is_null() {
                return head;
            }
        }
        ptr::null_mut()
    }

    /// Finds a linked node by key.
    pub(crate) fn find(&self, key: *const ()) -> *mut T {
        let mut current = self.bucket(key).get();
        while !current.is_null() {
            let item = unsafe { &*current };
            if item.key() == key {
                break;
            }
            current = item.set_link().next.get();
        }
        current
    }

    /// Unlinks `node` from the set.
    ///
    /// # Safety
    ///
    /// `node` must be linked in this set.
    pub(crate) unsafe fn remove(&self, node: *mut T) {
        let bucket = self.bucket((*node).key());
        let mut prev = bucket;
        let mut current = bucket.get();
        loop {
            debug_assert!(!current.is_null(), "node is not in the set");
            if current == node {
                let link = (*current).set_link();
                prev.set(link.next.get());
                link.linked.set(false);
                self.len.set(self.len.get() - 1);
                return;
            }
            let link = (*current).set_link();
            prev = &link.next;
            current = link.next.get();
        }
    }

    /// Steals every node of `other` into `self`.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to both sets.
    pub(crate) unsafe fn merge(&self, other: &HashSet<T>) {
        for bucket in other.buckets.iter() {
            let mut current = bucket.replace(ptr::null_mut());
            while !current.is_null() {
                let link = (*current).set_link();
                let next = link.next.get();
                link.linked.set(false);
                other.len.set(other.len.get() - 1);
                self.insert(current);
                current = next;
            }
        }
    }

    /// Keeps the nodes for which `keep` returns true; the rest are unlinked
    /// and handed to `removed`, which may free them.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the set.
    pub(crate) unsafe fn retain(
        &self,
        mut keep: impl FnMut(&T) -> bool,
        mut removed: impl FnMut(*mut T),
    ) {
        for bucket in self.buckets.iter() {
            let mut prev: &Cell<*mut T> = bucket;
            let mut current = bucket.get();
            while !current.is_null() {
                let link = (*current).set_link();
                let next = link.next.get();
                if keep(&*current) {
                    prev = &link.next;
                } else {
                    prev.set(next);
                    link.linked.set(false);
                    self.len.set(self.len.get() - 1);
                    removed(current);
                }
                current = next;
            }
        }
    }

    /// Unlinks every node, handing each to `f`, which may free it.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the set.
    pub(crate) unsafe fn drain(&self, mut f: impl FnMut(*mut T)) {
        self.retain(|_| false, |node| f(node));
    }
}

#[cfg(all(test, not(feature = "check-loom")))]
mod tests {
    use super::*;

    struct Entry {
        link: SetLink<Entry>,
        key: usize,
        value: usize,
    }

    unsafe impl HashSetNode for Entry {
        fn set_link(&self) -> &SetLink<Self> {
            &self.link
        }

        fn key(&self) -> *const () {
            self.key as *const ()
        }
    }

    fn entry(key: usize, value: usize) -> *mut Entry {
        Box::into_raw(Box::new(Entry {
            link: SetLink::new(),
            key,
            value,
        }))
    }

    unsafe fn free(node: *mut Entry) {
        drop(Box::from_raw(node));
    }

    // keys spaced a word apart so they spread over buckets
    fn key(i: usize) -> usize {
        (i + 1) * 8
    }

    #[test]
    fn insert_find_remove() {
        let set = HashSet::with_buckets(4);
        let nodes: Vec<_> = (0..16).map(|i| entry(key(i), i)).collect();
        unsafe {
            for &n in &nodes {
                set.insert(n);
            }
            assert_eq!(set.len(), 16);
            for i in 0..16 {
                let found = set.find(key(i) as *const ());
                assert_eq!((*found).value, i);
            }
            assert!(set.find(key(99) as *const ()).is_null());

            set.remove(nodes[3]);
            assert!(set.find(key(3) as *const ()).is_null());
            assert_eq!(set.len(), 15);
            assert!(!(*nodes[3]).link.is_linked());

            for &n in &nodes {
                free(n);
            }
        }
    }

    #[test]
    fn merge_steals_everything() {
        let dst = HashSet::with_buckets(8);
        let src = HashSet::with_buckets(2);
        let nodes: Vec<_> = (0..8).map(|i| entry(key(i), i)).collect();
        unsafe {
            for &n in &nodes[..4] {
                dst.insert(n);
            }
            for &n in &nodes[4..] {
                src.insert(n);
            }
            dst.merge(&src);
            assert_eq!(dst.len(), 8);
            assert!(src.is_empty());
            for i in 0..8 {
                assert!(!dst.find(key(i) as *const ()).is_null());
            }
            for &n in &nodes {
                free(n);
            }
        }
    }

    #[test]
    fn retain_unlinks_before_freeing() {
        let set = HashSet::with_buckets(4);
        let nodes: Vec<_> = (0..10).map(|i| entry(key(i), i)).collect();
        unsafe {
            for &n in &nodes {
                set.insert(n);
            }
            let mut freed = 0;
            set.retain(
                |e| e.value % 2 == 0,
                |n| {
                    free(n);
                    freed += 1;
                },
            );
            assert_eq!(freed, 5);
            assert_eq!(set.len(), 5);
            for i in 0..10 {
                let found = set.find(key(i) as *const ());
                assert_eq!(found.is_null(), i % 2 != 0);
            }
            set.drain(|n| free(n));
            assert!(set.is_empty());
        }
    }
}
