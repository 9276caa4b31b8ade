//! A fleet of per-thread slots shared cooperatively between threads.
//!
//! Each list owns an [`ActiveList`] of slots. A thread attaching to a list
//! claims a free slot (or creates one through the list's factory) and binds
//! it in a thread-local owner map keyed by the list's address. Detaching —
//! explicitly or on thread exit — runs the slot's `on_detach` hook and
//! releases the slot for the next thread. Slots are never unlinked; the
//! list deletes them through their stored deleters when it is dropped.

use core::cell::Cell;
use core::ptr;

use crate::active_list::{ActiveLink, ActiveList, ActiveNode, Iter};
use crate::fixed_size_function::FixedSizeFunction;
use crate::hash_set::{HashSet, HashSetNode, SetLink};
use crate::sync::Ordering;

/// Entry of the per-thread owner map. Lives inside [`ThreadLocalHook`] and
/// is type-erased so one map serves every list in the process.
pub(crate) struct OwnerNode {
    link: SetLink<OwnerNode>,
    list_key: Cell<*const ()>,
    object: Cell<*mut ()>,
    on_detach: Cell<Option<unsafe fn(*mut ())>>,
    release: Cell<Option<unsafe fn(*mut ())>>,
}

impl OwnerNode {
    fn new() -> Self {
        Self {
            link: SetLink::new(),
            list_key: Cell::new(ptr::null()),
            object: Cell::new(ptr::null_mut()),
            on_detach: Cell::new(None),
            release: Cell::new(None),
        }
    }
}

unsafe impl HashSetNode for OwnerNode {
    fn set_link(&self) -> &SetLink<Self> {
        &self.link
    }

    fn key(&self) -> *const () {
        self.list_key.get()
    }
}

/// Hook embedded in every slot type used with a [`ThreadLocalList`].
pub(crate) struct ThreadLocalHook<T> {
    owner: OwnerNode,
    active: ActiveLink<T>,
    deleter: FixedSizeFunction<*mut T, ()>,
}

impl<T: ThreadLocalNode> ThreadLocalHook<T> {
    pub(crate) fn new() -> Self {
        Self {
            owner: OwnerNode::new(),
            active: ActiveLink::new(),
            deleter: FixedSizeFunction::new(|ptr: *mut T| unsafe {
                drop(Box::from_raw(ptr));
            }),
        }
    }

    /// The claim flag of the hosting slot; slot types route their
    /// [`ActiveNode`] impl through this.
    pub(crate) fn active_link(&self) -> &ActiveLink<T> {
        &self.active
    }

    /// Replaces the deleter run when the owning list is dropped.
    #[allow(dead_code)]
    pub(crate) fn set_deleter(&mut self, deleter: FixedSizeFunction<*mut T, ()>) {
        self.deleter = deleter;
    }
}

/// Slot types of a [`ThreadLocalList`].
///
/// # Safety
///
/// `hook` must return the same embedded hook for the lifetime of the
/// value, and the [`ActiveNode`] impl must return the hook's link.
pub(crate) unsafe trait ThreadLocalNode: ActiveNode + Sized + 'static {
    fn hook(&self) -> &ThreadLocalHook<Self>;

    /// Called after the slot is bound to the current thread.
    fn on_attach(&self) {}

    /// Called before the slot is unbound from the current thread.
    fn on_detach(&self) {}
}

unsafe fn on_detach_shim<T: ThreadLocalNode>(object: *mut ()) {
    (*(object as *mut T)).on_detach();
}

unsafe fn release_shim<T: ThreadLocalNode>(object: *mut ()) {
    (*(object as *mut T)).hook().active.release();
}

/// Per-thread map from list address to the slot this thread owns in it.
struct ThreadLocalOwner {
    set: HashSet<OwnerNode>,
}

const OWNER_BUCKETS: usize = 8;

impl ThreadLocalOwner {
    fn new() -> Self {
        Self {
            set: HashSet::with_buckets(OWNER_BUCKETS),
        }
    }

    fn find(&self, list: *const ()) -> *mut () {
        let node = self.set.find(list);
        if node.is_null() {
            ptr::null_mut()
        } else {
            unsafe { (*node).object.get() }
        }
    }

    /// Unbinds the slot for `list`, if any. `on_detach` runs while the slot
    /// is still in the map, so reentrant lookups resolve to it.
    unsafe fn detach(&self, list: *const ()) {
        let node = self.set.find(list);
        if node.is_null() {
            return;
        }
        self.detach_node(node);
    }

    unsafe fn detach_node(&self, node: *mut OwnerNode) {
        let object = (*node).object.get();
        if let Some(on_detach) = (*node).on_detach.get() {
            on_detach(object);
        }
        self.set.remove(node);
        if let Some(release) = (*node).release.get() {
            release(object);
        }
    }
}

impl Drop for ThreadLocalOwner {
    /// Thread exit: hand every still-attached slot back to its list.
    fn drop(&mut self) {
        unsafe {
            loop {
                let node = self.set.any();
                if node.is_null() {
                    break;
                }
                self.detach_node(node);
            }
        }
    }
}

thread_local! {
    static OWNER: ThreadLocalOwner = ThreadLocalOwner::new();
}

pub(crate) struct ThreadLocalList<T: ThreadLocalNode> {
    list: ActiveList<T>,
    factory: FixedSizeFunction<(), *mut T>,
}

impl<T: ThreadLocalNode> ThreadLocalList<T> {
    pub(crate) fn with_factory(factory: FixedSizeFunction<(), *mut T>) -> Self {
        Self {
            list: ActiveList::new(),
            factory,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn new() -> Self
    where
        T: Default,
    {
        Self::with_factory(FixedSizeFunction::new(|()| {
            Box::into_raw(Box::new(T::default()))
        }))
    }

    fn key(&self) -> *const () {
        self as *const Self as *const ()
    }

    /// Claims a free slot or creates a fresh one. The returned slot is
    /// acquired by the calling thread.
    fn find_or_create(&self) -> *mut T {
        let found = self.list.acquire_free();
        if !found.is_null() {
            return found;
        }
        let node = self.factory.call(());
        unsafe {
            (*node).hook().owner.list_key.set(self.key());
            self.list.push(node);
        }
        node
    }

    fn attach_in(&self, owner: &ThreadLocalOwner) -> *mut T {
        let found = owner.find(self.key());
        if !found.is_null() {
            return found as *mut T;
        }
        let node = self.find_or_create();
        unsafe {
            let hook = (*node).hook();
            hook.owner.list_key.set(self.key());
            hook.owner.object.set(node as *mut ());
            hook.owner.on_detach.set(Some(on_detach_shim::<T>));
            hook.owner.release.set(Some(release_shim::<T>));
            owner.set.insert(&hook.owner as *const OwnerNode as *mut OwnerNode);
            (*node).on_attach();
        }
        node
    }

    /// Binds a slot to the current thread. Idempotent.
    pub(crate) fn attach_thread(&self) {
        OWNER.with(|owner| {
            self.attach_in(owner);
        });
    }

    /// Unbinds the current thread's slot, if any. Idempotent.
    pub(crate) fn detach_thread(&self) {
        let _ = OWNER.try_with(|owner| unsafe { owner.detach(self.key()) });
    }

    /// Runs `f` with the current thread's slot, attaching on demand.
    ///
    /// If the thread-local owner map is already gone (the thread is
    /// exiting), a slot is claimed just for this call and handed back —
    /// including its `on_attach`/`on_detach` hooks — afterwards.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        match OWNER.try_with(|owner| self.attach_in(owner)) {
            Ok(node) => f(unsafe { &*node }),
            Err(_) => {
                let node = self.find_or_create();
                unsafe {
                    (*node).on_attach();
                    let result = f(&*node);
                    (*node).on_detach();
                    (*node).hook().active.release();
                    result
                }
            }
        }
    }

    /// Iterates over every slot, attached or free.
    pub(crate) fn iter(&self) -> Iter<'_, T> {
        self.list.iter()
    }
}

impl<T: ThreadLocalNode> Drop for ThreadLocalList<T> {
    /// Deletes all slots. The current thread is detached first; every other
    /// thread must already have detached or exited.
    fn drop(&mut self) {
        self.detach_thread();
        let nodes: Vec<*mut T> = self
            .list
            .iter()
            .map(|item| item as *const T as *mut T)
            .collect();
        for node in nodes {
            unsafe {
                let hook = (*node).hook();
                debug_assert!(
                    !hook.active.is_acquired(Ordering::Acquire),
                    "dropping a thread-local list with attached slots"
                );
                let deleter = hook.deleter.clone();
                deleter.call(node);
            }
        }
    }
}

unsafe impl<T: ThreadLocalNode + Send + Sync> Send for ThreadLocalList<T> {}
unsafe impl<T: ThreadLocalNode + Send + Sync> Sync for ThreadLocalList<T> {}
