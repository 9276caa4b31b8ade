//! Intrusive retirement support.
//!
//! An object becomes retirable by embedding a [`HazardEntry`] and
//! implementing [`HazardObject`]. The entry doubles as the node of the
//! per-thread retired set; its key is the address readers protect, and the
//! key's mark bit means "a hazard matched this entry during the current
//! scan".

use core::cell::Cell;
use core::ptr;

use crate::hash_set::{HashSetNode, SetLink};
use crate::marked_ptr::MarkedPtr;
use crate::sync::{AtomicBool, Ordering};

use super::domain::HazardDomain;
use super::default_domain;

/// Intrusive node carried by every retirable object.
pub struct HazardEntry {
    link: SetLink<HazardEntry>,
    key: Cell<MarkedPtr<()>>,
    object: Cell<*mut ()>,
    reclaim: Cell<Option<unsafe fn(*mut ())>>,
    retired: AtomicBool,
}

impl HazardEntry {
    pub fn new() -> Self {
        Self {
            link: SetLink::new(),
            key: Cell::new(MarkedPtr::null()),
            object: Cell::new(ptr::null_mut()),
            reclaim: Cell::new(None),
            retired: AtomicBool::new(false),
        }
    }

    /// Arms the entry for retirement. `key` is the address hazard records
    /// are compared against; `object` is handed to `reclaim`.
    pub(crate) fn prepare(&self, object: *mut (), key: *mut (), reclaim: unsafe fn(*mut ())) {
        self.key.set(MarkedPtr::new(key as *mut ()));
        self.object.set(object);
        self.reclaim.set(Some(reclaim));
    }

    /// Flags a repeated retire; debug builds assert on it.
    pub(crate) fn mark_retired(&self) -> bool {
        self.retired.swap(true, Ordering::Relaxed)
    }

    /// The address hazard records are compared against.
    pub(crate) fn protection_key(&self) -> *mut () {
        self.key.get().ptr()
    }

    pub(crate) fn is_protected(&self) -> bool {
        self.key.get().is_marked()
    }

    pub(crate) fn set_protected(&self, value: bool) {
        self.key.set(self.key.get().set_mark(value));
    }

    /// Invokes the reclaim function. The entry (and its host object) must
    /// be treated as freed afterwards.
    ///
    /// # Safety
    ///
    /// `entry` must be armed, unlinked, and not referenced again.
    pub(crate) unsafe fn run_reclaim(entry: *mut HazardEntry) {
        let object = (*entry).object.get();
        if let Some(reclaim) = (*entry).reclaim.get() {
            reclaim(object);
        } else {
            debug_assert!(false, "reclaiming an entry that was never armed");
        }
    }
}

impl Default for HazardEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardEntry {
    fn drop(&mut self) {
        debug_assert!(
            !self.link.is_linked(),
            "dropping an object that is still in a retired set"
        );
    }
}

unsafe impl HashSetNode for HazardEntry {
    fn set_link(&self) -> &SetLink<Self> {
        &self.link
    }

    fn key(&self) -> *const () {
        self.key.get().ptr() as *const ()
    }
}

// Entries move between threads with their retired sets; all access is
// serialized through slot ownership.
unsafe impl Send for HazardEntry {}
unsafe impl Sync for HazardEntry {}

unsafe fn reclaim_shim<T: HazardObject>(object: *mut ()) {
    T::reclaim(object as *mut T);
}

/// Types that can be retired through a [`HazardDomain`].
///
/// # Safety
///
/// `hazard_entry` must return the same embedded entry for the lifetime of
/// the value, and the value must be heap-stable (its address is the
/// protection key).
pub unsafe trait HazardObject: Sized + Send + 'static {
    fn hazard_entry(&self) -> &HazardEntry;

    /// Frees a reclaimed object. The default drops the heap allocation.
    ///
    /// # Safety
    ///
    /// `this` was retired, no hazard protects it, and it is not used again.
    unsafe fn reclaim(this: *mut Self) {
        drop(Box::from_raw(this));
    }

    /// Retires `this` into the default domain.
    ///
    /// # Safety
    ///
    /// `this` must be valid, unreachable for new readers, and retired at
    /// most once.
    unsafe fn retire(this: *mut Self) {
        Self::retire_in(this, default_domain());
    }

    /// Retires `this` into `domain`.
    ///
    /// # Safety
    ///
    /// As for [`HazardObject::retire`].
    unsafe fn retire_in(this: *mut Self, domain: &HazardDomain) {
        let entry = (*this).hazard_entry();
        let already = entry.mark_retired();
        debug_assert!(!already, "double retire");
        entry.prepare(this as *mut (), this as *mut (), reclaim_shim::<Self>);
        domain.retire_entry(entry as *const HazardEntry as *mut HazardEntry);
    }
}
