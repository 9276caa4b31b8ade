//! The hazard-pointer domain: per-thread records and retired sets, scans
//! and help-scans.

use core::cell::Cell;
use core::ptr;

use static_assertions::const_assert;

use crate::active_list::{ActiveLink, ActiveNode};
use crate::fixed_size_function::FixedSizeFunction;
use crate::hash_set::HashSet;
use crate::sync::{fence, AtomicUsize, Ordering};
use crate::thread_local_list::{ThreadLocalHook, ThreadLocalList, ThreadLocalNode};

use super::record::{HazardRecord, HazardRecords};
use super::retire::HazardEntry;

pub(crate) const DEFAULT_NUM_OF_RECORDS: usize = 8;
pub(crate) const DEFAULT_RETIRED_BUCKETS: usize = 64;
pub(crate) const DEFAULT_SCAN_THRESHOLD: usize = 64;

const_assert!(DEFAULT_RETIRED_BUCKETS.is_power_of_two());
const_assert!(DEFAULT_SCAN_THRESHOLD > 0);

/// Per-thread state of one domain: the record pool hazards are published
/// through and the retired set awaiting reclamation.
pub(crate) struct HazardThreadData {
    hook: ThreadLocalHook<HazardThreadData>,
    domain: Cell<*const HazardDomain>,
    scan_threshold: usize,
    records: HazardRecords,
    retires: HashSet<HazardEntry>,
    retired: AtomicUsize,
    reclaimed: AtomicUsize,
}

impl HazardThreadData {
    fn new(scan_threshold: usize, num_of_records: usize, retired_buckets: usize) -> Self {
        Self {
            hook: ThreadLocalHook::new(),
            domain: Cell::new(ptr::null()),
            scan_threshold,
            records: HazardRecords::new(num_of_records),
            retires: HashSet::with_buckets(retired_buckets),
            retired: AtomicUsize::new(0),
            reclaimed: AtomicUsize::new(0),
        }
    }

    /// Inserts into the retired set; true means the scan threshold was hit.
    ///
    /// # Safety
    ///
    /// The calling thread must own this slot; `entry` must be armed and
    /// unlinked.
    unsafe fn insert_retired(&self, entry: *mut HazardEntry) -> bool {
        self.retires.insert(entry);
        self.retired.fetch_add(1, Ordering::Relaxed);
        self.retires.len() >= self.scan_threshold
    }

    unsafe fn reclaim_all(&self) {
        self.retires.drain(|entry| {
            HazardEntry::run_reclaim(entry);
            self.reclaimed.fetch_add(1, Ordering::Relaxed);
        });
    }
}

impl Drop for HazardThreadData {
    /// Domain teardown: no hazards can remain, reclaim unconditionally.
    fn drop(&mut self) {
        unsafe { self.reclaim_all() };
    }
}

unsafe impl ActiveNode for HazardThreadData {
    fn active_link(&self) -> &ActiveLink<Self> {
        self.hook.active_link()
    }
}

unsafe impl ThreadLocalNode for HazardThreadData {
    fn hook(&self) -> &ThreadLocalHook<Self> {
        &self.hook
    }

    fn on_attach(&self) {
        // the new owner pops records from now on
        self.records.set_owner_thread();
    }

    fn on_detach(&self) {
        let domain = self.domain.get();
        debug_assert!(!domain.is_null());
        if !domain.is_null() {
            unsafe { (*domain).help_scan_from(self) };
        }
    }
}

// Records are shared for scanning; the retired set is only touched by the
// thread currently holding the slot's acquired bit.
unsafe impl Send for HazardThreadData {}
unsafe impl Sync for HazardThreadData {}

/// A reclamation domain. Threads attach lazily on first use; every retired
/// object belongs to exactly one domain and is reclaimed by one of its
/// scans.
///
/// A domain must not be moved once a thread has attached to it, and every
/// attached thread must detach (or exit) before the domain is dropped; the
/// domain detaches the dropping thread itself.
pub struct HazardDomain {
    threads: ThreadLocalList<HazardThreadData>,
}

impl HazardDomain {
    /// Domain with the default record count, retired-set buckets and scan
    /// threshold.
    pub fn new() -> Self {
        Self::with_config(
            DEFAULT_NUM_OF_RECORDS,
            DEFAULT_RETIRED_BUCKETS,
            DEFAULT_SCAN_THRESHOLD,
        )
    }

    /// Domain with an explicit configuration. `retired_buckets` must be a
    /// power of two; `scan_threshold` retires trigger a scan.
    pub fn with_config(
        num_of_records: usize,
        retired_buckets: usize,
        scan_threshold: usize,
    ) -> Self {
        assert!(num_of_records > 0);
        assert!(retired_buckets.is_power_of_two());
        assert!(scan_threshold > 0);
        let factory = FixedSizeFunction::new(move |()| {
            let data = Box::into_raw(Box::new(HazardThreadData::new(
                scan_threshold,
                num_of_records,
                retired_buckets,
            )));
            unsafe { (*data).records.bind() };
            data
        });
        Self {
            threads: ThreadLocalList::with_factory(factory),
        }
    }

    fn with_data<R>(&self, f: impl FnOnce(&HazardThreadData) -> R) -> R {
        self.threads.with(|data| {
            data.domain.set(self);
            f(data)
        })
    }

    /// Binds a per-thread slot to the calling thread. Idempotent; `retire`
    /// and hazard acquisition attach on demand anyway.
    pub fn attach_thread(&self) {
        self.with_data(|_| ());
    }

    /// Unbinds the calling thread's slot, help-scanning its leftovers.
    /// Idempotent.
    pub fn detach_thread(&self) {
        self.threads.detach_thread();
    }

    /// Total objects ever retired into this domain.
    pub fn retired_count(&self) -> usize {
        self.threads
            .iter()
            .map(|data| data.retired.load(Ordering::Relaxed))
            .sum()
    }

    /// Total objects reclaimed by this domain's scans.
    pub fn reclaimed_count(&self) -> usize {
        self.threads
            .iter()
            .map(|data| data.reclaimed.load(Ordering::Relaxed))
            .sum()
    }

    /// Retires a value that does not embed a [`HazardEntry`], deleting it
    /// with `deleter` once unprotected. The protection key is `ptr` itself.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid, unreachable for new readers, and retired at
    /// most once.
    pub unsafe fn retire_ptr<T, F>(&self, ptr: *mut T, deleter: F)
    where
        T: 'static,
        F: Fn(*mut T) + Clone + Send + Sync + 'static,
    {
        let aux = Box::into_raw(Box::new(RetiredPtr {
            entry: HazardEntry::new(),
            deleter: FixedSizeFunction::new(move |value: *mut ()| deleter(value as *mut T)),
        }));
        (*aux).entry.mark_retired();
        (*aux)
            .entry
            .prepare(aux as *mut (), ptr as *mut (), RetiredPtr::reclaim_fn);
        self.retire_entry(&(*aux).entry as *const HazardEntry as *mut HazardEntry);
    }

    /// [`HazardDomain::retire_ptr`] with the plain `Box` deleter.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box::into_raw` and obey the `retire_ptr`
    /// contract.
    pub unsafe fn retire_boxed<T: Send + 'static>(&self, ptr: *mut T) {
        self.retire_ptr(ptr, |value: *mut T| unsafe {
            drop(Box::from_raw(value));
        });
    }

    pub(crate) fn retire_entry(&self, entry: *mut HazardEntry) {
        self.with_data(|data| {
            if unsafe { data.insert_retired(entry) } {
                self.scan_from(data);
            }
        });
    }

    pub(crate) fn acquire_record(&self) -> *mut HazardRecord {
        self.with_data(|data| data.records.acquire())
    }

    /// One reclamation pass over the caller's retired set.
    fn scan_from(&self, data: &HazardThreadData) {
        // pairs with the fence after every hazard publication
        fence(Ordering::SeqCst);
        for slot in self.threads.iter() {
            for record in slot.records.iter() {
                let protected = record.get();
                if protected.is_null() {
                    continue;
                }
                let found = data.retires.find(protected);
                if !found.is_null() {
                    unsafe { (*found).set_protected(true) };
                }
            }
        }

        unsafe {
            data.retires.retain(
                |entry| {
                    if entry.is_protected() {
                        entry.set_protected(false);
                        true
                    } else {
                        false
                    }
                },
                |entry| {
                    HazardEntry::run_reclaim(entry);
                    data.reclaimed.fetch_add(1, Ordering::Relaxed);
                },
            );
        }
    }

    /// Steals the retires of every unowned slot, then scans. Run on detach
    /// so dead threads' retires drain.
    fn help_scan_from(&self, data: &HazardThreadData) {
        for slot in self.threads.iter() {
            // a still-owned slot (including our own) fails the claim
            if slot.active_link().try_acquire() {
                unsafe { data.retires.merge(&slot.retires) };
                slot.active_link().release();
            }
        }
        self.scan_from(data);
    }
}

impl Default for HazardDomain {
    fn default() -> Self {
        Self::new()
    }
}

/// Auxiliary node backing non-intrusive retirement.
struct RetiredPtr {
    entry: HazardEntry,
    deleter: FixedSizeFunction<*mut (), ()>,
}

impl RetiredPtr {
    unsafe fn reclaim_fn(object: *mut ()) {
        let this = object as *mut RetiredPtr;
        let value = (*this).entry.protection_key();
        (*this).deleter.call(value);
        drop(Box::from_raw(this));
    }
}
