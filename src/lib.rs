//! Lock-free memory reclamation primitives.
//!
//! The crate provides hazard-pointer based reclamation
//! ([`HazardDomain`], [`HazardPointer`], [`HazardObject`]) and a family of
//! reference-counted pointers built on top of it ([`SharedPtr`],
//! [`WeakPtr`], [`MarkedSharedPtr`]) whose atomic slots
//! ([`AtomicSharedPtr`], [`AtomicMarkedSharedPtr`]) are lock-free: loads
//! protect the control block with a hazard pointer instead of locking, and
//! control blocks are themselves retired through a dedicated domain.
//!
//! Threads participate lazily: the first retire or hazard acquisition
//! binds a per-thread slot to the calling thread, and plain thread exit
//! hands the slot (records, pending retires and all) back for reuse.
//!
//! The `check-loom` feature switches the leaf primitives to loom atomics
//! for model checking; regular tests are compiled out under it.

mod active_list;
mod free_list;
mod hash_set;
mod sync;
mod thread_local_list;
mod utils;

pub mod fixed_size_function;
pub mod hazard_pointer;
pub mod marked_ptr;
pub mod shared_ptr;

pub use fixed_size_function::{EmptyCall, FixedSizeFunction};
pub use hazard_pointer::{
    attach_thread, default_domain, detach_thread, make_hazard_pointer, GuardedPtr, HazardDomain,
    HazardEntry, HazardObject, HazardPointer,
};
pub use marked_ptr::{AtomicMarkedPtr, MarkedPtr};
pub use shared_ptr::{
    default_failure_ordering, make_shared, AtomicMarkedSharedPtr, AtomicSharedPtr, MarkedSharedPtr,
    SharedPtr, WeakPtr,
};
