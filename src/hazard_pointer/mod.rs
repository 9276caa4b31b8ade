//! Hazard-pointer memory reclamation.
//!
//! Readers publish the address they are about to dereference through a
//! [`HazardPointer`]; writers hand removed objects to a [`HazardDomain`],
//! which reclaims them once no published hazard matches. Each attached
//! thread keeps its own record pool and retired set; detaching (or plain
//! thread exit) hands the slot to the next thread and help-scans whatever
//! the departing thread left behind.

mod domain;
mod hazard;
mod record;
mod retire;

pub use self::domain::HazardDomain;
pub use self::hazard::{GuardedPtr, HazardPointer};
pub use self::retire::{HazardEntry, HazardObject};

use lazy_static::lazy_static;

lazy_static! {
    static ref DEFAULT_DOMAIN: HazardDomain = HazardDomain::new();
}

/// The process-wide domain used when none is named.
pub fn default_domain() -> &'static HazardDomain {
    &DEFAULT_DOMAIN
}

/// Binds a per-thread slot of `domain` to the calling thread. Idempotent.
pub fn attach_thread(domain: &HazardDomain) {
    domain.attach_thread();
}

/// Unbinds the calling thread from `domain`, help-scanning its leftovers.
/// Idempotent.
pub fn detach_thread(domain: &HazardDomain) {
    domain.detach_thread();
}

/// Acquires a hazard record of `domain`.
pub fn make_hazard_pointer(domain: &HazardDomain) -> HazardPointer<'_> {
    HazardPointer::acquire(domain)
}
