// SPDX-License-Identifier: MPL-2.0

//! Shared newtypes used across the binding lifecycle.

use core::fmt;

pub use aster_pci::{PciDeviceLocation, SourceId};

/// A 20-bit Process Address Space ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pasid(u32);

impl Pasid {
    pub const fn new(raw: u32) -> Self {
        Self(raw & (crate::config::PASID_MAX - 1))
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pasid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pasid:{:#x}", self.0)
    }
}

/// Which identifier set a pasid is drawn from. Host-mode and guest-mode
/// bindings are tracked separately so a guest-supplied pasid can never
/// collide with one this subsystem allocated itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasidSet {
    Host,
    Guest,
}

/// The translation mode a binding uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// First-level translation rooted at a user address space's page table.
    HostUser,
    /// First-level translation rooted at the kernel's page table; no address
    /// space is associated.
    HostSupervisor,
    /// Nested translation: a guest-supplied first-level table stitched over
    /// the domain's second-level tables.
    GuestNested,
}

bitflags::bitflags! {
    /// Bind-time configuration flags.
    pub struct BindFlags: u32 {
        /// No address space; binds against the kernel's root page table.
        const SUPERVISOR_MODE = 1 << 0;
        /// Marks the binding as nested (paired with a vendor descriptor).
        const GUEST_MODE = 1 << 1;
        /// The `guest_pasid` field of the guest descriptor is meaningful.
        const GUEST_PASID_VALID = 1 << 2;
        /// Use the domain's pre-assigned host pasid instead of one supplied
        /// in the descriptor.
        const HPASID_DEFAULT = 1 << 3;
    }
}

/// Requested access kind for a page fault or a region permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRequest {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// The request was issued with the privileged-mode bit set.
    pub privileged: bool,
}

/// An opaque handle returned by [`crate::bind::BindCoordinator::bind_host`]
/// or [`crate::bind::BindCoordinator::bind_guest`], identifying one (device,
/// binding) edge for a later [`crate::bind::BindCoordinator::unbind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindHandle {
    pub source_id: SourceId,
    pub pasid: Pasid,
}
