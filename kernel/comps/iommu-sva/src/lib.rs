// SPDX-License-Identifier: MPL-2.0

//! Shared Virtual Addressing for IOMMU-capable devices.
//!
//! Binds a device to a process's (or the kernel's, or a guest's) page
//! tables through a PASID, and keeps that binding correct for as long as it
//! lives: Page Request Queue faults get resolved against the bound address
//! space (C1/C2), TLB state is kept coherent as the address space changes
//! (C4), and a binding is drained before its pasid is ever reused (C3/C6/C7).
//!
//! Register-level IOMMU programming, PASID table entry encoding, and a real
//! `VmSpace`-backed address space are all out of scope here; [`hw`] is the
//! trait boundary the rest of the crate programs against, exercised in
//! tests through the in-memory doubles in [`hw::test_doubles`].
#![no_std]
#![deny(unsafe_code)]
#![allow(dead_code)]

extern crate alloc;
#[cfg(ktest)]
#[macro_use]
extern crate ktest;

pub mod bind;
pub mod binding;
pub mod config;
pub mod descriptor;
pub mod drain;
pub mod error;
pub mod fault;
pub mod hw;
pub mod notifier;
pub mod observer;
pub mod pasid;
pub mod prq;
pub mod registry;
pub mod types;

use alloc::sync::Arc;

use component::{ComponentInitError, init_component};
use spin::Once;

pub use crate::{
    bind::{BindCoordinator, GuestBindRequest, HostBindRequest},
    binding::Binding,
    descriptor::{PageGroupResponse, PrqDescriptor, ResponseCode},
    error::{Error, Result},
    hw::{AddressSpaceObserver, FaultSink, GuestDescriptor, HostAddressSpace, IommuHw, Invalidation},
    types::{AccessRequest, BindFlags, BindHandle, Mode, Pasid, PasidSet},
};

use crate::{drain::{Drainer, InFlightCounter}, notifier::LifecycleNotifier, pasid::BitmapPasidAllocator, registry::Registry};

/// The subsystem-wide state shared by every bound IOMMU unit: one registry,
/// the host/guest pasid allocators, and a single in-flight counter keyed by
/// pasid — shared across every unit's PRQ reader, since a pasid's in-flight
/// descriptor count needs draining to zero regardless of which unit posted
/// them.
pub struct SvaSubsystem {
    pub registry: Arc<Registry>,
    pub host_pasids: Arc<BitmapPasidAllocator>,
    pub guest_pasids: Arc<BitmapPasidAllocator>,
    pub coordinator: Arc<BindCoordinator>,
    pub in_flight: Arc<InFlightCounter>,
    /// C7: reacts to a guest-mode pasid being freed out from under a live
    /// binding, e.g. by a crashed VFIO user.
    pub guest_notifier: Arc<LifecycleNotifier>,
}

impl SvaSubsystem {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();
        let host_pasids = BitmapPasidAllocator::new();
        let guest_pasids = BitmapPasidAllocator::new();
        let coordinator = BindCoordinator::new(registry.clone(), host_pasids.clone(), guest_pasids.clone());
        let in_flight = Arc::new(InFlightCounter::new());
        let drainer = Arc::new(Drainer::new(in_flight.clone()));
        let guest_notifier = LifecycleNotifier::new(PasidSet::Guest, coordinator.clone(), drainer);

        let notifier = guest_notifier.clone();
        guest_pasids.on_free(Arc::new(move |pasid| notifier.spawn_cleanup(pasid)));

        Arc::new(Self {
            registry,
            host_pasids,
            guest_pasids,
            coordinator,
            in_flight,
            guest_notifier,
        })
    }

    /// Builds a per-IOMMU-unit PRQ reader against this subsystem's shared
    /// registry and in-flight counter.
    pub fn new_prq_reader(&self, iommu: Arc<dyn IommuHw>, fault_sink: Arc<dyn FaultSink>, five_level_paging: bool) -> prq::PrqReader {
        prq::PrqReader::new(iommu, self.registry.clone(), self.in_flight.clone(), fault_sink, five_level_paging)
    }
}

static SUBSYSTEM: Once<Arc<SvaSubsystem>> = Once::new();

/// Returns the global subsystem instance, initializing it on first call.
pub fn subsystem() -> Arc<SvaSubsystem> {
    SUBSYSTEM.call_once(SvaSubsystem::new).clone()
}

#[init_component]
fn init() -> core::result::Result<(), ComponentInitError> {
    let _ = subsystem();
    Ok(())
}

#[cfg(ktest)]
mod test {
    use super::*;

    #[ktest]
    fn subsystem_is_a_singleton() {
        let a = subsystem();
        let b = subsystem();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
