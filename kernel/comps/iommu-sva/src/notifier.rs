// SPDX-License-Identifier: MPL-2.0

//! C7: PASID lifecycle notification.
//!
//! An external pasid owner (for example a VFIO-style user-space handle)
//! reports a pasid as freed through
//! [`crate::pasid::BitmapPasidAllocator::notify_freed`]. If that pasid still
//! has a live binding, tearing it down inline would block the caller for as
//! long as the hardware drain takes, so the notifier instead hands the
//! teardown to a dedicated cleanup task the same way the rest of this
//! codebase offloads long-running device work. Per §4.7 step 3, cleanup
//! unbinds *every* device still attached to the pasid, not just one.

use alloc::sync::Arc;

use aster_frame::task::TaskOptions;

use crate::{
    bind::BindCoordinator,
    binding::BindingState,
    drain::Drainer,
    types::{Pasid, PasidSet},
};

/// Bridges external free-events for one pasid set onto the async cleanup
/// path.
pub struct LifecycleNotifier {
    set: PasidSet,
    coordinator: Arc<BindCoordinator>,
    drainer: Arc<Drainer>,
}

impl LifecycleNotifier {
    pub fn new(set: PasidSet, coordinator: Arc<BindCoordinator>, drainer: Arc<Drainer>) -> Arc<Self> {
        Arc::new(Self {
            set,
            coordinator,
            drainer,
        })
    }

    /// Spawns the async cleanup worker for one externally-freed pasid. Tears
    /// down every device still attached to it; a no-op if the pasid was
    /// already fully unbound through the normal path.
    pub fn spawn_cleanup(self: &Arc<Self>, pasid: Pasid) {
        let this = self.clone();
        TaskOptions::new(move || this.cleanup(pasid))
            .data(())
            .spawn()
            .expect("failed to spawn iommu-sva cleanup task");
    }

    fn cleanup(&self, pasid: Pasid) {
        let drainer = self.drainer.clone();
        let result = self.coordinator.unbind_all(self.set, pasid, move |binding| {
            if binding.state() != BindingState::Draining {
                return;
            }
            let devices = binding.devices.snapshot();
            drainer.drain_pasid(binding.pasid, &devices);
        });

        if let Err(e) = result {
            log::debug!("iommu-sva: lifecycle cleanup for {} found nothing to do: {}", pasid, e);
        }
    }
}

#[cfg(ktest)]
mod test {
    use alloc::sync::Arc;

    use super::*;
    use crate::{
        bind::HostBindRequest,
        drain::InFlightCounter,
        hw::test_doubles::{InMemoryAddressSpace, MockIommu},
        pasid::BitmapPasidAllocator,
        registry::Registry,
        types::{BindFlags, SourceId},
    };

    #[ktest]
    fn cleanup_unbinds_every_device_and_clears_pasid_entries() {
        let registry = Registry::new();
        let coordinator = BindCoordinator::new(registry, BitmapPasidAllocator::new(), BitmapPasidAllocator::new());
        let iommu = MockIommu::new();
        let space = InMemoryAddressSpace::new(0x1000);
        let first = SourceId::from_raw(0x60);
        let second = SourceId::from_raw(0x61);

        let handle = coordinator
            .bind_host(HostBindRequest {
                source_id: first,
                iommu: iommu.clone(),
                domain_id: 0,
                device_tlb_qdep: 0,
                address_space: Some(space.clone()),
                flags: BindFlags::empty(),
                five_level_paging: false,
            })
            .unwrap();
        coordinator
            .bind_host(HostBindRequest {
                source_id: second,
                iommu: iommu.clone(),
                domain_id: 0,
                device_tlb_qdep: 0,
                address_space: Some(space),
                flags: BindFlags::empty(),
                five_level_paging: false,
            })
            .unwrap();

        let drainer = Arc::new(Drainer::new(Arc::new(InFlightCounter::new())));
        // Exercise the synchronous teardown path directly, since spawning a
        // real kernel task is outside the scope of a unit test.
        let notifier = LifecycleNotifier::new(PasidSet::Host, coordinator, drainer);
        notifier.cleanup(handle.pasid);

        assert!(!iommu.is_programmed(first, handle.pasid));
        assert!(!iommu.is_programmed(second, handle.pasid));
    }
}
