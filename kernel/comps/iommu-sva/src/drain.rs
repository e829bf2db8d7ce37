// SPDX-License-Identifier: MPL-2.0

//! C3: the two-phase drainer that runs once a binding has transitioned to
//! `Draining` and before its pasid is released back to the allocator.
//!
//! Phase one (software drain) waits for the PRQ reader to finish with every
//! descriptor it has in flight *for this pasid specifically* — unrelated
//! fault traffic for other pasids on the same IOMMU unit never blocks it, per
//! §4.4 phase 1. Phase two (hardware drain) submits the fenced invalidation
//! batch and polls the IOMMU until it reports no response outstanding,
//! retrying the submission itself if the hardware rejects it (§7:
//! "invalidation is retried").

use alloc::{collections::BTreeMap, sync::Arc};

use aster_frame::sync::{SpinLock, WaitQueue};

use crate::{binding::DeviceBinding, config::PRQ_DRAIN_WARN_SPINS, hw::Invalidation, types::Pasid};

/// Tracks, per pasid, how many PRQ descriptors the reader has in flight.
/// [`crate::prq::PrqReader`] increments this before dispatching a
/// descriptor and decrements it once the response has been posted (or
/// handed off to the fault sink); the drainer's software-drain phase waits
/// for one pasid's count to reach zero, never the whole unit's.
#[derive(Default)]
pub struct InFlightCounter {
    counts: SpinLock<BTreeMap<u32, usize>>,
    queue: WaitQueue,
}

impl InFlightCounter {
    pub fn new() -> Self {
        Self {
            counts: SpinLock::new(BTreeMap::new()),
            queue: WaitQueue::new(),
        }
    }

    pub fn enter(&self, pasid: Pasid) {
        *self.counts.lock().entry(pasid.raw()).or_insert(0) += 1;
    }

    pub fn leave(&self, pasid: Pasid) {
        let mut counts = self.counts.lock();
        let Some(count) = counts.get_mut(&pasid.raw()) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            counts.remove(&pasid.raw());
            drop(counts);
            self.queue.wake_all();
        }
    }

    /// Blocks until every descriptor for `pasid` entered before this call
    /// has left.
    pub fn drain(&self, pasid: Pasid) {
        self.queue
            .wait_until(|| (!self.counts.lock().contains_key(&pasid.raw())).then_some(()));
    }
}

/// Drains one binding's in-flight state across every device it was bound
/// to, in preparation for freeing its pasid.
pub struct Drainer {
    in_flight: Arc<InFlightCounter>,
}

impl Drainer {
    pub fn new(in_flight: Arc<InFlightCounter>) -> Self {
        Self { in_flight }
    }

    /// §4.4: runs both phases for `pasid` across `devices`. Devices with no
    /// live mapping left (`address_space` already released) still need a
    /// hardware drain, since the PASID table entry is cleared separately by
    /// the observer's `address_space_released` callback, not here.
    pub fn drain_pasid(&self, pasid: Pasid, devices: &[Arc<DeviceBinding>]) {
        self.in_flight.drain(pasid);
        self.hardware_drain(pasid, devices);
    }

    fn hardware_drain(&self, pasid: Pasid, devices: &[Arc<DeviceBinding>]) {
        for device in devices {
            let mut batch = alloc::vec![
                Invalidation::Iotlb {
                    pasid,
                    start: 0,
                    end: usize::MAX,
                },
                Invalidation::FencedWait,
            ];
            if device.has_device_tlb() {
                batch.push(Invalidation::DeviceTlb {
                    source_id: device.source_id,
                    qdep: device.device_tlb_qdep,
                    pfsid: device.pfsid,
                });
            }

            let mut attempts = 0u32;
            while let Err(e) = device.iommu.submit_invalidation(&batch, true) {
                attempts += 1;
                if attempts == PRQ_DRAIN_WARN_SPINS {
                    log::warn!(
                        "iommu-sva: drain invalidation submit for pasid {} on {} still failing after {} attempts: {}",
                        pasid,
                        device.source_id,
                        attempts,
                        e
                    );
                }
                core::hint::spin_loop();
            }

            let mut spins = 0u32;
            while device.iommu.pending_response_outstanding() {
                spins += 1;
                if spins == PRQ_DRAIN_WARN_SPINS {
                    log::warn!(
                        "iommu-sva: drain of pasid {} on {} still waiting for hardware after {} spins",
                        pasid,
                        device.source_id,
                        spins
                    );
                }
                core::hint::spin_loop();
            }
        }
    }
}

#[cfg(ktest)]
mod test {
    use alloc::sync::Arc;

    use super::*;
    use crate::{binding::DeviceBinding, hw::test_doubles::MockIommu, types::SourceId};

    #[ktest]
    fn drain_waits_for_in_flight_to_reach_zero() {
        let counter = InFlightCounter::new();
        let pasid = Pasid::new(1);
        counter.enter(pasid);
        counter.leave(pasid);
        // Already zero; must return immediately rather than block forever.
        counter.drain(pasid);
    }

    #[ktest]
    fn drain_is_scoped_to_its_own_pasid() {
        let counter = InFlightCounter::new();
        let draining = Pasid::new(1);
        let unrelated = Pasid::new(2);
        counter.enter(unrelated);
        // Unrelated in-flight traffic for another pasid must never block a
        // drain for this one.
        counter.drain(draining);
        counter.leave(unrelated);
    }

    #[ktest]
    fn hardware_drain_submits_fence_and_iotlb() {
        let iommu = MockIommu::new();
        let device = Arc::new(DeviceBinding::new(SourceId::from_raw(0x30), iommu.clone(), 0, 0));
        let drainer = Drainer::new(Arc::new(InFlightCounter::new()));

        drainer.drain_pasid(Pasid::new(3), &[device]);

        assert_eq!(iommu.invalidation_count(), 2);
    }

    #[ktest]
    fn hardware_drain_includes_device_tlb_when_present() {
        let iommu = MockIommu::new();
        let device = Arc::new(DeviceBinding::new(SourceId::from_raw(0x31), iommu.clone(), 0, 8));
        let drainer = Drainer::new(Arc::new(InFlightCounter::new()));

        drainer.drain_pasid(Pasid::new(4), &[device]);

        assert_eq!(iommu.invalidation_count(), 3);
    }
}
