// SPDX-License-Identifier: MPL-2.0

//! C4: the address-space observer.
//!
//! One [`BindingObserver`] is attached per host-user binding the first time
//! a device is bound against a given address space (see
//! [`crate::bind::BindCoordinator::bind_host`]). It fans a single address
//! space event out to every device currently in the binding's device set.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    binding::Binding,
    hw::{AddressSpaceObserver, Invalidation},
};

pub struct BindingObserver {
    binding: Arc<Binding>,
}

impl BindingObserver {
    pub fn new(binding: Arc<Binding>) -> Self {
        Self { binding }
    }
}

/// Splits `[start, end)` into the minimal sequence of maximal power-of-two
/// aligned sub-ranges, per §4.6's IOTLB invalidation batching (S5): the IOMMU
/// invalidation descriptor only accepts power-of-two aligned, power-of-two
/// sized address masks.
fn power_of_two_aligned_ranges(start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut pos = start;
    while pos < end {
        let remaining = end - pos;
        let align = if pos == 0 {
            usize::BITS - 1
        } else {
            pos.trailing_zeros()
        };
        let max_by_remaining = usize::BITS - 1 - remaining.leading_zeros();
        let shift = align.min(max_by_remaining);
        let len = 1usize << shift;
        ranges.push((pos, pos + len));
        pos += len;
    }
    ranges
}

impl AddressSpaceObserver for BindingObserver {
    /// §4.6: invalidates `[start, end)` in every device's IOTLB, and its
    /// device-TLB too if it advertises one. Runs under the device set's read
    /// lock, so it never blocks a concurrent bind/unbind for longer than one
    /// pass over the current device list.
    fn range_invalidated(&self, start: usize, end: usize) {
        if self.binding.is_tearing_down() {
            return;
        }
        let sub_ranges = power_of_two_aligned_ranges(start, end);
        for device in self.binding.devices.snapshot() {
            let mut batch: Vec<Invalidation> = sub_ranges
                .iter()
                .map(|&(start, end)| Invalidation::Iotlb {
                    pasid: self.binding.pasid,
                    start,
                    end,
                })
                .collect();
            if device.has_device_tlb() {
                batch.push(Invalidation::DeviceTlb {
                    source_id: device.source_id,
                    qdep: device.device_tlb_qdep,
                    pfsid: device.pfsid,
                });
            }
            if let Err(e) = device.iommu.submit_invalidation(&batch, true) {
                log::warn!(
                    "iommu-sva: range invalidation failed for {} pasid {}: {}",
                    device.source_id,
                    self.binding.pasid,
                    e
                );
            }
        }
    }

    /// §4.6: the address space is exiting. Clears every device's PASID
    /// table entry so a subsequent PRQ descriptor or DMA for this pasid hits
    /// an unprogrammed entry instead of a now-dangling one.
    fn address_space_released(&self) {
        for device in self.binding.devices.snapshot() {
            device
                .iommu
                .clear_pasid_entry(device.source_id, self.binding.pasid);
        }
    }
}

#[cfg(ktest)]
mod test {
    use alloc::sync::Arc;

    use super::*;
    use crate::{
        binding::DeviceBinding,
        hw::{test_doubles::MockIommu, IommuHw},
        types::{BindFlags, Mode, Pasid, SourceId},
    };

    #[ktest]
    fn range_invalidated_reaches_every_device() {
        let iommu = MockIommu::new();
        let source_id = SourceId::from_raw(0x20);
        let device = Arc::new(DeviceBinding::new(source_id, iommu.clone(), 0, 4));
        let binding = Binding::new(Pasid::new(7), Mode::HostUser, None, None, BindFlags::empty(), device);
        let observer = BindingObserver::new(binding);

        observer.range_invalidated(0x1000, 0x2000);

        assert_eq!(iommu.invalidation_count(), 2);
    }

    #[ktest]
    fn power_of_two_decomposition_splits_a_non_aligned_range() {
        assert_eq!(
            power_of_two_aligned_ranges(0x1000, 0x3000),
            alloc::vec![(0x1000, 0x2000), (0x2000, 0x3000)]
        );
        assert_eq!(power_of_two_aligned_ranges(0x1000, 0x2000), alloc::vec![(0x1000, 0x2000)]);
        assert_eq!(
            power_of_two_aligned_ranges(0, 0x3000),
            alloc::vec![(0, 0x2000), (0x2000, 0x3000)]
        );
    }

    #[ktest]
    fn range_invalidated_submits_one_iotlb_descriptor_per_aligned_sub_range() {
        let iommu = MockIommu::new();
        let source_id = SourceId::from_raw(0x22);
        let device = Arc::new(DeviceBinding::new(source_id, iommu.clone(), 0, 0));
        let binding = Binding::new(Pasid::new(9), Mode::HostUser, None, None, BindFlags::empty(), device);
        let observer = BindingObserver::new(binding);

        observer.range_invalidated(0x1000, 0x3000);

        assert_eq!(iommu.invalidation_count(), 2);
    }

    #[ktest]
    fn address_space_released_clears_every_device_entry() {
        let iommu = MockIommu::new();
        let source_id = SourceId::from_raw(0x21);
        let pasid = Pasid::new(8);
        iommu.clone().program_first_level(source_id, pasid, 0, true).unwrap();
        let device = Arc::new(DeviceBinding::new(source_id, iommu.clone(), 0, 0));
        let binding = Binding::new(pasid, Mode::HostUser, None, None, BindFlags::empty(), device);
        let observer = BindingObserver::new(binding);

        observer.address_space_released();

        assert!(!iommu.is_programmed(source_id, pasid));
    }
}
