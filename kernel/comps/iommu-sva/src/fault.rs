// SPDX-License-Identifier: MPL-2.0

//! C2: the fault resolver.
//!
//! Takes one decoded [`PrqDescriptor`] and a binding, and resolves it
//! against the bound address space: canonicalize the address, look up the
//! covering region (extending a growable region downward if that is what
//! covers the fault), check permissions, and run the host's fault handler.

use crate::{
    binding::Binding,
    descriptor::{PrqDescriptor, ResponseCode},
    hw::FaultFlags,
    types::Mode,
};

/// Canonicalizes a 57-bit (5-level paging) or 48-bit (4-level paging)
/// address per §4.5: the upper unused bits must be a sign-extension of the
/// top significant bit, else the address is non-canonical and the request
/// is rejected outright.
pub fn canonicalize(addr: usize, five_level_paging: bool) -> Option<usize> {
    let sig_bits = if five_level_paging { 57 } else { 48 };
    let sign_bit = 1usize << (sig_bits - 1);
    let upper_mask = !0usize << sig_bits;
    let is_negative = addr & sign_bit != 0;
    let upper = addr & upper_mask;
    let canonical = if is_negative { upper_mask } else { 0 };
    if upper == canonical {
        Some(addr)
    } else {
        None
    }
}

/// Resolves one page request against `binding`'s address space.
///
/// Returns the response code to post back to the device; this never yields
/// [`ResponseCode::Failure`] (§4.5's output is `{SUCCESS, INVALID}` only —
/// `Failure` exists for other wire uses of the response descriptor). A
/// binding that is already tearing down resolves to `Invalid` silently (I6,
/// an ordinary teardown race); a host-mode fault against a supervisor
/// binding is logged, since a supervisor-mapped device should never be
/// generating page requests in the first place.
pub fn resolve(binding: &Binding, desc: &PrqDescriptor, five_level_paging: bool) -> ResponseCode {
    if binding.mode == Mode::HostSupervisor {
        log::warn!(
            "iommu-sva: page request fault on supervisor binding {} from {}, rejecting",
            binding.pasid,
            desc.source_id,
        );
        return ResponseCode::Invalid;
    }

    if binding.is_tearing_down() {
        return ResponseCode::Invalid;
    }

    let Some(addr) = canonicalize(desc.address, five_level_paging) else {
        return ResponseCode::Invalid;
    };

    let Some(space) = &binding.address_space else {
        return ResponseCode::Invalid;
    };

    if !space.try_get() {
        return ResponseCode::Invalid;
    }

    let region = match space.lookup_region(addr).or_else(|| space.extend_growable_region(addr)) {
        Some(region) if region.covers(addr) => region,
        _ => return ResponseCode::Invalid,
    };

    if !region.permits(desc.access) {
        return ResponseCode::Invalid;
    }

    let flags = FaultFlags {
        user: binding.mode == Mode::HostUser,
        remote: false,
        write: desc.access.write,
    };

    match space.handle_fault(addr, flags) {
        Ok(()) => ResponseCode::Success,
        Err(_) => ResponseCode::Invalid,
    }
}

#[cfg(ktest)]
mod test {
    use alloc::sync::Arc;

    use super::*;
    use crate::{
        binding::DeviceBinding,
        hw::test_doubles::{InMemoryAddressSpace, MockIommu},
        hw::Region,
        types::{AccessRequest, BindFlags, Pasid, SourceId},
    };

    fn descriptor(address: usize, read: bool, write: bool) -> PrqDescriptor {
        PrqDescriptor {
            pasid_present: true,
            pasid: Pasid::new(1),
            source_id: SourceId::from_raw(0x40),
            access: AccessRequest {
                read,
                write,
                execute: false,
                privileged: false,
            },
            group_index: 0,
            last_in_group: true,
            private_data_present: false,
            address,
            private_data: [0; 16],
        }
    }

    #[ktest]
    fn canonical_address_round_trips() {
        assert_eq!(canonicalize(0x1000, false), Some(0x1000));
        assert_eq!(canonicalize(0xffff_8000_0000_1000, false), Some(0xffff_8000_0000_1000));
    }

    #[ktest]
    fn non_canonical_address_is_rejected() {
        assert_eq!(canonicalize(0x0001_0000_0000_1000, false), None);
    }

    #[ktest]
    fn mapped_region_with_permission_invokes_host_fault_handler() {
        let space = InMemoryAddressSpace::new(0x1000);
        space.map_region(Region {
            start: 0x2000,
            end: 0x3000,
            readable: true,
            writable: false,
            executable: false,
            growable: false,
        });
        let iommu = MockIommu::new();
        let device = Arc::new(DeviceBinding::new(SourceId::from_raw(0x40), iommu, 0, 0));
        let binding = Binding::new(Pasid::new(1), Mode::HostUser, Some(space.clone()), None, BindFlags::empty(), device);

        let code = resolve(&binding, &descriptor(0x2100, true, false), false);
        assert_eq!(code, ResponseCode::Success);
        assert_eq!(space.fault_count(), 1);
    }

    #[ktest]
    fn mapped_region_without_permission_resolves_invalid() {
        let space = InMemoryAddressSpace::new(0x1000);
        space.map_region(Region {
            start: 0x2000,
            end: 0x3000,
            readable: true,
            writable: false,
            executable: false,
            growable: false,
        });
        let iommu = MockIommu::new();
        let device = Arc::new(DeviceBinding::new(SourceId::from_raw(0x41), iommu, 0, 0));
        let binding = Binding::new(Pasid::new(2), Mode::HostUser, Some(space.clone()), None, BindFlags::empty(), device);

        let code = resolve(&binding, &descriptor(0x2100, false, true), false);
        assert_eq!(code, ResponseCode::Invalid);
        assert_eq!(space.fault_count(), 0);
    }

    #[ktest]
    fn address_with_no_covering_region_is_invalid() {
        let space = InMemoryAddressSpace::new(0x1000);
        let iommu = MockIommu::new();
        let device = Arc::new(DeviceBinding::new(SourceId::from_raw(0x42), iommu, 0, 0));
        let binding = Binding::new(Pasid::new(3), Mode::HostUser, Some(space.clone()), None, BindFlags::empty(), device);

        let code = resolve(&binding, &descriptor(0x5000, true, false), false);
        assert_eq!(code, ResponseCode::Invalid);
        assert_eq!(space.fault_count(), 0);
    }

    #[ktest]
    fn growable_region_extends_downward_to_cover_fault() {
        let space = InMemoryAddressSpace::new(0x1000);
        space.map_region(Region {
            start: 0x4000,
            end: 0x5000,
            readable: true,
            writable: true,
            executable: false,
            growable: true,
        });
        let iommu = MockIommu::new();
        let device = Arc::new(DeviceBinding::new(SourceId::from_raw(0x44), iommu, 0, 0));
        let binding = Binding::new(Pasid::new(5), Mode::HostUser, Some(space.clone()), None, BindFlags::empty(), device);

        let code = resolve(&binding, &descriptor(0x3500, true, true), false);
        assert_eq!(code, ResponseCode::Success);
        assert_eq!(space.fault_count(), 1);
    }

    #[ktest]
    fn supervisor_mode_never_resolved_here() {
        let iommu = MockIommu::new();
        let device = Arc::new(DeviceBinding::new(SourceId::from_raw(0x43), iommu, 0, 0));
        let binding = Binding::new(Pasid::new(4), Mode::HostSupervisor, None, None, BindFlags::empty(), device);

        let code = resolve(&binding, &descriptor(0x1000, true, false), false);
        assert_eq!(code, ResponseCode::Invalid);
    }
}
