// SPDX-License-Identifier: MPL-2.0

//! Wire-level PRQ descriptor and page-group response descriptor.
//!
//! These mirror the 32-byte hardware descriptor layout; decoding lives here
//! so [`crate::prq`] only ever deals with the parsed form.

use crate::types::{AccessRequest, Pasid, SourceId};

/// A decoded page-request descriptor, as read from the ring.
#[derive(Debug, Clone, Copy)]
pub struct PrqDescriptor {
    pub pasid_present: bool,
    pub pasid: Pasid,
    pub source_id: SourceId,
    pub access: AccessRequest,
    pub group_index: u16,
    pub last_in_group: bool,
    pub private_data_present: bool,
    /// The faulting address, already shifted by [`crate::config::PAGE_SHIFT`].
    pub address: usize,
    pub private_data: [u8; 16],
}

impl PrqDescriptor {
    /// Decodes a descriptor from its raw 32-byte, 4-qword little-endian wire
    /// form.
    pub fn decode(qwords: [u64; 4]) -> Self {
        let q0 = qwords[0];
        let q1 = qwords[1];

        let pasid_present = (q0 >> 8) & 0x1 != 0;
        let private_data_present = (q0 >> 9) & 0x1 != 0;
        let rid = ((q0 >> 16) & 0xffff) as u16;
        let pasid = ((q0 >> 32) & 0xf_ffff) as u32;
        let exe_req = (q0 >> 52) & 0x1 != 0;
        let pm_req = (q0 >> 53) & 0x1 != 0;

        let rd_req = q1 & 0x1 != 0;
        let wr_req = (q1 >> 1) & 0x1 != 0;
        let lpig = (q1 >> 2) & 0x1 != 0;
        let prg_index = ((q1 >> 3) & 0x1ff) as u16;
        let page_addr = (q1 >> 12) & 0xf_ffff_ffff_ffff;

        let mut private_data = [0u8; 16];
        private_data[..8].copy_from_slice(&qwords[2].to_le_bytes());
        private_data[8..].copy_from_slice(&qwords[3].to_le_bytes());

        Self {
            pasid_present,
            pasid: Pasid::new(pasid),
            source_id: SourceId::from_raw(rid),
            access: AccessRequest {
                read: rd_req,
                write: wr_req,
                execute: exe_req,
                privileged: pm_req,
            },
            group_index: prg_index,
            last_in_group: lpig,
            private_data_present,
            address: (page_addr as usize) << crate::config::PAGE_SHIFT,
            private_data,
        }
    }

    /// A descriptor is malformed per §4.3's validation rules: pasid missing,
    /// privileged combined with a read or write request, or an
    /// execute-and-read request together.
    pub fn is_malformed(&self) -> bool {
        if !self.pasid_present {
            return true;
        }
        if self.access.privileged && (self.access.read || self.access.write) {
            return true;
        }
        if self.access.execute && self.access.read {
            return true;
        }
        false
    }
}

/// The outcome of resolving one page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    Invalid,
    Failure,
}

/// A page-group response descriptor, posted back to the device through the
/// IOMMU's invalidation path once a group of requests has been resolved.
#[derive(Debug, Clone, Copy)]
pub struct PageGroupResponse {
    pub pasid_present: bool,
    pub pasid: Pasid,
    pub source_id: SourceId,
    pub code: ResponseCode,
    pub group_index: u16,
    pub last_in_group: bool,
    pub private_data_present: bool,
    pub private_data: [u8; 16],
}

/// Identifies the original guest-mode page request an external handler is
/// resolving, as handed out by [`crate::hw::FaultSink::report_device_fault`]
/// and handed back in to [`crate::bind::BindCoordinator::page_response`]
/// (§6).
#[derive(Debug, Clone, Copy)]
pub struct GuestFaultEvent {
    pub source_id: SourceId,
    pub pasid: Pasid,
    pub group_index: u16,
    pub last_in_group: bool,
    pub private_data: Option<[u8; 16]>,
}

impl PageGroupResponse {
    pub fn for_descriptor(desc: &PrqDescriptor, code: ResponseCode) -> Self {
        Self {
            pasid_present: desc.pasid_present,
            pasid: desc.pasid,
            source_id: desc.source_id,
            code,
            group_index: desc.group_index,
            last_in_group: desc.last_in_group,
            private_data_present: desc.private_data_present,
            private_data: desc.private_data,
        }
    }

    /// Builds a page-group response for an externally-resolved guest-mode
    /// fault (§6 `page_response`).
    pub fn for_guest_event(event: &GuestFaultEvent, code: ResponseCode) -> Self {
        Self {
            pasid_present: true,
            pasid: event.pasid,
            source_id: event.source_id,
            code,
            group_index: event.group_index,
            last_in_group: event.last_in_group,
            private_data_present: event.private_data.is_some(),
            private_data: event.private_data.unwrap_or([0; 16]),
        }
    }
}

#[cfg(ktest)]
mod test {
    use super::*;

    fn encode(pasid: u32, rd: bool, wr: bool, exe: bool, pm: bool, lpig: bool, addr: u64) -> [u64; 4] {
        let mut q0 = 1u64 << 8; // pasid_present
        q0 |= (pasid as u64 & 0xf_ffff) << 32;
        if exe {
            q0 |= 1 << 52;
        }
        if pm {
            q0 |= 1 << 53;
        }

        let mut q1 = 0u64;
        if rd {
            q1 |= 1;
        }
        if wr {
            q1 |= 1 << 1;
        }
        if lpig {
            q1 |= 1 << 2;
        }
        q1 |= (addr >> crate::config::PAGE_SHIFT) << 12;

        [q0, q1, 0, 0]
    }

    #[ktest]
    fn decode_simple_read_fault() {
        let raw = encode(0x42, true, false, false, false, true, 0x1000);
        let desc = PrqDescriptor::decode(raw);
        assert!(desc.pasid_present);
        assert_eq!(desc.pasid.raw(), 0x42);
        assert!(desc.access.read);
        assert!(!desc.access.write);
        assert!(desc.last_in_group);
        assert_eq!(desc.address, 0x1000);
        assert!(!desc.is_malformed());
    }

    #[ktest]
    fn privileged_with_read_is_malformed() {
        let raw = encode(0x1, true, false, false, true, false, 0);
        let desc = PrqDescriptor::decode(raw);
        assert!(desc.is_malformed());
    }

    #[ktest]
    fn execute_and_read_is_malformed() {
        let raw = encode(0x1, true, false, true, false, false, 0);
        let desc = PrqDescriptor::decode(raw);
        assert!(desc.is_malformed());
    }

    #[ktest]
    fn missing_pasid_is_malformed() {
        let desc = PrqDescriptor {
            pasid_present: false,
            pasid: Pasid::new(0),
            source_id: SourceId::from_raw(0),
            access: AccessRequest {
                read: true,
                write: false,
                execute: false,
                privileged: false,
            },
            group_index: 0,
            last_in_group: false,
            private_data_present: false,
            address: 0,
            private_data: [0; 16],
        };
        assert!(desc.is_malformed());
    }
}
