// SPDX-License-Identifier: MPL-2.0

//! The external boundary to the IOMMU register/invalidation-queue layer,
//! the host address-space core, and the generic fault dispatcher.
//!
//! None of this is implemented here for real hardware: register-level MMIO,
//! PASID table entry encoding, and the address-space implementation are all
//! out of scope (see the crate's top-level docs). What lives here is the
//! trait boundary the rest of the crate programs against, so C1/C3/C4/C6 have
//! a concrete contract to call.

use alloc::sync::Arc;

use crate::{
    descriptor::PageGroupResponse,
    error::Result,
    types::{AccessRequest, Pasid, SourceId},
};

/// A vendor-specific descriptor supplied by the guest for a nested binding:
/// its first-level root table, address width, and attribute bits. Opaque to
/// this crate beyond being handed back to [`IommuHw::program_nested`].
#[derive(Debug, Clone, Copy)]
pub struct GuestDescriptor {
    pub guest_root_paddr: usize,
    pub address_width: u8,
    pub five_level_paging: bool,
}

/// One invalidation descriptor in a hardware-submitted batch.
#[derive(Debug, Clone, Copy)]
pub enum Invalidation {
    /// A fenced wait-with-status descriptor; used as a barrier before the
    /// following descriptors are observed complete.
    FencedWait,
    /// A pasid-scoped IOTLB invalidation over `[start, end)`.
    Iotlb {
        pasid: Pasid,
        start: usize,
        end: usize,
    },
    /// A device-TLB invalidation for one device's (source-ID, qdep, pfsid).
    DeviceTlb {
        source_id: SourceId,
        qdep: u8,
        pfsid: u16,
    },
}

/// The register/invalidation-queue boundary of one IOMMU unit.
///
/// Implementations own the MMIO registers and invalidation queue; this
/// trait exposes only the operations the SVA lifecycle needs.
pub trait IommuHw: Send + Sync {
    /// Programs a first-level PASID entry rooted at `root_table_paddr`.
    fn program_first_level(
        &self,
        source_id: SourceId,
        pasid: Pasid,
        root_table_paddr: usize,
        five_level_paging: bool,
    ) -> Result<()>;

    /// Programs a supervisor first-level PASID entry against the kernel's
    /// root page table.
    fn program_supervisor(&self, source_id: SourceId, pasid: Pasid) -> Result<()>;

    /// Programs a nested PASID entry: the guest's first-level table stitched
    /// over this domain's second-level tables.
    fn program_nested(
        &self,
        source_id: SourceId,
        pasid: Pasid,
        descriptor: GuestDescriptor,
    ) -> Result<()>;

    /// Clears the PASID entry for (device, pasid). A no-op if none is
    /// programmed.
    fn clear_pasid_entry(&self, source_id: SourceId, pasid: Pasid);

    /// Submits a batch of invalidation descriptors. If `wait` is set, blocks
    /// until the hardware has retired the batch.
    fn submit_invalidation(&self, batch: &[Invalidation], wait: bool) -> Result<()>;

    /// Posts a page-group response descriptor for a resolved (or rejected)
    /// page request.
    fn post_page_group_response(&self, response: PageGroupResponse);

    /// Returns `true` while the hardware reports a pending response still
    /// outstanding for some earlier invalidation batch.
    fn pending_response_outstanding(&self) -> bool;

    /// Reads the current (head, tail) indices of the PRQ ring.
    fn read_prq_indices(&self) -> (u32, u32);

    /// Publishes a new head index, indicating every descriptor up to it has
    /// been processed and responded to.
    fn advance_prq_head(&self, new_head: u32);

    /// Reads one descriptor (as four little-endian qwords) at `ring_index`.
    fn read_prq_descriptor(&self, ring_index: u32) -> [u64; 4];

    /// `true` if the hardware has latched a PRQ overflow condition.
    fn prq_overflowed(&self) -> bool;

    /// Clears the overflow latch. Only valid once head has caught up to
    /// tail.
    fn clear_prq_overflow(&self);

    /// Clears the pending-PRQ-interrupt latch, re-arming it so a fault
    /// posted after this call raises a fresh interrupt.
    fn clear_pending_interrupt_latch(&self);

    /// Registers `wake` to be invoked (from interrupt context) whenever the
    /// hardware posts new PRQ descriptors.
    fn register_prq_wakeup(&self, wake: Arc<dyn Fn() + Send + Sync>);
}

/// A mapped region of a host address space, as returned by
/// [`HostAddressSpace::lookup_region`].
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// The region may be extended downward on demand (e.g. a growable stack).
    pub growable: bool,
}

impl Region {
    pub fn covers(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn permits(&self, access: AccessRequest) -> bool {
        (!access.read || self.readable)
            && (!access.write || self.writable)
            && (!access.execute || self.executable)
    }
}

/// Fault-handler flags passed to [`HostAddressSpace::handle_fault`].
#[derive(Debug, Clone, Copy)]
pub struct FaultFlags {
    pub user: bool,
    pub remote: bool,
    pub write: bool,
}

/// Callbacks an address space invokes on an attached observer. Implemented
/// by [`crate::observer::AddressSpaceObserver`].
pub trait AddressSpaceObserver: Send + Sync {
    fn range_invalidated(&self, start: usize, end: usize);
    fn address_space_released(&self);
}

/// The host address-space core's boundary: region lookup, fault handling,
/// and observer attachment.
pub trait HostAddressSpace: Send + Sync {
    /// Takes a temporary reference if the address space is not already
    /// being torn down.
    fn try_get(&self) -> bool;

    /// The physical address of the top-level page table, for PASID entry
    /// programming.
    fn root_table_paddr(&self) -> usize;

    /// Looks up the region covering `addr` under the reader lock. Does not
    /// itself grow anything; see [`Self::extend_growable_region`].
    fn lookup_region(&self, addr: usize) -> Option<Region>;

    /// Extends a growable (e.g. stack) region downward to cover `addr`, if
    /// one exists whose current lower bound is above `addr`. Returns the
    /// extended region, or `None` if no growable region could be made to
    /// cover it.
    fn extend_growable_region(&self, addr: usize) -> Option<Region>;

    /// Handles a page fault at `addr` with the given flags.
    fn handle_fault(&self, addr: usize, flags: FaultFlags) -> Result<()>;

    fn attach_observer(&self, observer: Arc<dyn AddressSpaceObserver>);
    fn detach_observer(&self, observer: &Arc<dyn AddressSpaceObserver>);

    /// Publishes the pasid a binding was assigned, so future mappings use
    /// it directly.
    fn set_pasid_field(&self, pasid: Pasid);
}

/// The generic fault dispatcher's guest-mode boundary.
pub trait FaultSink: Send + Sync {
    /// Reports a device fault for a guest-mode binding; `private_data` is
    /// `Some` iff the descriptor carried private data.
    fn report_device_fault(
        &self,
        source_id: SourceId,
        pasid: Pasid,
        address: usize,
        access: AccessRequest,
        group_index: u16,
        last_in_group: bool,
        private_data: Option<[u8; 16]>,
    );
}

#[cfg(ktest)]
pub(crate) mod test_doubles {
    use alloc::{collections::VecDeque, sync::Arc, vec::Vec};

    use aster_frame::sync::SpinLock;

    use super::*;

    /// An in-memory stand-in for one IOMMU unit's registers and PRQ ring,
    /// used by the scenario tests in §8.
    pub(crate) struct MockIommu {
        inner: SpinLock<MockIommuInner>,
    }

    struct MockIommuInner {
        ring: Vec<[u64; 4]>,
        head: u32,
        tail: u32,
        overflowed: bool,
        pending_response: bool,
        programmed: VecDeque<(SourceId, Pasid)>,
        responses: Vec<PageGroupResponse>,
        invalidations: Vec<Invalidation>,
        wakeups: Vec<Arc<dyn Fn() + Send + Sync>>,
    }

    impl MockIommu {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: SpinLock::new(MockIommuInner {
                    ring: Vec::new(),
                    head: 0,
                    tail: 0,
                    overflowed: false,
                    pending_response: false,
                    programmed: VecDeque::new(),
                    responses: Vec::new(),
                    invalidations: Vec::new(),
                    wakeups: Vec::new(),
                }),
            })
        }

        /// Pushes a descriptor onto the tail of the ring and notifies any
        /// registered wakeup, as real hardware would on posting a fault.
        pub(crate) fn post_descriptor(&self, qwords: [u64; 4]) {
            let wakeups = {
                let mut inner = self.inner.lock();
                inner.ring.push(qwords);
                inner.tail += 1;
                inner.wakeups.clone()
            };
            for wake in wakeups {
                wake();
            }
        }

        pub(crate) fn responses(&self) -> Vec<PageGroupResponse> {
            self.inner.lock().responses.clone()
        }

        pub(crate) fn is_programmed(&self, source_id: SourceId, pasid: Pasid) -> bool {
            self.inner
                .lock()
                .programmed
                .iter()
                .any(|&(s, p)| s == source_id && p == pasid)
        }

        pub(crate) fn set_pending_response(&self, pending: bool) {
            self.inner.lock().pending_response = pending;
        }

        pub(crate) fn invalidation_count(&self) -> usize {
            self.inner.lock().invalidations.len()
        }
    }

    impl IommuHw for MockIommu {
        fn program_first_level(
            &self,
            source_id: SourceId,
            pasid: Pasid,
            _root_table_paddr: usize,
            _five_level_paging: bool,
        ) -> Result<()> {
            self.inner.lock().programmed.push_back((source_id, pasid));
            Ok(())
        }

        fn program_supervisor(&self, source_id: SourceId, pasid: Pasid) -> Result<()> {
            self.inner.lock().programmed.push_back((source_id, pasid));
            Ok(())
        }

        fn program_nested(
            &self,
            source_id: SourceId,
            pasid: Pasid,
            _descriptor: GuestDescriptor,
        ) -> Result<()> {
            self.inner.lock().programmed.push_back((source_id, pasid));
            Ok(())
        }

        fn clear_pasid_entry(&self, source_id: SourceId, pasid: Pasid) {
            self.inner
                .lock()
                .programmed
                .retain(|&(s, p)| !(s == source_id && p == pasid));
        }

        fn submit_invalidation(&self, batch: &[Invalidation], _wait: bool) -> Result<()> {
            self.inner.lock().invalidations.extend_from_slice(batch);
            Ok(())
        }

        fn post_page_group_response(&self, response: PageGroupResponse) {
            self.inner.lock().responses.push(response);
        }

        fn pending_response_outstanding(&self) -> bool {
            self.inner.lock().pending_response
        }

        fn read_prq_indices(&self) -> (u32, u32) {
            let inner = self.inner.lock();
            (inner.head, inner.tail)
        }

        fn advance_prq_head(&self, new_head: u32) {
            self.inner.lock().head = new_head;
        }

        fn read_prq_descriptor(&self, ring_index: u32) -> [u64; 4] {
            self.inner.lock().ring[ring_index as usize]
        }

        fn prq_overflowed(&self) -> bool {
            self.inner.lock().overflowed
        }

        fn clear_prq_overflow(&self) {
            self.inner.lock().overflowed = false;
        }

        fn clear_pending_interrupt_latch(&self) {}

        fn register_prq_wakeup(&self, wake: Arc<dyn Fn() + Send + Sync>) {
            self.inner.lock().wakeups.push(wake);
        }
    }

    /// An in-memory region map standing in for a real `VmSpace`.
    pub(crate) struct InMemoryAddressSpace {
        inner: SpinLock<InMemoryAddressSpaceInner>,
    }

    struct InMemoryAddressSpaceInner {
        live: bool,
        regions: Vec<Region>,
        observers: Vec<Arc<dyn AddressSpaceObserver>>,
        fault_log: Vec<usize>,
        root_table_paddr: usize,
    }

    impl InMemoryAddressSpace {
        pub(crate) fn new(root_table_paddr: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: SpinLock::new(InMemoryAddressSpaceInner {
                    live: true,
                    regions: Vec::new(),
                    observers: Vec::new(),
                    fault_log: Vec::new(),
                    root_table_paddr,
                }),
            })
        }

        pub(crate) fn map_region(&self, region: Region) {
            self.inner.lock().regions.push(region);
        }

        pub(crate) fn mark_exited(&self) {
            self.inner.lock().live = false;
        }

        pub(crate) fn fault_count(&self) -> usize {
            self.inner.lock().fault_log.len()
        }

        pub(crate) fn notify_range_invalidated(&self, start: usize, end: usize) {
            let observers = self.inner.lock().observers.clone();
            for observer in observers {
                observer.range_invalidated(start, end);
            }
        }

        pub(crate) fn notify_released(&self) {
            let observers = self.inner.lock().observers.clone();
            for observer in observers {
                observer.address_space_released();
            }
        }
    }

    impl HostAddressSpace for InMemoryAddressSpace {
        fn try_get(&self) -> bool {
            self.inner.lock().live
        }

        fn root_table_paddr(&self) -> usize {
            self.inner.lock().root_table_paddr
        }

        fn lookup_region(&self, addr: usize) -> Option<Region> {
            self.inner
                .lock()
                .regions
                .iter()
                .copied()
                .find(|r| r.covers(addr))
        }

        fn extend_growable_region(&self, addr: usize) -> Option<Region> {
            let mut inner = self.inner.lock();
            let idx = inner
                .regions
                .iter()
                .position(|r| r.growable && addr < r.start)?;
            let aligned = addr & !(crate::config::PAGE_SIZE - 1);
            inner.regions[idx].start = aligned;
            Some(inner.regions[idx])
        }

        fn handle_fault(&self, addr: usize, _flags: FaultFlags) -> Result<()> {
            self.inner.lock().fault_log.push(addr);
            Ok(())
        }

        fn attach_observer(&self, observer: Arc<dyn AddressSpaceObserver>) {
            self.inner.lock().observers.push(observer);
        }

        fn detach_observer(&self, observer: &Arc<dyn AddressSpaceObserver>) {
            self.inner
                .lock()
                .observers
                .retain(|o| !Arc::ptr_eq(o, observer));
        }

        fn set_pasid_field(&self, _pasid: Pasid) {}
    }

    /// Records every guest-mode fault handed off through [`FaultSink`], for
    /// assertion by [`crate::prq`]'s tests.
    pub(crate) struct RecordingFaultSink {
        reports: SpinLock<Vec<FaultReport>>,
    }

    #[derive(Debug, Clone, Copy)]
    pub(crate) struct FaultReport {
        pub(crate) source_id: SourceId,
        pub(crate) pasid: Pasid,
        pub(crate) address: usize,
        pub(crate) access: AccessRequest,
        pub(crate) group_index: u16,
        pub(crate) last_in_group: bool,
        pub(crate) private_data: Option<[u8; 16]>,
    }

    impl RecordingFaultSink {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                reports: SpinLock::new(Vec::new()),
            })
        }

        pub(crate) fn reports(&self) -> Vec<FaultReport> {
            self.reports.lock().clone()
        }
    }

    impl FaultSink for RecordingFaultSink {
        fn report_device_fault(
            &self,
            source_id: SourceId,
            pasid: Pasid,
            address: usize,
            access: AccessRequest,
            group_index: u16,
            last_in_group: bool,
            private_data: Option<[u8; 16]>,
        ) {
            self.reports.lock().push(FaultReport {
                source_id,
                pasid,
                address,
                access,
                group_index,
                last_in_group,
                private_data,
            });
        }
    }
}
