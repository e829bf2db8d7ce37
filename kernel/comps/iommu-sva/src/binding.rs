// SPDX-License-Identifier: MPL-2.0

//! The binding (B) / device-binding (D) data model.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use aster_frame::sync::RwLock;
use int_to_c_enum::TryFromInt;

use crate::{
    hw::{HostAddressSpace, IommuHw},
    types::{BindFlags, Mode, Pasid, SourceId},
};

/// A single (device, binding) edge. Created exclusively by bind, destroyed
/// when its binding count reaches zero or its parent binding is torn down.
pub struct DeviceBinding {
    pub source_id: SourceId,
    pub iommu: Arc<dyn IommuHw>,
    pub domain_id: u16,
    /// Device-TLB invalidation depth (`qdep`); `0` if the device has no
    /// enabled device-TLB.
    pub device_tlb_qdep: u8,
    pub pfsid: u16,
    /// >0 only when this (device, pasid) edge is shared across auxiliary
    /// subdomains; a second bind on the same pair bumps it instead of
    /// creating a new edge.
    usage_count: AtomicUsize,
}

impl DeviceBinding {
    pub fn new(source_id: SourceId, iommu: Arc<dyn IommuHw>, domain_id: u16, device_tlb_qdep: u8) -> Self {
        Self {
            source_id,
            iommu,
            domain_id,
            device_tlb_qdep,
            pfsid: source_id.raw(),
            usage_count: AtomicUsize::new(1),
        }
    }

    pub fn has_device_tlb(&self) -> bool {
        self.device_tlb_qdep > 0
    }

    pub fn usage_count(&self) -> usize {
        self.usage_count.load(Ordering::Acquire)
    }

    /// Returns the usage count *after* incrementing.
    pub fn inc_usage(&self) -> usize {
        self.usage_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the usage count *after* decrementing.
    pub fn dec_usage(&self) -> usize {
        self.usage_count.fetch_sub(1, Ordering::AcqRel) - 1
    }
}

/// B's lifecycle state. Transitions are irreversible: `Live -> Draining ->
/// Freed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromInt)]
#[repr(u8)]
pub enum BindingState {
    Live = 0,
    Draining = 1,
    Freed = 2,
}

/// The append/remove-only device set of a [`Binding`].
///
/// Readers (the PRQ reader, the address-space observer) traverse it by
/// taking only the read side of a spin-based reader-writer lock, so any
/// number of them run concurrently with each other; a writer (bind/unbind,
/// under the registry mutex) takes the write side to mutate the list. The
/// PRQ reader holds its read guard for no longer than the handling of one
/// descriptor, so a pending writer is never starved for long — this is the
/// reader-writer-lock alternative to epoch reclamation noted in the design
/// notes.
pub struct DeviceSet {
    devices: RwLock<Vec<Arc<DeviceBinding>>>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
        }
    }

    pub fn singleton(device: Arc<DeviceBinding>) -> Self {
        Self {
            devices: RwLock::new(alloc::vec![device]),
        }
    }

    /// Finds the device-binding for `source_id`, if any.
    pub fn find(&self, source_id: SourceId) -> Option<Arc<DeviceBinding>> {
        self.devices
            .read()
            .iter()
            .find(|d| d.source_id == source_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots the current device list, for callbacks that must iterate
    /// every device (observer notifications, drain-on-B-teardown).
    pub fn snapshot(&self) -> Vec<Arc<DeviceBinding>> {
        self.devices.read().clone()
    }

    /// Inserts `device`.
    pub fn insert(&self, device: Arc<DeviceBinding>) {
        self.devices.write().push(device);
    }

    /// Removes the device-binding for `source_id`, if present.
    pub fn remove(&self, source_id: SourceId) {
        self.devices.write().retain(|d| d.source_id != source_id);
    }
}

impl Default for DeviceSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Created when a pasid is first associated with an address space (host or
/// guest).
pub struct Binding {
    pub pasid: Pasid,
    pub mode: Mode,
    /// Absent in `GuestNested` and `HostSupervisor` mode.
    pub address_space: Option<Arc<dyn HostAddressSpace>>,
    /// Present iff `mode == GuestNested` and a distinct guest-visible pasid
    /// was supplied.
    pub guest_pasid: Option<Pasid>,
    pub flags: BindFlags,
    pub devices: DeviceSet,
    observer_attached: AtomicU8,
    state: AtomicU8,
}

impl Binding {
    pub fn new(
        pasid: Pasid,
        mode: Mode,
        address_space: Option<Arc<dyn HostAddressSpace>>,
        guest_pasid: Option<Pasid>,
        flags: BindFlags,
        first_device: Arc<DeviceBinding>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pasid,
            mode,
            address_space,
            guest_pasid,
            flags,
            devices: DeviceSet::singleton(first_device),
            observer_attached: AtomicU8::new(0),
            state: AtomicU8::new(BindingState::Live as u8),
        })
    }

    pub fn state(&self) -> BindingState {
        BindingState::try_from(self.state.load(Ordering::Acquire))
            .expect("binding state field holds an out-of-range value")
    }

    pub fn set_state(&self, state: BindingState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// `true` if no fault resolution should run for this binding any
    /// longer: the drainer has started or finished tearing it down (I6).
    pub fn is_tearing_down(&self) -> bool {
        !matches!(self.state(), BindingState::Live)
    }

    pub fn observer_attached(&self) -> bool {
        self.observer_attached.load(Ordering::Acquire) != 0
    }

    pub fn set_observer_attached(&self, attached: bool) {
        self.observer_attached
            .store(attached as u8, Ordering::Release);
    }
}

impl core::fmt::Debug for Binding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Binding")
            .field("pasid", &self.pasid)
            .field("mode", &self.mode)
            .field("guest_pasid", &self.guest_pasid)
            .field("flags", &self.flags)
            .field("devices", &self.devices.len())
            .field("state", &self.state())
            .finish()
    }
}

impl core::fmt::Debug for DeviceBinding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceBinding")
            .field("source_id", &self.source_id)
            .field("domain_id", &self.domain_id)
            .field("device_tlb_qdep", &self.device_tlb_qdep)
            .field("usage_count", &self.usage_count())
            .finish()
    }
}
