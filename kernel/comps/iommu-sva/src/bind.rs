// SPDX-License-Identifier: MPL-2.0

//! C6: the bind/unbind coordinator.
//!
//! Binds come in three flavours (host-user, host-supervisor, guest-nested);
//! unbind is the same state machine in reverse, handing off the final
//! teardown to the drainer ([`crate::drain`]) once a binding's last device
//! has been detached.

use alloc::sync::Arc;

use aster_frame::sync::Mutex;

use crate::{
    binding::{Binding, BindingState, DeviceBinding},
    config::PASID_MAX,
    descriptor::{GuestFaultEvent, PageGroupResponse, ResponseCode},
    error::{Error, Result},
    hw::{GuestDescriptor, HostAddressSpace, IommuHw},
    pasid::BitmapPasidAllocator,
    registry::Registry,
    types::{BindFlags, BindHandle, Mode, Pasid, PasidSet, SourceId},
};

/// Everything a bind/unbind call needs: the registry, the two pasid
/// allocators, and a guard against racing with the drainer.
pub struct BindCoordinator {
    registry: Arc<Registry>,
    host_pasids: Arc<BitmapPasidAllocator>,
    guest_pasids: Arc<BitmapPasidAllocator>,
    /// Serialises bind/unbind against each other and against the drainer's
    /// Live -> Draining transition, so a concurrent bind can never observe a
    /// half-torn-down binding and resurrect it.
    teardown_guard: Mutex<()>,
}

/// Parameters for a host-mode bind (§4.2, host path).
pub struct HostBindRequest {
    pub source_id: SourceId,
    pub iommu: Arc<dyn IommuHw>,
    pub domain_id: u16,
    pub device_tlb_qdep: u8,
    pub address_space: Option<Arc<dyn HostAddressSpace>>,
    /// `SUPERVISOR_MODE` selects the kernel's own root table over
    /// `address_space`; any other bit is recorded verbatim in the
    /// resulting `Binding.flags` (§3's capability bits).
    pub flags: BindFlags,
    /// Whether the system's PASID table entries use 5-level paging,
    /// threaded straight through to [`crate::hw::IommuHw::program_first_level`].
    pub five_level_paging: bool,
}

/// Parameters for a guest-mode (nested) bind (§4.2, guest path).
pub struct GuestBindRequest {
    pub source_id: SourceId,
    pub iommu: Arc<dyn IommuHw>,
    pub domain_id: u16,
    pub device_tlb_qdep: u8,
    pub guest_descriptor: GuestDescriptor,
    /// The pasid the guest itself uses to refer to this binding; distinct
    /// from the host pasid reserved below when `flags` lacks
    /// `GUEST_PASID_VALID`.
    pub guest_pasid: Option<Pasid>,
    pub hpasid_default: Option<Pasid>,
    pub flags: BindFlags,
}

impl BindCoordinator {
    pub fn new(
        registry: Arc<Registry>,
        host_pasids: Arc<BitmapPasidAllocator>,
        guest_pasids: Arc<BitmapPasidAllocator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            host_pasids,
            guest_pasids,
            teardown_guard: Mutex::new(()),
        })
    }

    /// Binds a device to a host address space (or, if `supervisor`, to the
    /// kernel's own root table). Steps per §4.2:
    /// 1. find-or-create the binding for this address space,
    /// 2. allocate a pasid if this is the first device for it,
    /// 3. program the PASID table entry,
    /// 4. attach the device-binding (and the observer, on first attach).
    pub fn bind_host(&self, req: HostBindRequest) -> Result<BindHandle> {
        let _teardown = self.teardown_guard.lock();
        let mode = if req.flags.contains(BindFlags::SUPERVISOR_MODE) {
            Mode::HostSupervisor
        } else {
            Mode::HostUser
        };

        if mode == Mode::HostSupervisor && req.address_space.is_some() {
            return Err(Error::InvalidArgs);
        }
        if mode == Mode::HostUser && req.address_space.is_none() {
            return Err(Error::InvalidArgs);
        }

        let mut table = self.registry.lock(PasidSet::Host);

        let existing = table.values().find(|candidate| {
            candidate.mode == mode
                && match (&candidate.address_space, &req.address_space) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                }
        });

        if let Some(binding) = existing {
            if binding.is_tearing_down() {
                return Err(Error::AlreadyBound);
            }
            if Registry::find_device(binding, req.source_id).is_some() {
                return Err(Error::AlreadyBound);
            }
            self.program_and_attach(
                binding,
                &req.source_id,
                &req.iommu,
                req.domain_id,
                req.device_tlb_qdep,
                req.five_level_paging,
            )?;
            return Ok(BindHandle {
                source_id: req.source_id,
                pasid: binding.pasid,
            });
        }

        let pasid = self.host_pasids.alloc(1, PASID_MAX)?;
        let device = Arc::new(DeviceBinding::new(
            req.source_id,
            req.iommu.clone(),
            req.domain_id,
            req.device_tlb_qdep,
        ));
        let binding = Binding::new(pasid, mode, req.address_space.clone(), None, req.flags, device);

        if let Err(e) = self.program_pasid_entry(&binding, &req.source_id, &req.iommu, req.five_level_paging) {
            self.host_pasids.put(pasid);
            return Err(e);
        }
        self.attach_observer_if_needed(&binding);

        self.host_pasids.attach_data(pasid, binding.clone());
        table.insert(pasid.raw(), binding);

        Ok(BindHandle {
            source_id: req.source_id,
            pasid,
        })
    }

    /// Binds a device in nested (guest) mode. Adds one extra step over the
    /// host path: reconciling the guest-supplied pasid against
    /// `HPASID_DEFAULT`/`GUEST_PASID_VALID` (§4.2 step 5, §9 open question).
    pub fn bind_guest(&self, req: GuestBindRequest) -> Result<BindHandle> {
        let _teardown = self.teardown_guard.lock();

        if !req.flags.contains(BindFlags::GUEST_MODE) {
            return Err(Error::InvalidArgs);
        }

        let pasid = if req.flags.contains(BindFlags::HPASID_DEFAULT) {
            req.hpasid_default.ok_or(Error::InvalidArgs)?
        } else if req.flags.contains(BindFlags::GUEST_PASID_VALID) {
            req.guest_pasid.ok_or(Error::InvalidArgs)?
        } else {
            return Err(Error::InvalidArgs);
        };

        let mut table = self.registry.lock(PasidSet::Guest);

        if let Some(binding) = table.get(&pasid.raw()).cloned() {
            if binding.is_tearing_down() {
                return Err(Error::AlreadyBound);
            }
            if Registry::find_device(&binding, req.source_id).is_some() {
                return Err(Error::AlreadyBound);
            }
            self.program_nested_entry(&req, &req.source_id, &req.iommu)?;
            let device = Arc::new(DeviceBinding::new(
                req.source_id,
                req.iommu.clone(),
                req.domain_id,
                req.device_tlb_qdep,
            ));
            self.registry.insert_device(&binding, device);
            return Ok(BindHandle {
                source_id: req.source_id,
                pasid,
            });
        }

        self.guest_pasids.alloc_specific(pasid).or_else(|e| {
            // A guest is allowed to supply a pasid this subsystem never
            // itself allocated (it belongs to the guest's own id space);
            // only a genuine double-bind is an error.
            if table.contains_key(&pasid.raw()) {
                Err(e)
            } else {
                Ok(())
            }
        })?;

        let device = Arc::new(DeviceBinding::new(
            req.source_id,
            req.iommu.clone(),
            req.domain_id,
            req.device_tlb_qdep,
        ));
        let binding = Binding::new(
            pasid,
            Mode::GuestNested,
            None,
            req.guest_pasid,
            req.flags,
            device,
        );

        req.iommu
            .program_nested(req.source_id, pasid, req.guest_descriptor)
            .map_err(|e| {
                self.guest_pasids.put(pasid);
                e
            })?;

        self.guest_pasids.attach_data(pasid, binding.clone());
        table.insert(pasid.raw(), binding);

        Ok(BindHandle {
            source_id: req.source_id,
            pasid,
        })
    }

    /// Detaches one device-binding. When it is the binding's last device,
    /// transitions `Live -> Draining` and hands off to the caller-supplied
    /// drain closure before finally removing the binding from the registry
    /// (§4.2 unbind, steps 1-4).
    pub fn unbind(
        &self,
        set: PasidSet,
        handle: BindHandle,
        drain: impl FnOnce(&Arc<Binding>),
    ) -> Result<()> {
        let _teardown = self.teardown_guard.lock();

        let binding = self
            .registry
            .find(set, handle.pasid)
            .ok_or(Error::NotBound)?;

        let device = Registry::find_device(&binding, handle.source_id).ok_or(Error::NotBound)?;
        device.iommu.clear_pasid_entry(handle.source_id, handle.pasid);
        self.registry.remove_device(&binding, handle.source_id);

        if !binding.devices.is_empty() {
            return Ok(());
        }

        binding.set_state(BindingState::Draining);
        drain(&binding);
        binding.set_state(BindingState::Freed);

        let mut table = self.registry.lock(set);
        table.remove(&handle.pasid.raw());
        drop(table);

        match set {
            PasidSet::Host => {
                self.host_pasids.detach_data(handle.pasid);
                self.host_pasids.put(handle.pasid);
            }
            PasidSet::Guest => {
                self.guest_pasids.detach_data(handle.pasid);
                self.guest_pasids.put(handle.pasid);
            }
        }

        Ok(())
    }

    /// §4.7 step 3's cleanup path: unlike [`Self::unbind`], this tears the
    /// whole binding down regardless of how many devices remain attached —
    /// used when an external actor has reported `pasid` itself as freed, so
    /// every device still on it must be detached before the pasid is
    /// released back to the allocator.
    pub fn unbind_all(&self, set: PasidSet, pasid: Pasid, drain: impl FnOnce(&Arc<Binding>)) -> Result<()> {
        let _teardown = self.teardown_guard.lock();

        let binding = self.registry.find(set, pasid).ok_or(Error::NotBound)?;

        for device in binding.devices.snapshot() {
            device.iommu.clear_pasid_entry(device.source_id, pasid);
            self.registry.remove_device(&binding, device.source_id);
        }

        binding.set_state(BindingState::Draining);
        drain(&binding);
        binding.set_state(BindingState::Freed);

        let mut table = self.registry.lock(set);
        table.remove(&pasid.raw());
        drop(table);

        match set {
            PasidSet::Host => {
                self.host_pasids.detach_data(pasid);
                self.host_pasids.put(pasid);
            }
            PasidSet::Guest => {
                self.guest_pasids.detach_data(pasid);
                self.guest_pasids.put(pasid);
            }
        }

        Ok(())
    }

    /// §6 `page_response`: composes and submits a page-group response for a
    /// guest-mode fault a user-space handler resolved out-of-band, after
    /// [`crate::hw::FaultSink::report_device_fault`] handed the original
    /// request out.
    pub fn page_response(&self, set: PasidSet, event: GuestFaultEvent, code: ResponseCode) -> Result<()> {
        let binding = self.registry.find(set, event.pasid).ok_or(Error::NotBound)?;
        let device = Registry::find_device(&binding, event.source_id).ok_or(Error::NotBound)?;

        device
            .iommu
            .post_page_group_response(PageGroupResponse::for_guest_event(&event, code));

        Ok(())
    }

    fn program_pasid_entry(
        &self,
        binding: &Arc<Binding>,
        source_id: &SourceId,
        iommu: &Arc<dyn IommuHw>,
        five_level_paging: bool,
    ) -> Result<()> {
        match binding.mode {
            Mode::HostSupervisor => iommu.program_supervisor(*source_id, binding.pasid),
            Mode::HostUser => {
                let space = binding.address_space.as_ref().ok_or(Error::InvalidArgs)?;
                if !space.try_get() {
                    return Err(Error::InvalidArgs);
                }
                space.set_pasid_field(binding.pasid);
                iommu.program_first_level(*source_id, binding.pasid, space.root_table_paddr(), five_level_paging)
            }
            Mode::GuestNested => Err(Error::InvalidArgs),
        }
    }

    fn program_nested_entry(
        &self,
        req: &GuestBindRequest,
        source_id: &SourceId,
        iommu: &Arc<dyn IommuHw>,
    ) -> Result<()> {
        let pasid = req
            .guest_pasid
            .or(req.hpasid_default)
            .unwrap_or_else(|| Pasid::new(0));
        iommu.program_nested(*source_id, pasid, req.guest_descriptor)
    }

    fn program_and_attach(
        &self,
        binding: &Arc<Binding>,
        source_id: &SourceId,
        iommu: &Arc<dyn IommuHw>,
        domain_id: u16,
        device_tlb_qdep: u8,
        five_level_paging: bool,
    ) -> Result<()> {
        self.program_pasid_entry(binding, source_id, iommu, five_level_paging)?;
        let device = Arc::new(DeviceBinding::new(*source_id, iommu.clone(), domain_id, device_tlb_qdep));
        self.registry.insert_device(binding, device);
        Ok(())
    }

    fn attach_observer_if_needed(&self, binding: &Arc<Binding>) {
        if binding.mode != Mode::HostUser || binding.observer_attached() {
            return;
        }
        if let Some(space) = &binding.address_space {
            let observer: Arc<dyn crate::hw::AddressSpaceObserver> =
                Arc::new(crate::observer::BindingObserver::new(binding.clone()));
            space.attach_observer(observer);
            binding.set_observer_attached(true);
        }
    }
}

#[cfg(ktest)]
mod test {
    use alloc::sync::Arc;

    use super::*;
    use crate::hw::test_doubles::{InMemoryAddressSpace, MockIommu};

    fn coordinator() -> Arc<BindCoordinator> {
        BindCoordinator::new(Registry::new(), BitmapPasidAllocator::new(), BitmapPasidAllocator::new())
    }

    #[ktest]
    fn host_bind_programs_first_level_entry() {
        let coord = coordinator();
        let iommu = MockIommu::new();
        let space = InMemoryAddressSpace::new(0x1000);
        let source_id = SourceId::from_raw(0x10);

        let handle = coord
            .bind_host(HostBindRequest {
                source_id,
                iommu: iommu.clone(),
                domain_id: 0,
                device_tlb_qdep: 0,
                address_space: Some(space.clone()),
                flags: BindFlags::empty(),
                five_level_paging: false,
            })
            .unwrap();

        assert!(iommu.is_programmed(source_id, handle.pasid));
    }

    #[ktest]
    fn double_bind_same_device_fails() {
        let coord = coordinator();
        let iommu = MockIommu::new();
        let space = InMemoryAddressSpace::new(0x1000);
        let source_id = SourceId::from_raw(0x11);

        let req = || HostBindRequest {
            source_id,
            iommu: iommu.clone(),
            domain_id: 0,
            device_tlb_qdep: 0,
            address_space: Some(space.clone()),
            flags: BindFlags::empty(),
            five_level_paging: false,
        };
        coord.bind_host(req()).unwrap();
        assert_eq!(coord.bind_host(req()).unwrap_err(), Error::AlreadyBound);
    }

    #[ktest]
    fn unbind_clears_pasid_entry() {
        let coord = coordinator();
        let iommu = MockIommu::new();
        let space = InMemoryAddressSpace::new(0x1000);
        let source_id = SourceId::from_raw(0x12);

        let handle = coord
            .bind_host(HostBindRequest {
                source_id,
                iommu: iommu.clone(),
                domain_id: 0,
                device_tlb_qdep: 0,
                address_space: Some(space),
                flags: BindFlags::empty(),
                five_level_paging: false,
            })
            .unwrap();

        coord.unbind(PasidSet::Host, handle, |_| {}).unwrap();
        assert!(!iommu.is_programmed(source_id, handle.pasid));
    }

    #[ktest]
    fn supervisor_bind_rejects_an_address_space() {
        let coord = coordinator();
        let iommu = MockIommu::new();
        let space = InMemoryAddressSpace::new(0x1000);
        let source_id = SourceId::from_raw(0x13);

        let err = coord
            .bind_host(HostBindRequest {
                source_id,
                iommu,
                domain_id: 0,
                device_tlb_qdep: 0,
                address_space: Some(space),
                flags: BindFlags::SUPERVISOR_MODE,
                five_level_paging: false,
            })
            .unwrap_err();

        assert_eq!(err, Error::InvalidArgs);
    }

    #[ktest]
    fn unbind_all_tears_down_every_device_on_the_pasid() {
        let coord = coordinator();
        let iommu = MockIommu::new();
        let space = InMemoryAddressSpace::new(0x1000);
        let first = SourceId::from_raw(0x14);
        let second = SourceId::from_raw(0x15);

        let handle = coord
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
        coord
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

        coord.unbind_all(PasidSet::Host, handle.pasid, |_| {}).unwrap();

        assert!(!iommu.is_programmed(first, handle.pasid));
        assert!(!iommu.is_programmed(second, handle.pasid));
    }

    #[ktest]
    fn page_response_posts_through_the_devices_iommu() {
        let coord = coordinator();
        let iommu = MockIommu::new();
        let source_id = SourceId::from_raw(0x16);

        let handle = coord
            .bind_guest(GuestBindRequest {
                source_id,
                iommu: iommu.clone(),
                domain_id: 0,
                device_tlb_qdep: 0,
                guest_descriptor: crate::hw::GuestDescriptor {
                    guest_root_paddr: 0x9000,
                    address_width: 48,
                    five_level_paging: false,
                },
                guest_pasid: Some(Pasid::new(42)),
                hpasid_default: None,
                flags: BindFlags::GUEST_MODE | BindFlags::GUEST_PASID_VALID,
            })
            .unwrap();

        coord
            .page_response(
                PasidSet::Guest,
                GuestFaultEvent {
                    source_id,
                    pasid: handle.pasid,
                    group_index: 3,
                    last_in_group: true,
                    private_data: None,
                },
                ResponseCode::Success,
            )
            .unwrap();

        let responses = iommu.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].code, ResponseCode::Success);
        assert_eq!(responses[0].group_index, 3);
    }
}
