// SPDX-License-Identifier: MPL-2.0

//! The binding registry (C5): the (pasid -> binding) and (binding ->
//! device-list) relations.
//!
//! Insertions and removals are serialised under the registry mutex; a
//! binding's own device-set traversal only takes the read side of a
//! reader-writer lock (see [`crate::binding::DeviceSet`]), so the PRQ reader
//! and the observer callbacks never contend with each other. A removal
//! becomes invisible to lookups as soon as the registry mutex is released.

use alloc::{collections::BTreeMap, sync::Arc};

use aster_frame::sync::Mutex;

use crate::{
    binding::{Binding, DeviceBinding},
    types::{Pasid, PasidSet, SourceId},
};

/// The (pasid -> binding) table for one identifier set (host or guest).
pub struct Registry {
    host: Mutex<BTreeMap<u32, Arc<Binding>>>,
    guest: Mutex<BTreeMap<u32, Arc<Binding>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            host: Mutex::new(BTreeMap::new()),
            guest: Mutex::new(BTreeMap::new()),
        })
    }

    fn table(&self, set: PasidSet) -> &Mutex<BTreeMap<u32, Arc<Binding>>> {
        match set {
            PasidSet::Host => &self.host,
            PasidSet::Guest => &self.guest,
        }
    }

    /// Looks up the binding for `pasid` in `set`.
    pub fn find(&self, set: PasidSet, pasid: Pasid) -> Option<Arc<Binding>> {
        self.table(set).lock().get(&pasid.raw()).cloned()
    }

    /// Concurrent-safe device lookup; does not take the registry mutex.
    pub fn find_device(binding: &Binding, source_id: SourceId) -> Option<Arc<DeviceBinding>> {
        binding.devices.find(source_id)
    }

    /// Adds a device-binding to an existing binding's device set.
    pub fn insert_device(&self, binding: &Binding, device: Arc<DeviceBinding>) {
        binding.devices.insert(device);
    }

    /// Removes a device-binding from its binding's device set.
    pub fn remove_device(&self, binding: &Binding, source_id: SourceId) {
        binding.devices.remove(source_id);
    }

    /// Locks the registry mutex for a caller that needs to perform several
    /// of the above operations as one atomic step (bind/unbind's critical
    /// sections).
    pub fn lock(&self, set: PasidSet) -> aster_frame::sync::MutexGuard<'_, BTreeMap<u32, Arc<Binding>>> {
        self.table(set).lock()
    }
}
