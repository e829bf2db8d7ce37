// SPDX-License-Identifier: MPL-2.0

//! The PASID allocator boundary.
//!
//! The spec treats this as an external collaborator with a named-set
//! abstraction (`alloc`, `get`, `put`, `attach_data`/`detach_data`, `find`,
//! plus free-event registration). [`BitmapPasidAllocator`] is the concrete
//! implementation this crate ships, grounded on the same bitmap allocator
//! `aster-frame` uses for IRQ numbers.

use alloc::{sync::Arc, vec::Vec};

use aster_frame::sync::SpinLock;
use id_alloc::IdAlloc;

use crate::{
    binding::Binding,
    config::{PASID_MAX, RESERVED_PASID},
    error::{Error, Result},
    types::Pasid,
};

/// Callback invoked when an external actor frees a pasid that may still have
/// live bindings (C7's registration point).
pub type FreeEventCallback = Arc<dyn Fn(Pasid) + Send + Sync>;

/// A single named pasid set (host-mode or guest-mode), backed by a bitmap.
pub struct BitmapPasidAllocator {
    inner: SpinLock<Inner>,
}

struct Inner {
    bitmap: IdAlloc,
    attached: alloc::collections::BTreeMap<u32, Arc<Binding>>,
    free_listeners: Vec<FreeEventCallback>,
}

impl BitmapPasidAllocator {
    /// Creates an allocator over `[1, PASID_MAX)`; pasid 0 is reserved for
    /// the reverse-RID mapping and is never handed out.
    pub fn new() -> Arc<Self> {
        let mut bitmap = IdAlloc::with_capacity(PASID_MAX as usize);
        bitmap.alloc_specific(RESERVED_PASID as usize);
        Arc::new(Self {
            inner: SpinLock::new(Inner {
                bitmap,
                attached: alloc::collections::BTreeMap::new(),
                free_listeners: Vec::new(),
            }),
        })
    }

    /// Allocates a pasid in `[min, max)`. `max` is exclusive and capped to
    /// [`PASID_MAX`].
    pub fn alloc(&self, min: u32, max: u32) -> Result<Pasid> {
        let max = max.min(PASID_MAX);
        if min >= max {
            return Err(Error::InvalidArgs);
        }
        let mut inner = self.inner.lock();
        // `IdAlloc` always hands out the lowest free id; walk forward from
        // `min` for the first unallocated id below `max`.
        for candidate in min..max {
            if !inner.bitmap.is_allocated(candidate as usize)
                && inner.bitmap.alloc_specific(candidate as usize).is_some()
            {
                return Ok(Pasid::new(candidate));
            }
        }
        Err(Error::NoPasidAvailable)
    }

    /// Reserves a specific, externally-supplied pasid (the guest-mode path).
    pub fn alloc_specific(&self, pasid: Pasid) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .bitmap
            .alloc_specific(pasid.raw() as usize)
            .map(|_| ())
            .ok_or(Error::AlreadyBound)
    }

    /// Releases `pasid` back to the free pool.
    pub fn put(&self, pasid: Pasid) {
        let mut inner = self.inner.lock();
        inner.attached.remove(&pasid.raw());
        inner.bitmap.free(pasid.raw() as usize);
    }

    /// Attaches `binding` as the payload associated with `pasid`.
    pub fn attach_data(&self, pasid: Pasid, binding: Arc<Binding>) {
        self.inner.lock().attached.insert(pasid.raw(), binding);
    }

    /// Detaches the payload previously attached to `pasid`.
    pub fn detach_data(&self, pasid: Pasid) {
        self.inner.lock().attached.remove(&pasid.raw());
    }

    /// Finds the binding attached to `pasid`, if any.
    pub fn find(&self, pasid: Pasid) -> Option<Arc<Binding>> {
        self.inner.lock().attached.get(&pasid.raw()).cloned()
    }

    /// Registers a callback invoked whenever an external actor reports that
    /// `pasid` has been freed.
    pub fn on_free(&self, callback: FreeEventCallback) {
        self.inner.lock().free_listeners.push(callback);
    }

    /// Called by the external pasid owner (e.g. a VFIO-style user) to report
    /// that `pasid` is being freed. Fans out to every registered listener
    /// (C7's entry point).
    pub fn notify_freed(&self, pasid: Pasid) {
        let listeners = self.inner.lock().free_listeners.clone();
        for listener in listeners {
            listener(pasid);
        }
    }
}

#[cfg(ktest)]
mod test {
    use super::*;

    #[ktest]
    fn reserved_pasid_is_never_allocated() {
        let alloc = BitmapPasidAllocator::new();
        let p = alloc.alloc(0, 16).unwrap();
        assert_ne!(p.raw(), RESERVED_PASID);
    }

    #[ktest]
    fn alloc_and_put_round_trips() {
        let alloc = BitmapPasidAllocator::new();
        let p = alloc.alloc(1, PASID_MAX).unwrap();
        alloc.put(p);
        let p2 = alloc.alloc(1, PASID_MAX).unwrap();
        assert_eq!(p.raw(), p2.raw());
    }

    #[ktest]
    fn alloc_specific_rejects_duplicate() {
        let alloc = BitmapPasidAllocator::new();
        let p = Pasid::new(5);
        alloc.alloc_specific(p).unwrap();
        assert!(alloc.alloc_specific(p).is_err());
    }
}
