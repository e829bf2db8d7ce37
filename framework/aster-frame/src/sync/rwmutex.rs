// SPDX-License-Identifier: MPL-2.0

//! A sleepable reader-writer mutex, built on [`WaitQueue`] the same way
//! [`super::Mutex`] is. Prefer this over [`super::RwLock`] when the
//! critical section may sleep (e.g. it allocates or takes another sleepable
//! lock); prefer [`super::RwLock`] for short, non-sleeping critical
//! sections.

use core::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicIsize, Ordering},
};

use super::WaitQueue;

const WRITE_LOCKED: isize = -1;

pub struct RwMutex<T: ?Sized> {
    /// `0` when unlocked, `WRITE_LOCKED` when write-locked, otherwise the
    /// number of concurrent readers.
    state: AtomicIsize,
    queue: WaitQueue,
    val: UnsafeCell<T>,
}

impl<T> RwMutex<T> {
    pub const fn new(val: T) -> Self {
        Self {
            state: AtomicIsize::new(0),
            queue: WaitQueue::new(),
            val: UnsafeCell::new(val),
        }
    }
}

impl<T: ?Sized> RwMutex<T> {
    pub fn read(&self) -> RwMutexReadGuard<T> {
        self.queue.wait_until(|| self.try_read())
    }

    pub fn write(&self) -> RwMutexWriteGuard<T> {
        self.queue.wait_until(|| self.try_write())
    }

    pub fn try_read(&self) -> Option<RwMutexReadGuard<T>> {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if current == WRITE_LOCKED {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(RwMutexReadGuard { mutex: self }),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn try_write(&self) -> Option<RwMutexWriteGuard<T>> {
        self.state
            .compare_exchange(0, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwMutexWriteGuard { mutex: self })
    }

    fn unlock_read(&self) {
        self.state.fetch_sub(1, Ordering::Release);
        self.queue.wake_all();
    }

    fn unlock_write(&self) {
        self.state.store(0, Ordering::Release);
        self.queue.wake_all();
    }
}

unsafe impl<T: ?Sized + Send> Send for RwMutex<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwMutex<T> {}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.val, f)
    }
}

pub struct RwMutexReadGuard<'a, T: ?Sized> {
    mutex: &'a RwMutex<T>,
}

impl<'a, T: ?Sized> Deref for RwMutexReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.val.get() }
    }
}

impl<'a, T: ?Sized> Drop for RwMutexReadGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock_read();
    }
}

impl<'a, T: ?Sized> !Send for RwMutexReadGuard<'a, T> {}
unsafe impl<'a, T: ?Sized + Sync> Sync for RwMutexReadGuard<'a, T> {}

pub struct RwMutexWriteGuard<'a, T: ?Sized> {
    mutex: &'a RwMutex<T>,
}

impl<'a, T: ?Sized> Deref for RwMutexWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.val.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for RwMutexWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.val.get() }
    }
}

impl<'a, T: ?Sized> Drop for RwMutexWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.unlock_write();
    }
}

impl<'a, T: ?Sized> !Send for RwMutexWriteGuard<'a, T> {}
unsafe impl<'a, T: ?Sized + Sync> Sync for RwMutexWriteGuard<'a, T> {}

/// An upgradeable read guard is not yet supported by this sleepable
/// variant; reach for [`super::RwLock`] if you need one.
pub struct RwMutexUpgradeableGuard<'a, T: ?Sized> {
    mutex: &'a RwMutex<T>,
}

impl<'a, T: ?Sized> Deref for RwMutexUpgradeableGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.val.get() }
    }
}
