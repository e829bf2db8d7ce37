// SPDX-License-Identifier: MPL-2.0

//! The error taxonomy of the SVA subsystem.

use core::fmt;

/// Errors returned by the bind/unbind surface.
///
/// The PRQ reader, the fault resolver, and the address-space observer never
/// surface this type to a caller: a fault always resolves to a
/// [`crate::descriptor::ResponseCode`] instead, and hardware-class failures
/// (PRQ overflow, a stuck invalidation) are logged and absorbed in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A bad argument or malformed descriptor.
    InvalidArgs,
    /// An address failed the canonical-address check.
    NonCanonicalAddress,
    /// A pasid, region, or index fell outside its valid range.
    OutOfRange,
    /// A (device, pasid) pair is already bound.
    AlreadyBound,
    /// No binding exists for the given handle.
    NotBound,
    /// The device does not support the requested PASID capability.
    DeviceNotCapable,
    /// The PASID space for this set is exhausted.
    NoPasidAvailable,
    /// A memory allocation failed.
    NoMemory,
    /// A hardware invalidation did not complete.
    InvalidationTimedOut,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidArgs => "invalid arguments",
            Error::NonCanonicalAddress => "non-canonical address",
            Error::OutOfRange => "value out of range",
            Error::AlreadyBound => "device already bound to this pasid",
            Error::NotBound => "no such binding",
            Error::DeviceNotCapable => "device lacks required pasid capability",
            Error::NoPasidAvailable => "pasid space exhausted",
            Error::NoMemory => "out of memory",
            Error::InvalidationTimedOut => "hardware invalidation timed out",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
