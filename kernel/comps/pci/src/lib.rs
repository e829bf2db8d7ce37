// SPDX-License-Identifier: MPL-2.0

//! PCI device identity.
//!
//! This crate only models the part of the PCI bus that other components need
//! as a stable key: the location of a function (bus/device/function) and the
//! "source-ID" (a.k.a. requester-ID) that hardware tags DMA and interrupt
//! requests with. Capability probing, configuration-space access, and full
//! bus enumeration belong to a bus driver and are intentionally not part of
//! this crate.

#![no_std]
#![forbid(unsafe_code)]

mod device_info;

pub use device_info::{PciDeviceLocation, SourceId};
