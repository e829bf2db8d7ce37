// SPDX-License-Identifier: MPL-2.0

//! Tunable constants.

/// Width of the hardware PASID field: 20 bits.
pub const PASID_MAX: u32 = 1 << 20;

/// PASID 0 is reserved for the reverse-RID mapping and is never handed out
/// by [`crate::pasid::BitmapPasidAllocator`].
pub const RESERVED_PASID: u32 = 0;

/// Page size assumed by the PRQ descriptor's `addr` field (`addr << PAGE_SHIFT`).
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// A soft progress-logging threshold for phase-2 drain polling. Drain itself
/// has no timeout (see the concurrency model), but spinning past this many
/// iterations without the hardware clearing "pending response outstanding"
/// is worth a warning.
pub const PRQ_DRAIN_WARN_SPINS: u32 = 10_000;
