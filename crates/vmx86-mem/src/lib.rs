//! Guest virtual address space.
//!
//! An [`AddressSpace`] is an ordered set of non-overlapping, page-aligned regions, each with
//! read/write/execute permissions and a backing store. All multi-byte accesses are
//! little-endian and may be unaligned; an access either touches only permitted, mapped bytes or
//! fails with a [`MemoryFault`] naming the first offending byte, without any partial effect.
//!
//! The address space also keeps the registry of guest ranges that translated code was built
//! from (see [`code`]). Stores consult it and notify the registered [`WriteObserver`] before
//! returning, which is what keeps translated code coherent with self-modifying guests.

pub mod code;
mod fault;
mod region;
mod space;

pub use code::{CodeKey, CodeSnapshot, WriteObserver};
pub use fault::{Access, FaultKind, MapError, MemoryFault};
pub use region::{Backing, BackingKind, Prot, RegionInfo};
pub use space::AddressSpace;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Lowest address [`AddressSpace::map`] hands out for a non-fixed mapping.
pub const MIN_MAP_ADDRESS: u64 = 0x1_0000;

/// One past the highest user-space address (the canonical lower half).
pub const USER_ADDRESS_LIMIT: u64 = 0x0000_8000_0000_0000;

#[inline]
pub const fn page_of(addr: u64) -> u64 {
    addr >> PAGE_SHIFT
}

#[inline]
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Round up to a page boundary; `None` on overflow.
#[inline]
pub fn page_align_up(addr: u64) -> Option<u64> {
    addr.checked_add(PAGE_SIZE - 1).map(page_align_down)
}

#[inline]
pub const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}
