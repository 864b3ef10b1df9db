//! # Resource page numbers
//!
//! The mapping database never deals in byte addresses. Every resource kind is
//! counted in its own base unit: 4 KiB frames for memory, single ports for I/O
//! space, slots for capability tables. [`Pfn`] is such a unit number, used for
//! both the physical side (which resource) and the virtual side (where in a
//! space it is mapped).
//!
//! Size classes are expressed as a *shift* relative to the base unit: shift `9`
//! on memory is a 2 MiB superpage, shift `8` on I/O space a 256-port block.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Byte address bits below the memory base unit.
pub const MEM_ADDR_SHIFT: u32 = 12;

/// A resource unit number (page frame, port, or slot).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u64);

impl Pfn {
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Unit number of a memory byte address.
    #[inline]
    #[must_use]
    pub const fn from_mem_addr(addr: u64) -> Self {
        Self(addr >> MEM_ADDR_SHIFT)
    }

    /// Byte address of this memory unit.
    #[inline]
    #[must_use]
    pub const fn mem_addr(self) -> u64 {
        self.0 << MEM_ADDR_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Clear the low `shift` bits.
    #[inline]
    #[must_use]
    pub const fn align_down(self, shift: u8) -> Self {
        Self(self.0 & !mask(shift))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned(self, shift: u8) -> bool {
        self.0 & mask(shift) == 0
    }

    /// Distance from the start of the `shift`-sized block containing `self`.
    #[inline]
    #[must_use]
    pub const fn offset_in(self, shift: u8) -> u64 {
        self.0 & mask(shift)
    }

    /// Index of the `shift`-sized block containing `self`.
    #[inline]
    #[must_use]
    pub const fn block(self, shift: u8) -> u64 {
        if shift >= 64 { 0 } else { self.0 >> shift }
    }
}

/// Low-bit mask for a size class, saturating at the full word.
#[inline]
#[must_use]
pub const fn mask(shift: u8) -> u64 {
    if shift >= 64 {
        u64::MAX
    } else {
        (1_u64 << shift) - 1
    }
}

/// Number of units in a size class.
#[inline]
#[must_use]
pub const fn units(shift: u8) -> u64 {
    mask(shift).wrapping_add(1)
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn(0x{:X})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

impl From<u64> for Pfn {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<Pfn> for u64 {
    #[inline]
    fn from(p: Pfn) -> Self {
        p.as_u64()
    }
}

impl Add<u64> for Pfn {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for Pfn {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for Pfn {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}
