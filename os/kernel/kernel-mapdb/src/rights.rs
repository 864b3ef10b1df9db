//! # Rights and access attributes

use bitflags::bitflags;

bitflags! {
    /// Access rights carried in the low nibble of a flexpage.
    ///
    /// Memory and I/O mappings use `R`, `W`, `X`. Capabilities reuse the same
    /// bit positions (`CR`, `CW`, `CS`) and add `CD`, the right to delete the
    /// object and thereby revoke every capability that refers to it.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Rights: u8 {
        const X = 1 << 0;
        const W = 1 << 1;
        const R = 1 << 2;
        const CD = 1 << 3;

        const RX = Self::R.bits() | Self::X.bits();
        const RW = Self::R.bits() | Self::W.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();

        /// Capability "special" right (same bit as `X`).
        const CS = Self::X.bits();
        const CW = Self::W.bits();
        const CR = Self::R.bits();
        const CRW = Self::CR.bits() | Self::CW.bits();
        const CWSD = Self::CW.bits() | Self::CS.bits() | Self::CD.bits();
        const FULL = 0xF;
    }
}

impl Rights {
    /// Rights from the raw 4-bit flexpage field.
    #[inline]
    #[must_use]
    pub const fn from_nibble(bits: u8) -> Self {
        Self::from_bits_truncate(bits & 0xF)
    }
}

bitflags! {
    /// Hardware access bits harvested from page-table entries.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Attribs: u8 {
        const REFERENCED = 1 << 0;
        const DIRTY = 1 << 1;
    }
}

/// Memory type of a mapping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Caching {
    #[default]
    Normal = 1,
    /// Write-combining.
    Buffered = 2,
    Uncached = 3,
}

impl Caching {
    /// Decode the memory-type attribute of a map control word.
    /// `0` means "keep the sender's type".
    #[inline]
    #[must_use]
    pub const fn from_attribs(bits: u8) -> Option<Self> {
        match bits & 0b11 {
            1 => Some(Self::Normal),
            2 => Some(Self::Buffered),
            3 => Some(Self::Uncached),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }
}

/// Attributes handed to a page table when installing an entry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PageAttr {
    pub rights: Rights,
    pub caching: Caching,
}

impl PageAttr {
    #[inline]
    #[must_use]
    pub const fn new(rights: Rights, caching: Caching) -> Self {
        Self { rights, caching }
    }
}
