//! # IPC wire words
//!
//! Bit-exact views of the machine words the mapping layer consumes from IPC
//! map items and the unmap system call.
//!
//! ### Flexpage layout
//!
//! | Bits   | Field  | Meaning |
//! |--------|--------|---------|
//! | 0..=3  | rights | [`Rights`] nibble |
//! | 4..=5  | type   | [`FpageType`] |
//! | 6..=11 | order  | log2 of the size in bytes / ports / slots; `63` = whole space |
//! | 12..   | page   | address (memory) or port / slot index, already shifted by 12 |
//!
//! Memory flexpages carry a byte address whose low 12 bits are the control
//! fields, so `word & !0xFFF` is the base address. I/O and object flexpages
//! store the port or slot number in the same `page` field.

use crate::page::{MEM_ADDR_SHIFT, Pfn};
use crate::rights::{Caching, Rights};
use bitfield_struct::bitfield;

#[allow(clippy::cast_possible_truncation)]
const MEM_ADDR_ORDER: u8 = MEM_ADDR_SHIFT as u8;

/// Flexpage kind (bits 4..=5).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum FpageType {
    Special = 0,
    Memory = 1,
    Io = 2,
    Obj = 3,
}

impl FpageType {
    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(v: u8) -> Self {
        match v & 0b11 {
            0 => Self::Special,
            1 => Self::Memory,
            2 => Self::Io,
            _ => Self::Obj,
        }
    }
}

#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Fpage {
    #[bits(4)]
    pub rights_bits: u8,
    #[bits(2)]
    pub type_bits: u8,
    #[bits(6)]
    pub order: u8,
    #[bits(52)]
    pub page: u64,
}

impl Fpage {
    /// Order value reserved for "the entire space".
    pub const WHOLE_SPACE: u8 = 63;

    /// Memory flexpage covering `2^order` bytes at `addr`.
    #[must_use]
    pub const fn mem(addr: u64, order: u8, rights: Rights) -> Self {
        Self::new()
            .with_rights_bits(rights.bits())
            .with_type_bits(FpageType::Memory.into_bits())
            .with_order(order & 0x3F)
            .with_page(addr >> MEM_ADDR_SHIFT)
    }

    /// I/O flexpage covering `2^order` ports starting at `port`.
    #[must_use]
    pub const fn io(port: u64, order: u8, rights: Rights) -> Self {
        Self::new()
            .with_rights_bits(rights.bits())
            .with_type_bits(FpageType::Io.into_bits())
            .with_order(order & 0x3F)
            .with_page(port)
    }

    /// Object flexpage covering `2^order` capability slots starting at `index`.
    #[must_use]
    pub const fn obj(index: u64, order: u8, rights: Rights) -> Self {
        Self::new()
            .with_rights_bits(rights.bits())
            .with_type_bits(FpageType::Obj.into_bits())
            .with_order(order & 0x3F)
            .with_page(index)
    }

    /// Memory flexpage spanning the whole address space.
    #[must_use]
    pub const fn all_mem(rights: Rights) -> Self {
        Self::new()
            .with_rights_bits(rights.bits())
            .with_type_bits(FpageType::Memory.into_bits())
            .with_order(Self::WHOLE_SPACE)
    }

    #[inline]
    #[must_use]
    pub const fn kind(self) -> FpageType {
        FpageType::from_bits(self.type_bits())
    }

    #[inline]
    #[must_use]
    pub const fn rights(self) -> Rights {
        Rights::from_nibble(self.rights_bits())
    }

    #[inline]
    #[must_use]
    pub const fn is_whole_space(self) -> bool {
        self.order() == Self::WHOLE_SPACE
    }

    /// Byte address of a memory flexpage.
    #[inline]
    #[must_use]
    pub const fn mem_address(self) -> u64 {
        self.page() << MEM_ADDR_SHIFT
    }

    /// First base unit of the flexpage: memory frame, port, or slot.
    #[inline]
    #[must_use]
    pub const fn first_unit(self) -> Pfn {
        Pfn::new(self.page())
    }

    /// Order in base units: for memory this drops the 12 in-page bits.
    /// `None` for memory flexpages smaller than one frame.
    #[must_use]
    pub const fn unit_order(self) -> Option<u8> {
        match self.kind() {
            FpageType::Memory if self.is_whole_space() => Some(64 - MEM_ADDR_ORDER),
            FpageType::Memory => {
                let order = self.order();
                if order < MEM_ADDR_ORDER {
                    None
                } else {
                    Some(order - MEM_ADDR_ORDER)
                }
            }
            _ => Some(self.order()),
        }
    }
}

/// Control word of a map item (the "send base" word).
///
/// | Bits   | Field     |
/// |--------|-----------|
/// | 0      | compound  |
/// | 1      | grant     |
/// | 3      | map item marker |
/// | 4..=7  | attribs: memory type for memory, bit 0 = weak reference for objects |
/// | 12..   | send base (hot spot), in 4 KiB units for memory, units otherwise |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct MapControl {
    pub compound: bool,
    pub grant: bool,
    #[bits(1)]
    __reserved_lo: u8,
    pub map_item: bool,
    #[bits(4)]
    pub attribs: u8,
    #[bits(4)]
    __reserved_hi: u8,
    #[bits(52)]
    pub send_base: u64,
}

impl MapControl {
    /// Weak-reference attribute for object map items.
    pub const ATTR_WEAK_REF: u8 = 0b0001;

    #[must_use]
    pub const fn map(send_base: u64) -> Self {
        Self::new().with_map_item(true).with_send_base(send_base)
    }

    #[must_use]
    pub const fn grant_item(send_base: u64) -> Self {
        Self::map(send_base).with_grant(true)
    }

    /// Memory type requested by the sender, if any.
    #[inline]
    #[must_use]
    pub const fn caching(self) -> Option<Caching> {
        Caching::from_attribs(self.attribs())
    }

    /// Object map items: the receiver's capability does not keep the object alive.
    #[inline]
    #[must_use]
    pub const fn weak_ref(self) -> bool {
        self.attribs() & Self::ATTR_WEAK_REF != 0
    }

    #[inline]
    #[must_use]
    pub const fn hot_spot(self) -> u64 {
        self.send_base()
    }
}

/// Buffer descriptor word from the receiver's UTCB.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct BufferDesc {
    #[bits(5)]
    pub mem: u8,
    #[bits(5)]
    pub io: u8,
    #[bits(5)]
    pub obj: u8,
    #[bits(9)]
    __reserved_lo: u16,
    pub inherit_fpu: bool,
    #[bits(39)]
    __reserved_hi: u64,
}

impl BufferDesc {
    /// Index of the first receive buffer for a flexpage kind.
    #[must_use]
    pub const fn first_buffer(self, kind: FpageType) -> Option<u8> {
        match kind {
            FpageType::Memory => Some(self.mem()),
            FpageType::Io => Some(self.io()),
            FpageType::Obj => Some(self.obj()),
            FpageType::Special => None,
        }
    }
}
