//! # Address-space collaborators
//!
//! The mapping database records *who* has *what*; the spaces themselves own
//! the page tables and capability tables. These traits are the seam: the
//! mapping layer calls them, the kernel's space implementations provide them.
//!
//! Implementations are expected to be internally synchronized (page-table and
//! capability-table locks), because `map_util` reaches into arbitrary
//! descendant spaces while it holds a physframe or object lock. The lock order
//! is always *mapdb frame, then space*.

use crate::error::{InsertError, InsertStatus};
use crate::kobject::Capability;
use crate::page::Pfn;
use crate::rights::{Attribs, Caching, PageAttr, Rights};
use core::fmt;

/// Non-owning reference to an address space.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SpaceId(u32);

impl SpaceId {
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpaceId({})", self.0)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "space#{}", self.0)
    }
}

/// Anything that takes part in mapping: memory, I/O and object spaces.
pub trait MappingSpace {
    fn id(&self) -> SpaceId;
}

/// One installed page-table entry, as reported by [`PageSpace::v_lookup`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageInfo {
    /// First resource unit of the page.
    pub phys: Pfn,
    /// Size class of the page.
    pub shift: u8,
    pub rights: Rights,
    pub caching: Caching,
}

impl PageInfo {
    /// Resource unit backing `virt`, which must lie inside this page.
    #[inline]
    #[must_use]
    pub const fn phys_of(&self, virt: Pfn) -> Pfn {
        Pfn::new(self.phys.as_u64() + virt.offset_in(self.shift))
    }
}

/// Page-table primitive for memory and I/O spaces.
pub trait PageSpace: MappingSpace {
    /// The page containing `virt`, if any.
    fn v_lookup(&self, virt: Pfn) -> Option<PageInfo>;

    /// Install `phys` at `virt` with size class `shift`.
    ///
    /// # Errors
    /// - [`InsertError::NoMem`] when the page table cannot allocate.
    /// - [`InsertError::Exists`] when a conflicting entry occupies `virt`.
    fn v_insert(
        &self,
        phys: Pfn,
        virt: Pfn,
        shift: u8,
        attr: PageAttr,
    ) -> Result<InsertStatus, InsertError>;

    /// Revoke `rights` from the page at `virt`; removing every access right
    /// removes the entry. Returns the access bits the entry carried.
    fn v_delete(&self, virt: Pfn, shift: u8, rights: Rights) -> Attribs;

    /// Fold harvested access bits into the entry at `virt`.
    fn v_add_access_flags(&self, virt: Pfn, flags: Attribs);

    /// First mapped unit in `virt..end`; `virt` itself if it lies inside a page.
    fn v_next_mapped(&self, virt: Pfn, end: Pfn) -> Option<Pfn>;
}

/// Capability-table primitive for object spaces.
pub trait CapSpace: MappingSpace {
    fn cap_lookup(&self, slot: Pfn) -> Option<Capability>;

    fn cap_insert(&self, slot: Pfn, cap: Capability);

    fn cap_clear(&self, slot: Pfn) -> Option<Capability>;

    /// Replace the rights of an occupied slot; `false` if the slot is empty.
    fn cap_set_rights(&self, slot: Pfn, rights: Rights) -> bool;

    /// First occupied slot in `slot..end`.
    fn cap_next_used(&self, slot: Pfn, end: Pfn) -> Option<Pfn>;
}

/// Resolves the [`SpaceId`]s stored in mappings back to spaces.
pub trait SpaceDirectory<S: ?Sized> {
    fn space(&self, id: SpaceId) -> Option<&S>;
}
