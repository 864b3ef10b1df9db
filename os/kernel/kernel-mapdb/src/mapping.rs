//! # Mapping nodes
//!
//! A [`Mapping`] is one edge of the derivation graph: space `S` holds resource
//! `R` at page `P` because some parent mapping handed it over. Nodes carry no
//! parent or child pointers; their position in the tree is encoded by the
//! array order (pre-order) and a [`Depth`] tag.

use crate::page::Pfn;
use crate::rights::Rights;
use crate::space::SpaceId;
use crate::tree::Submap;
use alloc::boxed::Box;
use core::fmt;

/// Depth tag of a slot.
///
/// | Value        | Meaning |
/// |--------------|---------|
/// | `0`          | top-level root (the resource owner) |
/// | `1..=MAX`    | distance from the top-level root |
/// | [`SUBMAP`]   | link to finer-granularity trees of the preceding node |
/// | [`EMPTY`]    | free slot |
/// | [`END`]      | array sentinel |
///
/// [`SUBMAP`]: Depth::SUBMAP
/// [`EMPTY`]: Depth::EMPTY
/// [`END`]: Depth::END
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Depth(u8);

impl Depth {
    pub const ROOT: Self = Self(0);
    pub const MAX: Self = Self(251);
    pub const SUBMAP: Self = Self(253);
    pub const EMPTY: Self = Self(254);
    pub const END: Self = Self(255);

    #[inline]
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// A regular depth; values above [`Depth::MAX`] are clamped.
    #[inline]
    #[must_use]
    pub const fn level(depth: u8) -> Self {
        if depth > Self::MAX.0 { Self::MAX } else { Self(depth) }
    }

    /// Depth of a child, `None` when the tree is too deep.
    #[inline]
    #[must_use]
    pub const fn child(self) -> Option<Self> {
        if self.0 < Self::MAX.0 {
            Some(Self(self.0 + 1))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_regular(self) -> bool {
        self.0 <= Self::MAX.0
    }
}

impl fmt::Debug for Depth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SUBMAP => f.write_str("Depth::SUBMAP"),
            Self::EMPTY => f.write_str("Depth::EMPTY"),
            Self::END => f.write_str("Depth::END"),
            Self(d) => write!(f, "Depth({d})"),
        }
    }
}

/// One slot of a [`MappingTree`](crate::tree::MappingTree).
pub struct Mapping {
    space: SpaceId,
    page: Pfn,
    rights: Rights,
    depth: Depth,
    submap: Option<Box<Submap>>,
}

impl Mapping {
    /// A regular node.
    #[must_use]
    pub const fn new(space: SpaceId, page: Pfn, rights: Rights, depth: Depth) -> Self {
        Self {
            space,
            page,
            rights,
            depth,
            submap: None,
        }
    }

    pub(crate) const fn empty() -> Self {
        Self {
            space: SpaceId::new(0),
            page: Pfn::new(0),
            rights: Rights::empty(),
            depth: Depth::EMPTY,
            submap: None,
        }
    }

    pub(crate) const fn end() -> Self {
        Self {
            space: SpaceId::new(0),
            page: Pfn::new(0),
            rights: Rights::empty(),
            depth: Depth::END,
            submap: None,
        }
    }

    pub(crate) fn link(submap: Box<Submap>) -> Self {
        Self {
            depth: Depth::SUBMAP,
            submap: Some(submap),
            ..Self::empty()
        }
    }

    /// Owning space (non-owning back reference).
    #[inline]
    #[must_use]
    pub const fn space(&self) -> SpaceId {
        self.space
    }

    /// Page in the owning space, aligned to the tree's size class.
    #[inline]
    #[must_use]
    pub const fn page(&self) -> Pfn {
        self.page
    }

    #[inline]
    #[must_use]
    pub const fn rights(&self) -> Rights {
        self.rights
    }

    #[inline]
    #[must_use]
    pub const fn depth(&self) -> Depth {
        self.depth
    }

    #[inline]
    #[must_use]
    pub const fn unused(&self) -> bool {
        self.depth.0 == Depth::EMPTY.0
    }

    #[inline]
    #[must_use]
    pub const fn is_submap(&self) -> bool {
        self.depth.0 == Depth::SUBMAP.0
    }

    #[inline]
    #[must_use]
    pub const fn is_end(&self) -> bool {
        self.depth.0 == Depth::END.0
    }

    #[inline]
    #[must_use]
    pub const fn is_regular(&self) -> bool {
        self.depth.is_regular()
    }

    pub(crate) const fn set_space(&mut self, space: SpaceId, page: Pfn) {
        self.space = space;
        self.page = page;
    }

    pub(crate) const fn set_rights(&mut self, rights: Rights) {
        self.rights = rights;
    }

    pub(crate) fn submap(&self) -> Option<&Submap> {
        self.submap.as_deref()
    }

    pub(crate) fn submap_mut(&mut self) -> Option<&mut Submap> {
        self.submap.as_deref_mut()
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_regular() {
            write!(
                f,
                "Mapping({} @ {} {:?} d={})",
                self.space,
                self.page,
                self.rights,
                self.depth.0
            )
        } else {
            self.depth.fmt(f)
        }
    }
}
