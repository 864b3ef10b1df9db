//! # Mapping trees
//!
//! A [`MappingTree`] records every mapping of one resource unit at one size
//! class. The tree is stored as a bounded slot array in pre-order: a node's
//! subtree is the contiguous run of slots after it whose depth is greater than
//! its own. Slot 0 is the root. Free slots ([`Depth::EMPTY`]) may appear
//! anywhere inside the used prefix; the last slot is always the
//! [`Depth::END`] sentinel.
//!
//! ```text
//!  slot:   0      1      2       3      4      5     (END)
//!  depth:  0      1      2       S      1      E
//!          root ─ A ──── B       │      C     free
//!                        └ submap of B (finer trees)
//! ```
//!
//! Remapping part of a page at a finer size class goes through a [`Submap`]:
//! a slot tagged [`Depth::SUBMAP`] placed directly after its owner, holding
//! one lazily created tree per finer unit. The root of such a tree is a copy
//! of the owner (same space and depth, page offset by the unit), so the
//! finer mappings below it continue the owner's depth count.
//!
//! All operations assume the caller holds the enclosing physframe lock.
//!
//! [`Depth::EMPTY`]: crate::mapping::Depth::EMPTY
//! [`Depth::END`]: crate::mapping::Depth::END
//! [`Depth::SUBMAP`]: crate::mapping::Depth::SUBMAP

use crate::error::{InsertError, fatal};
use crate::mapping::Mapping;
use crate::page::Pfn;
use crate::rights::Rights;
use crate::space::SpaceId;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

/// Smallest array a tree is created with.
pub const TREE_ENTRIES_MIN: usize = 4;

pub struct MappingTree {
    slots: Box<[Mapping]>,
    count: usize,
    empty_count: usize,
    max_entries: usize,
}

impl MappingTree {
    /// A tree holding only `root`, with room for `entries` nodes that may grow
    /// up to `max_entries`.
    ///
    /// # Errors
    /// [`InsertError::NoMem`] if the slot array cannot be allocated.
    pub fn new(root: Mapping, entries: usize, max_entries: usize) -> Result<Self, InsertError> {
        let max_entries = max_entries.max(TREE_ENTRIES_MIN);
        let capacity = entries.clamp(TREE_ENTRIES_MIN, max_entries);
        let mut slots = alloc_slots(capacity)?;
        slots[0] = root;
        Ok(Self {
            slots,
            count: 1,
            empty_count: 0,
            max_entries,
        })
    }

    /// The used prefix of the slot array, free slots included.
    #[inline]
    #[must_use]
    pub fn mappings(&self) -> &[Mapping] {
        &self.slots[..self.used()]
    }

    /// Current capacity, sentinel excluded.
    #[inline]
    #[must_use]
    pub fn number_of_entries(&self) -> usize {
        self.slots.len() - 1
    }

    /// Live nodes, submap links included.
    #[inline]
    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.count + self.empty_count
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Mapping {
        &self.slots[0]
    }

    /// Only the root is left.
    #[inline]
    #[must_use]
    pub const fn is_trivial(&self) -> bool {
        self.count <= 1
    }

    /// Live slot at `index`, `None` for free or out-of-range slots.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Mapping> {
        self.mappings().get(index).filter(|m| !m.unused())
    }

    pub(crate) fn slot(&self, index: usize) -> &Mapping {
        &self.slots[index]
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut Mapping {
        &mut self.slots[index]
    }

    /// Live regular nodes with their slot index, in pre-order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Mapping)> {
        self.mappings()
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_regular())
    }

    /// One past the last slot of `index`'s subtree.
    #[must_use]
    pub fn subtree_end(&self, index: usize) -> usize {
        let depth = self.slots[index].depth();
        let used = self.used();
        let mut i = index + 1;
        while i < used {
            let m = &self.slots[i];
            if m.is_regular() && m.depth() <= depth {
                break;
            }
            i += 1;
        }
        i
    }

    /// Slot index of the parent: the nearest preceding regular node with a
    /// smaller depth, or the owner for a submap link.
    #[must_use]
    pub fn parent(&self, index: usize) -> Option<usize> {
        let m = &self.slots[index];
        if m.is_submap() {
            return (0..index).rev().find(|&i| self.slots[i].is_regular());
        }
        if !m.is_regular() {
            return None;
        }
        let depth = m.depth();
        (0..index)
            .rev()
            .find(|&i| self.slots[i].is_regular() && self.slots[i].depth() < depth)
    }

    /// Direct children of `index`.
    pub fn children(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        let child = self.slots[index].depth().child();
        let end = self.subtree_end(index);
        (index + 1..end).filter(move |&i| Some(self.slots[i].depth()) == child)
    }

    /// The submap link owned by `owner`, if any.
    #[must_use]
    pub fn submap_of(&self, owner: usize) -> Option<usize> {
        let used = self.used();
        let mut i = owner + 1;
        while i < used && self.slots[i].unused() {
            i += 1;
        }
        (i < used && self.slots[i].is_submap()).then_some(i)
    }

    /// Insert a child of `parent` at the end of `parent`'s subtree.
    ///
    /// # Errors
    /// [`InsertError::NoMem`] when the array cannot make room or the tree is
    /// too deep.
    pub fn insert_at(
        &mut self,
        parent: usize,
        space: SpaceId,
        page: Pfn,
        rights: Rights,
    ) -> Result<usize, InsertError> {
        let owner = &self.slots[parent];
        if !owner.is_regular() {
            fatal("insert below a slot that is not a mapping");
        }
        let depth = owner.depth().child().ok_or(InsertError::NoMem)?;

        let mut pos = self.subtree_end(parent);
        while pos > parent + 1 && self.slots[pos - 1].unused() {
            pos -= 1;
        }
        self.place(pos, Mapping::new(space, page, rights, depth))
    }

    /// Make sure `owner` has a submap link for size class `level` split into
    /// `units` finer trees; returns the link's slot.
    ///
    /// # Errors
    /// [`InsertError::NoMem`] if the link or its table cannot be allocated.
    pub fn promote_to_submap(
        &mut self,
        owner: usize,
        level: usize,
        units: usize,
    ) -> Result<usize, InsertError> {
        if !self.slots[owner].is_regular() {
            fatal("submap requested for a slot that is not a mapping");
        }
        if let Some(link) = self.submap_of(owner) {
            return Ok(link);
        }
        let submap = Submap::try_new(level, units)?;
        self.place(owner + 1, Mapping::link(submap))
    }

    /// Free every slot of `index`'s subtree, nested submaps included.
    pub fn remove_subtree(&mut self, index: usize) -> usize {
        let end = self.subtree_end(index);
        let mut removed = 0;
        for i in index..end {
            if !self.slots[i].unused() {
                self.free_slot(i);
                removed += 1;
            }
        }
        self.trim();
        removed
    }

    /// Free everything below `index`, keeping `index` itself.
    pub fn remove_descendants(&mut self, index: usize) -> usize {
        let end = self.subtree_end(index);
        let mut removed = 0;
        for i in index + 1..end {
            if !self.slots[i].unused() {
                self.free_slot(i);
                removed += 1;
            }
        }
        self.trim();
        removed
    }

    pub(crate) fn free_slot(&mut self, index: usize) -> Mapping {
        debug_assert!(!self.slots[index].unused(), "double free of a mapping slot");
        self.count -= 1;
        self.empty_count += 1;
        core::mem::replace(&mut self.slots[index], Mapping::empty())
    }

    /// Drop free slots from the tail of the used prefix.
    pub(crate) fn trim(&mut self) {
        while self.used() > 0 && self.slots[self.used() - 1].unused() {
            self.empty_count -= 1;
        }
    }

    fn place(&mut self, mut pos: usize, node: Mapping) -> Result<usize, InsertError> {
        loop {
            let used = self.used();
            if pos < used && self.slots[pos].unused() {
                self.slots[pos] = node;
                self.empty_count -= 1;
                self.count += 1;
                return Ok(pos);
            }
            if let Some(hole) = (pos..used).find(|&i| self.slots[i].unused()) {
                self.slots[pos..=hole].rotate_right(1);
                self.slots[pos] = node;
                self.empty_count -= 1;
                self.count += 1;
                return Ok(pos);
            }
            if used < self.number_of_entries() {
                self.slots[pos..=used].rotate_right(1);
                self.slots[pos] = node;
                self.count += 1;
                return Ok(pos);
            }
            if self.empty_count > 0 {
                pos = self.compact(pos);
                continue;
            }
            self.grow()?;
        }
    }

    /// Squeeze out free slots; returns where `pos` moved to.
    fn compact(&mut self, pos: usize) -> usize {
        let used = self.used();
        let holes_before = self.slots[..pos].iter().filter(|m| m.unused()).count();
        let mut w = 0;
        for r in 0..used {
            if !self.slots[r].unused() {
                self.slots.swap(w, r);
                w += 1;
            }
        }
        self.empty_count = 0;
        pos - holes_before
    }

    fn grow(&mut self) -> Result<(), InsertError> {
        let capacity = self.number_of_entries();
        if capacity >= self.max_entries {
            return Err(InsertError::NoMem);
        }
        let grown = capacity.saturating_mul(2).min(self.max_entries);
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(grown + 1)
            .map_err(|_| InsertError::NoMem)?;
        let mut old = core::mem::take(&mut self.slots).into_vec();
        old.truncate(capacity);
        slots.append(&mut old);
        slots.resize_with(grown, Mapping::empty);
        slots.push(Mapping::end());
        self.slots = slots.into_boxed_slice();
        Ok(())
    }

    /// Check the structural invariants of this tree and its submaps.
    ///
    /// # Errors
    /// A description of the first violated invariant.
    pub fn verify(&self) -> Result<(), &'static str> {
        let capacity = self.number_of_entries();
        if self.count > capacity {
            return Err("count exceeds capacity");
        }
        if self.used() > capacity {
            return Err("used prefix exceeds capacity");
        }
        if !self.slots[capacity].is_end() {
            return Err("missing end sentinel");
        }
        if self.slots[self.used()..capacity].iter().any(|m| !m.unused()) {
            return Err("live slot beyond the used prefix");
        }
        if self.count == 0 {
            return Ok(());
        }

        let root = &self.slots[0];
        if !root.is_regular() {
            return Err("slot 0 is not a mapping");
        }

        let mut live = 0;
        let mut last_depth = root.depth();
        let mut last_was_link = false;
        for (i, m) in self.mappings().iter().enumerate() {
            if m.unused() {
                continue;
            }
            if m.is_end() {
                return Err("sentinel inside the used prefix");
            }
            live += 1;
            if let Some(submap) = m.submap() {
                if i == 0 || last_was_link {
                    return Err("submap link without an owner");
                }
                submap.verify_below(&self.slots[self.parent(i).unwrap_or(0)])?;
                last_was_link = true;
                continue;
            }
            if m.is_submap() {
                return Err("submap link without a table");
            }
            if i > 0 {
                if m.depth() <= root.depth() {
                    return Err("second root in tree");
                }
                if m.depth().get() > last_depth.get() + 1 {
                    return Err("depth jumps by more than one");
                }
            }
            last_depth = m.depth();
            last_was_link = false;
        }
        if live != self.count {
            return Err("live count mismatch");
        }
        Ok(())
    }

    /// [`verify`](Self::verify), halting on failure.
    pub fn check_invariants(&self) {
        if let Err(what) = self.verify() {
            fatal(what);
        }
    }
}

impl fmt::Debug for MappingTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingTree")
            .field("count", &self.count)
            .field("entries", &self.number_of_entries())
            .field("mappings", &self.mappings())
            .finish()
    }
}

fn alloc_slots(capacity: usize) -> Result<Box<[Mapping]>, InsertError> {
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(capacity + 1)
        .map_err(|_| InsertError::NoMem)?;
    slots.resize_with(capacity, Mapping::empty);
    slots.push(Mapping::end());
    Ok(slots.into_boxed_slice())
}

/// Finer-granularity trees below one mapping.
pub struct Submap {
    level: usize,
    frames: Box<[Option<MappingTree>]>,
}

impl Submap {
    pub(crate) fn try_new(level: usize, units: usize) -> Result<Box<Self>, InsertError> {
        let mut frames = Vec::new();
        frames
            .try_reserve_exact(units)
            .map_err(|_| InsertError::NoMem)?;
        frames.resize_with(units, || None);
        Ok(Box::new(Self {
            level,
            frames: frames.into_boxed_slice(),
        }))
    }

    /// Size class index of the trees in this submap.
    #[inline]
    #[must_use]
    pub const fn level(&self) -> usize {
        self.level
    }

    #[inline]
    #[must_use]
    pub fn units(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn frame(&self, key: usize) -> Option<&MappingTree> {
        self.frames.get(key).and_then(Option::as_ref)
    }

    pub(crate) fn frame_slot(&mut self, key: usize) -> &mut Option<MappingTree> {
        &mut self.frames[key]
    }

    /// Trees present, with their unit index.
    pub fn trees(&self) -> impl Iterator<Item = (usize, &MappingTree)> {
        self.frames
            .iter()
            .enumerate()
            .filter_map(|(k, t)| t.as_ref().map(|t| (k, t)))
    }

    pub(crate) fn trees_mut(&mut self) -> impl Iterator<Item = (usize, &mut MappingTree)> {
        self.frames
            .iter_mut()
            .enumerate()
            .filter_map(|(k, t)| t.as_mut().map(|t| (k, t)))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(Option::is_none)
    }

    fn verify_below(&self, owner: &Mapping) -> Result<(), &'static str> {
        for (_, tree) in self.trees() {
            tree.verify()?;
            let root = tree.root();
            if root.space() != owner.space() || root.depth() != owner.depth() {
                return Err("submap root does not mirror its owner");
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Submap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submap")
            .field("level", &self.level)
            .field("trees", &self.trees().count())
            .finish()
    }
}
