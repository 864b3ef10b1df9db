//! # The mapping database
//!
//! One [`Mapdb`] exists per resource kind (physical memory, I/O ports). It owns
//! a [`Physframe`] for every unit of its coarsest size class; each physframe
//! holds a lock and, once anything is mapped from it, a [`MappingTree`].
//!
//! ```text
//!   Mapdb (shifts [9, 0])
//!   ├─ Physframe 0 ── lock ── None
//!   ├─ Physframe 1 ── lock ── MappingTree (2 MiB)
//!   │                         ├─ root   sigma0 @ 0x200
//!   │                         ├─ A      @ 0x4000
//!   │                         └─ SUBMAP ─┬─ [0]   MappingTree (4 KiB)
//!   │                                    └─ [17]  MappingTree (4 KiB)
//!   └─ ...
//! ```
//!
//! [`Mapdb::lookup`] returns a [`Frame`], the held lock of one physframe,
//! together with a [`MappingId`] naming the matching node. Every mutation goes
//! through the frame; dropping it (or passing it to [`Mapdb::free`]) releases
//! the lock.

use crate::config::{MAX_LEVELS, MapdbConfig};
use crate::error::{ConfigError, InsertError, fatal};
use crate::mapping::{Depth, Mapping};
use crate::page::{Pfn, units};
use crate::rights::{Attribs, Rights};
use crate::space::SpaceId;
use crate::sync::{FrameLock, FrameLockGuard};
use crate::tree::{MappingTree, Submap};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use log::{trace, warn};

/// What a [`Mapdb::flush`] removes besides the descendants.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum FlushMask {
    /// The mapping itself goes too (when the range covers its whole page).
    Full,
    /// Only the descendants; the mapping stays.
    Descendants,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
struct Step {
    link: usize,
    key: usize,
}

/// Names one node of a physframe's tree: the submap links taken to reach it
/// and its slot index.
///
/// An id is only meaningful together with the [`Frame`] it was obtained from,
/// and only until the next insert or flush on that frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct MappingId {
    path: [Step; MAX_LEVELS - 1],
    len: usize,
    index: usize,
}

impl MappingId {
    const fn top(index: usize) -> Self {
        Self {
            path: [Step { link: 0, key: 0 }; MAX_LEVELS - 1],
            len: 0,
            index,
        }
    }

    /// Size-class index of the node (0 is the coarsest).
    #[inline]
    #[must_use]
    pub const fn level(&self) -> usize {
        self.len
    }

    /// Slot index inside the node's tree.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// The owner's top-level root.
    #[inline]
    #[must_use]
    pub const fn is_root(&self) -> bool {
        self.len == 0 && self.index == 0
    }

    fn steps(&self) -> &[Step] {
        &self.path[..self.len]
    }

    fn push(&mut self, link: usize, key: usize) {
        if self.len >= self.path.len() {
            fatal("mapping id deeper than the configured size classes");
        }
        self.path[self.len] = Step { link, key };
        self.len += 1;
    }

    const fn pop(&mut self) {
        self.len -= 1;
    }
}

/// Lock plus optional tree for one coarsest-class resource unit.
#[derive(Default)]
pub struct Physframe {
    tree: FrameLock<Option<MappingTree>>,
}

impl Physframe {
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.tree.is_locked()
    }
}

impl fmt::Debug for Physframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Physframe")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// A locked physframe.
#[must_use = "dropping a frame releases its lock"]
pub struct Frame<'a> {
    guard: FrameLockGuard<'a, Option<MappingTree>>,
    shifts: &'a [u8],
    base: Pfn,
}

impl Frame<'_> {
    /// First resource unit covered by this physframe.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> Pfn {
        self.base
    }

    /// The physframe's tree, if anything is mapped from it.
    #[must_use]
    pub fn tree(&self) -> Option<&MappingTree> {
        self.guard.as_ref()
    }

    #[must_use]
    pub fn mapping(&self, id: &MappingId) -> &Mapping {
        self.tree_at(id).slot(id.index)
    }

    /// Size class of the node, in base-unit shift.
    #[must_use]
    pub fn shift(&self, id: &MappingId) -> u8 {
        self.shifts[id.level()]
    }

    /// First resource unit of the node's page.
    #[must_use]
    pub fn phys(&self, id: &MappingId) -> Pfn {
        id.steps()
            .iter()
            .enumerate()
            .fold(self.base, |phys, (i, step)| {
                phys + (key_offset(step.key) << self.shifts[i + 1])
            })
    }

    #[must_use]
    pub fn depth(&self, id: &MappingId) -> Depth {
        self.mapping(id).depth()
    }

    #[must_use]
    pub fn rights(&self, id: &MappingId) -> Rights {
        self.mapping(id).rights()
    }

    /// The node `id` was derived from; `None` for the owner's root.
    ///
    /// The root of a submap tree stands in for its owner, so children of such
    /// a root report the owner one size class up.
    #[must_use]
    pub fn parent(&self, id: &MappingId) -> Option<MappingId> {
        let mut up = *id;
        loop {
            let parent = self.tree_at(&up).parent(up.index);
            if up.len == 0 {
                return parent.map(|index| {
                    let mut id = up;
                    id.index = index;
                    id
                });
            }
            match parent {
                Some(index) if index != 0 => {
                    up.index = index;
                    return Some(up);
                }
                found => {
                    let link = up.steps()[up.len - 1].link;
                    up.pop();
                    up.index = self.tree_at(&up).parent(link)?;
                    if found.is_some() {
                        return Some(up);
                    }
                }
            }
        }
    }

    /// Replace the recorded rights of a node.
    pub fn set_rights(&mut self, id: &MappingId, rights: Rights) {
        let tree = self.tree_at_mut(id);
        tree.slot_mut(id.index).set_rights(rights);
        if let Some(link) = tree.submap_of(id.index)
            && let Some(submap) = tree.slot_mut(link).submap_mut()
        {
            mirror_rights(submap, rights);
        }
    }

    /// Check the tree's structural invariants.
    ///
    /// # Errors
    /// The first violated invariant.
    pub fn verify(&self) -> Result<(), &'static str> {
        self.guard.as_ref().map_or(Ok(()), MappingTree::verify)
    }

    fn tree_at(&self, id: &MappingId) -> &MappingTree {
        let mut tree = self
            .guard
            .as_ref()
            .unwrap_or_else(|| fatal("frame has no mapping tree"));
        for step in id.steps() {
            tree = tree
                .slot(step.link)
                .submap()
                .and_then(|submap| submap.frame(step.key))
                .unwrap_or_else(|| fatal("stale mapping id"));
        }
        tree
    }

    fn tree_at_mut(&mut self, id: &MappingId) -> &mut MappingTree {
        let mut tree = self
            .guard
            .as_mut()
            .unwrap_or_else(|| fatal("frame has no mapping tree"));
        for step in id.steps() {
            tree = tree
                .slot_mut(step.link)
                .submap_mut()
                .and_then(|submap| submap.frame_slot(step.key).as_mut())
                .unwrap_or_else(|| fatal("stale mapping id"));
        }
        tree
    }

    /// Drop submap trees reduced to their root and submaps left empty.
    fn prune(&mut self) {
        let Some(tree) = self.guard.as_mut() else {
            return;
        };
        prune_tree(tree);
        if tree.is_trivial() {
            *self.guard = None;
        }
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        if self.guard.as_ref().is_some_and(MappingTree::is_trivial) {
            *self.guard = None;
        }
    }
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("base", &self.base)
            .field("tree", &self.guard.as_ref())
            .finish()
    }
}

/// One regular node as reported by [`Mapdb::snapshot`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MappingInfo {
    pub space: SpaceId,
    pub page: Pfn,
    pub phys: Pfn,
    pub shift: u8,
    pub depth: Depth,
    pub rights: Rights,
}

pub struct Mapdb {
    owner: SpaceId,
    config: MapdbConfig,
    frames: Box<[Physframe]>,
}

impl Mapdb {
    /// A database whose resources all initially belong to `owner`.
    ///
    /// # Errors
    /// The configuration's [`ConfigError`], see [`MapdbConfig::validate`].
    pub fn new(owner: SpaceId, config: MapdbConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let count = usize::try_from(config.physframes())
            .map_err(|_| ConfigError::EmptyResource(config.end_frame.as_u64()))?;
        let mut frames = Vec::with_capacity(count);
        frames.resize_with(count, Physframe::default);
        trace!(
            "mapdb: {owner} owns {count} physframes, size classes {:?}",
            config.page_shifts
        );
        Ok(Self {
            owner,
            config,
            frames: frames.into_boxed_slice(),
        })
    }

    #[inline]
    #[must_use]
    pub const fn owner(&self) -> SpaceId {
        self.owner
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &MapdbConfig {
        &self.config
    }

    /// Size classes, coarsest first.
    #[inline]
    #[must_use]
    pub const fn page_shifts(&self) -> &'static [u8] {
        self.config.page_shifts
    }

    /// Size-class index of `shift`, if it is configured.
    #[must_use]
    pub fn level_of(&self, shift: u8) -> Option<usize> {
        self.page_shifts().iter().position(|&s| s == shift)
    }

    /// The resource unit is tracked by this database.
    #[inline]
    #[must_use]
    pub const fn valid_address(&self, phys: Pfn) -> bool {
        phys.as_u64() < self.config.end_frame.as_u64()
    }

    #[must_use]
    pub fn physframe(&self, phys: Pfn) -> Option<&Physframe> {
        self.physframe_index(phys).map(|i| &self.frames[i])
    }

    fn physframe_index(&self, phys: Pfn) -> Option<usize> {
        if !self.valid_address(phys) {
            return None;
        }
        usize::try_from(phys.block(self.page_shifts()[0])).ok()
    }

    fn frame_base(&self, index: usize) -> Pfn {
        Pfn::new(key_offset(index) << self.page_shifts()[0])
    }

    /// Lock the physframe of `phys` and find `space`'s mapping of it at `page`.
    ///
    /// Returns `None`, with the lock released, when `phys` is not tracked or
    /// nothing matches. The owner always finds its root, which is created on
    /// first use.
    #[must_use]
    pub fn lookup(&self, space: SpaceId, page: Pfn, phys: Pfn) -> Option<(MappingId, Frame<'_>)> {
        let index = self.physframe_index(phys)?;
        let guard = self.frames[index].tree.lock();
        self.find(guard, index, space, page, phys)
    }

    /// [`lookup`](Self::lookup) without waiting for a contended physframe.
    #[must_use]
    pub fn try_lookup(
        &self,
        space: SpaceId,
        page: Pfn,
        phys: Pfn,
    ) -> Option<(MappingId, Frame<'_>)> {
        let index = self.physframe_index(phys)?;
        let guard = self.frames[index].tree.try_lock()?;
        self.find(guard, index, space, page, phys)
    }

    fn find<'a>(
        &'a self,
        mut guard: FrameLockGuard<'a, Option<MappingTree>>,
        index: usize,
        space: SpaceId,
        page: Pfn,
        phys: Pfn,
    ) -> Option<(MappingId, Frame<'a>)> {
        let base = self.frame_base(index);
        if guard.is_none() {
            if space != self.owner || page.align_down(self.page_shifts()[0]) != base {
                return None;
            }
            let root = Mapping::new(self.owner, base, Rights::RWX, Depth::ROOT);
            match MappingTree::new(
                root,
                self.config.tree_entries_min,
                self.config.tree_entries_max,
            ) {
                Ok(tree) => *guard = Some(tree),
                Err(e) => {
                    warn!("mapdb: cannot materialize root of {base}: {e}");
                    return None;
                }
            }
        }

        let frame = Frame {
            guard,
            shifts: self.page_shifts(),
            base,
        };
        let mut id = MappingId::top(0);
        let tree = frame.tree()?;
        if self.search(tree, 0, space, page, phys, &mut id) {
            trace!("mapdb: lookup {space} @ {page} -> {phys}: level {}", id.level());
            Some((id, frame))
        } else {
            None
        }
    }

    fn search(
        &self,
        tree: &MappingTree,
        level: usize,
        space: SpaceId,
        page: Pfn,
        phys: Pfn,
        id: &mut MappingId,
    ) -> bool {
        let want = page.align_down(self.page_shifts()[level]);
        // Submap roots stand in for their owner one level up.
        let skip = usize::from(level > 0);
        for (i, m) in tree.mappings().iter().enumerate().skip(skip) {
            if m.is_regular() && m.space() == space && m.page() == want {
                id.index = i;
                return true;
            }
            let Some(submap) = m.submap() else {
                continue;
            };
            let key = self.sub_key(level, phys);
            let Some(sub) = submap.frame(key) else {
                continue;
            };
            id.push(i, key);
            if self.search(sub, submap.level(), space, page, phys, id) {
                return true;
            }
            id.pop();
        }
        false
    }

    /// Unit index of `phys` inside its level-`level` page, one class finer.
    fn sub_key(&self, level: usize, phys: Pfn) -> usize {
        let shifts = self.page_shifts();
        key_index(phys.offset_in(shifts[level]) >> shifts[level + 1])
    }

    /// Record that `space` received the `shift`-sized page at `page`, backed
    /// by `phys`, from `parent`.
    ///
    /// Descends through submaps when `shift` is finer than the parent's class.
    /// If `parent` already has this `(space, page)` child, that child is
    /// returned.
    ///
    /// # Errors
    /// - [`InsertError::Size`] if `shift` is not a configured class or is
    ///   coarser than the parent's.
    /// - [`InsertError::NoMem`] if a tree or submap cannot make room.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &self,
        frame: &mut Frame<'_>,
        parent: MappingId,
        space: SpaceId,
        page: Pfn,
        phys: Pfn,
        shift: u8,
        rights: Rights,
    ) -> Result<MappingId, InsertError> {
        self.insert_entry(frame, parent, space, page, phys, shift, rights)
            .map(|(id, _)| id)
    }

    /// [`insert`](Self::insert), also telling whether the node is new.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn insert_entry(
        &self,
        frame: &mut Frame<'_>,
        parent: MappingId,
        space: SpaceId,
        page: Pfn,
        phys: Pfn,
        shift: u8,
        rights: Rights,
    ) -> Result<(MappingId, bool), InsertError> {
        let shifts = self.page_shifts();
        let target = self.level_of(shift).ok_or(InsertError::Size(shift))?;
        if target < parent.level() {
            return Err(InsertError::Size(shift));
        }
        let parent_shift = shifts[parent.level()];
        if phys.align_down(parent_shift) != frame.phys(&parent) {
            fatal("insert of a unit outside the parent's page");
        }

        let (min, max) = (self.config.tree_entries_min, self.config.tree_entries_max);
        let mut id = parent;
        let mut owner = parent.index;
        let mut level = parent.level();
        let mut tree = frame.tree_at_mut(&parent);
        while level < target {
            let step = shifts[level] - shifts[level + 1];
            let link = tree.promote_to_submap(owner, level + 1, 1 << step)?;
            let owner_now = tree
                .parent(link)
                .unwrap_or_else(|| fatal("submap link without an owner"));
            let key = self.sub_key(level, phys);
            let root = {
                let o = tree.slot(owner_now);
                Mapping::new(
                    o.space(),
                    o.page() + (key_offset(key) << shifts[level + 1]),
                    o.rights(),
                    o.depth(),
                )
            };
            let slot = tree
                .slot_mut(link)
                .submap_mut()
                .unwrap_or_else(|| fatal("submap link without a table"))
                .frame_slot(key);
            if slot.is_none() {
                *slot = Some(MappingTree::new(root, min, max)?);
            }
            let Some(next) = slot.as_mut() else {
                fatal("submap tree vanished under the frame lock");
            };
            tree = next;
            id.push(link, key);
            owner = 0;
            level += 1;
        }

        let page = page.align_down(shift);
        let existing = tree.children(owner).find(|&i| {
            let m = tree.slot(i);
            m.space() == space && m.page() == page
        });
        if let Some(i) = existing {
            trace!("mapdb: {space} @ {page} already derived from this parent");
            id.index = i;
            return Ok((id, false));
        }
        id.index = tree.insert_at(owner, space, page, rights)?;
        if cfg!(debug_assertions) {
            tree.check_invariants();
        }
        trace!("mapdb: insert {space} @ {page} -> {phys} (shift {shift})");
        Ok((id, true))
    }

    /// Move a mapping to another space without changing its position in the
    /// tree. Roots cannot be granted.
    pub fn grant(&self, frame: &mut Frame<'_>, id: MappingId, space: SpaceId, page: Pfn) -> bool {
        if id.is_root() {
            return false;
        }
        let shifts = self.page_shifts();
        let page = page.align_down(shifts[id.level()]);
        let tree = frame.tree_at_mut(&id);
        let node = tree.slot_mut(id.index);
        if !node.is_regular() {
            fatal("grant of a slot that is not a mapping");
        }
        trace!("mapdb: grant {} @ {} to {space} @ {page}", node.space(), node.page());
        node.set_space(space, page);
        if let Some(link) = tree.submap_of(id.index)
            && let Some(submap) = tree.slot_mut(link).submap_mut()
        {
            rehome(submap, shifts, space, page);
        }
        true
    }

    /// Remove what `id` handed out inside `range`, given in units relative to
    /// the start of its page.
    ///
    /// Nodes of the mapping's own size class are only removed when `range`
    /// covers its whole page; smaller ranges reach into submaps only.
    /// `callback` sees every removed node with its size class and returns the
    /// access bits it harvested; their union is returned.
    pub fn flush<F>(
        &self,
        frame: &mut Frame<'_>,
        id: MappingId,
        mask: FlushMask,
        range: Range<u64>,
        mut callback: F,
    ) -> Attribs
    where
        F: FnMut(&Mapping, u8) -> Attribs,
    {
        let level = id.level();
        let shift = self.page_shifts()[level];
        let me_too = mask == FlushMask::Full && covers(&range, shift) && !id.is_root();
        let tree = frame.tree_at_mut(&id);

        let mut attribs = Attribs::empty();
        if me_too {
            attribs |= callback(tree.slot(id.index), shift);
        }
        let mut visit = |m: &mut Mapping, shift: u8| callback(&*m, shift);
        attribs |= self.walk(tree, level, id.index, range.clone(), true, &mut visit);
        if me_too {
            tree.free_slot(id.index);
            tree.trim();
        }
        frame.prune();
        if cfg!(debug_assertions)
            && let Err(what) = frame.verify()
        {
            fatal(what);
        }
        trace!("mapdb: flush {mask:?} {range:?} at level {level} -> {attribs:?}");
        attribs
    }

    /// Visit what `id` handed out inside `range` without removing anything.
    ///
    /// `callback` may narrow the rights of the nodes it sees; submap roots
    /// follow their owner.
    pub fn for_each_descendant<F>(
        &self,
        frame: &mut Frame<'_>,
        id: MappingId,
        include_self: bool,
        range: Range<u64>,
        mut callback: F,
    ) -> Attribs
    where
        F: FnMut(&mut Mapping, u8) -> Attribs,
    {
        let level = id.level();
        let shift = self.page_shifts()[level];
        let mut attribs = Attribs::empty();
        if include_self {
            let mut me = Mapping::new(
                frame.mapping(&id).space(),
                frame.mapping(&id).page(),
                frame.rights(&id),
                frame.depth(&id),
            );
            attribs |= callback(&mut me, shift);
            frame.set_rights(&id, me.rights());
        }
        let tree = frame.tree_at_mut(&id);
        attribs | self.walk(tree, level, id.index, range, false, &mut callback)
    }

    fn walk<F>(
        &self,
        tree: &mut MappingTree,
        level: usize,
        index: usize,
        range: Range<u64>,
        remove: bool,
        callback: &mut F,
    ) -> Attribs
    where
        F: FnMut(&mut Mapping, u8) -> Attribs,
    {
        let shifts = self.page_shifts();
        let shift = shifts[level];
        let size = units(shift);
        let range = range.start.min(size)..range.end.min(size);
        let mut attribs = Attribs::empty();
        if range.is_empty() {
            return attribs;
        }

        let end = tree.subtree_end(index);
        if covers(&range, shift) {
            attribs |= visit_nodes(tree, index + 1..end, shifts, shift, !remove, callback);
            if remove {
                tree.remove_descendants(index);
            }
            return attribs;
        }

        for i in index + 1..end {
            let Some(submap) = tree.slot_mut(i).submap_mut() else {
                continue;
            };
            let sub_level = submap.level();
            let fine = shifts[sub_level];
            for key in (range.start >> fine)..=((range.end - 1) >> fine) {
                let slot = submap.frame_slot(key_index(key));
                let Some(sub) = slot.as_mut() else {
                    continue;
                };
                let unit = key << fine;
                let sub_range = range.start.max(unit) - unit..range.end.min(unit + units(fine)) - unit;
                attribs |= self.walk(sub, sub_level, 0, sub_range, remove, callback);
                if remove && sub.is_trivial() {
                    *slot = None;
                }
            }
            if remove && submap.is_empty() {
                tree.free_slot(i);
            }
        }
        if remove {
            tree.trim();
        }
        attribs
    }

    /// Release a frame obtained from [`lookup`](Self::lookup).
    #[allow(clippy::unused_self)]
    pub fn free(&self, frame: Frame<'_>) {
        drop(frame);
    }

    /// Every regular node recorded for the physframe of `phys`, in pre-order,
    /// or `None` if the physframe is locked or `phys` is not tracked.
    #[must_use]
    pub fn snapshot(&self, phys: Pfn) -> Option<Vec<MappingInfo>> {
        let index = self.physframe_index(phys)?;
        let guard = self.frames[index].tree.try_lock()?;
        let mut out = Vec::new();
        if let Some(tree) = guard.as_ref() {
            collect(tree, self.page_shifts(), 0, self.frame_base(index), false, &mut out);
        }
        Some(out)
    }
}

impl fmt::Debug for Mapdb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapdb")
            .field("owner", &self.owner)
            .field("page_shifts", &self.config.page_shifts)
            .field("physframes", &self.frames.len())
            .finish()
    }
}

#[inline]
fn covers(range: &Range<u64>, shift: u8) -> bool {
    range.start == 0 && range.end >= units(shift)
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn key_index(key: u64) -> usize {
    key as usize
}

#[inline]
const fn key_offset(key: usize) -> u64 {
    key as u64
}

fn visit_nodes<F>(
    tree: &mut MappingTree,
    slots: Range<usize>,
    shifts: &[u8],
    shift: u8,
    mirror: bool,
    callback: &mut F,
) -> Attribs
where
    F: FnMut(&mut Mapping, u8) -> Attribs,
{
    let mut attribs = Attribs::empty();
    for i in slots {
        let m = tree.slot_mut(i);
        if m.is_regular() {
            attribs |= callback(m, shift);
            if mirror {
                let rights = tree.slot(i).rights();
                if let Some(link) = tree.submap_of(i)
                    && let Some(submap) = tree.slot_mut(link).submap_mut()
                {
                    mirror_rights(submap, rights);
                }
            }
        } else if let Some(submap) = m.submap_mut() {
            attribs |= visit_submap(submap, shifts, mirror, callback);
        }
    }
    attribs
}

fn visit_submap<F>(submap: &mut Submap, shifts: &[u8], mirror: bool, callback: &mut F) -> Attribs
where
    F: FnMut(&mut Mapping, u8) -> Attribs,
{
    let shift = shifts[submap.level()];
    let mut attribs = Attribs::empty();
    for (_, tree) in submap.trees_mut() {
        let used = tree.used();
        attribs |= visit_nodes(tree, 1..used, shifts, shift, mirror, callback);
    }
    attribs
}

fn rehome(submap: &mut Submap, shifts: &[u8], space: SpaceId, page: Pfn) {
    let fine = shifts[submap.level()];
    for (key, tree) in submap.trees_mut() {
        let sub_page = page + (key_offset(key) << fine);
        tree.slot_mut(0).set_space(space, sub_page);
        if let Some(link) = tree.submap_of(0)
            && let Some(nested) = tree.slot_mut(link).submap_mut()
        {
            rehome(nested, shifts, space, sub_page);
        }
    }
}

fn mirror_rights(submap: &mut Submap, rights: Rights) {
    for (_, tree) in submap.trees_mut() {
        tree.slot_mut(0).set_rights(rights);
        if let Some(link) = tree.submap_of(0)
            && let Some(nested) = tree.slot_mut(link).submap_mut()
        {
            mirror_rights(nested, rights);
        }
    }
}

fn prune_tree(tree: &mut MappingTree) {
    for i in 0..tree.used() {
        let Some(submap) = tree.slot_mut(i).submap_mut() else {
            continue;
        };
        for key in 0..submap.units() {
            let slot = submap.frame_slot(key);
            if let Some(sub) = slot.as_mut() {
                prune_tree(sub);
                if sub.is_trivial() {
                    *slot = None;
                }
            }
        }
        if submap.is_empty() {
            tree.free_slot(i);
        }
    }
    tree.trim();
}

fn collect(
    tree: &MappingTree,
    shifts: &[u8],
    level: usize,
    base: Pfn,
    skip_root: bool,
    out: &mut Vec<MappingInfo>,
) {
    let shift = shifts[level];
    for (i, m) in tree.mappings().iter().enumerate() {
        if i == 0 && skip_root {
            continue;
        }
        if m.is_regular() {
            out.push(MappingInfo {
                space: m.space(),
                page: m.page(),
                phys: base,
                shift,
                depth: m.depth(),
                rights: m.rights(),
            });
        } else if let Some(submap) = m.submap() {
            let fine = shifts[submap.level()];
            for (key, sub) in submap.trees() {
                let phys = base + (key_offset(key) << fine);
                collect(sub, shifts, submap.level(), phys, true, out);
            }
        }
    }
}
