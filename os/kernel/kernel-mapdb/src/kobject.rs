//! # Kernel-object mappings
//!
//! Capabilities to a kernel object have no size hierarchy, so the mappings of
//! one object form a flat list instead of a tree. The list lives in the
//! object's [`KobjectMappable`] root, behind the same kind of lock as a
//! physframe, and is index-linked: nodes are arena slots, `prev`/`next` are
//! [`NodeId`]s.
//!
//! Flushing a node models object destruction, not address-range narrowing:
//! deleting through a capability with the delete right, or dropping the last
//! counted reference, invalidates every entry of the object at once.

use crate::error::{InsertError, fatal};
use crate::page::Pfn;
use crate::rights::Rights;
use crate::space::SpaceId;
use crate::sync::{FrameLock, FrameLockGuard};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::fmt;
use log::{debug, trace};

/// Per-entry flag word.
///
/// | Bits  | Field   |
/// |-------|---------|
/// | 0..=2 | transferable capability rights (`CS`, `CW`, `CR`) |
/// | 3     | delete right (`CD`) |
/// | 4     | entry keeps the object alive (counted reference) |
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct EntryFlags {
    #[bits(3)]
    pub rights_bits: u8,
    pub delete: bool,
    pub ref_cnt: bool,
    #[bits(3)]
    __reserved: u8,
}

impl EntryFlags {
    #[must_use]
    pub const fn with_rights(rights: Rights, counted: bool) -> Self {
        Self::new()
            .with_rights_bits(rights.bits() & 0b111)
            .with_delete(rights.contains(Rights::CD))
            .with_ref_cnt(counted)
    }

    #[must_use]
    pub const fn rights(self) -> Rights {
        let rights = Rights::from_nibble(self.rights_bits());
        if self.delete() {
            rights.union(Rights::CD)
        } else {
            rights
        }
    }
}

/// Arena index of an [`ObjMapping`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeId(usize);

impl NodeId {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// One capability slot holding a reference to the object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ObjMapping {
    pub space: SpaceId,
    pub slot: Pfn,
    pub flags: EntryFlags,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

impl ObjMapping {
    const fn new(space: SpaceId, slot: Pfn, flags: EntryFlags) -> Self {
        Self {
            space,
            slot,
            flags,
            prev: None,
            next: None,
        }
    }
}

#[derive(Default)]
struct MapList {
    nodes: Vec<Option<ObjMapping>>,
    free: Vec<usize>,
    head: Option<NodeId>,
    cnt: usize,
    destroyed: bool,
}

impl MapList {
    fn get(&self, id: NodeId) -> Option<&ObjMapping> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> &mut ObjMapping {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .unwrap_or_else(|| fatal("object mapping list links a free node"))
    }

    fn alloc(&mut self, node: ObjMapping) -> Result<NodeId, InsertError> {
        if let Some(i) = self.free.pop() {
            self.nodes[i] = Some(node);
            return Ok(NodeId(i));
        }
        self.nodes.try_reserve(1).map_err(|_| InsertError::NoMem)?;
        self.nodes.push(Some(node));
        Ok(NodeId(self.nodes.len() - 1))
    }

    fn push_front(&mut self, id: NodeId) {
        let head = self.head;
        let node = self.node_mut(id);
        node.prev = None;
        node.next = head;
        if let Some(h) = head {
            self.node_mut(h).prev = Some(id);
        }
        self.head = Some(id);
    }

    fn link_after(&mut self, after: NodeId, id: NodeId) {
        let next = self.node_mut(after).next;
        let node = self.node_mut(id);
        node.prev = Some(after);
        node.next = next;
        self.node_mut(after).next = Some(id);
        if let Some(n) = next {
            self.node_mut(n).prev = Some(id);
        }
    }

    fn unlink(&mut self, id: NodeId) -> ObjMapping {
        let node = self.nodes[id.0]
            .take()
            .unwrap_or_else(|| fatal("unlink of a free object mapping"));
        match node.prev {
            Some(p) => self.node_mut(p).next = node.next,
            None => self.head = node.next,
        }
        if let Some(n) = node.next {
            self.node_mut(n).prev = node.prev;
        }
        self.free.push(id.0);
        node
    }

    fn iter(&self) -> impl Iterator<Item = (NodeId, &ObjMapping)> {
        core::iter::successors(self.head, |&id| self.get(id).and_then(|n| n.next))
            .filter_map(|id| self.get(id).map(|n| (id, n)))
    }

    fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

/// Mapping root embedded in every mappable kernel object.
#[derive(Default)]
pub struct KobjectMappable {
    list: FrameLock<MapList>,
}

impl KobjectMappable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counted references, or `None` while another CPU holds the object.
    #[must_use]
    pub fn try_count(&self) -> Option<usize> {
        self.list.try_lock().map(|list| list.cnt)
    }

    /// A destroying flush has run; no capability refers to the object anymore.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.list.lock().destroyed
    }
}

impl fmt::Debug for KobjectMappable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KobjectMappable")
            .field("at", &core::ptr::from_ref(self))
            .finish_non_exhaustive()
    }
}

/// What a capability slot stores.
#[derive(Clone)]
pub struct Capability {
    pub object: Arc<KobjectMappable>,
    pub rights: Rights,
    pub node: NodeId,
}

impl Capability {
    #[must_use]
    pub fn same_object(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("object", &Arc::as_ptr(&self.object))
            .field("rights", &self.rights)
            .field("node", &self.node)
            .finish()
    }
}

/// A locked object mapping list.
#[must_use = "dropping a frame releases its lock"]
pub struct ObjFrame<'a> {
    guard: FrameLockGuard<'a, MapList>,
}

impl ObjFrame<'_> {
    #[must_use]
    pub fn entry(&self, node: NodeId) -> Option<&ObjMapping> {
        self.guard.get(node)
    }

    /// Counted references.
    #[must_use]
    pub fn count(&self) -> usize {
        self.guard.cnt
    }

    /// Live entries, counted or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guard.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guard.head.is_none()
    }

    /// Entries in list order.
    pub fn entries(&self) -> impl Iterator<Item = (NodeId, &ObjMapping)> {
        self.guard.iter()
    }
}

/// Outcome of [`KobjectMapdb::flush`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ObjFlush {
    /// Only the flushed entry was removed.
    Unlinked,
    /// Every entry was invalidated; the object is dead.
    Destroyed,
}

/// Mapping database operations for kernel objects.
#[derive(Copy, Clone, Debug, Default)]
pub struct KobjectMapdb;

#[allow(clippy::unused_self)]
impl KobjectMapdb {
    /// Register the creator's capability to a fresh object.
    ///
    /// # Errors
    /// [`InsertError::NoMem`] if the list cannot grow.
    pub fn insert_root(
        &self,
        object: &Arc<KobjectMappable>,
        space: SpaceId,
        slot: Pfn,
        rights: Rights,
    ) -> Result<Capability, InsertError> {
        let mut list = object.list.lock();
        let flags = EntryFlags::with_rights(rights, true);
        let node = list.alloc(ObjMapping::new(space, slot, flags))?;
        list.push_front(node);
        list.cnt += 1;
        trace!("kobject: root {space} slot {slot}");
        Ok(Capability {
            object: Arc::clone(object),
            rights,
            node,
        })
    }

    /// Lock `object` and check that `cap`, found in `space` at `slot`, is one
    /// of its live entries.
    #[must_use]
    pub fn lookup<'a>(
        &self,
        object: &'a KobjectMappable,
        space: SpaceId,
        slot: Pfn,
        cap: &Capability,
    ) -> Option<(NodeId, ObjFrame<'a>)> {
        if !core::ptr::eq(Arc::as_ptr(&cap.object), object) {
            return None;
        }
        let guard = object.list.lock();
        let entry = guard.get(cap.node)?;
        if entry.space != space || entry.slot != slot {
            return None;
        }
        Some((cap.node, ObjFrame { guard }))
    }

    /// Link a new entry for `space`'s `slot` directly after `parent`.
    ///
    /// # Errors
    /// [`InsertError::NoMem`] if the list cannot grow.
    pub fn insert(
        &self,
        frame: &mut ObjFrame<'_>,
        parent: NodeId,
        space: SpaceId,
        slot: Pfn,
        flags: EntryFlags,
    ) -> Result<NodeId, InsertError> {
        if frame.guard.get(parent).is_none() {
            fatal("object insert below a free entry");
        }
        let node = frame.guard.alloc(ObjMapping::new(space, slot, flags))?;
        frame.guard.link_after(parent, node);
        if flags.ref_cnt() {
            frame.guard.cnt += 1;
        }
        trace!("kobject: insert {space} slot {slot} ({flags:?})");
        Ok(node)
    }

    /// Hand `node` over to `space`'s `slot`, keeping its list position.
    pub fn grant(
        &self,
        frame: &mut ObjFrame<'_>,
        node: NodeId,
        space: SpaceId,
        slot: Pfn,
        flags: EntryFlags,
    ) -> NodeId {
        let list = &mut *frame.guard;
        let entry = list.node_mut(node);
        let was_counted = entry.flags.ref_cnt();
        entry.space = space;
        entry.slot = slot;
        entry.flags = flags;
        match (was_counted, flags.ref_cnt()) {
            (true, false) => list.cnt -= 1,
            (false, true) => list.cnt += 1,
            _ => {}
        }
        trace!("kobject: grant to {space} slot {slot}");
        node
    }

    /// Remove `node`, or the whole object when `delete` is requested through a
    /// capability holding the delete right or when the last counted reference
    /// goes away.
    ///
    /// `callback` is called with the space and slot of every entry that must
    /// be cleared: just `node` for [`ObjFlush::Unlinked`], every entry for
    /// [`ObjFlush::Destroyed`].
    pub fn flush<F>(
        &self,
        frame: &mut ObjFrame<'_>,
        node: NodeId,
        delete: bool,
        mut callback: F,
    ) -> ObjFlush
    where
        F: FnMut(SpaceId, Pfn),
    {
        let list = &mut *frame.guard;
        let flags = list
            .get(node)
            .map(|e| e.flags)
            .unwrap_or_else(|| fatal("flush of a free object mapping"));

        let last_ref = flags.ref_cnt() && list.cnt == 1;
        if (delete && flags.delete()) || last_ref {
            for (_, entry) in list.iter() {
                callback(entry.space, entry.slot);
            }
            debug!(
                "kobject: destroyed, {} entries invalidated ({})",
                list.len(),
                if last_ref { "last reference" } else { "delete" }
            );
            list.nodes.clear();
            list.free.clear();
            list.head = None;
            list.cnt = 0;
            list.destroyed = true;
            return ObjFlush::Destroyed;
        }

        let entry = list.unlink(node);
        if flags.ref_cnt() {
            list.cnt -= 1;
        }
        callback(entry.space, entry.slot);
        trace!("kobject: unlinked {} slot {}", entry.space, entry.slot);
        ObjFlush::Unlinked
    }

    /// Release a frame obtained from [`lookup`](Self::lookup).
    pub fn free(&self, frame: ObjFrame<'_>) {
        drop(frame);
    }
}
