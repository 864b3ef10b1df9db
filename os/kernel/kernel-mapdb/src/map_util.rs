//! # Map, grant and unmap
//!
//! Stateless glue between IPC map items / the unmap system call and the
//! mapping databases. Every function here works page by page:
//!
//! * **map**: pick the largest size class both windows allow, clear whatever
//!   the receiver has in the way, lock the sender's frame, record the new node
//!   (or re-home the sender's node for a grant), install the receiver's page
//!   table entry, release the frame.
//! * **unmap**: lock the caller's frame, flush the mapping's descendants (and
//!   the mapping itself when asked), removing their page table entries through
//!   the flush callback, release the frame.
//!
//! Lock order is always *frame, then space*: page tables and capability tables
//! are only touched while at most one frame is held, and no frame is held
//! while the receiver's conflicting mappings are unmapped.

use crate::error::{InsertStatus, MapError};
use crate::fpage::{Fpage, FpageType, MapControl};
use crate::kobject::{Capability, EntryFlags, KobjectMapdb, ObjFlush};
use crate::mapdb::{FlushMask, Mapdb};
use crate::mapping::Mapping;
use crate::page::{Pfn, mask, units};
use crate::rights::{Attribs, Caching, PageAttr, Rights};
use crate::space::{CapSpace, PageSpace, SpaceDirectory};
use alloc::sync::Arc;
use core::ops::Range;
use log::{debug, trace, warn};

/// Order of the x86 I/O port space.
pub const IO_SPACE_ORDER: u8 = 16;

/// Where a map item lands, in resource units.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Window {
    pub snd: Pfn,
    pub rcv: Pfn,
    pub order: u8,
}

/// Intersect a send flexpage with a receive window.
///
/// The larger of the two is cut down to the aligned block of the smaller
/// one's size that contains `hot_spot`.
#[must_use]
pub const fn constrain(snd: Pfn, snd_order: u8, rcv: Pfn, rcv_order: u8, hot_spot: u64) -> Window {
    let snd = snd.align_down(snd_order);
    let rcv = rcv.align_down(rcv_order);
    if snd_order > rcv_order {
        let offs = hot_spot & mask(snd_order) & !mask(rcv_order);
        Window {
            snd: Pfn::new(snd.as_u64() + offs),
            rcv,
            order: rcv_order,
        }
    } else {
        let offs = hot_spot & mask(rcv_order) & !mask(snd_order);
        Window {
            snd,
            rcv: Pfn::new(rcv.as_u64() + offs),
            order: snd_order,
        }
    }
}

/// A resolved map or grant of one window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Transfer {
    pub window: Window,
    pub grant: bool,
    /// Upper bound for the receiver's rights.
    pub rights: Rights,
    /// Memory type for the receiver; `None` keeps the sender's.
    pub caching: Option<Caching>,
}

/// Map (or grant) `transfer.window` from `from` to `to`.
///
/// Sender pages the database does not track are skipped. Receiver mappings
/// in the way are unmapped first unless they already map the same resource at
/// the same size and were derived from the same sender page, which turns the
/// insert into an attribute upgrade.
///
/// # Errors
/// The first failing page's [`MapError`]; pages before it stay mapped.
pub fn map<S, D>(
    mapdb: &Mapdb,
    dir: &D,
    from: &S,
    to: &S,
    transfer: &Transfer,
) -> Result<(), MapError>
where
    S: PageSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    let Window { snd, rcv, order } = transfer.window;
    let end = snd + units(order);
    let mut addr = snd;
    while addr < end {
        let Some(next) = from.v_next_mapped(addr, end) else {
            break;
        };
        let Some(info) = from.v_lookup(next) else {
            break;
        };
        addr = next;
        let rcv_addr = rcv + (addr - snd);
        let remaining = end - addr;

        let Some(i_shift) = mapdb.page_shifts().iter().copied().find(|&s| {
            s <= info.shift && addr.is_aligned(s) && rcv_addr.is_aligned(s) && units(s) <= remaining
        }) else {
            return Err(MapError::Size(info.shift));
        };
        let i_size = units(i_shift);
        let rights = transfer.rights & info.rights & Rights::RWX;
        if rights.is_empty() {
            addr += i_size;
            continue;
        }
        let phys = info.phys_of(addr);
        let attr = PageAttr::new(rights, transfer.caching.unwrap_or(info.caching));

        clear_receiver(mapdb, dir, from, addr, to, rcv_addr, i_shift, phys);
        map_page(mapdb, from, to, addr, rcv_addr, phys, i_shift, attr, transfer.grant)?;
        addr += i_size;
    }
    Ok(())
}

/// Unmap whatever `to` has in `rcv_addr`'s `shift`-sized block unless it is
/// the very page about to be installed, received from the same sender page.
#[allow(clippy::too_many_arguments)]
fn clear_receiver<S, D>(
    mapdb: &Mapdb,
    dir: &D,
    from: &S,
    snd_addr: Pfn,
    to: &S,
    rcv_addr: Pfn,
    shift: u8,
    phys: Pfn,
) where
    S: PageSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    let end = rcv_addr + units(shift);
    let mut addr = rcv_addr;
    while addr < end
        && let Some(next) = to.v_next_mapped(addr, end)
        && next < end
    {
        let Some(r) = to.v_lookup(next) else {
            break;
        };
        let page = next.align_down(r.shift);
        let same_page = r.shift == shift && r.phys == phys;
        if same_page && derived_from(mapdb, from, snd_addr, to, page, phys) {
            trace!("map: {} @ {page} already maps {phys}", to.id());
        } else {
            debug!(
                "map: overmapping {} @ {page} (shift {} -> {shift})",
                to.id(),
                r.shift
            );
            unmap(mapdb, dir, to, page, r.shift, Rights::RWX, FlushMask::Full);
        }
        addr = page + units(r.shift);
    }
}

/// `to`'s node for `page` hangs directly below `from`'s node for `snd_addr`.
/// Untracked pages and the owner's root never count as a second parent.
fn derived_from<S>(mapdb: &Mapdb, from: &S, snd_addr: Pfn, to: &S, page: Pfn, phys: Pfn) -> bool
where
    S: PageSpace + ?Sized,
{
    let Some((id, frame)) = mapdb.lookup(to.id(), page, phys) else {
        return true;
    };
    let same = id.is_root()
        || frame.parent(&id).is_some_and(|parent| {
            let m = frame.mapping(&parent);
            m.space() == from.id() && m.page() == snd_addr.align_down(frame.shift(&parent))
        });
    mapdb.free(frame);
    same
}

#[allow(clippy::too_many_arguments)]
fn map_page<S>(
    mapdb: &Mapdb,
    from: &S,
    to: &S,
    snd_addr: Pfn,
    rcv_addr: Pfn,
    phys: Pfn,
    shift: u8,
    attr: PageAttr,
    grant: bool,
) -> Result<(), MapError>
where
    S: PageSpace + ?Sized,
{
    let Some((s_id, mut frame)) = mapdb.lookup(from.id(), snd_addr, phys) else {
        warn!("map: {} @ {snd_addr} is not in the mapping database", from.id());
        return Ok(());
    };
    let s_shift = frame.shift(&s_id);
    if s_shift < shift {
        return Err(MapError::Size(shift));
    }

    let sender_page = frame.mapping(&s_id).page();
    let whole_grant = grant && s_shift == shift && !s_id.is_root();
    let (r_id, created) = if whole_grant {
        mapdb.grant(&mut frame, s_id, to.id(), rcv_addr);
        (s_id, false)
    } else {
        mapdb.insert_entry(&mut frame, s_id, to.id(), rcv_addr, phys, shift, attr.rights)?
    };

    match to.v_insert(phys, rcv_addr, shift, attr) {
        Ok(status) => {
            if status == InsertStatus::WarnAttribUpgrade {
                debug!("map: {} @ {rcv_addr} upgraded to {:?}", to.id(), attr.rights);
            }
            if whole_grant {
                frame.set_rights(&r_id, attr.rights);
            } else if !created {
                let rights = frame.rights(&r_id) | attr.rights;
                frame.set_rights(&r_id, rights);
            }
        }
        Err(e) => {
            if whole_grant {
                mapdb.grant(&mut frame, s_id, from.id(), sender_page);
            } else if created {
                mapdb.flush(&mut frame, r_id, FlushMask::Full, 0..units(shift), |_, _| {
                    Attribs::empty()
                });
            }
            mapdb.free(frame);
            warn!("map: {} @ {rcv_addr} refused {phys}: {e}", to.id());
            return Err(e.into());
        }
    }

    if whole_grant {
        from.v_delete(snd_addr, shift, Rights::RWX);
    }
    mapdb.free(frame);
    Ok(())
}

/// Revoke `rights` from everything `space` handed out of the `order`-sized
/// block at `start`, and from `space` itself for [`FlushMask::Full`].
///
/// Revoking read access removes the affected nodes and page-table entries
/// altogether; revoking only write or execute narrows them in place.
///
/// Returns the access bits harvested from removed or narrowed entries. For
/// [`FlushMask::Descendants`] they are also saved back into `space`'s own
/// entries.
pub fn unmap<S, D>(
    mapdb: &Mapdb,
    dir: &D,
    space: &S,
    start: Pfn,
    order: u8,
    rights: Rights,
    mask: FlushMask,
) -> Attribs
where
    S: PageSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    let rights = rights & Rights::RWX;
    let revoke_all = rights.contains(Rights::R);
    let revoked = if revoke_all { Rights::RWX } else { rights };
    let start = start.align_down(order);
    let end = start + units(order);
    let mut total = Attribs::empty();
    let mut addr = start;

    while addr < end
        && let Some(next) = space.v_next_mapped(addr, end)
        && next < end
    {
        let Some(info) = space.v_lookup(next) else {
            break;
        };
        let page = next.align_down(info.shift);
        let page_end = page + units(info.shift);
        let offs = (start.max(page) - page)..(end.min(page_end) - page);
        let whole = offs.start == 0 && offs.end == units(info.shift);
        let self_unmap = mask == FlushMask::Full && whole;

        let mut attribs = Attribs::empty();
        if let Some((id, mut frame)) = mapdb.lookup(space.id(), page, info.phys) {
            let node_page = frame.mapping(&id).page();
            let node_shift = frame.shift(&id);
            let range = (page - node_page + offs.start)..(page - node_page + offs.end);
            let node_whole = range.start == 0 && range.end >= units(node_shift);

            let delete = |m: &Mapping, shift: u8, rights: Rights| {
                dir.space(m.space())
                    .map_or(Attribs::empty(), |s| s.v_delete(m.page(), shift, rights))
            };
            if revoke_all {
                let flush_mask = if self_unmap && node_whole {
                    FlushMask::Full
                } else {
                    FlushMask::Descendants
                };
                attribs |= mapdb.flush(&mut frame, id, flush_mask, range, |m, shift| {
                    delete(m, shift, Rights::RWX)
                });
                if self_unmap && flush_mask == FlushMask::Descendants {
                    attribs |= space.v_delete(page, info.shift, revoked);
                }
            } else {
                attribs |= mapdb.for_each_descendant(&mut frame, id, false, range, |m, shift| {
                    m.set_rights(m.rights().difference(rights));
                    delete(&*m, shift, rights)
                });
                if self_unmap {
                    if node_whole && !id.is_root() {
                        let narrowed = frame.rights(&id).difference(rights);
                        frame.set_rights(&id, narrowed);
                    }
                    attribs |= space.v_delete(page, info.shift, rights);
                }
            }
            mapdb.free(frame);
        } else if self_unmap {
            trace!("unmap: {} @ {page} is not in the mapping database", space.id());
            attribs |= space.v_delete(page, info.shift, revoked);
        }

        if !self_unmap {
            save_access_attribs(space, page, attribs);
        }
        total |= attribs;
        addr = page_end;
    }
    total
}

/// Fold access bits harvested from descendants into the still-valid entry
/// at `page`.
pub fn save_access_attribs<S>(space: &S, page: Pfn, attribs: Attribs)
where
    S: PageSpace + ?Sized,
{
    if !attribs.is_empty() {
        space.v_add_access_flags(page, attribs);
    }
}

/// Handle a memory map item.
///
/// # Errors
/// [`MapError::InvalidFpage`] for non-memory or sub-page flexpages, otherwise
/// see [`map`].
pub fn mem_map<S, D>(
    mapdb: &Mapdb,
    dir: &D,
    from: &S,
    fp_from: Fpage,
    to: &S,
    fp_to: Fpage,
    ctl: MapControl,
) -> Result<(), MapError>
where
    S: PageSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    if fp_from.kind() != FpageType::Memory || fp_to.kind() != FpageType::Memory {
        return Err(MapError::InvalidFpage);
    }
    let (Some(snd_order), Some(rcv_order)) = (fp_from.unit_order(), fp_to.unit_order()) else {
        return Err(MapError::InvalidFpage);
    };
    let window = constrain(
        fp_from.first_unit(),
        snd_order,
        fp_to.first_unit(),
        rcv_order,
        ctl.hot_spot(),
    );
    trace!("mem_map: {} -> {} {window:?}", from.id(), to.id());
    let transfer = Transfer {
        window,
        grant: ctl.grant(),
        rights: fp_from.rights(),
        caching: ctl.caching(),
    };
    map(mapdb, dir, from, to, &transfer)
}

/// Handle an I/O port map item. Ports keep their numbers: only the overlap
/// of the two flexpages is mapped.
///
/// # Errors
/// [`MapError::InvalidFpage`] for non-I/O flexpages, otherwise see [`map`].
pub fn io_map<S, D>(
    mapdb: &Mapdb,
    dir: &D,
    from: &S,
    fp_from: Fpage,
    to: &S,
    fp_to: Fpage,
    ctl: MapControl,
) -> Result<(), MapError>
where
    S: PageSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    if fp_from.kind() != FpageType::Io || fp_to.kind() != FpageType::Io {
        return Err(MapError::InvalidFpage);
    }
    let Some(window) = io_window(fp_from, fp_to) else {
        return Ok(());
    };
    trace!("io_map: {} -> {} {window:?}", from.id(), to.id());
    let transfer = Transfer {
        window,
        grant: ctl.grant(),
        rights: fp_from.rights(),
        caching: None,
    };
    map(mapdb, dir, from, to, &transfer)
}

fn io_window(fp_from: Fpage, fp_to: Fpage) -> Option<Window> {
    let snd_order = fp_from.order().min(IO_SPACE_ORDER);
    let rcv_order = fp_to.order().min(IO_SPACE_ORDER);
    let snd = fp_from.first_unit().align_down(snd_order);
    let rcv = fp_to.first_unit().align_down(rcv_order);
    let base = snd.max(rcv);
    let end = (snd + units(snd_order)).min(rcv + units(rcv_order));
    (base < end).then(|| Window {
        snd: base,
        rcv: base,
        order: snd_order.min(rcv_order),
    })
}

/// Handle an unmap of a memory flexpage.
pub fn mem_fpage_unmap<S, D>(
    mapdb: &Mapdb,
    dir: &D,
    space: &S,
    fp: Fpage,
    mask: FlushMask,
) -> Attribs
where
    S: PageSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    if fp.kind() != FpageType::Memory {
        return Attribs::empty();
    }
    let Some(order) = fp.unit_order() else {
        return Attribs::empty();
    };
    unmap(mapdb, dir, space, fp.first_unit(), order, fp.rights(), mask)
}

/// Handle an unmap of an I/O flexpage.
///
/// A port is either accessible or not: any right in the flexpage revokes the
/// ports entirely.
pub fn io_fpage_unmap<S, D>(
    mapdb: &Mapdb,
    dir: &D,
    space: &S,
    fp: Fpage,
    mask: FlushMask,
) -> Attribs
where
    S: PageSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    if fp.kind() != FpageType::Io {
        return Attribs::empty();
    }
    let order = fp.order().min(IO_SPACE_ORDER);
    let rights = if fp.rights().is_empty() {
        Rights::empty()
    } else {
        Rights::RWX
    };
    unmap(mapdb, dir, space, fp.first_unit(), order, rights, mask)
}

/// Remove every mapping a dying memory space holds or handed out.
pub fn reap_mem_space<S, D>(mapdb: &Mapdb, dir: &D, space: &S) -> Attribs
where
    S: PageSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    mem_fpage_unmap(mapdb, dir, space, Fpage::all_mem(Rights::RWX), FlushMask::Full)
}

/// Remove every port mapping a dying I/O space holds or handed out.
pub fn reap_io_space<S, D>(mapdb: &Mapdb, dir: &D, space: &S) -> Attribs
where
    S: PageSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    unmap(mapdb, dir, space, Pfn::new(0), IO_SPACE_ORDER, Rights::RWX, FlushMask::Full)
}

/// Rights the receiver of a capability gets: the sender's rights limited by
/// the flexpage, with the delete right only if both carry it.
#[must_use]
pub fn obj_map_rights(sender: Rights, fp: Rights) -> Rights {
    let mut rights = sender & fp & Rights::CRW.union(Rights::CS);
    if sender.contains(Rights::CD) && fp.contains(Rights::CD) {
        rights |= Rights::CD;
    }
    rights
}

/// Handle an object map item.
///
/// # Errors
/// [`MapError::InvalidFpage`] for non-object flexpages, [`MapError::NoMem`]
/// if an object's mapping list cannot grow.
pub fn obj_map<S, D>(
    kdb: &KobjectMapdb,
    dir: &D,
    from: &S,
    fp_from: Fpage,
    to: &S,
    fp_to: Fpage,
    ctl: MapControl,
) -> Result<(), MapError>
where
    S: CapSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    if fp_from.kind() != FpageType::Obj || fp_to.kind() != FpageType::Obj {
        return Err(MapError::InvalidFpage);
    }
    let window = constrain(
        fp_from.first_unit(),
        fp_from.order(),
        fp_to.first_unit(),
        fp_to.order(),
        ctl.hot_spot(),
    );
    let end = window.snd + units(window.order);
    let counted = !ctl.weak_ref();

    let mut slot = window.snd;
    while let Some(snd_slot) = from.cap_next_used(slot, end) {
        slot = snd_slot + 1;
        let rcv_slot = window.rcv + (snd_slot - window.snd);
        let Some(cap) = from.cap_lookup(snd_slot) else {
            continue;
        };
        let rights = obj_map_rights(cap.rights, fp_from.rights());
        if rights.is_empty() {
            continue;
        }

        if let Some(existing) = to.cap_lookup(rcv_slot) {
            if existing.same_object(&cap) {
                debug!("obj_map: {} slot {rcv_slot} rights upgrade", to.id());
                to.cap_set_rights(rcv_slot, existing.rights | rights);
                continue;
            }
            debug!("obj_map: {} slot {rcv_slot} replaced", to.id());
            unmap_obj_slot(kdb, dir, to, rcv_slot, &existing, false);
        }

        let Some((node, mut frame)) = kdb.lookup(&cap.object, from.id(), snd_slot, &cap) else {
            warn!("obj_map: {} slot {snd_slot} is not a live mapping", from.id());
            continue;
        };
        let flags = EntryFlags::with_rights(rights, counted);
        let node = if ctl.grant() {
            let node = kdb.grant(&mut frame, node, to.id(), rcv_slot, flags);
            from.cap_clear(snd_slot);
            node
        } else {
            kdb.insert(&mut frame, node, to.id(), rcv_slot, flags)?
        };
        to.cap_insert(
            rcv_slot,
            Capability {
                object: Arc::clone(&cap.object),
                rights,
                node,
            },
        );
        kdb.free(frame);
    }
    Ok(())
}

fn unmap_obj_slot<S, D>(
    kdb: &KobjectMapdb,
    dir: &D,
    space: &S,
    slot: Pfn,
    cap: &Capability,
    delete: bool,
) -> ObjFlush
where
    S: CapSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    let Some((node, mut frame)) = kdb.lookup(&cap.object, space.id(), slot, cap) else {
        // Stale capability of an already destroyed object.
        space.cap_clear(slot);
        return ObjFlush::Unlinked;
    };
    let outcome = kdb.flush(&mut frame, node, delete, |owner, owner_slot| {
        if owner == space.id() {
            space.cap_clear(owner_slot);
        } else if let Some(s) = dir.space(owner) {
            s.cap_clear(owner_slot);
        }
    });
    kdb.free(frame);
    outcome
}

/// Handle an unmap of an object flexpage; returns the number of objects
/// destroyed.
///
/// [`FlushMask::Full`] removes the caller's own capabilities (destroying the
/// object when the flexpage carries the delete right and the capability
/// holds it, or when it was the last counted reference).
/// [`FlushMask::Descendants`] only acts on deletes.
pub fn obj_fpage_unmap<S, D>(
    kdb: &KobjectMapdb,
    dir: &D,
    space: &S,
    fp: Fpage,
    mask: FlushMask,
) -> usize
where
    S: CapSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    if fp.kind() != FpageType::Obj {
        return 0;
    }
    let start = fp.first_unit().align_down(fp.order());
    slots_unmap(kdb, dir, space, start..start + units(fp.order()), fp.rights(), mask)
}

fn slots_unmap<S, D>(
    kdb: &KobjectMapdb,
    dir: &D,
    space: &S,
    slots: Range<Pfn>,
    rights: Rights,
    mask: FlushMask,
) -> usize
where
    S: CapSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    let delete = rights.contains(Rights::CD);
    let mut destroyed = 0;
    let mut slot = slots.start;
    while let Some(used) = space.cap_next_used(slot, slots.end) {
        slot = used + 1;
        let Some(cap) = space.cap_lookup(used) else {
            continue;
        };
        let act = match mask {
            FlushMask::Full => true,
            FlushMask::Descendants => delete && cap.rights.contains(Rights::CD),
        };
        if act && unmap_obj_slot(kdb, dir, space, used, &cap, delete) == ObjFlush::Destroyed {
            destroyed += 1;
        }
    }
    destroyed
}

/// Drop every capability of a dying object space; returns the number of
/// objects that died with it.
pub fn reap_obj_space<S, D>(kdb: &KobjectMapdb, dir: &D, space: &S, order: u8) -> usize
where
    S: CapSpace + ?Sized,
    D: SpaceDirectory<S> + ?Sized,
{
    let end = Pfn::new(units(order));
    slots_unmap(kdb, dir, space, Pfn::new(0)..end, Rights::empty(), FlushMask::Full)
}
