mod common;

use common::{FakeSpace, Spaces};
use kernel_mapdb::map_util::{
    io_fpage_unmap, io_map, mem_fpage_unmap, mem_map, reap_io_space, reap_mem_space,
};
use kernel_mapdb::{
    Attribs, FlushMask, Fpage, MapControl, MapError, Mapdb, MapdbConfig, MappingSpace, Pfn, Rights,
    SpaceId,
};

const SIGMA0: u32 = 0;
const A: u32 = 1;
const B: u32 = 2;

fn p(v: u64) -> Pfn {
    Pfn::new(v)
}

/// Memory fpage of one 4K page at page number `page`.
fn page(page: u64, rights: Rights) -> Fpage {
    Fpage::mem(page << 12, 12, rights)
}

/// Memory fpage of one 2M superpage starting at page number `page`.
fn superpage(page: u64, rights: Rights) -> Fpage {
    Fpage::mem(page << 12, 21, rights)
}

/// Four identity-mapped superpages below 0x800 and sixteen 4K pages above.
fn setup() -> (Mapdb, Spaces) {
    let db = Mapdb::new(
        SpaceId::new(SIGMA0),
        MapdbConfig::MEMORY.with_end_frame(p(0x1000)),
    )
    .unwrap();
    let spaces = Spaces::new(4);
    let s0 = spaces.get(SIGMA0);
    s0.map_identity(p(0), 4, 9, Rights::RWX);
    s0.map_identity(p(0x800), 16, 0, Rights::RWX);
    (db, spaces)
}

fn map(db: &Mapdb, spaces: &Spaces, from: u32, fp_from: Fpage, to: u32, fp_to: Fpage) {
    mem_map(
        db,
        spaces,
        spaces.get(from),
        fp_from,
        spaces.get(to),
        fp_to,
        MapControl::map(0),
    )
    .unwrap();
}

fn tracked(db: &Mapdb, space: &FakeSpace, virt: u64, phys: u64) -> bool {
    db.lookup(space.id(), p(virt), p(phys)).is_some()
}

#[test]
fn maps_a_single_page() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), A, page(0x10, Rights::RWX));

    let pte = spaces.get(A).pte(p(0x10)).unwrap();
    assert_eq!(pte.phys, p(0x800));
    assert_eq!(pte.shift, 0);
    assert_eq!(pte.rights, Rights::RW);
    assert!(tracked(&db, spaces.get(A), 0x10, 0x800));
}

#[test]
fn maps_a_superpage_in_one_piece() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, superpage(0x400, Rights::RWX), A, superpage(0x4_0000, Rights::RWX));

    let a = spaces.get(A);
    assert_eq!(a.pte_count(), 1);
    let pte = a.pte(p(0x4_0005)).unwrap();
    assert_eq!((pte.phys, pte.shift), (p(0x400), 9));

    let (id, f) = db.lookup(SpaceId::new(A), p(0x4_0000), p(0x400)).unwrap();
    assert_eq!(f.shift(&id), 9);
}

#[test]
fn superpage_sender_can_hand_out_small_pieces() {
    let (db, spaces) = setup();
    // 4K receive window into a 2M send fpage, hot spot 3 pages in
    mem_map(
        &db,
        &spaces,
        spaces.get(SIGMA0),
        superpage(0x400, Rights::RW),
        spaces.get(A),
        page(0x50, Rights::RWX),
        MapControl::map(3),
    )
    .unwrap();

    let pte = spaces.get(A).pte(p(0x50)).unwrap();
    assert_eq!((pte.phys, pte.shift), (p(0x403), 0));
    let (id, f) = db.lookup(SpaceId::new(A), p(0x50), p(0x403)).unwrap();
    assert_eq!(id.level(), 1);
    assert_eq!(f.phys(&id), p(0x403));
}

#[test]
fn mapping_twice_changes_nothing() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::R), A, page(0x10, Rights::RWX));
    map(&db, &spaces, SIGMA0, page(0x800, Rights::R), A, page(0x10, Rights::RWX));
    assert_eq!(db.snapshot(p(0x800)).unwrap().len(), 2);

    // same page with more rights is an upgrade, not a second node
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), A, page(0x10, Rights::RWX));
    assert_eq!(spaces.get(A).pte(p(0x10)).unwrap().rights, Rights::RW);
    let (id, f) = db.lookup(SpaceId::new(A), p(0x10), p(0x800)).unwrap();
    assert_eq!(f.rights(&id), Rights::RW);
    drop(f);
    assert_eq!(db.snapshot(p(0x800)).unwrap().len(), 2);
}

#[test]
fn overmapping_replaces_a_different_page() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), A, page(0x10, Rights::RWX));
    map(&db, &spaces, A, page(0x10, Rights::RW), B, page(0x20, Rights::RWX));

    map(&db, &spaces, SIGMA0, page(0x801, Rights::RW), A, page(0x10, Rights::RWX));

    assert_eq!(spaces.get(A).pte(p(0x10)).unwrap().phys, p(0x801));
    assert!(!tracked(&db, spaces.get(A), 0x10, 0x800));
    assert!(tracked(&db, spaces.get(A), 0x10, 0x801));
    // whatever A passed on from the old page went with it
    assert!(spaces.get(B).pte(p(0x20)).is_none());
}

#[test]
fn overmapping_with_a_coarser_page() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), A, page(0x4_0000, Rights::RWX));
    map(&db, &spaces, SIGMA0, superpage(0x400, Rights::RW), A, superpage(0x4_0000, Rights::RWX));

    let a = spaces.get(A);
    assert_eq!(a.pte_count(), 1);
    assert_eq!(a.pte(p(0x4_0000)).unwrap().shift, 9);
    assert!(!tracked(&db, a, 0x4_0000, 0x800));
}

#[test]
fn descendant_unmap_saves_dirty_bits() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), A, page(0x10, Rights::RWX));
    spaces.get(A).touch(p(0x10), Attribs::DIRTY);

    let s0 = spaces.get(SIGMA0);
    let attribs = mem_fpage_unmap(&db, &spaces, s0, page(0x800, Rights::RWX), FlushMask::Descendants);

    assert_eq!(attribs, Attribs::DIRTY);
    assert!(spaces.get(A).pte(p(0x10)).is_none());
    let own = s0.pte(p(0x800)).unwrap();
    assert!(own.attribs.contains(Attribs::DIRTY));
    assert_eq!(own.rights, Rights::RWX);
    assert_eq!(db.snapshot(p(0x800)), Some(Vec::new()));
}

#[test]
fn full_unmap_removes_own_page_and_descendants() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), A, page(0x10, Rights::RWX));
    map(&db, &spaces, A, page(0x10, Rights::RW), B, page(0x20, Rights::RWX));

    let a = spaces.get(A);
    mem_fpage_unmap(&db, &spaces, a, page(0x10, Rights::RWX), FlushMask::Full);

    assert!(a.pte(p(0x10)).is_none());
    assert!(spaces.get(B).pte(p(0x20)).is_none());
    assert!(!tracked(&db, a, 0x10, 0x800));
    assert!(spaces.get(SIGMA0).pte(p(0x800)).is_some());
}

#[test]
fn partial_rights_unmap_narrows_descendants() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RWX), A, page(0x10, Rights::RWX));

    let s0 = spaces.get(SIGMA0);
    mem_fpage_unmap(&db, &spaces, s0, page(0x800, Rights::W), FlushMask::Descendants);

    assert_eq!(spaces.get(A).pte(p(0x10)).unwrap().rights, Rights::RX);
    let (id, f) = db.lookup(SpaceId::new(A), p(0x10), p(0x800)).unwrap();
    assert_eq!(f.rights(&id), Rights::RX);
    drop(f);
    assert_eq!(s0.pte(p(0x800)).unwrap().rights, Rights::RWX);
}

#[test]
fn revoking_read_access_removes_the_mapping() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::R), A, page(0x10, Rights::RWX));
    map(&db, &spaces, A, page(0x10, Rights::R), B, page(0x20, Rights::RWX));

    let s0 = spaces.get(SIGMA0);
    mem_fpage_unmap(&db, &spaces, s0, page(0x800, Rights::R), FlushMask::Descendants);

    assert!(spaces.get(A).pte(p(0x10)).is_none());
    assert!(spaces.get(B).pte(p(0x20)).is_none());
    assert!(!tracked(&db, spaces.get(A), 0x10, 0x800));
    assert!(!tracked(&db, spaces.get(B), 0x20, 0x800));
    assert_eq!(db.snapshot(p(0x800)), Some(Vec::new()));
    assert_eq!(s0.pte(p(0x800)).unwrap().rights, Rights::RWX);
}

#[test]
fn unmapping_part_of_a_superpage() {
    let (db, spaces) = setup();
    mem_map(
        &db,
        &spaces,
        spaces.get(SIGMA0),
        superpage(0x400, Rights::RW),
        spaces.get(A),
        page(0x50, Rights::RWX),
        MapControl::map(3),
    )
    .unwrap();

    let s0 = spaces.get(SIGMA0);
    // a neighbouring page: nothing to take away
    mem_fpage_unmap(&db, &spaces, s0, page(0x404, Rights::RWX), FlushMask::Descendants);
    assert!(spaces.get(A).pte(p(0x50)).is_some());

    mem_fpage_unmap(&db, &spaces, s0, page(0x403, Rights::RWX), FlushMask::Descendants);
    assert!(spaces.get(A).pte(p(0x50)).is_none());
    assert!(!tracked(&db, spaces.get(A), 0x50, 0x403));
    assert_eq!(db.snapshot(p(0x400)), Some(Vec::new()));

    // the superpage itself is not split by a smaller self-unmap
    mem_fpage_unmap(&db, &spaces, s0, page(0x403, Rights::RWX), FlushMask::Full);
    assert_eq!(s0.pte(p(0x403)).unwrap().shift, 9);
}

#[test]
fn second_parent_takes_over_the_receiver_page() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), B, page(0x10, Rights::RWX));
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), A, page(0x20, Rights::RWX));

    // same frame, same address, different sender: last writer wins
    map(&db, &spaces, A, page(0x20, Rights::RW), B, page(0x10, Rights::RWX));

    let snapshot = db.snapshot(p(0x800)).unwrap();
    let b_nodes: Vec<_> = snapshot.iter().filter(|m| m.space == SpaceId::new(B)).collect();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(b_nodes.len(), 1);
    assert_eq!(b_nodes[0].depth.get(), 2);

    let a = spaces.get(A);
    mem_fpage_unmap(&db, &spaces, a, page(0x20, Rights::RWX), FlushMask::Descendants);
    assert!(spaces.get(B).pte(p(0x10)).is_none());
    assert!(!tracked(&db, spaces.get(B), 0x10, 0x800));
}

#[test]
fn granting_with_fewer_rights_narrows_the_node() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), A, page(0x10, Rights::RWX));

    mem_map(
        &db,
        &spaces,
        spaces.get(A),
        page(0x10, Rights::R),
        spaces.get(B),
        page(0x30, Rights::RWX),
        MapControl::grant_item(0),
    )
    .unwrap();

    assert_eq!(spaces.get(B).pte(p(0x30)).unwrap().rights, Rights::R);
    let (id, f) = db.lookup(SpaceId::new(B), p(0x30), p(0x800)).unwrap();
    assert_eq!(f.rights(&id), Rights::R);
}

#[test]
fn grant_moves_the_page() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), A, page(0x10, Rights::RWX));

    mem_map(
        &db,
        &spaces,
        spaces.get(A),
        page(0x10, Rights::RW),
        spaces.get(B),
        page(0x30, Rights::RWX),
        MapControl::grant_item(0),
    )
    .unwrap();

    assert!(spaces.get(A).pte(p(0x10)).is_none());
    assert_eq!(spaces.get(B).pte(p(0x30)).unwrap().phys, p(0x800));
    assert!(!tracked(&db, spaces.get(A), 0x10, 0x800));
    assert!(tracked(&db, spaces.get(B), 0x30, 0x800));
    assert_eq!(db.snapshot(p(0x800)).unwrap().len(), 2);
}

#[test]
fn failed_page_table_insert_rolls_back() {
    let (db, spaces) = setup();
    spaces.get(A).fail_inserts(true);

    let err = mem_map(
        &db,
        &spaces,
        spaces.get(SIGMA0),
        page(0x800, Rights::RW),
        spaces.get(A),
        page(0x10, Rights::RWX),
        MapControl::map(0),
    )
    .unwrap_err();

    assert_eq!(err, MapError::NoMem);
    assert_eq!(err.ipc_code(), MapError::IPC_NO_MEM);
    assert!(!tracked(&db, spaces.get(A), 0x10, 0x800));
    assert_eq!(db.snapshot(p(0x800)), Some(Vec::new()));
}

#[test]
fn untracked_sender_pages_are_skipped() {
    let (db, spaces) = setup();
    spaces.get(A).raw_insert(p(0x70), p(0x900), 0, Rights::RW);

    map(&db, &spaces, A, page(0x70, Rights::RW), B, page(0x80, Rights::RWX));
    assert!(spaces.get(B).pte(p(0x80)).is_none());
}

#[test]
fn wrong_fpage_kinds_are_rejected() {
    let (db, spaces) = setup();
    let s0 = spaces.get(SIGMA0);
    let a = spaces.get(A);
    let ctl = MapControl::map(0);

    let io = Fpage::io(0x60, 0, Rights::RW);
    assert_eq!(
        mem_map(&db, &spaces, s0, io, a, page(0x10, Rights::RWX), ctl),
        Err(MapError::InvalidFpage)
    );
    let tiny = Fpage::mem(0x80_0000, 11, Rights::RW);
    assert_eq!(
        mem_map(&db, &spaces, s0, tiny, a, page(0x10, Rights::RWX), ctl),
        Err(MapError::InvalidFpage)
    );
    assert_eq!(
        io_map(&db, &spaces, s0, page(0x800, Rights::RW), a, io, ctl),
        Err(MapError::InvalidFpage)
    );
}

#[test]
fn reaping_a_space_removes_what_it_holds_and_handed_out() {
    let (db, spaces) = setup();
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), A, page(0x10, Rights::RWX));
    map(&db, &spaces, SIGMA0, superpage(0x400, Rights::RW), A, superpage(0x4_0000, Rights::RWX));
    map(&db, &spaces, A, page(0x10, Rights::RW), B, page(0x20, Rights::RWX));
    map(&db, &spaces, A, page(0x4_0001, Rights::R), B, page(0x21, Rights::RWX));

    reap_mem_space(&db, &spaces, spaces.get(A));

    assert_eq!(spaces.get(A).pte_count(), 0);
    assert_eq!(spaces.get(B).pte_count(), 0);
    assert_eq!(db.snapshot(p(0x800)), Some(Vec::new()));
    assert_eq!(db.snapshot(p(0x400)), Some(Vec::new()));
    assert_eq!(spaces.get(SIGMA0).pte_count(), 4 + 16);
}

#[test]
fn reaping_reaches_the_top_of_the_address_space() {
    let (db, spaces) = setup();
    let high = 1 << 51;
    map(&db, &spaces, SIGMA0, page(0x800, Rights::RW), A, page(high, Rights::RWX));
    assert!(spaces.get(A).pte(p(high)).is_some());

    reap_mem_space(&db, &spaces, spaces.get(A));

    assert_eq!(spaces.get(A).pte_count(), 0);
    assert_eq!(db.snapshot(p(0x800)), Some(Vec::new()));
}

#[test]
fn io_ports_keep_their_numbers() {
    let db = Mapdb::new(SpaceId::new(SIGMA0), MapdbConfig::IO_PORTS).unwrap();
    let spaces = Spaces::new(3);
    let s0 = spaces.get(SIGMA0);
    s0.map_identity(p(0), 256, 8, Rights::RW);

    let a = spaces.get(A);
    io_map(
        &db,
        &spaces,
        s0,
        Fpage::io(0x3F8, 3, Rights::RW),
        a,
        Fpage::io(0, 16, Rights::RW),
        MapControl::map(0),
    )
    .unwrap();

    assert_eq!(a.pte_count(), 8);
    let pte = a.pte(p(0x3FF)).unwrap();
    assert_eq!((pte.phys, pte.shift), (p(0x3FF), 0));
    assert!(a.pte(p(0x3F7)).is_none());

    io_fpage_unmap(&db, &spaces, s0, Fpage::io(0x3F8, 3, Rights::RW), FlushMask::Descendants);
    assert_eq!(a.pte_count(), 0);
    assert_eq!(s0.pte_count(), 256);
    assert_eq!(db.snapshot(p(0x3F8)), Some(Vec::new()));
}

#[test]
fn unmapping_one_port_of_a_block() {
    let db = Mapdb::new(SpaceId::new(SIGMA0), MapdbConfig::IO_PORTS).unwrap();
    let spaces = Spaces::new(3);
    let s0 = spaces.get(SIGMA0);
    s0.map_identity(p(0), 256, 8, Rights::RW);
    let a = spaces.get(A);
    let ctl = MapControl::map(0);
    io_map(&db, &spaces, s0, Fpage::io(0x60, 0, Rights::RW), a, Fpage::io(0x60, 0, Rights::RW), ctl)
        .unwrap();
    io_map(&db, &spaces, s0, Fpage::io(0x64, 0, Rights::RW), a, Fpage::io(0x64, 0, Rights::RW), ctl)
        .unwrap();

    io_fpage_unmap(&db, &spaces, s0, Fpage::io(0x60, 0, Rights::RW), FlushMask::Descendants);

    assert!(a.pte(p(0x60)).is_none());
    assert!(a.pte(p(0x64)).is_some());
    assert!(!tracked(&db, a, 0x60, 0x60));
    assert!(tracked(&db, a, 0x64, 0x64));

    reap_io_space(&db, &spaces, a);
    assert_eq!(a.pte_count(), 0);
    assert_eq!(db.snapshot(p(0x60)), Some(Vec::new()));
}

#[test]
fn reaping_an_io_space() {
    let db = Mapdb::new(SpaceId::new(SIGMA0), MapdbConfig::IO_PORTS).unwrap();
    let spaces = Spaces::new(3);
    let s0 = spaces.get(SIGMA0);
    s0.map_identity(p(0), 256, 8, Rights::RW);
    let a = spaces.get(A);
    let ctl = MapControl::map(0);

    io_map(&db, &spaces, s0, Fpage::io(0x60, 0, Rights::RW), a, Fpage::io(0x60, 0, Rights::RW), ctl)
        .unwrap();
    io_map(&db, &spaces, s0, Fpage::io(0x100, 8, Rights::RW), a, Fpage::io(0, 16, Rights::RW), ctl)
        .unwrap();
    assert_eq!(a.pte_count(), 2);

    reap_io_space(&db, &spaces, a);
    assert_eq!(a.pte_count(), 0);
    assert_eq!(db.snapshot(p(0x100)), Some(Vec::new()));
}
