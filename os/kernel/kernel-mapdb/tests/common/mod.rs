#![allow(dead_code)]

use kernel_mapdb::page::units;
use kernel_mapdb::{
    Attribs, Caching, CapSpace, Capability, InsertError, InsertStatus, MappingSpace, PageAttr,
    PageInfo, PageSpace, Pfn, Rights, SpaceDirectory, SpaceId,
};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

pub const SIGMA0: SpaceId = SpaceId::new(0);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Pte {
    pub phys: Pfn,
    pub shift: u8,
    pub rights: Rights,
    pub caching: Caching,
    pub attribs: Attribs,
}

/// In-memory page table plus capability table.
pub struct FakeSpace {
    id: SpaceId,
    ptes: Mutex<BTreeMap<Pfn, Pte>>,
    caps: Mutex<BTreeMap<Pfn, Capability>>,
    fail_inserts: AtomicBool,
}

impl FakeSpace {
    pub fn new(id: SpaceId) -> Self {
        Self {
            id,
            ptes: Mutex::new(BTreeMap::new()),
            caps: Mutex::new(BTreeMap::new()),
            fail_inserts: AtomicBool::new(false),
        }
    }

    /// Identity-map `count` pages of size `shift` starting at `first`.
    pub fn map_identity(&self, first: Pfn, count: u64, shift: u8, rights: Rights) {
        let mut ptes = self.ptes.lock().unwrap();
        for i in 0..count {
            let page = first + i * units(shift);
            ptes.insert(
                page,
                Pte {
                    phys: page,
                    shift,
                    rights,
                    caching: Caching::Normal,
                    attribs: Attribs::empty(),
                },
            );
        }
    }

    /// Install a page table entry behind the mapping database's back.
    pub fn raw_insert(&self, virt: Pfn, phys: Pfn, shift: u8, rights: Rights) {
        self.ptes.lock().unwrap().insert(
            virt,
            Pte {
                phys,
                shift,
                rights,
                caching: Caching::Normal,
                attribs: Attribs::empty(),
            },
        );
    }

    pub fn pte(&self, virt: Pfn) -> Option<Pte> {
        let ptes = self.ptes.lock().unwrap();
        Self::containing(&ptes, virt).map(|(_, pte)| pte)
    }

    pub fn pte_count(&self) -> usize {
        self.ptes.lock().unwrap().len()
    }

    /// Pretend the hardware set access bits on the entry at `virt`.
    pub fn touch(&self, virt: Pfn, attribs: Attribs) {
        let mut ptes = self.ptes.lock().unwrap();
        if let Some((page, _)) = Self::containing(&ptes, virt) {
            ptes.get_mut(&page).unwrap().attribs |= attribs;
        }
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn cap(&self, slot: Pfn) -> Option<Capability> {
        self.caps.lock().unwrap().get(&slot).cloned()
    }

    pub fn cap_count(&self) -> usize {
        self.caps.lock().unwrap().len()
    }

    fn containing(ptes: &BTreeMap<Pfn, Pte>, virt: Pfn) -> Option<(Pfn, Pte)> {
        let (&page, &pte) = ptes.range(..=virt).next_back()?;
        (virt < page + units(pte.shift)).then_some((page, pte))
    }
}

impl MappingSpace for FakeSpace {
    fn id(&self) -> SpaceId {
        self.id
    }
}

impl PageSpace for FakeSpace {
    fn v_lookup(&self, virt: Pfn) -> Option<PageInfo> {
        self.pte(virt).map(|pte| PageInfo {
            phys: pte.phys,
            shift: pte.shift,
            rights: pte.rights,
            caching: pte.caching,
        })
    }

    fn v_insert(
        &self,
        phys: Pfn,
        virt: Pfn,
        shift: u8,
        attr: PageAttr,
    ) -> Result<InsertStatus, InsertError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(InsertError::NoMem);
        }
        let mut ptes = self.ptes.lock().unwrap();
        if let Some(pte) = ptes.get_mut(&virt)
            && pte.phys == phys
            && pte.shift == shift
        {
            if pte.rights.contains(attr.rights) && pte.caching == attr.caching {
                return Ok(InsertStatus::WarnExists);
            }
            pte.rights |= attr.rights;
            pte.caching = attr.caching;
            return Ok(InsertStatus::WarnAttribUpgrade);
        }
        let end = virt + units(shift);
        let overlaps = Self::containing(&ptes, virt).is_some()
            || ptes.range(virt..end).next().is_some();
        if overlaps {
            return Err(InsertError::Exists);
        }
        ptes.insert(
            virt,
            Pte {
                phys,
                shift,
                rights: attr.rights,
                caching: attr.caching,
                attribs: Attribs::empty(),
            },
        );
        Ok(InsertStatus::Ok)
    }

    fn v_delete(&self, virt: Pfn, _shift: u8, rights: Rights) -> Attribs {
        let mut ptes = self.ptes.lock().unwrap();
        let Some((page, pte)) = Self::containing(&ptes, virt) else {
            return Attribs::empty();
        };
        let left = pte.rights & !rights;
        if left.is_empty() {
            ptes.remove(&page);
        } else {
            let entry = ptes.get_mut(&page).unwrap();
            entry.rights = left;
            entry.attribs = Attribs::empty();
        }
        pte.attribs
    }

    fn v_add_access_flags(&self, virt: Pfn, flags: Attribs) {
        self.touch(virt, flags);
    }

    fn v_next_mapped(&self, virt: Pfn, end: Pfn) -> Option<Pfn> {
        let ptes = self.ptes.lock().unwrap();
        if Self::containing(&ptes, virt).is_some() {
            return Some(virt);
        }
        ptes.range(virt..end).next().map(|(&page, _)| page)
    }
}

impl CapSpace for FakeSpace {
    fn cap_lookup(&self, slot: Pfn) -> Option<Capability> {
        self.cap(slot)
    }

    fn cap_insert(&self, slot: Pfn, cap: Capability) {
        self.caps.lock().unwrap().insert(slot, cap);
    }

    fn cap_clear(&self, slot: Pfn) -> Option<Capability> {
        self.caps.lock().unwrap().remove(&slot)
    }

    fn cap_set_rights(&self, slot: Pfn, rights: Rights) -> bool {
        self.caps
            .lock()
            .unwrap()
            .get_mut(&slot)
            .map(|cap| cap.rights = rights)
            .is_some()
    }

    fn cap_next_used(&self, slot: Pfn, end: Pfn) -> Option<Pfn> {
        self.caps.lock().unwrap().range(slot..end).next().map(|(&s, _)| s)
    }
}

/// Spaces indexed by their id.
pub struct Spaces {
    spaces: Vec<FakeSpace>,
}

impl Spaces {
    pub fn new(count: u32) -> Self {
        Self {
            spaces: (0..count).map(|i| FakeSpace::new(SpaceId::new(i))).collect(),
        }
    }

    pub fn get(&self, id: u32) -> &FakeSpace {
        &self.spaces[id as usize]
    }
}

impl SpaceDirectory<FakeSpace> for Spaces {
    fn space(&self, id: SpaceId) -> Option<&FakeSpace> {
        self.spaces.get(id.as_u32() as usize)
    }
}
