//! Mapping records and the fixed-capacity mapping table.
//!
//! A mapping is the driver's view of one or more contiguous slots translating a
//! contiguous virtual range onto a contiguous physical range. Records live in a
//! fixed arena and are threaded onto one of two singly linked lists by index:
//! the live list, kept in strictly ascending virtual-address order so gaps can
//! be found by a linear scan, and the free list.

use crate::slots::NR_PMB_ENTRIES;
use crate::{PhysicalAddress, PmbFlags, Slot, VirtualAddress};

/// Index of a record in the mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MappingId(u8);

impl MappingId {
    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One logical mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmbMapping {
    /// Physical address of the first entry.
    pub phys: PhysicalAddress,
    /// Virtual address of the first entry.
    pub virt: VirtualAddress,
    /// Total bytes translated by all entries.
    pub size: usize,
    pub flags: PmbFlags,
    /// First entry of the chain.
    pub entries: Option<Slot>,
    /// Number of outstanding users.
    pub usage: usize,
    next: Option<MappingId>,
}

impl PmbMapping {
    const EMPTY: PmbMapping = PmbMapping {
        phys: PhysicalAddress::new(0),
        virt: VirtualAddress::new(0),
        size: 0,
        flags: PmbFlags::empty(),
        entries: None,
        usage: 0,
        next: None,
    };

    /// Returns the first virtual address past this mapping.
    pub fn virt_end(&self) -> VirtualAddress {
        self.virt + self.size
    }

    /// Returns true if the physical range `[phys, phys + size)` lies inside this mapping.
    pub fn contains_phys(&self, phys: PhysicalAddress, size: usize) -> bool {
        phys >= self.phys && phys - self.phys <= self.size && size <= self.size - (phys - self.phys)
    }

    /// Returns true if `virt` lies inside this mapping.
    pub fn contains_virt(&self, virt: VirtualAddress) -> bool {
        virt.within(self.virt, self.size)
    }

    /// Translates a physical address inside this mapping to its virtual alias.
    pub fn virt_of(&self, phys: PhysicalAddress) -> VirtualAddress {
        self.virt + (phys - self.phys)
    }
}

/// Fixed arena of mapping records.
pub struct MappingTable {
    records: [PmbMapping; NR_PMB_ENTRIES],
    live: Option<MappingId>,
    free: Option<MappingId>,
}

impl MappingTable {
    /// Creates a table with every record on the free list.
    pub const fn new() -> Self {
        let mut records = [PmbMapping::EMPTY; NR_PMB_ENTRIES];
        let mut i = 0;
        while i + 1 < NR_PMB_ENTRIES {
            records[i].next = Some(MappingId((i + 1) as u8));
            i += 1;
        }

        Self {
            records,
            live: None,
            free: Some(MappingId(0)),
        }
    }

    /// Takes a zeroed record off the free list.
    pub fn alloc(&mut self) -> Option<MappingId> {
        let id = self.free?;
        self.free = self.records[id.index()].next;
        self.records[id.index()] = PmbMapping::EMPTY;
        Some(id)
    }

    /// Returns an unlinked record to the free list.
    pub fn release(&mut self, id: MappingId) {
        debug_assert!(!self.is_live(id), "releasing a linked mapping");
        self.records[id.index()].next = self.free;
        self.free = Some(id);
    }

    pub fn get(&self, id: MappingId) -> &PmbMapping {
        &self.records[id.index()]
    }

    pub fn get_mut(&mut self, id: MappingId) -> &mut PmbMapping {
        &mut self.records[id.index()]
    }

    /// Links a record into the live list at its virtual-address position.
    ///
    /// # Panics
    ///
    /// Panics if the record overlaps a live mapping.
    pub fn insert(&mut self, id: MappingId) {
        let new = self.records[id.index()];
        let mut prev: Option<MappingId> = None;
        let mut cursor = self.live;

        while let Some(current) = cursor {
            let existing = &self.records[current.index()];
            if existing.virt >= new.virt_end() {
                break;
            }
            assert!(
                existing.virt_end() <= new.virt,
                "PMB mapping {} overlaps {}",
                new.virt,
                existing.virt
            );
            prev = Some(current);
            cursor = existing.next;
        }

        self.records[id.index()].next = cursor;
        match prev {
            Some(prev) => self.records[prev.index()].next = Some(id),
            None => self.live = Some(id),
        }
    }

    /// Removes a record from the live list.
    ///
    /// # Panics
    ///
    /// Panics if the record is not linked.
    pub fn unlink(&mut self, id: MappingId) {
        let next = self.records[id.index()].next;
        if self.live == Some(id) {
            self.live = next;
        } else {
            let prev = self
                .iter()
                .find(|&candidate| self.records[candidate.index()].next == Some(id))
                .expect("unlinking a PMB mapping that is not live");
            self.records[prev.index()].next = next;
        }
        self.records[id.index()].next = None;
    }

    /// Iterates over live mappings in ascending virtual-address order.
    pub fn iter(&self) -> impl Iterator<Item = MappingId> + '_ {
        core::iter::successors(self.live, move |id| self.records[id.index()].next)
    }

    /// Returns the live mapping containing `virt`.
    pub fn find_virt(&self, virt: VirtualAddress) -> Option<MappingId> {
        self.iter().find(|&id| self.get(id).contains_virt(virt))
    }

    pub fn is_live(&self, id: MappingId) -> bool {
        self.iter().any(|candidate| candidate == id)
    }

    /// Returns the free virtual gaps between live mappings inside `[start, end)`.
    pub fn gaps(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> impl Iterator<Item = (VirtualAddress, VirtualAddress)> + '_ {
        let mut cursor = Some(start);
        let mut live = self.iter();

        core::iter::from_fn(move || {
            loop {
                let gap_start = cursor?;
                match live.next() {
                    Some(id) => {
                        let mapping = self.get(id);
                        cursor = Some(gap_start.max(mapping.virt_end()));
                        let gap_end = mapping.virt.min(end);
                        if gap_end > gap_start {
                            return Some((gap_start, gap_end));
                        }
                    }
                    None => {
                        cursor = None;
                        if end > gap_start {
                            return Some((gap_start, end));
                        }
                        return None;
                    }
                }
            }
        })
    }

    /// Returns true if `[virt, virt + size)` lies in one gap of `[start, end)`.
    pub fn is_free(
        &self,
        virt: VirtualAddress,
        size: usize,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> bool {
        let Some(last) = virt.checked_add(size) else {
            return false;
        };
        self.gaps(start, end)
            .any(|(gap_start, gap_end)| virt >= gap_start && last <= gap_end)
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1 << 20;

    fn add(table: &mut MappingTable, virt: usize, size: usize) -> MappingId {
        let id = table.alloc().unwrap();
        let mapping = table.get_mut(id);
        mapping.virt = VirtualAddress::new(virt);
        mapping.phys = PhysicalAddress::new(virt - 0x4000_0000);
        mapping.size = size;
        mapping.usage = 1;
        table.insert(id);
        id
    }

    fn virts(table: &MappingTable) -> Vec<usize> {
        table
            .iter()
            .map(|id| table.get(id).virt.as_usize())
            .collect()
    }

    #[test]
    fn pool_holds_sixteen_records() {
        let mut table = MappingTable::new();
        for _ in 0..NR_PMB_ENTRIES {
            assert!(table.alloc().is_some());
        }
        assert!(table.alloc().is_none());
    }

    #[test]
    fn insert_keeps_ascending_order() {
        let mut table = MappingTable::new();
        add(&mut table, 0x9000_0000, 16 * MIB);
        add(&mut table, 0x8000_0000, 16 * MIB);
        add(&mut table, 0xa000_0000, 64 * MIB);
        add(&mut table, 0x8800_0000, 16 * MIB);

        assert_eq!(
            virts(&table),
            vec![0x8000_0000, 0x8800_0000, 0x9000_0000, 0xa000_0000]
        );
    }

    #[test]
    #[should_panic(expected = "overlaps")]
    fn insert_rejects_overlap() {
        let mut table = MappingTable::new();
        add(&mut table, 0x8000_0000, 64 * MIB);
        add(&mut table, 0x8100_0000, 16 * MIB);
    }

    #[test]
    fn unlink_and_release_recycle_records() {
        let mut table = MappingTable::new();
        let a = add(&mut table, 0x8000_0000, 16 * MIB);
        let b = add(&mut table, 0x9000_0000, 16 * MIB);
        let c = add(&mut table, 0xa000_0000, 16 * MIB);

        table.unlink(b);
        table.release(b);
        assert_eq!(virts(&table), vec![0x8000_0000, 0xa000_0000]);

        table.unlink(a);
        table.release(a);
        assert_eq!(virts(&table), vec![0xa000_0000]);
        assert!(table.is_live(c));

        // Most recently released record is reused first.
        assert_eq!(table.alloc(), Some(a));
    }

    #[test]
    fn gaps_cover_the_window_between_mappings() {
        let mut table = MappingTable::new();
        add(&mut table, 0x8400_0000, 64 * MIB);
        add(&mut table, 0x9000_0000, 16 * MIB);

        let gaps: Vec<_> = table
            .gaps(VirtualAddress::new(0x8000_0000), VirtualAddress::new(0xc000_0000))
            .map(|(s, e)| (s.as_usize(), e.as_usize()))
            .collect();
        assert_eq!(
            gaps,
            vec![
                (0x8000_0000, 0x8400_0000),
                (0x8800_0000, 0x9000_0000),
                (0x9100_0000, 0xc000_0000),
            ]
        );
    }

    #[test]
    fn gaps_of_empty_table_is_whole_window() {
        let table = MappingTable::new();
        let gaps: Vec<_> = table
            .gaps(VirtualAddress::new(0x8000_0000), VirtualAddress::new(0xc000_0000))
            .collect();
        assert_eq!(
            gaps,
            vec![(VirtualAddress::new(0x8000_0000), VirtualAddress::new(0xc000_0000))]
        );
    }

    #[test]
    fn is_free_checks_a_single_gap() {
        let mut table = MappingTable::new();
        add(&mut table, 0x8400_0000, 16 * MIB);
        let start = VirtualAddress::new(0x8000_0000);
        let end = VirtualAddress::new(0xc000_0000);

        assert!(table.is_free(VirtualAddress::new(0x8000_0000), 64 * MIB, start, end));
        assert!(!table.is_free(VirtualAddress::new(0x8000_0000), 80 * MIB, start, end));
        assert!(!table.is_free(VirtualAddress::new(0xbf00_0000), 32 * MIB, start, end));
    }

    #[test]
    fn contains_phys_is_inclusive_of_the_end() {
        let mapping = PmbMapping {
            phys: PhysicalAddress::new(0x4000_0000),
            size: 64 * MIB,
            ..PmbMapping::EMPTY
        };
        assert!(mapping.contains_phys(PhysicalAddress::new(0x4000_0000), 64 * MIB));
        assert!(mapping.contains_phys(PhysicalAddress::new(0x4300_0000), 16 * MIB));
        assert!(!mapping.contains_phys(PhysicalAddress::new(0x4300_0000), 32 * MIB));
        assert!(!mapping.contains_phys(PhysicalAddress::new(0x3f00_0000), 16 * MIB));
    }
}
