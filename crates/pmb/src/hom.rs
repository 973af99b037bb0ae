//! Register table for hibernation on memory.
//!
//! When the SoC resumes from a memory-retained power state, the early resume
//! code has to rebuild the PMB before any normal kernel code can run. It does
//! so by replaying a table of raw register words. The fixed uncached mapping
//! comes first so that the resume code can reach the rest of the kernel.

use crate::arch::{PmbHardware, UncachedSection};
use crate::slots::NR_PMB_ENTRIES;
use crate::{Pmb, Slot};

/// One slot's register words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomEntry {
    pub slot: Slot,
    pub addr: u32,
    pub data: u32,
}

/// Ordered list of register writes that recreates the live mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomTable {
    entries: [Option<HomEntry>; NR_PMB_ENTRIES],
    len: usize,
}

impl HomTable {
    const fn new() -> Self {
        Self {
            entries: [None; NR_PMB_ENTRIES],
            len: 0,
        }
    }

    fn push(&mut self, entry: HomEntry) {
        self.entries[self.len] = Some(entry);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &HomEntry> + '_ {
        self.entries[..self.len].iter().flatten()
    }

    /// Writes every entry back to the hardware, from uncached execution.
    pub fn replay<H: PmbHardware + ?Sized>(&self, hw: &H) {
        log::info!("pmb: replaying {} slots", self.len);
        let section = UncachedSection::enter(hw);
        for entry in self.iter() {
            section.set_words(entry.slot, entry.addr, entry.data);
        }
    }
}

impl<H: PmbHardware> Pmb<H> {
    /// Builds the register table for the live mappings.
    pub fn hom_table(&self) -> HomTable {
        let state = self.state.read();
        let mut table = HomTable::new();

        let fixed = state.fixed_uncached.into_iter();
        let others = state
            .mappings
            .iter()
            .filter(|&id| state.fixed_uncached != Some(id));

        for id in fixed.chain(others) {
            let mapping = state.mappings.get(id);
            for (slot, entry) in state.chain(mapping.entries) {
                table.push(HomEntry {
                    slot,
                    addr: entry.addr_word(),
                    data: entry.data_word(mapping.flags),
                });
            }
        }

        table
    }
}
