//! Sizing and placement of new mappings.
//!
//! A request is tiled with power-of-two slots, largest useful size first, and
//! the resulting chain is given a virtual address that keeps every slot
//! naturally aligned. If no virtual gap can host the chain, the largest slot
//! size is dropped and the whole calculation starts over.

use crate::config::Placement;
use crate::manager::PmbState;
use crate::{
    HumanSize, MappingId, PhysicalAddress, PmbConfig, PmbEntry, PmbError, PmbFlags, SizeClass,
    Slot, VirtualAddress,
};

/// Both page-number fields are 32 bits wide.
const ADDRESS_LIMIT: u64 = 1 << 32;

/// A chain of tentatively allocated entries that does not have a virtual address yet.
#[derive(Debug, Clone, Copy)]
struct Chain {
    head: Slot,
    /// Physical address of the first tile.
    ppn: PhysicalAddress,
    /// Sum of all tile sizes.
    size: usize,
    /// Largest tile size; the virtual address must share the physical phase modulo this.
    align: usize,
}

/// Picks the slot size for the tile starting at `cursor`.
///
/// Candidates are tried smallest first. A larger size replaces the current best
/// only if it covers strictly more of the remaining span and wastes less than
/// half of itself. Only the first tile may start below `cursor`; later tiles
/// must be aligned at `cursor` so they never overlap their predecessor.
fn best_fit(
    cursor: PhysicalAddress,
    end: PhysicalAddress,
    sizes: &[SizeClass],
    first_tile: bool,
) -> (SizeClass, PhysicalAddress) {
    let mut best: Option<(SizeClass, PhysicalAddress, usize)> = None;

    for &class in sizes.iter().rev() {
        let bytes = class.bytes();
        if !first_tile && !cursor.is_aligned(bytes) {
            break;
        }

        let start = cursor.align_down(bytes);
        let tile_end = start.as_usize().saturating_add(bytes);
        let covered = tile_end.min(end.as_usize()) - cursor.as_usize();
        let wasted = bytes - covered;

        match best {
            None => best = Some((class, start, covered)),
            Some((_, _, best_covered)) => {
                if covered > best_covered && wasted < bytes / 2 {
                    best = Some((class, start, covered));
                }
            }
        }
    }

    let (class, start, _) = best.expect("the smallest slot size always fits at a tile boundary");
    (class, start)
}

/// Rejects requests no mapping may satisfy, whatever is already mapped.
pub(crate) fn check_size(config: &PmbConfig, size: usize) -> Result<(), PmbError> {
    if size == 0 {
        Err(PmbError::EmptyRange)
    } else if size < config.min_mapping_size {
        Err(PmbError::TooSmall)
    } else {
        Ok(())
    }
}

impl PmbState {
    /// Builds a new, unlinked and unprogrammed mapping for `[phys, phys + size)`.
    ///
    /// `req_virt`, if given, is the virtual address `phys` itself must appear at.
    /// On success the mapping owns its slots and entries; its usage is zero.
    pub(crate) fn calc(
        &mut self,
        config: &PmbConfig,
        phys: PhysicalAddress,
        size: usize,
        req_virt: Option<VirtualAddress>,
        flags: PmbFlags,
    ) -> Result<MappingId, PmbError> {
        check_size(config, size)?;
        let end = phys.checked_add(size).ok_or(PmbError::InvalidRange)?;
        if end.as_usize() as u64 > ADDRESS_LIMIT
            || req_virt.is_some_and(|virt| virt.as_usize() as u64 >= ADDRESS_LIMIT)
        {
            return Err(PmbError::InvalidRange);
        }

        let id = self.mappings.alloc().ok_or(PmbError::NoMappings)?;

        let mut result = Err(PmbError::NoVirtualSpace);
        for first in 0..config.sizes.len() {
            let sizes = &config.sizes[first..];

            let chain = match self.tile(phys, end, sizes) {
                Ok(chain) => chain,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };

            match self.place(config, &chain, phys, req_virt) {
                Some(virt) => {
                    self.assign_virt(&chain, virt);
                    let mapping = self.mappings.get_mut(id);
                    mapping.phys = chain.ppn;
                    mapping.virt = virt;
                    mapping.size = chain.size;
                    mapping.flags = flags;
                    mapping.entries = Some(chain.head);
                    return Ok(id);
                }
                None => {
                    log::debug!(
                        "pmb: no room for {} at {} with {} slots, retrying",
                        HumanSize(chain.size),
                        chain.ppn,
                        sizes[0]
                    );
                    self.release_chain(chain.head);
                }
            }
        }

        self.mappings.release(id);
        result
    }

    /// Covers `[phys, end)` with tiles, allocating one slot per tile.
    fn tile(
        &mut self,
        phys: PhysicalAddress,
        end: PhysicalAddress,
        sizes: &[SizeClass],
    ) -> Result<Chain, PmbError> {
        let mut cursor = phys;
        let mut head: Option<Slot> = None;
        let mut tail: Option<Slot> = None;
        let mut ppn = phys;
        let mut total = 0;
        let mut align = 0;

        while cursor < end {
            let (class, start) = best_fit(cursor, end, sizes, head.is_none());

            let Some(slot) = self.slots.alloc() else {
                if let Some(head) = head {
                    self.release_chain(head);
                }
                return Err(PmbError::NoSlots);
            };

            self.entries[slot.index()] = PmbEntry {
                vpn: VirtualAddress::new(0),
                ppn: start,
                size: class,
                next: None,
            };
            match tail {
                Some(tail) => self.entries[tail.index()].next = Some(slot),
                None => {
                    head = Some(slot);
                    ppn = start;
                }
            }
            tail = Some(slot);

            total += class.bytes();
            align = align.max(class.bytes());
            match start.checked_add(class.bytes()) {
                Some(next) => cursor = next,
                None => break,
            }
        }

        Ok(Chain {
            head: head.expect("a non-empty range yields at least one tile"),
            ppn,
            size: total,
            align,
        })
    }

    /// Chooses the virtual address of the chain's first tile.
    fn place(
        &self,
        config: &PmbConfig,
        chain: &Chain,
        phys: PhysicalAddress,
        req_virt: Option<VirtualAddress>,
    ) -> Option<VirtualAddress> {
        let phase = chain.ppn.phase(chain.align);
        let fits = |virt: VirtualAddress| {
            self.mappings.is_free(virt, chain.size, config.window_start, config.window_end)
        };

        if let Some(req) = req_virt {
            let virt = VirtualAddress::new(req.as_usize().checked_sub(phys - chain.ppn)?);
            if virt.phase(chain.align) != phase {
                return None;
            }
            return fits(virt).then_some(virt);
        }

        match config.placement {
            Placement::Tiled { offset } => {
                let virt = VirtualAddress::new(chain.ppn.as_usize().checked_add(offset)?);
                fits(virt).then_some(virt)
            }
            Placement::FirstFit => {
                self.mappings
                    .gaps(config.window_start, config.window_end)
                    .find_map(|(gap_start, gap_end)| {
                        let mut virt = gap_start.align_down(chain.align) + phase;
                        if virt < gap_start {
                            virt = virt.checked_add(chain.align)?;
                        }
                        let last = virt.checked_add(chain.size)?;
                        (last <= gap_end).then_some(virt)
                    })
            }
        }
    }

    /// Gives every entry of the chain its virtual page.
    fn assign_virt(&mut self, chain: &Chain, virt: VirtualAddress) {
        let mut cursor = Some(chain.head);
        while let Some(slot) = cursor {
            let entry = &mut self.entries[slot.index()];
            entry.vpn = virt + (entry.ppn - chain.ppn);
            cursor = entry.next;
        }
    }

    /// Returns every slot of a chain to the pool.
    pub(crate) fn release_chain(&mut self, head: Slot) {
        let mut cursor = Some(head);
        while let Some(slot) = cursor {
            cursor = self.entries[slot.index()].next;
            self.entries[slot.index()] = PmbEntry::EMPTY;
            self.slots.free(slot);
        }
    }
}
