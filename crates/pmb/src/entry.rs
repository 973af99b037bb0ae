//! PMB entries and their register encoding.

use crate::flags::PMB_V;
use crate::{PhysicalAddress, PmbFlags, SizeClass, Slot, VirtualAddress};

/// Page-number bits of both the address and the data word.
pub const PMB_PN_MASK: u32 = 0xff00_0000;

/// In-memory shadow of one hardware slot.
///
/// Entries live in a table indexed by their slot, so the slot number is never
/// stored separately. `next` chains the entries owned by one mapping in
/// ascending address order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmbEntry {
    pub vpn: VirtualAddress,
    pub ppn: PhysicalAddress,
    pub size: SizeClass,
    pub next: Option<Slot>,
}

impl PmbEntry {
    pub(crate) const EMPTY: PmbEntry = PmbEntry {
        vpn: VirtualAddress::new(0),
        ppn: PhysicalAddress::new(0),
        size: SizeClass::Size16M,
        next: None,
    };

    /// Returns the address word, with the valid bit set.
    pub fn addr_word(&self) -> u32 {
        (self.vpn.as_usize() as u32 & PMB_PN_MASK) | PMB_V
    }

    /// Returns the data word for this entry carrying the owning mapping's flags.
    pub fn data_word(&self, flags: PmbFlags) -> u32 {
        (self.ppn.as_usize() as u32 & PMB_PN_MASK) | self.size.to_bits() | flags.to_raw() | PMB_V
    }

    /// Returns true if `virt` is translated by this entry.
    pub fn covers(&self, virt: VirtualAddress) -> bool {
        virt.within(self.vpn, self.size.bytes())
    }
}

/// A slot as decoded from the hardware registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSlot {
    pub slot: Slot,
    pub vpn: VirtualAddress,
    pub ppn: PhysicalAddress,
    pub size: SizeClass,
    pub flags: PmbFlags,
}

impl RawSlot {
    /// Decodes a pair of register words; `None` if the slot is not valid.
    pub fn decode(slot: Slot, addr: u32, data: u32) -> Option<Self> {
        if addr & PMB_V == 0 || data & PMB_V == 0 {
            return None;
        }

        Some(Self {
            slot,
            vpn: VirtualAddress::from(addr & PMB_PN_MASK),
            ppn: PhysicalAddress::from(data & PMB_PN_MASK),
            size: SizeClass::from_bits(data),
            flags: PmbFlags::from_raw(data),
        })
    }

    /// Returns true if this slot's virtual range intersects `[base, base + size)`.
    pub fn overlaps(&self, base: VirtualAddress, size: usize) -> bool {
        let start = self.vpn.as_usize();
        let end = start + self.size.bytes();
        start < base.as_usize() + size && base.as_usize() < end
    }

    /// Translates `virt` through this slot, if it covers it.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        if virt.within(self.vpn, self.size.bytes()) {
            Some(self.ppn + (virt - self.vpn))
        } else {
            None
        }
    }
}
