//! Hardware slot indices and the slot allocation bitmap.

use core::fmt;

/// Number of translation slots in the PMB.
pub const NR_PMB_ENTRIES: usize = 16;

/// Index of one hardware PMB slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Slot(u8);

impl Slot {
    /// Returns the slot with the given index, or `None` if it is out of range.
    pub const fn new(index: usize) -> Option<Self> {
        if index < NR_PMB_ENTRIES {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    /// Returns the slot index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Iterates over every hardware slot in index order.
    pub fn all() -> impl Iterator<Item = Slot> {
        (0..NR_PMB_ENTRIES as u8).map(Slot)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.0)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:2}", self.0)
    }
}

/// Allocation bitmap for the hardware slots.
///
/// A bit is set if and only if the entry for that slot is owned by a live
/// mapping (or reserved during boot takeover).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotMap(u16);

impl SlotMap {
    /// Creates a bitmap with every slot free.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Returns the raw bitmap.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns the number of allocated slots.
    pub const fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn is_full(self) -> bool {
        self.0 == u16::MAX
    }

    /// Tests whether the given slot is allocated.
    pub const fn test(self, slot: Slot) -> bool {
        self.0 & (1 << slot.0) != 0
    }

    /// Sets the bit for `slot`, returning its previous value.
    pub fn test_and_set(&mut self, slot: Slot) -> bool {
        let old = self.test(slot);
        self.0 |= 1 << slot.0;
        old
    }

    /// Allocates the lowest free slot.
    pub fn alloc(&mut self) -> Option<Slot> {
        let index = self.0.trailing_ones() as usize;
        let slot = Slot::new(index)?;
        self.test_and_set(slot);
        Some(slot)
    }

    /// Releases an allocated slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not allocated: the tables and the hardware have diverged.
    pub fn free(&mut self, slot: Slot) {
        assert!(self.test(slot), "freeing unallocated PMB slot {}", slot.0);
        self.0 &= !(1 << slot.0);
    }
}
