//! Hardware access for the PMB.
//!
//! The manager never touches registers directly. It goes through a
//! [`PmbHardware`] backend: the SH-4 MMIO implementation when built for the
//! target, or the software emulation used by tests and the simulator.

use crate::entry::PMB_PN_MASK;
use crate::{PmbEntry, PmbFlags, Slot};

#[cfg(feature = "sh4")]
pub mod sh4;

// Software emulation is available to tests and, with the feature, to host tools.
#[cfg(any(test, feature = "software-emulation"))]
pub mod software;

/// Access to the PMB address/data arrays and the CPU's cache-mode controls.
///
/// Implementations must not cache register contents: every read goes to the
/// hardware (or its emulation).
pub trait PmbHardware {
    /// Reads the address word of `slot`.
    fn read_addr(&self, slot: Slot) -> u32;

    /// Reads the data word of `slot`.
    fn read_data(&self, slot: Slot) -> u32;

    /// Writes the address word of `slot`.
    fn write_addr(&self, slot: Slot, value: u32);

    /// Writes the data word of `slot`.
    fn write_data(&self, slot: Slot, value: u32);

    /// Continues execution from the uncached alias of the current code.
    ///
    /// # Safety
    ///
    /// Must be paired with [`back_to_cached`](Self::back_to_cached); use
    /// [`UncachedSection`] rather than calling this directly.
    unsafe fn jump_to_uncached(&self);

    /// Returns to cached execution.
    ///
    /// # Safety
    ///
    /// Must only follow a call to [`jump_to_uncached`](Self::jump_to_uncached).
    unsafe fn back_to_cached(&self);

    /// Writes back and invalidates the CPU caches.
    fn flush_caches(&self);

    /// Runs `f` on a small, fixed stack reachable through the uncached alias.
    ///
    /// While `f` runs, the code may tear down the slot that maps the regular
    /// kernel stack.
    ///
    /// # Safety
    ///
    /// `f` must not touch memory outside the kernel's uncached window.
    unsafe fn run_on_boot_stack(&self, f: &mut dyn FnMut());
}

/// Scoped switch to uncached execution.
///
/// Creating the section jumps to uncached execution; dropping it returns to
/// cached execution, on every exit path.
pub struct UncachedSection<'a, H: PmbHardware + ?Sized> {
    hw: &'a H,
}

impl<'a, H: PmbHardware + ?Sized> UncachedSection<'a, H> {
    pub fn enter(hw: &'a H) -> Self {
        // SAFETY: the matching back_to_cached runs in Drop.
        unsafe { hw.jump_to_uncached() };
        Self { hw }
    }

    /// Programs `entry` into `slot`.
    ///
    /// The address word goes first, then the data word, then the address word
    /// is read back; without the read-back the write can be lost across a
    /// hibernate/resume cycle.
    pub fn set_entry(&self, slot: Slot, entry: &PmbEntry, flags: PmbFlags) {
        write_entry(self.hw, slot, entry, flags);
    }

    /// Programs raw address and data words into `slot`, in the same order as
    /// [`set_entry`](Self::set_entry).
    pub fn set_words(&self, slot: Slot, addr: u32, data: u32) {
        write_words(self.hw, slot, addr, data);
    }

    /// Invalidates `slot`.
    pub fn clear_entry(&self, slot: Slot) {
        clear_entry(self.hw, slot);
    }
}

impl<H: PmbHardware + ?Sized> Drop for UncachedSection<'_, H> {
    fn drop(&mut self) {
        // SAFETY: paired with the jump_to_uncached in enter().
        unsafe { self.hw.back_to_cached() };
    }
}

pub(crate) fn write_entry<H: PmbHardware + ?Sized>(
    hw: &H,
    slot: Slot,
    entry: &PmbEntry,
    flags: PmbFlags,
) {
    write_words(hw, slot, entry.addr_word(), entry.data_word(flags));
}

fn write_words<H: PmbHardware + ?Sized>(hw: &H, slot: Slot, addr: u32, data: u32) {
    log::trace!("pmb: slot {} <- {:#010x} {:#010x}", slot, addr, data);
    hw.write_addr(slot, addr);
    hw.write_data(slot, data);
    let readback = hw.read_addr(slot);
    debug_assert_eq!(
        readback & PMB_PN_MASK,
        addr & PMB_PN_MASK,
        "PMB slot {} did not latch",
        slot
    );
}

pub(crate) fn clear_entry<H: PmbHardware + ?Sized>(hw: &H, slot: Slot) {
    log::trace!("pmb: slot {} cleared", slot);
    hw.write_addr(slot, 0);
}
