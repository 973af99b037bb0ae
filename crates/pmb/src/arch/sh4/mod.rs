//! SH-4 hardware backend.
//!
//! The PMB address and data arrays are memory-mapped: slot `n` lives at
//! `PMB_ADDR + (n << 8)` and `PMB_DATA + (n << 8)`. Switching instruction fetch
//! between the cached and uncached aliases, flushing the caches and switching
//! stacks cannot be expressed portably, so they are provided by the platform's
//! assembly glue.

use core::ffi::c_void;
use core::ptr;

use crate::Slot;

use super::PmbHardware;

/// Base of the PMB address array.
pub const PMB_ADDR: usize = 0xf610_0000;

/// Base of the PMB data array.
pub const PMB_DATA: usize = 0xf710_0000;

/// Shift applied to a slot index to form its register offset.
pub const PMB_E_SHIFT: usize = 8;

unsafe extern "C" {
    /// Moves the program counter into the uncached (P2-equivalent) alias.
    fn sh4_jump_to_uncached();
    /// Returns the program counter to the cached alias.
    fn sh4_back_to_cached();
    /// Writes back and invalidates the operand and instruction caches.
    fn sh4_flush_cache_all();
    /// Calls `func(arg)` with r15 pointing at the top of the reserved uncached stack.
    fn sh4_call_on_boot_stack(func: extern "C" fn(*mut c_void), arg: *mut c_void);
}

/// The on-chip PMB.
pub struct Sh4Pmb {
    _private: (),
}

impl Sh4Pmb {
    /// Returns a handle on the on-chip PMB.
    ///
    /// # Safety
    ///
    /// Only one handle may exist, and it must only be used in privileged mode.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    #[inline]
    fn addr_reg(slot: Slot) -> *mut u32 {
        (PMB_ADDR | (slot.index() << PMB_E_SHIFT)) as *mut u32
    }

    #[inline]
    fn data_reg(slot: Slot) -> *mut u32 {
        (PMB_DATA | (slot.index() << PMB_E_SHIFT)) as *mut u32
    }
}

impl PmbHardware for Sh4Pmb {
    fn read_addr(&self, slot: Slot) -> u32 {
        // SAFETY: the address array is always mapped in privileged mode.
        unsafe { ptr::read_volatile(Self::addr_reg(slot)) }
    }

    fn read_data(&self, slot: Slot) -> u32 {
        // SAFETY: the data array is always mapped in privileged mode.
        unsafe { ptr::read_volatile(Self::data_reg(slot)) }
    }

    fn write_addr(&self, slot: Slot, value: u32) {
        // SAFETY: as for read_addr.
        unsafe { ptr::write_volatile(Self::addr_reg(slot), value) }
    }

    fn write_data(&self, slot: Slot, value: u32) {
        // SAFETY: as for read_data.
        unsafe { ptr::write_volatile(Self::data_reg(slot), value) }
    }

    unsafe fn jump_to_uncached(&self) {
        unsafe { sh4_jump_to_uncached() }
    }

    unsafe fn back_to_cached(&self) {
        unsafe { sh4_back_to_cached() }
    }

    fn flush_caches(&self) {
        // SAFETY: flushing only writes back dirty lines; it does not change any mapping.
        unsafe { sh4_flush_cache_all() }
    }

    unsafe fn run_on_boot_stack(&self, f: &mut dyn FnMut()) {
        extern "C" fn trampoline(arg: *mut c_void) {
            // SAFETY: arg is the &mut &mut dyn FnMut passed below, alive for the call.
            let f = unsafe { &mut *(arg as *mut &mut dyn FnMut()) };
            f();
        }

        let mut f = f;
        unsafe {
            sh4_call_on_boot_stack(trampoline, &mut f as *mut &mut dyn FnMut() as *mut c_void);
        }
    }
}
