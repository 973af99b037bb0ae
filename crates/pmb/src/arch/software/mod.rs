//! Software emulation of the PMB for testing and host tools.
//!
//! The emulation keeps a register file for the sixteen address/data pairs and
//! tracks the execution mode, so tests can check not only the final register
//! contents but also that they were written the right way: from uncached
//! execution, with the posted write flushed by a read-back.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::entry::RawSlot;
use crate::slots::NR_PMB_ENTRIES;
use crate::{PhysicalAddress, PmbFlags, SizeClass, Slot, VirtualAddress};

use super::PmbHardware;

#[derive(Clone, Copy, Default)]
struct Registers {
    addr: [u32; NR_PMB_ENTRIES],
    data: [u32; NR_PMB_ENTRIES],
    /// A data write that has not yet been followed by a read of the address word.
    posted: [bool; NR_PMB_ENTRIES],
}

/// Counters describing how the emulated registers were driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EmulationStats {
    /// Register writes made while executing cached.
    pub cached_writes: usize,
    /// Address-word reads that flushed a posted data write.
    pub readbacks: usize,
    /// Calls to `flush_caches`.
    pub flushes: usize,
    /// Calls to `run_on_boot_stack`.
    pub boot_stack_runs: usize,
}

/// An emulated PMB.
pub struct EmulatedPmb {
    regs: Mutex<Registers>,
    uncached_depth: AtomicUsize,
    on_boot_stack: AtomicBool,
    cached_writes: AtomicUsize,
    readbacks: AtomicUsize,
    flushes: AtomicUsize,
    boot_stack_runs: AtomicUsize,
}

impl EmulatedPmb {
    /// Creates an emulated PMB with every slot invalid.
    pub const fn new() -> Self {
        Self {
            regs: Mutex::new(Registers {
                addr: [0; NR_PMB_ENTRIES],
                data: [0; NR_PMB_ENTRIES],
                posted: [false; NR_PMB_ENTRIES],
            }),
            uncached_depth: AtomicUsize::new(0),
            on_boot_stack: AtomicBool::new(false),
            cached_writes: AtomicUsize::new(0),
            readbacks: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            boot_stack_runs: AtomicUsize::new(0),
        }
    }

    /// Programs a slot the way a bootloader would have left it.
    ///
    /// Does not count towards the statistics.
    pub fn preload(
        &self,
        slot: Slot,
        vpn: VirtualAddress,
        ppn: PhysicalAddress,
        size: SizeClass,
        flags: PmbFlags,
    ) {
        let entry = crate::PmbEntry {
            vpn,
            ppn,
            size,
            next: None,
        };
        let mut regs = self.regs.lock();
        regs.addr[slot.index()] = entry.addr_word();
        regs.data[slot.index()] = entry.data_word(flags);
    }

    /// Invalidates every slot, as a power cycle of the PMB would.
    pub fn reset(&self) {
        *self.regs.lock() = Registers::default();
    }

    /// Returns a copy of the address and data arrays.
    pub fn registers(&self) -> ([u32; NR_PMB_ENTRIES], [u32; NR_PMB_ENTRIES]) {
        let regs = self.regs.lock();
        (regs.addr, regs.data)
    }

    /// Iterates over the currently valid slots.
    pub fn valid_slots(&self) -> impl Iterator<Item = RawSlot> {
        let regs = *self.regs.lock();
        Slot::all().filter_map(move |slot| {
            RawSlot::decode(slot, regs.addr[slot.index()], regs.data[slot.index()])
        })
    }

    /// Translates `virt` the way the MMU would, if exactly one slot matches.
    ///
    /// # Panics
    ///
    /// Panics on a multi-hit, which the hardware reports as a fatal exception.
    pub fn translate(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, PmbFlags)> {
        let mut hits = self
            .valid_slots()
            .filter_map(|raw| raw.translate(virt).map(|phys| (phys, raw.flags)));
        let hit = hits.next();
        assert!(hits.next().is_none(), "PMB multi-hit at {}", virt);
        hit
    }

    pub fn is_uncached(&self) -> bool {
        self.uncached_depth.load(Ordering::Acquire) > 0
    }

    pub fn is_on_boot_stack(&self) -> bool {
        self.on_boot_stack.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EmulationStats {
        EmulationStats {
            cached_writes: self.cached_writes.load(Ordering::Acquire),
            readbacks: self.readbacks.load(Ordering::Acquire),
            flushes: self.flushes.load(Ordering::Acquire),
            boot_stack_runs: self.boot_stack_runs.load(Ordering::Acquire),
        }
    }

    fn note_write(&self) {
        if !self.is_uncached() {
            self.cached_writes.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Default for EmulatedPmb {
    fn default() -> Self {
        Self::new()
    }
}

impl PmbHardware for EmulatedPmb {
    fn read_addr(&self, slot: Slot) -> u32 {
        let mut regs = self.regs.lock();
        if core::mem::take(&mut regs.posted[slot.index()]) {
            self.readbacks.fetch_add(1, Ordering::AcqRel);
        }
        regs.addr[slot.index()]
    }

    fn read_data(&self, slot: Slot) -> u32 {
        self.regs.lock().data[slot.index()]
    }

    fn write_addr(&self, slot: Slot, value: u32) {
        self.note_write();
        self.regs.lock().addr[slot.index()] = value;
    }

    fn write_data(&self, slot: Slot, value: u32) {
        self.note_write();
        let mut regs = self.regs.lock();
        regs.data[slot.index()] = value;
        regs.posted[slot.index()] = true;
    }

    unsafe fn jump_to_uncached(&self) {
        self.uncached_depth.fetch_add(1, Ordering::AcqRel);
    }

    unsafe fn back_to_cached(&self) {
        let previous = self.uncached_depth.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "back_to_cached without jump_to_uncached");
    }

    fn flush_caches(&self) {
        self.flushes.fetch_add(1, Ordering::AcqRel);
    }

    unsafe fn run_on_boot_stack(&self, f: &mut dyn FnMut()) {
        self.boot_stack_runs.fetch_add(1, Ordering::AcqRel);
        let was_on_boot_stack = self.on_boot_stack.swap(true, Ordering::AcqRel);
        assert!(!was_on_boot_stack, "boot stack is not reentrant");
        f();
        self.on_boot_stack.store(false, Ordering::Release);
    }
}
