//! Takeover of the PMB state left behind by the bootloader.
//!
//! The bootloader hands over with an arbitrary set of valid slots, typically a
//! cached and an uncached alias of all of RAM. The kernel is executing through
//! one of them, so the slots cannot simply be wiped. The takeover runs in two
//! phases:
//!
//! 1. From the uncached boot stack, every slot except the ones backing the
//!    uncached kernel window is cleared and the definitive cached RAM mapping
//!    is programmed.
//! 2. Running through that RAM mapping, the kept slots are cleared and the
//!    uncached window is rebuilt from scratch, again from uncached execution.
//!
//! Any inconsistency is fatal: a wrong derivation would corrupt the running
//! system, so there is nothing to recover to.

use crate::arch::{PmbHardware, UncachedSection};
use crate::entry::RawSlot;
use crate::slots::NR_PMB_ENTRIES;
use crate::{HumanSize, PhysicalAddress, Pmb, PmbError, PmbFlags, Slot, SlotMap, VirtualAddress};

/// Default size of the uncached kernel window.
pub const UNCACHED_WINDOW_SIZE: usize = 16 << 20;

/// Where the kernel expects RAM to appear once the takeover is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootLayout {
    /// Physical base of RAM.
    pub ram: PhysicalAddress,
    pub ram_size: usize,
    /// Virtual address of the cached alias of `ram`.
    pub cached_virt: VirtualAddress,
    /// Virtual address of the uncached alias of `ram`.
    pub uncached_virt: VirtualAddress,
    /// Size of the uncached alias, starting at `ram`.
    pub uncached_size: usize,
}

impl BootLayout {
    /// The usual 32-bit layout: RAM cached at `0x8000_0000`, with the start
    /// of RAM also visible uncached at `0xa000_0000`.
    pub const fn new(ram: PhysicalAddress, ram_size: usize) -> Self {
        Self {
            ram,
            ram_size,
            cached_virt: VirtualAddress::new(0x8000_0000),
            uncached_virt: VirtualAddress::new(0xa000_0000),
            uncached_size: UNCACHED_WINDOW_SIZE,
        }
    }

    /// Physical address that `virt` must translate to inside the uncached window.
    fn uncached_target(&self, virt: VirtualAddress) -> PhysicalAddress {
        self.ram + (virt - self.uncached_virt)
    }
}

impl<H: PmbHardware> Pmb<H> {
    /// Replaces the bootloader's slots with the kernel's own mappings.
    ///
    /// # Panics
    ///
    /// Panics if the manager already has mappings, if no bootloader slot maps
    /// the uncached window onto RAM, or if either definitive mapping cannot be
    /// built.
    pub fn boot_takeover(&self, layout: &BootLayout) {
        let mut guard = self.state.write();
        let state = &mut *guard;
        assert!(
            state.slots.count() == 0 && state.mappings.iter().next().is_none(),
            "PMB boot takeover on a live manager"
        );

        let hw = self.hardware();
        let config = self.config();

        let mut boot = [None; NR_PMB_ENTRIES];
        for slot in Slot::all() {
            boot[slot.index()] = RawSlot::decode(slot, hw.read_addr(slot), hw.read_data(slot));
        }

        let keep = kernel_slots(&boot, layout);
        log::info!(
            "pmb: taking over {} boot slots, keeping {} for the uncached window",
            boot.iter().flatten().count(),
            keep.count()
        );

        // Phase 1: rebuild RAM while executing uncached from the boot stack.
        state.slots = keep;
        let mut ram = None;
        // SAFETY: the closure only touches the manager's tables and the PMB,
        // all of which stay reachable through the kept uncached window.
        unsafe {
            hw.run_on_boot_stack(&mut || {
                let section = UncachedSection::enter(hw);
                for raw in boot.iter().flatten() {
                    if !keep.test(raw.slot) {
                        section.clear_entry(raw.slot);
                    }
                }

                let result = state.calc(
                    config,
                    layout.ram,
                    layout.ram_size,
                    Some(layout.cached_virt),
                    PmbFlags::CACHED,
                );
                if let Ok(id) = result {
                    state.program(&section, id);
                }
                ram = Some(result);
            });
        }

        let ram = match ram {
            Some(Ok(id)) => id,
            Some(Err(err)) => fatal(layout.ram, layout.ram_size, layout.cached_virt, err),
            None => panic!("boot stack helper did not run"),
        };
        let mapping = *state.mappings.get(ram);
        for raw in boot.iter().flatten().filter(|raw| keep.test(raw.slot)) {
            assert!(
                !raw.overlaps(mapping.virt, mapping.size),
                "cached RAM at {} overlaps uncached boot slot {}",
                mapping.virt,
                raw.slot
            );
        }
        state.activate(ram);
        log::info!(
            "pmb: RAM {} at {} -> {} cached",
            HumanSize(mapping.size),
            mapping.virt,
            mapping.phys
        );

        // Phase 2: executing through the new RAM mapping, the kept slots are
        // replaced by the definitive uncached window.
        let uncached = {
            let section = UncachedSection::enter(hw);
            for raw in boot.iter().flatten().filter(|raw| keep.test(raw.slot)) {
                section.clear_entry(raw.slot);
                state.slots.free(raw.slot);
            }

            let uncached = state
                .calc(
                    config,
                    layout.ram,
                    layout.uncached_size,
                    Some(layout.uncached_virt),
                    PmbFlags::empty(),
                )
                .unwrap_or_else(|err| {
                    fatal(layout.ram, layout.uncached_size, layout.uncached_virt, err)
                });
            state.program(&section, uncached);
            uncached
        };
        let mapping = *state.mappings.get(uncached);
        state.activate(uncached);
        state.fixed_uncached = Some(uncached);
        log::info!(
            "pmb: kernel {} at {} -> {} uncached",
            HumanSize(mapping.size),
            mapping.virt,
            mapping.phys
        );

        hw.flush_caches();
    }
}

/// Picks the bootloader slots backing the uncached kernel window.
fn kernel_slots(boot: &[Option<RawSlot>; NR_PMB_ENTRIES], layout: &BootLayout) -> SlotMap {
    let mut keep = SlotMap::new();
    let mut covers_base = false;

    for raw in boot.iter().flatten() {
        if !raw.overlaps(layout.uncached_virt, layout.uncached_size) {
            continue;
        }

        let first = raw.vpn.max(layout.uncached_virt);
        assert!(
            raw.translate(first) == Some(layout.uncached_target(first)),
            "boot PMB slot {} maps the uncached kernel window inconsistently",
            raw.slot
        );
        covers_base |= raw.translate(layout.uncached_virt).is_some();
        keep.test_and_set(raw.slot);
    }

    assert!(
        covers_base,
        "no boot PMB slot maps the uncached kernel at {}",
        layout.uncached_virt
    );
    keep
}

fn fatal(phys: PhysicalAddress, size: usize, virt: VirtualAddress, err: PmbError) -> ! {
    panic!(
        "cannot map {} at {} to {} during boot: {}",
        HumanSize(size),
        phys,
        virt,
        err
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::software::EmulatedPmb;
    use crate::{PmbConfig, SizeClass};

    const MIB: usize = 1 << 20;

    fn slot(index: usize) -> Slot {
        Slot::new(index).unwrap()
    }

    fn layout() -> BootLayout {
        BootLayout::new(PhysicalAddress::new(0x4000_0000), 512 * MIB)
    }

    /// The usual bootloader handoff, plus a stray slot.
    fn handoff() -> EmulatedPmb {
        let hw = EmulatedPmb::new();
        hw.preload(
            slot(0),
            VirtualAddress::new(0x8000_0000),
            PhysicalAddress::new(0x4000_0000),
            SizeClass::Size512M,
            PmbFlags::CACHED,
        );
        hw.preload(
            slot(1),
            VirtualAddress::new(0xa000_0000),
            PhysicalAddress::new(0x4000_0000),
            SizeClass::Size512M,
            PmbFlags::empty(),
        );
        hw.preload(
            slot(7),
            VirtualAddress::new(0xb000_0000),
            PhysicalAddress::new(0x1000_0000),
            SizeClass::Size16M,
            PmbFlags::CACHED,
        );
        hw
    }

    fn taken_over() -> Pmb<EmulatedPmb> {
        let pmb = Pmb::new(handoff(), PmbConfig::DEFAULT);
        pmb.boot_takeover(&layout());
        pmb
    }

    #[test]
    fn takeover_maps_ram_cached_and_kernel_uncached() {
        let pmb = taken_over();
        let hw = pmb.hardware();

        assert_eq!(
            hw.translate(VirtualAddress::new(0x8000_1000)),
            Some((PhysicalAddress::new(0x4000_1000), PmbFlags::CACHED))
        );
        assert_eq!(
            hw.translate(VirtualAddress::new(0x9fff_f000)),
            Some((PhysicalAddress::new(0x5fff_f000), PmbFlags::CACHED))
        );
        assert_eq!(
            hw.translate(VirtualAddress::new(0xa000_0000)),
            Some((PhysicalAddress::new(0x4000_0000), PmbFlags::empty()))
        );
        assert_eq!(hw.translate(VirtualAddress::new(0xb000_0000)), None);
        assert_eq!(hw.valid_slots().count(), 2);

        let stats = hw.stats();
        assert_eq!(stats.boot_stack_runs, 1);
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.cached_writes, 0);
        assert!(!hw.is_uncached());
    }

    #[test]
    fn takeover_with_tiled_placement() {
        let pmb = Pmb::new(handoff(), PmbConfig::tiled_64m(0x4000_0000));
        pmb.boot_takeover(&layout());
        let hw = pmb.hardware();

        assert_eq!(
            hw.translate(VirtualAddress::new(0x9fff_f000)),
            Some((PhysicalAddress::new(0x5fff_f000), PmbFlags::CACHED))
        );
        assert_eq!(
            hw.translate(VirtualAddress::new(0xa000_0000)),
            Some((PhysicalAddress::new(0x4000_0000), PmbFlags::empty()))
        );
        // Eight 64M tiles of RAM plus one for the uncached window.
        assert_eq!(hw.valid_slots().count(), 9);
        assert_eq!(hw.stats().cached_writes, 0);

        let snapshot = pmb.snapshot();
        let fixed = snapshot.mappings().find(|m| m.fixed).unwrap();
        assert_eq!(fixed.virt, VirtualAddress::new(0xa000_0000));
        assert_eq!(fixed.size, 64 * MIB);
    }

    #[test]
    fn takeover_records_both_mappings() {
        let pmb = taken_over();
        let snapshot = pmb.snapshot();
        let mappings: Vec<_> = snapshot.mappings().collect();

        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].virt, VirtualAddress::new(0x8000_0000));
        assert_eq!(mappings[0].size, 512 * MIB);
        assert!(!mappings[0].fixed);
        assert_eq!(mappings[1].virt, VirtualAddress::new(0xa000_0000));
        assert_eq!(mappings[1].size, UNCACHED_WINDOW_SIZE);
        assert!(mappings[1].fixed);
        assert_eq!(snapshot.slots.count(), 2);
    }

    #[test]
    fn ram_requests_reuse_the_boot_mapping() {
        let pmb = taken_over();
        assert_eq!(
            pmb.remap(PhysicalAddress::new(0x4800_0000), 64 * MIB, PmbFlags::CACHED),
            Ok(VirtualAddress::new(0x8800_0000))
        );
        assert_eq!(pmb.snapshot().slots.count(), 2);
    }

    #[test]
    fn resume_leaves_the_uncached_window_alone() {
        let pmb = taken_over();
        pmb.remap(PhysicalAddress::new(0x1000_0000), 64 * MIB, PmbFlags::empty())
            .unwrap();
        pmb.hardware().reset();
        pmb.resume();

        let hw = pmb.hardware();
        assert_eq!(hw.valid_slots().count(), 2);
        assert!(hw.translate(VirtualAddress::new(0x8000_0000)).is_some());
        assert_eq!(hw.translate(VirtualAddress::new(0xa000_0000)), None);
    }

    #[test]
    fn hom_table_starts_with_the_uncached_window() {
        let pmb = taken_over();
        let table = pmb.hom_table();

        assert_eq!(table.len(), 2);
        assert_eq!(table.iter().next().unwrap().addr, 0xa000_0100);
    }

    #[test]
    #[should_panic(expected = "no boot PMB slot maps the uncached kernel")]
    fn missing_uncached_slot_is_fatal() {
        let hw = EmulatedPmb::new();
        hw.preload(
            slot(0),
            VirtualAddress::new(0x8000_0000),
            PhysicalAddress::new(0x4000_0000),
            SizeClass::Size512M,
            PmbFlags::CACHED,
        );
        Pmb::new(hw, PmbConfig::DEFAULT).boot_takeover(&layout());
    }

    #[test]
    #[should_panic(expected = "inconsistently")]
    fn uncached_slot_elsewhere_is_fatal() {
        let hw = EmulatedPmb::new();
        hw.preload(
            slot(3),
            VirtualAddress::new(0xa000_0000),
            PhysicalAddress::new(0x0000_0000),
            SizeClass::Size128M,
            PmbFlags::empty(),
        );
        Pmb::new(hw, PmbConfig::DEFAULT).boot_takeover(&layout());
    }

    #[test]
    #[should_panic(expected = "overlaps uncached boot slot")]
    fn ram_reaching_into_the_kernel_window_is_fatal() {
        let layout = BootLayout::new(PhysicalAddress::new(0x4000_0000), 768 * MIB);
        Pmb::new(handoff(), PmbConfig::DEFAULT).boot_takeover(&layout);
    }

    #[test]
    #[should_panic(expected = "live manager")]
    fn takeover_twice_is_fatal() {
        let pmb = taken_over();
        pmb.boot_takeover(&layout());
    }
}
