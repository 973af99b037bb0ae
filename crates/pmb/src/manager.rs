//! The PMB manager: reference-counted mappings over the sixteen hardware slots.
//!
//! All tables live in one [`PmbState`] behind a reader/writer spin lock. Every
//! mutation takes the write side; translations only take the read side. No
//! operation waits for space: exhaustion is reported to the caller at once.

use core::fmt;

use spin::RwLock;

use crate::arch::{PmbHardware, UncachedSection};
use crate::calc::check_size;
use crate::slots::NR_PMB_ENTRIES;
use crate::{
    HumanSize, MappingId, MappingTable, PhysicalAddress, PmbConfig, PmbEntry, PmbFlags, Slot,
    SlotMap, VirtualAddress,
};

/// Errors returned by PMB mapping operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmbError {
    /// The request has zero length.
    EmptyRange,
    /// The request is smaller than the configured minimum mapping size.
    TooSmall,
    /// The range wraps around or does not fit the 32-bit page-number fields.
    InvalidRange,
    /// Every hardware slot is in use.
    NoSlots,
    /// Every mapping record is in use.
    NoMappings,
    /// No suitably aligned virtual gap, or the requested virtual address is unusable.
    NoVirtualSpace,
    /// No mapping contains the given virtual address.
    NotMapped,
}

impl fmt::Display for PmbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            PmbError::EmptyRange => "empty range",
            PmbError::TooSmall => "range below minimum PMB mapping size",
            PmbError::InvalidRange => "range outside the 32-bit address space",
            PmbError::NoSlots => "no free PMB slot",
            PmbError::NoMappings => "no free PMB mapping record",
            PmbError::NoVirtualSpace => "no suitable virtual address space",
            PmbError::NotMapped => "address not mapped by the PMB",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for PmbError {}

/// Every table the manager owns.
pub(crate) struct PmbState {
    /// Shadow of each hardware slot, indexed by slot.
    pub(crate) entries: [PmbEntry; NR_PMB_ENTRIES],
    pub(crate) slots: SlotMap,
    pub(crate) mappings: MappingTable,
    /// Mapping of the kernel's uncached alias, established at boot and left
    /// alone on resume.
    pub(crate) fixed_uncached: Option<MappingId>,
}

impl PmbState {
    pub(crate) const fn new() -> Self {
        Self {
            entries: [PmbEntry::EMPTY; NR_PMB_ENTRIES],
            slots: SlotMap::new(),
            mappings: MappingTable::new(),
            fixed_uncached: None,
        }
    }

    /// Iterates over a chain of entries.
    pub(crate) fn chain(&self, head: Option<Slot>) -> impl Iterator<Item = (Slot, &PmbEntry)> + '_ {
        core::iter::successors(head, move |slot| self.entries[slot.index()].next)
            .map(move |slot| (slot, &self.entries[slot.index()]))
    }

    /// Writes every entry of a mapping to the hardware.
    pub(crate) fn program<H: PmbHardware + ?Sized>(
        &self,
        section: &UncachedSection<'_, H>,
        id: MappingId,
    ) {
        let mapping = self.mappings.get(id);
        for (slot, entry) in self.chain(mapping.entries) {
            section.set_entry(slot, entry, mapping.flags);
        }
    }

    /// Finds a live mapping that already covers the request.
    fn find_reusable(
        &self,
        phys: PhysicalAddress,
        size: usize,
        req_virt: Option<VirtualAddress>,
        flags: PmbFlags,
    ) -> Option<MappingId> {
        self.mappings.iter().find(|&id| {
            let mapping = self.mappings.get(id);
            mapping.flags == flags
                && mapping.contains_phys(phys, size)
                && req_virt.is_none_or(|virt| mapping.virt_of(phys) == virt)
        })
    }

    /// Links a freshly calculated mapping with a single user.
    pub(crate) fn activate(&mut self, id: MappingId) {
        self.mappings.get_mut(id).usage = 1;
        self.mappings.insert(id);
    }
}

/// The PMB manager.
///
/// Owns the hardware backend and every table describing it. A kernel keeps one
/// instance for the lifetime of the system; `new` is `const` so it can live in
/// a `static`.
pub struct Pmb<H: PmbHardware> {
    hw: H,
    config: PmbConfig,
    pub(crate) state: RwLock<PmbState>,
}

impl<H: PmbHardware> Pmb<H> {
    /// Creates a manager with no mappings.
    pub const fn new(hw: H, config: PmbConfig) -> Self {
        Self {
            hw,
            config,
            state: RwLock::new(PmbState::new()),
        }
    }

    /// Returns the hardware backend.
    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// Returns the configuration the manager was created with.
    pub fn config(&self) -> &PmbConfig {
        &self.config
    }

    /// Maps `[phys, phys + size)` anywhere in the window and returns the virtual address of `phys`.
    pub fn remap(
        &self,
        phys: PhysicalAddress,
        size: usize,
        flags: PmbFlags,
    ) -> Result<VirtualAddress, PmbError> {
        self.get_map(phys, size, None, flags)
    }

    /// Maps `[phys, phys + size)` so that `phys` appears at `virt`.
    pub fn remap_fixed(
        &self,
        phys: PhysicalAddress,
        size: usize,
        virt: VirtualAddress,
        flags: PmbFlags,
    ) -> Result<VirtualAddress, PmbError> {
        self.get_map(phys, size, Some(virt), flags)
    }

    fn get_map(
        &self,
        phys: PhysicalAddress,
        size: usize,
        req_virt: Option<VirtualAddress>,
        flags: PmbFlags,
    ) -> Result<VirtualAddress, PmbError> {
        check_size(&self.config, size)?;

        let mut state = self.state.write();

        if let Some(id) = state.find_reusable(phys, size, req_virt, flags) {
            let mapping = state.mappings.get_mut(id);
            mapping.usage += 1;
            log::debug!(
                "pmb: reusing {} at {} for {} ({} users)",
                HumanSize(mapping.size),
                mapping.virt,
                phys,
                mapping.usage
            );
            return Ok(mapping.virt_of(phys));
        }

        let id = state
            .calc(&self.config, phys, size, req_virt, flags)
            .inspect_err(|err| {
                log::warn!(
                    "pmb: cannot map {} at {} ({}): {}",
                    HumanSize(size),
                    phys,
                    flags,
                    err
                )
            })?;

        {
            let section = UncachedSection::enter(&self.hw);
            state.program(&section, id);
        }
        state.activate(id);

        let mapping = state.mappings.get(id);
        log::debug!(
            "pmb: mapped {} at {} -> {} ({})",
            HumanSize(mapping.size),
            mapping.virt,
            mapping.phys,
            mapping.flags
        );
        Ok(mapping.virt_of(phys))
    }

    /// Drops one user of the mapping containing `virt`, tearing it down with the last one.
    pub fn unmap(&self, virt: VirtualAddress) -> Result<(), PmbError> {
        let mut state = self.state.write();

        let Some(id) = state.mappings.find_virt(virt) else {
            log::warn!("pmb: unmap of {} which is not mapped", virt);
            return Err(PmbError::NotMapped);
        };

        let mapping = state.mappings.get_mut(id);
        assert!(mapping.usage > 0, "live PMB mapping at {} has no users", mapping.virt);
        mapping.usage -= 1;
        if mapping.usage > 0 {
            return Ok(());
        }

        let mapping = *mapping;
        {
            let section = UncachedSection::enter(&self.hw);
            for (slot, _) in state.chain(mapping.entries) {
                section.clear_entry(slot);
            }
        }

        if let Some(head) = mapping.entries {
            state.release_chain(head);
        }
        state.mappings.unlink(id);
        state.mappings.release(id);
        if state.fixed_uncached == Some(id) {
            state.fixed_uncached = None;
        }

        log::debug!(
            "pmb: unmapped {} at {}",
            HumanSize(mapping.size),
            mapping.virt
        );
        Ok(())
    }

    /// Translates a virtual address through the live mappings.
    pub fn virt_to_phys(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let state = self.state.read();
        let id = state.mappings.find_virt(virt)?;
        let mapping = state.mappings.get(id);
        Some(mapping.phys + (virt - mapping.virt))
    }

    /// Reprograms every live mapping except the fixed uncached one after a
    /// resume from a low-power state, then flushes the caches.
    pub fn resume(&self) {
        let state = self.state.write();
        log::info!("pmb: restoring {} slots after resume", state.slots.count());

        {
            let section = UncachedSection::enter(&self.hw);
            for id in state.mappings.iter() {
                if state.fixed_uncached == Some(id) {
                    continue;
                }
                state.program(&section, id);
            }
        }

        self.hw.flush_caches();
    }

    /// Returns a consistent copy of the tables.
    pub fn snapshot(&self) -> PmbSnapshot {
        let state = self.state.read();
        let mut snapshot = PmbSnapshot {
            slots: state.slots,
            entries: state.entries,
            mappings: [None; NR_PMB_ENTRIES],
        };

        for (index, id) in state.mappings.iter().enumerate() {
            let mapping = state.mappings.get(id);
            snapshot.mappings[index] = Some(MappingInfo {
                phys: mapping.phys,
                virt: mapping.virt,
                size: mapping.size,
                flags: mapping.flags,
                usage: mapping.usage,
                fixed: state.fixed_uncached == Some(id),
                head: mapping.entries,
            });
        }

        snapshot
    }
}

/// Copy of one live mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingInfo {
    pub phys: PhysicalAddress,
    pub virt: VirtualAddress,
    pub size: usize,
    pub flags: PmbFlags,
    pub usage: usize,
    /// Whether this is the kernel's fixed uncached mapping.
    pub fixed: bool,
    head: Option<Slot>,
}

/// Copy of the manager's tables at one point in time.
///
/// Two snapshots compare equal only if the slot bitmap, every entry and every
/// live mapping are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmbSnapshot {
    pub slots: SlotMap,
    entries: [PmbEntry; NR_PMB_ENTRIES],
    mappings: [Option<MappingInfo>; NR_PMB_ENTRIES],
}

impl PmbSnapshot {
    /// Iterates over live mappings in ascending virtual-address order.
    pub fn mappings(&self) -> impl Iterator<Item = &MappingInfo> + '_ {
        self.mappings.iter().map_while(|mapping| mapping.as_ref())
    }

    /// Iterates over the entries of `mapping` in chain order.
    pub fn entries(&self, mapping: &MappingInfo) -> impl Iterator<Item = (Slot, PmbEntry)> + '_ {
        core::iter::successors(mapping.head, move |slot| self.entries[slot.index()].next)
            .map(move |slot| (slot, self.entries[slot.index()]))
    }
}

impl fmt::Display for PmbSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} mappings, {}/{} slots in use",
            self.mappings().count(),
            self.slots.count(),
            NR_PMB_ENTRIES
        )?;
        for mapping in self.mappings() {
            writeln!(
                f,
                "{} -> {} {:>5} {:<12} users={}{}",
                mapping.virt,
                mapping.phys,
                Cell(HumanSize(mapping.size)),
                Cell(mapping.flags),
                mapping.usage,
                if mapping.fixed { " fixed" } else { "" }
            )?;
            for (slot, entry) in self.entries(mapping) {
                writeln!(
                    f,
                    "    slot {} {} -> {} {}",
                    slot, entry.vpn, entry.ppn, entry.size
                )?;
            }
        }
        Ok(())
    }
}

/// Renders a value first so width and alignment apply to its whole output.
struct Cell<T>(T);

impl<T: fmt::Display> fmt::Display for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = FixedBuf::<32>::new();
        fmt::write(&mut buf, format_args!("{}", self.0))?;
        f.pad(buf.as_str())
    }
}

/// Small stack buffer used to render values that must be padded as a whole.
struct FixedBuf<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedBuf<N> {
    const fn new() -> Self {
        Self {
            bytes: [0; N],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let end = self.len + s.len();
        if end > N {
            return Err(fmt::Error);
        }
        self.bytes[self.len..end].copy_from_slice(s.as_bytes());
        self.len = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::software::EmulatedPmb;

    const MIB: usize = 1 << 20;

    fn pmb() -> Pmb<EmulatedPmb> {
        Pmb::new(EmulatedPmb::new(), PmbConfig::DEFAULT)
    }

    fn phys(addr: usize) -> PhysicalAddress {
        PhysicalAddress::new(addr)
    }

    fn virt(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    #[test]
    fn map_then_unmap_restores_state() {
        let pmb = pmb();
        let before = pmb.snapshot();

        let v = pmb.remap(phys(0x4800_0000), 64 * MIB, PmbFlags::CACHED).unwrap();
        assert_ne!(pmb.snapshot(), before);
        pmb.unmap(v).unwrap();

        assert_eq!(pmb.snapshot(), before);
        assert_eq!(pmb.hardware().valid_slots().count(), 0);
    }

    #[test]
    fn mapping_is_visible_to_hardware() {
        let pmb = pmb();
        let v = pmb.remap(phys(0x4800_0000), 64 * MIB, PmbFlags::CACHED).unwrap();

        assert_eq!(
            pmb.hardware().translate(v + 0x1234),
            Some((phys(0x4800_1234), PmbFlags::CACHED))
        );
        assert_eq!(pmb.virt_to_phys(v + 0x1234), Some(phys(0x4800_1234)));
        assert_eq!(pmb.virt_to_phys(v + 64 * MIB), None);
    }

    #[test]
    fn repeated_requests_share_one_mapping() {
        let pmb = pmb();
        let v = pmb.remap(phys(0x4000_0000), 64 * MIB, PmbFlags::CACHED).unwrap();
        for _ in 0..2 {
            assert_eq!(pmb.remap(phys(0x4000_0000), 64 * MIB, PmbFlags::CACHED), Ok(v));
        }
        let slots = pmb.snapshot().slots;

        // A sub-range of a live mapping reuses it too.
        assert_eq!(
            pmb.remap(phys(0x4100_0000), 16 * MIB, PmbFlags::CACHED),
            Ok(v + 16 * MIB)
        );
        assert_eq!(pmb.snapshot().slots, slots);
        assert_eq!(pmb.snapshot().mappings().next().unwrap().usage, 4);

        for _ in 0..3 {
            pmb.unmap(v).unwrap();
            assert_eq!(pmb.virt_to_phys(v), Some(phys(0x4000_0000)));
        }
        pmb.unmap(v).unwrap();
        assert_eq!(pmb.virt_to_phys(v), None);
        assert_eq!(pmb.unmap(v), Err(PmbError::NotMapped));
    }

    #[test]
    fn different_flags_get_a_separate_mapping() {
        let pmb = pmb();
        let cached = pmb.remap(phys(0x4000_0000), 16 * MIB, PmbFlags::CACHED).unwrap();
        let uncached = pmb.remap(phys(0x4000_0000), 16 * MIB, PmbFlags::empty()).unwrap();

        assert_ne!(cached, uncached);
        assert_eq!(pmb.snapshot().slots.count(), 2);
        assert_eq!(
            pmb.hardware().translate(uncached),
            Some((phys(0x4000_0000), PmbFlags::empty()))
        );
    }

    #[test]
    fn size_checks_apply_before_reuse() {
        let pmb = pmb();
        pmb.remap(phys(0x4000_0000), 64 * MIB, PmbFlags::CACHED).unwrap();

        assert_eq!(
            pmb.remap(phys(0x4000_0000), 4 * MIB, PmbFlags::CACHED),
            Err(PmbError::TooSmall)
        );
        assert_eq!(
            pmb.remap(phys(0x4000_0000), 0, PmbFlags::CACHED),
            Err(PmbError::EmptyRange)
        );
        assert_eq!(pmb.snapshot().mappings().next().unwrap().usage, 1);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn addresses_beyond_32_bits_are_refused() {
        let pmb = pmb();
        assert_eq!(
            pmb.remap(phys(0x1_4000_0000), 64 * MIB, PmbFlags::CACHED),
            Err(PmbError::InvalidRange)
        );
        assert_eq!(pmb.snapshot(), Pmb::new(EmulatedPmb::new(), PmbConfig::DEFAULT).snapshot());
        assert_eq!(pmb.hardware().valid_slots().count(), 0);
    }

    #[test]
    fn exhausting_slots_leaves_existing_mappings_intact() {
        let pmb = pmb();
        let mut mapped = Vec::new();
        for i in 0..8 {
            let p = phys(0x4000_0000 + i * 32 * MIB);
            mapped.push((p, pmb.remap(p, 32 * MIB, PmbFlags::CACHED).unwrap()));
        }
        assert!(pmb.snapshot().slots.is_full());
        let before = pmb.snapshot();

        assert_eq!(
            pmb.remap(phys(0x6000_0000), 16 * MIB, PmbFlags::CACHED),
            Err(PmbError::NoSlots)
        );
        assert_eq!(pmb.snapshot(), before);
        for (p, v) in mapped {
            assert_eq!(pmb.virt_to_phys(v), Some(p));
        }
    }

    #[test]
    fn live_mappings_stay_sorted_and_disjoint() {
        let pmb = pmb();
        let a = pmb.remap(phys(0x4000_0000), 16 * MIB, PmbFlags::CACHED).unwrap();
        let b = pmb.remap(phys(0x5000_0000), 64 * MIB, PmbFlags::CACHED).unwrap();
        let _c = pmb.remap(phys(0x6000_0000), 16 * MIB, PmbFlags::CACHED).unwrap();
        pmb.unmap(a).unwrap();
        let _d = pmb.remap(phys(0x7000_0000), 32 * MIB, PmbFlags::CACHED).unwrap();
        pmb.unmap(b).unwrap();
        let _e = pmb.remap(phys(0x2000_0000), 128 * MIB, PmbFlags::CACHED).unwrap();

        let snapshot = pmb.snapshot();
        let ranges: Vec<_> = snapshot.mappings().map(|m| (m.virt, m.virt + m.size)).collect();
        assert_eq!(ranges.len(), 3);
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
        for mapping in snapshot.mappings() {
            for (_, entry) in snapshot.entries(mapping) {
                assert!(entry.vpn >= mapping.virt && entry.vpn < mapping.virt + mapping.size);
            }
        }
    }

    #[test]
    fn registers_are_only_written_uncached() {
        let pmb = pmb();
        let v = pmb.remap(phys(0x4000_0000), 80 * MIB, PmbFlags::CACHED).unwrap();
        let programmed = pmb.snapshot().slots.count();
        pmb.unmap(v).unwrap();

        let stats = pmb.hardware().stats();
        assert_eq!(stats.cached_writes, 0);
        assert_eq!(stats.readbacks, programmed);
        assert!(!pmb.hardware().is_uncached());
    }

    #[test]
    fn fixed_requests_land_where_asked() {
        let pmb = pmb();
        let v = pmb
            .remap_fixed(phys(0x4000_0000), 64 * MIB, virt(0x9000_0000), PmbFlags::CACHED)
            .unwrap();
        assert_eq!(v, virt(0x9000_0000));

        assert_eq!(
            pmb.remap_fixed(phys(0x4000_0000), 64 * MIB, virt(0x9000_0000), PmbFlags::CACHED),
            Ok(v)
        );
        assert_eq!(
            pmb.remap_fixed(phys(0x5000_0000), 16 * MIB, virt(0x9100_0000), PmbFlags::CACHED),
            Err(PmbError::NoVirtualSpace)
        );
        assert_eq!(pmb.snapshot().mappings().count(), 1);
    }

    #[test]
    fn resume_reprograms_lost_registers() {
        let pmb = pmb();
        pmb.remap(phys(0x4000_0000), 64 * MIB, PmbFlags::CACHED).unwrap();
        pmb.remap(phys(0x1000_0000), 32 * MIB, PmbFlags::UNBUFFERED).unwrap();
        let registers = pmb.hardware().registers();

        pmb.hardware().reset();
        pmb.resume();

        assert_eq!(pmb.hardware().registers(), registers);
        assert_eq!(pmb.hardware().stats().flushes, 1);
        assert_eq!(pmb.hardware().stats().cached_writes, 0);
    }

    #[test]
    fn concurrent_users_leave_no_trace() {
        let pmb = pmb();
        std::thread::scope(|scope| {
            for t in 0..4 {
                let pmb = &pmb;
                scope.spawn(move || {
                    let p = phys(0x4000_0000 + t * 64 * MIB);
                    for _ in 0..50 {
                        let v = pmb.remap(p, 16 * MIB, PmbFlags::CACHED).unwrap();
                        assert_eq!(pmb.virt_to_phys(v), Some(p));
                        pmb.unmap(v).unwrap();
                    }
                });
            }
        });

        assert_eq!(pmb.snapshot(), Pmb::new(EmulatedPmb::new(), PmbConfig::DEFAULT).snapshot());
        assert_eq!(pmb.hardware().valid_slots().count(), 0);
    }

    #[test]
    fn snapshot_renders_a_table() {
        let pmb = pmb();
        pmb.remap(phys(0x4000_0000), 64 * MIB, PmbFlags::CACHED).unwrap();
        let text = pmb.snapshot().to_string();

        assert!(text.starts_with("1 mappings, 1/16 slots in use\n"));
        assert!(text.contains("0x80000000 -> 0x40000000"));
        assert!(text.contains("users=1"));
        assert!(text.contains("slot  0 0x80000000"));
    }
}
