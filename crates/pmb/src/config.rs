//! Static configuration of the PMB manager.

use crate::{SizeClass, VirtualAddress};

/// Smallest request worth a PMB mapping; smaller ones are refused outright.
pub const MIN_PMB_MAPPING_SIZE: usize = 8 << 20;

/// Start of the PMB-translated window (P1).
pub const PMB_WINDOW_START: VirtualAddress = VirtualAddress::new(0x8000_0000);

/// End of the PMB-translated window (start of P3).
pub const PMB_WINDOW_END: VirtualAddress = VirtualAddress::new(0xc000_0000);

/// How virtual addresses are chosen for new mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// First gap in the live mapping list with the required alignment and phase.
    FirstFit,
    /// Fixed tiling: the virtual address of a tile is its physical address plus `offset`.
    Tiled { offset: usize },
}

/// Configuration of a [`Pmb`](crate::Pmb) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmbConfig {
    /// First virtual address the manager may hand out.
    pub window_start: VirtualAddress,
    /// First virtual address past the managed window.
    pub window_end: VirtualAddress,
    /// Requests smaller than this fail with [`PmbError::TooSmall`](crate::PmbError::TooSmall).
    pub min_mapping_size: usize,
    /// Slot sizes the allocator may use, largest first.
    pub sizes: &'static [SizeClass],
    pub placement: Placement,
}

impl PmbConfig {
    /// Every slot size, first-fit placement over the whole P1/P2 window.
    pub const DEFAULT: PmbConfig = PmbConfig {
        window_start: PMB_WINDOW_START,
        window_end: PMB_WINDOW_END,
        min_mapping_size: MIN_PMB_MAPPING_SIZE,
        sizes: &SizeClass::ALL,
        placement: Placement::FirstFit,
    };

    /// 64 MiB tiles mapped at a constant virtual offset from their physical address.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is not 64 MiB aligned.
    pub const fn tiled_64m(offset: usize) -> Self {
        assert!(
            offset % SizeClass::Size64M.bytes() == 0,
            "tile offset must be 64M aligned"
        );
        PmbConfig {
            sizes: &[SizeClass::Size64M],
            placement: Placement::Tiled { offset },
            ..Self::DEFAULT
        }
    }

    /// Restricts the allocator to the given slot sizes.
    ///
    /// # Panics
    ///
    /// Panics if `sizes` is empty or not sorted largest first.
    pub const fn with_sizes(self, sizes: &'static [SizeClass]) -> Self {
        assert!(!sizes.is_empty(), "at least one slot size is required");
        let mut i = 1;
        while i < sizes.len() {
            assert!(
                sizes[i - 1].bytes() > sizes[i].bytes(),
                "slot sizes must be sorted largest first"
            );
            i += 1;
        }
        PmbConfig { sizes, ..self }
    }

    /// Returns the size of the managed window in bytes.
    pub const fn window_size(&self) -> usize {
        self.window_end.as_usize() - self.window_start.as_usize()
    }
}

impl Default for PmbConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
