#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # PMB manager
//!
//! Management of the SH-4 Privileged space Mapping Buffer (PMB), the sixteen
//! slot translation array that maps the 32-bit kernel address space onto
//! physical memory in 16M, 64M, 128M and 512M units. It provides:
//!
//! - Tiling of arbitrary physical ranges into a chain of slots, with
//!   reference-counted reuse of existing mappings.
//! - Virtual address placement inside the PMB window.
//! - Register programming from uncached execution.
//! - Takeover of the bootloader's slots at kernel start.
//! - Restoration after suspend, including a replay table for early resume code.
//!
//! Hardware access goes through [`PmbHardware`]. A software emulation is
//! available for tests and host tools with the `software-emulation` feature.

mod address;
pub mod arch;
mod boot;
mod calc;
mod config;
mod entry;
mod flags;
mod hom;
mod human_size;
mod manager;
mod mapping;
mod slots;

pub use address::{PhysicalAddress, VirtualAddress};
pub use arch::{PmbHardware, UncachedSection};
pub use boot::{BootLayout, UNCACHED_WINDOW_SIZE};
pub use config::{
    MIN_PMB_MAPPING_SIZE, PMB_WINDOW_END, PMB_WINDOW_START, Placement, PmbConfig,
};
pub use entry::{PMB_PN_MASK, PmbEntry, RawSlot};
pub use flags::{PMB_V, PmbFlags, SizeClass};
pub use hom::{HomEntry, HomTable};
pub use human_size::HumanSize;
pub use manager::{MappingInfo, Pmb, PmbError, PmbSnapshot};
pub use mapping::{MappingId, MappingTable, PmbMapping};
pub use slots::{NR_PMB_ENTRIES, Slot, SlotMap};
