//! Slot size classes and cache attribute flags.
//!
//! Both end up in the data word of a PMB slot:
//!
//! ```text
//!  31      24 23      10   9    8    7    4    3    0
//! +----------+----------+----+----+----+----+----+----+
//! |   PPN    | reserved | UB | V  | SZ1| SZ0| C  | WT |
//! +----------+----------+----+----+----+----+----+----+
//! ```

use core::fmt;

use crate::HumanSize;

/// Valid bit, present in both the address and the data word.
pub const PMB_V: u32 = 1 << 8;

/// Mask of the size bits in the data word.
const SIZE_MASK: u32 = 0x090;

/// Mask of the attribute bits a mapping may carry.
const FLAGS_MASK: u32 = PmbFlags::CACHED.0 | PmbFlags::WRITE_THROUGH.0 | PmbFlags::UNBUFFERED.0;

/// One of the four page sizes a PMB slot can translate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeClass {
    Size16M,
    Size64M,
    Size128M,
    Size512M,
}

impl SizeClass {
    /// Every size class, largest first.
    pub const ALL: [SizeClass; 4] = [
        SizeClass::Size512M,
        SizeClass::Size128M,
        SizeClass::Size64M,
        SizeClass::Size16M,
    ];

    /// Returns the number of bytes a slot of this class translates.
    pub const fn bytes(self) -> usize {
        match self {
            SizeClass::Size16M => 16 << 20,
            SizeClass::Size64M => 64 << 20,
            SizeClass::Size128M => 128 << 20,
            SizeClass::Size512M => 512 << 20,
        }
    }

    /// Returns the size bits of the data word.
    pub const fn to_bits(self) -> u32 {
        match self {
            SizeClass::Size16M => 0x000,
            SizeClass::Size64M => 0x010,
            SizeClass::Size128M => 0x080,
            SizeClass::Size512M => 0x090,
        }
    }

    /// Decodes the size bits of a data word.
    pub const fn from_bits(data: u32) -> Self {
        match data & SIZE_MASK {
            0x010 => SizeClass::Size64M,
            0x080 => SizeClass::Size128M,
            0x090 => SizeClass::Size512M,
            _ => SizeClass::Size16M,
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HumanSize(self.bytes()))
    }
}

/// Cache and write-buffer attributes of a mapping.
///
/// The empty set means uncached and buffered. Two requests can only share a
/// mapping if their flags are identical.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PmbFlags(u32);

impl PmbFlags {
    /// Write-through (only meaningful together with `CACHED`).
    pub const WRITE_THROUGH: PmbFlags = PmbFlags(1 << 0);

    /// Cacheable.
    pub const CACHED: PmbFlags = PmbFlags(1 << 3);

    /// Unbuffered writes.
    pub const UNBUFFERED: PmbFlags = PmbFlags(1 << 9);

    /// Uncached, buffered.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Keeps only the attribute bits of a raw data word.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & FLAGS_MASK)
    }

    /// Returns the raw bits.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Returns the union of both flag sets.
    pub const fn union(self, other: PmbFlags) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns whether every bit of `other` is set.
    pub const fn contains(self, other: PmbFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_cached(self) -> bool {
        self.contains(Self::CACHED)
    }
}

impl core::ops::BitOr for PmbFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for PmbFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PmbFlags({})", self)
    }
}

impl fmt::Display for PmbFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = if !self.is_cached() {
            "uncached"
        } else if self.contains(Self::WRITE_THROUGH) {
            "wt"
        } else {
            "cached"
        };
        f.write_str(cache)?;
        if self.contains(Self::UNBUFFERED) {
            f.write_str(",ub")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_bits_round_trip_through_data_word() {
        for class in SizeClass::ALL {
            let data = 0x4000_0000 | class.to_bits() | PMB_V | PmbFlags::CACHED.to_raw();
            assert_eq!(SizeClass::from_bits(data), class);
        }
    }

    #[test]
    fn size_classes_are_ordered_largest_first() {
        assert!(SizeClass::ALL.windows(2).all(|w| w[0].bytes() > w[1].bytes()));
    }

    #[test]
    fn flags_ignore_non_attribute_bits() {
        let data = 0x4000_0000 | PMB_V | SizeClass::Size512M.to_bits() | 0x8;
        assert_eq!(PmbFlags::from_raw(data), PmbFlags::CACHED);
    }

    #[test]
    fn flags_display() {
        assert_eq!(format!("{}", PmbFlags::empty()), "uncached");
        assert_eq!(format!("{}", PmbFlags::CACHED), "cached");
        assert_eq!(
            format!("{}", PmbFlags::CACHED | PmbFlags::WRITE_THROUGH),
            "wt"
        );
        assert_eq!(format!("{}", PmbFlags::UNBUFFERED), "uncached,ub");
    }
}
