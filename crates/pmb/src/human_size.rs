//! Human-readable size formatting for mapping sizes.

use core::fmt;

const KIB: usize = 1 << 10;
const MIB: usize = 1 << 20;
const GIB: usize = 1 << 30;

/// Wraps a size in bytes and formats it in the largest binary unit that divides it exactly.
///
/// PMB sizes are whole megabytes in practice, so this prints `16M`, `96M` or `1G`
/// rather than fractional values. Sizes that are not a whole number of KiB are printed
/// in bytes.
///
/// # Examples
///
/// ```
/// use pmb::HumanSize;
///
/// assert_eq!(format!("{}", HumanSize(0)), "0");
/// assert_eq!(format!("{}", HumanSize(16 << 20)), "16M");
/// assert_eq!(format!("{}", HumanSize(96 << 20)), "96M");
/// assert_eq!(format!("{}", HumanSize(1 << 30)), "1G");
/// assert_eq!(format!("{}", HumanSize(1536 << 10)), "1536K");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HumanSize(pub usize);

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes == 0 {
            return f.write_str("0");
        }

        for (unit, suffix) in [(GIB, "G"), (MIB, "M"), (KIB, "K")] {
            if bytes % unit == 0 {
                return write!(f, "{}{}", bytes / unit, suffix);
            }
        }

        write!(f, "{}", bytes)
    }
}
