//! Human-readable memory sizes.

use std::fmt;

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Formats a byte count with a binary unit, keeping 3 to 5 significant digits.
///
/// Small values are shown in bytes (`512 B`), larger ones are scaled to the first unit
/// in which they fit (`12.5 KiB`, `340 MiB`).
#[derive(Clone, Copy, Debug)]
pub(crate) struct Size {
    bytes: f64,
    signed: bool,
}

impl Size {
    #[expect(
        clippy::cast_precision_loss,
        reason = "display only, sizes beyond 2^53 bytes are not realistic"
    )]
    pub(crate) fn unsigned(bytes: u64) -> Self {
        Self {
            bytes: bytes as f64,
            signed: false,
        }
    }

    /// Always shows the sign, for size differences.
    #[expect(
        clippy::cast_precision_loss,
        reason = "display only, sizes beyond 2^53 bytes are not realistic"
    )]
    pub(crate) fn signed(bytes: i64) -> Self {
        Self {
            bytes: bytes as f64,
            signed: true,
        }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut value = self.bytes;

        for (index, unit) in UNITS.iter().enumerate() {
            let is_bytes = index == 0;
            let is_last = index == UNITS.len().wrapping_sub(1);

            if value.abs() < 100.0 && !is_bytes {
                return if self.signed {
                    write!(f, "{value:+.1} {unit}")
                } else {
                    write!(f, "{value:.1} {unit}")
                };
            }

            if value.abs() < 10.0 * 1024.0 || is_last {
                return if self.signed {
                    write!(f, "{value:+.0} {unit}")
                } else {
                    write!(f, "{value:.0} {unit}")
                };
            }

            value /= 1024.0;
        }

        unreachable!("the last unit always terminates the loop")
    }
}
