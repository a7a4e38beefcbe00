use std::fmt::{self, Display, Write as _};

use thiserror::Error;

use crate::{Statistic, StatisticDiff};

/// Errors reported by the memory checks and the tracer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Memory still held after the checked code ran exceeds the threshold at one or more
    /// call sites.
    #[error(
        "memory usage exceeded {threshold_kib} KiB at {} call site(s):\n{}",
        .statistics.len(),
        Entries(.statistics)
    )]
    OverloadDetected {
        /// The threshold that was exceeded, in KiB.
        threshold_kib: f64,

        /// Every call site above the threshold, biggest first.
        statistics: Vec<Statistic>,
    },

    /// Memory held at one or more call sites grew by at least the threshold while the
    /// checked code ran.
    #[error(
        "memory leak detected at {} call site(s) (threshold {threshold_bytes} bytes):\n{}",
        .differences.len(),
        Entries(.differences)
    )]
    LeakDetected {
        /// The growth threshold, in bytes.
        threshold_bytes: u64,

        /// Every call site that grew by at least the threshold, biggest growth first.
        differences: Vec<StatisticDiff>,
    },

    /// A tracing session was requested while another one is active in this process.
    #[error("an allocation tracing session is already active in this process")]
    SessionAlreadyActive,

    /// The tracking allocator is not registered as the global allocator, so nothing
    /// could ever be recorded.
    #[error(
        "alloc_assert::Allocator is not the global allocator; register it with #[global_allocator]"
    )]
    AllocatorNotInstalled,

    /// An exclusion pattern is not a valid glob pattern.
    #[error("invalid exclusion pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The pattern as given by the caller.
        pattern: String,

        /// Why the pattern was rejected.
        source: glob::PatternError,
    },
}

/// A specialized `Result` type for `alloc_assert` operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;

/// Lists offending entries, each with its call site summary followed by its traceback.
struct Entries<'a, T>(&'a [T]);

trait Offender: Display {
    fn traceback(&self) -> &crate::Traceback;

    fn summary(&self) -> String {
        self.to_string()
    }
}

impl Offender for Statistic {
    fn traceback(&self) -> &crate::Traceback {
        Self::traceback(self)
    }

    // The threshold is given in KiB, so the size is repeated in the same unit.
    fn summary(&self) -> String {
        format!("{self} ({:.1} KiB)", self.size_kib())
    }
}

impl Offender for StatisticDiff {
    fn traceback(&self) -> &crate::Traceback {
        Self::traceback(self)
    }
}

impl<T: Offender> Display for Entries<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = String::new();

        for entry in self.0 {
            writeln!(text, "  {}", entry.summary())?;
            writeln!(text, "{}", entry.traceback())?;
        }

        f.write_str(text.trim_end())
    }
}
