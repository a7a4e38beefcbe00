//! Point-in-time captures of live allocations and the statistics derived from them.

use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;

use foldhash::HashMap;

use crate::format::Size;

const UNKNOWN_FILENAME: &str = "<unknown>";

/// One stack frame of an allocation's call stack.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Frame {
    filename: Arc<str>,
    lineno: u32,
}

impl Frame {
    /// Creates a frame. Path separators in `filename` are normalized to `/`.
    #[must_use]
    pub fn new(filename: impl AsRef<str>, lineno: u32) -> Self {
        Self {
            filename: normalize_path(filename.as_ref()).into(),
            lineno,
        }
    }

    /// A frame whose source location could not be resolved.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            filename: UNKNOWN_FILENAME.into(),
            lineno: 0,
        }
    }

    /// The source file of the frame, with `/` as path separator.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The line number in the source file, or 0 if unknown.
    #[must_use]
    pub fn lineno(&self) -> u32 {
        self.lineno
    }

    /// Whether the source location of this frame could not be resolved.
    #[must_use]
    pub fn is_unknown(&self) -> bool {
        &*self.filename == UNKNOWN_FILENAME
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.lineno)
    }
}

pub(crate) fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// The call stack of an allocation, innermost frame (the call site) first.
///
/// A traceback always has at least one frame.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Traceback {
    frames: Arc<[Frame]>,
}

impl Traceback {
    /// Creates a traceback from frames ordered innermost first.
    ///
    /// An empty sequence results in a traceback with a single unknown frame.
    #[must_use]
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        let mut frames: Vec<Frame> = frames.into_iter().collect();

        if frames.is_empty() {
            frames.push(Frame::unknown());
        }

        Self {
            frames: frames.into(),
        }
    }

    /// The innermost frame, identifying where the allocation was requested.
    #[must_use]
    pub fn call_site(&self) -> &Frame {
        self.frames
            .first()
            .expect("a traceback always has at least one frame")
    }

    /// All frames, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, frame) in self.frames.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }

            write!(f, "    at {frame}")?;
        }

        Ok(())
    }
}

/// A single live allocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Trace {
    size: u64,
    traceback: Traceback,
}

impl Trace {
    /// Creates a trace of a live allocation of `size` bytes.
    #[must_use]
    pub fn new(size: u64, traceback: Traceback) -> Self {
        Self { size, traceback }
    }

    /// Size of the allocation in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Where the allocation was requested.
    #[must_use]
    pub fn traceback(&self) -> &Traceback {
        &self.traceback
    }
}

/// How traces are grouped into statistics.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum StatisticKey {
    /// One statistic per source file of the call site.
    Filename,

    /// One statistic per source line of the call site.
    #[default]
    Lineno,

    /// One statistic per distinct traceback (up to the traceback limit of the snapshot).
    Traceback,
}

impl StatisticKey {
    fn group(self, traceback: &Traceback) -> Traceback {
        match self {
            Self::Filename => Traceback::new([Frame {
                filename: Arc::clone(&traceback.call_site().filename),
                lineno: 0,
            }]),
            Self::Lineno => Traceback::new([traceback.call_site().clone()]),
            Self::Traceback => traceback.clone(),
        }
    }
}

/// An immutable capture of the live allocations at one instant.
///
/// Snapshots are taken with [`TracingSession::take_snapshot()`][crate::TracingSession::take_snapshot]
/// or assembled from traces with [`Snapshot::new()`]. Filtering a snapshot produces a new one.
#[derive(Clone, Debug)]
pub struct Snapshot {
    traces: Arc<[Trace]>,
    traceback_limit: usize,
}

impl Snapshot {
    /// Creates a snapshot from explicit traces.
    #[must_use]
    pub fn new(traces: impl IntoIterator<Item = Trace>, traceback_limit: usize) -> Self {
        Self {
            traces: traces.into_iter().collect(),
            traceback_limit,
        }
    }

    /// All traces in the snapshot, in no particular order.
    #[must_use]
    pub fn traces(&self) -> &[Trace] {
        &self.traces
    }

    /// Maximum number of frames stored per traceback when the snapshot was taken.
    #[must_use]
    pub fn traceback_limit(&self) -> usize {
        self.traceback_limit
    }

    /// Whether the snapshot holds no traces.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Sum of the sizes of all traces in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.traces
            .iter()
            .fold(0_u64, |total, trace| total.saturating_add(trace.size))
    }

    /// Keeps only the traces for which `predicate` returns `true`.
    #[must_use]
    pub(crate) fn retain(&self, mut predicate: impl FnMut(&Trace) -> bool) -> Self {
        Self {
            traces: self
                .traces
                .iter()
                .filter(|&trace| predicate(trace))
                .cloned()
                .collect(),
            traceback_limit: self.traceback_limit,
        }
    }

    /// Groups the traces by `key`.
    ///
    /// Statistics are sorted from the biggest to the smallest size.
    #[must_use]
    pub fn statistics(&self, key: StatisticKey) -> Vec<Statistic> {
        let mut statistics: Vec<Statistic> = self
            .group(key)
            .into_iter()
            .map(|(traceback, (size, count))| Statistic {
                traceback,
                size,
                count,
            })
            .collect();

        statistics.sort_by(|a, b| {
            (b.size, b.count, &b.traceback).cmp(&(a.size, a.count, &a.traceback))
        });

        statistics
    }

    /// Computes the per-key differences from an `older` snapshot to this one.
    ///
    /// Keys present in only one of the snapshots are compared against zero. Differences are
    /// sorted from the biggest to the smallest absolute size difference.
    #[must_use]
    pub fn compare_to(&self, older: &Self, key: StatisticKey) -> Vec<StatisticDiff> {
        let mut previous = older.group(key);

        let mut differences: Vec<StatisticDiff> = self
            .group(key)
            .into_iter()
            .map(|(traceback, (size, count))| {
                let (old_size, old_count) = previous.remove(&traceback).unwrap_or_default();
                StatisticDiff::new(traceback, (size, count), (old_size, old_count))
            })
            .collect();

        differences.extend(
            previous
                .into_iter()
                .map(|(traceback, old)| StatisticDiff::new(traceback, (0, 0), old)),
        );

        differences.sort_by_key(|diff| {
            Reverse((
                diff.size_diff.unsigned_abs(),
                diff.size,
                diff.count_diff.unsigned_abs(),
                diff.count,
                diff.traceback.clone(),
            ))
        });

        differences
    }

    /// Sums size and count per grouping key.
    fn group(&self, key: StatisticKey) -> HashMap<Traceback, (u64, u64)> {
        let mut groups: HashMap<Traceback, (u64, u64)> = HashMap::default();

        for trace in &*self.traces {
            let (size, count) = groups.entry(key.group(&trace.traceback)).or_default();
            *size = size.saturating_add(trace.size);
            *count = count.saturating_add(1);
        }

        groups
    }
}

/// Live allocations grouped under one key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Statistic {
    traceback: Traceback,
    size: u64,
    count: u64,
}

impl Statistic {
    /// The grouping key.
    #[must_use]
    pub fn traceback(&self) -> &Traceback {
        &self.traceback
    }

    /// Total size of the grouped allocations in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Total size of the grouped allocations in KiB.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        reason = "threshold comparison in KiB tolerates rounding of huge sizes"
    )]
    pub fn size_kib(&self) -> f64 {
        self.size as f64 / 1024.0
    }

    /// Number of grouped allocations.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: size={}, count={}",
            self.traceback.call_site(),
            Size::unsigned(self.size),
            self.count
        )?;

        if let Some(average) = self.size.checked_div(self.count) {
            write!(f, ", average={}", Size::unsigned(average))?;
        }

        Ok(())
    }
}

/// Difference of one grouping key between two snapshots.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StatisticDiff {
    traceback: Traceback,
    size: u64,
    size_diff: i64,
    count: u64,
    count_diff: i64,
}

impl StatisticDiff {
    fn new(
        traceback: Traceback,
        (size, count): (u64, u64),
        (old_size, old_count): (u64, u64),
    ) -> Self {
        Self {
            traceback,
            size,
            size_diff: signed_difference(size, old_size),
            count,
            count_diff: signed_difference(count, old_count),
        }
    }

    /// The grouping key.
    #[must_use]
    pub fn traceback(&self) -> &Traceback {
        &self.traceback
    }

    /// Total size in bytes in the newer snapshot.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size change in bytes from the older to the newer snapshot.
    #[must_use]
    pub fn size_diff(&self) -> i64 {
        self.size_diff
    }

    /// Number of allocations in the newer snapshot.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Change in the number of allocations from the older to the newer snapshot.
    #[must_use]
    pub fn count_diff(&self) -> i64 {
        self.count_diff
    }
}

impl fmt::Display for StatisticDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: size={} ({}), count={} ({:+})",
            self.traceback.call_site(),
            Size::unsigned(self.size),
            Size::signed(self.size_diff),
            self.count,
            self.count_diff
        )
    }
}

fn signed_difference(new: u64, old: u64) -> i64 {
    if new >= old {
        new.checked_sub(old)
            .and_then(|diff| i64::try_from(diff).ok())
            .unwrap_or(i64::MAX)
    } else {
        old.checked_sub(new)
            .and_then(|diff| i64::try_from(diff).ok())
            .and_then(i64::checked_neg)
            .unwrap_or(i64::MIN)
    }
}
