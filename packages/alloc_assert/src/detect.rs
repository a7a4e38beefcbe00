//! Threshold checks over snapshot statistics.

use crate::{Snapshot, Statistic, StatisticDiff, StatisticKey};

/// Returns the statistics of `snapshot` whose size in KiB is strictly above `threshold_kib`.
///
/// The snapshot is expected to be filtered already. An empty snapshot yields no statistics.
///
/// # Examples
///
/// ```
/// use alloc_assert::{Frame, Snapshot, StatisticKey, Trace, Traceback, detect_overload};
///
/// let snapshot = Snapshot::new(
///     [
///         Trace::new(4096, Traceback::new([Frame::new("big.rs", 1)])),
///         Trace::new(16, Traceback::new([Frame::new("small.rs", 1)])),
///     ],
///     1,
/// );
///
/// let overloads = detect_overload(&snapshot, 1.0, StatisticKey::Lineno);
///
/// assert_eq!(overloads.len(), 1);
/// assert_eq!(overloads[0].traceback().call_site().filename(), "big.rs");
/// ```
#[must_use]
pub fn detect_overload(
    snapshot: &Snapshot,
    threshold_kib: f64,
    key: StatisticKey,
) -> Vec<Statistic> {
    snapshot
        .statistics(key)
        .into_iter()
        .filter(|statistic| statistic.size_kib() > threshold_kib)
        .collect()
}

/// Returns the call sites whose size grew from `before` to `after` by at least
/// `threshold_bytes`.
///
/// Only growth counts: call sites that shrank or stayed the same are never reported,
/// whatever the threshold. Call sites that appear only in `after` grew from zero.
/// Both snapshots are expected to be filtered already.
#[must_use]
pub fn detect_leak(
    before: &Snapshot,
    after: &Snapshot,
    threshold_bytes: u64,
    key: StatisticKey,
) -> Vec<StatisticDiff> {
    after
        .compare_to(before, key)
        .into_iter()
        .filter(|diff| {
            u64::try_from(diff.size_diff())
                .is_ok_and(|growth| growth > 0 && growth >= threshold_bytes)
        })
        .collect()
}
