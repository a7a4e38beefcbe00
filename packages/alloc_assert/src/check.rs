//! Memory checks that wrap a piece of code in a tracing session.

use crate::{
    Error, ExcludeSet, Result, StatisticKey, Tracer, detect_leak, detect_overload,
    filter_snapshot,
};

/// Settings shared by both checks.
#[derive(Clone, Debug, Default)]
struct Scope {
    exclude: Vec<String>,
    key: StatisticKey,
    tracer: Tracer,
}

impl Scope {
    fn exclude<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(patterns.into_iter().map(Into::into));
    }

    fn exclude_set(&self) -> Result<ExcludeSet> {
        ExcludeSet::new(&self.exclude)
    }
}

/// Checks that the memory still held after a piece of code ran stays at or below a
/// threshold at every call site.
///
/// The check records the allocations made while the code runs, including the value it
/// returns, and groups the ones still live at the end by call site. Call sites matching
/// the exclusion patterns, the Rust runtime and this crate are ignored.
///
/// [`Allocator`][crate::Allocator] must be the global allocator of the process.
///
/// # Examples
///
/// ```standalone_crate
/// use alloc_assert::{Allocator, MemoryNotExceed};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// let check = MemoryNotExceed::new(1.0);
///
/// // 128 bytes are below the threshold.
/// check.run(|| vec![0_u8; 128]);
///
/// // 4 KiB are not. Failures can be inspected instead of panicking.
/// if let Err(error) = check.check(|| vec![0_u8; 4096]) {
///     println!("{error}");
/// }
/// ```
#[derive(Clone, Debug)]
#[must_use]
pub struct MemoryNotExceed {
    threshold_kib: f64,
    scope: Scope,
}

impl MemoryNotExceed {
    /// Creates a check that fails if any call site holds more than `threshold_kib` KiB.
    pub fn new(threshold_kib: impl Into<f64>) -> Self {
        Self {
            threshold_kib: threshold_kib.into(),
            scope: Scope::default(),
        }
    }

    /// Ignores allocations whose call site filename matches any of the glob `patterns`.
    ///
    /// Can be called repeatedly, the patterns accumulate.
    pub fn exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.exclude(patterns);
        self
    }

    /// Sets how allocations are grouped before comparing with the threshold.
    pub fn key(mut self, key: StatisticKey) -> Self {
        self.scope.key = key;
        self
    }

    /// Sets how many frames of each call stack are captured and reported.
    pub fn traceback_limit(mut self, limit: usize) -> Self {
        self.scope.tracer = self.scope.tracer.traceback_limit(limit);
        self
    }

    /// Runs `f` and checks the memory it left allocated.
    ///
    /// The value returned by `f` is kept alive until the memory has been measured.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OverloadDetected`] if the threshold is exceeded at any call site.
    /// Fails before running `f` if an exclusion pattern is invalid or tracing cannot start.
    ///
    /// # Panics
    ///
    /// A panic in `f` is propagated. Tracing is stopped before unwinding continues.
    pub fn check<R>(&self, f: impl FnOnce() -> R) -> Result<()> {
        let exclude = self.scope.exclude_set()?;
        let mut session = self.scope.tracer.start()?;

        let output = f();
        let snapshot = session.take_snapshot();
        session.stop();
        drop(output);

        let snapshot = filter_snapshot(&snapshot, &exclude);
        let statistics = detect_overload(&snapshot, self.threshold_kib, self.scope.key);

        if statistics.is_empty() {
            tracing::debug!(
                threshold_kib = self.threshold_kib,
                total_size = snapshot.total_size(),
                "memory usage within threshold"
            );

            return Ok(());
        }

        Err(Error::OverloadDetected {
            threshold_kib: self.threshold_kib,
            statistics,
        })
    }

    /// Runs `f` and panics if the check fails.
    ///
    /// # Panics
    ///
    /// Panics with the details of the offending call sites if the threshold is exceeded,
    /// or if the check could not run.
    #[track_caller]
    pub fn run<R>(&self, f: impl FnOnce() -> R) {
        if let Err(error) = self.check(f) {
            panic!("{error}");
        }
    }

    /// Returns a function that runs `f` under this check each time it is called.
    pub fn wrap<F, R>(self, f: F) -> impl Fn()
    where
        F: Fn() -> R,
    {
        move || self.run(&f)
    }
}

/// Checks that a piece of code does not grow the memory held at any call site by
/// `threshold` bytes or more.
///
/// The live allocations are measured before and after the code runs. The value the code
/// returns is dropped before the second measurement, so it does not count as a leak.
/// Call sites matching the exclusion patterns, the Rust runtime and this crate are ignored.
///
/// [`Allocator`][crate::Allocator] must be the global allocator of the process.
///
/// # Examples
///
/// ```standalone_crate
/// use std::sync::Mutex;
///
/// use alloc_assert::{Allocator, MemoryNotLeak};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// static CACHE: Mutex<Vec<String>> = Mutex::new(Vec::new());
///
/// MemoryNotLeak::new().run(|| {
///     let scratch = String::from("freed before returning");
///     scratch.len()
/// });
///
/// let result = MemoryNotLeak::new().check(|| {
///     CACHE.lock().unwrap().push(String::from("kept forever"));
/// });
///
/// if let Err(error) = result {
///     println!("{error}");
/// }
/// ```
#[derive(Clone, Debug, Default)]
#[must_use]
pub struct MemoryNotLeak {
    threshold_bytes: u64,
    scope: Scope,
}

impl MemoryNotLeak {
    /// Creates a check that fails on any net growth of memory at any call site.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tolerates growth below `threshold_bytes` bytes per call site.
    pub fn threshold(mut self, threshold_bytes: u64) -> Self {
        self.threshold_bytes = threshold_bytes;
        self
    }

    /// Ignores allocations whose call site filename matches any of the glob `patterns`.
    ///
    /// Can be called repeatedly, the patterns accumulate.
    pub fn exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope.exclude(patterns);
        self
    }

    /// Sets how allocations are grouped before comparing the two measurements.
    pub fn key(mut self, key: StatisticKey) -> Self {
        self.scope.key = key;
        self
    }

    /// Sets how many frames of each call stack are captured and reported.
    pub fn traceback_limit(mut self, limit: usize) -> Self {
        self.scope.tracer = self.scope.tracer.traceback_limit(limit);
        self
    }

    /// Runs `f` and checks the memory it left allocated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeakDetected`] if memory grew by at least the threshold at any
    /// call site. Fails before running `f` if an exclusion pattern is invalid or tracing
    /// cannot start.
    ///
    /// # Panics
    ///
    /// A panic in `f` is propagated. Tracing is stopped before unwinding continues.
    pub fn check<R>(&self, f: impl FnOnce() -> R) -> Result<()> {
        let exclude = self.scope.exclude_set()?;
        let mut session = self.scope.tracer.start()?;

        let before = session.take_snapshot();
        drop(f());
        let after = session.take_snapshot();
        session.stop();

        let before = filter_snapshot(&before, &exclude);
        let after = filter_snapshot(&after, &exclude);
        let differences = detect_leak(&before, &after, self.threshold_bytes, self.scope.key);

        if differences.is_empty() {
            tracing::debug!(
                threshold_bytes = self.threshold_bytes,
                before = before.total_size(),
                after = after.total_size(),
                "no memory leak detected"
            );

            return Ok(());
        }

        Err(Error::LeakDetected {
            threshold_bytes: self.threshold_bytes,
            differences,
        })
    }

    /// Runs `f` and panics if the check fails.
    ///
    /// # Panics
    ///
    /// Panics with the details of the offending call sites if a leak is detected, or if
    /// the check could not run.
    #[track_caller]
    pub fn run<R>(&self, f: impl FnOnce() -> R) {
        if let Err(error) = self.check(f) {
            panic!("{error}");
        }
    }

    /// Returns a function that runs `f` under this check each time it is called.
    pub fn wrap<F, R>(self, f: F) -> impl Fn()
    where
        F: Fn() -> R,
    {
        move || self.run(&f)
    }
}
