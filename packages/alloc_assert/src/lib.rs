#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Assertions on the heap memory that code under test keeps allocated, attributed to the
//! source locations that allocated it.
//!
//! The package offers two checks:
//!
//! - [`MemoryNotExceed`] fails if any call site still holds more than a threshold in KiB
//!   after the code under test ran.
//! - [`MemoryNotLeak`] fails if the memory held by any call site grew by at least a
//!   threshold in bytes while the code under test ran.
//!
//! Both are also available as attribute macros for test functions, see
//! [`memory_not_exceed`] and [`memory_not_leak`].
//!
//! Allocations are recorded by [`Allocator`], which must be registered as the global
//! allocator of the test binary. Allocations made by the Rust runtime, by unresolvable
//! code and by this package are ignored, as are allocations whose call site matches a
//! caller-supplied glob pattern.
//!
//! This package is not meant for use in production, serving only as a development tool.
//!
//! # Usage
//!
//! ```standalone_crate
//! use alloc_assert::{Allocator, MemoryNotExceed, MemoryNotLeak};
//!
//! #[global_allocator]
//! static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
//!
//! fn build_index() -> Vec<u64> {
//!     (0..100).collect()
//! }
//!
//! fn main() {
//!     // The index takes 800 bytes, well below 4 KiB.
//!     MemoryNotExceed::new(4.0).run(build_index);
//!
//!     // Building the index leaves nothing behind once the index is dropped.
//!     MemoryNotLeak::new().run(build_index);
//! }
//! ```
//!
//! # Lower-level building blocks
//!
//! The checks are built from parts that can also be used directly:
//!
//! - [`Tracer`] starts a [`TracingSession`] that records live allocations and takes
//!   [`Snapshot`]s of them.
//! - [`filter_snapshot`] removes traces whose call site matches an [`ExcludeSet`].
//! - [`detect_overload`] and [`detect_leak`] compare [`Statistic`]s grouped by
//!   [`StatisticKey`] against thresholds.
//!
//! # Tracing sessions
//!
//! Only one tracing session can be active in a process at a time, and it records the
//! allocations of all threads. Tests that use the checks must therefore not run in parallel
//! with each other or with other allocating tests of the same binary, for example by
//! running them with `--test-threads=1` or by taking turns on a shared
//! `std::sync::Mutex`. Waiting on a standard mutex does not allocate, so a test that is
//! waiting for its turn does not show up in the measurements of the running one.
//!
//! # Miri compatibility
//!
//! Miri replaces the global allocator with its own logic, so you cannot execute code that uses
//! this package under Miri.

mod allocator;
mod check;
mod detect;
mod error;
mod filter;
mod format;
mod snapshot;
mod tracer;

pub use allocator::{Allocator, is_tracing, untracked};
pub use check::*;
pub use detect::*;
pub use error::*;
pub use filter::{ExcludeSet, filter_snapshot};
pub use snapshot::*;
pub use tracer::{Tracer, TracingSession};

/// Runs the annotated test function under a [`MemoryNotExceed`] check.
///
/// Arguments:
///
/// - `threshold` (required): the threshold in KiB per call site.
/// - `exclude`: a glob pattern or an array of glob patterns for call sites to ignore.
/// - `key`: a [`StatisticKey`] variant name to group allocations by.
/// - `traceback_limit`: how many frames of each call stack to capture.
///
/// The function must not be `async` and must return `()`.
///
/// ```standalone_crate
/// use alloc_assert::{Allocator, memory_not_exceed};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// #[memory_not_exceed(threshold = 1.0, exclude = "*/generated/*")]
/// fn small_buffer() {
///     let buffer = vec![0_u8; 256];
///     assert_eq!(buffer.len(), 256);
/// }
///
/// small_buffer();
/// ```
#[cfg(feature = "macros")]
pub use alloc_assert_macros::memory_not_exceed;
/// Runs the annotated test function under a [`MemoryNotLeak`] check.
///
/// Arguments:
///
/// - `threshold`: the tolerated growth in bytes per call site, 0 if omitted.
/// - `exclude`: a glob pattern or an array of glob patterns for call sites to ignore.
/// - `key`: a [`StatisticKey`] variant name to group allocations by.
/// - `traceback_limit`: how many frames of each call stack to capture.
///
/// The function must not be `async` and must return `()`.
///
/// ```standalone_crate
/// use alloc_assert::{Allocator, memory_not_leak};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// #[memory_not_leak(threshold = 64, key = Filename)]
/// fn temporary_buffer() {
///     let buffer = vec![0_u8; 4096];
///     drop(buffer);
/// }
///
/// temporary_buffer();
/// ```
#[cfg(feature = "macros")]
pub use alloc_assert_macros::memory_not_leak;
