//! Tracing sessions over the allocations recorded by [`Allocator`][crate::Allocator].

use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use foldhash::HashMap;

use crate::allocator::{self, CAPTURE_MODULE, MAX_CAPTURED_FRAMES};
use crate::filter::RUNTIME_PATH_PREFIXES;
use crate::{Error, Frame, Result, Snapshot, Trace, Traceback, untracked};

// Symbols of the allocation entry points that sit between the allocator hooks and the code
// that requested the memory. Recent compilers place the shims in a `__rustc` namespace and
// attribute them to the line of the `#[global_allocator]` static.
const ALLOCATION_SHIM_PREFIXES: [&str; 5] =
    ["backtrace::", "__rustc::", "__rust_", "__rg_", "__rdl_"];

/// Configures and starts allocation tracing sessions.
///
/// # Examples
///
/// ```standalone_crate
/// use alloc_assert::{Allocator, Tracer};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// let mut session = Tracer::new().traceback_limit(4).start().unwrap();
///
/// let data = vec![0_u8; 4096];
/// let snapshot = session.take_snapshot();
/// session.stop();
///
/// assert!(snapshot.total_size() >= 4096);
/// drop(data);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tracer {
    traceback_limit: usize,
}

impl Tracer {
    /// Creates a tracer that keeps only the call site of each allocation.
    #[must_use]
    pub const fn new() -> Self {
        Self { traceback_limit: 1 }
    }

    /// Sets how many frames of each call stack are kept in snapshots.
    ///
    /// The value is clamped to `1..=64`.
    #[must_use]
    pub fn traceback_limit(mut self, limit: usize) -> Self {
        self.traceback_limit = limit.clamp(1, MAX_CAPTURED_FRAMES);
        self
    }

    /// Starts recording allocations of the whole process.
    ///
    /// Recording stops when the returned session is stopped or dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocatorNotInstalled`] if [`Allocator`][crate::Allocator] is not
    /// the global allocator and [`Error::SessionAlreadyActive`] if another session is
    /// active in this process.
    pub fn start(self) -> Result<TracingSession> {
        if !allocator::is_installed() {
            return Err(Error::AllocatorNotInstalled);
        }

        if !allocator::begin() {
            return Err(Error::SessionAlreadyActive);
        }

        untracked(|| {
            tracing::debug!(
                traceback_limit = self.traceback_limit,
                "allocation tracing started"
            );
        });

        Ok(TracingSession {
            traceback_limit: self.traceback_limit,
            resolved: HashMap::default(),
        })
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

/// An active allocation tracing session.
///
/// Only one session can be active in a process at a time. Dropping the session stops
/// tracing, also when the thread is unwinding.
#[derive(Debug)]
pub struct TracingSession {
    traceback_limit: usize,

    // Symbols are resolved once per instruction pointer and reused by later snapshots.
    resolved: HashMap<usize, Arc<[ResolvedFrame]>>,
}

impl TracingSession {
    /// The number of frames kept per traceback.
    #[must_use]
    pub fn traceback_limit(&self) -> usize {
        self.traceback_limit
    }

    /// Captures every allocation that is live right now and was made during this session.
    pub fn take_snapshot(&mut self) -> Snapshot {
        untracked(|| {
            let mut traces = Vec::new();

            for (stack, sizes) in allocator::live_allocations_by_stack() {
                let traceback = self.traceback_of(&stack);

                traces.extend(sizes.into_iter().map(|size| {
                    let size = u64::try_from(size).expect("usize always fits into u64");
                    Trace::new(size, traceback.clone())
                }));
            }

            let snapshot = Snapshot::new(traces, self.traceback_limit);

            tracing::trace!(
                traces = snapshot.traces().len(),
                total_size = snapshot.total_size(),
                "snapshot taken"
            );

            snapshot
        })
    }

    /// Stops tracing. Equivalent to dropping the session.
    pub fn stop(self) {
        drop(self);
    }

    fn traceback_of(&mut self, stack: &[usize]) -> Traceback {
        let mut frames = Vec::with_capacity(stack.len());

        for &ip in stack {
            let resolved = self.resolved.entry(ip).or_insert_with(|| resolve(ip));
            frames.extend(resolved.iter().cloned());
        }

        normalize(&frames, self.traceback_limit)
    }
}

impl Drop for TracingSession {
    fn drop(&mut self) {
        allocator::end();

        untracked(|| tracing::debug!("allocation tracing stopped"));
    }
}

/// A source location resolved from an instruction pointer.
///
/// One instruction pointer may resolve to several of these when functions were inlined.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct ResolvedFrame {
    symbol: Option<Arc<str>>,
    filename: Option<Arc<str>>,
    lineno: u32,
}

impl ResolvedFrame {
    fn is_unresolved(&self) -> bool {
        self.filename.is_none()
    }

    fn is_capture(&self) -> bool {
        self.symbol.as_deref().is_some_and(|symbol| {
            let symbol = symbol.trim_start_matches('<');

            symbol.starts_with(CAPTURE_MODULE)
                || ALLOCATION_SHIM_PREFIXES
                    .iter()
                    .any(|prefix| symbol.starts_with(prefix))
        })
    }

    fn is_runtime(&self) -> bool {
        self.filename.as_deref().is_some_and(|filename| {
            RUNTIME_PATH_PREFIXES
                .iter()
                .any(|prefix| filename.starts_with(prefix))
        })
    }

    fn is_user_code(&self) -> bool {
        !self.is_unresolved() && !self.is_runtime()
    }

    fn to_frame(&self) -> Frame {
        match &self.filename {
            Some(filename) => Frame::new(filename, self.lineno),
            None => Frame::unknown(),
        }
    }
}

fn resolve(ip: usize) -> Arc<[ResolvedFrame]> {
    let mut frames = Vec::new();

    backtrace::resolve(ptr::without_provenance_mut::<c_void>(ip), |symbol| {
        frames.push(ResolvedFrame {
            symbol: symbol.name().map(|name| format!("{name:#}").into()),
            filename: symbol
                .filename()
                .map(|path| path.to_string_lossy().into()),
            lineno: symbol.lineno().unwrap_or(0),
        });
    });

    if frames.is_empty() {
        frames.push(ResolvedFrame::default());
    }

    frames.into()
}

/// Turns a resolved call stack into the traceback reported for an allocation.
///
/// Frames of the allocation hooks and unresolved frames on top of the stack are dropped.
/// Rust runtime frames on top are dropped as well, unless nothing but runtime frames remains.
pub(crate) fn normalize(frames: &[ResolvedFrame], limit: usize) -> Traceback {
    let requester = frames
        .iter()
        .position(|frame| !frame.is_capture() && !frame.is_unresolved())
        .unwrap_or(frames.len());
    let frames = frames.get(requester..).unwrap_or_default();

    let frames = match frames.iter().position(ResolvedFrame::is_user_code) {
        Some(first_user) => frames.get(first_user..).unwrap_or_default(),
        None => frames,
    };

    Traceback::new(frames.iter().take(limit).map(ResolvedFrame::to_frame))
}
