//! Allocation wrapper that records live allocations while a tracing session is active.

use std::alloc::{GlobalAlloc, Layout};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use foldhash::HashMap;

/// Upper bound on the number of raw stack frames captured for one allocation.
pub(crate) const MAX_CAPTURED_FRAMES: usize = 64;

/// Module path of the allocation hooks, used to strip their frames from captured stacks.
pub(crate) const CAPTURE_MODULE: &str = module_path!();

/// Instruction pointers of the stack that requested an allocation, innermost first.
pub(crate) type RawStack = Box<[usize]>;

#[derive(Debug)]
struct RawTrace {
    size: usize,
    stack: RawStack,
}

type TraceTable = HashMap<usize, RawTrace>;

// Set by the first allocation served through `Allocator`, which tells us it is registered
// as the global allocator.
static INSTALLED: AtomicBool = AtomicBool::new(false);

// Checked on every allocation before anything else is done.
static TRACING: AtomicBool = AtomicBool::new(false);

// Live allocations of the active session keyed by address. `None` while no session is active.
static TRACES: Mutex<Option<TraceTable>> = Mutex::new(None);

thread_local! {
    // Set while allocations on this thread must not be recorded: inside `untracked()` and
    // while the tracer itself captures stacks, builds snapshots or resolves symbols.
    static IN_TRACER: Cell<bool> = const { Cell::new(false) };

    // Set while this thread holds `TRACES`. The allocator must not touch the table when it
    // is re-entered from inside a table operation.
    //
    // Both flags are const-initialized and need no drop, so they stay accessible while the
    // thread runs the destructors of other thread-locals.
    static HOLDS_TABLE: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` without recording any allocation it makes on the current thread.
///
/// Memory allocated inside `f` is invisible to snapshots, also after `f` returns. This is
/// meant for test scaffolding that must not be attributed to the code under test.
/// Deallocations inside `f` are still observed.
///
/// # Examples
///
/// ```standalone_crate
/// use alloc_assert::{Allocator, MemoryNotLeak, untracked};
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
///
/// let mut cache = Vec::new();
///
/// MemoryNotLeak::new().run(|| {
///     untracked(|| cache.push(String::from("warm-up entry")));
/// });
/// ```
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let previous = IN_TRACER.with(|flag| flag.replace(true));
    let _restore = scopeguard::guard(previous, |previous| {
        IN_TRACER.with(|flag| flag.set(previous));
    });

    f()
}

/// Whether an allocation tracing session is active in this process.
#[must_use]
pub fn is_tracing() -> bool {
    TRACING.load(Ordering::Relaxed)
}

pub(crate) fn is_installed() -> bool {
    INSTALLED.load(Ordering::Relaxed)
}

/// Installs an empty trace table and starts recording.
///
/// Returns `false` without side effects if a session is already active.
pub(crate) fn begin() -> bool {
    untracked(|| {
        with_table(|traces| {
            if traces.is_some() {
                return false;
            }

            *traces = Some(TraceTable::default());
            TRACING.store(true, Ordering::Release);
            true
        })
        .unwrap_or(false)
    })
}

/// Stops recording and discards the trace table.
pub(crate) fn end() {
    untracked(|| {
        TRACING.store(false, Ordering::Release);
        let table = with_table(Option::take).flatten();
        drop(table);
    });
}

/// Groups the currently live allocations by their raw stack.
///
/// Returns the sizes of the live allocations that share each distinct stack.
pub(crate) fn live_allocations_by_stack() -> Vec<(RawStack, Vec<usize>)> {
    untracked(|| {
        with_table(|traces| {
            let Some(table) = traces.as_ref() else {
                return Vec::new();
            };

            let mut groups: HashMap<&[usize], Vec<usize>> = HashMap::default();
            for trace in table.values() {
                groups.entry(&*trace.stack).or_default().push(trace.size);
            }

            groups
                .into_iter()
                .map(|(stack, sizes)| (RawStack::from(stack), sizes))
                .collect()
        })
        .unwrap_or_default()
    })
}

// Poisoning is ignored: panicking inside the global allocator aborts the process.
fn lock_traces() -> MutexGuard<'static, Option<TraceTable>> {
    TRACES.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `f` with exclusive access to the trace table.
///
/// Returns `None` if this thread already holds the table, which happens when the allocator
/// is re-entered from inside `f`, or if the thread-local flag is no longer accessible.
///
/// The table is not locked without the flag, as the lock could already be held further up
/// the stack. A deallocation skipped this way leaves its entry in the table until the
/// address is handed out again, so it is reported as live memory in the meantime.
fn with_table<R>(f: impl FnOnce(&mut Option<TraceTable>) -> R) -> Option<R> {
    HOLDS_TABLE
        .try_with(|holds| {
            if holds.replace(true) {
                return None;
            }

            let result = f(&mut lock_traces());
            holds.set(false);
            Some(result)
        })
        .ok()
        .flatten()
}

fn capture_stack() -> RawStack {
    let mut ips = [0_usize; MAX_CAPTURED_FRAMES];
    let mut len = 0_usize;

    backtrace::trace(|frame| {
        let Some(slot) = ips.get_mut(len) else {
            return false;
        };

        *slot = frame.ip().addr();
        len = len.wrapping_add(1);
        true
    });

    RawStack::from(ips.get(..len).unwrap_or_default())
}

fn record_allocation(address: usize, size: usize) {
    if !TRACING.load(Ordering::Relaxed) {
        return;
    }

    // The thread-local is gone during thread teardown, in which case nothing is recorded.
    let Ok(false) = IN_TRACER.try_with(|flag| flag.replace(true)) else {
        return;
    };

    let stack = capture_stack();

    with_table(|traces| {
        if let Some(table) = traces.as_mut() {
            table.insert(address, RawTrace { size, stack });
        }
    });

    _ = IN_TRACER.try_with(|flag| flag.set(false));
}

fn forget_allocation(address: usize) -> Option<RawTrace> {
    if !TRACING.load(Ordering::Relaxed) {
        return None;
    }

    with_table(|traces| traces.as_mut().and_then(|table| table.remove(&address))).flatten()
}

fn restore_allocation(address: usize, trace: RawTrace) {
    with_table(|traces| {
        if let Some(table) = traces.as_mut() {
            table.insert(address, trace);
        }
    });
}

#[inline]
fn mark_installed() {
    if !INSTALLED.load(Ordering::Relaxed) {
        INSTALLED.store(true, Ordering::Relaxed);
    }
}

/// A memory allocator that records live allocations and their call stacks while a
/// [`TracingSession`][crate::TracingSession] is active.
///
/// This allocator wraps any [`GlobalAlloc`] implementation. While no session is active,
/// the only overhead is one atomic load per allocator call.
///
/// Register it as the global allocator of the test binary that uses the checks:
///
/// ```rust
/// use alloc_assert::Allocator;
///
/// #[global_allocator]
/// static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();
/// ```
pub struct Allocator<A: GlobalAlloc> {
    inner: A,
}

impl<A: GlobalAlloc> fmt::Debug for Allocator<A> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("inner", &"<allocator>")
            .finish()
    }
}

impl Allocator<std::alloc::System> {
    /// Creates a new tracking allocator using the system's default allocator.
    #[must_use]
    #[inline]
    pub const fn system() -> Self {
        Self {
            inner: std::alloc::System,
        }
    }
}

impl<A: GlobalAlloc> Allocator<A> {
    /// Creates a new tracking allocator that records allocations served by `allocator`.
    #[must_use]
    #[inline]
    pub const fn new(allocator: A) -> Self {
        Self { inner: allocator }
    }
}

// SAFETY: We delegate all allocation operations to the underlying allocator,
// which already implements GlobalAlloc safely, while adding tracking functionality.
unsafe impl<A: GlobalAlloc> GlobalAlloc for Allocator<A> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        mark_installed();

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc(layout) };

        if !ptr.is_null() {
            record_allocation(ptr.addr(), layout.size());
        }

        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Forget before releasing, so a concurrent allocation reusing the address is not lost.
        drop(forget_allocation(ptr.addr()));

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        unsafe { self.inner.dealloc(ptr, layout) }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        mark_installed();

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };

        if !ptr.is_null() {
            record_allocation(ptr.addr(), layout.size());
        }

        ptr
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let previous = forget_allocation(ptr.addr());

        // SAFETY: We forward the call to the underlying allocator which implements GlobalAlloc.
        let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };

        if new_ptr.is_null() {
            // The original block is still live and owned by the caller.
            if let Some(trace) = previous {
                restore_allocation(ptr.addr(), trace);
            }
        } else {
            drop(previous);
            record_allocation(new_ptr.addr(), new_size);
        }

        new_ptr
    }
}
