//! Integration tests for tracing sessions with the tracking allocator registered.

#![cfg(not(miri))] // Miri replaces the global allocator, so cannot be used here.

use std::alloc::Layout;
use std::hint::black_box;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use alloc_assert::{
    Allocator, Error, ExcludeSet, MemoryNotLeak, Snapshot, Trace, Tracer, filter_snapshot,
    is_tracing, untracked,
};

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

// The tracer records allocations of every thread, so the tests take turns. Waiting on a
// standard mutex does not allocate, which keeps the waiting tests out of the snapshots.
static TRACER: Mutex<()> = Mutex::new(());

fn exclusive() -> MutexGuard<'static, ()> {
    TRACER.lock().unwrap_or_else(PoisonError::into_inner)
}

const THIS_FILE: &str = "tests/tracer.rs";

// Evaluates the expression and pairs its value with the line it is written on.
macro_rules! with_line {
    ($expr:expr) => {
        ($expr, line!())
    };
}

fn from_this_file(snapshot: &Snapshot) -> Vec<&Trace> {
    snapshot
        .traces()
        .iter()
        .filter(|trace| trace.traceback().call_site().filename().ends_with(THIS_FILE))
        .collect()
}

#[test]
fn snapshot_contains_allocations_made_during_session() {
    let _exclusive = exclusive();

    let before = black_box(vec![0_u8; 1000]);

    let mut session = Tracer::new().start().unwrap();
    assert!(is_tracing());

    let (during, allocated_at) = with_line!(black_box(vec![0_u8; 3000]));
    let snapshot = session.take_snapshot();
    session.stop();

    assert!(!is_tracing());
    assert_eq!(snapshot.traceback_limit(), 1);

    let traces = from_this_file(&snapshot);
    assert_eq!(traces.len(), 1);

    let trace = traces.first().unwrap();
    assert_eq!(trace.size(), 3000);
    assert_eq!(trace.traceback().frames().len(), 1);
    assert_eq!(trace.traceback().call_site().lineno(), allocated_at);

    drop(before);
    drop(during);
}

#[test]
fn freed_allocations_leave_the_snapshot() {
    let _exclusive = exclusive();

    let mut session = Tracer::new().start().unwrap();

    let buffer = black_box(vec![0_u8; 2048]);
    let with_buffer = session.take_snapshot();
    drop(buffer);
    let without_buffer = session.take_snapshot();

    session.stop();

    assert_eq!(from_this_file(&with_buffer).len(), 1);
    assert!(from_this_file(&without_buffer).is_empty());
}

#[test]
fn grown_allocations_are_recorded_with_new_size() {
    let _exclusive = exclusive();

    let mut session = Tracer::new().start().unwrap();

    let mut buffer: Vec<u8> = Vec::with_capacity(16);
    let ((), grown_at) = with_line!(buffer.reserve_exact(4096));
    let snapshot = session.take_snapshot();

    session.stop();

    let traces = from_this_file(&snapshot);
    assert_eq!(traces.len(), 1);

    let trace = traces.first().unwrap();
    assert_eq!(trace.size(), u64::try_from(buffer.capacity()).unwrap());
    assert_eq!(trace.traceback().call_site().lineno(), grown_at);
}

#[test]
fn growth_by_push_is_attributed_to_the_push() {
    let _exclusive = exclusive();

    let mut buffer: Vec<u64> = Vec::with_capacity(1);
    buffer.push(1);

    let mut session = Tracer::new().start().unwrap();

    let ((), pushed_at) = with_line!(buffer.push(2));
    let snapshot = session.take_snapshot();

    session.stop();

    let traces = from_this_file(&snapshot);
    assert_eq!(traces.len(), 1);

    let grown_size = Layout::array::<u64>(buffer.capacity()).unwrap().size();

    let trace = traces.first().unwrap();
    assert_eq!(trace.size(), u64::try_from(grown_size).unwrap());
    assert_eq!(trace.traceback().call_site().lineno(), pushed_at);
}

#[test]
fn untracked_allocations_are_invisible() {
    let _exclusive = exclusive();

    let mut session = Tracer::new().start().unwrap();

    let hidden = untracked(|| black_box(vec![0_u8; 512]));
    let snapshot = session.take_snapshot();

    session.stop();

    assert!(from_this_file(&snapshot).is_empty());
    drop(hidden);
}

#[test]
fn allocations_of_other_threads_are_recorded() {
    let _exclusive = exclusive();

    let mut session = Tracer::new().start().unwrap();

    let buffer = thread::spawn(|| black_box(vec![0_u8; 5000]))
        .join()
        .unwrap();
    let snapshot = session.take_snapshot();

    session.stop();

    let sizes: Vec<u64> = from_this_file(&snapshot)
        .iter()
        .map(|trace| trace.size())
        .collect();
    assert!(sizes.contains(&5000));
    drop(buffer);
}

// Returns the buffer and the line that allocated it.
fn allocate() -> (Vec<u8>, u32) {
    (vec![0_u8; 700], line!())
}

#[test]
fn traceback_limit_keeps_callers() {
    let _exclusive = exclusive();

    let mut session = Tracer::new().traceback_limit(3).start().unwrap();
    assert_eq!(session.traceback_limit(), 3);

    let ((buffer, allocated_at), called_at) = with_line!(allocate());
    let snapshot = session.take_snapshot();

    session.stop();

    let traces = from_this_file(&snapshot);
    assert_eq!(traces.len(), 1);

    let frames = traces.first().unwrap().traceback().frames();
    assert!(frames.len() >= 2 && frames.len() <= 3);
    assert_eq!(frames.first().unwrap().lineno(), allocated_at);

    // The caller of `allocate` is the second frame.
    let caller = frames.get(1).unwrap();
    assert!(caller.filename().ends_with(THIS_FILE));
    assert_eq!(caller.lineno(), called_at);

    drop(buffer);
}

#[test]
fn only_one_session_at_a_time() {
    let _exclusive = exclusive();

    let session = Tracer::new().start().unwrap();

    assert!(matches!(
        Tracer::new().start(),
        Err(Error::SessionAlreadyActive)
    ));
    assert!(matches!(
        MemoryNotLeak::new().check(|| {}),
        Err(Error::SessionAlreadyActive)
    ));

    drop(session);

    let session = Tracer::new().start().unwrap();
    session.stop();
}

#[test]
fn baseline_filter_leaves_only_user_call_sites() {
    let _exclusive = exclusive();

    let mut session = Tracer::new().start().unwrap();

    let (buffer, allocated_at) = with_line!(black_box(vec![0_u8; 100]));
    let snapshot = session.take_snapshot();

    session.stop();

    let filtered = filter_snapshot(&snapshot, &ExcludeSet::baseline());

    let sizes: Vec<u64> = filtered.traces().iter().map(Trace::size).collect();
    assert_eq!(sizes, vec![100]);

    let traces = from_this_file(&filtered);
    assert_eq!(traces.len(), 1);
    assert_eq!(
        traces.first().unwrap().traceback().call_site().lineno(),
        allocated_at
    );

    drop(buffer);
}
