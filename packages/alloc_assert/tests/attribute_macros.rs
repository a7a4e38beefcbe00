//! Integration tests for the `#[memory_not_exceed]` and `#[memory_not_leak]` attributes.

#![cfg(not(miri))] // Miri replaces the global allocator, so cannot be used here.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

use alloc_assert::{Allocator, memory_not_exceed, memory_not_leak};

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

// The tracer records allocations of every thread, so the tests take turns. Waiting on a
// standard mutex does not allocate, which keeps the waiting tests out of the snapshots.
static TRACER: Mutex<()> = Mutex::new(());

fn exclusive() -> MutexGuard<'static, ()> {
    TRACER.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| payload.downcast_ref::<&str>().copied())
        .unwrap_or_default()
}

// Records the line of each allocation next to the buffer.
#[memory_not_exceed(threshold = 0.5)]
fn holds_one_kib(sink: &mut Vec<(Vec<u8>, u32)>) {
    sink.push((vec![0_u8; 1024], line!()));
}

#[memory_not_exceed(threshold = 4, key = Filename, traceback_limit = 2)]
fn holds_one_kib_within_limit(sink: &mut Vec<Vec<u8>>) {
    sink.push(vec![0_u8; 1024]);
}

#[memory_not_exceed(threshold = 0, exclude = "*tests/attribute_macros.rs")]
fn holds_memory_in_excluded_file(sink: &mut Vec<Vec<u8>>) {
    sink.push(vec![0_u8; 1024]);
}

#[memory_not_leak]
fn caches_string(cache: &mut Vec<String>) {
    cache.push(String::from("cached"));
}

#[memory_not_leak(threshold = 64)]
fn caches_short_string(cache: &mut Vec<String>) {
    cache.push(String::from("cached"));
}

#[memory_not_leak(exclude = ["*/elsewhere/*", "*tests/attribute_macros.rs"])]
fn caches_string_in_excluded_file(cache: &mut Vec<String>) {
    cache.push(String::from("cached"));
}

#[memory_not_leak]
fn uses_scratch_space(len: usize) {
    let scratch = vec![0_u8; len];
    assert_eq!(scratch.len(), len);
}

struct Registry {
    names: Vec<String>,
}

impl Registry {
    #[memory_not_leak(threshold = 1024)]
    fn register(&mut self, name: &str) {
        self.names.push(name.to_string());
    }
}

#[test]
fn exceed_attribute_panics_above_threshold() {
    let _exclusive = exclusive();

    let mut sink = Vec::with_capacity(4);

    let result = panic::catch_unwind(AssertUnwindSafe(|| holds_one_kib(&mut sink)));

    let payload = result.unwrap_err();
    let message = panic_message(payload.as_ref());
    assert!(message.starts_with("memory usage exceeded 0.5 KiB at 1 call site(s):"));

    // The allocation is attributed to its line inside the annotated function body.
    let (_, allocated_at) = sink.first().unwrap();
    let call_site = format!("tests/attribute_macros.rs:{allocated_at}: size=1024 B");
    assert!(message.contains(&call_site));
}

#[test]
fn exceed_attribute_passes_within_threshold() {
    let _exclusive = exclusive();

    let mut sink = Vec::with_capacity(4);

    holds_one_kib_within_limit(&mut sink);
    holds_memory_in_excluded_file(&mut sink);

    assert_eq!(sink.len(), 2);
}

#[test]
fn leak_attribute_panics_on_growth() {
    let _exclusive = exclusive();

    let mut cache = Vec::with_capacity(4);

    let result = panic::catch_unwind(AssertUnwindSafe(|| caches_string(&mut cache)));

    let payload = result.unwrap_err();
    assert!(
        panic_message(payload.as_ref())
            .starts_with("memory leak detected at 1 call site(s) (threshold 0 bytes):")
    );
}

#[test]
fn leak_attribute_passes_within_threshold() {
    let _exclusive = exclusive();

    let mut cache = Vec::with_capacity(4);

    caches_short_string(&mut cache);
    caches_string_in_excluded_file(&mut cache);
    uses_scratch_space(4096);

    assert_eq!(cache.len(), 2);
}

#[test]
fn leak_attribute_on_method() {
    let _exclusive = exclusive();

    let mut registry = Registry {
        names: Vec::with_capacity(4),
    };

    registry.register("first");
    registry.register("second");

    assert_eq!(registry.names, vec!["first", "second"]);
}
