#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![allow(
    missing_docs,
    reason = "Private API, public API is documented in `alloc_assert` package"
)]

mod check_args;
mod check_fn;
pub mod memory_not_exceed;
pub mod memory_not_leak;
mod syn_helpers;
