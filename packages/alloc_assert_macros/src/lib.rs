#![allow(
    missing_docs,
    reason = "Private API, public API is documented in `alloc_assert` package"
)]

use proc_macro::TokenStream;

#[proc_macro_attribute]
pub fn memory_not_exceed(attr: TokenStream, item: TokenStream) -> TokenStream {
    alloc_assert_macros_impl::memory_not_exceed::entrypoint(&attr.into(), &item.into()).into()
}

#[proc_macro_attribute]
pub fn memory_not_leak(attr: TokenStream, item: TokenStream) -> TokenStream {
    alloc_assert_macros_impl::memory_not_leak::entrypoint(&attr.into(), &item.into()).into()
}
