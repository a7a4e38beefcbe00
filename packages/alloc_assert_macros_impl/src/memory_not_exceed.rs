use proc_macro2::{Span, TokenStream};
use quote::quote;

use crate::check_args::CheckArgs;
use crate::check_fn::wrap_body;
use crate::syn_helpers::token_stream_and_error;

const ATTRIBUTE: &str = "memory_not_exceed";

#[must_use]
pub fn entrypoint(attr: &TokenStream, item: &TokenStream) -> TokenStream {
    match expand(attr, item) {
        Ok(result) => result,
        Err(error) => token_stream_and_error(item, &error),
    }
}

fn expand(attr: &TokenStream, item: &TokenStream) -> syn::Result<TokenStream> {
    let args = CheckArgs::parse(attr)?;

    let Some(threshold) = &args.threshold else {
        return Err(syn::Error::new(
            Span::call_site(),
            "#[memory_not_exceed] requires a `threshold` argument, in KiB",
        ));
    };

    let builder_calls = args.builder_calls();
    let check = quote!(::alloc_assert::MemoryNotExceed::new(#threshold) #builder_calls);

    wrap_body(ATTRIBUTE, &check, item)
}
