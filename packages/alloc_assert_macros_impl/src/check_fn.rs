use proc_macro2::TokenStream;
use quote::quote;
use syn::{ItemFn, ReturnType};

use crate::syn_helpers::is_unit_type;

/// Rewrites the body of the function in `item` to run inside `check`, an expression that
/// evaluates to one of the memory checks.
///
/// Attributes, visibility and signature of the function are kept as they are. The body
/// becomes a closure, so it keeps access to the function arguments.
pub(crate) fn wrap_body(
    attribute: &str,
    check: &TokenStream,
    item: &TokenStream,
) -> syn::Result<TokenStream> {
    let item_fn: ItemFn = syn::parse2(item.clone())?;

    if let Some(asyncness) = &item_fn.sig.asyncness {
        return Err(syn::Error::new_spanned(
            asyncness,
            format!("#[{attribute}] cannot be applied to async functions"),
        ));
    }

    if let ReturnType::Type(_, ty) = &item_fn.sig.output {
        if !is_unit_type(ty) {
            return Err(syn::Error::new_spanned(
                ty,
                format!("#[{attribute}] can only be applied to functions that return `()`"),
            ));
        }
    }

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = item_fn;

    Ok(quote! {
        #(#attrs)*
        #vis #sig {
            #check.run(|| #block);
        }
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn check() -> TokenStream {
        quote!(::alloc_assert::MemoryNotLeak::new())
    }

    #[test]
    fn keeps_signature_and_attributes() {
        let item = quote! {
            #[test]
            #[allow(dead_code)]
            pub(crate) fn sums<T: Into<u64>>(a: T, b: u64) {
                let _total = a.into() + b;
            }
        };

        let result = wrap_body("memory_not_leak", &check(), &item).unwrap();

        let expected = quote! {
            #[test]
            #[allow(dead_code)]
            pub(crate) fn sums<T: Into<u64>>(a: T, b: u64) {
                ::alloc_assert::MemoryNotLeak::new().run(|| {
                    let _total = a.into() + b;
                });
            }
        };

        assert_eq!(result.to_string(), expected.to_string());
    }

    #[test]
    fn explicit_unit_return_is_accepted() {
        let item = quote! {
            fn nothing() -> () {}
        };

        wrap_body("memory_not_leak", &check(), &item).unwrap();
    }

    #[test]
    fn async_fn_is_rejected() {
        let item = quote! {
            async fn later() {}
        };

        let error = wrap_body("memory_not_leak", &check(), &item).unwrap_err();

        assert_eq!(
            error.to_string(),
            "#[memory_not_leak] cannot be applied to async functions"
        );
    }

    #[test]
    fn value_returning_fn_is_rejected() {
        let item = quote! {
            fn answer() -> u32 { 42 }
        };

        let error = wrap_body("memory_not_exceed", &check(), &item).unwrap_err();

        assert_eq!(
            error.to_string(),
            "#[memory_not_exceed] can only be applied to functions that return `()`"
        );
    }

    #[test]
    fn non_function_is_rejected() {
        let item = quote! {
            struct NotAFunction;
        };

        wrap_body("memory_not_leak", &check(), &item).unwrap_err();
    }
}
