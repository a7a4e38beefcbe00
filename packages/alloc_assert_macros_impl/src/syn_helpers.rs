use proc_macro2::TokenStream;
use syn::Type;

/// Emits the compile error followed by the original item, so the item still resolves
/// and only the attribute error is reported.
pub(crate) fn token_stream_and_error(item: &TokenStream, error: &syn::Error) -> TokenStream {
    let mut tokens = error.to_compile_error();
    tokens.extend(item.clone());
    tokens
}

/// Whether `ty` is the unit type `()`.
pub(crate) fn is_unit_type(ty: &Type) -> bool {
    match ty {
        Type::Tuple(tuple) => tuple.elems.is_empty(),
        Type::Paren(paren) => is_unit_type(&paren.elem),
        _ => false,
    }
}
