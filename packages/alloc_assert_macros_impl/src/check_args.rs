use proc_macro2::TokenStream;
use quote::{ToTokens, quote};
use syn::meta::ParseNestedMeta;
use syn::parse::Parser;
use syn::{Expr, ExprLit, Ident, Lit};

/// Arguments accepted by both memory check attributes.
#[derive(Default)]
pub(crate) struct CheckArgs {
    pub(crate) threshold: Option<Expr>,
    exclude: Option<Expr>,
    key: Option<Ident>,
    traceback_limit: Option<Expr>,
}

impl CheckArgs {
    pub(crate) fn parse(attr: &TokenStream) -> syn::Result<Self> {
        let mut args = Self::default();

        let parser = syn::meta::parser(|meta| args.parse_one(&meta));
        parser.parse2(attr.clone())?;

        Ok(args)
    }

    fn parse_one(&mut self, meta: &ParseNestedMeta<'_>) -> syn::Result<()> {
        if meta.path.is_ident("threshold") {
            set_once(&mut self.threshold, meta, meta.value()?.parse()?)
        } else if meta.path.is_ident("exclude") {
            set_once(&mut self.exclude, meta, meta.value()?.parse()?)
        } else if meta.path.is_ident("key") {
            set_once(&mut self.key, meta, meta.value()?.parse()?)
        } else if meta.path.is_ident("traceback_limit") {
            set_once(&mut self.traceback_limit, meta, meta.value()?.parse()?)
        } else {
            Err(meta.error(
                "unsupported argument, expected one of `threshold`, `exclude`, `key`, `traceback_limit`",
            ))
        }
    }

    /// Builder calls for the optional arguments shared by both checks.
    pub(crate) fn builder_calls(&self) -> TokenStream {
        let exclude = self.exclude.as_ref().map(|exclude| {
            let patterns = patterns(exclude);
            quote!(.exclude(#patterns))
        });

        let key = self
            .key
            .as_ref()
            .map(|key| quote!(.key(::alloc_assert::StatisticKey::#key)));

        let traceback_limit = self
            .traceback_limit
            .as_ref()
            .map(|limit| quote!(.traceback_limit(#limit)));

        quote!(#exclude #key #traceback_limit)
    }
}

fn set_once<T>(slot: &mut Option<T>, meta: &ParseNestedMeta<'_>, value: T) -> syn::Result<()> {
    if slot.is_some() {
        return Err(meta.error(format!(
            "duplicate argument `{}`",
            meta.path.to_token_stream()
        )));
    }

    *slot = Some(value);
    Ok(())
}

// A single string literal is accepted in place of a collection of patterns.
fn patterns(exclude: &Expr) -> TokenStream {
    match exclude {
        Expr::Lit(ExprLit {
            lit: Lit::Str(_), ..
        }) => quote!([#exclude]),
        _ => exclude.to_token_stream(),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn empty_args() {
        let args = CheckArgs::parse(&TokenStream::new()).unwrap();

        assert!(args.threshold.is_none());
        assert!(args.builder_calls().is_empty());
    }

    #[test]
    fn all_args() {
        let args = CheckArgs::parse(&quote! {
            threshold = 1.5, exclude = ["*/a.rs", "*/b.rs"], key = Filename, traceback_limit = 4
        })
        .unwrap();

        assert_eq!(
            args.threshold.to_token_stream().to_string(),
            quote!(1.5).to_string()
        );
        assert_eq!(
            args.builder_calls().to_string(),
            quote! {
                .exclude(["*/a.rs", "*/b.rs"])
                .key(::alloc_assert::StatisticKey::Filename)
                .traceback_limit(4)
            }
            .to_string()
        );
    }

    #[test]
    fn single_pattern_is_wrapped() {
        let args = CheckArgs::parse(&quote!(exclude = "*/generated/*")).unwrap();

        assert_eq!(
            args.builder_calls().to_string(),
            quote!(.exclude(["*/generated/*"])).to_string()
        );
    }

    #[test]
    fn pattern_expression_is_kept() {
        let args = CheckArgs::parse(&quote!(exclude = PATTERNS)).unwrap();

        assert_eq!(
            args.builder_calls().to_string(),
            quote!(.exclude(PATTERNS)).to_string()
        );
    }

    fn parse_error(attr: &TokenStream) -> String {
        match CheckArgs::parse(attr) {
            Ok(_) => panic!("arguments were accepted: {attr}"),
            Err(error) => error.to_string(),
        }
    }

    #[test]
    fn unknown_argument_is_rejected() {
        assert!(parse_error(&quote!(limit = 3)).starts_with("unsupported argument"));
    }

    #[test]
    fn duplicate_argument_is_rejected() {
        assert_eq!(
            parse_error(&quote!(threshold = 1, threshold = 2)),
            "duplicate argument `threshold`"
        );
    }

    #[test]
    fn missing_value_is_rejected() {
        assert!(CheckArgs::parse(&quote!(threshold)).is_err());
    }
}
