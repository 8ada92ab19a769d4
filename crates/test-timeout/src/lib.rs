//! Test attributes that bound every test by a wall-clock timeout.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test, while
//! `#[test_timeout::tokio_timeout_test]` builds a current-thread Tokio runtime
//! for an async test. Both accept an optional timeout in seconds; the async
//! variant also accepts `paused`, which starts the runtime with a paused clock
//! (requires Tokio's `test-util` feature in the calling crate).

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TimeoutArgs {
    secs: u64,
    paused: bool,
}

fn parse_args(attr: TokenStream) -> syn::Result<TimeoutArgs> {
    let mut args = TimeoutArgs {
        secs: DEFAULT_TIMEOUT_SECS,
        paused: false,
    };
    let exprs = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for expr in exprs {
        match &expr {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                args.secs = secs;
            }
            Expr::Path(path) if path.path.is_ident("paused") => args.paused = true,
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or `paused`",
                ))
            }
        }
    }
    Ok(args)
}

/// Guard run on a helper thread so a hung test fails instead of stalling the suite.
fn guarded(timeout: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#timeout);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_test_attributes(attrs);
    let paused = if args.paused {
        quote! { .start_paused(true) }
    } else {
        quote! {}
    };
    let runtime = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            #paused
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        });
    };
    let body = guarded(args.secs, runtime);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    if args.paused {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "`paused` only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_test_attributes(attrs);
    let body = guarded(args.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

/// Drops `#[test]` and `#[tokio::test]` so the generated `#[test]` is the only one.
fn strip_test_attributes(attrs: Vec<Attribute>) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            !matches!(
                segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
                ["test"] | ["tokio", "test"]
            )
        })
        .collect()
}
