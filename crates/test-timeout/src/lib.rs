//! Wall-clock limits for tests.
//!
//! - `#[test_timeout::timeout]` / `#[test_timeout::timeout(secs)]` for
//!   synchronous tests.
//! - `#[test_timeout::tokio_timeout_test]` / `#[tokio_timeout_test(secs)]`
//!   for async tests. The body runs on its own current-thread Tokio runtime,
//!   so the crate using it needs `tokio` with `rt` and `time`.
//!
//! The limit defaults to 60 seconds.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt, ReturnType};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let output = match &sig.output {
        ReturnType::Default => quote! { () },
        ReturnType::Type(_, ty) => quote! { #ty },
    };
    let run = quote! {
        let body: ::std::pin::Pin<
            ::std::boxed::Box<dyn ::std::future::Future<Output = #output>>,
        > = ::std::boxed::Box::pin(async move #block);
        let runtime = ::tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            ::tokio::time::timeout(timeout_duration, body)
                .await
                .expect("test timed out")
        })
    };

    // Unit tests also get a watchdog thread, which catches bodies that block
    // the runtime. Tests returning a value run inline so the value (often a
    // non-`Send` error) reaches the harness untouched.
    let body = match &sig.output {
        ReturnType::Default => watchdog(quote! { { #run } }),
        ReturnType::Type(..) => run,
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = ::std::time::Duration::from_secs(#timeout_secs);
            #body
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let timeout_secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    if !matches!(sig.output, ReturnType::Default) {
        return syn::Error::new_spanned(
            &sig.output,
            "timeout tests must return (); use assertions instead of `?`",
        )
        .to_compile_error()
        .into();
    }

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();
    let body = watchdog(quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = ::std::time::Duration::from_secs(#timeout_secs);
            #body
        }
    })
}

/// Runs `body` on a fresh thread and fails the test if it has not finished
/// within `timeout_duration`.
fn watchdog(body: TokenStream2) -> TokenStream2 {
    quote! {
        let (sender, receiver) = ::std::sync::mpsc::channel();
        ::std::thread::spawn(move || {
            let result = ::std::panic::catch_unwind(
                ::std::panic::AssertUnwindSafe(move || #body),
            );
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(())) => {}
            Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// `#[test]` and `#[tokio::test]` would register the function twice.
fn is_test_marker(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    match (segments.next(), segments.next(), segments.next()) {
        (Some(first), None, None) => first.ident == "test",
        (Some(first), Some(second), None) => first.ident == "tokio" && second.ident == "test",
        _ => false,
    }
}
