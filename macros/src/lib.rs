use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, Ident, ItemFn, LitStr};

/// Test attribute used across rxmqtt.
///
/// Sync functions become `#[test]`, async functions become `#[tokio::test]`.
/// Either way a `tracing_subscriber` honouring `RUST_LOG` is installed once
/// before the body runs, so wire calls and state transitions show up in the
/// captured test output.
///
/// Async tests accept an optional runtime flavor: `current` (the default) or
/// `shared` for a multi-thread runtime.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
  let input = parse_macro_input!(item as ItemFn);
  let is_async = input.sig.asyncness.is_some();

  let raw_args = proc_macro2::TokenStream::from(attr);
  let flavor = if raw_args.is_empty() {
    None
  } else if !is_async {
    return TokenStream::from(
      syn::Error::new(
        raw_args.span(),
        "rxmqtt_macro::test flavor args are only supported for async tests",
      )
      .to_compile_error(),
    );
  } else {
    let name = if let Ok(ident) = syn::parse2::<Ident>(raw_args.clone()) {
      Some((ident.to_string(), ident.span()))
    } else if let Ok(lit) = syn::parse2::<LitStr>(raw_args.clone()) {
      Some((lit.value(), lit.span()))
    } else {
      None
    };
    match name {
      Some((name, _)) if name == "current" => Some(quote!(flavor = "current_thread")),
      Some((name, _)) if name == "shared" => Some(quote!(flavor = "multi_thread")),
      Some((_, span)) => {
        return TokenStream::from(
          syn::Error::new(span, "rxmqtt_macro::test only accepts `current` or `shared`")
            .to_compile_error(),
        );
      }
      None => {
        return TokenStream::from(
          syn::Error::new(raw_args.span(), "expected `current` or `shared`").to_compile_error(),
        );
      }
    }
  };

  let native_attr = match (is_async, flavor) {
    (false, _) => quote!(#[test]),
    (true, None) => quote!(#[::tokio::test]),
    (true, Some(flavor)) => quote!(#[::tokio::test(#flavor)]),
  };

  let ItemFn { attrs, vis, sig, block } = input;
  let expanded = quote! {
    #native_attr
    #(#attrs)*
    #vis #sig {
      let _ = ::tracing_subscriber::fmt()
        .with_env_filter(::tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
      #block
    }
  };

  TokenStream::from(expanded)
}
