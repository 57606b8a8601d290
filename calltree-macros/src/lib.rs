//! `#[profiled]`: open a calltree scope for the whole body of a function.
//!
//! ```ignore
//! #[calltree_runtime::profiled]
//! fn step(world: &mut World) { .. }
//!
//! #[calltree_runtime::profiled("physics")]
//! fn integrate(world: &mut World) { .. }
//! ```
//!
//! Without an argument the scope identifier is the function's full path
//! (including the impl type for methods), derived at compile time.

use proc_macro::TokenStream;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::spanned::Spanned;
use syn::{parse_macro_input, Block, ImplItemFn, LitStr, Signature};

struct Args {
    name: Option<LitStr>,
}

impl Parse for Args {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Args { name: None });
        }
        let name: LitStr = input.parse()?;
        if name.value().is_empty() {
            return Err(syn::Error::new(name.span(), "scope name must not be empty"));
        }
        Ok(Args { name: Some(name) })
    }
}

#[proc_macro_attribute]
pub fn profiled(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as Args);
    // ImplItemFn covers free fns, methods and trait default methods alike.
    let mut func = parse_macro_input!(item as ImplItemFn);

    if let Err(err) = check_instrumentable(&func.sig) {
        return err.to_compile_error().into();
    }
    inject_guard(&mut func.block, args.name.as_ref());
    quote!(#func).into()
}

/// Scopes are synchronous and thread-local, and a const body can't run one.
fn check_instrumentable(sig: &Signature) -> syn::Result<()> {
    if let Some(token) = &sig.asyncness {
        return Err(syn::Error::new(
            token.span(),
            "#[profiled] cannot wrap an async fn: scope guards must drop on the thread that created them",
        ));
    }
    if let Some(token) = &sig.constness {
        return Err(syn::Error::new(
            token.span(),
            "#[profiled] cannot wrap a const fn",
        ));
    }
    Ok(())
}

fn inject_guard(block: &mut Block, name: Option<&LitStr>) {
    let id = match name {
        Some(lit) => quote!(#lit),
        None => quote!(::calltree_runtime::function_name!()),
    };
    let guard_stmt: syn::Stmt = syn::parse_quote! {
        let _calltree_guard = ::calltree_runtime::scope(#id);
    };
    block.stmts.insert(0, guard_stmt);
}
