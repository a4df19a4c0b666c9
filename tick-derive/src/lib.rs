use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::ToTokens;
use syn::{
    Error, FnArg, GenericArgument, ItemFn, Path, PathArguments, ReturnType,
    Type, parse::Parser, parse_macro_input, parse_quote, spanned::Spanned,
};

/// Turns an `async fn` returning `Result<T, TaskError>` into a plain fn
/// returning `Task<T>`.
///
/// ```rust,ignore
/// #[async_task]
/// async fn load(id: u32) -> Result<Asset, TaskError> { [body] }
///
/// // becomes
/// fn load(id: u32) -> tick::Task<Asset> {
///     tick::spawn::<_, Asset>(async move { [body] })
/// }
/// ```
///
/// The body starts running when the fn is called and resumes from whatever
/// it awaits, so every argument is moved into it: borrowed arguments are
/// rejected. Use `#[async_task(crate = path)]` when the `tick` facade is
/// reachable under another name; `path` must export `spawn` and `Task`.
#[proc_macro_attribute]
pub fn async_task(attr: TokenStream, item: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(item as ItemFn);
    let krate = match crate_path(attr.into()) {
        Ok(krate) => krate,
        Err(error) => return error.into_compile_error().into(),
    };
    match expand(&mut item_fn, &krate) {
        Ok(()) => item_fn.to_token_stream().into(),
        Err(error) => error.into_compile_error().into(),
    }
}

/// Parses the optional `crate = path` argument.
fn crate_path(attr: proc_macro2::TokenStream) -> syn::Result<Path> {
    let mut krate: Path = parse_quote! { ::tick };
    if attr.is_empty() {
        return Ok(krate);
    }
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("crate") {
            krate = meta.value()?.parse()?;
            Ok(())
        } else {
            Err(meta.error("expected `crate = path`"))
        }
    });
    parser.parse2(attr)?;
    Ok(krate)
}

fn expand(item_fn: &mut ItemFn, krate: &Path) -> syn::Result<()> {
    if item_fn.sig.asyncness.is_none() {
        return Err(Error::new(
            item_fn.sig.fn_token.span(),
            "#[async_task] expects an `async fn`",
        ));
    }
    for input in &item_fn.sig.inputs {
        let borrowed = match input {
            FnArg::Receiver(receiver) => receiver.reference.is_some(),
            FnArg::Typed(pat) => has_lifetime_dependency(&pat.ty),
        };
        if borrowed {
            return Err(Error::new(
                input.span(),
                "arguments of an #[async_task] fn are moved into the task \
                 and must not borrow",
            ));
        }
    }
    let output = ok_type(&item_fn.sig.output)?;

    item_fn.sig.asyncness = None;
    item_fn.sig.output = parse_quote! { -> #krate::Task<#output> };
    let block = item_fn.block.clone();
    *item_fn.block = parse_quote! {
        {
            #krate::spawn::<_, #output>(async move #block)
        }
    };
    Ok(())
}

/// Extracts `T` from a `Result<T, ..>` return type.
fn ok_type(output: &ReturnType) -> syn::Result<Type> {
    let ty = match output {
        ReturnType::Type(_, ty) => ty,
        ReturnType::Default => {
            return Err(Error::new(
                Span::call_site(),
                "#[async_task] fns return `Result<T, TaskError>`",
            ));
        }
    };
    let ok = match &**ty {
        Type::Path(path) => path.path.segments.last().and_then(|segment| {
            if segment.ident != "Result" {
                return None;
            }
            match &segment.arguments {
                PathArguments::AngleBracketed(args) => {
                    args.args.iter().find_map(|arg| match arg {
                        GenericArgument::Type(ty) => Some(ty.clone()),
                        _ => None,
                    })
                }
                _ => None,
            }
        }),
        _ => None,
    };
    ok.ok_or_else(|| {
        Error::new(ty.span(), "expected `Result<T, TaskError>` return type")
    })
}

/// Determines if a typed argument borrows anything.
fn has_lifetime_dependency(ty: &Type) -> bool {
    match ty {
        Type::Reference(_) => true,
        Type::Path(type_path) => {
            type_path.path.segments.iter().any(|segment| {
                if let PathArguments::AngleBracketed(args) = &segment.arguments
                {
                    args.args.iter().any(|arg| match arg {
                        GenericArgument::Type(ty) => {
                            has_lifetime_dependency(ty)
                        }
                        GenericArgument::Lifetime(lifetime) => {
                            lifetime.ident != "static"
                        }
                        _ => false,
                    })
                } else {
                    false
                }
            })
        }
        Type::Tuple(tuple) => tuple.elems.iter().any(has_lifetime_dependency),
        Type::Slice(slice) => has_lifetime_dependency(&slice.elem),
        Type::Array(array) => has_lifetime_dependency(&array.elem),
        Type::Ptr(ptr) => has_lifetime_dependency(&ptr.elem),
        Type::Group(group) => has_lifetime_dependency(&group.elem),
        Type::Paren(paren) => has_lifetime_dependency(&paren.elem),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expand_str(attr: &str, item: &str) -> syn::Result<String> {
        let mut item_fn: ItemFn = syn::parse_str(item)?;
        let krate = crate_path(attr.parse().unwrap())?;
        expand(&mut item_fn, &krate)?;
        Ok(item_fn.to_token_stream().to_string().replace(' ', ""))
    }

    #[test]
    fn rewrites_into_spawn() {
        let expanded = expand_str(
            "",
            "async fn load(id: u32) -> Result<String, TaskError> { \
             Ok(id.to_string()) }",
        )
        .unwrap();
        assert!(expanded.starts_with("fnload"));
        assert!(expanded.contains("->::tick::Task<String>"));
        assert!(expanded.contains("::tick::spawn::<_,String>(asyncmove{"));
    }

    #[test]
    fn honours_crate_override() {
        let expanded = expand_str(
            "crate = runtime",
            "async fn unit() -> Result<(), TaskError> { Ok(()) }",
        )
        .unwrap();
        assert!(expanded.contains("->runtime::Task<()>"));
    }

    #[test]
    fn rejects_borrowed_arguments() {
        let error = expand_str(
            "",
            "async fn bad(name: &str) -> Result<(), TaskError> { Ok(()) }",
        )
        .unwrap_err();
        assert!(error.to_string().contains("must not borrow"));

        assert!(
            expand_str(
                "",
                "async fn fine(name: Cow<'static, str>) \
                 -> Result<(), TaskError> { Ok(()) }",
            )
            .is_ok()
        );
    }

    #[test]
    fn rejects_non_result_returns() {
        assert!(expand_str("", "async fn f() -> u8 { 1 }").is_err());
        assert!(expand_str("", "fn f() -> Result<u8, E> { Ok(1) }").is_err());
    }
}
