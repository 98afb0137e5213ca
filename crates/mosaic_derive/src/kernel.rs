use proc_macro2::TokenStream;
use quote::quote;
use syn::{Attribute, DeriveInput, LitStr, Path, Token, WherePredicate, punctuated::Punctuated, spanned::Spanned};

/// Converts `CamelCase` identifiers into `snake_case` kernel names.
fn snake_case(ident: &str) -> String {
    let mut name = String::with_capacity(ident.len() + 4);
    for (index, c) in ident.chars().enumerate() {
        if c.is_uppercase() {
            if index > 0 {
                name.push('_');
            }
            name.extend(c.to_lowercase());
        } else {
            name.push(c);
        }
    }
    name
}

/// Options collected from every `#[kernel(...)]` attribute on the type.
#[derive(Default)]
struct KernelAttrs {
    krate: Option<Path>,
    name: Option<String>,
    bounds: Punctuated<WherePredicate, Token![,]>,
}

impl KernelAttrs {
    fn parse(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut output = Self::default();
        for attr in attrs.iter().filter(|attr| attr.path().is_ident("kernel")) {
            attr.parse_nested_meta(|meta| {
                let value: LitStr = meta.value()?.parse()?;
                match meta.path.get_ident().map(|ident| ident.to_string()).as_deref() {
                    Some("crate") => output.krate = Some(value.parse()?),
                    Some("name") => output.name = Some(value.value()),
                    Some("bound") => output
                        .bounds
                        .extend(value.parse_with(Punctuated::<WherePredicate, Token![,]>::parse_terminated)?),
                    _ => return Err(meta.error("expected `crate`, `name` or `bound`")),
                }
                Ok(())
            })?;
        }
        Ok(output)
    }
}

pub fn derive_kernel(input: DeriveInput) -> TokenStream {
    if let syn::Data::Union(_) = &input.data {
        return syn::Error::new(input.span(), "`Kernel` cannot be derived for unions").to_compile_error();
    }
    let attrs = match KernelAttrs::parse(&input.attrs) {
        Ok(attrs) => attrs,
        Err(err) => return err.to_compile_error(),
    };

    let ident = &input.ident;
    let runtime = match attrs.krate {
        Some(path) => quote!(#path::runtime),
        None => quote!(::mosaic::runtime),
    };
    let name = attrs.name.unwrap_or_else(|| snake_case(&ident.to_string()));

    let mut generics = input.generics.clone();
    generics.make_where_clause().predicates.extend(attrs.bounds);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    quote! {
        impl #impl_generics #runtime::Kernel for #ident #ty_generics #where_clause {
            #[inline]
            fn name(&self) -> &'static str {
                #name
            }

            #[inline]
            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }
        }
    }
}
