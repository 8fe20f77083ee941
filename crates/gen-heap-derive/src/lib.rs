//! Derive macro for the heap's well-known root table.
//!
//! `#[derive(RootTable)]` goes on a field-less enum naming every root. It
//! generates the enum's `COUNT`, `ALL`, `index()` and `name()` items and one
//! getter per variant on the table type named in `#[root_table(...)]`:
//!
//! ```ignore
//! #[derive(Clone, Copy, RootTable)]
//! #[root_table(table = Roots, value = Address)]
//! pub enum RootId {
//!     #[root(ty = Descriptor)]
//!     MetaDescriptor,
//!     EmptyFixedArray,
//! }
//!
//! // generated: Roots::meta_descriptor(&self) -> Descriptor
//! //            Roots::empty_fixed_array(&self) -> Address
//! ```
//!
//! The table type must provide `fn get(&self, id: RootId) -> Value`; typed
//! getters convert the stored value with `From`.

use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Attribute, Data, DeriveInput, Fields, Path, Type};

#[proc_macro_derive(RootTable, attributes(root_table, root))]
pub fn derive_root_table(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

struct TableConfig {
    table: Path,
    value: Type,
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream> {
    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "RootTable can only be derived for enums",
        ));
    };
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "RootTable enums cannot be generic",
        ));
    }

    let TableConfig { table, value } = table_config(input)?;
    let enum_ident = &input.ident;

    let mut idents = Vec::with_capacity(data.variants.len());
    let mut names = Vec::with_capacity(data.variants.len());
    let mut accessors = Vec::with_capacity(data.variants.len());

    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(syn::Error::new_spanned(
                variant,
                "root ids must be unit variants",
            ));
        }
        if let Some((_, discriminant)) = &variant.discriminant {
            return Err(syn::Error::new_spanned(
                discriminant,
                "root ids are indexed by declaration order; remove the discriminant",
            ));
        }

        let ident = &variant.ident;
        let name = snake_case(&ident.to_string());
        let getter = format_ident!("{}", name);
        let doc = format!("Returns the `{name}` root.");

        let accessor = match root_type(&variant.attrs)? {
            Some(ty) => quote! {
                #[doc = #doc]
                #[must_use]
                pub fn #getter(&self) -> #ty {
                    ::core::convert::From::from(self.get(#enum_ident::#ident))
                }
            },
            None => quote! {
                #[doc = #doc]
                #[must_use]
                pub fn #getter(&self) -> #value {
                    self.get(#enum_ident::#ident)
                }
            },
        };

        idents.push(ident);
        names.push(name);
        accessors.push(accessor);
    }

    let count = idents.len();

    Ok(quote! {
        impl #enum_ident {
            /// Number of roots in the table.
            pub const COUNT: usize = #count;

            /// Every root id, in table order.
            pub const ALL: [Self; #count] = [#(Self::#idents),*];

            /// Slot of this root in the table.
            #[must_use]
            pub const fn index(self) -> usize {
                self as usize
            }

            /// Accessor name of this root.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    #(Self::#idents => #names,)*
                }
            }
        }

        impl #table {
            #(#accessors)*
        }
    })
}

fn table_config(input: &DeriveInput) -> syn::Result<TableConfig> {
    let mut table = None;
    let mut value = None;

    for attr in input.attrs.iter().filter(|a| a.path().is_ident("root_table")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                table = Some(meta.value()?.parse::<Path>()?);
                Ok(())
            } else if meta.path.is_ident("value") {
                value = Some(meta.value()?.parse::<Type>()?);
                Ok(())
            } else {
                Err(meta.error("expected `table = ...` or `value = ...`"))
            }
        })?;
    }

    match (table, value) {
        (Some(table), Some(value)) => Ok(TableConfig { table, value }),
        _ => Err(syn::Error::new_spanned(
            &input.ident,
            "missing #[root_table(table = Type, value = Type)]",
        )),
    }
}

fn root_type(attrs: &[Attribute]) -> syn::Result<Option<Type>> {
    let mut ty = None;
    for attr in attrs.iter().filter(|a| a.path().is_ident("root")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("ty") {
                ty = Some(meta.value()?.parse::<Type>()?);
                Ok(())
            } else {
                Err(meta.error("expected `ty = ...`"))
            }
        })?;
    }
    Ok(ty)
}

fn snake_case(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 4);
    for (i, ch) in ident.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::snake_case;

    #[test]
    fn snake_case_splits_on_capitals() {
        assert_eq!(snake_case("MetaDescriptor"), "meta_descriptor");
        assert_eq!(snake_case("JsObjectDescriptor"), "js_object_descriptor");
        assert_eq!(snake_case("Filler"), "filler");
    }
}
