//! A derive macro for the `Event` trait in the `sourcerer` crate.
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Attribute, Data, DeriveInput, Fields, LitInt, LitStr};

const DEFAULT_SOURCE: &str = "urn:sourcerer:event";
const DEFAULT_VERSION: u16 = 1;

/// The `(version, source)` overrides found in an `#[event(...)]` attribute,
/// either of which may be absent.
#[derive(Default, Clone)]
struct EventAttr {
    version: Option<u16>,
    source: Option<String>,
}

/// Scans a slice of attributes for `#[event(version = N, source = "...")]`
/// and returns whatever overrides it finds. Unrelated attributes are
/// ignored; a bare `#[event]` with no recognized keys leaves both fields
/// `None`.
fn parse_event_attr(attrs: &[Attribute]) -> EventAttr {
    let mut found = EventAttr::default();

    for attr in attrs {
        if !attr.path().is_ident("event") {
            continue;
        }
        let _ = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("version") {
                let value = meta.value()?;
                let lit: LitInt = value.parse()?;
                found.version = Some(lit.base10_parse::<u16>()?);
            } else if meta.path.is_ident("source") {
                let value = meta.value()?;
                let lit: LitStr = value.parse()?;
                found.source = Some(lit.value());
            }
            Ok(())
        });
    }

    found
}

/// Derives the `Event` trait for an enum.
///
/// This macro implements all three required methods:
/// - `event_type`: the variant's name as a static string.
/// - `event_version`: taken from a per-variant `#[event(version = N)]`
///   attribute if present, else the enum-level `#[event(version = N)]`
///   attribute, else `1`.
/// - `event_source`: resolved the same way, defaulting to
///   `"urn:sourcerer:event"`.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, Debug, Serialize, Deserialize, Event)]
/// #[event(version = 1, source = "urn:myapp:order")]
/// enum OrderEvent {
///     Created { .. },
///     #[event(version = 2)]
///     Paid { .. },
/// }
/// ```
#[proc_macro_derive(Event, attributes(event))]
pub fn event_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let variants = match &input.data {
        Data::Enum(data) => &data.variants,
        _ => panic!("Event derive macro can only be used on enums"),
    };

    let enum_attr = parse_event_attr(&input.attrs);

    let event_type_arms = variants.iter().map(|variant| {
        let variant_name = &variant.ident;
        let fields = match &variant.fields {
            Fields::Named(_) => quote! { { .. } },
            Fields::Unnamed(_) => quote! { (..) },
            Fields::Unit => quote! {},
        };
        quote! {
            #name::#variant_name #fields => stringify!(#variant_name)
        }
    });

    let event_version_arms = variants.iter().map(|variant| {
        let variant_name = &variant.ident;
        let variant_attr = parse_event_attr(&variant.attrs);
        let version = variant_attr
            .version
            .or(enum_attr.version)
            .unwrap_or(DEFAULT_VERSION);
        let fields = match &variant.fields {
            Fields::Named(_) => quote! { { .. } },
            Fields::Unnamed(_) => quote! { (..) },
            Fields::Unit => quote! {},
        };
        quote! {
            #name::#variant_name #fields => #version
        }
    });

    let event_source_arms = variants.iter().map(|variant| {
        let variant_name = &variant.ident;
        let variant_attr = parse_event_attr(&variant.attrs);
        let source = variant_attr
            .source
            .or_else(|| enum_attr.source.clone())
            .unwrap_or_else(|| DEFAULT_SOURCE.to_string());
        let fields = match &variant.fields {
            Fields::Named(_) => quote! { { .. } },
            Fields::Unnamed(_) => quote! { (..) },
            Fields::Unit => quote! {},
        };
        quote! {
            #name::#variant_name #fields => #source
        }
    });

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let expanded = quote! {
        impl #impl_generics sourcerer::Event for #name #ty_generics #where_clause {
            fn event_type(&self) -> &'static str {
                match self {
                    #(#event_type_arms),*
                }
            }

            fn event_version(&self) -> u16 {
                match self {
                    #(#event_version_arms),*
                }
            }

            fn event_source(&self) -> &'static str {
                match self {
                    #(#event_source_arms),*
                }
            }
        }
    };

    TokenStream::from(expanded)
}
