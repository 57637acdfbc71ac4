use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemStruct, parse_macro_input};

extern crate proc_macro;

/// Marks a plain-data record: something the dispatcher captures or the report
/// builder emits, and which therefore has to be serializable, printable and
/// comparable in tests.
///
/// ```rust, ignore
/// #[record]
/// pub struct Sample {
///     pub cursor: usize,
/// }
/// ```
#[proc_macro_attribute]
pub fn record(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast
    };

    TokenStream::from(expanded)
}
