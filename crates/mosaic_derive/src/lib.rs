use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod kernel;

#[proc_macro_derive(Kernel, attributes(kernel))]
pub fn derive_kernel(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let expanded = kernel::derive_kernel(input);
    expanded.into()
}
