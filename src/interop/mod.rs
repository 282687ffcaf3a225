//! Native side of the boundary: slots, calling conventions, calls and closures

pub mod abi;
pub mod call;
pub mod closure;
pub mod containers;
pub mod frame;
pub mod library;
pub mod marshal;
pub mod types;
pub mod variant;

pub use call::{invoke, Callable};
pub use closure::{ClosureHandle, SCRIPT_ERROR_DOMAIN};
pub use frame::CallFrame;
pub use library::Library;
pub use marshal::{to_native, to_script};
pub use types::{NativeArg, NativeError, Variant, VariantTag};
pub use variant::{from_variant, to_variant, ValueClosure, VariantMarshal};

#[cfg(test)]
mod tests;
