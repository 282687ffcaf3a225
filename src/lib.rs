//! gibind - Marshaling, lifetime and closure engine for introspected bindings
//!
//! This crate bridges a dynamically-typed scripting runtime with a native
//! object system whose types and call signatures are discovered at runtime.
//! It converts values in both directions under explicit ownership-transfer
//! rules, keeps native memory alive exactly as long as scripting handles
//! reference it, and synthesizes native trampolines for scripting callbacks.
//!
//! Entry points take a [`Registry`], the per-interpreter engine context.

pub mod compound;
pub mod config;
pub mod descriptor;
pub mod errors;
pub mod interop;
pub mod lifetime;
pub mod logging;
pub mod value;

// Re-export core types
pub use compound::{Compound, LifeState, Posture, UnwrapFlags, Unwrapped};
pub use config::BindConfig;
pub use descriptor::{
    ArgInfo, CallableInfo, CompoundCategory, CompoundInfo, DescriptorKind, Direction,
    EnumInfo, ErrorChannel, FieldInfo, HostType, Primitive, Scope, SimpleTypeSystem, Transfer,
    TypeDescriptor, TypeSystem,
};
pub use errors::{BindError, ErrorKind, Result};
pub use interop::{invoke, Callable, CallFrame, ClosureHandle, NativeArg, ValueClosure, Variant};
pub use lifetime::{Guard, IdentityCache, Registry};
pub use value::{ScriptFunction, Value};
