//! Runtime type descriptors
//!
//! Design: descriptors are discovered at runtime (introspection metadata) and
//! drive every marshaling decision. `DescriptorKind` is a closed tagged union,
//! so each marshaling path is an exhaustive match.
//!
//! Descriptors are immutable once built and shared through `Arc` where
//! identity matters (compounds, callables, enums).

use std::fmt;
use std::sync::Arc;

mod callable_info;
mod compound_info;
mod host;

pub use callable_info::{ArgInfo, CallableInfo, Direction, ErrorChannel, Scope};
pub use compound_info::{
    CompoundCategory, CompoundInfo, ConstructFn, CopyFn, EnumInfo, FieldInfo, FreeFn,
    PropertyInfo, RefFn,
};
pub use host::{SimpleTypeSystem, TypeSystem};


/// Runtime type id assigned by the host object system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct HostType(pub usize);

impl HostType {
    pub const INVALID: HostType = HostType(0);

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host type {:#x}", self.0)
    }
}

/// Ownership transfer across one boundary crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Transfer {
    /// Receiver borrows; the sender keeps ownership
    #[default]
    None,
    /// Outer container moves; its elements stay with the sender
    Container,
    /// Full deep ownership moves to the receiver
    Everything,
}

impl Transfer {
    pub fn as_str(self) -> &'static str {
        match self {
            Transfer::None => "none",
            Transfer::Container => "container",
            Transfer::Everything => "everything",
        }
    }

    /// Transfer applied to the elements of a container with this transfer
    #[inline]
    pub fn for_elements(self) -> Transfer {
        match self {
            Transfer::Everything => Transfer::Everything,
            _ => Transfer::None,
        }
    }
}

/// Fixed-width native scalar kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// C `int` used as a boolean
    Boolean,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    /// Unicode scalar stored as `u32`
    Unichar,
    /// Host type id stored as `usize`
    HostType,
}

impl Primitive {
    pub fn size(self) -> usize {
        match self {
            Primitive::Int8 | Primitive::UInt8 => 1,
            Primitive::Int16 | Primitive::UInt16 => 2,
            Primitive::Boolean
            | Primitive::Int32
            | Primitive::UInt32
            | Primitive::Float
            | Primitive::Unichar => 4,
            Primitive::Int64 | Primitive::UInt64 | Primitive::Double => 8,
            Primitive::HostType => std::mem::size_of::<usize>(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Boolean => "boolean",
            Primitive::Int8 => "int8",
            Primitive::UInt8 => "uint8",
            Primitive::Int16 => "int16",
            Primitive::UInt16 => "uint16",
            Primitive::Int32 => "int32",
            Primitive::UInt32 => "uint32",
            Primitive::Int64 => "int64",
            Primitive::UInt64 => "uint64",
            Primitive::Float => "float",
            Primitive::Double => "double",
            Primitive::Unichar => "unichar",
            Primitive::HostType => "hosttype",
        }
    }

    #[inline]
    pub fn is_integral(self) -> bool {
        !matches!(self, Primitive::Float | Primitive::Double)
    }
}

/// Link layout of a native linked list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListLinks {
    /// `{ data, next }`
    Single,
    /// `{ data, next, prev }`
    Double,
}

/// C array shape
#[derive(Debug, Clone)]
pub struct ArrayInfo {
    pub element: Box<TypeDescriptor>,
    pub fixed_size: Option<usize>,
    pub zero_terminated: bool,
    /// Index of the callable argument carrying this array's length
    pub length_arg: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ListInfo {
    pub element: Box<TypeDescriptor>,
    pub links: ListLinks,
}

/// Descriptor kind tag with nested descriptors
#[derive(Debug, Clone)]
pub enum DescriptorKind {
    Void,
    Primitive(Primitive),
    /// NUL-terminated UTF-8 string
    Utf8,
    /// NUL-terminated file name in platform encoding
    Filename,
    /// Untyped `void *`
    Pointer,
    Array(ArrayInfo),
    List(ListInfo),
    Compound(Arc<CompoundInfo>),
    Enum(Arc<EnumInfo>),
    Callback(Arc<CallableInfo>),
    /// Pointer to a native error record
    Error,
    /// Pointer to a generic value container
    Variant,
}

/// Runtime type descriptor
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub kind: DescriptorKind,
    /// Value is passed by pointer rather than embedded by value
    pub pointer: bool,
}

impl TypeDescriptor {
    #[inline]
    pub fn new(kind: DescriptorKind, pointer: bool) -> Self {
        Self { kind, pointer }
    }

    pub fn void() -> Self {
        Self::new(DescriptorKind::Void, false)
    }

    pub fn primitive(p: Primitive) -> Self {
        Self::new(DescriptorKind::Primitive(p), false)
    }

    pub fn boolean() -> Self {
        Self::primitive(Primitive::Boolean)
    }

    pub fn int32() -> Self {
        Self::primitive(Primitive::Int32)
    }

    pub fn uint8() -> Self {
        Self::primitive(Primitive::UInt8)
    }

    pub fn int64() -> Self {
        Self::primitive(Primitive::Int64)
    }

    pub fn double() -> Self {
        Self::primitive(Primitive::Double)
    }

    pub fn utf8() -> Self {
        Self::new(DescriptorKind::Utf8, true)
    }

    pub fn filename() -> Self {
        Self::new(DescriptorKind::Filename, true)
    }

    pub fn pointer() -> Self {
        Self::new(DescriptorKind::Pointer, true)
    }

    /// Pointer to an instance of `info`
    pub fn compound(info: Arc<CompoundInfo>) -> Self {
        Self::new(DescriptorKind::Compound(info), true)
    }

    /// Instance of `info` embedded by value
    pub fn embedded(info: Arc<CompoundInfo>) -> Self {
        Self::new(DescriptorKind::Compound(info), false)
    }

    pub fn enumeration(info: Arc<EnumInfo>) -> Self {
        Self::new(DescriptorKind::Enum(info), false)
    }

    pub fn callback(info: Arc<CallableInfo>) -> Self {
        Self::new(DescriptorKind::Callback(info), true)
    }

    pub fn error() -> Self {
        Self::new(DescriptorKind::Error, true)
    }

    pub fn variant() -> Self {
        Self::new(DescriptorKind::Variant, true)
    }

    /// Array whose length travels in another callable argument
    pub fn array_with_length(element: TypeDescriptor, length_arg: usize) -> Self {
        Self::new(
            DescriptorKind::Array(ArrayInfo {
                element: Box::new(element),
                fixed_size: None,
                zero_terminated: false,
                length_arg: Some(length_arg),
            }),
            true,
        )
    }

    pub fn array_zero_terminated(element: TypeDescriptor) -> Self {
        Self::new(
            DescriptorKind::Array(ArrayInfo {
                element: Box::new(element),
                fixed_size: None,
                zero_terminated: true,
                length_arg: None,
            }),
            true,
        )
    }

    pub fn array_fixed(element: TypeDescriptor, size: usize) -> Self {
        Self::new(
            DescriptorKind::Array(ArrayInfo {
                element: Box::new(element),
                fixed_size: Some(size),
                zero_terminated: false,
                length_arg: None,
            }),
            true,
        )
    }

    pub fn list(element: TypeDescriptor, links: ListLinks) -> Self {
        Self::new(
            DescriptorKind::List(ListInfo {
                element: Box::new(element),
                links,
            }),
            true,
        )
    }

    #[inline]
    pub fn is_void(&self) -> bool {
        matches!(self.kind, DescriptorKind::Void) && !self.pointer
    }

    /// Compound info when this descriptor names a struct/union/object
    #[inline]
    pub fn compound_info(&self) -> Option<&Arc<CompoundInfo>> {
        match &self.kind {
            DescriptorKind::Compound(info) => Some(info),
            _ => None,
        }
    }

    #[inline]
    pub fn array_info(&self) -> Option<&ArrayInfo> {
        match &self.kind {
            DescriptorKind::Array(info) => Some(info),
            _ => None,
        }
    }

    /// Name fragments for this type, concatenated by [`type_name`](Self::type_name)
    ///
    /// Container types wrap the fragments of their element type, so nested
    /// shapes read as e.g. `array<Gdk.Rectangle>`.
    pub fn name_parts(&self) -> Vec<String> {
        let mut parts = Vec::new();
        self.push_name_parts(&mut parts);
        parts
    }

    fn push_name_parts(&self, parts: &mut Vec<String>) {
        match &self.kind {
            DescriptorKind::Void if self.pointer => parts.push("gpointer".into()),
            DescriptorKind::Void => parts.push("void".into()),
            DescriptorKind::Primitive(p) => parts.push(p.name().into()),
            DescriptorKind::Utf8 => parts.push("utf8".into()),
            DescriptorKind::Filename => parts.push("filename".into()),
            DescriptorKind::Pointer => parts.push("gpointer".into()),
            DescriptorKind::Array(info) => {
                parts.push("array<".into());
                info.element.push_name_parts(parts);
                parts.push(">".into());
            }
            DescriptorKind::List(info) => {
                parts.push(match info.links {
                    ListLinks::Single => "slist<".into(),
                    ListLinks::Double => "list<".into(),
                });
                info.element.push_name_parts(parts);
                parts.push(">".into());
            }
            DescriptorKind::Compound(info) => push_qualified(parts, &info.namespace, &info.name),
            DescriptorKind::Enum(info) => push_qualified(parts, &info.namespace, &info.name),
            DescriptorKind::Callback(info) => push_qualified(parts, &info.namespace, &info.name),
            DescriptorKind::Error => parts.push("error".into()),
            DescriptorKind::Variant => parts.push("variant".into()),
        }
    }

    /// Fully qualified display name
    pub fn type_name(&self) -> String {
        self.name_parts().concat()
    }
}

fn push_qualified(parts: &mut Vec<String>, namespace: &str, name: &str) {
    if !namespace.is_empty() {
        parts.push(namespace.to_string());
        parts.push(".".into());
    }
    parts.push(name.to_string());
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.type_name())
    }
}
