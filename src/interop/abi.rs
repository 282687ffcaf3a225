//! Calling-convention mapping
//!
//! Translates descriptors into storage classes and libffi types, and builds
//! call interfaces for callable plans and closures.

use crate::descriptor::{DescriptorKind, Primitive, TypeDescriptor};
use crate::errors::{BindError, Result};
use libffi::middle::{Cif, Type};

/// How a value of some descriptor occupies native memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Void,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Pointer,
    /// Record stored inline
    Embedded { size: usize, align: usize },
}

impl Storage {
    #[inline]
    pub fn size(self) -> usize {
        match self {
            Storage::Void => 0,
            Storage::I8 | Storage::U8 => 1,
            Storage::I16 | Storage::U16 => 2,
            Storage::I32 | Storage::U32 | Storage::F32 => 4,
            Storage::I64 | Storage::U64 | Storage::F64 => 8,
            Storage::Pointer => std::mem::size_of::<usize>(),
            Storage::Embedded { size, .. } => size,
        }
    }

    #[inline]
    pub fn align(self) -> usize {
        match self {
            Storage::Embedded { align, .. } => align,
            Storage::Void => 1,
            other => other.size(),
        }
    }

    #[inline]
    pub fn is_integral(self) -> bool {
        matches!(
            self,
            Storage::I8
                | Storage::U8
                | Storage::I16
                | Storage::U16
                | Storage::I32
                | Storage::U32
                | Storage::I64
                | Storage::U64
        )
    }

    pub fn ffi_type(self) -> Result<Type> {
        Ok(match self {
            Storage::Void => Type::void(),
            Storage::I8 => Type::i8(),
            Storage::U8 => Type::u8(),
            Storage::I16 => Type::i16(),
            Storage::U16 => Type::u16(),
            Storage::I32 => Type::i32(),
            Storage::U32 => Type::u32(),
            Storage::I64 => Type::i64(),
            Storage::U64 => Type::u64(),
            Storage::F32 => Type::f32(),
            Storage::F64 => Type::f64(),
            Storage::Pointer => Type::pointer(),
            Storage::Embedded { .. } => {
                return Err(BindError::unsupported("record passed by value"))
            }
        })
    }
}

pub fn primitive_storage(p: Primitive) -> Storage {
    match p {
        Primitive::Boolean | Primitive::Int32 => Storage::I32,
        Primitive::Int8 => Storage::I8,
        Primitive::UInt8 => Storage::U8,
        Primitive::Int16 => Storage::I16,
        Primitive::UInt16 => Storage::U16,
        Primitive::UInt32 | Primitive::Unichar => Storage::U32,
        Primitive::Int64 => Storage::I64,
        Primitive::UInt64 => Storage::U64,
        Primitive::Float => Storage::F32,
        Primitive::Double => Storage::F64,
        Primitive::HostType => Storage::Pointer,
    }
}

/// Storage class of `ty`
pub fn storage(ty: &TypeDescriptor) -> Storage {
    match &ty.kind {
        DescriptorKind::Void if !ty.pointer => Storage::Void,
        DescriptorKind::Primitive(p) if !ty.pointer => primitive_storage(*p),
        DescriptorKind::Enum(info) if !ty.pointer => primitive_storage(info.storage),
        DescriptorKind::Compound(info) if !ty.pointer => Storage::Embedded {
            size: info.size,
            align: info.align,
        },
        _ => Storage::Pointer,
    }
}

/// Bytes occupied by one value of `ty` in arrays and records
#[inline]
pub fn native_size(ty: &TypeDescriptor) -> usize {
    storage(ty).size()
}

#[inline]
pub fn native_align(ty: &TypeDescriptor) -> usize {
    storage(ty).align()
}

pub fn ffi_type(ty: &TypeDescriptor) -> Result<Type> {
    storage(ty).ffi_type()
}

/// Call interface for the given native parameter and return types
pub fn build_cif<'a, I>(params: I, ret: &TypeDescriptor) -> Result<Cif>
where
    I: IntoIterator<Item = &'a TypeDescriptor>,
{
    let types = params
        .into_iter()
        .map(ffi_type)
        .collect::<Result<Vec<_>>>()?;
    Ok(Cif::new(types, ffi_type(ret)?))
}

/// Narrow a raw return register to the slot layout of `ty`
///
/// libffi widens integral returns smaller than a register to `ffi_arg`.
pub fn narrow_return(ty: &TypeDescriptor, raw: super::types::NativeArg) -> super::types::NativeArg {
    let s = storage(ty);
    if s.is_integral() && s.size() < std::mem::size_of::<libffi::raw::ffi_arg>() {
        // Safety: integral return registers are fully written by libffi
        let wide = unsafe { raw.v_size } as i64;
        let mut out = super::types::NativeArg::zeroed();
        out.set_int(s, wide);
        out
    } else {
        raw
    }
}

/// Widen a slot into the `ffi_arg`-sized return register expected by libffi
pub fn widen_return(ty: &TypeDescriptor, arg: super::types::NativeArg) -> super::types::NativeArg {
    let s = storage(ty);
    match arg.get_int(s) {
        Some(v) if s.size() < std::mem::size_of::<libffi::raw::ffi_arg>() => {
            let mut out = super::types::NativeArg::zeroed();
            out.v_size = v as usize;
            out
        }
        _ => arg,
    }
}
