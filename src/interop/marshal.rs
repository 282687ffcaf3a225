//! Value marshaling between scripting values and native slots
//!
//! Design: conversion dispatches exhaustively on [`DescriptorKind`]:
//! - Primitives convert by representation change with range checks
//! - Strings and arrays are borrowed for the call (`Transfer::None`) or
//!   duplicated into native-owned memory
//! - Records and objects go through [`Compound`] with the transfer mode
//!   translated to a [`Posture`]
//! - Callbacks become closures, native callbacks become script functions
//!
//! All temporaries a conversion needs are pushed onto the caller's
//! [`CallFrame`].

use super::abi::{primitive_storage, storage, Storage};
use super::closure;
use super::containers;
use super::frame::CallFrame;
use super::types::{NativeArg, NativeError};
use super::variant;
use crate::compound::{Compound, Posture, UnwrapFlags};
use crate::descriptor::{
    ArgInfo, CompoundInfo, DescriptorKind, EnumInfo, Primitive, Scope, Transfer, TypeDescriptor,
};
use crate::errors::{BindError, Result};
use crate::lifetime::Registry;
use crate::logging::log_marshal;
use crate::value::{ScriptFunction, Value};
use num_traits::NumCast;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

/// Convert `value` into `slot` according to `ty`
///
/// `arg` supplies per-parameter metadata (nullability, callback scope) when
/// converting a callable argument.
pub fn to_native(
    reg: &Registry,
    frame: &mut CallFrame,
    ty: &TypeDescriptor,
    transfer: Transfer,
    value: &Value,
    arg: Option<&ArgInfo>,
    slot: &mut NativeArg,
) -> Result<()> {
    log_marshal("to_native", ty, transfer);
    let nullable = arg.map_or(true, |a| a.nullable);

    if ty.pointer && value.is_nil() && !matches!(ty.kind, DescriptorKind::Array(_)) {
        if !nullable {
            return Err(BindError::null(ty.type_name()));
        }
        *slot = NativeArg::zeroed();
        return Ok(());
    }

    match &ty.kind {
        DescriptorKind::Void if ty.pointer => pointer_to_native(frame, value, slot),
        DescriptorKind::Void => Err(BindError::unsupported("void value")),
        DescriptorKind::Primitive(p) => primitive_to_native(reg, *p, value, slot),
        DescriptorKind::Utf8 | DescriptorKind::Filename => {
            let ptr = string_to_native(frame, &ty.kind, transfer, value)?;
            slot.v_pointer = ptr as *mut c_void;
            Ok(())
        }
        DescriptorKind::Pointer => pointer_to_native(frame, value, slot),
        DescriptorKind::Array(info) => {
            containers::array_to_native(reg, frame, info, transfer, value, nullable, slot)
        }
        DescriptorKind::List(info) => containers::list_to_native(reg, frame, info, transfer, value, slot),
        DescriptorKind::Compound(info) if ty.pointer => {
            compound_to_native(reg, frame, info, transfer, value, nullable, slot)
        }
        DescriptorKind::Compound(info) => Err(BindError::unsupported(format!(
            "{} passed by value",
            info.qualified_name()
        ))),
        DescriptorKind::Enum(info) => enum_to_native(info, value, slot),
        DescriptorKind::Callback(info) => match value {
            Value::Pointer(address) => {
                slot.v_pointer = *address as *mut c_void;
                Ok(())
            }
            Value::Function(target) => {
                let scope = arg.map_or(Scope::Forever, |a| a.scope);
                let handle = closure::bind_for_scope(reg, frame, info, target.clone(), scope)?;
                slot.v_pointer = handle.entry as *mut c_void;
                Ok(())
            }
            other => Err(BindError::type_mismatch("function", other.type_name())),
        },
        DescriptorKind::Error => match value {
            Value::Pointer(address) => {
                slot.v_pointer = *address as *mut c_void;
                Ok(())
            }
            other => Err(BindError::type_mismatch("error", other.type_name())),
        },
        DescriptorKind::Variant => {
            let raw = variant::to_variant(reg, None, value)?;
            frame.keep(value.clone())?;
            slot.v_pointer = frame.borrow_variant(raw)? as *mut c_void;
            Ok(())
        }
    }
}

/// Convert the native `slot` of type `ty` into a scripting value
///
/// `parent` is the wrapper owning the memory the slot was read from, if any;
/// records found there are wrapped as sub-objects of it.
pub fn to_script(
    reg: &Registry,
    ty: &TypeDescriptor,
    transfer: Transfer,
    slot: NativeArg,
    parent: Option<&Compound>,
) -> Result<Value> {
    log_marshal("to_script", ty, transfer);

    if ty.pointer && slot.pointer().is_null() && !matches!(ty.kind, DescriptorKind::Primitive(_)) {
        return Ok(Value::Nil);
    }

    match &ty.kind {
        DescriptorKind::Void if ty.pointer => Ok(Value::Pointer(slot.address())),
        DescriptorKind::Void => Ok(Value::Nil),
        DescriptorKind::Primitive(p) => primitive_to_script(*p, slot),
        DescriptorKind::Utf8 | DescriptorKind::Filename => {
            string_to_script(&ty.kind, transfer, slot.pointer() as *mut c_char)
        }
        DescriptorKind::Pointer => Ok(Value::Pointer(slot.address())),
        DescriptorKind::Array(info) => {
            containers::array_to_script(reg, info, transfer, slot, None, parent)
        }
        DescriptorKind::List(info) => containers::list_to_script(reg, info, transfer, slot, parent),
        DescriptorKind::Compound(info) if ty.pointer => {
            compound_to_script(reg, info, transfer, slot.address(), parent)
        }
        DescriptorKind::Compound(info) => {
            let posture = if parent.is_some() {
                Posture::Parent
            } else {
                Posture::Peek
            };
            Ok(Value::Compound(Compound::wrap(
                reg,
                info,
                slot.address(),
                posture,
                parent,
            )?))
        }
        DescriptorKind::Enum(info) => {
            let storage = primitive_storage(info.storage);
            let value = slot
                .get_int(storage)
                .ok_or_else(|| BindError::unsupported(format!("enum storage {:?}", storage)))?;
            Ok(Value::Int(value))
        }
        DescriptorKind::Callback(info) => Ok(Value::Function(native_function(
            reg,
            info.clone(),
            slot.address(),
        ))),
        DescriptorKind::Error => {
            let ptr = slot.pointer() as *mut NativeError;
            // Safety: non-null error records are malloc-based by convention
            let (domain, code, message) = if transfer == Transfer::None {
                unsafe {
                    let record = &*ptr;
                    let message = if record.message.is_null() {
                        String::new()
                    } else {
                        CStr::from_ptr(record.message).to_string_lossy().into_owned()
                    };
                    (record.domain, record.code, message)
                }
            } else {
                unsafe { NativeError::take_raw(ptr) }
            };
            let domain = reg
                .types()
                .error_domain(domain)
                .unwrap_or_else(|| format!("domain-{}", domain));
            Ok(Value::record([
                ("domain", Value::string(domain)),
                ("code", Value::Int(code as i64)),
                ("message", Value::string(message)),
            ]))
        }
        DescriptorKind::Variant => {
            let ptr = slot.pointer() as *mut super::types::Variant;
            // Safety: non-null variant pointers reference initialized variants
            let value = unsafe { variant::from_variant(reg, &*ptr)? };
            if transfer != Transfer::None {
                unsafe { (*ptr).clear() };
            }
            Ok(value)
        }
    }
}

// ============================================================================
// Primitives
// ============================================================================

fn integer_of(reg: &Registry, value: &Value, target: Primitive) -> Result<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Float(f) if reg.config().marshal.allow_float_to_int && f.fract() == 0.0 => {
            <i64 as NumCast>::from(*f).ok_or_else(|| BindError::range(f, target.name()))
        }
        other => Err(BindError::type_mismatch(target.name(), other.type_name())),
    }
}

/// Unsigned 64-bit values above `i64::MAX` reach scripting code as floats
fn unsigned64_of(reg: &Registry, value: &Value) -> Result<u64> {
    match value {
        Value::Float(f) if *f >= i64::MAX as f64 && f.fract() == 0.0 => {
            // u64::MAX and its neighbours round up to 2^64
            if *f == u64::MAX as f64 {
                return Ok(u64::MAX);
            }
            <u64 as NumCast>::from(*f).ok_or_else(|| BindError::range(f, Primitive::UInt64.name()))
        }
        other => narrow(integer_of(reg, other, Primitive::UInt64)?, Primitive::UInt64),
    }
}

fn narrow<T: NumCast>(value: i64, target: Primitive) -> Result<T> {
    <T as NumCast>::from(value).ok_or_else(|| BindError::range(value, target.name()))
}

fn float_of(value: &Value, target: Primitive) -> Result<f64> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        other => Err(BindError::type_mismatch(target.name(), other.type_name())),
    }
}

fn primitive_to_native(reg: &Registry, p: Primitive, value: &Value, slot: &mut NativeArg) -> Result<()> {
    match p {
        Primitive::Boolean => {
            slot.v_boolean = match value {
                Value::Bool(b) => *b as i32,
                Value::Nil => 0,
                other => return Err(BindError::type_mismatch("boolean", other.type_name())),
            }
        }
        Primitive::Int8 => slot.v_int8 = narrow(integer_of(reg, value, p)?, p)?,
        Primitive::UInt8 => slot.v_uint8 = narrow(integer_of(reg, value, p)?, p)?,
        Primitive::Int16 => slot.v_int16 = narrow(integer_of(reg, value, p)?, p)?,
        Primitive::UInt16 => slot.v_uint16 = narrow(integer_of(reg, value, p)?, p)?,
        Primitive::Int32 => slot.v_int32 = narrow(integer_of(reg, value, p)?, p)?,
        Primitive::UInt32 => slot.v_uint32 = narrow(integer_of(reg, value, p)?, p)?,
        Primitive::Int64 => slot.v_int64 = integer_of(reg, value, p)?,
        Primitive::UInt64 => slot.v_uint64 = unsigned64_of(reg, value)?,
        Primitive::HostType => slot.v_size = narrow(integer_of(reg, value, p)?, p)?,
        Primitive::Float => {
            let f = float_of(value, p)?;
            if f.is_finite() && f.abs() > f32::MAX as f64 {
                return Err(BindError::range(f, p.name()));
            }
            slot.v_float = f as f32;
        }
        Primitive::Double => slot.v_double = float_of(value, p)?,
        Primitive::Unichar => {
            slot.v_uint32 = match value {
                Value::Str(s) => {
                    let mut chars = s.chars();
                    match (chars.next(), chars.next()) {
                        (Some(c), None) => c as u32,
                        _ => {
                            return Err(BindError::type_mismatch(
                                "single character",
                                format!("string of length {}", s.chars().count()),
                            ))
                        }
                    }
                }
                Value::Int(i) => {
                    let code: u32 = narrow(*i, p)?;
                    char::from_u32(code).ok_or_else(|| BindError::range(i, p.name()))? as u32
                }
                other => return Err(BindError::type_mismatch(p.name(), other.type_name())),
            }
        }
    }
    Ok(())
}

fn primitive_to_script(p: Primitive, slot: NativeArg) -> Result<Value> {
    // Safety: slots are zero-initialized unions of plain data
    let value = unsafe {
        match p {
            Primitive::Boolean => Value::Bool(slot.v_boolean != 0),
            Primitive::Int8 => Value::Int(slot.v_int8 as i64),
            Primitive::UInt8 => Value::Int(slot.v_uint8 as i64),
            Primitive::Int16 => Value::Int(slot.v_int16 as i64),
            Primitive::UInt16 => Value::Int(slot.v_uint16 as i64),
            Primitive::Int32 => Value::Int(slot.v_int32 as i64),
            Primitive::UInt32 => Value::Int(slot.v_uint32 as i64),
            Primitive::Int64 => Value::Int(slot.v_int64),
            Primitive::UInt64 => match <i64 as NumCast>::from(slot.v_uint64) {
                Some(i) => Value::Int(i),
                None => Value::Float(slot.v_uint64 as f64),
            },
            Primitive::HostType => Value::Int(slot.v_size as i64),
            Primitive::Float => Value::Float(slot.v_float as f64),
            Primitive::Double => Value::Float(slot.v_double),
            Primitive::Unichar => {
                let code = slot.v_uint32;
                let c = char::from_u32(code).ok_or_else(|| BindError::range(code, "unichar"))?;
                Value::string(c.to_string())
            }
        }
    };
    Ok(value)
}

// ============================================================================
// Strings and pointers
// ============================================================================

/// C string for `value`, borrowed through the frame or duplicated for native
pub(crate) fn string_to_native(
    frame: &mut CallFrame,
    kind: &DescriptorKind,
    transfer: Transfer,
    value: &Value,
) -> Result<*const c_char> {
    let bytes: &[u8] = match (value, kind) {
        (Value::Str(s), _) => s.as_bytes(),
        (Value::Bytes(b), DescriptorKind::Filename) => b,
        (other, _) => return Err(BindError::type_mismatch("string", other.type_name())),
    };
    let cstring = CString::new(bytes)
        .map_err(|_| BindError::type_mismatch("string without embedded NUL", "string containing NUL"))?;

    if transfer == Transfer::None {
        return frame.borrow_cstring(cstring);
    }

    // Safety: strdup copies a valid NUL-terminated string
    let dup = unsafe { libc::strdup(cstring.as_ptr()) };
    if dup.is_null() {
        return Err(BindError::allocation(bytes.len() + 1));
    }
    frame.transferred(dup as usize, libc::free)?;
    Ok(dup)
}

fn string_to_script(kind: &DescriptorKind, transfer: Transfer, ptr: *mut c_char) -> Result<Value> {
    // Safety: non-null string slots hold NUL-terminated strings
    let cstr = unsafe { CStr::from_ptr(ptr) };
    let value = match kind {
        DescriptorKind::Filename => Value::string(cstr.to_string_lossy()),
        _ => match cstr.to_str() {
            Ok(s) => Value::string(s),
            Err(_) => {
                let err = BindError::type_mismatch("utf8", "invalid UTF-8 sequence");
                if transfer != Transfer::None {
                    // Safety: ownership of the string was transferred to us
                    unsafe { libc::free(ptr as *mut c_void) };
                }
                return Err(err);
            }
        },
    };
    if transfer != Transfer::None {
        // Safety: see above
        unsafe { libc::free(ptr as *mut c_void) };
    }
    Ok(value)
}

fn pointer_to_native(frame: &mut CallFrame, value: &Value, slot: &mut NativeArg) -> Result<()> {
    slot.v_pointer = match value {
        Value::Nil => std::ptr::null_mut(),
        Value::Pointer(address) => *address as *mut c_void,
        Value::Compound(c) => c.address()? as *mut c_void,
        Value::Guard(g) => g.data(),
        Value::Str(_) => string_to_native(frame, &DescriptorKind::Utf8, Transfer::None, value)? as *mut c_void,
        Value::Bytes(b) => frame.borrow_buffer(b.to_vec())?,
        other => return Err(BindError::type_mismatch("pointer", other.type_name())),
    };
    Ok(())
}

// ============================================================================
// Records and objects
// ============================================================================

fn compound_to_native(
    reg: &Registry,
    frame: &mut CallFrame,
    info: &Arc<CompoundInfo>,
    transfer: Transfer,
    value: &Value,
    nullable: bool,
    slot: &mut NativeArg,
) -> Result<()> {
    let compound = match value {
        Value::Record(_) => {
            let built = Compound::construct(reg, info, value)?;
            frame.keep(Value::Compound(built.clone()))?;
            built
        }
        Value::Compound(c) => c.clone(),
        other => return Err(BindError::type_mismatch(info.qualified_name(), other.type_name())),
    };

    let flags = if nullable {
        UnwrapFlags::OPTIONAL
    } else {
        UnwrapFlags::empty()
    };
    let address = Compound::unwrap(reg, &Value::Compound(compound.clone()), info, flags)?.address;
    let mut passed = address;

    if transfer != Transfer::None {
        let ptr = address as *mut c_void;
        if info.category.is_object() {
            if let (Some(ref_instance), Some(unref)) = (info.ref_instance, info.unref_instance) {
                // Safety: live instance; the extra reference travels with the call
                unsafe { ref_instance(ptr) };
                frame.transferred(address, unref)?;
            }
        } else if compound.posture().owns_memory() {
            frame.relinquish_on_commit(compound)?;
        } else if let Some(copy) = info.copy {
            // Safety: copying a live instance
            let dup = unsafe { copy(ptr) };
            if dup.is_null() {
                return Err(BindError::allocation(info.size));
            }
            frame.transferred(dup as usize, info.free.unwrap_or(libc::free))?;
            passed = dup as usize;
        } else {
            tracing::warn!(
                ty = %info.qualified_name(),
                "ownership requested for a borrowed record without copy function, passing borrowed"
            );
        }
    }

    slot.v_pointer = passed as *mut c_void;
    Ok(())
}

pub(crate) fn compound_to_script(
    reg: &Registry,
    info: &Arc<CompoundInfo>,
    transfer: Transfer,
    address: usize,
    parent: Option<&Compound>,
) -> Result<Value> {
    let ptr = address as *mut c_void;
    let (address, posture) = if info.category.is_object() {
        match (transfer, info.ref_instance) {
            (Transfer::None, Some(ref_instance)) => {
                // Safety: live instance borrowed from native code
                unsafe { ref_instance(ptr) };
                (address, Posture::Own)
            }
            (Transfer::None, None) => (address, Posture::Peek),
            _ => (address, Posture::Own),
        }
    } else {
        match transfer {
            Transfer::None if parent.is_some() => (address, Posture::Parent),
            Transfer::None => match info.copy {
                Some(copy) => {
                    // Safety: copying a live instance
                    let dup = unsafe { copy(ptr) };
                    if dup.is_null() {
                        return Err(BindError::allocation(info.size));
                    }
                    (dup as usize, Posture::Own)
                }
                None => (address, Posture::Peek),
            },
            _ => (address, Posture::Own),
        }
    };
    Ok(Value::Compound(Compound::wrap(reg, info, address, posture, parent)?))
}

// ============================================================================
// Enums and flags
// ============================================================================

fn enum_member(info: &EnumInfo, value: &Value) -> Result<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Str(name) => info.lookup(name).ok_or_else(|| {
            BindError::type_mismatch(
                format!("member of {}.{}", info.namespace, info.name),
                format!("'{}'", name),
            )
        }),
        other => Err(BindError::type_mismatch(info.name.clone(), other.type_name())),
    }
}

fn enum_to_native(info: &EnumInfo, value: &Value, slot: &mut NativeArg) -> Result<()> {
    let raw = match value {
        Value::Array(items) if info.is_flags => items
            .iter()
            .try_fold(0i64, |acc, item| Ok::<_, BindError>(acc | enum_member(info, item)?))?,
        Value::Nil if info.is_flags => 0,
        other => enum_member(info, other)?,
    };

    let storage = primitive_storage(info.storage);
    let fits = match storage {
        Storage::I8 => <i8 as NumCast>::from(raw).is_some(),
        Storage::U8 => <u8 as NumCast>::from(raw).is_some(),
        Storage::I16 => <i16 as NumCast>::from(raw).is_some(),
        Storage::U16 => <u16 as NumCast>::from(raw).is_some(),
        Storage::I32 => <i32 as NumCast>::from(raw).is_some(),
        Storage::U32 => <u32 as NumCast>::from(raw).is_some(),
        _ => true,
    };
    if !fits {
        return Err(BindError::range(raw, info.name.clone()));
    }
    slot.set_int(storage, raw);
    Ok(())
}

// ============================================================================
// Native callbacks seen from scripting code
// ============================================================================

fn native_function(reg: &Registry, info: Arc<crate::descriptor::CallableInfo>, address: usize) -> ScriptFunction {
    let registry = reg.downgrade();
    ScriptFunction::new(move |args| {
        let reg = crate::lifetime::registry::upgrade(&registry)?;
        let callable = super::call::Callable::build(&reg, &info)?;
        callable.invoke(&reg, Some(address), args)
    })
}

// ============================================================================
// Caller-allocated out arguments
// ============================================================================

/// Storage preallocated for a caller-allocates out argument
pub enum CallerAllocated {
    Record(Compound),
    Buffer { address: usize, count: usize },
}

/// Preallocate storage for `arg` when it is a caller-allocates out argument
///
/// Returns `None` when the generic out handling applies instead.
pub fn caller_alloc(
    reg: &Registry,
    frame: &mut CallFrame,
    arg: &ArgInfo,
) -> Result<Option<(NativeArg, CallerAllocated)>> {
    if !arg.caller_allocates || arg.direction != crate::descriptor::Direction::Out {
        return Ok(None);
    }
    match &arg.ty.kind {
        DescriptorKind::Compound(info) if !info.category.is_object() => {
            let record = Compound::allocate(reg, info)?;
            let slot = NativeArg::from_address(record.address()?);
            Ok(Some((slot, CallerAllocated::Record(record))))
        }
        DescriptorKind::Array(info) => match info.fixed_size {
            Some(count) => {
                let size = (count * storage(&info.element).size()).max(1);
                // Safety: zeroed scratch released with the frame
                let ptr = unsafe { libc::calloc(1, size) };
                if ptr.is_null() {
                    return Err(BindError::allocation(size));
                }
                frame.scratch(ptr as usize, libc::free)?;
                Ok(Some((
                    NativeArg::from_pointer(ptr),
                    CallerAllocated::Buffer {
                        address: ptr as usize,
                        count,
                    },
                )))
            }
            None => Ok(None),
        },
        _ => Ok(None),
    }
}

/// Scripting value of a caller-allocated argument after the call
pub fn caller_alloc_to_script(
    reg: &Registry,
    arg: &ArgInfo,
    allocated: CallerAllocated,
) -> Result<Value> {
    match (allocated, &arg.ty.kind) {
        (CallerAllocated::Record(record), _) => Ok(Value::Compound(record)),
        (CallerAllocated::Buffer { address, count }, DescriptorKind::Array(info)) => {
            containers::array_to_script(
                reg,
                info,
                Transfer::None,
                NativeArg::from_address(address),
                Some(count),
                None,
            )
        }
        (CallerAllocated::Buffer { .. }, _) => Err(BindError::unsupported(arg.ty.type_name())),
    }
}
