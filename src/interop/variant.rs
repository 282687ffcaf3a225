//! Generic value containers
//!
//! Conversion between scripting values and the tagged [`Variant`] container,
//! object construction from property tables, and value closures: scripting
//! functions behind a native marshal entry point taking variant parameters.

use super::abi::primitive_storage;
use super::frame::CallFrame;
use super::marshal;
use super::types::{NativeArg, Variant, VariantTag};
use crate::compound::{Compound, UnwrapFlags};
use crate::descriptor::{CompoundInfo, DescriptorKind, HostType, Primitive, Transfer, TypeDescriptor};
use crate::errors::{BindError, Result};
use crate::lifetime::registry::{upgrade, RegistryInner};
use crate::lifetime::Registry;
use crate::logging::log_callback_error;
use crate::value::{ScriptFunction, Value};
use num_traits::NumCast;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::{Arc, Weak};

/// Variant holding `value`, typed by `ty` or inferred from the value
///
/// Strings are duplicated into the variant, which owns them until
/// [`Variant::clear`]. Compounds are borrowed: the caller keeps the wrapper
/// alive while the variant is in use.
pub fn to_variant(reg: &Registry, ty: Option<&TypeDescriptor>, value: &Value) -> Result<Variant> {
    let Some(ty) = ty else {
        return infer_variant(value);
    };
    let mut variant = Variant::empty();

    match &ty.kind {
        DescriptorKind::Primitive(p) if !ty.pointer => {
            let mut frame = CallFrame::with_limit(0);
            let mut s = NativeArg::zeroed();
            marshal::to_native(reg, &mut frame, ty, Transfer::None, value, None, &mut s)?;
            // Safety: slot written by to_native for this primitive
            unsafe {
                match p {
                    Primitive::Boolean => set(&mut variant, VariantTag::Boolean, |d| d.v_int64 = (s.v_boolean != 0) as i64),
                    Primitive::Float => set(&mut variant, VariantTag::Double, |d| d.v_double = s.v_float as f64),
                    Primitive::Double => set(&mut variant, VariantTag::Double, |d| d.v_double = s.v_double),
                    Primitive::UInt8
                    | Primitive::UInt16
                    | Primitive::UInt32
                    | Primitive::UInt64
                    | Primitive::Unichar
                    | Primitive::HostType => {
                        let raw = s.get_int(primitive_storage(*p)).unwrap_or(0);
                        set(&mut variant, VariantTag::UInt, |d| d.v_uint64 = raw as u64)
                    }
                    Primitive::Int8 | Primitive::Int16 | Primitive::Int32 | Primitive::Int64 => {
                        let raw = s.get_int(primitive_storage(*p)).unwrap_or(0);
                        set(&mut variant, VariantTag::Int, |d| d.v_int64 = raw)
                    }
                }
            }
        }
        DescriptorKind::Enum(info) => {
            let mut frame = CallFrame::with_limit(0);
            let mut s = NativeArg::zeroed();
            marshal::to_native(reg, &mut frame, ty, Transfer::None, value, None, &mut s)?;
            let raw = s.get_int(primitive_storage(info.storage)).unwrap_or(0);
            set(&mut variant, VariantTag::Int, |d| d.v_int64 = raw);
        }
        DescriptorKind::Utf8 | DescriptorKind::Filename => match value {
            Value::Nil => set(&mut variant, VariantTag::String, |d| d.v_pointer = std::ptr::null_mut()),
            Value::Str(s) => {
                let dup = strdup(s)?;
                set(&mut variant, VariantTag::String, |d| d.v_pointer = dup);
            }
            other => return Err(BindError::type_mismatch("string", other.type_name())),
        },
        DescriptorKind::Compound(info) if ty.pointer => {
            let unwrapped = Compound::unwrap(reg, value, info, UnwrapFlags::OPTIONAL)?;
            set(&mut variant, VariantTag::Compound, |d| d.v_size = unwrapped.address);
            variant.host_type = unwrapped.runtime_type.0;
        }
        DescriptorKind::Pointer | DescriptorKind::Void if ty.pointer => {
            let address = match value {
                Value::Nil => 0,
                Value::Pointer(address) => *address,
                Value::Compound(c) => c.address()?,
                Value::Guard(g) => g.data() as usize,
                other => return Err(BindError::type_mismatch("pointer", other.type_name())),
            };
            set(&mut variant, VariantTag::Pointer, |d| d.v_size = address);
        }
        _ => return Err(BindError::unsupported(format!("variant of {}", ty))),
    }
    Ok(variant)
}

fn set(variant: &mut Variant, tag: VariantTag, fill: impl FnOnce(&mut NativeArg)) {
    variant.tag = tag as u32;
    fill(&mut variant.data);
}

fn strdup(s: &str) -> Result<*mut c_void> {
    let text = CString::new(s)
        .map_err(|_| BindError::type_mismatch("string without embedded NUL", "string containing NUL"))?;
    // Safety: valid NUL-terminated input
    let dup = unsafe { libc::strdup(text.as_ptr()) };
    if dup.is_null() {
        return Err(BindError::allocation(s.len() + 1));
    }
    Ok(dup as *mut c_void)
}

fn infer_variant(value: &Value) -> Result<Variant> {
    let mut variant = Variant::empty();
    match value {
        Value::Nil => {}
        Value::Bool(b) => set(&mut variant, VariantTag::Boolean, |d| d.v_int64 = *b as i64),
        Value::Int(i) => set(&mut variant, VariantTag::Int, |d| d.v_int64 = *i),
        Value::Float(f) => set(&mut variant, VariantTag::Double, |d| d.v_double = *f),
        Value::Str(s) => {
            let dup = strdup(s)?;
            set(&mut variant, VariantTag::String, |d| d.v_pointer = dup);
        }
        Value::Compound(c) => {
            let address = c.address()?;
            set(&mut variant, VariantTag::Compound, |d| d.v_size = address);
            variant.host_type = c.runtime_type().0;
        }
        Value::Pointer(address) => set(&mut variant, VariantTag::Pointer, |d| d.v_size = *address),
        Value::Guard(g) => {
            let data = g.data();
            set(&mut variant, VariantTag::Pointer, |d| d.v_pointer = data);
        }
        other => {
            return Err(BindError::type_mismatch(
                "value representable as variant",
                other.type_name(),
            ))
        }
    }
    Ok(variant)
}

/// Scripting value of a variant; the variant keeps its contents
pub fn from_variant(reg: &Registry, variant: &Variant) -> Result<Value> {
    let tag = variant
        .tag()
        .ok_or_else(|| BindError::type_mismatch("variant tag", format!("tag {}", variant.tag)))?;
    let data = variant.data;

    // Safety: the tag names the initialized union member
    let value = unsafe {
        match tag {
            VariantTag::Empty => Value::Nil,
            VariantTag::Boolean => Value::Bool(data.v_int64 != 0),
            VariantTag::Int => Value::Int(data.v_int64),
            VariantTag::UInt => match <i64 as NumCast>::from(data.v_uint64) {
                Some(i) => Value::Int(i),
                None => Value::Float(data.v_uint64 as f64),
            },
            VariantTag::Double => Value::Float(data.v_double),
            VariantTag::String if data.v_pointer.is_null() => Value::Nil,
            VariantTag::String => match CStr::from_ptr(data.v_pointer as *const c_char).to_str() {
                Ok(s) => Value::string(s),
                Err(_) => return Err(BindError::type_mismatch("utf8", "invalid UTF-8 sequence")),
            },
            VariantTag::Pointer => Value::Pointer(data.v_size),
            VariantTag::Compound if data.v_size == 0 => Value::Nil,
            VariantTag::Compound => {
                let info = reg.repository().find_compound(HostType(variant.host_type));
                match info {
                    Some(info) => marshal::compound_to_script(reg, &info, Transfer::None, data.v_size, None)?,
                    None => Value::Pointer(data.v_size),
                }
            }
        }
    };
    Ok(value)
}

/// Variants cleared together on drop
struct VariantList(Vec<Variant>);

impl Drop for VariantList {
    fn drop(&mut self) {
        for v in self.0.iter_mut() {
            v.clear();
        }
    }
}

/// Create an object instance through the type's construction protocol
///
/// Every table entry must name a property of `info`.
pub fn construct_object(
    reg: &Registry,
    info: &Arc<CompoundInfo>,
    properties: &BTreeMap<String, Value>,
) -> Result<usize> {
    let construct = info.construct.ok_or_else(|| {
        BindError::unsupported(format!("{} has no construction protocol", info.qualified_name()))
    })?;

    let mut names = Vec::with_capacity(properties.len());
    let mut values = VariantList(Vec::with_capacity(properties.len()));
    for (position, (name, value)) in properties.iter().enumerate() {
        let property = info.property(name).ok_or_else(|| {
            BindError::type_mismatch(
                format!("property of {}", info.qualified_name()),
                format!("'{}'", name),
            )
        })?;
        let variant = to_variant(reg, Some(&property.ty), value)
            .map_err(|e| e.at_arg(position + 1, Some(name)))?;
        values.0.push(variant);
        names.push(CString::new(name.as_str()).map_err(|_| {
            BindError::type_mismatch("property name", "name containing NUL")
        })?);
    }
    let name_ptrs: Vec<*const c_char> = names.iter().map(|n| n.as_ptr()).collect();

    // Safety: arrays of equal length, alive for the duration of the call;
    // compounds referenced by variants are borrowed from `properties`
    let address = unsafe {
        construct(
            info.host_type.0,
            values.0.len() as u32,
            name_ptrs.as_ptr(),
            values.0.as_ptr(),
        )
    };
    if address.is_null() {
        return Err(BindError::native(
            info.qualified_name(),
            0,
            "construction returned no instance",
        ));
    }
    Ok(address as usize)
}

// ============================================================================
// Value closures
// ============================================================================

/// Native marshal entry point of a value closure
pub type VariantMarshal =
    unsafe extern "C" fn(data: *mut c_void, ret: *mut Variant, n_params: u32, params: *const Variant);

struct ValueClosureData {
    registry: Weak<RegistryInner>,
    target: ScriptFunction,
    return_type: Option<TypeDescriptor>,
    /// Most recent result, kept alive while native code reads `ret`
    last_result: Mutex<Value>,
}

/// Scripting function callable by native code through [`VariantMarshal`]
pub struct ValueClosure {
    data: Box<ValueClosureData>,
}

impl ValueClosure {
    pub fn new(reg: &Registry, target: ScriptFunction, return_type: Option<TypeDescriptor>) -> Self {
        crate::logging::log_closure_event("created", "value closure");
        Self {
            data: Box::new(ValueClosureData {
                registry: reg.downgrade(),
                target,
                return_type,
                last_result: Mutex::new(Value::Nil),
            }),
        }
    }

    pub fn marshal_fn(&self) -> VariantMarshal {
        value_closure_marshal
    }

    /// Data pointer handed to [`marshal_fn`](Self::marshal_fn)
    pub fn data(&self) -> *mut c_void {
        self.data.as_ref() as *const ValueClosureData as *mut c_void
    }

    /// Call through the native entry point
    pub fn invoke(&self, params: &[Variant]) -> Variant {
        let mut ret = Variant::empty();
        // Safety: data pointer of this closure, params slice alive for the call
        unsafe { (self.marshal_fn())(self.data(), &mut ret, params.len() as u32, params.as_ptr()) };
        ret
    }
}

impl Drop for ValueClosure {
    fn drop(&mut self) {
        crate::logging::log_closure_event("destroyed", "value closure");
    }
}

unsafe extern "C" fn value_closure_marshal(
    data: *mut c_void,
    ret: *mut Variant,
    n_params: u32,
    params: *const Variant,
) {
    if data.is_null() {
        return;
    }
    let data = &*(data as *const ValueClosureData);
    let params = if n_params == 0 || params.is_null() {
        &[][..]
    } else {
        std::slice::from_raw_parts(params, n_params as usize)
    };

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        dispatch_value_closure(data, ret, params)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log_callback_error("value closure", &e.to_string()),
        Err(_) => log_callback_error("value closure", "panic in scripting target"),
    }
}

fn dispatch_value_closure(data: &ValueClosureData, ret: *mut Variant, params: &[Variant]) -> Result<()> {
    let reg = upgrade(&data.registry)?;
    let _turn = reg.enter();

    let args = params
        .iter()
        .enumerate()
        .map(|(i, p)| from_variant(&reg, p).map_err(|e| e.at_arg(i + 1, None)))
        .collect::<Result<Vec<_>>>()?;
    let result = data.target.call(&args)?.into_iter().next().unwrap_or(Value::Nil);

    if !ret.is_null() {
        let variant = to_variant(&reg, data.return_type.as_ref(), &result)?;
        // Safety: caller supplied a valid return slot
        unsafe {
            (*ret).clear();
            *ret = variant;
        }
    }
    *data.last_result.lock() = result;
    Ok(())
}
