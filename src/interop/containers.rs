//! C arrays and linked lists
//!
//! Arrays are always copied into fresh native storage; a `Transfer::None`
//! array lives in the call frame, any other transfer hands the storage to
//! native code. Embedded record elements are copied by value.
//!
//! Lists use the classic `{ data, next }` / `{ data, next, prev }` node
//! layouts with pointer-sized payloads.

use super::abi::{native_size, storage, Storage};
use super::frame::CallFrame;
use super::marshal;
use super::types::{read_slot, write_slot, NativeArg};
use crate::compound::{Compound, UnwrapFlags};
use crate::descriptor::{
    ArrayInfo, CompoundInfo, DescriptorKind, ListInfo, ListLinks, Primitive, Transfer,
    TypeDescriptor,
};
use crate::errors::{BindError, Result};
use crate::lifetime::Registry;
use crate::value::Value;
use std::ffi::c_void;
use std::sync::Arc;

/// Number of elements a scripting value contributes to a length argument
pub fn script_len(value: &Value) -> Option<usize> {
    match value {
        Value::Nil => Some(0),
        Value::Array(items) => Some(items.len()),
        Value::Bytes(bytes) => Some(bytes.len()),
        Value::Str(s) => Some(s.len()),
        _ => None,
    }
}

fn is_byte_element(ty: &TypeDescriptor) -> bool {
    !ty.pointer
        && matches!(
            ty.kind,
            DescriptorKind::Primitive(Primitive::Int8 | Primitive::UInt8)
        )
}

fn embedded_info(ty: &TypeDescriptor) -> Option<&Arc<CompoundInfo>> {
    match (&ty.kind, ty.pointer) {
        (DescriptorKind::Compound(info), false) => Some(info),
        _ => None,
    }
}

fn calloc(size: usize) -> Result<*mut u8> {
    let size = size.max(1);
    // Safety: plain zeroed allocation
    let ptr = unsafe { libc::calloc(1, size) } as *mut u8;
    if ptr.is_null() {
        return Err(BindError::allocation(size));
    }
    crate::logging::log_allocation(size, ptr as usize);
    Ok(ptr)
}

pub fn array_to_native(
    reg: &Registry,
    frame: &mut CallFrame,
    info: &ArrayInfo,
    transfer: Transfer,
    value: &Value,
    nullable: bool,
    slot: &mut NativeArg,
) -> Result<()> {
    let element = info.element.as_ref();
    let elem_size = native_size(element);

    let bytes: Option<&[u8]> = match value {
        Value::Bytes(b) if is_byte_element(element) => Some(b),
        Value::Str(s) if is_byte_element(element) => Some(s.as_bytes()),
        _ => None,
    };
    let count = match (value, bytes) {
        (_, Some(b)) => b.len(),
        (Value::Array(items), _) => items.len(),
        (Value::Nil, _) if nullable => {
            *slot = NativeArg::zeroed();
            return Ok(());
        }
        (Value::Nil, _) => return Err(BindError::null(format!("array<{}>", element))),
        (other, _) => return Err(BindError::type_mismatch("array", other.type_name())),
    };

    let capacity = match info.fixed_size {
        Some(fixed) if count > fixed => {
            return Err(BindError::range(count, format!("array of {} elements", fixed)))
        }
        Some(fixed) => fixed,
        None => count,
    };
    let total = capacity + usize::from(info.zero_terminated);

    let base = calloc(total * elem_size)?;
    if transfer == Transfer::None {
        frame.scratch(base as usize, libc::free)?;
    } else {
        frame.transferred(base as usize, libc::free)?;
    }

    match (value, bytes) {
        (_, Some(b)) => {
            // Safety: `base` holds at least `count` bytes
            unsafe { std::ptr::copy_nonoverlapping(b.as_ptr(), base, b.len()) };
        }
        (Value::Array(items), _) => {
            let mut elements = frame.elements();
            for (i, item) in items.iter().enumerate() {
                // Safety: index below capacity, element-sized stride
                let dst = unsafe { base.add(i * elem_size) };
                element_to_native(reg, &mut elements, element, transfer.for_elements(), item, dst)?;
            }
            frame.adopt_elements(elements)?;
        }
        _ => {}
    }

    slot.v_pointer = base as *mut c_void;
    Ok(())
}

fn element_to_native(
    reg: &Registry,
    frame: &mut CallFrame,
    element: &TypeDescriptor,
    transfer: Transfer,
    item: &Value,
    dst: *mut u8,
) -> Result<()> {
    if let Some(info) = embedded_info(element) {
        let source = match item {
            Value::Nil => return Ok(()),
            Value::Record(_) => {
                let built = Compound::construct(reg, info, item)?;
                frame.keep(Value::Compound(built.clone()))?;
                built.address()?
            }
            other => Compound::unwrap(reg, other, info, UnwrapFlags::empty())?.address,
        };
        // Safety: both sides hold `info.size` bytes
        unsafe { std::ptr::copy(source as *const u8, dst, info.size) };
        return Ok(());
    }

    let mut s = NativeArg::zeroed();
    marshal::to_native(reg, frame, element, transfer, item, None, &mut s)?;
    // Safety: `dst` is an element slot inside the array storage
    unsafe { write_slot(element, dst, s) }
}

pub fn array_to_script(
    reg: &Registry,
    info: &ArrayInfo,
    transfer: Transfer,
    slot: NativeArg,
    length: Option<usize>,
    parent: Option<&Compound>,
) -> Result<Value> {
    let element = info.element.as_ref();
    let elem_size = native_size(element);
    let base = slot.pointer() as *const u8;

    if base.is_null() {
        return Ok(match length {
            Some(_) if is_byte_element(element) => Value::bytes(Vec::new()),
            Some(_) => Value::Array(Vec::new()),
            None => Value::Nil,
        });
    }

    let count = match (length, info.fixed_size, info.zero_terminated) {
        (Some(n), _, _) | (None, Some(n), _) => n,
        // Safety: zero-terminated arrays end with an all-zero element
        (None, None, true) => unsafe { terminated_len(base, elem_size) },
        (None, None, false) => {
            return Err(BindError::unsupported(format!(
                "array<{}> without length information",
                element
            )))
        }
    };

    let result = if is_byte_element(element) {
        // Safety: `count` bytes are readable at `base`
        let bytes = unsafe { std::slice::from_raw_parts(base, count) };
        Ok(Value::bytes(bytes.to_vec()))
    } else {
        let mut items = Vec::with_capacity(count);
        let mut failure = None;
        for i in 0..count {
            // Safety: index below the element count
            let src = unsafe { base.add(i * elem_size) };
            match element_to_script(reg, element, transfer.for_elements(), src, parent) {
                Ok(v) => items.push(v),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(Value::Array(items)),
        }
    };

    if transfer != Transfer::None {
        // Safety: ownership of the array storage was transferred to us
        unsafe { libc::free(base as *mut c_void) };
    }
    result
}

unsafe fn terminated_len(base: *const u8, elem_size: usize) -> usize {
    let mut count = 0;
    loop {
        let element = std::slice::from_raw_parts(base.add(count * elem_size), elem_size);
        if element.iter().all(|b| *b == 0) {
            return count;
        }
        count += 1;
    }
}

fn element_to_script(
    reg: &Registry,
    element: &TypeDescriptor,
    transfer: Transfer,
    src: *const u8,
    parent: Option<&Compound>,
) -> Result<Value> {
    if let Some(info) = embedded_info(element) {
        if parent.is_some() {
            // Safety: `src` is an element slot inside the parent's storage
            let s = unsafe { read_slot(element, src)? };
            return marshal::to_script(reg, element, transfer, s, parent);
        }
        // Elements outlive the array storage only as copies
        let copy = Compound::allocate(reg, info)?;
        // Safety: both sides hold `info.size` bytes
        unsafe { std::ptr::copy(src, copy.address()? as *mut u8, info.size) };
        return Ok(Value::Compound(copy));
    }

    // Safety: `src` is an element slot inside the array storage
    let s = unsafe { read_slot(element, src)? };
    marshal::to_script(reg, element, transfer, s, parent)
}

// ============================================================================
// Linked lists
// ============================================================================

#[repr(C)]
struct SListNode {
    data: *mut c_void,
    next: *mut SListNode,
}

#[repr(C)]
struct ListNode {
    data: *mut c_void,
    next: *mut ListNode,
    prev: *mut ListNode,
}

fn node_size(links: ListLinks) -> usize {
    match links {
        ListLinks::Single => std::mem::size_of::<SListNode>(),
        ListLinks::Double => std::mem::size_of::<ListNode>(),
    }
}

fn element_payload(element: &TypeDescriptor, s: NativeArg) -> Result<*mut c_void> {
    match storage(element) {
        Storage::Pointer => Ok(s.pointer()),
        st if st.is_integral() => Ok(s.get_int(st).unwrap_or(0) as isize as *mut c_void),
        _ => Err(BindError::unsupported(format!("list element {}", element))),
    }
}

fn payload_slot(element: &TypeDescriptor, data: *mut c_void) -> Result<NativeArg> {
    match storage(element) {
        Storage::Pointer => Ok(NativeArg::from_pointer(data)),
        st if st.is_integral() => {
            let mut s = NativeArg::zeroed();
            s.set_int(st, data as isize as i64);
            Ok(s)
        }
        _ => Err(BindError::unsupported(format!("list element {}", element))),
    }
}

pub fn list_to_native(
    reg: &Registry,
    frame: &mut CallFrame,
    info: &ListInfo,
    transfer: Transfer,
    value: &Value,
    slot: &mut NativeArg,
) -> Result<()> {
    let items = match value {
        Value::Nil => {
            *slot = NativeArg::zeroed();
            return Ok(());
        }
        Value::Array(items) => items,
        other => return Err(BindError::type_mismatch("array", other.type_name())),
    };

    let element = info.element.as_ref();
    let mut elements = frame.elements();
    let mut nodes: Vec<*mut u8> = Vec::with_capacity(items.len());
    for item in items.iter() {
        let mut s = NativeArg::zeroed();
        marshal::to_native(reg, &mut elements, element, transfer.for_elements(), item, None, &mut s)?;
        let data = element_payload(element, s)?;

        let node = calloc(node_size(info.links))?;
        if transfer == Transfer::None {
            elements.scratch(node as usize, libc::free)?;
        } else {
            elements.transferred(node as usize, libc::free)?;
        }
        // Safety: fresh node, `data` is the first field of both layouts
        unsafe { (*(node as *mut SListNode)).data = data };
        nodes.push(node);
    }

    for (i, node) in nodes.iter().enumerate() {
        let next = nodes.get(i + 1).copied().unwrap_or(std::ptr::null_mut());
        // Safety: nodes were allocated above with the matching layout
        unsafe {
            match info.links {
                ListLinks::Single => (*(*node as *mut SListNode)).next = next as *mut SListNode,
                ListLinks::Double => {
                    let n = *node as *mut ListNode;
                    (*n).next = next as *mut ListNode;
                    (*n).prev = if i == 0 {
                        std::ptr::null_mut()
                    } else {
                        nodes[i - 1] as *mut ListNode
                    };
                }
            }
        }
    }

    frame.adopt_elements(elements)?;
    slot.v_pointer = nodes.first().copied().unwrap_or(std::ptr::null_mut()) as *mut c_void;
    Ok(())
}

pub fn list_to_script(
    reg: &Registry,
    info: &ListInfo,
    transfer: Transfer,
    slot: NativeArg,
    parent: Option<&Compound>,
) -> Result<Value> {
    let element = info.element.as_ref();
    let mut items = Vec::new();
    let mut failure = None;
    let mut node = slot.pointer() as *mut SListNode;

    while !node.is_null() {
        // Safety: list nodes share the `{ data, next }` prefix
        let (data, next) = unsafe { ((*node).data, (*node).next) };
        if failure.is_none() {
            let converted = payload_slot(element, data)
                .and_then(|s| marshal::to_script(reg, element, transfer.for_elements(), s, parent));
            match converted {
                Ok(v) => items.push(v),
                Err(e) => failure = Some(e),
            }
        }
        if transfer != Transfer::None {
            // Safety: ownership of the nodes was transferred to us
            unsafe { libc::free(node as *mut c_void) };
        }
        node = next;
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(Value::Array(items)),
    }
}
