//! Native value containers compatible with C ABIs
//!
//! `NativeArg` is the untagged 8-byte slot every marshaling path reads from
//! and writes into; `Variant` is the tagged generic value container and
//! `NativeError` the error record reported through error out-arguments.

use super::abi::{storage, Storage};
use crate::descriptor::TypeDescriptor;
use crate::errors::{BindError, Result};
use std::ffi::{c_char, c_void, CStr};

/// Untagged native argument slot
#[repr(C)]
#[derive(Clone, Copy)]
pub union NativeArg {
    pub v_boolean: i32,
    pub v_int8: i8,
    pub v_uint8: u8,
    pub v_int16: i16,
    pub v_uint16: u16,
    pub v_int32: i32,
    pub v_uint32: u32,
    pub v_int64: i64,
    pub v_uint64: u64,
    pub v_float: f32,
    pub v_double: f64,
    pub v_size: usize,
    pub v_pointer: *mut c_void,
}

impl NativeArg {
    #[inline]
    pub const fn zeroed() -> Self {
        Self { v_uint64: 0 }
    }

    #[inline]
    pub fn from_pointer(ptr: *mut c_void) -> Self {
        let mut arg = Self::zeroed();
        arg.v_pointer = ptr;
        arg
    }

    #[inline]
    pub fn from_address(address: usize) -> Self {
        Self::from_pointer(address as *mut c_void)
    }

    #[inline]
    pub fn pointer(&self) -> *mut c_void {
        // Safety: slots are zero-initialized, every bit pattern is a valid pointer value
        unsafe { self.v_pointer }
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.pointer() as usize
    }

    /// Integer value of a slot with integral storage
    pub fn get_int(&self, storage: Storage) -> Option<i64> {
        // Safety: zero-initialized union, reads of plain integers
        unsafe {
            Some(match storage {
                Storage::I8 => self.v_int8 as i64,
                Storage::U8 => self.v_uint8 as i64,
                Storage::I16 => self.v_int16 as i64,
                Storage::U16 => self.v_uint16 as i64,
                Storage::I32 => self.v_int32 as i64,
                Storage::U32 => self.v_uint32 as i64,
                Storage::I64 => self.v_int64,
                Storage::U64 => self.v_uint64 as i64,
                _ => return None,
            })
        }
    }

    /// Store an integer already checked to fit `storage`
    pub fn set_int(&mut self, storage: Storage, value: i64) {
        match storage {
            Storage::I8 => self.v_int8 = value as i8,
            Storage::U8 => self.v_uint8 = value as u8,
            Storage::I16 => self.v_int16 = value as i16,
            Storage::U16 => self.v_uint16 = value as u16,
            Storage::I32 => self.v_int32 = value as i32,
            Storage::U32 => self.v_uint32 = value as u32,
            Storage::I64 => self.v_int64 = value,
            Storage::U64 => self.v_uint64 = value as u64,
            Storage::Pointer => self.v_size = value as usize,
            _ => {}
        }
    }
}

impl Default for NativeArg {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl std::fmt::Debug for NativeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Safety: see `pointer`
        write!(f, "NativeArg({:#018x})", unsafe { self.v_uint64 })
    }
}

/// Load the value of type `ty` stored at `src` into a slot
///
/// Embedded records are not copied: the slot receives their address.
///
/// # Safety
/// `src` must point to readable memory holding a value of type `ty`.
pub unsafe fn read_slot(ty: &TypeDescriptor, src: *const u8) -> Result<NativeArg> {
    use std::ptr::read_unaligned as rd;
    let mut arg = NativeArg::zeroed();
    match storage(ty) {
        Storage::Void => return Err(BindError::unsupported("void slot")),
        Storage::I8 => arg.v_int8 = rd(src as *const i8),
        Storage::U8 => arg.v_uint8 = rd(src),
        Storage::I16 => arg.v_int16 = rd(src as *const i16),
        Storage::U16 => arg.v_uint16 = rd(src as *const u16),
        Storage::I32 => arg.v_int32 = rd(src as *const i32),
        Storage::U32 => arg.v_uint32 = rd(src as *const u32),
        Storage::I64 => arg.v_int64 = rd(src as *const i64),
        Storage::U64 => arg.v_uint64 = rd(src as *const u64),
        Storage::F32 => arg.v_float = rd(src as *const f32),
        Storage::F64 => arg.v_double = rd(src as *const f64),
        Storage::Pointer => arg.v_pointer = rd(src as *const *mut c_void),
        Storage::Embedded { .. } => arg.v_pointer = src as *mut c_void,
    }
    Ok(arg)
}

/// Store a slot as a value of type `ty` at `dst`
///
/// For embedded records the slot holds the address of the source instance,
/// which is copied byte-wise.
///
/// # Safety
/// `dst` must point to writable memory sized for `ty`.
pub unsafe fn write_slot(ty: &TypeDescriptor, dst: *mut u8, arg: NativeArg) -> Result<()> {
    use std::ptr::write_unaligned as wr;
    match storage(ty) {
        Storage::Void => return Err(BindError::unsupported("void slot")),
        Storage::I8 => wr(dst as *mut i8, arg.v_int8),
        Storage::U8 => wr(dst, arg.v_uint8),
        Storage::I16 => wr(dst as *mut i16, arg.v_int16),
        Storage::U16 => wr(dst as *mut u16, arg.v_uint16),
        Storage::I32 => wr(dst as *mut i32, arg.v_int32),
        Storage::U32 => wr(dst as *mut u32, arg.v_uint32),
        Storage::I64 => wr(dst as *mut i64, arg.v_int64),
        Storage::U64 => wr(dst as *mut u64, arg.v_uint64),
        Storage::F32 => wr(dst as *mut f32, arg.v_float),
        Storage::F64 => wr(dst as *mut f64, arg.v_double),
        Storage::Pointer => wr(dst as *mut *mut c_void, arg.v_pointer),
        Storage::Embedded { size, .. } => {
            if !arg.v_pointer.is_null() {
                std::ptr::copy(arg.v_pointer as *const u8, dst, size);
            }
        }
    }
    Ok(())
}

/// Tags of [`Variant`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VariantTag {
    Empty = 0,
    Boolean = 1,
    Int = 2,
    UInt = 3,
    Double = 4,
    /// Owned, malloc'd NUL-terminated UTF-8
    String = 5,
    Pointer = 6,
    /// Instance pointer; `host_type` names its type
    Compound = 7,
}

impl VariantTag {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Empty,
            1 => Self::Boolean,
            2 => Self::Int,
            3 => Self::UInt,
            4 => Self::Double,
            5 => Self::String,
            6 => Self::Pointer,
            7 => Self::Compound,
            _ => return None,
        })
    }
}

/// Tagged generic value container
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Variant {
    pub tag: u32,
    pub host_type: usize,
    pub data: NativeArg,
}

impl Variant {
    pub const fn empty() -> Self {
        Self {
            tag: VariantTag::Empty as u32,
            host_type: 0,
            data: NativeArg::zeroed(),
        }
    }

    #[inline]
    pub fn tag(&self) -> Option<VariantTag> {
        VariantTag::from_raw(self.tag)
    }

    /// Release owned contents and reset to empty
    pub fn clear(&mut self) {
        if self.tag() == Some(VariantTag::String) {
            let ptr = self.data.pointer();
            if !ptr.is_null() {
                // Safety: string variants own a malloc'd buffer
                unsafe { libc::free(ptr) };
            }
        }
        *self = Self::empty();
    }
}

impl Default for Variant {
    fn default() -> Self {
        Self::empty()
    }
}

/// Release the contents of a variant received from the engine
///
/// # Safety
/// `variant` must be null or point to a valid, initialized [`Variant`].
#[no_mangle]
pub unsafe extern "C" fn gibind_variant_clear(variant: *mut Variant) {
    if let Some(v) = variant.as_mut() {
        v.clear();
    }
}

/// Error record filled in through error out-arguments
///
/// Allocated with `malloc`, including `message`.
#[repr(C)]
#[derive(Debug)]
pub struct NativeError {
    pub domain: u32,
    pub code: i32,
    pub message: *mut c_char,
}

impl NativeError {
    /// Allocate a native error record
    pub fn new_raw(domain: u32, code: i32, message: &str) -> *mut NativeError {
        let text = std::ffi::CString::new(message.replace('\0', " ")).unwrap_or_default();
        // Safety: fresh allocations, initialized before being returned
        unsafe {
            let err = libc::malloc(std::mem::size_of::<NativeError>()) as *mut NativeError;
            if err.is_null() {
                return err;
            }
            err.write(NativeError {
                domain,
                code,
                message: libc::strdup(text.as_ptr()),
            });
            err
        }
    }

    /// Read and free a native error record
    ///
    /// # Safety
    /// `err` must come from [`NativeError::new_raw`] or an equivalent
    /// malloc-based allocation, and must not be used afterwards.
    pub unsafe fn take_raw(err: *mut NativeError) -> (u32, i32, String) {
        let record = err.read();
        let message = if record.message.is_null() {
            String::new()
        } else {
            let text = CStr::from_ptr(record.message).to_string_lossy().into_owned();
            libc::free(record.message as *mut c_void);
            text
        };
        libc::free(err as *mut c_void);
        (record.domain, record.code, message)
    }
}
