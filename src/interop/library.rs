//! Dynamic library loading and symbol resolution
//!
//! Platform-agnostic wrapper around dlopen/LoadLibrary, used by namespace
//! repositories to turn a callable's symbol into its entry address.

use crate::errors::{BindError, Result};
use core::ffi::c_void;
use core::ptr::NonNull;
use std::ffi::CString;

/// Handle to a dynamically loaded library
pub struct Library {
    handle: NonNull<c_void>,
    name: String,
    /// Process image handles are never closed
    owned: bool,
}

impl Library {
    /// Load library by name or path
    pub fn load(name: &str) -> Result<Self> {
        let handle = Self::open(Some(name))?;
        tracing::debug!(library = name, "shared library loaded");
        Ok(Self {
            handle,
            name: name.to_string(),
            owned: true,
        })
    }

    /// Handle to the running process image (main program plus loaded libraries)
    pub fn this_process() -> Result<Self> {
        let handle = Self::open(None)?;
        Ok(Self {
            handle,
            name: "<process>".to_string(),
            owned: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(unix)]
    fn open(name: Option<&str>) -> Result<NonNull<c_void>> {
        let cname = name
            .map(|n| CString::new(n).map_err(|_| BindError::library(format!("invalid library name {:?}", n))))
            .transpose()?;
        let ptr = cname.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());

        // Safety: `ptr` is null or a valid NUL-terminated string alive for the call
        unsafe {
            let handle = libc::dlopen(ptr, libc::RTLD_NOW | libc::RTLD_GLOBAL);
            NonNull::new(handle).ok_or_else(|| {
                let err = libc::dlerror();
                let msg = if !err.is_null() {
                    std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
                } else {
                    "unknown error".into()
                };
                BindError::library(format!("failed to load {}: {}", name.unwrap_or("<process>"), msg))
            })
        }
    }

    #[cfg(windows)]
    fn open(name: Option<&str>) -> Result<NonNull<c_void>> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;

        extern "system" {
            fn LoadLibraryW(filename: *const u16) -> *mut c_void;
            fn GetModuleHandleW(filename: *const u16) -> *mut c_void;
            fn GetLastError() -> u32;
        }

        // Safety: wide strings are NUL-terminated and outlive the calls
        unsafe {
            let handle = match name {
                Some(name) => {
                    let wide: Vec<u16> = OsStr::new(name).encode_wide().chain(Some(0)).collect();
                    LoadLibraryW(wide.as_ptr())
                }
                None => GetModuleHandleW(std::ptr::null()),
            };
            NonNull::new(handle).ok_or_else(|| {
                BindError::library(format!(
                    "failed to load {}: error code {}",
                    name.unwrap_or("<process>"),
                    GetLastError()
                ))
            })
        }
    }

    /// Address of an exported symbol
    pub fn symbol(&self, name: &str) -> Result<usize> {
        let cname = CString::new(name)
            .map_err(|_| BindError::library(format!("invalid symbol name {:?}", name)))?;
        let ptr = self.symbol_impl(&cname);
        if ptr.is_null() {
            Err(BindError::library(format!("symbol {} not found in {}", name, self.name)))
        } else {
            Ok(ptr as usize)
        }
    }

    #[cfg(unix)]
    fn symbol_impl(&self, name: &CString) -> *mut c_void {
        // Safety: handle is a live dlopen handle
        unsafe { libc::dlsym(self.handle.as_ptr(), name.as_ptr()) }
    }

    #[cfg(windows)]
    fn symbol_impl(&self, name: &CString) -> *mut c_void {
        extern "system" {
            fn GetProcAddress(module: *mut c_void, name: *const u8) -> *mut c_void;
        }
        // Safety: handle is a live module handle
        unsafe { GetProcAddress(self.handle.as_ptr(), name.as_ptr() as *const u8) }
    }
}

impl Drop for Library {
    #[cfg(unix)]
    fn drop(&mut self) {
        if self.owned {
            // Safety: handle came from dlopen and is closed once
            unsafe {
                libc::dlclose(self.handle.as_ptr());
            }
        }
    }

    #[cfg(windows)]
    fn drop(&mut self) {
        extern "system" {
            fn FreeLibrary(module: *mut c_void) -> i32;
        }
        if self.owned {
            // Safety: handle came from LoadLibraryW and is freed once
            unsafe {
                FreeLibrary(self.handle.as_ptr());
            }
        }
    }
}

// Safety: library handles are process-global and thread-agnostic
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library").field("name", &self.name).finish()
    }
}
