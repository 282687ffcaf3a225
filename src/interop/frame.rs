//! Per-call temporaries
//!
//! Design: every marshaling pass owns one `CallFrame`. Conversions push the
//! temporaries they create (borrowed string copies, scratch buffers, kept-alive
//! wrappers); the frame releases them in reverse creation order when dropped.
//!
//! Memory whose ownership is handed to native code is recorded too, but only
//! freed when the frame is dropped without [`commit`](CallFrame::commit):
//! a call that fails during argument marshaling leaves nothing behind.
//!
//! The temporaries limit counts conversion steps. A container collects its
//! per-element temporaries in an unbounded child frame that occupies a single
//! entry of its parent.

use super::types::Variant;
use crate::compound::Compound;
use crate::descriptor::FreeFn;
use crate::errors::{BindError, Result};
use crate::lifetime::{Guard, Registry};
use crate::value::Value;
use smallvec::SmallVec;
use std::ffi::{c_char, c_void, CString};

enum Temporary {
    /// Borrowed C string passed for the call's duration
    CString(CString),
    /// Borrowed scratch buffer
    Buffer(Vec<u8>),
    /// Native scratch memory released with `free`
    Native { address: usize, free: FreeFn },
    /// Variant handed out by pointer
    Variant(Box<Variant>),
    /// Scripting value kept alive for the call's duration
    Keep(Value),
    /// Call-scoped closure
    Closure(Guard),
    /// Native-owned memory, freed only when the call never happens
    Transferred { address: usize, free: FreeFn },
    /// Wrapper giving up its memory once the call happens
    Relinquish(Compound),
    /// Element temporaries of one container
    Elements(Box<CallFrame>),
}

pub struct CallFrame {
    temporaries: SmallVec<[Temporary; 8]>,
    limit: usize,
    committed: bool,
}

impl CallFrame {
    pub fn new(reg: &Registry) -> Self {
        Self::with_limit(reg.config().marshal.max_temporaries)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            temporaries: SmallVec::new(),
            limit,
            committed: false,
        }
    }

    fn push(&mut self, temp: Temporary) -> Result<()> {
        if self.temporaries.len() >= self.limit {
            return Err(BindError::range(
                self.temporaries.len() + 1,
                format!("call frame temporaries (limit {})", self.limit),
            ));
        }
        self.temporaries.push(temp);
        Ok(())
    }

    /// Keep a string alive for the call and return its pointer
    pub fn borrow_cstring(&mut self, s: CString) -> Result<*const c_char> {
        let ptr = s.as_ptr();
        self.push(Temporary::CString(s))?;
        Ok(ptr)
    }

    /// Keep a buffer alive for the call and return its data pointer
    pub fn borrow_buffer(&mut self, mut buffer: Vec<u8>) -> Result<*mut c_void> {
        let ptr = buffer.as_mut_ptr() as *mut c_void;
        self.push(Temporary::Buffer(buffer))?;
        Ok(ptr)
    }

    pub fn scratch(&mut self, address: usize, free: FreeFn) -> Result<()> {
        self.push(Temporary::Native { address, free })
    }

    pub fn borrow_variant(&mut self, variant: Variant) -> Result<*mut Variant> {
        let mut boxed = Box::new(variant);
        let ptr = boxed.as_mut() as *mut Variant;
        self.push(Temporary::Variant(boxed))?;
        Ok(ptr)
    }

    pub fn keep(&mut self, value: Value) -> Result<()> {
        self.push(Temporary::Keep(value))
    }

    pub fn keep_closure(&mut self, guard: Guard) -> Result<()> {
        self.push(Temporary::Closure(guard))
    }

    /// Record memory whose ownership moves to native code with the call
    pub fn transferred(&mut self, address: usize, free: FreeFn) -> Result<()> {
        self.push(Temporary::Transferred { address, free })
    }

    pub fn relinquish_on_commit(&mut self, compound: Compound) -> Result<()> {
        self.push(Temporary::Relinquish(compound))
    }

    /// Unbounded frame for the temporaries of one container's elements
    pub fn elements(&self) -> CallFrame {
        CallFrame::with_limit(usize::MAX)
    }

    /// Take over a container's element frame as one temporary
    pub fn adopt_elements(&mut self, elements: CallFrame) -> Result<()> {
        if elements.is_empty() {
            return Ok(());
        }
        self.push(Temporary::Elements(Box::new(elements)))
    }

    /// The native call happened: ownership transfers become final
    pub fn commit(&mut self) {
        self.committed = true;
        for temp in self.temporaries.iter_mut() {
            match temp {
                Temporary::Relinquish(compound) => {
                    compound.relinquish();
                    *temp = Temporary::Keep(Value::Nil);
                }
                Temporary::Transferred { .. } => *temp = Temporary::Keep(Value::Nil),
                Temporary::Elements(elements) => elements.commit(),
                _ => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.temporaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temporaries.is_empty()
    }
}

impl Drop for CallFrame {
    fn drop(&mut self) {
        while let Some(temp) = self.temporaries.pop() {
            match temp {
                Temporary::Native { address, free } => {
                    // Safety: scratch memory owned by this frame
                    unsafe { free(address as *mut c_void) };
                }
                Temporary::Transferred { address, free } if !self.committed => {
                    // Safety: native code never received this memory
                    unsafe { free(address as *mut c_void) };
                }
                Temporary::Variant(mut variant) => variant.clear(),
                other => drop(other),
            }
        }
    }
}
