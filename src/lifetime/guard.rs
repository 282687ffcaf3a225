//! Guards: scripting handles that run a cleanup action exactly once
//!
//! Design: the cleanup is bound to finalization of the last handle clone
//! (`Drop` of the shared cell). `cancel` disarms the guard without running
//! anything; explicit cancellation never triggers the cleanup itself.

use crate::descriptor::FreeFn;
use parking_lot::Mutex;
use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

type Action = Box<dyn FnOnce() + Send>;

enum Payload {
    /// Native data released by a native destructor
    Raw { data: usize, destroy: FreeFn },
    /// Rust-side cleanup closure
    Action(Action),
    /// Value dropped on finalization
    Owned(Box<dyn Any + Send + Sync>),
    Disarmed,
}

struct GuardCell {
    payload: Mutex<Payload>,
}

impl Drop for GuardCell {
    fn drop(&mut self) {
        let payload = std::mem::replace(self.payload.get_mut(), Payload::Disarmed);
        match payload {
            Payload::Raw { data: 0, .. } => {}
            Payload::Raw { data, destroy } => {
                tracing::trace!(data = format_args!("{:#x}", data), "guard destroying native data");
                // Safety: the destructor was supplied together with its data
                unsafe { destroy(data as *mut c_void) };
            }
            Payload::Action(action) => action(),
            Payload::Owned(value) => drop(value),
            Payload::Disarmed => {}
        }
    }
}

/// Handle whose finalization runs a bound cleanup action exactly once
#[derive(Clone)]
pub struct Guard(Arc<GuardCell>);

impl Guard {
    fn from_payload(payload: Payload) -> Self {
        Self(Arc::new(GuardCell {
            payload: Mutex::new(payload),
        }))
    }

    /// Guard running `destroy(data)` on finalization
    ///
    /// `data` starts null and may be filled later with [`set_data`](Self::set_data);
    /// `destroy` only runs if data was set by then.
    pub fn new(destroy: FreeFn) -> Self {
        Self::with_data(std::ptr::null_mut(), destroy)
    }

    pub fn with_data(data: *mut c_void, destroy: FreeFn) -> Self {
        Self::from_payload(Payload::Raw {
            data: data as usize,
            destroy,
        })
    }

    /// Guard running an arbitrary action on finalization
    pub fn with_action<F>(action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_payload(Payload::Action(Box::new(action)))
    }

    /// Guard keeping `value` alive until finalization
    pub fn owning<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_payload(Payload::Owned(Box::new(value)))
    }

    /// Replace the data pointer of a native guard; ignored once disarmed
    pub fn set_data(&self, new_data: *mut c_void) {
        if let Payload::Raw { data, .. } = &mut *self.0.payload.lock() {
            *data = new_data as usize;
        }
    }

    pub fn data(&self) -> *mut c_void {
        match &*self.0.payload.lock() {
            Payload::Raw { data, .. } => *data as *mut c_void,
            _ => std::ptr::null_mut(),
        }
    }

    /// Owned value, if this guard holds one of type `T`
    pub fn with_owned<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        match &*self.0.payload.lock() {
            Payload::Owned(value) => value.downcast_ref::<T>().map(f),
            _ => None,
        }
    }

    /// Disarm without running the cleanup
    pub fn cancel(&self) {
        let previous = std::mem::replace(&mut *self.0.payload.lock(), Payload::Disarmed);
        // An owned value is still released, only native or custom cleanup is suppressed
        if let Payload::Owned(value) = previous {
            drop(value);
        }
    }

    pub fn is_armed(&self) -> bool {
        !matches!(&*self.0.payload.lock(), Payload::Disarmed)
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Guard) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("armed", &self.is_armed())
            .finish()
    }
}
