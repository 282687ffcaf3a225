//! Native-callable trampolines for scripting functions
//!
//! Design: a closure is a libffi trampoline bound to a heap payload holding
//! the callback's call plan and the scripting target. The payload address is
//! the closure's user data. The registry owns every live closure; destroying
//! one retires it to a reclamation list and the trampoline memory is freed
//! at the next engine entry, never while a trampoline is executing.
//!
//! Autodestroy closures retire themselves after their single call; the
//! temporaries of that call live until reclamation. A call
//! arriving after retirement is reported as a programming error and returns
//! a zeroed result.

use super::abi::{storage, widen_return};
use super::call::{Callable, Role};
use super::containers::{self, script_len};
use super::frame::CallFrame;
use super::marshal;
use super::types::{read_slot, write_slot, NativeArg, NativeError};
use crate::compound::UnwrapFlags;
use crate::descriptor::{CallableInfo, DescriptorKind, Direction, ErrorChannel, Scope};
use crate::errors::{BindError, ErrorKind, Result};
use crate::lifetime::registry::{upgrade, RegistryInner};
use crate::lifetime::{Guard, Registry};
use crate::logging::{log_callback_error, log_closure_event, log_programming_error};
use crate::value::{ScriptFunction, Value};
use libffi::middle::Closure;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

const LIVE: u8 = 0;
const RETIRED: u8 = 1;

/// Error domain reported for failures raised by scripting callbacks
pub const SCRIPT_ERROR_DOMAIN: u32 = 0;

pub(crate) struct ClosurePayload {
    callable: Arc<Callable>,
    target: Mutex<Option<ScriptFunction>>,
    autodestroy: bool,
    registry: Weak<RegistryInner>,
    state: AtomicU8,
    name: String,
    /// Temporaries backing the most recent return and output values; kept
    /// past retirement until the block is reclaimed
    last_frame: Mutex<Option<CallFrame>>,
}

impl ClosurePayload {
    /// Drop the target; true when the closure was still live
    ///
    /// The last frame stays: native code may still read a borrowed return
    /// value after the trampoline returned.
    fn retire(&self) -> bool {
        let was = self.state.swap(RETIRED, Ordering::AcqRel);
        let target = self.target.lock().take();
        drop(target);
        was == LIVE
    }
}

/// Trampoline plus the payload it is bound to
pub(crate) struct ClosureBlock {
    // Declared first: the trampoline goes away before its payload
    closure: Closure<'static>,
    payload: Box<ClosurePayload>,
}

// Safety: the trampoline is only executed through its entry pointer and the
// payload's mutable state sits behind locks and atomics.
unsafe impl Send for ClosureBlock {}

impl ClosureBlock {
    pub(crate) fn name(&self) -> &str {
        &self.payload.name
    }

    pub(crate) fn entry(&self) -> usize {
        *self.closure.code_ptr() as usize
    }
}

/// Addresses handed to native code for one closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosureHandle {
    /// User data identifying the closure (its payload address)
    pub user_data: usize,
    /// Native entry point
    pub entry: usize,
}

/// Create a native-callable closure for `target` with signature `info`
pub fn create(
    reg: &Registry,
    info: &Arc<CallableInfo>,
    target: ScriptFunction,
    autodestroy: bool,
) -> Result<ClosureHandle> {
    let callable = Callable::build(reg, info)?;
    let payload = Box::new(ClosurePayload {
        callable: callable.clone(),
        target: Mutex::new(Some(target)),
        autodestroy,
        registry: reg.downgrade(),
        state: AtomicU8::new(LIVE),
        name: callable.name().to_string(),
        last_frame: Mutex::new(None),
    });

    // Safety: the payload is boxed and owned by the same block as the
    // closure, which is dropped first
    let payload_ref: &'static ClosurePayload = unsafe { &*(payload.as_ref() as *const ClosurePayload) };
    let closure = Closure::new(callable.cif.clone(), closure_trampoline, payload_ref);

    let user_data = payload_ref as *const ClosurePayload as usize;
    let block = ClosureBlock { closure, payload };
    let entry = block.entry();
    log_closure_event("created", block.name());
    reg.adopt_closure(user_data, block);

    Ok(ClosureHandle { user_data, entry })
}

/// Retire the closure identified by `user_data`
///
/// Returns false when no live closure has that user data.
pub fn destroy(reg: &Registry, user_data: usize) -> bool {
    let _turn = reg.turn();
    if !reg.has_closure(user_data) {
        return false;
    }
    // Safety: registered closures keep their payload at `user_data`
    let payload = unsafe { &*(user_data as *const ClosurePayload) };
    payload.retire();
    log_closure_event("destroyed", &payload.name);
    let retired = reg.retire_closure(user_data);
    reg.release_retained(user_data);
    retired
}

/// Destroy notifier handed to native code together with a closure's user data
///
/// # Safety
/// `user_data` must be the user data of a closure created by this engine
/// whose notifier has not run yet.
pub unsafe extern "C" fn destroy_notify(user_data: *mut c_void) {
    if user_data.is_null() {
        return;
    }
    let payload = &*(user_data as *const ClosurePayload);
    match payload.registry.upgrade() {
        Some(inner) => {
            destroy(&Registry::from_inner(inner), user_data as usize);
        }
        None => log_programming_error(&payload.name, "destroy notify after registry shutdown"),
    }
}

/// Guard destroying the closure when its last handle goes away
pub fn guard(reg: &Registry, handle: &ClosureHandle) -> Guard {
    let registry = reg.downgrade();
    let user_data = handle.user_data;
    Guard::with_action(move || {
        if let Ok(reg) = upgrade(&registry) {
            destroy(&reg, user_data);
        }
    })
}

/// Create a closure living as long as `scope` demands
pub(crate) fn bind_for_scope(
    reg: &Registry,
    frame: &mut CallFrame,
    info: &Arc<CallableInfo>,
    target: ScriptFunction,
    scope: Scope,
) -> Result<ClosureHandle> {
    let handle = create(reg, info, target, scope == Scope::Async)?;
    let registered = match scope {
        Scope::Call => frame.keep_closure(guard(reg, &handle)),
        Scope::Async | Scope::Notified => frame.transferred(handle.user_data, destroy_notify),
        Scope::Forever => {
            reg.retain(handle.user_data, guard(reg, &handle));
            frame.transferred(handle.user_data, destroy_notify)
        }
    };
    if let Err(e) = registered {
        destroy(reg, handle.user_data);
        return Err(e);
    }
    Ok(handle)
}

unsafe extern "C" fn closure_trampoline(
    _cif: &libffi::low::ffi_cif,
    result: &mut NativeArg,
    args: *const *const c_void,
    payload: &ClosurePayload,
) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        dispatch(payload, result, args)
    }));
    if outcome.is_err() {
        log_callback_error(&payload.name, "panic in scripting target");
        *result = NativeArg::zeroed();
    }
}

fn dispatch(payload: &ClosurePayload, result: &mut NativeArg, args: *const *const c_void) {
    let reg = match upgrade(&payload.registry) {
        Ok(reg) => reg,
        Err(_) => {
            log_programming_error(&payload.name, "closure called after registry shutdown");
            *result = NativeArg::zeroed();
            return;
        }
    };
    let _turn = reg.enter_callback();

    let target = payload.target.lock().clone();
    let target = match (payload.state.load(Ordering::Acquire), target) {
        (LIVE, Some(target)) => target,
        _ => {
            log_programming_error(&payload.name, "closure called after it was released");
            *result = NativeArg::zeroed();
            return;
        }
    };

    let mut frame = CallFrame::new(&reg);
    // Safety: libffi hands us one pointer per parameter of the call plan
    let outcome = unsafe { run_target(&reg, &payload.callable, &target, &mut frame, result, args) };
    match outcome {
        Ok(()) => {
            frame.commit();
            let previous = payload.last_frame.lock().replace(frame);
            drop(previous);
        }
        Err(e) => {
            *result = NativeArg::zeroed();
            // Safety: see above
            if !unsafe { report_error(&reg, &payload.callable, args, &e) } {
                log_callback_error(&payload.name, &e.to_string());
            }
        }
    }

    if payload.autodestroy {
        payload.retire();
        reg.retire_closure(payload as *const ClosurePayload as usize);
        log_closure_event("autodestroyed", &payload.name);
    }
}

/// # Safety
/// `args` must hold one valid pointer per native parameter of `callable`.
unsafe fn run_target(
    reg: &Registry,
    callable: &Callable,
    target: &ScriptFunction,
    frame: &mut CallFrame,
    result: &mut NativeArg,
    args: *const *const c_void,
) -> Result<()> {
    let info = callable.info();
    let native = |p: usize| *args.add(p) as *const u8;

    let length_of = |arg: usize| -> Result<usize> {
        let a = &info.args[arg];
        let src = native(callable.param_of(arg));
        let src = if a.direction.is_output() {
            *(src as *const *const u8)
        } else {
            src
        };
        if src.is_null() {
            return Ok(0);
        }
        let slot = read_slot(&a.ty, src)?;
        Ok(slot.get_int(storage(&a.ty)).unwrap_or(0).max(0) as usize)
    };

    let mut script_args = Vec::with_capacity(callable.params.len());
    for (p, plan) in callable.params.iter().enumerate() {
        let (Role::Script, Some(i)) = (plan.role, plan.arg) else {
            continue;
        };
        let a = &info.args[i];
        if !a.direction.is_input() {
            continue;
        }
        let src = if a.direction == Direction::InOut {
            *(native(p) as *const *const u8)
        } else {
            native(p)
        };
        if src.is_null() {
            script_args.push(Value::Nil);
            continue;
        }
        let slot = read_slot(&a.ty, src)?;
        let value = match &a.ty.kind {
            DescriptorKind::Array(array) if array.length_arg.is_some() => {
                let length = array.length_arg.map(|l| length_of(l)).transpose()?;
                containers::array_to_script(reg, array, a.transfer, slot, length, None)
            }
            _ => marshal::to_script(reg, &a.ty, a.transfer, slot, None),
        }
        .map_err(|e| e.at_arg(script_args.len() + 1, Some(a.name.as_str())))?;
        script_args.push(value);
    }

    let mut results = target.call(&script_args)?.into_iter();

    if !info.return_type.is_void() {
        let value = results.next().unwrap_or(Value::Nil);
        let mut slot = NativeArg::zeroed();
        marshal::to_native(reg, frame, &info.return_type, info.return_transfer, &value, None, &mut slot)?;
        if let Some(len) = info.return_type.array_info().and_then(|a| a.length_arg) {
            let a = &info.args[len];
            let dst = *(native(callable.param_of(len)) as *const *mut u8);
            if a.direction.is_output() && !dst.is_null() {
                let mut length = NativeArg::zeroed();
                length.set_int(storage(&a.ty), script_len(&value).unwrap_or(0) as i64);
                write_slot(&a.ty, dst, length)?;
            }
        }
        frame.keep(value)?;
        *result = widen_return(&info.return_type, slot);
    }

    for (p, plan) in callable.params.iter().enumerate() {
        let a = match (plan.role, plan.arg) {
            (Role::Script, Some(i)) if info.args[i].direction.is_output() => &info.args[i],
            _ => continue,
        };
        let value = results.next().unwrap_or(Value::Nil);
        let dst = *(native(p) as *const *mut u8);
        if dst.is_null() {
            continue;
        }

        if let (true, DescriptorKind::Compound(record)) = (a.caller_allocates, &a.ty.kind) {
            let source = crate::compound::Compound::unwrap(reg, &value, record, UnwrapFlags::empty())?;
            std::ptr::copy(source.address as *const u8, dst, record.size);
            continue;
        }

        let mut slot = NativeArg::zeroed();
        marshal::to_native(reg, frame, &a.ty, a.transfer, &value, Some(a), &mut slot)
            .map_err(|e| e.at_arg(p + 1, Some(a.name.as_str())))?;
        frame.keep(value)?;
        write_slot(&a.ty, dst, slot)?;
    }
    Ok(())
}

/// Store `error` into the callback's error out-argument
///
/// # Safety
/// `args` must hold one valid pointer per native parameter of `callable`.
unsafe fn report_error(
    reg: &Registry,
    callable: &Callable,
    args: *const *const c_void,
    error: &BindError,
) -> bool {
    if callable.info().throws == ErrorChannel::None {
        return false;
    }
    let Some(p) = callable.params.iter().position(|plan| plan.role == Role::ErrorOut) else {
        return false;
    };
    let location = *(*args.add(p) as *const *mut *mut NativeError);
    if location.is_null() {
        return false;
    }
    let (domain, code, message) = match &error.kind {
        ErrorKind::NativeError { domain, code, message } => (domain_id(reg, domain), *code, message.clone()),
        _ => (SCRIPT_ERROR_DOMAIN, 1, error.to_string()),
    };
    *location = NativeError::new_raw(domain, code, &message);
    true
}

/// Numeric domain behind a domain name, including unregistered `domain-N`
fn domain_id(reg: &Registry, name: &str) -> u32 {
    reg.types()
        .error_domain_id(name)
        .or_else(|| name.strip_prefix("domain-").and_then(|n| n.parse().ok()))
        .unwrap_or(SCRIPT_ERROR_DOMAIN)
}
