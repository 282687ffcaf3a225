//! Native calls driven by callable descriptors
//!
//! Design: a [`Callable`] is the call plan derived once per descriptor:
//! the libffi call interface plus the role of every native parameter.
//! Parameters that carry array lengths, callback user data, destroy
//! notifiers or the error out-argument are hidden from scripting callers
//! and filled in by the engine.
//!
//! Invocation order: resolve the entry address, marshal inputs into a
//! [`CallFrame`], call, commit the frame, surface native errors, then
//! marshal the return value and outputs in declaration order.

use super::abi::{build_cif, narrow_return, storage};
use super::closure;
use super::containers::{self, script_len};
use super::frame::CallFrame;
use super::marshal::{self, CallerAllocated};
use super::types::{NativeArg, NativeError};
use crate::compound::{Compound, UnwrapFlags};
use crate::descriptor::{
    ArgInfo, CallableInfo, DescriptorKind, Direction, ErrorChannel, Scope, TypeDescriptor,
};
use crate::errors::{BindError, Result};
use crate::lifetime::Registry;
use crate::logging::{log_advisory_error, log_native_call, log_native_return};
use crate::value::Value;
use libffi::middle::{Cif, CodePtr};
use smallvec::SmallVec;
use std::ffi::c_void;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LengthOf {
    Return,
    Param(usize),
}

/// What the engine does with one native parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Visible to scripting code
    Script,
    /// Receiver of a method call
    Instance,
    /// Hidden length of an array argument or of the return value
    ArrayLength { of: LengthOf },
    /// Hidden user data of a callback argument
    UserData { callback: usize },
    /// Hidden destroy notifier of a callback argument
    DestroyNotify { callback: usize },
    /// Trailing error out-argument
    ErrorOut,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ParamPlan {
    pub role: Role,
    /// Index into the descriptor's argument list
    pub arg: Option<usize>,
    /// 1-based position in the scripting argument list
    pub script_position: Option<usize>,
}

/// Call plan of one callable descriptor
pub struct Callable {
    info: Arc<CallableInfo>,
    pub(crate) cif: Cif,
    pub(crate) params: Vec<ParamPlan>,
    script_inputs: usize,
    name: String,
}

// Safety: the call interface is immutable after construction and only read
// by libffi during calls and closure creation.
unsafe impl Send for Callable {}
unsafe impl Sync for Callable {}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.name)
            .field("params", &self.params.len())
            .field("script_inputs", &self.script_inputs)
            .finish()
    }
}

impl Callable {
    /// Call plan for `info`, cached per descriptor in the registry
    pub fn build(reg: &Registry, info: &Arc<CallableInfo>) -> Result<Arc<Callable>> {
        let key = Arc::as_ptr(info) as usize;
        if let Some(found) = reg.inner().callables.get(&key) {
            return Ok(found.clone());
        }
        let callable = Arc::new(Self::plan(info)?);
        reg.inner().callables.insert(key, callable.clone());
        Ok(callable)
    }

    fn plan(info: &Arc<CallableInfo>) -> Result<Self> {
        let name = info.qualified_name();
        let n_args = info.args.len();
        let check = |index: usize, what: &str| {
            if index < n_args {
                Ok(index)
            } else {
                Err(BindError::type_mismatch(
                    format!("{} argument index below {}", what, n_args),
                    index.to_string(),
                )
                .in_callable(name.clone()))
            }
        };

        let mut roles = vec![Role::Script; n_args];
        for (i, arg) in info.args.iter().enumerate() {
            match &arg.ty.kind {
                DescriptorKind::Array(array) => {
                    if let Some(len) = array.length_arg {
                        let len = check(len, "length")?;
                        // Lengths of output arrays stay visible unless native code reports them
                        if arg.direction.is_input() || info.args[len].direction.is_output() {
                            roles[len] = Role::ArrayLength {
                                of: LengthOf::Param(i),
                            };
                        }
                    }
                }
                DescriptorKind::Callback(_) => {
                    if let Some(c) = arg.closure_arg {
                        roles[check(c, "user data")?] = Role::UserData { callback: i };
                    }
                    if let Some(d) = arg.destroy_arg {
                        roles[check(d, "destroy notify")?] = Role::DestroyNotify { callback: i };
                    }
                }
                _ => {}
            }
        }
        if let Some(len) = info.return_type.array_info().and_then(|a| a.length_arg) {
            let len = check(len, "length")?;
            if info.args[len].direction.is_output() {
                roles[len] = Role::ArrayLength { of: LengthOf::Return };
            }
        }

        let mut params = Vec::with_capacity(n_args + 2);
        let mut native_types = Vec::with_capacity(n_args + 2);
        let mut position = 0;

        if info.is_method {
            let container = info.container.clone().ok_or_else(|| {
                BindError::unsupported("method without container type").in_callable(name.clone())
            })?;
            position += 1;
            params.push(ParamPlan {
                role: Role::Instance,
                arg: None,
                script_position: Some(position),
            });
            native_types.push(TypeDescriptor::compound(container));
        }

        for (i, arg) in info.args.iter().enumerate() {
            let script_position = if roles[i] == Role::Script && arg.direction.is_input() {
                position += 1;
                Some(position)
            } else {
                None
            };
            params.push(ParamPlan {
                role: roles[i],
                arg: Some(i),
                script_position,
            });
            native_types.push(if arg.direction.is_output() {
                TypeDescriptor::pointer()
            } else {
                arg.ty.clone()
            });
        }

        if info.throws != ErrorChannel::None {
            params.push(ParamPlan {
                role: Role::ErrorOut,
                arg: None,
                script_position: None,
            });
            native_types.push(TypeDescriptor::pointer());
        }

        let cif = build_cif(native_types.iter(), &info.return_type).map_err(|e| e.in_callable(name.clone()))?;
        tracing::trace!(callable = %name, params = params.len(), "call plan built");

        Ok(Self {
            info: info.clone(),
            cif,
            params,
            script_inputs: position,
            name,
        })
    }

    #[inline]
    pub fn info(&self) -> &Arc<CallableInfo> {
        &self.info
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of arguments scripting callers may pass
    #[inline]
    pub fn script_inputs(&self) -> usize {
        self.script_inputs
    }

    /// Native parameter index of descriptor argument `arg`
    #[inline]
    pub(crate) fn param_of(&self, arg: usize) -> usize {
        arg + usize::from(self.info.is_method)
    }

    fn resolve_address(&self, reg: &Registry, explicit: Option<usize>) -> Result<usize> {
        explicit
            .or(self.info.address)
            .or_else(|| {
                self.info
                    .symbol
                    .as_deref()
                    .and_then(|s| reg.repository().resolve_symbol(&self.info.namespace, s))
            })
            .filter(|address| *address != 0)
            .ok_or_else(|| BindError::library(format!("no entry point for {}", self.name)))
    }

    /// Call the native function at `address` (or the descriptor's own entry
    /// point) with scripting arguments
    ///
    /// Returns the return value (unless void) followed by every output
    /// argument in declaration order.
    pub fn invoke(&self, reg: &Registry, address: Option<usize>, args: &[Value]) -> Result<Vec<Value>> {
        let _turn = reg.enter();
        let name = self.name.as_str();
        let address = self.resolve_address(reg, address)?;

        if args.len() > self.script_inputs {
            return Err(BindError::type_mismatch(
                format!("at most {} arguments", self.script_inputs),
                format!("{} arguments", args.len()),
            )
            .in_callable(name));
        }
        log_native_call(name, args.len());

        let n = self.params.len();
        let mut frame = CallFrame::new(reg);
        let mut slots: SmallVec<[NativeArg; 8]> = SmallVec::from_elem(NativeArg::zeroed(), n);
        let mut outs: SmallVec<[NativeArg; 8]> = SmallVec::from_elem(NativeArg::zeroed(), n);
        let outs_base = outs.as_mut_ptr();
        let mut allocated: SmallVec<[Option<CallerAllocated>; 8]> = (0..n).map(|_| None).collect();
        let mut error_record: *mut NativeError = std::ptr::null_mut();

        let nil = Value::Nil;
        let input = |plan: &ParamPlan| -> &Value {
            plan.script_position
                .and_then(|p| args.get(p - 1))
                .unwrap_or(&nil)
        };

        for (p, plan) in self.params.iter().enumerate() {
            let position = plan.script_position.unwrap_or(p + 1);
            let arg = plan.arg.map(|i| &self.info.args[i]);
            let annotate = |e: BindError| e.at_arg(position, arg.map(|a| a.name.as_str())).in_callable(name);

            match (plan.role, arg) {
                (Role::Instance, _) => {
                    let container = self
                        .info
                        .container
                        .as_ref()
                        .ok_or_else(|| BindError::unsupported("method without container type"))?;
                    let unwrapped = Compound::unwrap(reg, input(plan), container, UnwrapFlags::empty())
                        .map_err(annotate)?;
                    slots[p] = NativeArg::from_address(unwrapped.address);
                }
                (Role::Script, Some(a)) => {
                    self.marshal_input(reg, &mut frame, p, a, input(plan), &mut slots, outs_base, &mut allocated)
                        .map_err(annotate)?;
                }
                (Role::ArrayLength { of }, Some(a)) => {
                    let length = match of {
                        LengthOf::Param(i) => {
                            let array_plan = &self.params[self.param_of(i)];
                            let source = input(array_plan);
                            script_len(source).ok_or_else(|| {
                                annotate(BindError::type_mismatch("array", source.type_name()))
                            })?
                        }
                        LengthOf::Return => 0,
                    };
                    let mut value = NativeArg::zeroed();
                    value.set_int(storage(&a.ty), length as i64);
                    if a.direction.is_output() {
                        // Safety: `p < n`, `outs` is never resized
                        unsafe { *outs_base.add(p) = value };
                        slots[p] = NativeArg::from_pointer(unsafe { outs_base.add(p) } as *mut c_void);
                    } else {
                        slots[p] = value;
                    }
                }
                (Role::ErrorOut, _) => {
                    slots[p] = NativeArg::from_pointer(&mut error_record as *mut *mut NativeError as *mut c_void);
                }
                // Filled in by the callback they belong to
                (Role::UserData { .. } | Role::DestroyNotify { .. }, _) => {}
                (Role::Script | Role::ArrayLength { .. }, None) => {}
            }
        }

        let mut arg_ptrs: SmallVec<[*mut c_void; 8]> = slots
            .iter_mut()
            .map(|s| s as *mut NativeArg as *mut c_void)
            .collect();
        let mut ret = NativeArg::zeroed();
        let code = CodePtr(address as *mut c_void);
        // Safety: the call interface matches the descriptor, every slot was
        // initialized for its native type and outlives the call
        unsafe {
            libffi::raw::ffi_call(
                self.cif.as_raw_ptr(),
                Some(*code.as_safe_fun()),
                &mut ret as *mut NativeArg as *mut c_void,
                arg_ptrs.as_mut_ptr(),
            );
        }
        frame.commit();

        if !error_record.is_null() {
            // Safety: error records are malloc-based and ownership is ours
            let (domain, code, message) = unsafe { NativeError::take_raw(error_record) };
            let domain = reg
                .types()
                .error_domain(domain)
                .unwrap_or_else(|| format!("domain-{}", domain));
            let err = BindError::native(domain, code, message).in_callable(name);
            match self.info.throws {
                ErrorChannel::Raise => return Err(err),
                ErrorChannel::Advisory => log_advisory_error(name, &err.to_string()),
                ErrorChannel::None => {}
            }
        }

        let mut results = Vec::with_capacity(1 + n);
        let after = |e: BindError| e.in_callable(name).after_call();

        if !self.info.return_type.is_void() {
            let ret = narrow_return(&self.info.return_type, ret);
            let value = match &self.info.return_type.kind {
                DescriptorKind::Array(array) if array.length_arg.is_some() => {
                    let length = array.length_arg.map(|i| self.length_value(i, &slots, &outs));
                    containers::array_to_script(reg, array, self.info.return_transfer, ret, length, None)
                }
                _ => marshal::to_script(reg, &self.info.return_type, self.info.return_transfer, ret, None),
            };
            results.push(value.map_err(after)?);
        }

        for (p, plan) in self.params.iter().enumerate() {
            let (Role::Script, Some(i)) = (plan.role, plan.arg) else {
                continue;
            };
            let a = &self.info.args[i];
            if !a.direction.is_output() {
                continue;
            }
            let annotate = |e: BindError| after(e.at_arg(p + 1, Some(a.name.as_str())));
            let value = match (allocated[p].take(), &a.ty.kind) {
                (Some(record), _) => marshal::caller_alloc_to_script(reg, a, record),
                (None, DescriptorKind::Array(array)) if array.length_arg.is_some() => {
                    let length = array.length_arg.map(|l| self.length_value(l, &slots, &outs));
                    containers::array_to_script(reg, array, a.transfer, outs[p], length, None)
                }
                (None, _) => marshal::to_script(reg, &a.ty, a.transfer, outs[p], None),
            };
            results.push(value.map_err(annotate)?);
        }

        log_native_return(name, results.len());
        Ok(results)
    }

    #[allow(clippy::too_many_arguments)]
    fn marshal_input(
        &self,
        reg: &Registry,
        frame: &mut CallFrame,
        p: usize,
        a: &ArgInfo,
        value: &Value,
        slots: &mut [NativeArg],
        outs_base: *mut NativeArg,
        allocated: &mut [Option<CallerAllocated>],
    ) -> Result<()> {
        if a.direction == Direction::Out {
            if let Some((slot, record)) = marshal::caller_alloc(reg, frame, a)? {
                slots[p] = slot;
                allocated[p] = Some(record);
            } else {
                // Safety: `p < n`, `outs` is never resized
                slots[p] = NativeArg::from_pointer(unsafe { outs_base.add(p) } as *mut c_void);
            }
            return Ok(());
        }

        if let (DescriptorKind::Callback(info), Value::Function(target)) = (&a.ty.kind, value) {
            let scope = match a.scope {
                Scope::Notified if a.destroy_arg.is_none() => Scope::Forever,
                scope => scope,
            };
            let handle = closure::bind_for_scope(reg, frame, info, target.clone(), scope)?;
            let entry = NativeArg::from_address(handle.entry);
            if let Some(c) = a.closure_arg {
                slots[self.param_of(c)] = NativeArg::from_address(handle.user_data);
            }
            if let Some(d) = a.destroy_arg {
                slots[self.param_of(d)] = NativeArg::from_address(closure::destroy_notify as usize);
            }
            return self.store_input(p, a, entry, slots, outs_base);
        }

        let mut slot = NativeArg::zeroed();
        marshal::to_native(reg, frame, &a.ty, a.transfer, value, Some(a), &mut slot)?;
        self.store_input(p, a, slot, slots, outs_base)
    }

    fn store_input(
        &self,
        p: usize,
        a: &ArgInfo,
        slot: NativeArg,
        slots: &mut [NativeArg],
        outs_base: *mut NativeArg,
    ) -> Result<()> {
        if a.direction == Direction::InOut {
            // Safety: `p < n`, `outs` is never resized
            unsafe {
                *outs_base.add(p) = slot;
                slots[p] = NativeArg::from_pointer(outs_base.add(p) as *mut c_void);
            }
        } else {
            slots[p] = slot;
        }
        Ok(())
    }

    /// Value of length argument `arg` after the call
    fn length_value(&self, arg: usize, slots: &[NativeArg], outs: &[NativeArg]) -> usize {
        let a = &self.info.args[arg];
        let p = self.param_of(arg);
        let s = if a.direction.is_output() { outs[p] } else { slots[p] };
        s.get_int(storage(&a.ty)).unwrap_or(0).max(0) as usize
    }
}

/// Plan and invoke `info` in one step
pub fn invoke(reg: &Registry, info: &Arc<CallableInfo>, args: &[Value]) -> Result<Vec<Value>> {
    Callable::build(reg, info)?.invoke(reg, None, args)
}
