//! Compound wrappers: scripting handles for native structs, unions and objects
//!
//! Design: each wrapper carries an explicit [`Posture`] describing what it
//! owns. Release is a one-way state machine (`Live -> Finalizing ->
//! Released`) run either by the last handle being dropped or explicitly; the
//! native destructor runs at most once and the address is nulled afterwards,
//! so late access reports `UseAfterFree` instead of touching freed memory.
//!
//! At most one cached wrapper exists per (address, category); see
//! [`IdentityCache`](crate::lifetime::IdentityCache).

use crate::descriptor::{CompoundCategory, CompoundInfo, HostType};
use crate::errors::{BindError, Result};
use crate::lifetime::registry::RegistryInner;
use crate::lifetime::{CacheKey, Registry};
use crate::logging::log_wrapper_event;
use crate::value::Value;
use bitflags::bitflags;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::{Arc, Weak};

mod fields;


/// Ownership a wrapper holds over its native memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Posture {
    /// Transient view; native memory outlives the wrapper
    Peek,
    /// Memory belongs to a parent wrapper kept alive by this one
    Parent,
    /// Exclusive owner; destructor runs once on release
    Own,
    /// Storage allocated by the wrapper itself
    Allocate,
}

impl Posture {
    pub fn as_str(self) -> &'static str {
        match self {
            Posture::Peek => "peek",
            Posture::Parent => "parent",
            Posture::Own => "own",
            Posture::Allocate => "allocate",
        }
    }

    #[inline]
    pub fn owns_memory(self) -> bool {
        matches!(self, Posture::Own | Posture::Allocate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeState {
    Live,
    Finalizing,
    Released,
}

bitflags! {
    /// Options for [`Compound::unwrap`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnwrapFlags: u32 {
        /// Nil is accepted and yields a null address
        const OPTIONAL = 1 << 0;
        /// Skip the type compatibility check (untyped pointer targets)
        const ANY_TYPE = 1 << 1;
    }
}

/// Result of a successful unwrap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unwrapped {
    pub address: usize,
    /// Concrete runtime type, possibly narrower than the requested one
    pub runtime_type: HostType,
}

struct CompoundState {
    address: usize,
    posture: Posture,
    life: LifeState,
}

pub struct CompoundCell {
    info: Arc<CompoundInfo>,
    runtime_type: HostType,
    state: Mutex<CompoundState>,
    parent: Option<Compound>,
    cache_slot: OnceCell<(CacheKey, u64)>,
    registry: Weak<RegistryInner>,
}

impl CompoundCell {
    /// Run the release state machine; true when a native destructor ran
    fn finalize(&self) -> bool {
        let (address, posture) = {
            let mut state = self.state.lock();
            if state.life != LifeState::Live {
                return false;
            }
            state.life = LifeState::Finalizing;
            (state.address, state.posture)
        };

        let destroyed = address != 0 && posture.owns_memory() && destroy_native(&self.info, address);

        {
            let mut state = self.state.lock();
            state.address = 0;
            state.life = LifeState::Released;
        }

        if let Some((key, generation)) = self.cache_slot.get() {
            if let Some(inner) = self.registry.upgrade() {
                Registry::from_inner(inner).cache().forget(*key, *generation);
            }
        }

        log_wrapper_event("released", &self.info.name, address, posture.as_str());
        destroyed
    }
}

impl Drop for CompoundCell {
    fn drop(&mut self) {
        self.finalize();
    }
}

fn destroy_native(info: &CompoundInfo, address: usize) -> bool {
    let ptr = address as *mut c_void;
    // Safety: the wrapper owned `ptr`, and finalize() admits one caller only
    unsafe {
        if info.category.is_object() {
            match info.unref_instance {
                Some(unref) => unref(ptr),
                None => {
                    tracing::warn!(ty = %info.name, "object without unref function leaked");
                    return false;
                }
            }
        } else {
            match info.free {
                Some(free) => free(ptr),
                None => libc::free(ptr),
            }
        }
    }
    true
}

/// Scripting-side handle to a native struct, union or object
#[derive(Clone)]
pub struct Compound(Arc<CompoundCell>);

impl Compound {
    #[inline]
    pub(crate) fn from_cell(cell: Arc<CompoundCell>) -> Self {
        Self(cell)
    }

    #[inline]
    pub(crate) fn cell(&self) -> &Arc<CompoundCell> {
        &self.0
    }

    /// Wrap a native address, reusing the cached wrapper when one is live
    ///
    /// `Own` means the caller hands one unit of ownership (one reference for
    /// objects) to the engine. When a compatible cached wrapper exists it
    /// absorbs that unit: a surplus object reference is dropped, a borrowed
    /// wrapper is upgraded to owner.
    pub fn wrap(
        reg: &Registry,
        info: &Arc<CompoundInfo>,
        address: usize,
        posture: Posture,
        parent: Option<&Compound>,
    ) -> Result<Compound> {
        if address == 0 {
            return Err(BindError::null(info.qualified_name()));
        }
        let key = CacheKey::new(address, info.category);

        if let Some(cached) = reg.cache().lookup(key) {
            if is_compatible(reg, &cached, info) {
                cached.absorb(posture);
                return Ok(cached);
            }
            tracing::trace!(
                address = format_args!("{:#x}", address),
                cached = %cached.info().name,
                requested = %info.name,
                "cache hit with unrelated type, creating uncached wrapper"
            );
            return Ok(Self::create(reg, info, address, posture, parent, None));
        }

        Ok(Self::create(reg, info, address, posture, parent, Some(key)))
    }

    /// Wrap without consulting or populating the identity cache
    pub fn wrap_transient(
        reg: &Registry,
        info: &Arc<CompoundInfo>,
        address: usize,
        posture: Posture,
        parent: Option<&Compound>,
    ) -> Result<Compound> {
        if address == 0 {
            return Err(BindError::null(info.qualified_name()));
        }
        Ok(Self::create(reg, info, address, posture, parent, None))
    }

    fn create(
        reg: &Registry,
        info: &Arc<CompoundInfo>,
        address: usize,
        posture: Posture,
        parent: Option<&Compound>,
        cache_key: Option<CacheKey>,
    ) -> Compound {
        let runtime_type = resolve_runtime_type(reg, info, address);
        let compound = Compound(Arc::new(CompoundCell {
            info: info.clone(),
            runtime_type,
            state: Mutex::new(CompoundState {
                address,
                posture,
                life: LifeState::Live,
            }),
            parent: parent.cloned(),
            cache_slot: OnceCell::new(),
            registry: reg.downgrade(),
        }));

        if let Some(key) = cache_key {
            let generation = reg.cache().insert(key, &compound);
            let _ = compound.0.cache_slot.set((key, generation));
        }

        log_wrapper_event("created", &info.name, address, posture.as_str());
        compound
    }

    fn absorb(&self, incoming: Posture) {
        if incoming != Posture::Own {
            return;
        }
        let surplus = {
            let mut state = self.0.state.lock();
            match state.posture {
                Posture::Peek | Posture::Parent => {
                    state.posture = Posture::Own;
                    None
                }
                Posture::Own | Posture::Allocate if self.0.info.category.is_object() => {
                    Some(state.address)
                }
                Posture::Own | Posture::Allocate => {
                    tracing::warn!(
                        ty = %self.0.info.name,
                        "ownership of an already owned record handed over again, ignored"
                    );
                    None
                }
            }
        };

        if let (Some(address), Some(unref)) = (surplus, self.0.info.unref_instance) {
            // Safety: the caller transferred one reference we do not need
            unsafe { unref(address as *mut c_void) };
        }
    }

    /// Native address and runtime type of a compatible wrapper
    ///
    /// The type check consults wrapper metadata only; native memory is not
    /// touched on mismatch.
    pub fn unwrap(
        reg: &Registry,
        value: &Value,
        requested: &CompoundInfo,
        flags: UnwrapFlags,
    ) -> Result<Unwrapped> {
        match value {
            Value::Nil if flags.contains(UnwrapFlags::OPTIONAL) => Ok(Unwrapped {
                address: 0,
                runtime_type: requested.host_type,
            }),
            Value::Nil => Err(BindError::null(requested.qualified_name())),
            Value::Compound(compound) => {
                if !flags.contains(UnwrapFlags::ANY_TYPE) && !is_compatible(reg, compound, requested) {
                    return Err(BindError::type_mismatch(
                        requested.qualified_name(),
                        compound.info().qualified_name(),
                    ));
                }
                Ok(Unwrapped {
                    address: compound.address()?,
                    runtime_type: compound.runtime_type(),
                })
            }
            other => Err(BindError::type_mismatch(
                requested.qualified_name(),
                other.type_name(),
            )),
        }
    }

    /// Address when `value` is a live compatible wrapper, `None` otherwise
    pub fn check(reg: &Registry, value: &Value, requested: &CompoundInfo) -> Option<usize> {
        Self::unwrap(reg, value, requested, UnwrapFlags::empty())
            .ok()
            .map(|u| u.address)
    }

    /// Zeroed native storage owned by the new wrapper
    pub fn allocate(reg: &Registry, info: &Arc<CompoundInfo>) -> Result<Compound> {
        if info.category.is_object() {
            return Err(BindError::type_mismatch(
                "struct or union",
                info.category.as_str(),
            ));
        }
        let size = info.size.max(1);
        // Safety: plain zeroed allocation, released by finalize()
        let ptr = unsafe { libc::calloc(1, size) };
        if ptr.is_null() {
            return Err(BindError::allocation(size));
        }
        crate::logging::log_allocation(size, ptr as usize);
        Ok(Self::create(
            reg,
            info,
            ptr as usize,
            Posture::Allocate,
            None,
            Some(CacheKey::new(ptr as usize, info.category)),
        ))
    }

    /// Build a new instance initialized from a name-to-value table
    ///
    /// Objects go through the type's construction protocol with the table
    /// as properties; structs are allocated and their fields assigned.
    pub fn construct(reg: &Registry, info: &Arc<CompoundInfo>, properties: &Value) -> Result<Compound> {
        let empty = BTreeMap::new();
        let table = match properties {
            Value::Nil => &empty,
            Value::Record(map) => &**map,
            other => return Err(BindError::type_mismatch("record", other.type_name())),
        };

        if info.category.is_object() {
            let address = crate::interop::variant::construct_object(reg, info, table)?;
            return Self::wrap(reg, info, address, Posture::Own, None);
        }

        let compound = Self::allocate(reg, info)?;
        for (name, value) in table {
            compound.set_field(reg, name, value)?;
        }
        Ok(compound)
    }

    #[inline]
    pub fn info(&self) -> &Arc<CompoundInfo> {
        &self.0.info
    }

    #[inline]
    pub fn category(&self) -> CompoundCategory {
        self.0.info.category
    }

    #[inline]
    pub fn runtime_type(&self) -> HostType {
        self.0.runtime_type
    }

    pub fn posture(&self) -> Posture {
        self.0.state.lock().posture
    }

    pub fn life(&self) -> LifeState {
        self.0.state.lock().life
    }

    pub fn is_live(&self) -> bool {
        self.life() == LifeState::Live
    }

    pub fn parent(&self) -> Option<&Compound> {
        self.0.parent.as_ref()
    }

    pub fn is_cached(&self) -> bool {
        self.0.cache_slot.get().is_some()
    }

    /// Native address, or `UseAfterFree` once released
    pub fn address(&self) -> Result<usize> {
        let state = self.0.state.lock();
        match state.life {
            LifeState::Live if state.address != 0 => Ok(state.address),
            _ => Err(BindError::use_after_free(
                self.0.info.qualified_name(),
                state.address,
            )),
        }
    }

    /// Release now instead of at finalization
    ///
    /// Returns true when this call ran the native destructor; repeated calls
    /// are no-ops.
    pub fn release(&self) -> bool {
        self.0.finalize()
    }

    /// Give ownership of the native memory away without destroying it
    ///
    /// The wrapper stays usable as a borrowed view.
    pub fn relinquish(&self) {
        let mut state = self.0.state.lock();
        if state.life == LifeState::Live && state.posture.owns_memory() {
            state.posture = Posture::Peek;
            let address = state.address;
            drop(state);
            log_wrapper_event("relinquished", &self.0.info.name, address, Posture::Peek.as_str());
        }
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Compound) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live handles to this wrapper
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl fmt::Debug for Compound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.lock();
        f.debug_struct("Compound")
            .field("type", &self.0.info.qualified_name())
            .field("address", &format_args!("{:#x}", state.address))
            .field("posture", &state.posture)
            .field("life", &state.life)
            .finish()
    }
}

fn resolve_runtime_type(reg: &Registry, info: &CompoundInfo, address: usize) -> HostType {
    if !info.category.is_object() || !info.host_type.is_valid() {
        return info.host_type;
    }
    reg.types()
        .instance_type(address)
        .filter(|t| reg.types().is_a(*t, info.host_type))
        .unwrap_or(info.host_type)
}

/// Wrapper's runtime type is the requested type or a subtype of it
pub(crate) fn is_compatible(reg: &Registry, compound: &Compound, requested: &CompoundInfo) -> bool {
    let have = compound.info();
    if std::ptr::eq(have.as_ref(), requested) {
        return true;
    }
    if requested.host_type.is_valid() && compound.runtime_type().is_valid() {
        return reg.types().is_a(compound.runtime_type(), requested.host_type);
    }
    !requested.host_type.is_valid()
        && !have.host_type.is_valid()
        && have.qualified_name() == requested.qualified_name()
}
