//! Registry: per-interpreter engine context
//!
//! Design: one `Registry` is created when the scripting module bootstraps and
//! is passed explicitly to every engine entry point. It owns the four logical
//! slots (identity cache, type-info table, namespace repository, log handler)
//! plus the engine's own bookkeeping: the callable plan cache, live closure
//! trampolines and closures waiting for reclamation.
//!
//! Hosts that re-enter the engine from several native threads serialize
//! through [`Registry::enter`]; the lock is reentrant so closures may call
//! back into native code on the same thread.

use super::cache::IdentityCache;
use super::guard::Guard;
use super::repository::Repository;
use crate::config::BindConfig;
use crate::descriptor::{HostType, SimpleTypeSystem, TypeSystem};
use crate::errors::{BindError, Result};
use crate::interop::call::Callable;
use crate::interop::closure::ClosureBlock;
use crate::value::{ScriptFunction, Value};
use dashmap::DashMap;
use parking_lot::{
    Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Native log levels understood by [`Registry::log_message`]
pub mod log_level {
    pub const ERROR: u32 = 1 << 2;
    pub const CRITICAL: u32 = 1 << 3;
    pub const WARNING: u32 = 1 << 4;
    pub const MESSAGE: u32 = 1 << 5;
    pub const INFO: u32 = 1 << 6;
    pub const DEBUG: u32 = 1 << 7;
}

pub(crate) struct RegistryInner {
    config: BindConfig,
    types: Arc<dyn TypeSystem>,
    cache: IdentityCache,
    type_table: RwLock<HashMap<HostType, Value>>,
    repository: RwLock<Repository>,
    log_handler: RwLock<Option<ScriptFunction>>,
    pub(crate) callables: DashMap<usize, Arc<Callable>>,
    closures: Mutex<HashMap<usize, ClosureBlock>>,
    reclaim: Mutex<Vec<ClosureBlock>>,
    retained: Mutex<HashMap<usize, Guard>>,
    serial: ReentrantMutex<()>,
    /// Closure trampolines currently executing
    active_callbacks: AtomicUsize,
}

/// Serial lock held by a running closure trampoline
pub(crate) struct CallbackTurn<'a> {
    _turn: ReentrantMutexGuard<'a, ()>,
    active: &'a AtomicUsize,
}

impl Drop for CallbackTurn<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Engine context shared by all wrappers, callables and closures
#[derive(Clone)]
pub struct Registry(Arc<RegistryInner>);

impl Registry {
    pub fn new(config: BindConfig, types: Arc<dyn TypeSystem>) -> Self {
        tracing::debug!(
            sweep_interval = config.cache.sweep_interval,
            "registry created"
        );
        Self(Arc::new(RegistryInner {
            cache: IdentityCache::new(config.cache.sweep_interval),
            config,
            types,
            type_table: RwLock::new(HashMap::new()),
            repository: RwLock::new(Repository::new()),
            log_handler: RwLock::new(None),
            callables: DashMap::new(),
            closures: Mutex::new(HashMap::new()),
            reclaim: Mutex::new(Vec::new()),
            retained: Mutex::new(HashMap::new()),
            serial: ReentrantMutex::new(()),
            active_callbacks: AtomicUsize::new(0),
        }))
    }

    /// Registry with default configuration and an empty [`SimpleTypeSystem`]
    pub fn with_defaults() -> Self {
        Self::new(BindConfig::default(), Arc::new(SimpleTypeSystem::new()))
    }

    #[inline]
    pub(crate) fn downgrade(&self) -> Weak<RegistryInner> {
        Arc::downgrade(&self.0)
    }

    #[inline]
    pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self(inner)
    }

    #[inline]
    pub(crate) fn inner(&self) -> &RegistryInner {
        &self.0
    }

    #[inline]
    pub fn config(&self) -> &BindConfig {
        &self.0.config
    }

    #[inline]
    pub fn types(&self) -> &dyn TypeSystem {
        self.0.types.as_ref()
    }

    #[inline]
    pub fn cache(&self) -> &IdentityCache {
        &self.0.cache
    }

    pub fn ptr_eq(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Take the engine's serializing lock for one turn
    ///
    /// Pending closure trampolines are reclaimed on entry when configured.
    pub fn enter(&self) -> ReentrantMutexGuard<'_, ()> {
        let turn = self.0.serial.lock();
        if self.0.config.closures.reclaim_on_entry {
            self.reclaim_closures();
        }
        turn
    }

    /// Serial lock without reclamation
    pub(crate) fn turn(&self) -> ReentrantMutexGuard<'_, ()> {
        self.0.serial.lock()
    }

    /// Serial lock for a closure trampoline; no trampoline is reclaimed
    /// while one is executing
    pub(crate) fn enter_callback(&self) -> CallbackTurn<'_> {
        let turn = self.0.serial.lock();
        self.0.active_callbacks.fetch_add(1, Ordering::AcqRel);
        CallbackTurn {
            _turn: turn,
            active: &self.0.active_callbacks,
        }
    }

    // ------------------------------------------------------------------
    // Type-info table slot
    // ------------------------------------------------------------------

    /// Associate the scripting-side type table for a host type
    pub fn set_type_table(&self, ty: HostType, table: Value) {
        self.0.type_table.write().insert(ty, table);
    }

    pub fn type_table(&self, ty: HostType) -> Option<Value> {
        self.0.type_table.read().get(&ty).cloned()
    }

    // ------------------------------------------------------------------
    // Namespace slot
    // ------------------------------------------------------------------

    pub fn repository(&self) -> RwLockReadGuard<'_, Repository> {
        self.0.repository.read()
    }

    pub fn repository_mut(&self) -> RwLockWriteGuard<'_, Repository> {
        self.0.repository.write()
    }

    // ------------------------------------------------------------------
    // Log handler slot
    // ------------------------------------------------------------------

    /// Install (or with `None`, remove) the scripting log handler
    pub fn set_log_handler(&self, handler: Option<ScriptFunction>) {
        *self.0.log_handler.write() = handler;
    }

    /// Route a native log message to the installed handler, else to `tracing`
    ///
    /// The handler receives `(domain, level, message)`; returning `true`
    /// marks the message as consumed.
    pub fn log_message(&self, domain: &str, level: u32, message: &str) {
        let handler = self.0.log_handler.read().clone();
        if let Some(handler) = handler {
            let args = [Value::string(domain), Value::Int(level as i64), Value::string(message)];
            match handler.call(&args) {
                Ok(results) if results.first() == Some(&Value::Bool(true)) => return,
                Ok(_) => {}
                Err(e) => crate::logging::log_callback_error("log handler", &e.to_string()),
            }
        }

        if level & (log_level::ERROR | log_level::CRITICAL) != 0 {
            tracing::error!(target: "gibind::native", domain, "{}", message);
        } else if level & log_level::WARNING != 0 {
            tracing::warn!(target: "gibind::native", domain, "{}", message);
        } else if level & (log_level::MESSAGE | log_level::INFO) != 0 {
            tracing::info!(target: "gibind::native", domain, "{}", message);
        } else {
            tracing::debug!(target: "gibind::native", domain, "{}", message);
        }
    }

    /// Opaque pointer identifying this registry to native code
    ///
    /// Valid for as long as some `Registry` clone is alive.
    pub fn as_user_data(&self) -> *mut c_void {
        Arc::as_ptr(&self.0) as *mut c_void
    }

    // ------------------------------------------------------------------
    // Closure bookkeeping
    // ------------------------------------------------------------------

    pub(crate) fn adopt_closure(&self, user_data: usize, block: ClosureBlock) {
        self.0.closures.lock().insert(user_data, block);
    }

    /// Move a closure to the reclamation list; its trampoline stays mapped
    /// until the next [`reclaim_closures`](Self::reclaim_closures)
    pub(crate) fn retire_closure(&self, user_data: usize) -> bool {
        let block = self.0.closures.lock().remove(&user_data);
        match block {
            Some(block) => {
                self.0.reclaim.lock().push(block);
                true
            }
            None => false,
        }
    }

    pub(crate) fn has_closure(&self, user_data: usize) -> bool {
        self.0.closures.lock().contains_key(&user_data)
    }

    /// Free trampolines of closures that can no longer be called
    ///
    /// Does nothing while a closure trampoline is executing.
    pub fn reclaim_closures(&self) -> usize {
        let _turn = self.0.serial.lock();
        if self.0.active_callbacks.load(Ordering::Acquire) > 0 {
            return 0;
        }
        self.drain_reclaim()
    }

    fn drain_reclaim(&self) -> usize {
        let pending = std::mem::take(&mut *self.0.reclaim.lock());
        let count = pending.len();
        drop(pending);
        if count > 0 {
            tracing::trace!(count, "closure trampolines reclaimed");
        }
        count
    }

    pub fn live_closures(&self) -> usize {
        self.0.closures.lock().len()
    }

    /// Keep a guard alive until released or the registry shuts down
    pub(crate) fn retain(&self, key: usize, guard: Guard) {
        self.0.retained.lock().insert(key, guard);
    }

    /// Release a guard kept by [`retain`](Self::retain); finalizes it when
    /// no other handle holds it
    pub fn release_retained(&self, key: usize) -> bool {
        let guard = self.0.retained.lock().remove(&key);
        guard.is_some()
    }

    pub fn retained_count(&self) -> usize {
        self.0.retained.lock().len()
    }

    /// Tear down everything this registry keeps alive
    ///
    /// Called when the hosting interpreter is destroyed. Wrappers still held
    /// by scripting code stay valid but are no longer cached.
    pub fn shutdown(&self) {
        let _turn = self.0.serial.lock();
        tracing::debug!(
            cached = self.0.cache.len(),
            closures = self.live_closures(),
            "registry shutting down"
        );

        let retained = std::mem::take(&mut *self.0.retained.lock());
        drop(retained);

        let live: Vec<ClosureBlock> = self.0.closures.lock().drain().map(|(_, b)| b).collect();
        self.0.reclaim.lock().extend(live);
        self.drain_reclaim();

        self.0.callables.clear();
        self.0.cache.clear();
        self.0.type_table.write().clear();
        self.0.repository.write().clear();
        *self.0.log_handler.write() = None;
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("cached", &self.0.cache.len())
            .field("callables", &self.0.callables.len())
            .finish()
    }
}

/// Native log function forwarding into [`Registry::log_message`]
///
/// # Safety
/// `user_data` must come from [`Registry::as_user_data`] of a live registry;
/// `domain` and `message` must be null or valid NUL-terminated strings.
pub unsafe extern "C" fn log_trampoline(
    domain: *const c_char,
    level: u32,
    message: *const c_char,
    user_data: *mut c_void,
) {
    if user_data.is_null() {
        return;
    }
    let text = |p: *const c_char| {
        if p.is_null() {
            String::new()
        } else {
            CStr::from_ptr(p).to_string_lossy().into_owned()
        }
    };

    let inner = user_data as *const RegistryInner;
    Arc::increment_strong_count(inner);
    let registry = Registry::from_inner(Arc::from_raw(inner));

    let domain = text(domain);
    let message = text(message);
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        registry.log_message(&domain, level, &message);
    }));
}

pub(crate) fn upgrade(weak: &Weak<RegistryInner>) -> Result<Registry> {
    weak.upgrade()
        .map(Registry::from_inner)
        .ok_or_else(|| BindError::null("registry"))
}
