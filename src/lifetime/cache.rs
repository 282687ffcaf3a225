//! Identity cache: one live wrapper per native address
//!
//! Design: an explicit table keyed by (address, category) holding weak
//! references plus a generation number. A wrapper removes its own entry when
//! it is finalized (`forget` with its generation, so a newer wrapper for a
//! reused address is never evicted by an old one). Dead entries left behind
//! by wrappers that were never cached are swept on a bounded schedule.

use crate::compound::{Compound, CompoundCell};
use crate::descriptor::CompoundCategory;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Native-type category part of a cache key
///
/// Structs and unions share one category, objects and interfaces another, so
/// an object and a struct embedded at its start never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    Record,
    Instance,
}

impl From<CompoundCategory> for CacheCategory {
    fn from(category: CompoundCategory) -> Self {
        if category.is_object() {
            CacheCategory::Instance
        } else {
            CacheCategory::Record
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub address: usize,
    pub category: CacheCategory,
}

impl CacheKey {
    pub fn new(address: usize, category: impl Into<CacheCategory>) -> Self {
        Self {
            address,
            category: category.into(),
        }
    }
}

struct CacheEntry {
    wrapper: Weak<CompoundCell>,
    generation: u64,
}

struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    next_generation: u64,
    inserts_since_sweep: usize,
}

/// Weak address-to-wrapper table
pub struct IdentityCache {
    state: Mutex<CacheState>,
    sweep_interval: usize,
}

impl IdentityCache {
    pub fn new(sweep_interval: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                next_generation: 1,
                inserts_since_sweep: 0,
            }),
            sweep_interval,
        }
    }

    /// Live wrapper registered for `key`
    pub fn lookup(&self, key: CacheKey) -> Option<Compound> {
        let cell = {
            let state = self.state.lock();
            let found = state.entries.get(&key).and_then(|e| e.wrapper.upgrade());
            found
        };
        // Upgraded outside the lock scope: dropping a strong reference may
        // finalize a wrapper, which calls back into `forget`
        cell.map(Compound::from_cell)
    }

    /// Register `wrapper` under `key`, returning the entry generation
    pub fn insert(&self, key: CacheKey, wrapper: &Compound) -> u64 {
        let mut state = self.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        state.entries.insert(
            key,
            CacheEntry {
                wrapper: Arc::downgrade(wrapper.cell()),
                generation,
            },
        );

        state.inserts_since_sweep += 1;
        if self.sweep_interval > 0 && state.inserts_since_sweep >= self.sweep_interval {
            let removed = Self::sweep_locked(&mut state);
            tracing::trace!(removed, "identity cache swept");
        }
        generation
    }

    /// Remove the entry for `key` if it still carries `generation`
    pub fn forget(&self, key: CacheKey, generation: u64) -> bool {
        let mut state = self.state.lock();
        match state.entries.get(&key) {
            Some(entry) if entry.generation == generation => {
                state.entries.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Drop entries whose wrapper is gone; returns the number removed
    pub fn sweep(&self) -> usize {
        Self::sweep_locked(&mut self.state.lock())
    }

    fn sweep_locked(state: &mut CacheState) -> usize {
        let before = state.entries.len();
        state.entries.retain(|_, e| e.wrapper.strong_count() > 0);
        state.inserts_since_sweep = 0;
        before - state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let entries = std::mem::take(&mut self.state.lock().entries);
        drop(entries);
    }
}
