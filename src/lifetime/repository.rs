//! Namespace repository: the root of everything reachable by name
//!
//! Each namespace owns the shared libraries its callables live in and the
//! items (types, callables, constants) registered under it.

use crate::descriptor::{CallableInfo, CompoundInfo, EnumInfo, HostType};
use crate::errors::Result;
use crate::interop::library::Library;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum RepositoryItem {
    Compound(Arc<CompoundInfo>),
    Callable(Arc<CallableInfo>),
    Enum(Arc<EnumInfo>),
    Constant(Value),
}

#[derive(Debug, Default)]
pub struct Namespace {
    pub name: String,
    pub version: Option<String>,
    libraries: Vec<Library>,
    items: HashMap<String, RepositoryItem>,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn load_library(&mut self, name: &str) -> Result<()> {
        let library = Library::load(name)?;
        self.libraries.push(library);
        Ok(())
    }

    pub fn add_library(&mut self, library: Library) {
        self.libraries.push(library);
    }

    pub fn insert(&mut self, name: impl Into<String>, item: RepositoryItem) {
        self.items.insert(name.into(), item);
    }

    pub fn get(&self, name: &str) -> Option<&RepositoryItem> {
        self.items.get(name)
    }

    pub fn items(&self) -> impl Iterator<Item = (&str, &RepositoryItem)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// First library of this namespace exporting `symbol`
    pub fn resolve(&self, symbol: &str) -> Option<usize> {
        self.libraries.iter().find_map(|lib| lib.symbol(symbol).ok())
    }
}

#[derive(Debug, Default)]
pub struct Repository {
    namespaces: HashMap<String, Namespace>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace `name`, created empty when missing
    pub fn define(&mut self, name: &str) -> &mut Namespace {
        self.namespaces
            .entry(name.to_string())
            .or_insert_with(|| Namespace::new(name))
    }

    pub fn namespace(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    pub fn lookup(&self, namespace: &str, item: &str) -> Option<&RepositoryItem> {
        self.namespaces.get(namespace).and_then(|ns| ns.get(item))
    }

    /// Entry address of `symbol`, preferring libraries of `namespace`
    pub fn resolve_symbol(&self, namespace: &str, symbol: &str) -> Option<usize> {
        if let Some(addr) = self.namespaces.get(namespace).and_then(|ns| ns.resolve(symbol)) {
            return Some(addr);
        }
        if let Some(addr) = self
            .namespaces
            .values()
            .filter(|ns| ns.name != namespace)
            .find_map(|ns| ns.resolve(symbol))
        {
            return Some(addr);
        }
        Library::this_process().ok().and_then(|lib| lib.symbol(symbol).ok())
    }

    /// Compound registered under any namespace for host type `ty`
    pub fn find_compound(&self, ty: HostType) -> Option<Arc<CompoundInfo>> {
        if !ty.is_valid() {
            return None;
        }
        self.namespaces
            .values()
            .flat_map(|ns| ns.items.values())
            .find_map(|item| match item {
                RepositoryItem::Compound(info) if info.host_type == ty => Some(info.clone()),
                _ => None,
            })
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    pub fn clear(&mut self) {
        self.namespaces.clear();
    }
}
