use super::HostType;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Services of the host object system's type registry
///
/// The engine never decides type compatibility itself; it asks the host.
pub trait TypeSystem: Send + Sync {
    /// True when `ty` is `ancestor`, derives from it, or implements it
    fn is_a(&self, ty: HostType, ancestor: HostType) -> bool;

    /// Concrete runtime type of the instance at `address`, if the host can tell
    fn instance_type(&self, address: usize) -> Option<HostType>;

    fn type_name(&self, ty: HostType) -> Option<String>;

    /// Name of a native error domain
    fn error_domain(&self, domain: u32) -> Option<String>;

    /// Domain registered under `name`
    fn error_domain_id(&self, _name: &str) -> Option<u32> {
        None
    }
}

struct TypeEntry {
    name: String,
    parent: Option<HostType>,
    interfaces: Vec<HostType>,
}

type InstanceProbe = Box<dyn Fn(usize) -> Option<HostType> + Send + Sync>;

/// Table-driven [`TypeSystem`] for embedders without a richer host registry
#[derive(Default)]
pub struct SimpleTypeSystem {
    types: RwLock<HashMap<HostType, TypeEntry>>,
    domains: RwLock<HashMap<u32, String>>,
    probe: RwLock<Option<InstanceProbe>>,
}

impl SimpleTypeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ty: HostType, name: impl Into<String>, parent: Option<HostType>) {
        self.types.write().insert(
            ty,
            TypeEntry {
                name: name.into(),
                parent,
                interfaces: Vec::new(),
            },
        );
    }

    pub fn add_interface(&self, ty: HostType, interface: HostType) {
        if let Some(entry) = self.types.write().get_mut(&ty) {
            entry.interfaces.push(interface);
        }
    }

    pub fn register_domain(&self, domain: u32, name: impl Into<String>) {
        self.domains.write().insert(domain, name.into());
    }

    /// Install the function reporting concrete runtime types of instances
    pub fn set_instance_probe<F>(&self, probe: F)
    where
        F: Fn(usize) -> Option<HostType> + Send + Sync + 'static,
    {
        *self.probe.write() = Some(Box::new(probe));
    }
}

impl TypeSystem for SimpleTypeSystem {
    fn is_a(&self, ty: HostType, ancestor: HostType) -> bool {
        let types = self.types.read();
        let mut current = Some(ty);
        // Bounded walk guards against a malformed cyclic table
        for _ in 0..=types.len() {
            let Some(t) = current else { return false };
            if t == ancestor {
                return true;
            }
            match types.get(&t) {
                Some(entry) => {
                    if entry.interfaces.contains(&ancestor) {
                        return true;
                    }
                    current = entry.parent;
                }
                None => return false,
            }
        }
        false
    }

    fn instance_type(&self, address: usize) -> Option<HostType> {
        self.probe.read().as_ref().and_then(|probe| probe(address))
    }

    fn type_name(&self, ty: HostType) -> Option<String> {
        self.types.read().get(&ty).map(|e| e.name.clone())
    }

    fn error_domain(&self, domain: u32) -> Option<String> {
        self.domains.read().get(&domain).cloned()
    }

    fn error_domain_id(&self, name: &str) -> Option<u32> {
        self.domains
            .read()
            .iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| *id)
    }
}
