use super::{HostType, Primitive, TypeDescriptor};
use crate::interop::types::Variant;
use std::ffi::{c_char, c_void};

/// Duplicates a native instance
pub type CopyFn = unsafe extern "C" fn(*const c_void) -> *mut c_void;
/// Releases a native instance (free for structs, unref for objects)
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
/// Takes an additional reference on an object instance
pub type RefFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
/// Object construction protocol: type, property count, names, values
pub type ConstructFn =
    unsafe extern "C" fn(usize, u32, *const *const c_char, *const Variant) -> *mut c_void;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompoundCategory {
    Struct,
    Union,
    Object,
    Interface,
}

impl CompoundCategory {
    /// Reference-counted instances
    #[inline]
    pub fn is_object(self) -> bool {
        matches!(self, CompoundCategory::Object | CompoundCategory::Interface)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompoundCategory::Struct => "struct",
            CompoundCategory::Union => "union",
            CompoundCategory::Object => "object",
            CompoundCategory::Interface => "interface",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub offset: usize,
    pub ty: TypeDescriptor,
    pub writable: bool,
}

impl FieldInfo {
    pub fn new(name: impl Into<String>, offset: usize, ty: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            offset,
            ty,
            writable: true,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PropertyInfo {
    pub name: String,
    pub ty: TypeDescriptor,
}

/// Reflected shape of a struct, union, object or interface
#[derive(Debug, Clone)]
pub struct CompoundInfo {
    pub namespace: String,
    pub name: String,
    pub host_type: HostType,
    pub category: CompoundCategory,
    pub size: usize,
    pub align: usize,
    pub fields: Vec<FieldInfo>,
    pub properties: Vec<PropertyInfo>,
    pub copy: Option<CopyFn>,
    pub free: Option<FreeFn>,
    pub ref_instance: Option<RefFn>,
    pub unref_instance: Option<FreeFn>,
    pub construct: Option<ConstructFn>,
}

impl CompoundInfo {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        host_type: HostType,
        category: CompoundCategory,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            host_type,
            category,
            size: 0,
            align: 1,
            fields: Vec::new(),
            properties: Vec::new(),
            copy: None,
            free: None,
            ref_instance: None,
            unref_instance: None,
            construct: None,
        }
    }

    pub fn with_layout(mut self, size: usize, align: usize) -> Self {
        self.size = size;
        self.align = align.max(1);
        self
    }

    pub fn with_field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, ty: TypeDescriptor) -> Self {
        self.properties.push(PropertyInfo {
            name: name.into(),
            ty,
        });
        self
    }

    pub fn with_copy(mut self, copy: CopyFn) -> Self {
        self.copy = Some(copy);
        self
    }

    pub fn with_free(mut self, free: FreeFn) -> Self {
        self.free = Some(free);
        self
    }

    pub fn with_refcounting(mut self, ref_instance: RefFn, unref_instance: FreeFn) -> Self {
        self.ref_instance = Some(ref_instance);
        self.unref_instance = Some(unref_instance);
        self
    }

    pub fn with_constructor(mut self, construct: ConstructFn) -> Self {
        self.construct = Some(construct);
        self
    }

    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyInfo> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Enumeration or flags type
#[derive(Debug, Clone)]
pub struct EnumInfo {
    pub namespace: String,
    pub name: String,
    pub storage: Primitive,
    pub is_flags: bool,
    pub values: Vec<(String, i64)>,
}

impl EnumInfo {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, is_flags: bool) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            storage: if is_flags {
                Primitive::UInt32
            } else {
                Primitive::Int32
            },
            is_flags,
            values: Vec::new(),
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: i64) -> Self {
        self.values.push((name.into(), value));
        self
    }

    pub fn lookup(&self, name: &str) -> Option<i64> {
        self.values
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.values
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(n, _)| n.as_str())
    }
}
