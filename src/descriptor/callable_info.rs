use super::{CompoundInfo, Transfer, TypeDescriptor};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    #[inline]
    pub fn is_input(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    #[inline]
    pub fn is_output(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// How long a callback handed to native code stays callable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    /// Only during the call receiving it
    #[default]
    Call,
    /// Exactly once, at some later point
    Async,
    /// Until the paired destroy-notify runs
    Notified,
    /// Until explicitly destroyed by the scripting side
    Forever,
}

/// Native error reporting convention of a callable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorChannel {
    #[default]
    None,
    /// Trailing error out-argument, re-raised as a script error
    Raise,
    /// Trailing error out-argument, logged and otherwise ignored
    Advisory,
}

#[derive(Debug, Clone)]
pub struct ArgInfo {
    pub name: String,
    pub ty: TypeDescriptor,
    pub direction: Direction,
    pub transfer: Transfer,
    pub caller_allocates: bool,
    pub nullable: bool,
    pub scope: Scope,
    /// Argument receiving the callback's user data
    pub closure_arg: Option<usize>,
    /// Argument receiving the callback's destroy notify
    pub destroy_arg: Option<usize>,
}

impl ArgInfo {
    pub fn new(name: impl Into<String>, ty: TypeDescriptor, direction: Direction) -> Self {
        Self {
            name: name.into(),
            ty,
            direction,
            transfer: Transfer::None,
            caller_allocates: false,
            nullable: false,
            scope: Scope::Call,
            closure_arg: None,
            destroy_arg: None,
        }
    }

    pub fn input(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self::new(name, ty, Direction::In)
    }

    pub fn output(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self::new(name, ty, Direction::Out)
    }

    pub fn inout(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self::new(name, ty, Direction::InOut)
    }

    pub fn transfer(mut self, transfer: Transfer) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn caller_allocates(mut self) -> Self {
        self.caller_allocates = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn closure(mut self, user_data_arg: usize) -> Self {
        self.closure_arg = Some(user_data_arg);
        self
    }

    pub fn destroy(mut self, destroy_arg: usize) -> Self {
        self.destroy_arg = Some(destroy_arg);
        self
    }
}

/// Reflected call signature
#[derive(Debug, Clone)]
pub struct CallableInfo {
    pub namespace: String,
    pub name: String,
    /// Exported symbol used to resolve the entry address
    pub symbol: Option<String>,
    pub address: Option<usize>,
    /// Type the callable is a method of
    pub container: Option<Arc<CompoundInfo>>,
    pub is_method: bool,
    pub return_type: TypeDescriptor,
    pub return_transfer: Transfer,
    pub throws: ErrorChannel,
    pub args: Vec<ArgInfo>,
}

impl CallableInfo {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            symbol: None,
            address: None,
            container: None,
            is_method: false,
            return_type: TypeDescriptor::void(),
            return_transfer: Transfer::None,
            throws: ErrorChannel::None,
            args: Vec::new(),
        }
    }

    pub fn returns(mut self, ty: TypeDescriptor, transfer: Transfer) -> Self {
        self.return_type = ty;
        self.return_transfer = transfer;
        self
    }

    pub fn arg(mut self, arg: ArgInfo) -> Self {
        self.args.push(arg);
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn address(mut self, address: usize) -> Self {
        self.address = Some(address);
        self
    }

    pub fn method_of(mut self, container: Arc<CompoundInfo>) -> Self {
        self.container = Some(container);
        self.is_method = true;
        self
    }

    pub fn throws(mut self, channel: ErrorChannel) -> Self {
        self.throws = channel;
        self
    }

    pub fn qualified_name(&self) -> String {
        match (&self.container, self.namespace.is_empty()) {
            (Some(c), _) => format!("{}.{}", c.qualified_name(), self.name),
            (None, true) => self.name.clone(),
            (None, false) => format!("{}.{}", self.namespace, self.name),
        }
    }
}
