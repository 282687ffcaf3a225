//! Error taxonomy for boundary crossings
//!
//! Every marshaling, lifetime and call failure surfaces as a [`BindError`]:
//! a [`ErrorKind`] plus optional annotations naming the argument that failed
//! and whether the native side already ran when the failure was detected.

use std::fmt;
use thiserror::Error;

/// Result type used throughout the engine
pub type Result<T> = std::result::Result<T, BindError>;

/// Kind of boundary failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Wrong or incompatible value kind at a marshaling boundary
    #[error("type mismatch: expected {expected}, got {found}")]
    TypeError { expected: String, found: String },

    /// Numeric value outside the target representable range
    #[error("value {value} out of range for {target}")]
    RangeError { value: String, target: String },

    /// Required value missing
    #[error("{what} must not be nil")]
    NullError { what: String },

    /// Access to a wrapper whose native storage was already released
    #[error("{type_name} at {address:#x} was already released")]
    UseAfterFree { type_name: String, address: usize },

    /// Error reported by the native call itself
    #[error("{domain}: {message} (code {code})")]
    NativeError {
        domain: String,
        code: i32,
        message: String,
    },

    /// Descriptor kind not handled by this engine
    #[error("unsupported descriptor kind: {0}")]
    UnsupportedKind(String),

    /// Error raised by scripting code invoked through a closure
    #[error("script error: {0}")]
    Script(String),

    /// Native memory could not be obtained
    #[error("native allocation of {size} bytes failed")]
    Allocation { size: usize },

    /// Shared library or symbol resolution failure
    #[error("library error: {0}")]
    Library(String),

    /// Configuration could not be read or parsed
    #[error("configuration error: {0}")]
    Config(String),
}

/// Position of the argument a failure refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSite {
    /// 1-based position in the scripting argument list
    pub position: usize,
    pub name: Option<String>,
}

impl fmt::Display for ArgSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "argument #{} '{}'", self.position, name),
            None => write!(f, "argument #{}", self.position),
        }
    }
}

/// Boundary error with call-site annotations
#[derive(Error, Debug, Clone, PartialEq)]
pub struct BindError {
    pub kind: ErrorKind,
    pub site: Option<ArgSite>,
    pub callable: Option<String>,
    /// Set when the native call already completed before the failure
    pub after_call: bool,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(callable) = &self.callable {
            write!(f, "{}: ", callable)?;
        }
        if let Some(site) = &self.site {
            write!(f, "{}: ", site)?;
        }
        write!(f, "{}", self.kind)?;
        if self.after_call {
            write!(f, " (native call already completed)")?;
        }
        Ok(())
    }
}

impl From<ErrorKind> for BindError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl BindError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            site: None,
            callable: None,
            after_call: false,
        }
    }

    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError {
            expected: expected.into(),
            found: found.into(),
        })
    }

    pub fn range(value: impl fmt::Display, target: impl Into<String>) -> Self {
        Self::new(ErrorKind::RangeError {
            value: value.to_string(),
            target: target.into(),
        })
    }

    pub fn null(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NullError { what: what.into() })
    }

    pub fn use_after_free(type_name: impl Into<String>, address: usize) -> Self {
        Self::new(ErrorKind::UseAfterFree {
            type_name: type_name.into(),
            address,
        })
    }

    pub fn native(domain: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NativeError {
            domain: domain.into(),
            code,
            message: message.into(),
        })
    }

    pub fn unsupported(kind: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedKind(kind.into()))
    }

    pub fn script(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Script(message.into()))
    }

    pub fn allocation(size: usize) -> Self {
        Self::new(ErrorKind::Allocation { size })
    }

    pub fn library(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Library(message.into()))
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config(message.into()))
    }

    /// Annotate with the failing argument, keeping an existing annotation
    pub fn at_arg(mut self, position: usize, name: Option<&str>) -> Self {
        if self.site.is_none() {
            self.site = Some(ArgSite {
                position,
                name: name.map(str::to_string),
            });
        }
        self
    }

    pub fn in_callable(mut self, name: impl Into<String>) -> Self {
        if self.callable.is_none() {
            self.callable = Some(name.into());
        }
        self
    }

    pub fn after_call(mut self) -> Self {
        self.after_call = true;
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self.kind, ErrorKind::TypeError { .. })
    }

    pub fn is_range_error(&self) -> bool {
        matches!(self.kind, ErrorKind::RangeError { .. })
    }

    pub fn is_null_error(&self) -> bool {
        matches!(self.kind, ErrorKind::NullError { .. })
    }

    pub fn is_use_after_free(&self) -> bool {
        matches!(self.kind, ErrorKind::UseAfterFree { .. })
    }

    pub fn is_native(&self) -> bool {
        matches!(self.kind, ErrorKind::NativeError { .. })
    }
}
