//! The Aegis value model
//!
//! Every runtime value is a `Value` variant. Strings are immutable; arrays,
//! maps, and channels are shared by handle with interior mutability behind
//! reader/writer locks, so a value crossing a channel keeps aliasing its
//! storage. Equality, truthiness, coercion, and display rules live here (and
//! in [`ops`]) so opcode handlers never re-derive them ad hoc.

pub mod error;
pub mod ops;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::RwLock;

use crate::bytecode::Chunk;
use crate::channel::Channel;
use crate::modules::ModuleRecord;
use crate::native::NativeFunction;

pub use error::{ErrorKind, ErrorValue, FrameInfo, RuntimeError};

/// Shared handle to a growable array.
pub type ArrayRef = Arc<RwLock<Vec<Value>>>;
/// Shared handle to a string-keyed map.
pub type MapRef = Arc<RwLock<HashMap<String, Value>>>;

/// A script function: a named chunk plus calling metadata and an optional
/// back-reference to the module that defined it. Functions from a module see
/// that module's globals when they run, not the caller's.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: Arc<str>,
    pub arity: u8,
    pub is_vararg: bool,
    pub chunk: Arc<Chunk>,
    pub module: Option<Arc<ModuleRecord>>,
}

/// A dynamically-typed Aegis runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Immutable UTF-8 string
    Str(Arc<str>),
    /// Growable sequence, shared by handle
    Array(ArrayRef),
    /// String-keyed collection, shared by handle
    Map(MapRef),
    /// Script function
    Fn(Arc<Function>),
    /// Host function
    Native(Arc<NativeFunction>),
    /// Receiver paired with a method name; calling prepends the receiver
    BoundMethod(Box<Value>, Arc<str>),
    /// A loaded module's exports
    Module(Arc<ModuleRecord>),
    /// Buffered cross-task value queue
    Channel(Arc<Channel>),
    /// Thrown-exception payload
    Error(Arc<ErrorValue>),
}

impl Value {
    /// Build a string value.
    pub fn str(s: impl Into<Arc<str>>) -> Self {
        Value::Str(s.into())
    }

    /// Build an array value from elements.
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    /// Build a map value from entries.
    pub fn map(entries: HashMap<String, Value>) -> Self {
        Value::Map(Arc::new(RwLock::new(entries)))
    }

    /// Build an error value.
    pub fn error(err: ErrorValue) -> Self {
        Value::Error(Arc::new(err))
    }

    /// The language-level type name, as reported by `TypeOf`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Fn(_) => "function",
            Value::Native(_) => "function",
            Value::BoundMethod(..) => "function",
            Value::Module(_) => "module",
            Value::Channel(_) => "channel",
            Value::Error(_) => "error",
        }
    }

    /// Truthiness: nil, false, zero of either numeric flavor, and empty
    /// strings/arrays/maps are falsy; everything else is truthy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Array(a) => !a.read().is_empty(),
            Value::Map(m) => !m.read().is_empty(),
            _ => true,
        }
    }
}

/// Structural equality with cross-numeric comparison: `Int(a) == Float(b)`
/// when `b` is finite and `a as f64 == b`. Arrays and maps compare by
/// contents, functions and channels by identity. Never fails.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                b.is_finite() && *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
            }
            (Value::Map(a), Value::Map(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v == w))
            }
            (Value::Fn(a), Value::Fn(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Arc::ptr_eq(a, b),
            (Value::BoundMethod(ra, na), Value::BoundMethod(rb, nb)) => {
                na == nb && ra == rb
            }
            (Value::Module(a), Value::Module(b)) => Arc::ptr_eq(a, b),
            (Value::Channel(a), Value::Channel(b)) => Arc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => {
                a.kind == b.kind && a.message == b.message
            }
            _ => false,
        }
    }
}

/// Compact float formatting: integral finite values print without a decimal
/// point, so `Float(70.0)` and `Int(70)` stringify identically.
pub(crate) fn format_float(x: f64) -> String {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{}", x)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", format_float(*x)),
            Value::Str(s) => write!(f, "{}", s),
            Value::Array(a) => {
                let items = a.read();
                write!(f, "[{}]", items.iter().map(|v| v.to_string()).join(", "))
            }
            Value::Map(m) => {
                // Keys are sorted so the rendering is deterministic across runs.
                let entries = m.read();
                let body = entries
                    .iter()
                    .sorted_by(|(a, _), (b, _)| a.cmp(b))
                    .map(|(k, v)| format!("{}: {}", k, v))
                    .join(", ");
                write!(f, "{{{}}}", body)
            }
            Value::Fn(func) => write!(f, "<fn {}>", func.name),
            Value::Native(n) => write!(f, "<native {}>", n.name),
            Value::BoundMethod(_, name) => write!(f, "<bound method {}>", name),
            Value::Module(m) => write!(f, "<module {}>", m.name),
            Value::Channel(_) => write!(f, "<channel>"),
            Value::Error(e) => write!(f, "{}", e.message),
        }
    }
}
