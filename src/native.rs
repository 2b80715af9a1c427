//! Native function registry
//!
//! Native functions are host Rust routines exposed to scripts under a name:
//! the security-automation toolkit registers its scan/probe/check routines
//! here, and the VM resolves bound methods (`arr.push(...)`) against the same
//! table. Functions are registered by name; an arity of -1 marks a variadic
//! function. The registry is shared by every VM derived from one host
//! process (spawned tasks and module VMs see the same set), so it guards its
//! table with a reader/writer lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::value::error::{ErrorKind, ErrorValue};
use crate::value::Value;

/// Result type for native function calls
pub type NativeResult = Result<Value, NativeError>;

/// Type alias for the native callback signature
pub type NativeFn = Arc<dyn Fn(&[Value]) -> NativeResult + Send + Sync>;

/// Error type for native function calls
#[derive(Debug, Clone)]
pub enum NativeError {
    /// Wrong number of arguments
    ArityMismatch { expected: usize, got: usize },
    /// Type error in arguments
    TypeError { expected: &'static str, got: String },
    /// Runtime error during execution
    Runtime(String),
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArityMismatch { expected, got } => {
                write!(f, "arity mismatch: expected {}, got {}", expected, got)
            }
            Self::TypeError { expected, got } => {
                write!(f, "type error: expected {}, got {}", expected, got)
            }
            Self::Runtime(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for NativeError {}

impl From<NativeError> for ErrorValue {
    fn from(err: NativeError) -> Self {
        let kind = match &err {
            NativeError::ArityMismatch { .. } => ErrorKind::ArityMismatch,
            NativeError::TypeError { .. } => ErrorKind::TypeError,
            NativeError::Runtime(_) => ErrorKind::Custom,
        };
        ErrorValue::new(kind, err.to_string())
    }
}

/// A registered host function.
pub struct NativeFunction {
    pub name: Arc<str>,
    /// Fixed parameter count, or -1 for variadic
    pub arity: i16,
    pub func: NativeFn,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

/// Registry for native functions callable from bytecode.
///
/// Registration is last-write-wins by name, so an embedder can shadow a
/// built-in with its own implementation.
pub struct NativeRegistry {
    functions: RwLock<HashMap<Arc<str>, Arc<NativeFunction>>>,
}

impl fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let functions = self.functions.read();
        f.debug_struct("NativeRegistry")
            .field("function_count", &functions.len())
            .finish()
    }
}

impl Default for NativeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with the built-in functions pre-registered
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_builtins();
        registry
    }

    /// Register a native function
    pub fn register<F>(&self, name: &str, arity: i16, func: F) -> Arc<NativeFunction>
    where
        F: Fn(&[Value]) -> NativeResult + Send + Sync + 'static,
    {
        let native = Arc::new(NativeFunction {
            name: Arc::from(name),
            arity,
            func: Arc::new(func),
        });
        self.functions
            .write()
            .insert(native.name.clone(), native.clone());
        native
    }

    /// Look up a registered function by name
    pub fn get(&self, name: &str) -> Option<Arc<NativeFunction>> {
        self.functions.read().get(name).cloned()
    }

    /// Get the number of registered functions
    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }

    /// Define every registered function as a global in `globals`.
    pub fn install_globals(&self, globals: &mut crate::vm::Globals) {
        let functions = self.functions.read();
        for native in functions.values() {
            globals.define(native.name.clone(), Value::Native(native.clone()));
        }
    }

    /// Register the built-in function set: printing, collection methods
    /// (the `Index` bound-method targets), and small conversion helpers.
    fn register_builtins(&self) {
        self.register("print", -1, |args| {
            let line = args
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            println!("{}", line);
            Ok(Value::Nil)
        });

        self.register("str", 1, |args| Ok(Value::str(args[0].to_string())));

        self.register("type", 1, |args| Ok(Value::str(args[0].type_name())));

        self.register("len", 1, |args| match &args[0] {
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::Array(a) => Ok(Value::Int(a.read().len() as i64)),
            Value::Map(m) => Ok(Value::Int(m.read().len() as i64)),
            other => Err(NativeError::TypeError {
                expected: "string, array, or map",
                got: other.type_name().to_string(),
            }),
        });

        // `length` is the property-access spelling of `len`; arrays reach it
        // through a bound method.
        self.register("length", 1, |args| match &args[0] {
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::Array(a) => Ok(Value::Int(a.read().len() as i64)),
            Value::Map(m) => Ok(Value::Int(m.read().len() as i64)),
            other => Err(NativeError::TypeError {
                expected: "string, array, or map",
                got: other.type_name().to_string(),
            }),
        });

        self.register("push", -1, |args| {
            if args.len() < 2 {
                return Err(NativeError::ArityMismatch {
                    expected: 2,
                    got: args.len(),
                });
            }
            let Value::Array(arr) = &args[0] else {
                return Err(NativeError::TypeError {
                    expected: "array",
                    got: args[0].type_name().to_string(),
                });
            };
            let mut items = arr.write();
            items.extend(args[1..].iter().cloned());
            Ok(Value::Int(items.len() as i64))
        });

        self.register("pop", 1, |args| {
            let Value::Array(arr) = &args[0] else {
                return Err(NativeError::TypeError {
                    expected: "array",
                    got: args[0].type_name().to_string(),
                });
            };
            Ok(arr.write().pop().unwrap_or(Value::Nil))
        });

        self.register("shift", 1, |args| {
            let Value::Array(arr) = &args[0] else {
                return Err(NativeError::TypeError {
                    expected: "array",
                    got: args[0].type_name().to_string(),
                });
            };
            let mut items = arr.write();
            if items.is_empty() {
                Ok(Value::Nil)
            } else {
                Ok(items.remove(0))
            }
        });

        self.register("unshift", -1, |args| {
            if args.len() < 2 {
                return Err(NativeError::ArityMismatch {
                    expected: 2,
                    got: args.len(),
                });
            }
            let Value::Array(arr) = &args[0] else {
                return Err(NativeError::TypeError {
                    expected: "array",
                    got: args[0].type_name().to_string(),
                });
            };
            let mut items = arr.write();
            for (i, v) in args[1..].iter().enumerate() {
                items.insert(i, v.clone());
            }
            Ok(Value::Int(items.len() as i64))
        });

        self.register("keys", 1, |args| {
            let Value::Map(map) = &args[0] else {
                return Err(NativeError::TypeError {
                    expected: "map",
                    got: args[0].type_name().to_string(),
                });
            };
            let mut keys: Vec<String> = map.read().keys().cloned().collect();
            keys.sort();
            Ok(Value::array(keys.into_iter().map(Value::str).collect()))
        });

        self.register("values", 1, |args| {
            let Value::Map(map) = &args[0] else {
                return Err(NativeError::TypeError {
                    expected: "map",
                    got: args[0].type_name().to_string(),
                });
            };
            let entries = map.read();
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort();
            Ok(Value::array(
                keys.into_iter().map(|k| entries[k].clone()).collect(),
            ))
        });

        self.register("contains", 2, |args| match &args[0] {
            Value::Str(s) => match &args[1] {
                Value::Str(needle) => Ok(Value::Bool(s.contains(needle.as_ref()))),
                other => Err(NativeError::TypeError {
                    expected: "string",
                    got: other.type_name().to_string(),
                }),
            },
            Value::Array(a) => Ok(Value::Bool(a.read().iter().any(|v| v == &args[1]))),
            Value::Map(m) => match &args[1] {
                Value::Str(key) => Ok(Value::Bool(m.read().contains_key(key.as_ref()))),
                other => Err(NativeError::TypeError {
                    expected: "string",
                    got: other.type_name().to_string(),
                }),
            },
            other => Err(NativeError::TypeError {
                expected: "string, array, or map",
                got: other.type_name().to_string(),
            }),
        });

        self.register("join", 2, |args| {
            let Value::Array(arr) = &args[0] else {
                return Err(NativeError::TypeError {
                    expected: "array",
                    got: args[0].type_name().to_string(),
                });
            };
            let Value::Str(sep) = &args[1] else {
                return Err(NativeError::TypeError {
                    expected: "string",
                    got: args[1].type_name().to_string(),
                });
            };
            let joined = arr
                .read()
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(sep);
            Ok(Value::str(joined))
        });
    }
}
