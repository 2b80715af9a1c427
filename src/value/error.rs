//! Runtime error values
//!
//! An `ErrorValue` is the payload carried by a thrown exception: an error
//! kind, a message, an optional cause chain, and the call frames captured at
//! the throw site. Uncaught errors surface to the embedder as a
//! `RuntimeError` built from the same data.

use std::fmt;
use std::sync::Arc;

/// Classification of runtime failures raised by the VM core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Incompatible operand types
    TypeError,
    /// Array access outside `[0, len)`
    IndexOutOfRange,
    /// Division or modulo by zero
    DivisionByZero,
    /// Read of an unbound global name
    UndefinedGlobal,
    /// Call target is not a function, native, or bound method
    NotCallable,
    /// Fixed-arity call with the wrong argument count
    ArityMismatch,
    /// Call frame limit exceeded
    CallStackOverflow,
    /// Value stack limit exceeded
    StackOverflow,
    /// Instruction budget exhausted
    ExecutionLimit,
    /// `IterStart` on a type that cannot be iterated
    NotIterable,
    /// Same-task module import cycle
    CircularImport,
    /// Module resolution failed
    ModuleNotFound,
    /// Forwarded from the parser when loading a module
    ParseError,
    /// Forwarded from the compiler when loading a module
    CompileError,
    /// A throw with no enclosing try
    UncaughtError,
    /// Script-constructed error (`throw` of an arbitrary value)
    Custom,
}

impl ErrorKind {
    /// Stable name used in messages and traces.
    pub fn name(self) -> &'static str {
        match self {
            Self::TypeError => "TypeError",
            Self::IndexOutOfRange => "IndexOutOfRange",
            Self::DivisionByZero => "DivisionByZero",
            Self::UndefinedGlobal => "UndefinedGlobal",
            Self::NotCallable => "NotCallable",
            Self::ArityMismatch => "ArityMismatch",
            Self::CallStackOverflow => "CallStackOverflow",
            Self::StackOverflow => "StackOverflow",
            Self::ExecutionLimit => "ExecutionLimit",
            Self::NotIterable => "NotIterable",
            Self::CircularImport => "CircularImport",
            Self::ModuleNotFound => "ModuleNotFound",
            Self::ParseError => "ParseError",
            Self::CompileError => "CompileError",
            Self::UncaughtError => "UncaughtError",
            Self::Custom => "Error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One call frame in a captured stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub function: Arc<str>,
    pub file: Arc<str>,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at {} ({}:{}:{})",
            self.function, self.file, self.line, self.column
        )
    }
}

/// The payload of a thrown exception.
#[derive(Debug, Clone)]
pub struct ErrorValue {
    /// Failure classification
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Chained cause, if this error wraps another
    pub cause: Option<Arc<ErrorValue>>,
    /// Frames captured at the raise site, innermost first
    pub frames: Vec<FrameInfo>,
}

impl ErrorValue {
    /// Create an error with no cause and no captured frames.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
            frames: Vec::new(),
        }
    }

    /// Create a type error for an operation that saw the wrong operand.
    pub fn type_error(expected: &str, got: &str) -> Self {
        Self::new(
            ErrorKind::TypeError,
            format!("expected {}, got {}", expected, got),
        )
    }

    /// Attach a cause, consuming self.
    pub fn with_cause(mut self, cause: ErrorValue) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Host-facing failure returned by `Vm::run` when an error unwinds past the
/// outermost frame.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Stack frames at the moment of failure, innermost first.
    pub trace: Vec<FrameInfo>,
}

impl RuntimeError {
    /// Source location of the failing instruction, if debug info was present.
    pub fn location(&self) -> Option<&FrameInfo> {
        self.trace.first()
    }
}

impl From<ErrorValue> for RuntimeError {
    fn from(err: ErrorValue) -> Self {
        Self {
            kind: err.kind,
            message: err.message,
            trace: err.frames,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for frame in &self.trace {
            write!(f, "\n    {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
