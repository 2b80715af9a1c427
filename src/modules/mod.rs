//! Module loading subsystem
//!
//! Modules are Aegis source files whose top-level definitions become named
//! exports. The loader resolves import names to files, compiles them through
//! a host-supplied callback, executes each body once in a child VM, and
//! caches the result by canonical path for the process lifetime.
//!
//! - [`path`]: import-name to filesystem-path resolution
//! - [`record`]: the cached per-module record (exports, globals, state)
//! - [`loader`]: the shared cache with circular-import detection

pub mod loader;
pub mod path;
pub mod record;

pub use loader::{CompileFn, LoadError, LoadResult, LoaderOptions, ModuleLoader};
pub use record::ModuleRecord;
