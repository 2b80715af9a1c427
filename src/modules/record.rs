//! Loaded-module records
//!
//! A `ModuleRecord` is created when a module's import begins and lives for
//! the rest of the process. Its exports fill in as the module body executes,
//! so a mutually-referencing module observes the partially-populated
//! skeleton rather than deadlocking. Functions defined by the module keep a
//! back-reference to the record and resolve globals against its snapshot.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::value::Value;
use crate::vm::Globals;

/// A module loaded (or loading) in this process.
pub struct ModuleRecord {
    /// Import name the module was first requested under
    pub name: Arc<str>,
    /// Canonical filesystem path, the cache key
    pub path: PathBuf,
    /// Named exports, assigned as the module body executes
    pub exports: RwLock<HashMap<String, Value>>,
    /// The module's global table; module functions resolve against this
    pub globals: RwLock<Globals>,
    /// True once the module body returned successfully
    loaded: AtomicBool,
}

impl ModuleRecord {
    pub fn new(name: impl Into<Arc<str>>, path: PathBuf, globals: Globals) -> Self {
        Self {
            name: name.into(),
            path,
            exports: RwLock::new(HashMap::new()),
            globals: RwLock::new(globals),
            loaded: AtomicBool::new(false),
        }
    }

    /// Whether the module body has completed.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub(crate) fn set_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    /// Look up an export by name.
    pub fn export(&self, name: &str) -> Option<Value> {
        self.exports.read().get(name).cloned()
    }

    /// Names of all current exports, sorted.
    pub fn export_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.exports.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for ModuleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRecord")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("loaded", &self.is_loaded())
            .field("export_count", &self.exports.read().len())
            .finish()
    }
}
