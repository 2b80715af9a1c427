//! Module loader
//!
//! Resolves an import name to a file, compiles it through the host-supplied
//! compile callback, executes the body in a child VM, and caches the result
//! by canonical path for the lifetime of the process.
//!
//! The cache is shared by every VM in the process, so the protocol has to be
//! deadlock-free under concurrent imports:
//!
//! 1. Read-lock the cache; a loaded record is returned immediately.
//! 2. Take the in-flight table. A path already in flight on **this** thread
//!    is a circular import and fails. A path in flight on another thread is
//!    waited on (condvar) unless the owner chain loops back to this thread,
//!    which is a cross-task cycle and also fails.
//! 3. Otherwise mark the path in flight, insert a skeleton record into the
//!    cache, and release every lock before executing the body — nested
//!    imports re-enter this loader and must not find it held.
//! 4. On success mark the record loaded; on failure evict it. Either way,
//!    clear the in-flight entry and wake waiters.
//!
//! The early-inserted skeleton is what lets a mutually-referencing module
//! observe its partially-loaded peer instead of deadlocking, and waiting on
//! the condvar is what makes two tasks importing the same module execute its
//! body exactly once.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use super::path::resolve_module_path;
use super::record::ModuleRecord;
use crate::bytecode::Chunk;
use crate::native::NativeRegistry;
use crate::value::RuntimeError;
use crate::vm::{Globals, Vm};

/// Result type for module loading operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Compile callback supplied by the host: source text and its path in, a
/// chunk out. Parser and compiler are external collaborators.
pub type CompileFn = Arc<dyn Fn(&str, &Path) -> LoadResult<Arc<Chunk>> + Send + Sync>;

/// Errors that can occur during module loading.
#[derive(Debug)]
pub enum LoadError {
    /// No file matched the import name.
    NotFound(String),
    /// The file existed but could not be read.
    Io(PathBuf, String),
    /// The parser rejected the source.
    Parse(PathBuf, String),
    /// The compiler rejected the source.
    Compile(PathBuf, String),
    /// Import cycle re-entering an in-flight load.
    Circular(PathBuf),
    /// The module body raised an error.
    Eval(Box<RuntimeError>),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::NotFound(name) => write!(f, "module '{}' not found", name),
            LoadError::Io(path, err) => {
                write!(f, "failed to read '{}': {}", path.display(), err)
            }
            LoadError::Parse(path, err) => {
                write!(f, "failed to parse '{}': {}", path.display(), err)
            }
            LoadError::Compile(path, err) => {
                write!(f, "failed to compile '{}': {}", path.display(), err)
            }
            LoadError::Circular(path) => {
                write!(f, "circular import of '{}'", path.display())
            }
            LoadError::Eval(err) => write!(f, "module evaluation failed: {}", err),
        }
    }
}

impl std::error::Error for LoadError {}

/// Module loading options.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Directories searched, in order, for non-relative imports.
    pub search_paths: Vec<PathBuf>,
    /// Source extension appended to extensionless names.
    pub extension: String,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            search_paths: vec![PathBuf::from(".")],
            extension: "aeg".to_string(),
        }
    }
}

/// In-flight bookkeeping: which thread owns each load, and which path each
/// blocked thread is waiting on (for cross-task cycle detection).
#[derive(Default)]
struct Inflight {
    owners: HashMap<PathBuf, ThreadId>,
    waiting: HashMap<ThreadId, PathBuf>,
}

impl Inflight {
    /// Walk owner → waiting-on edges from `owner`; a path back to `me`
    /// means blocking would deadlock.
    fn would_deadlock(&self, mut owner: ThreadId, me: ThreadId) -> bool {
        for _ in 0..self.waiting.len() {
            let Some(next_path) = self.waiting.get(&owner) else {
                return false;
            };
            let Some(&next_owner) = self.owners.get(next_path) else {
                return false;
            };
            if next_owner == me {
                return true;
            }
            owner = next_owner;
        }
        false
    }
}

/// Process-wide module loader shared by all VMs.
pub struct ModuleLoader {
    cache: RwLock<HashMap<PathBuf, Arc<ModuleRecord>>>,
    inflight: Mutex<Inflight>,
    done: Condvar,
    options: LoaderOptions,
    compile: CompileFn,
    registry: Arc<NativeRegistry>,
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("cached", &self.cache.read().len())
            .field("in_flight", &self.inflight.lock().owners.len())
            .field("options", &self.options)
            .finish()
    }
}

impl ModuleLoader {
    /// Create a loader with default options.
    pub fn new(compile: CompileFn, registry: Arc<NativeRegistry>) -> Arc<Self> {
        Self::with_options(compile, registry, LoaderOptions::default())
    }

    /// Create a loader with explicit options.
    pub fn with_options(
        compile: CompileFn,
        registry: Arc<NativeRegistry>,
        options: LoaderOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache: RwLock::new(HashMap::new()),
            inflight: Mutex::new(Inflight::default()),
            done: Condvar::new(),
            options,
            compile,
            registry,
        })
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Number of cached modules.
    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    /// Look up an already-cached module by canonical path.
    pub fn get_cached(&self, path: &Path) -> Option<Arc<ModuleRecord>> {
        self.cache.read().get(path).cloned()
    }

    /// Import a module by name. `importer_dir` anchors `./`-relative names.
    pub fn import(
        self: &Arc<Self>,
        name: &str,
        importer_dir: Option<&Path>,
    ) -> LoadResult<Arc<ModuleRecord>> {
        let resolved = resolve_module_path(
            name,
            importer_dir,
            &self.options.search_paths,
            &self.options.extension,
        )
        .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        let path = resolved
            .canonicalize()
            .map_err(|e| LoadError::Io(resolved.clone(), e.to_string()))?;

        // Fast path: loaded and cached.
        if let Some(rec) = self.cache.read().get(&path) {
            if rec.is_loaded() {
                return Ok(rec.clone());
            }
        }

        let me = thread::current().id();
        {
            let mut st = self.inflight.lock();
            loop {
                if let Some(rec) = self.cache.read().get(&path) {
                    if rec.is_loaded() {
                        return Ok(rec.clone());
                    }
                }
                let Some(&owner) = st.owners.get(&path) else {
                    st.owners.insert(path.clone(), me);
                    break;
                };
                if owner == me {
                    debug!(path = %path.display(), "circular import detected");
                    return Err(LoadError::Circular(path));
                }
                if st.would_deadlock(owner, me) {
                    debug!(path = %path.display(), "cross-task import cycle detected");
                    return Err(LoadError::Circular(path));
                }
                st.waiting.insert(me, path.clone());
                self.done.wait(&mut st);
                st.waiting.remove(&me);
            }
        }

        let result = self.load_uncached(name, &path);

        let mut st = self.inflight.lock();
        st.owners.remove(&path);
        if result.is_err() {
            self.cache.write().remove(&path);
        }
        self.done.notify_all();
        drop(st);

        result
    }

    /// Read, compile, and execute a module body. The caller owns the
    /// in-flight entry for `path`; no loader lock is held while the body
    /// runs.
    fn load_uncached(
        self: &Arc<Self>,
        name: &str,
        path: &Path,
    ) -> LoadResult<Arc<ModuleRecord>> {
        debug!(module = name, path = %path.display(), "loading module");

        let source =
            fs::read_to_string(path).map_err(|e| LoadError::Io(path.to_path_buf(), e.to_string()))?;
        let chunk = (self.compile)(&source, path)?;

        let mut globals = Globals::new();
        self.registry.install_globals(&mut globals);
        let rec = Arc::new(ModuleRecord::new(name, path.to_path_buf(), globals));

        // Skeleton goes into the cache before execution so the module is
        // observable while its body runs.
        self.cache.write().insert(path.to_path_buf(), rec.clone());

        let outcome = {
            let mut vm = Vm::for_module(chunk, rec.clone(), self.registry.clone(), self.clone());
            vm.run()
        };

        match outcome {
            Ok(_) => {
                rec.set_loaded();
                debug!(module = name, exports = rec.exports.read().len(), "module loaded");
                Ok(rec)
            }
            Err(err) => {
                debug!(module = name, error = %err, "module body failed");
                Err(LoadError::Eval(Box::new(err)))
            }
        }
    }
}
