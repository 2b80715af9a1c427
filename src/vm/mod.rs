//! The Aegis virtual machine
//!
//! A `Vm` executes one compiled chunk at a time using a stack-based
//! architecture: a value stack for operands, a call-frame stack with
//! per-frame locals, a try-frame stack for exception unwinding, and an
//! iterator stack for loop state. One VM serves one task; `Spawn` starts a
//! fresh VM on its own thread sharing only the native registry, the module
//! loader, and a snapshot of the globals.
//!
//! - [`frame`]: call frames, try frames, iterator state
//! - [`globals`]: the name-indexed global table
//! - [`dispatch`]: the fetch-decode-execute loop

pub mod dispatch;
pub mod frame;
pub mod globals;

use std::sync::Arc;

use smallvec::SmallVec;

use crate::bytecode::{Chunk, SourceInfo};
use crate::modules::{ModuleLoader, ModuleRecord};
use crate::native::{NativeRegistry, NativeResult};
use crate::value::{FrameInfo, Value};

pub use frame::{CallFrame, IterState, TryFrame};
pub use globals::Globals;

/// Result of a `Vm::run` that did not fail.
#[derive(Debug)]
pub enum VmOutcome {
    /// The frame stack emptied; this is the final value (or Nil).
    Done(Value),
    /// The debug hook asked to pause; `run` again to continue.
    Paused,
}

/// What a debug hook wants the VM to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    Continue,
    Pause,
}

/// Callback invoked before each instruction with the current ip and its
/// debug info.
pub type DebugHook = Box<dyn FnMut(usize, Option<&SourceInfo>) -> HookAction + Send>;

/// Configuration for the VM
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Maximum value stack depth
    pub max_stack: usize,
    /// Maximum call frame count
    pub max_frames: usize,
    /// Instruction budget per invocation
    pub max_instructions: u64,
    /// Emit a disassembled trace event per instruction
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_stack: 65_536,
            max_frames: 1_024,
            max_instructions: 100_000_000,
            trace: false,
        }
    }
}

/// The Aegis bytecode virtual machine.
pub struct Vm {
    /// Operand stack
    pub(crate) stack: Vec<Value>,
    /// Call frames, innermost last
    pub(crate) frames: Vec<CallFrame>,
    /// Open protected regions, innermost last
    pub(crate) tries: SmallVec<[TryFrame; 8]>,
    /// Live iterator states, innermost last
    pub(crate) iters: SmallVec<[IterState; 4]>,
    /// This VM's global table (unused by module-body VMs, which resolve
    /// through their record)
    pub(crate) globals: Globals,
    /// Shared native function registry
    pub(crate) registry: Arc<NativeRegistry>,
    /// Shared module loader, when imports are wired up
    pub(crate) loader: Option<Arc<ModuleLoader>>,
    /// Set when this VM is executing a module body; top-level defines also
    /// populate the record's exports
    pub(crate) module: Option<Arc<ModuleRecord>>,
    pub(crate) config: VmConfig,
    /// Instructions executed since construction or reset
    pub(crate) executed: u64,
    pub(crate) hook: Option<DebugHook>,
    /// Skip the hook once after a pause so resuming makes progress
    pub(crate) hook_resume: bool,
}

impl Vm {
    /// Create a VM over a chunk with default configuration and the built-in
    /// native set.
    pub fn new(chunk: Arc<Chunk>) -> Self {
        Self::with_config(chunk, VmConfig::default())
    }

    /// Create a VM with custom configuration.
    pub fn with_config(chunk: Arc<Chunk>, config: VmConfig) -> Self {
        let registry = Arc::new(NativeRegistry::with_builtins());
        let mut globals = Globals::new();
        registry.install_globals(&mut globals);
        let mut vm = Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            tries: SmallVec::new(),
            iters: SmallVec::new(),
            globals,
            registry,
            loader: None,
            module: None,
            config,
            executed: 0,
            hook: None,
            hook_resume: false,
        };
        vm.frames.push(CallFrame::new(chunk, 0, None));
        vm
    }

    /// Create the child VM that executes a module body. Global accesses in
    /// the root frame resolve against the record, and top-level defines
    /// become exports.
    pub(crate) fn for_module(
        chunk: Arc<Chunk>,
        record: Arc<ModuleRecord>,
        registry: Arc<NativeRegistry>,
        loader: Arc<ModuleLoader>,
    ) -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(8),
            tries: SmallVec::new(),
            iters: SmallVec::new(),
            globals: Globals::new(),
            registry,
            loader: Some(loader),
            module: Some(record.clone()),
            config: VmConfig::default(),
            executed: 0,
            hook: None,
            hook_resume: false,
        };
        vm.frames.push(CallFrame::new(chunk, 0, Some(record)));
        vm
    }

    /// Create the VM backing a spawned task: no frames yet, a globals
    /// snapshot, and the shared registry/loader.
    pub(crate) fn for_spawn(
        globals: Globals,
        registry: Arc<NativeRegistry>,
        loader: Option<Arc<ModuleLoader>>,
        config: VmConfig,
    ) -> Self {
        Self {
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(8),
            tries: SmallVec::new(),
            iters: SmallVec::new(),
            globals,
            registry,
            loader,
            module: None,
            config,
            executed: 0,
            hook: None,
            hook_resume: false,
        }
    }

    /// Register a native function and define it as a global. Arity -1 means
    /// variadic.
    pub fn register_native<F>(&mut self, name: &str, arity: i16, func: F)
    where
        F: Fn(&[Value]) -> NativeResult + Send + Sync + 'static,
    {
        let native = self.registry.register(name, arity, func);
        self.globals.define(native.name.clone(), Value::Native(native));
    }

    /// Wire up module imports.
    pub fn set_loader(&mut self, loader: Arc<ModuleLoader>) {
        self.loader = Some(loader);
    }

    /// Install a debug hook, called before each instruction.
    pub fn set_debug_hook(&mut self, hook: DebugHook) {
        self.hook = Some(hook);
    }

    /// Remove the debug hook.
    pub fn clear_debug_hook(&mut self) {
        self.hook = None;
    }

    /// Replace the chunk and clear execution state. Registered natives and
    /// the globals table survive.
    pub fn reset(&mut self, chunk: Arc<Chunk>) {
        self.stack.clear();
        self.frames.clear();
        self.tries.clear();
        self.iters.clear();
        self.executed = 0;
        self.hook_resume = false;
        self.frames.push(CallFrame::new(chunk, 0, self.module.clone()));
    }

    /// Read a global by name.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    /// Instructions executed since construction or the last reset.
    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    /// Current value stack depth.
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Current call frame count.
    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Snapshot of the live call stack, innermost frame first.
    pub fn stack_trace(&self) -> Vec<FrameInfo> {
        self.frames.iter().rev().map(Self::frame_info).collect()
    }

    pub(crate) fn frame_info(frame: &CallFrame) -> FrameInfo {
        // ip has advanced past the fetched byte; back up one so the lookup
        // lands inside the failing instruction.
        let offset = frame.ip.saturating_sub(1);
        match frame.chunk.debug_info(offset) {
            Some(info) => FrameInfo {
                function: frame.function.clone(),
                file: info.file.clone(),
                line: info.line,
                column: info.column,
            },
            None => FrameInfo {
                function: frame.function.clone(),
                file: frame.chunk.file().clone(),
                line: 0,
                column: 0,
            },
        }
    }
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("stack_depth", &self.stack.len())
            .field("frame_depth", &self.frames.len())
            .field("tries", &self.tries.len())
            .field("iters", &self.iters.len())
            .field("globals", &self.globals.len())
            .field("executed", &self.executed)
            .finish()
    }
}
