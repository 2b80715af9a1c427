//! AegisVM - bytecode virtual machine for the Aegis scripting language
//!
//! Aegis is a dynamically-typed scripting language used by a
//! security-automation toolkit; this crate is its execution core: a
//! stack-based bytecode VM with per-frame locals, a globals table, try/catch
//! unwinding, an iterator state machine, channel-based task concurrency, and
//! a thread-safe module loader with circular-import detection.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │              Compiler (external collaborator)                 │
//! │                   source → Chunk                              │
//! └───────────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          Vm                                   │
//! │                                                               │
//! │  ┌─────────────┐ ┌─────────────┐ ┌───────────┐ ┌──────────┐   │
//! │  │ Value Stack │ │ Call Frames │ │ Try Stack │ │ Iterators│   │
//! │  │             │ │ (own locals)│ │           │ │          │   │
//! │  └─────────────┘ └─────────────┘ └───────────┘ └──────────┘   │
//! │                                                               │
//! │  ┌──────────┐  ┌────────────────┐  ┌───────────────────────┐  │
//! │  │ Globals  │  │ NativeRegistry │  │ ModuleLoader (shared) │  │
//! │  └──────────┘  └────────────────┘  └───────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The parser/compiler and the toolkit's domain natives (scans, probes,
//! cloud checks) live outside this crate. Hosts hand the VM a compiled
//! [`bytecode::Chunk`], register native functions, and `run`.
//!
//! # Example
//!
//! ```
//! use aegisvm::bytecode::{Chunk, Opcode};
//! use aegisvm::{Value, Vm, VmOutcome};
//!
//! // 10 + 20 * 3
//! let mut builder = Chunk::builder("main", "main.aeg");
//! builder.emit_u8(Opcode::PushIntSmall, 10);
//! builder.emit_u8(Opcode::PushIntSmall, 20);
//! builder.emit_u8(Opcode::PushIntSmall, 3);
//! builder.emit(Opcode::Mul);
//! builder.emit(Opcode::Add);
//! builder.emit(Opcode::Return);
//!
//! let mut vm = Vm::new(builder.build_arc());
//! match vm.run().unwrap() {
//!     VmOutcome::Done(v) => assert_eq!(v, Value::Int(70)),
//!     VmOutcome::Paused => unreachable!(),
//! }
//! ```

pub mod bytecode;
pub mod channel;
pub mod modules;
pub mod native;
pub mod value;
pub mod vm;

pub use bytecode::{Chunk, ChunkBuilder, Constant, Opcode};
pub use channel::Channel;
pub use modules::{CompileFn, LoadError, LoaderOptions, ModuleLoader, ModuleRecord};
pub use native::{NativeError, NativeRegistry, NativeResult};
pub use value::{ErrorKind, ErrorValue, FrameInfo, Function, RuntimeError, Value};
pub use vm::{DebugHook, Globals, HookAction, Vm, VmConfig, VmOutcome};
