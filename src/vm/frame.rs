//! Call frames, try frames, and iterator state
//!
//! A `CallFrame` owns its locals in a private vector rather than a window of
//! the value stack: the call dispatcher copies arguments into the frame and
//! rewinds the stack, so inner loops that grow the operand stack can never
//! leak space under live locals or corrupt their addresses.

use std::sync::Arc;

use crate::bytecode::Chunk;
use crate::modules::ModuleRecord;
use crate::value::{ArrayRef, MapRef, Value};

/// One entry on the call stack.
#[derive(Debug)]
pub struct CallFrame {
    /// Code being executed
    pub chunk: Arc<Chunk>,
    /// Instruction pointer into `chunk`; advances past each fetched byte
    pub ip: usize,
    /// This frame's window base in the shared value stack; `Return`
    /// truncates back to it and places the return value there
    pub slot_base: usize,
    /// Private local slots, addressed by `LoadLocal`/`StoreLocal`
    pub locals: Vec<Value>,
    /// Function name for stack traces
    pub function: Arc<str>,
    /// Module whose globals this frame resolves against, if any
    pub module: Option<Arc<ModuleRecord>>,
}

impl CallFrame {
    pub fn new(
        chunk: Arc<Chunk>,
        slot_base: usize,
        module: Option<Arc<ModuleRecord>>,
    ) -> Self {
        let local_count = chunk.local_count() as usize;
        let function = chunk.name().clone();
        Self {
            chunk,
            ip: 0,
            slot_base,
            locals: vec![Value::Nil; local_count],
            function,
            module,
        }
    }
}

/// Snapshot taken by `Try`, consumed by `Throw` (or popped by `TryEnd` when
/// the protected region completes normally).
#[derive(Debug, Clone, Copy)]
pub struct TryFrame {
    /// Where the catch block starts, within the frame that opened the try
    pub catch_ip: usize,
    /// Value stack depth to restore on unwind
    pub stack_depth: usize,
    /// Call frame count to restore on unwind
    pub frame_depth: usize,
    /// Iterator stack depth to restore, so a throw out of a loop body does
    /// not strand iterator state
    pub iter_depth: usize,
}

/// Live iterator state spanning `IterStart`/`IterNext`/`IterEnd`.
///
/// Arrays iterate their live storage by ascending index, so appends during
/// iteration are visible. Maps snapshot their keys at `IterStart` (sorted,
/// for deterministic replay); later inserts are not visited, and `IterNext`
/// yields the key. Strings snapshot into one-code-point string values.
#[derive(Debug)]
pub enum IterState {
    Array { items: ArrayRef, index: usize },
    Str { chars: Vec<Value>, index: usize },
    Map { keys: Vec<Arc<str>>, index: usize, map: MapRef },
}

impl IterState {
    /// Advance and return the next element, or None when exhausted.
    pub fn next(&mut self) -> Option<Value> {
        match self {
            IterState::Array { items, index } => {
                let items = items.read();
                if *index < items.len() {
                    let v = items[*index].clone();
                    *index += 1;
                    Some(v)
                } else {
                    None
                }
            }
            IterState::Str { chars, index } => {
                if *index < chars.len() {
                    let v = chars[*index].clone();
                    *index += 1;
                    Some(v)
                } else {
                    None
                }
            }
            IterState::Map { keys, index, .. } => {
                if *index < keys.len() {
                    let key = keys[*index].clone();
                    *index += 1;
                    Some(Value::Str(key))
                } else {
                    None
                }
            }
        }
    }
}
