//! The fetch-decode-execute loop
//!
//! Each iteration bounds-checks the current frame's ip, fetches one opcode
//! byte, decodes it through the opcode table, and executes it. Kernels
//! return `Result`; an `Err` enters the try-unwind path, which either lands
//! in the innermost catch block or exits the loop as a host-level
//! `RuntimeError` carrying the full stack trace. No host panic or unwinding
//! is ever used for script control flow.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use tracing::{trace, warn};

use crate::bytecode::{Constant, Opcode};
use crate::channel::Channel;
use crate::modules::LoadError;
use crate::native::NativeFunction;
use crate::value::{ops, ErrorKind, ErrorValue, Function, RuntimeError, Value};

use super::frame::{CallFrame, IterState, TryFrame};
use super::{HookAction, Vm, VmOutcome};

/// Array property names that `Index` turns into bound methods.
const ARRAY_METHODS: [&str; 5] = ["length", "push", "pop", "shift", "unshift"];

impl Vm {
    /// Execute until the frame stack empties, an error unwinds past the
    /// outermost frame, or the debug hook pauses.
    pub fn run(&mut self) -> Result<VmOutcome, RuntimeError> {
        loop {
            let (ip, code_len) = match self.frames.last() {
                None => {
                    let result = self.stack.pop().unwrap_or(Value::Nil);
                    return Ok(VmOutcome::Done(result));
                }
                Some(f) => (f.ip, f.chunk.len()),
            };

            // Running off the end of a chunk is an implicit return.
            if ip >= code_len {
                if let Err(err) = self.do_return() {
                    self.unwind(err)?;
                }
                continue;
            }

            self.executed += 1;
            if self.executed > self.config.max_instructions {
                self.unwind(ErrorValue::new(
                    ErrorKind::ExecutionLimit,
                    format!(
                        "instruction budget of {} exhausted",
                        self.config.max_instructions
                    ),
                ))?;
                continue;
            }

            if self.hook.is_some() {
                if self.hook_resume {
                    self.hook_resume = false;
                } else {
                    let info = {
                        let f = self.frames.last().expect("frame checked above");
                        f.chunk.debug_info(f.ip).cloned()
                    };
                    let mut hook = self.hook.take().expect("hook checked above");
                    let action = hook(ip, info.as_ref());
                    self.hook = Some(hook);
                    if action == HookAction::Pause {
                        self.hook_resume = true;
                        return Ok(VmOutcome::Paused);
                    }
                }
            }

            if self.config.trace {
                let f = self.frames.last().expect("frame checked above");
                let (disasm, _) = f.chunk.disassemble_instruction(f.ip);
                trace!(target: "aegisvm::dispatch", ip, depth = self.stack.len(), "{}", disasm);
            }

            if let Err(err) = self.step() {
                self.unwind(err)?;
            }
        }
    }

    /// Decode and execute one instruction.
    fn step(&mut self) -> Result<(), ErrorValue> {
        let ip_before = self.frame().ip;
        let byte = self.read_u8()?;
        let opcode = Opcode::from_byte(byte).ok_or_else(|| {
            ErrorValue::new(ErrorKind::Custom, format!("invalid opcode 0x{:02x}", byte))
        })?;

        match opcode {
            // Stack / misc
            Opcode::Nop => Ok(()),
            Opcode::Pop => {
                self.pop()?;
                Ok(())
            }
            Opcode::Dup => {
                let v = self.peek(0)?.clone();
                self.push(v)
            }
            Opcode::Print => {
                let v = self.pop()?;
                println!("{}", v);
                Ok(())
            }

            // Constants
            Opcode::Const => self.op_constant(false),
            Opcode::ConstWide => self.op_constant(true),
            Opcode::PushNil => self.push(Value::Nil),
            Opcode::PushTrue => self.push(Value::Bool(true)),
            Opcode::PushFalse => self.push(Value::Bool(false)),
            Opcode::PushIntSmall => {
                let v = self.read_u8()? as i8;
                self.push(Value::Int(v as i64))
            }

            // Locals
            Opcode::LoadLocal | Opcode::LoadLocalFast => self.op_load_local(),
            Opcode::StoreLocal => self.op_store_local(false),
            Opcode::StoreLocalFast => self.op_store_local(true),

            // Globals
            Opcode::DefineGlobal => self.op_define_global(),
            Opcode::GetGlobal => self.op_get_global(),
            Opcode::SetGlobal => self.op_set_global(),

            // Arrays
            Opcode::BuildArray => self.op_build_array(),
            Opcode::Index => self.op_index(),
            Opcode::SetIndex => self.op_set_index(),
            Opcode::Length => self.op_length(),

            // Maps
            Opcode::BuildMap => self.op_build_map(),
            Opcode::MapGet => self.op_map_get(),
            Opcode::MapSet => self.op_map_set(),
            Opcode::MapDelete => self.op_map_delete(),
            Opcode::MapKeys => self.op_map_keys(),
            Opcode::MapValues => self.op_map_values(),

            // Strings
            Opcode::Concat => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::str(format!("{}{}", a, b)))
            }
            Opcode::StrLength => {
                let v = self.pop()?;
                match &v {
                    Value::Str(s) => self.push(Value::Int(s.chars().count() as i64)),
                    other => Err(ErrorValue::type_error("string", other.type_name())),
                }
            }

            // Iteration
            Opcode::IterStart => self.op_iter_start(),
            Opcode::IterNext => self.op_iter_next(),
            Opcode::IterEnd => self.op_iter_end(),

            // Control flow
            Opcode::Jump => {
                let off = self.read_u16()? as usize;
                self.frame_mut().ip += off;
                Ok(())
            }
            Opcode::JumpIfFalse => {
                let off = self.read_u16()? as usize;
                let cond = self.pop()?;
                if !cond.truthy() {
                    self.frame_mut().ip += off;
                }
                Ok(())
            }
            Opcode::Loop => {
                let off = self.read_u16()? as usize;
                let frame = self.frame_mut();
                frame.ip = frame.ip.checked_sub(off).ok_or_else(|| {
                    ErrorValue::new(ErrorKind::Custom, "loop target underflows the chunk")
                })?;
                Ok(())
            }

            // Calls
            Opcode::Call => {
                let argc = self.read_u8()? as usize;
                let callee = self.pop()?;
                self.call_value(callee, argc)
            }
            Opcode::Return => self.do_return(),

            // Errors
            Opcode::Try => self.op_try(ip_before),
            Opcode::TryEnd => {
                self.tries.pop().ok_or_else(|| {
                    ErrorValue::new(ErrorKind::Custom, "try_end outside a protected region")
                })?;
                Ok(())
            }
            Opcode::Throw => {
                let v = self.pop()?;
                let mut err = (*ops::into_error(v)).clone();
                if err.frames.is_empty() {
                    err.frames = self.stack_trace();
                }
                Err(err)
            }

            // Arithmetic
            Opcode::Add => self.op_binary(ops::add),
            Opcode::Sub => self.op_binary(ops::sub),
            Opcode::Mul => self.op_binary(ops::mul),
            Opcode::Div => self.op_binary(ops::div),
            Opcode::Mod => self.op_binary(ops::rem),
            Opcode::Negate => {
                let v = self.pop()?;
                let r = ops::negate(&v)?;
                self.push(r)
            }

            // Comparison
            Opcode::Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a == b))
            }
            Opcode::NotEq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a != b))
            }
            Opcode::Lt => self.op_binary(ops::lt),
            Opcode::LtEq => self.op_binary(ops::lt_eq),
            Opcode::Gt => self.op_binary(ops::gt),
            Opcode::GtEq => self.op_binary(ops::gt_eq),

            // Logic: value-selecting, not control flow
            Opcode::And => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(if a.truthy() { b } else { a })
            }
            Opcode::Or => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(if a.truthy() { a } else { b })
            }
            Opcode::Not => {
                let v = self.pop()?;
                self.push(Value::Bool(!v.truthy()))
            }

            // Types
            Opcode::TypeOf => {
                let v = self.pop()?;
                self.push(Value::str(v.type_name()))
            }
            Opcode::IsType => {
                let name = self.pop()?;
                let v = self.pop()?;
                match &name {
                    Value::Str(expected) => {
                        self.push(Value::Bool(v.type_name() == expected.as_ref()))
                    }
                    other => Err(ErrorValue::type_error("string", other.type_name())),
                }
            }

            // Modules
            Opcode::Import => self.op_import(),

            // Concurrency
            Opcode::Spawn => self.op_spawn(),
            Opcode::ChannelNew => self.op_channel_new(),
            Opcode::ChannelSend => self.op_channel_send(),
            Opcode::ChannelRecv => self.op_channel_recv(),
        }
    }

    // === Stack helpers ===

    #[inline]
    pub(crate) fn push(&mut self, value: Value) -> Result<(), ErrorValue> {
        if self.stack.len() >= self.config.max_stack {
            return Err(ErrorValue::new(
                ErrorKind::StackOverflow,
                format!("value stack limit of {} exceeded", self.config.max_stack),
            ));
        }
        self.stack.push(value);
        Ok(())
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Result<Value, ErrorValue> {
        self.stack
            .pop()
            .ok_or_else(|| ErrorValue::new(ErrorKind::Custom, "value stack underflow"))
    }

    #[inline]
    fn peek(&self, n: usize) -> Result<&Value, ErrorValue> {
        let len = self.stack.len();
        if n >= len {
            return Err(ErrorValue::new(ErrorKind::Custom, "value stack underflow"));
        }
        Ok(&self.stack[len - 1 - n])
    }

    #[inline]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("no active frame")
    }

    #[inline]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active frame")
    }

    // === Operand fetch ===

    #[inline]
    fn read_u8(&mut self) -> Result<u8, ErrorValue> {
        let frame = self.frame_mut();
        let byte = frame.chunk.read_byte(frame.ip).ok_or_else(|| {
            ErrorValue::new(ErrorKind::Custom, "instruction pointer out of bounds")
        })?;
        frame.ip += 1;
        Ok(byte)
    }

    #[inline]
    fn read_u16(&mut self) -> Result<u16, ErrorValue> {
        let frame = self.frame_mut();
        let value = frame.chunk.read_u16(frame.ip).ok_or_else(|| {
            ErrorValue::new(ErrorKind::Custom, "instruction pointer out of bounds")
        })?;
        frame.ip += 2;
        Ok(value)
    }

    fn fetch_constant(&mut self, wide: bool) -> Result<Constant, ErrorValue> {
        let index = if wide {
            self.read_u16()?
        } else {
            self.read_u8()? as u16
        };
        self.frame()
            .chunk
            .get_constant(index)
            .cloned()
            .ok_or_else(|| {
                ErrorValue::new(ErrorKind::Custom, format!("invalid constant index {}", index))
            })
    }

    /// Fetch a wide constant operand that must be a name string.
    fn fetch_name(&mut self) -> Result<Arc<str>, ErrorValue> {
        match self.fetch_constant(true)? {
            Constant::Str(s) => Ok(s),
            other => Err(ErrorValue::new(
                ErrorKind::Custom,
                format!("expected name constant, got {}", other),
            )),
        }
    }

    // === Constants ===

    fn op_constant(&mut self, wide: bool) -> Result<(), ErrorValue> {
        let constant = self.fetch_constant(wide)?;
        let value = match constant {
            Constant::Nil => Value::Nil,
            Constant::Bool(b) => Value::Bool(b),
            Constant::Int(i) => Value::Int(i),
            Constant::Float(f) => Value::Float(f),
            Constant::Str(s) => Value::Str(s),
            // Function constants bind to the defining frame's module so they
            // resolve globals against it when called later.
            Constant::Function(proto) => Value::Fn(Arc::new(Function {
                name: proto.name.clone(),
                arity: proto.arity,
                is_vararg: proto.is_vararg,
                chunk: proto.chunk.clone(),
                module: self.frame().module.clone(),
            })),
        };
        self.push(value)
    }

    // === Locals ===

    fn op_load_local(&mut self) -> Result<(), ErrorValue> {
        let slot = self.read_u8()? as usize;
        let frame = self.frame();
        let value = frame.locals.get(slot).cloned().ok_or_else(|| {
            ErrorValue::new(ErrorKind::Custom, format!("invalid local slot {}", slot))
        })?;
        self.push(value)
    }

    fn op_store_local(&mut self, pop: bool) -> Result<(), ErrorValue> {
        let slot = self.read_u8()? as usize;
        let value = if pop {
            self.pop()?
        } else {
            self.peek(0)?.clone()
        };
        let frame = self.frame_mut();
        match frame.locals.get_mut(slot) {
            Some(dest) => {
                *dest = value;
                Ok(())
            }
            None => Err(ErrorValue::new(
                ErrorKind::Custom,
                format!("invalid local slot {}", slot),
            )),
        }
    }

    // === Globals ===
    //
    // A frame created from a module function resolves globals against the
    // module's record; everything else uses the VM's own table. Defines in a
    // module-body VM also populate the record's exports.

    fn op_define_global(&mut self) -> Result<(), ErrorValue> {
        let name = self.fetch_name()?;
        let value = self.pop()?;
        match self.frame().module.clone() {
            Some(rec) => {
                rec.globals.write().define(name.clone(), value.clone());
                if self.module.as_ref().is_some_and(|m| Arc::ptr_eq(m, &rec)) {
                    rec.exports.write().insert(name.to_string(), value);
                }
            }
            None => {
                self.globals.define(name, value);
            }
        }
        Ok(())
    }

    fn op_get_global(&mut self) -> Result<(), ErrorValue> {
        let name = self.fetch_name()?;
        let value = self.lookup_global(&name).ok_or_else(|| {
            ErrorValue::new(
                ErrorKind::UndefinedGlobal,
                format!("undefined global '{}'", name),
            )
        })?;
        self.push(value)
    }

    fn op_set_global(&mut self) -> Result<(), ErrorValue> {
        let name = self.fetch_name()?;
        let value = self.pop()?;
        let assigned = match self.frame().module.clone() {
            Some(rec) => {
                let assigned = rec.globals.write().set(&name, value.clone());
                if assigned && self.module.as_ref().is_some_and(|m| Arc::ptr_eq(m, &rec)) {
                    let mut exports = rec.exports.write();
                    if exports.contains_key(name.as_ref()) {
                        exports.insert(name.to_string(), value);
                    }
                }
                assigned
            }
            None => self.globals.set(&name, value),
        };
        if assigned {
            Ok(())
        } else {
            Err(ErrorValue::new(
                ErrorKind::UndefinedGlobal,
                format!("undefined global '{}'", name),
            ))
        }
    }

    fn lookup_global(&self, name: &str) -> Option<Value> {
        match self.frame().module.as_ref() {
            Some(rec) => rec.globals.read().get(name).cloned(),
            None => self.globals.get(name).cloned(),
        }
    }

    // === Arrays ===

    fn op_build_array(&mut self) -> Result<(), ErrorValue> {
        let count = self.read_u16()? as usize;
        let len = self.stack.len();
        if count > len {
            return Err(ErrorValue::new(ErrorKind::Custom, "value stack underflow"));
        }
        let items: Vec<Value> = self.stack.drain(len - count..).collect();
        self.push(Value::array(items))
    }

    fn op_index(&mut self) -> Result<(), ErrorValue> {
        let key = self.pop()?;
        let coll = self.pop()?;
        let result = match &coll {
            Value::Array(items) => {
                if let Some(i) = index_as_i64(&key) {
                    let items = items.read();
                    if i < 0 || i as usize >= items.len() {
                        return Err(ErrorValue::new(
                            ErrorKind::IndexOutOfRange,
                            format!("array index {} out of range 0..{}", i, items.len()),
                        ));
                    }
                    items[i as usize].clone()
                } else if let Value::Str(name) = &key {
                    if ARRAY_METHODS.contains(&name.as_ref()) {
                        Value::BoundMethod(Box::new(coll.clone()), name.clone())
                    } else {
                        return Err(ErrorValue::new(
                            ErrorKind::TypeError,
                            format!("array has no property '{}'", name),
                        ));
                    }
                } else {
                    return Err(ErrorValue::type_error(
                        "number or property name",
                        key.type_name(),
                    ));
                }
            }
            Value::Map(map) => match &key {
                Value::Str(k) => map.read().get(k.as_ref()).cloned().unwrap_or(Value::Nil),
                other => return Err(ErrorValue::type_error("string key", other.type_name())),
            },
            Value::Str(s) => {
                let Some(i) = index_as_i64(&key) else {
                    return Err(ErrorValue::type_error("number", key.type_name()));
                };
                let count = s.chars().count();
                if i < 0 || i as usize >= count {
                    return Err(ErrorValue::new(
                        ErrorKind::IndexOutOfRange,
                        format!("string index {} out of range 0..{}", i, count),
                    ));
                }
                let ch = s.chars().nth(i as usize).expect("index bounds checked");
                Value::str(ch.to_string())
            }
            Value::Module(rec) => match &key {
                Value::Str(k) => rec.export(k).unwrap_or(Value::Nil),
                other => return Err(ErrorValue::type_error("string key", other.type_name())),
            },
            other => {
                return Err(ErrorValue::new(
                    ErrorKind::TypeError,
                    format!("{} is not indexable", other.type_name()),
                ))
            }
        };
        self.push(result)
    }

    fn op_set_index(&mut self) -> Result<(), ErrorValue> {
        let value = self.pop()?;
        let key = self.pop()?;
        let coll = self.pop()?;
        match &coll {
            Value::Array(items) => {
                let Some(i) = index_as_i64(&key) else {
                    return Err(ErrorValue::type_error("number", key.type_name()));
                };
                let mut items = items.write();
                if i < 0 || i as usize >= items.len() {
                    return Err(ErrorValue::new(
                        ErrorKind::IndexOutOfRange,
                        format!("array index {} out of range 0..{}", i, items.len()),
                    ));
                }
                items[i as usize] = value.clone();
            }
            Value::Map(map) => match &key {
                Value::Str(k) => {
                    map.write().insert(k.to_string(), value.clone());
                }
                other => return Err(ErrorValue::type_error("string key", other.type_name())),
            },
            other => {
                return Err(ErrorValue::new(
                    ErrorKind::TypeError,
                    format!("cannot assign into {}", other.type_name()),
                ))
            }
        }
        // Assignment is an expression; its value stays on the stack.
        self.push(value)
    }

    fn op_length(&mut self) -> Result<(), ErrorValue> {
        let v = self.pop()?;
        let len = match &v {
            Value::Array(a) => a.read().len(),
            Value::Map(m) => m.read().len(),
            Value::Str(s) => s.chars().count(),
            other => {
                return Err(ErrorValue::type_error(
                    "array, map, or string",
                    other.type_name(),
                ))
            }
        };
        self.push(Value::Int(len as i64))
    }

    // === Maps ===

    fn op_build_map(&mut self) -> Result<(), ErrorValue> {
        let count = self.read_u16()? as usize;
        let len = self.stack.len();
        if count * 2 > len {
            return Err(ErrorValue::new(ErrorKind::Custom, "value stack underflow"));
        }
        let kvs: Vec<Value> = self.stack.drain(len - count * 2..).collect();
        let mut entries = HashMap::with_capacity(count);
        for pair in kvs.chunks_exact(2) {
            match &pair[0] {
                Value::Str(k) => {
                    entries.insert(k.to_string(), pair[1].clone());
                }
                other => {
                    return Err(ErrorValue::type_error("string key", other.type_name()))
                }
            }
        }
        self.push(Value::map(entries))
    }

    fn pop_map(&mut self) -> Result<crate::value::MapRef, ErrorValue> {
        match self.pop()? {
            Value::Map(m) => Ok(m),
            other => Err(ErrorValue::type_error("map", other.type_name())),
        }
    }

    fn op_map_get(&mut self) -> Result<(), ErrorValue> {
        let key = self.pop()?;
        let map = self.pop_map()?;
        let value = match &key {
            Value::Str(k) => map.read().get(k.as_ref()).cloned().unwrap_or(Value::Nil),
            other => return Err(ErrorValue::type_error("string key", other.type_name())),
        };
        self.push(value)
    }

    fn op_map_set(&mut self) -> Result<(), ErrorValue> {
        let value = self.pop()?;
        let key = self.pop()?;
        let map = self.pop_map()?;
        match &key {
            Value::Str(k) => {
                map.write().insert(k.to_string(), value);
                Ok(())
            }
            other => Err(ErrorValue::type_error("string key", other.type_name())),
        }
    }

    fn op_map_delete(&mut self) -> Result<(), ErrorValue> {
        let key = self.pop()?;
        let map = self.pop_map()?;
        match &key {
            Value::Str(k) => {
                let removed = map.write().remove(k.as_ref()).is_some();
                self.push(Value::Bool(removed))
            }
            other => Err(ErrorValue::type_error("string key", other.type_name())),
        }
    }

    fn op_map_keys(&mut self) -> Result<(), ErrorValue> {
        let map = self.pop_map()?;
        let mut keys: Vec<String> = map.read().keys().cloned().collect();
        keys.sort();
        self.push(Value::array(keys.into_iter().map(Value::str).collect()))
    }

    fn op_map_values(&mut self) -> Result<(), ErrorValue> {
        let map = self.pop_map()?;
        let entries = map.read();
        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        let values: Vec<Value> = keys.into_iter().map(|k| entries[k].clone()).collect();
        drop(entries);
        self.push(Value::array(values))
    }

    // === Iteration ===

    fn op_iter_start(&mut self) -> Result<(), ErrorValue> {
        let coll = self.pop()?;
        let state = match coll {
            Value::Array(items) => IterState::Array { items, index: 0 },
            Value::Str(s) => IterState::Str {
                chars: s.chars().map(|c| Value::str(c.to_string())).collect(),
                index: 0,
            },
            Value::Map(map) => {
                // Key snapshot taken at this instant; sorted so replaying the
                // same program visits keys in the same order.
                let mut keys: Vec<Arc<str>> =
                    map.read().keys().map(|k| Arc::from(k.as_str())).collect();
                keys.sort();
                IterState::Map { keys, index: 0, map }
            }
            other => {
                return Err(ErrorValue::new(
                    ErrorKind::NotIterable,
                    format!("{} is not iterable", other.type_name()),
                ))
            }
        };
        self.iters.push(state);
        Ok(())
    }

    fn op_iter_next(&mut self) -> Result<(), ErrorValue> {
        let next = {
            let state = self.iters.last_mut().ok_or_else(|| {
                ErrorValue::new(ErrorKind::Custom, "iter_next without an active iterator")
            })?;
            state.next()
        };
        match next {
            Some(v) => {
                self.push(v)?;
                self.push(Value::Bool(true))
            }
            None => {
                self.push(Value::Nil)?;
                self.push(Value::Bool(false))
            }
        }
    }

    fn op_iter_end(&mut self) -> Result<(), ErrorValue> {
        self.iters.pop().ok_or_else(|| {
            ErrorValue::new(ErrorKind::Custom, "iter_end without an active iterator")
        })?;
        Ok(())
    }

    // === Calls ===

    /// Dispatch a call to whatever `callee` is. The `argc` arguments are on
    /// top of the stack (the callee itself has already been popped).
    pub(crate) fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), ErrorValue> {
        match callee {
            Value::Fn(func) => self.call_function(func, argc),
            Value::Native(native) => self.call_native(native, argc, None),
            Value::BoundMethod(receiver, name) => {
                let resolved = self.lookup_global(&name).ok_or_else(|| {
                    ErrorValue::new(
                        ErrorKind::UndefinedGlobal,
                        format!("undefined method '{}'", name),
                    )
                })?;
                match resolved {
                    Value::Native(native) => self.call_native(native, argc, Some(*receiver)),
                    other => Err(ErrorValue::new(
                        ErrorKind::NotCallable,
                        format!("method '{}' resolved to {}", name, other.type_name()),
                    )),
                }
            }
            other => Err(ErrorValue::new(
                ErrorKind::NotCallable,
                format!("{} is not callable", other.type_name()),
            )),
        }
    }

    fn call_function(&mut self, func: Arc<Function>, argc: usize) -> Result<(), ErrorValue> {
        if self.frames.len() >= self.config.max_frames {
            return Err(ErrorValue::new(
                ErrorKind::CallStackOverflow,
                format!("call depth limit of {} exceeded", self.config.max_frames),
            ));
        }

        let fixed = func.arity as usize;
        if func.is_vararg {
            if argc < fixed {
                return Err(ErrorValue::new(
                    ErrorKind::ArityMismatch,
                    format!("{} takes at least {} arguments, got {}", func.name, fixed, argc),
                ));
            }
        } else if argc != fixed {
            return Err(ErrorValue::new(
                ErrorKind::ArityMismatch,
                format!("{} takes {} arguments, got {}", func.name, fixed, argc),
            ));
        }

        if argc > self.stack.len() {
            return Err(ErrorValue::new(ErrorKind::Custom, "value stack underflow"));
        }
        let base = self.stack.len() - argc;

        let mut frame = CallFrame::new(func.chunk.clone(), base, func.module.clone());
        frame.function = func.name.clone();

        // Arguments move off the operand stack into the frame's own locals;
        // stack growth inside the callee can never touch them.
        let needed = fixed + usize::from(func.is_vararg);
        if frame.locals.len() < needed {
            frame.locals.resize(needed, Value::Nil);
        }
        for i in 0..fixed {
            frame.locals[i] = self.stack[base + i].clone();
        }
        if func.is_vararg {
            let rest: Vec<Value> = self.stack[base + fixed..].to_vec();
            frame.locals[fixed] = Value::array(rest);
        }
        self.stack.truncate(base);
        self.frames.push(frame);
        Ok(())
    }

    fn call_native(
        &mut self,
        native: Arc<NativeFunction>,
        argc: usize,
        receiver: Option<Value>,
    ) -> Result<(), ErrorValue> {
        if argc > self.stack.len() {
            return Err(ErrorValue::new(ErrorKind::Custom, "value stack underflow"));
        }
        let base = self.stack.len() - argc;
        let mut args = Vec::with_capacity(argc + 1);
        if let Some(r) = receiver {
            args.push(r);
        }
        args.extend(self.stack.drain(base..));

        if native.arity >= 0 && args.len() != native.arity as usize {
            return Err(ErrorValue::new(
                ErrorKind::ArityMismatch,
                format!(
                    "{} takes {} arguments, got {}",
                    native.name, native.arity, args.len()
                ),
            ));
        }

        let result = (native.func)(&args).map_err(ErrorValue::from)?;
        self.push(result)
    }

    /// Pop the current frame: the return value is the top of its stack
    /// window (Nil when empty), the stack rewinds to the frame's base, and
    /// the value lands on the caller's stack — or becomes the final value
    /// when this was the outermost frame.
    fn do_return(&mut self) -> Result<(), ErrorValue> {
        let frame = self.frames.pop().expect("return with no active frame");
        let ret = if self.stack.len() > frame.slot_base {
            self.stack.pop().expect("stack depth checked")
        } else {
            Value::Nil
        };
        self.stack.truncate(frame.slot_base);
        self.push(ret)
    }

    /// Entry point for spawned tasks: place `args`, dispatch `callee`, and
    /// drive the loop to completion.
    pub(crate) fn run_callable(
        &mut self,
        callee: Value,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let argc = args.len();
        for arg in args {
            self.push(arg).map_err(RuntimeError::from)?;
        }
        if let Err(err) = self.call_value(callee, argc) {
            return Err(RuntimeError::from(err));
        }
        match self.run()? {
            VmOutcome::Done(v) => Ok(v),
            VmOutcome::Paused => Ok(Value::Nil),
        }
    }

    // === Errors ===

    fn op_try(&mut self, try_offset: usize) -> Result<(), ErrorValue> {
        let off = self.read_u16()? as usize;
        self.tries.push(TryFrame {
            catch_ip: try_offset + off,
            stack_depth: self.stack.len(),
            frame_depth: self.frames.len(),
            iter_depth: self.iters.len(),
        });
        Ok(())
    }

    /// Route a raised error to the innermost try frame, or exit with a
    /// host-level error when none is open.
    fn unwind(&mut self, mut err: ErrorValue) -> Result<(), RuntimeError> {
        if err.frames.is_empty() {
            err.frames = self.stack_trace();
        }
        while let Some(tf) = self.tries.pop() {
            // A try frame whose owning call frame already returned is stale.
            if tf.frame_depth > self.frames.len() || tf.stack_depth > self.stack.len() {
                continue;
            }
            self.stack.truncate(tf.stack_depth);
            self.iters.truncate(tf.iter_depth);
            self.frames.truncate(tf.frame_depth);
            let frame = self
                .frames
                .last_mut()
                .expect("try frame recorded without an owning call frame");
            frame.ip = tf.catch_ip;
            self.stack.push(Value::error(err));
            return Ok(());
        }

        let kind = if err.kind == ErrorKind::Custom {
            ErrorKind::UncaughtError
        } else {
            err.kind
        };
        let mut host_err = RuntimeError::from(err);
        host_err.kind = kind;
        Err(host_err)
    }

    // === Modules ===

    fn op_import(&mut self) -> Result<(), ErrorValue> {
        let name = self.fetch_name()?;
        let loader = self.loader.clone().ok_or_else(|| {
            ErrorValue::new(
                ErrorKind::ModuleNotFound,
                format!("cannot import '{}': no module loader configured", name),
            )
        })?;
        let importer_dir = self.importer_dir();
        let record = loader
            .import(&name, importer_dir.as_deref())
            .map_err(load_error_value)?;
        self.push(Value::Module(record))
    }

    /// Directory of the current frame's source file, for `./`-relative
    /// imports.
    fn importer_dir(&self) -> Option<PathBuf> {
        let frame = self.frame();
        let file = frame.chunk.file();
        let parent = Path::new(file.as_ref()).parent()?;
        if parent.as_os_str().is_empty() {
            None
        } else {
            Some(parent.to_path_buf())
        }
    }

    // === Concurrency ===

    fn op_spawn(&mut self) -> Result<(), ErrorValue> {
        let argc = self.read_u8()? as usize;
        let callee = self.pop()?;
        if argc > self.stack.len() {
            return Err(ErrorValue::new(ErrorKind::Custom, "value stack underflow"));
        }
        let base = self.stack.len() - argc;
        let args: Vec<Value> = self.stack.drain(base..).collect();

        if !matches!(callee, Value::Fn(_) | Value::Native(_)) {
            return Err(ErrorValue::new(
                ErrorKind::NotCallable,
                format!("cannot spawn {}", callee.type_name()),
            ));
        }

        // The task gets its own VM: fresh stacks, a snapshot of the globals
        // (collection handles inside it still alias), and the shared
        // registry and loader.
        let globals = self.globals.clone();
        let registry = self.registry.clone();
        let loader = self.loader.clone();
        let config = self.config.clone();
        thread::Builder::new()
            .name("aegis-task".to_string())
            .spawn(move || {
                let mut vm = Vm::for_spawn(globals, registry, loader, config);
                if let Err(err) = vm.run_callable(callee, args) {
                    warn!(target: "aegisvm::spawn", error = %err, "spawned task failed");
                }
            })
            .map_err(|e| {
                ErrorValue::new(ErrorKind::Custom, format!("failed to spawn task: {}", e))
            })?;

        self.push(Value::Nil)
    }

    fn op_channel_new(&mut self) -> Result<(), ErrorValue> {
        let cap = self.pop()?;
        let Some(capacity) = index_as_i64(&cap) else {
            return Err(ErrorValue::type_error("number", cap.type_name()));
        };
        let channel = Channel::new(capacity.max(0) as usize);
        self.push(Value::Channel(Arc::new(channel)))
    }

    fn op_channel_send(&mut self) -> Result<(), ErrorValue> {
        let value = self.pop()?;
        let chan = self.pop()?;
        let Value::Channel(ch) = &chan else {
            return Err(ErrorValue::type_error("channel", chan.type_name()));
        };
        if !ch.send(value) {
            return Err(ErrorValue::new(ErrorKind::Custom, "send on closed channel"));
        }
        Ok(())
    }

    fn op_channel_recv(&mut self) -> Result<(), ErrorValue> {
        let chan = self.pop()?;
        let Value::Channel(ch) = &chan else {
            return Err(ErrorValue::type_error("channel", chan.type_name()));
        };
        let value = ch.recv();
        self.push(value)
    }

    // === Arithmetic / comparison plumbing ===

    fn op_binary(&mut self, kernel: fn(&Value, &Value) -> ops::OpResult) -> Result<(), ErrorValue> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = kernel(&a, &b)?;
        self.push(result)
    }
}

/// Numeric index coercion: ints directly, floats only when integral.
fn index_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

/// Map a loader failure onto the error value that enters the unwind path.
fn load_error_value(err: LoadError) -> ErrorValue {
    match err {
        LoadError::NotFound(_) | LoadError::Io(..) => {
            ErrorValue::new(ErrorKind::ModuleNotFound, err.to_string())
        }
        LoadError::Parse(..) => ErrorValue::new(ErrorKind::ParseError, err.to_string()),
        LoadError::Compile(..) => ErrorValue::new(ErrorKind::CompileError, err.to_string()),
        LoadError::Circular(_) => ErrorValue::new(ErrorKind::CircularImport, err.to_string()),
        LoadError::Eval(rt) => {
            let mut inner = ErrorValue::new(rt.kind, rt.message);
            inner.frames = rt.trace;
            inner
        }
    }
}
