//! Compiled chunk representation
//!
//! A `Chunk` contains the opcode bytes for one compiled unit along with its
//! constant pool and a debug table mapping code offsets to source locations.
//! Chunks are immutable after construction and shared across threads behind
//! `Arc`. The compiler that produces them is an external collaborator; the
//! `ChunkBuilder` here is the construction surface it (and the test suite)
//! drives.

use std::fmt;
use std::sync::Arc;

use super::opcodes::Opcode;

/// A constant pool entry. Function constants carry a pre-compiled nested
/// chunk; the VM binds them to the defining module when they are pushed.
#[derive(Debug, Clone)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Function(Arc<FunctionProto>),
}

/// A compiled function before it becomes a runtime value: everything except
/// the owning-module back-reference, which is only known at push time.
#[derive(Debug)]
pub struct FunctionProto {
    pub name: Arc<str>,
    pub arity: u8,
    pub is_vararg: bool,
    pub chunk: Arc<Chunk>,
}

impl PartialEq for Constant {
    fn eq(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::Nil, Constant::Nil) => true,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            (Constant::Int(a), Constant::Int(b)) => a == b,
            (Constant::Float(a), Constant::Float(b)) => a == b,
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::Function(a), Constant::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Nil => write!(f, "nil"),
            Constant::Bool(b) => write!(f, "{}", b),
            Constant::Int(i) => write!(f, "{}", i),
            Constant::Float(x) => write!(f, "{}", x),
            Constant::Str(s) => write!(f, "{:?}", s),
            Constant::Function(p) => write!(f, "<fn {}>", p.name),
        }
    }
}

/// Source location attached to a range of code offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub file: Arc<str>,
    pub line: u32,
    pub column: u32,
    pub function: Arc<str>,
}

/// A compiled bytecode chunk: code, constants, and debug info.
#[derive(Debug)]
pub struct Chunk {
    /// The bytecode instructions
    code: Vec<u8>,

    /// Constant pool for values that can't be encoded inline
    constants: Vec<Constant>,

    /// (byte_offset, location) pairs sorted by offset; offsets need not be
    /// dense, lookups binary-search for the entry at or before an offset
    debug: Vec<(usize, SourceInfo)>,

    /// Name of this chunk (function name, or the file for a script body)
    name: Arc<str>,

    /// Source file this chunk was compiled from
    file: Arc<str>,

    /// Number of local slots the frame must reserve
    local_count: u16,
}

impl Chunk {
    /// Create a builder for constructing a chunk.
    pub fn builder(name: impl Into<Arc<str>>, file: impl Into<Arc<str>>) -> ChunkBuilder {
        ChunkBuilder::new(name, file)
    }

    /// Get the bytecode instructions
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Get the length of the bytecode
    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the chunk is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get a byte at the given offset
    #[inline]
    pub fn read_byte(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    /// Get an opcode at the given offset
    #[inline]
    pub fn read_opcode(&self, offset: usize) -> Option<Opcode> {
        self.code.get(offset).and_then(|&b| Opcode::from_byte(b))
    }

    /// Read a u16 from the bytecode (big-endian)
    #[inline]
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        if offset + 1 < self.code.len() {
            Some(u16::from_be_bytes([self.code[offset], self.code[offset + 1]]))
        } else {
            None
        }
    }

    /// Get a constant from the pool
    #[inline]
    pub fn get_constant(&self, index: u16) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    /// Get all constants
    #[inline]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    /// Get the chunk name
    #[inline]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Get the source file
    #[inline]
    pub fn file(&self) -> &Arc<str> {
        &self.file
    }

    /// Get the number of local slots
    #[inline]
    pub fn local_count(&self) -> u16 {
        self.local_count
    }

    /// Get the source location for a bytecode offset
    pub fn debug_info(&self, offset: usize) -> Option<&SourceInfo> {
        match self.debug.binary_search_by_key(&offset, |&(o, _)| o) {
            Ok(idx) => Some(&self.debug[idx].1),
            Err(idx) if idx > 0 => Some(&self.debug[idx - 1].1),
            _ => None,
        }
    }

    /// Disassemble the chunk to a string
    pub fn disassemble(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("=== {} ({}) ===\n", self.name, self.file));
        output.push_str(&format!(
            "locals: {}, constants: {}\n",
            self.local_count,
            self.constants.len()
        ));

        let mut offset = 0;
        while offset < self.code.len() {
            let line = self
                .debug_info(offset)
                .map_or(String::new(), |i| format!("{:4} ", i.line));
            let (disasm, next_offset) = self.disassemble_instruction(offset);
            output.push_str(&format!("{:04x} {} {}\n", offset, line, disasm));
            offset = next_offset;
        }

        output
    }

    /// Disassemble a single instruction, returns (string, next_offset)
    pub fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let Some(opcode) = self.read_opcode(offset) else {
            return (
                format!("??? (0x{:02x})", self.code.get(offset).unwrap_or(&0)),
                offset + 1,
            );
        };

        let mnemonic = opcode.mnemonic();
        let imm_size = opcode.immediate_size();
        let next_offset = offset + 1 + imm_size;

        let operand_str = match imm_size {
            0 => String::new(),
            1 => {
                let byte = self.code.get(offset + 1).copied().unwrap_or(0);
                match opcode {
                    Opcode::PushIntSmall => format!(" {}", byte as i8),
                    Opcode::Const => {
                        let const_str = self
                            .constants
                            .get(byte as usize)
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "???".to_string());
                        format!(" #{} ({})", byte, const_str)
                    }
                    _ => format!(" {}", byte),
                }
            }
            2 => {
                let value = self.read_u16(offset + 1).unwrap_or(0);
                match opcode {
                    Opcode::Jump | Opcode::JumpIfFalse => {
                        format!(" -> {:04x}", next_offset + value as usize)
                    }
                    Opcode::Loop => {
                        format!(" -> {:04x}", next_offset.wrapping_sub(value as usize))
                    }
                    Opcode::Try => format!(" -> {:04x}", offset + value as usize),
                    Opcode::ConstWide
                    | Opcode::DefineGlobal
                    | Opcode::GetGlobal
                    | Opcode::SetGlobal
                    | Opcode::Import => {
                        let const_str = self
                            .constants
                            .get(value as usize)
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "???".to_string());
                        format!(" #{} ({})", value, const_str)
                    }
                    _ => format!(" {}", value),
                }
            }
            _ => String::new(),
        };

        (format!("{}{}", mnemonic, operand_str), next_offset)
    }
}

/// Builder for constructing chunks
#[derive(Debug)]
pub struct ChunkBuilder {
    code: Vec<u8>,
    constants: Vec<Constant>,
    debug: Vec<(usize, SourceInfo)>,
    name: Arc<str>,
    file: Arc<str>,
    local_count: u16,
    current_line: u32,
    current_column: u32,
}

impl ChunkBuilder {
    /// Create a new chunk builder
    pub fn new(name: impl Into<Arc<str>>, file: impl Into<Arc<str>>) -> Self {
        Self {
            code: Vec::with_capacity(256),
            constants: Vec::new(),
            debug: Vec::new(),
            name: name.into(),
            file: file.into(),
            local_count: 0,
            current_line: 1,
            current_column: 1,
        }
    }

    /// Set the source location for subsequent instructions
    pub fn set_location(&mut self, line: u32, column: u32) {
        self.current_line = line;
        self.current_column = column;
    }

    /// Set the number of local slots
    pub fn set_local_count(&mut self, count: u16) {
        self.local_count = count;
    }

    /// Get the current bytecode offset
    #[inline]
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a single opcode
    pub fn emit(&mut self, opcode: Opcode) {
        self.record_debug();
        self.code.push(opcode.to_byte());
    }

    /// Emit an opcode with a 1-byte operand
    pub fn emit_u8(&mut self, opcode: Opcode, operand: u8) {
        self.record_debug();
        self.code.push(opcode.to_byte());
        self.code.push(operand);
    }

    /// Emit an opcode with a 2-byte operand (big-endian)
    pub fn emit_u16(&mut self, opcode: Opcode, operand: u16) {
        self.record_debug();
        self.code.push(opcode.to_byte());
        self.code.extend_from_slice(&operand.to_be_bytes());
    }

    /// Add a constant to the pool, returns its index
    pub fn add_constant(&mut self, value: Constant) -> u16 {
        if let Some(i) = self.constants.iter().position(|c| c == &value) {
            return i as u16;
        }
        let index = self.constants.len();
        assert!(index <= u16::MAX as usize, "too many constants in chunk");
        self.constants.push(value);
        index as u16
    }

    /// Emit a constant load, choosing the narrow encoding when it fits
    pub fn emit_constant(&mut self, value: Constant) {
        let index = self.add_constant(value);
        if index <= u8::MAX as u16 {
            self.emit_u8(Opcode::Const, index as u8);
        } else {
            self.emit_u16(Opcode::ConstWide, index);
        }
    }

    /// Create a forward jump, returns a label to patch later
    pub fn emit_jump(&mut self, opcode: Opcode) -> JumpLabel {
        debug_assert!(opcode.is_jump());
        self.record_debug();
        let opcode_offset = self.code.len();
        self.code.push(opcode.to_byte());
        // Placeholder for jump offset
        self.code.extend_from_slice(&[0xFF, 0xFF]);
        JumpLabel { opcode_offset }
    }

    /// Patch a jump label to target the current position. `Try` offsets are
    /// relative to the opcode itself; `Jump`/`JumpIfFalse` to the byte after
    /// the operand.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.code.len();
        let opcode = Opcode::from_byte(self.code[label.opcode_offset])
            .expect("patching a non-opcode offset");
        let base = if opcode == Opcode::Try {
            label.opcode_offset
        } else {
            label.opcode_offset + 3
        };
        let offset = target
            .checked_sub(base)
            .expect("jump target precedes its base") as u16;
        let bytes = offset.to_be_bytes();
        self.code[label.opcode_offset + 1] = bytes[0];
        self.code[label.opcode_offset + 2] = bytes[1];
    }

    /// Emit a backward jump to a known target
    pub fn emit_loop(&mut self, target: usize) {
        self.record_debug();
        let offset = (self.code.len() + 3 - target) as u16;
        self.code.push(Opcode::Loop.to_byte());
        self.code.extend_from_slice(&offset.to_be_bytes());
    }

    /// Record a debug entry when the location changed
    fn record_debug(&mut self) {
        let changed = match self.debug.last() {
            Some((_, info)) => {
                info.line != self.current_line || info.column != self.current_column
            }
            None => true,
        };
        if changed {
            self.debug.push((
                self.code.len(),
                SourceInfo {
                    file: self.file.clone(),
                    line: self.current_line,
                    column: self.current_column,
                    function: self.name.clone(),
                },
            ));
        }
    }

    /// Build the final chunk
    pub fn build(self) -> Chunk {
        Chunk {
            code: self.code,
            constants: self.constants,
            debug: self.debug,
            name: self.name,
            file: self.file,
            local_count: self.local_count,
        }
    }

    /// Build and wrap in Arc
    pub fn build_arc(self) -> Arc<Chunk> {
        Arc::new(self.build())
    }
}

/// Label for a forward jump to be patched later
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel {
    opcode_offset: usize,
}
