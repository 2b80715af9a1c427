//! Bytecode representation
//!
//! The VM consumes pre-compiled chunks: a byte vector of instructions, a
//! constant pool, and a debug table keyed by code offset. The compiler that
//! produces them is an external collaborator; this module supplies the
//! instruction set, the chunk structure, the builder embedders and tests
//! construct chunks with, and a disassembler.
//!
//! - [`opcodes`]: the instruction set and decode table
//! - [`chunk`]: chunks, constants, debug info, builder, disassembler

pub mod chunk;
pub mod opcodes;

pub use chunk::{Chunk, ChunkBuilder, Constant, FunctionProto, JumpLabel, SourceInfo};
pub use opcodes::Opcode;
