//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use aegisvm::bytecode::Chunk;
use aegisvm::{RuntimeError, Value, Vm, VmConfig, VmOutcome};

/// Run a chunk on a fresh VM and return the final value.
pub fn run_chunk(chunk: Arc<Chunk>) -> Value {
    let mut vm = Vm::new(chunk);
    expect_done(vm.run())
}

/// Run a chunk expecting the loop to exit with an error.
pub fn run_chunk_err(chunk: Arc<Chunk>) -> RuntimeError {
    let mut vm = Vm::new(chunk);
    vm.run().expect_err("execution should fail")
}

/// Run a chunk under a custom config expecting an error.
pub fn run_config_err(chunk: Arc<Chunk>, config: VmConfig) -> RuntimeError {
    let mut vm = Vm::with_config(chunk, config);
    vm.run().expect_err("execution should fail")
}

/// Unwrap a completed run.
pub fn expect_done(outcome: Result<VmOutcome, RuntimeError>) -> Value {
    match outcome.expect("execution should succeed") {
        VmOutcome::Done(v) => v,
        VmOutcome::Paused => panic!("unexpected pause"),
    }
}
