//! End-to-end execution scenarios driven through the public API.
//!
//! Chunks are built with `ChunkBuilder` the way the external compiler would
//! emit them; each test asserts the observable contract (final value, error
//! kind, stack discipline), not internal state.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aegisvm::bytecode::{Chunk, Constant, FunctionProto, Opcode};
use aegisvm::{ErrorKind, HookAction, Value, Vm, VmConfig};

use common::{expect_done, run_chunk, run_chunk_err, run_config_err};

fn function_constant(name: &str, arity: u8, body: Arc<Chunk>) -> Constant {
    Constant::Function(Arc::new(FunctionProto {
        name: name.into(),
        arity,
        is_vararg: false,
        chunk: body,
    }))
}

// ============================================================
// Scenario 1: arithmetic
// ============================================================

#[test]
fn test_arithmetic_precedence() {
    // 10 + 20 * 3
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 10);
    b.emit_u8(Opcode::PushIntSmall, 20);
    b.emit_u8(Opcode::PushIntSmall, 3);
    b.emit(Opcode::Mul);
    b.emit(Opcode::Add);
    b.emit(Opcode::Return);

    let mut vm = Vm::new(b.build_arc());
    let value = expect_done(vm.run());
    assert_eq!(value, Value::Int(70));
    assert_eq!(vm.stack_depth(), 0);
    assert_eq!(vm.frame_depth(), 0);
}

// ============================================================
// Scenario 2: loop summation over an array
// ============================================================

fn summation_chunk() -> Arc<Chunk> {
    let mut b = Chunk::builder("main", "main.aeg");
    b.set_local_count(1);
    // sum = 0
    b.emit_u8(Opcode::PushIntSmall, 0);
    b.emit_u8(Opcode::StoreLocalFast, 0);
    // for v in [1, 2, 3] { sum = sum + v }
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_u8(Opcode::PushIntSmall, 2);
    b.emit_u8(Opcode::PushIntSmall, 3);
    b.emit_u16(Opcode::BuildArray, 3);
    b.emit(Opcode::IterStart);
    let top = b.current_offset();
    b.emit(Opcode::IterNext);
    let exit = b.emit_jump(Opcode::JumpIfFalse);
    b.emit_u8(Opcode::LoadLocal, 0);
    b.emit(Opcode::Add);
    b.emit_u8(Opcode::StoreLocalFast, 0);
    b.emit_loop(top);
    b.patch_jump(exit);
    b.emit(Opcode::Pop); // the Nil placeholder
    b.emit(Opcode::IterEnd);
    b.emit_u8(Opcode::LoadLocal, 0);
    b.emit(Opcode::Return);
    b.build_arc()
}

#[test]
fn test_loop_summation() {
    assert_eq!(run_chunk(summation_chunk()), Value::Int(6));
}

#[test]
fn test_loop_summation_iter_next_count() {
    // IterNext fires once per element plus once for the exhausted check.
    let chunk = summation_chunk();
    let hook_chunk = chunk.clone();
    let count = Arc::new(AtomicUsize::new(0));
    let hook_count = count.clone();

    let mut vm = Vm::new(chunk);
    vm.set_debug_hook(Box::new(move |ip, _info| {
        if hook_chunk.read_opcode(ip) == Some(Opcode::IterNext) {
            hook_count.fetch_add(1, Ordering::Relaxed);
        }
        HookAction::Continue
    }));
    assert_eq!(expect_done(vm.run()), Value::Int(6));
    assert_eq!(count.load(Ordering::Relaxed), 4);
}

// ============================================================
// Scenario 3: try/catch over division by zero
// ============================================================

#[test]
fn test_try_catch_division() {
    let mut b = Chunk::builder("main", "main.aeg");
    let try_label = b.emit_jump(Opcode::Try);
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_u8(Opcode::PushIntSmall, 0);
    b.emit(Opcode::Div);
    b.emit(Opcode::TryEnd);
    let end = b.emit_jump(Opcode::Jump);
    b.patch_jump(try_label);
    // catch: the error is on the stack; discard and yield 20
    b.emit(Opcode::Pop);
    b.emit_u8(Opcode::PushIntSmall, 20);
    b.patch_jump(end);
    b.emit(Opcode::Return);

    assert_eq!(run_chunk(b.build_arc()), Value::Int(20));
}

#[test]
fn test_try_catch_binds_error_value() {
    let mut b = Chunk::builder("main", "main.aeg");
    let try_label = b.emit_jump(Opcode::Try);
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_u8(Opcode::PushIntSmall, 0);
    b.emit(Opcode::Div);
    b.emit(Opcode::TryEnd);
    let end = b.emit_jump(Opcode::Jump);
    b.patch_jump(try_label);
    b.emit(Opcode::TypeOf);
    b.patch_jump(end);
    b.emit(Opcode::Return);

    assert_eq!(run_chunk(b.build_arc()), Value::str("error"));
}

#[test]
fn test_try_catch_unwinds_callee_frames() {
    // The throw happens two frames down; the catch restores the frame depth
    // recorded at the Try.
    let mut fb = Chunk::builder("blow", "main.aeg");
    fb.emit_u8(Opcode::PushIntSmall, 1);
    fb.emit_u8(Opcode::PushIntSmall, 0);
    fb.emit(Opcode::Div);
    fb.emit(Opcode::Return);
    let blow = fb.build_arc();

    let mut b = Chunk::builder("main", "main.aeg");
    let f = function_constant("blow", 0, blow);
    let try_label = b.emit_jump(Opcode::Try);
    b.emit_constant(f);
    b.emit_u8(Opcode::Call, 0);
    b.emit(Opcode::TryEnd);
    let end = b.emit_jump(Opcode::Jump);
    b.patch_jump(try_label);
    b.emit(Opcode::Pop);
    b.emit_u8(Opcode::PushIntSmall, 20);
    b.patch_jump(end);
    b.emit(Opcode::Return);

    let mut vm = Vm::new(b.build_arc());
    assert_eq!(expect_done(vm.run()), Value::Int(20));
    assert_eq!(vm.frame_depth(), 0);
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn test_throw_in_loop_restores_iterator_stack() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.set_local_count(1);
    let try_label = b.emit_jump(Opcode::Try);
    // iterate and throw from inside the loop body
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_u16(Opcode::BuildArray, 1);
    b.emit(Opcode::IterStart);
    let top = b.current_offset();
    b.emit(Opcode::IterNext);
    let exit = b.emit_jump(Opcode::JumpIfFalse);
    b.emit(Opcode::Pop);
    b.emit_constant(Constant::Str("boom".into()));
    b.emit(Opcode::Throw);
    b.emit_loop(top);
    b.patch_jump(exit);
    b.emit(Opcode::Pop);
    b.emit(Opcode::IterEnd);
    b.emit(Opcode::TryEnd);
    let end = b.emit_jump(Opcode::Jump);
    b.patch_jump(try_label);
    b.emit(Opcode::Pop);
    b.emit_u8(Opcode::PushIntSmall, 5);
    b.patch_jump(end);
    // a second, clean iteration must work after the unwind
    b.emit_u8(Opcode::PushIntSmall, 10);
    b.emit_u16(Opcode::BuildArray, 1);
    b.emit(Opcode::IterStart);
    let top2 = b.current_offset();
    b.emit(Opcode::IterNext);
    let exit2 = b.emit_jump(Opcode::JumpIfFalse);
    b.emit(Opcode::Add);
    b.emit_loop(top2);
    b.patch_jump(exit2);
    b.emit(Opcode::Pop);
    b.emit(Opcode::IterEnd);
    b.emit(Opcode::Return);

    assert_eq!(run_chunk(b.build_arc()), Value::Int(15));
}

// ============================================================
// Scenario 4: map iteration
// ============================================================

#[test]
fn test_map_iteration_sums_values() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.set_local_count(3);
    // sum = 0
    b.emit_u8(Opcode::PushIntSmall, 0);
    b.emit_u8(Opcode::StoreLocalFast, 0);
    // m = {"a": 1, "b": 2}
    b.emit_constant(Constant::Str("a".into()));
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_constant(Constant::Str("b".into()));
    b.emit_u8(Opcode::PushIntSmall, 2);
    b.emit_u16(Opcode::BuildMap, 2);
    b.emit_u8(Opcode::StoreLocalFast, 1);
    // for k in m { sum = sum + m[k] }
    b.emit_u8(Opcode::LoadLocal, 1);
    b.emit(Opcode::IterStart);
    let top = b.current_offset();
    b.emit(Opcode::IterNext);
    let exit = b.emit_jump(Opcode::JumpIfFalse);
    b.emit_u8(Opcode::StoreLocalFast, 2);
    b.emit_u8(Opcode::LoadLocal, 0);
    b.emit_u8(Opcode::LoadLocal, 1);
    b.emit_u8(Opcode::LoadLocal, 2);
    b.emit(Opcode::MapGet);
    b.emit(Opcode::Add);
    b.emit_u8(Opcode::StoreLocalFast, 0);
    b.emit_loop(top);
    b.patch_jump(exit);
    b.emit(Opcode::Pop);
    b.emit(Opcode::IterEnd);
    b.emit_u8(Opcode::LoadLocal, 0);
    b.emit(Opcode::Return);

    assert_eq!(run_chunk(b.build_arc()), Value::Int(3));
}

// ============================================================
// Round trips
// ============================================================

#[test]
fn test_build_array_then_index() {
    for (i, expected) in [7i64, 8, 9].into_iter().enumerate() {
        let mut b = Chunk::builder("main", "main.aeg");
        b.set_local_count(1);
        b.emit_u8(Opcode::PushIntSmall, 7);
        b.emit_u8(Opcode::PushIntSmall, 8);
        b.emit_u8(Opcode::PushIntSmall, 9);
        b.emit_u16(Opcode::BuildArray, 3);
        b.emit_u8(Opcode::StoreLocalFast, 0);
        b.emit_u8(Opcode::LoadLocal, 0);
        b.emit_u8(Opcode::PushIntSmall, i as u8);
        b.emit(Opcode::Index);
        b.emit(Opcode::Return);
        assert_eq!(run_chunk(b.build_arc()), Value::Int(expected));
    }
}

#[test]
fn test_build_map_then_get() {
    for (key, expected) in [("host", 1i64), ("port", 2)] {
        let mut b = Chunk::builder("main", "main.aeg");
        b.emit_constant(Constant::Str("host".into()));
        b.emit_u8(Opcode::PushIntSmall, 1);
        b.emit_constant(Constant::Str("port".into()));
        b.emit_u8(Opcode::PushIntSmall, 2);
        b.emit_u16(Opcode::BuildMap, 2);
        b.emit_constant(Constant::Str(key.into()));
        b.emit(Opcode::MapGet);
        b.emit(Opcode::Return);
        assert_eq!(run_chunk(b.build_arc()), Value::Int(expected));
    }
}

#[test]
fn test_concat_with_empty_string_is_identity() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 7);
    b.emit_constant(Constant::Str("".into()));
    b.emit(Opcode::Concat);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::str("7"));
}

// ============================================================
// Boundary behavior
// ============================================================

#[test]
fn test_uncaught_division_by_zero() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.set_location(3, 5);
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_u8(Opcode::PushIntSmall, 0);
    b.emit(Opcode::Div);
    b.emit(Opcode::Return);

    let err = run_chunk_err(b.build_arc());
    assert_eq!(err.kind, ErrorKind::DivisionByZero);
    let location = err.location().expect("debug info present");
    assert_eq!(location.line, 3);
    assert_eq!(location.file.as_ref(), "main.aeg");
}

#[test]
fn test_array_index_at_length() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_u16(Opcode::BuildArray, 1);
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit(Opcode::Index);
    b.emit(Opcode::Return);

    assert_eq!(run_chunk_err(b.build_arc()).kind, ErrorKind::IndexOutOfRange);
}

#[test]
fn test_wrong_arity() {
    let mut fb = Chunk::builder("f", "main.aeg");
    fb.set_local_count(1);
    fb.emit_u8(Opcode::LoadLocal, 0);
    fb.emit(Opcode::Return);
    let body = fb.build_arc();

    let mut b = Chunk::builder("main", "main.aeg");
    let f = function_constant("f", 1, body);
    b.emit_constant(f);
    b.emit_u8(Opcode::Call, 0);
    b.emit(Opcode::Return);

    assert_eq!(run_chunk_err(b.build_arc()).kind, ErrorKind::ArityMismatch);
}

#[test]
fn test_stack_overflow_then_reset() {
    let mut b = Chunk::builder("main", "main.aeg");
    let top = b.current_offset();
    b.emit(Opcode::PushNil);
    b.emit_loop(top);
    let overflow = b.build_arc();

    let mut vm = Vm::with_config(
        overflow,
        VmConfig {
            max_stack: 8,
            ..VmConfig::default()
        },
    );
    let err = vm.run().expect_err("push past the limit must fail");
    assert_eq!(err.kind, ErrorKind::StackOverflow);

    // The VM is still usable after a reset.
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit(Opcode::Return);
    vm.reset(b.build_arc());
    assert_eq!(expect_done(vm.run()), Value::Int(1));
}

#[test]
fn test_call_stack_overflow() {
    // f() { return f() }
    let mut fb = Chunk::builder("f", "main.aeg");
    let name = fb.add_constant(Constant::Str("f".into()));
    fb.emit_u16(Opcode::GetGlobal, name);
    fb.emit_u8(Opcode::Call, 0);
    fb.emit(Opcode::Return);
    let body = fb.build_arc();

    let mut b = Chunk::builder("main", "main.aeg");
    let f = function_constant("f", 0, body);
    let name = b.add_constant(Constant::Str("f".into()));
    b.emit_constant(f);
    b.emit_u16(Opcode::DefineGlobal, name);
    b.emit_u16(Opcode::GetGlobal, name);
    b.emit_u8(Opcode::Call, 0);
    b.emit(Opcode::Return);

    let err = run_config_err(
        b.build_arc(),
        VmConfig {
            max_frames: 16,
            ..VmConfig::default()
        },
    );
    assert_eq!(err.kind, ErrorKind::CallStackOverflow);
}

#[test]
fn test_execution_limit() {
    let mut b = Chunk::builder("main", "main.aeg");
    let top = b.current_offset();
    b.emit(Opcode::Nop);
    b.emit_loop(top);

    let err = run_config_err(
        b.build_arc(),
        VmConfig {
            max_instructions: 1_000,
            ..VmConfig::default()
        },
    );
    assert_eq!(err.kind, ErrorKind::ExecutionLimit);
}

#[test]
fn test_iter_start_on_non_iterable() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 3);
    b.emit(Opcode::IterStart);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk_err(b.build_arc()).kind, ErrorKind::NotIterable);
}

#[test]
fn test_undefined_global_read_and_write() {
    let mut b = Chunk::builder("main", "main.aeg");
    let name = b.add_constant(Constant::Str("ghost".into()));
    b.emit_u16(Opcode::GetGlobal, name);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk_err(b.build_arc()).kind, ErrorKind::UndefinedGlobal);

    let mut b = Chunk::builder("main", "main.aeg");
    let name = b.add_constant(Constant::Str("ghost".into()));
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_u16(Opcode::SetGlobal, name);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk_err(b.build_arc()).kind, ErrorKind::UndefinedGlobal);
}

#[test]
fn test_call_non_callable() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 3);
    b.emit_u8(Opcode::Call, 0);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk_err(b.build_arc()).kind, ErrorKind::NotCallable);
}

#[test]
fn test_uncaught_throw_is_uncaught_error() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_constant(Constant::Str("credential sweep failed".into()));
    b.emit(Opcode::Throw);
    let err = run_chunk_err(b.build_arc());
    assert_eq!(err.kind, ErrorKind::UncaughtError);
    assert_eq!(err.message, "credential sweep failed");
}

// ============================================================
// Operator semantics
// ============================================================

#[test]
fn test_and_or_select_values() {
    // 0 and "x" -> 0
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 0);
    b.emit_constant(Constant::Str("x".into()));
    b.emit(Opcode::And);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::Int(0));

    // 0 or "x" -> "x"
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 0);
    b.emit_constant(Constant::Str("x".into()));
    b.emit(Opcode::Or);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::str("x"));

    // 1 and 2 -> 2
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_u8(Opcode::PushIntSmall, 2);
    b.emit(Opcode::And);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::Int(2));
}

#[test]
fn test_comparison_and_not() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 2);
    b.emit_u8(Opcode::PushIntSmall, 3);
    b.emit(Opcode::Lt);
    b.emit(Opcode::Not);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::Bool(false));
}

#[test]
fn test_eq_across_numeric_variants() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 3);
    b.emit_constant(Constant::Float(3.0));
    b.emit(Opcode::Eq);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::Bool(true));
}

#[test]
fn test_set_index() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.set_local_count(1);
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_u8(Opcode::PushIntSmall, 2);
    b.emit_u16(Opcode::BuildArray, 2);
    b.emit_u8(Opcode::StoreLocalFast, 0);
    b.emit_u8(Opcode::LoadLocal, 0);
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_u8(Opcode::PushIntSmall, 9);
    b.emit(Opcode::SetIndex);
    b.emit(Opcode::Pop);
    b.emit_u8(Opcode::LoadLocal, 0);
    b.emit(Opcode::Return);
    assert_eq!(
        run_chunk(b.build_arc()),
        Value::array(vec![Value::Int(1), Value::Int(9)])
    );
}

#[test]
fn test_string_index_and_length() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_constant(Constant::Str("héllo".into()));
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit(Opcode::Index);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::str("é"));

    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_constant(Constant::Str("héllo".into()));
    b.emit(Opcode::StrLength);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::Int(5));
}

#[test]
fn test_typeof_and_istype() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 3);
    b.emit(Opcode::TypeOf);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::str("int"));

    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 3);
    b.emit_constant(Constant::Str("int".into()));
    b.emit(Opcode::IsType);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::Bool(true));
}

#[test]
fn test_map_delete_and_keys() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.set_local_count(1);
    b.emit_constant(Constant::Str("a".into()));
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_constant(Constant::Str("b".into()));
    b.emit_u8(Opcode::PushIntSmall, 2);
    b.emit_u16(Opcode::BuildMap, 2);
    b.emit_u8(Opcode::StoreLocalFast, 0);
    b.emit_u8(Opcode::LoadLocal, 0);
    b.emit_constant(Constant::Str("a".into()));
    b.emit(Opcode::MapDelete);
    b.emit(Opcode::Pop);
    b.emit_u8(Opcode::LoadLocal, 0);
    b.emit(Opcode::MapKeys);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::array(vec![Value::str("b")]));
}

#[test]
fn test_map_set_and_values() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.set_local_count(1);
    b.emit_constant(Constant::Str("b".into()));
    b.emit_u8(Opcode::PushIntSmall, 2);
    b.emit_u16(Opcode::BuildMap, 1);
    b.emit_u8(Opcode::StoreLocalFast, 0);
    // m["a"] = 1
    b.emit_u8(Opcode::LoadLocal, 0);
    b.emit_constant(Constant::Str("a".into()));
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit(Opcode::MapSet);
    // values in sorted-key order: [1, 2]
    b.emit_u8(Opcode::LoadLocal, 0);
    b.emit(Opcode::MapValues);
    b.emit(Opcode::Return);
    assert_eq!(
        run_chunk(b.build_arc()),
        Value::array(vec![Value::Int(1), Value::Int(2)])
    );
}

#[test]
fn test_return_pushes_exactly_one_value() {
    // caller stack: [99], call f() -> 5, then Add: 104. A return that left
    // more or less than one value would corrupt the addition.
    let mut fb = Chunk::builder("f", "main.aeg");
    fb.emit_u8(Opcode::PushIntSmall, 5);
    fb.emit(Opcode::Return);
    let body = fb.build_arc();

    let mut b = Chunk::builder("main", "main.aeg");
    let f = function_constant("f", 0, body);
    b.emit_u8(Opcode::PushIntSmall, 99);
    b.emit_constant(f);
    b.emit_u8(Opcode::Call, 0);
    b.emit(Opcode::Add);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::Int(104));
}

#[test]
fn test_variadic_function_collects_rest() {
    // rest(a, ...) { return len(rest_array) + a }
    let mut fb = Chunk::builder("rest", "main.aeg");
    fb.set_local_count(2);
    fb.emit_u8(Opcode::LoadLocal, 1);
    fb.emit(Opcode::Length);
    fb.emit_u8(Opcode::LoadLocal, 0);
    fb.emit(Opcode::Add);
    fb.emit(Opcode::Return);
    let body = fb.build_arc();

    let mut b = Chunk::builder("main", "main.aeg");
    let proto = Constant::Function(Arc::new(FunctionProto {
        name: "rest".into(),
        arity: 1,
        is_vararg: true,
        chunk: body,
    }));
    b.emit_u8(Opcode::PushIntSmall, 10);
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit_u8(Opcode::PushIntSmall, 2);
    b.emit_constant(proto);
    b.emit_u8(Opcode::Call, 3);
    b.emit(Opcode::Return);
    // 10 + len([1, 2]) = 12
    assert_eq!(run_chunk(b.build_arc()), Value::Int(12));
}

#[test]
fn test_dup_and_store_local_keeps_value() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.set_local_count(1);
    b.emit_u8(Opcode::PushIntSmall, 4);
    // StoreLocal writes the slot without consuming the stack top.
    b.emit_u8(Opcode::StoreLocal, 0);
    b.emit(Opcode::Dup);
    b.emit(Opcode::Add);
    b.emit_u8(Opcode::LoadLocal, 0);
    b.emit(Opcode::Add);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::Int(12));
}

#[test]
fn test_print_pops_its_operand() {
    let mut b = Chunk::builder("main", "main.aeg");
    b.emit_u8(Opcode::PushIntSmall, 1);
    b.emit(Opcode::Dup);
    b.emit(Opcode::Print);
    b.emit(Opcode::Return);
    assert_eq!(run_chunk(b.build_arc()), Value::Int(1));
}

#[test]
fn test_deterministic_replay() {
    // Invariant: the same chunk run twice yields the same final value, map
    // key ordering included.
    let build = || {
        let mut b = Chunk::builder("main", "main.aeg");
        b.emit_constant(Constant::Str("zeta".into()));
        b.emit_u8(Opcode::PushIntSmall, 1);
        b.emit_constant(Constant::Str("alpha".into()));
        b.emit_u8(Opcode::PushIntSmall, 2);
        b.emit_constant(Constant::Str("mid".into()));
        b.emit_u8(Opcode::PushIntSmall, 3);
        b.emit_u16(Opcode::BuildMap, 3);
        b.emit(Opcode::MapKeys);
        b.emit(Opcode::Return);
        b.build_arc()
    };
    let first = run_chunk(build());
    let second = run_chunk(build());
    assert_eq!(first, second);
    assert_eq!(first.to_string(), "[alpha, mid, zeta]");
}
