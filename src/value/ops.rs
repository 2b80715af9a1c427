//! Arithmetic, comparison, and coercion kernels
//!
//! Every opcode handler that combines operands delegates here, so the
//! coercion matrix has exactly one home. Kernels return `Result` and never
//! panic; the dispatch loop routes an `Err` into the try-unwind path.
//!
//! Coercion rules:
//! - `+` on two ints stays int; any float operand promotes; a string operand
//!   on either side concatenates the stringified pair; two arrays concatenate
//!   into a fresh array.
//! - `-` and `*` keep int when both operands are int, promote otherwise;
//!   `*` also repeats a string by an integer count.
//! - `/` always produces a float and rejects a zero divisor.
//! - `%` is integer remainder on two ints, f64 remainder otherwise.
//! - Ordered comparison coerces both sides to f64.
//!
//! Int arithmetic wraps on overflow: a counter that rolls over is not a
//! reason to abort the whole scan.

use std::sync::Arc;

use super::error::{ErrorKind, ErrorValue};
use super::Value;

pub type OpResult = Result<Value, ErrorValue>;

/// Numeric coercion. Only `Int` and `Float` coerce; anything else is a
/// `TypeError` (the language never implicitly numbers a string or a nil).
pub fn to_number(v: &Value) -> Result<f64, ErrorValue> {
    match v {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        other => Err(ErrorValue::type_error("number", other.type_name())),
    }
}

pub fn add(a: &Value, b: &Value) -> OpResult {
    match (a, b) {
        // A string on either side turns `+` into concatenation.
        (Value::Str(_), _) | (_, Value::Str(_)) => {
            Ok(Value::str(format!("{}{}", a, b)))
        }
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_add(*y))),
        (Value::Int(x), Value::Float(y)) => Ok(Value::Float(*x as f64 + y)),
        (Value::Float(x), Value::Int(y)) => Ok(Value::Float(x + *y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Value::Float(x + y)),
        (Value::Array(x), Value::Array(y)) => {
            let mut items = x.read().clone();
            items.extend(y.read().iter().cloned());
            Ok(Value::array(items))
        }
        _ => Err(ErrorValue::new(
            ErrorKind::TypeError,
            format!("cannot add {} and {}", a.type_name(), b.type_name()),
        )),
    }
}

pub fn sub(a: &Value, b: &Value) -> OpResult {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_sub(*y))),
        _ => Ok(Value::Float(to_number(a)? - to_number(b)?)),
    }
}

pub fn mul(a: &Value, b: &Value) -> OpResult {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_mul(*y))),
        // String repetition; a negative count yields the empty string.
        (Value::Str(s), Value::Int(n)) | (Value::Int(n), Value::Str(s)) => {
            let count = (*n).max(0) as usize;
            Ok(Value::str(s.repeat(count)))
        }
        _ => Ok(Value::Float(to_number(a)? * to_number(b)?)),
    }
}

pub fn div(a: &Value, b: &Value) -> OpResult {
    let x = to_number(a)?;
    let y = to_number(b)?;
    if y == 0.0 {
        return Err(ErrorValue::new(ErrorKind::DivisionByZero, "division by zero"));
    }
    Ok(Value::Float(x / y))
}

pub fn rem(a: &Value, b: &Value) -> OpResult {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => {
            Err(ErrorValue::new(ErrorKind::DivisionByZero, "modulo by zero"))
        }
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_rem(*y))),
        _ => {
            let x = to_number(a)?;
            let y = to_number(b)?;
            if y == 0.0 {
                return Err(ErrorValue::new(ErrorKind::DivisionByZero, "modulo by zero"));
            }
            Ok(Value::Float(x % y))
        }
    }
}

pub fn negate(a: &Value) -> OpResult {
    match a {
        Value::Int(x) => Ok(Value::Int(x.wrapping_neg())),
        Value::Float(x) => Ok(Value::Float(-x)),
        other => Err(ErrorValue::type_error("number", other.type_name())),
    }
}

/// Ordered comparison on f64-coerced operands.
fn compare(a: &Value, b: &Value) -> Result<(f64, f64), ErrorValue> {
    Ok((to_number(a)?, to_number(b)?))
}

pub fn lt(a: &Value, b: &Value) -> OpResult {
    compare(a, b).map(|(x, y)| Value::Bool(x < y))
}

pub fn lt_eq(a: &Value, b: &Value) -> OpResult {
    compare(a, b).map(|(x, y)| Value::Bool(x <= y))
}

pub fn gt(a: &Value, b: &Value) -> OpResult {
    compare(a, b).map(|(x, y)| Value::Bool(x > y))
}

pub fn gt_eq(a: &Value, b: &Value) -> OpResult {
    compare(a, b).map(|(x, y)| Value::Bool(x >= y))
}

/// Wrap a thrown value into an error payload. A thrown `Error` passes
/// through untouched; anything else is stringified into a `Custom` error.
pub fn into_error(v: Value) -> Arc<ErrorValue> {
    match v {
        Value::Error(e) => e,
        other => Arc::new(ErrorValue::new(ErrorKind::Custom, other.to_string())),
    }
}
