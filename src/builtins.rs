// File: src/builtins.rs
//
// Built-in native functions and exception types for Canidae.
// Natives are plain Rust functions registered into the VM's globals at
// startup; scripts call them like any other function.

use crate::errors::{ErrorKind, RuntimeError};
use crate::value::{ExceptionType, NativeFn, Value};
use rand::Rng;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

/// The native function registry. A fresh set is built per VM so embedders
/// can extend the globals without sharing state across instances.
pub fn natives() -> Vec<NativeFn> {
    vec![
        NativeFn { name: "clock", arity: Some(0), function: clock },
        NativeFn { name: "len", arity: Some(1), function: len },
        NativeFn { name: "str", arity: Some(1), function: str_native },
        NativeFn { name: "type_of", arity: Some(1), function: type_of },
        NativeFn { name: "random", arity: Some(0), function: random },
    ]
}

/// The built-in exception hierarchy: every type's ancestor chain ends at
/// `Error`, so `catch (Error)` intercepts any VM-generated failure.
pub fn exception_types() -> Vec<(&'static str, Rc<ExceptionType>)> {
    let root = Rc::new(ExceptionType { name: "Error".to_string(), parent: None });
    let child = |name: &str| {
        Rc::new(ExceptionType { name: name.to_string(), parent: Some(root.clone()) })
    };
    vec![
        ("TypeError", child("TypeError")),
        ("NameError", child("NameError")),
        ("IndexError", child("IndexError")),
        ("ValueError", child("ValueError")),
        ("ImportError", child("ImportError")),
        ("Error", root),
    ]
}

/// Seconds since the Unix epoch, as a float.
fn clock(_args: &[Value]) -> Result<Value, RuntimeError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::plain(ErrorKind::Error, "System clock is unavailable."))?;
    Ok(Value::Number(now.as_secs_f64()))
}

/// Length of a string (in characters) or an array.
fn len(args: &[Value]) -> Result<Value, RuntimeError> {
    match &args[0] {
        Value::Str(s) => Ok(Value::Number(s.chars().count() as f64)),
        Value::Array(elements) => Ok(Value::Number(elements.borrow().len() as f64)),
        other => Err(RuntimeError::plain(
            ErrorKind::TypeError,
            format!("Object of type {} has no length.", other.type_name()),
        )),
    }
}

/// The print representation of any value, as a string.
fn str_native(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::string(args[0].to_string()))
}

/// The value's type name, as a string.
fn type_of(args: &[Value]) -> Result<Value, RuntimeError> {
    Ok(Value::string(args[0].type_name()))
}

/// A uniformly random float in [0, 1).
fn random(_args: &[Value]) -> Result<Value, RuntimeError> {
    let mut rng = rand::thread_rng();
    Ok(Value::Number(rng.gen::<f64>()))
}
