// Native function registry. Host registers `(name, arity, fn)`
// before `Interpret` is called; `clock` and `square` ship as defaults.

use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use crate::error::{Error, RuntimeError};
use crate::value::Value;

pub type NativeImpl = fn(&[Value]) -> Result<Value, Error>;

pub struct NativeFunction {
    pub name: Rc<str>,
    pub arity: u8,
    pub function: NativeImpl,
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction").field("name", &self.name).field("arity", &self.arity).finish()
    }
}

fn native_clock(args: &[Value]) -> Result<Value, Error> {
    debug_assert!(args.is_empty());
    // Monotonic, not wall-clock: an epoch `Instant` captured once and
    // reused, returning elapsed nanoseconds as an integer.
    thread_local! {
        static EPOCH: Instant = Instant::now();
    }
    let nanos = EPOCH.with(|epoch| epoch.elapsed().as_nanos());
    Ok(Value::Int(nanos as i64))
}

fn native_square(args: &[Value]) -> Result<Value, Error> {
    match &args[0] {
        Value::Int(i) => Ok(Value::Int(i * i)),
        other => Err(RuntimeError::TypeMismatch(other.type_tag(), crate::value::TypeTag::Int).into()),
    }
}

// Registered natives for a fresh VirtualMachine, keyed by name for
// GetGlobal/Call resolution alongside user globals.
pub fn builtins() -> Vec<Rc<NativeFunction>> {
    vec![
        Rc::new(NativeFunction { name: Rc::from("clock"), arity: 0, function: native_clock }),
        Rc::new(NativeFunction { name: Rc::from("square"), arity: 1, function: native_square }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn square_squares_its_argument() {
        let result = native_square(&[Value::Int(7)]).unwrap();
        assert!(matches!(result, Value::Int(49)));
    }

    #[test]
    fn clock_returns_a_nonnegative_int() {
        let result = native_clock(&[]).unwrap();
        assert!(matches!(result, Value::Int(n) if n >= 0));
    }
}
