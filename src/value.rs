// Runtime values: a tagged union, not a class hierarchy ("Sum-type
// values"). Equality, ordering, coercion and printing are exhaustive
// matches over the tag.

use std::fmt;
use std::rc::Rc;

use enumflags2::BitFlags;

use crate::ast::FunctionDecl;
use crate::chunk::CompiledFunction;
use crate::env::Env;
use crate::error::Error;
use crate::native::NativeFunction;

// One bit per Value variant, so a single RuntimeError variant can report
// "expected Int or Str, got Bool" without a combinatorial explosion of
// type-mismatch error variants.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Nil = 0b0000_0001,
    Int = 0b0000_0010,
    Bool = 0b0000_0100,
    Str = 0b0000_1000,
    Func = 0b0001_0000,
    NativeFn = 0b0010_0000,
    TreeFn = 0b0100_0000,
}

pub type TypeSet = BitFlags<TypeTag>;

// Open while the referenced stack slot is live; closed once the owning
// frame returns and the value is moved onto the heap.
#[derive(Debug)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct Closure {
    pub function: Rc<CompiledFunction>,
    pub upvalues: Vec<Rc<std::cell::RefCell<Upvalue>>>,
}

// A tree-walked function value: the declaration plus the
// environment it closed over by reference, not by value -- mutating a
// variable through one alias is visible through every other.
pub struct TreeClosure {
    pub declaration: Rc<FunctionDecl>,
    pub closed_over: Rc<Env<Value>>,
}

impl fmt::Debug for TreeClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeClosure").field("name", &self.declaration.name).finish()
    }
}

#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Int(i64),
    Bool(bool),
    Str(Rc<String>),
    Func(Rc<Closure>),
    NativeFn(Rc<NativeFunction>),
    TreeFn(Rc<TreeClosure>),
}

fn expected(expect: TypeSet, got: &Value) -> Error {
    Error::type_error(expect, got.type_tag())
}

fn type_mismatch(a: &Value, b: &Value) -> Error {
    Error::type_mismatch(a.type_tag(), b.type_tag())
}

// Parse the decimal text of a string as an i64, for the Int/Str coercion
// rule (`(42 + "0") / "23" * true == 1`).
fn parse_int(s: &str) -> Option<i64> {
    s.trim().parse::<i64>().ok()
}

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Nil => TypeTag::Nil,
            Value::Int(_) => TypeTag::Int,
            Value::Bool(_) => TypeTag::Bool,
            Value::Str(_) => TypeTag::Str,
            Value::Func(_) => TypeTag::Func,
            Value::NativeFn(_) => TypeTag::NativeFn,
            Value::TreeFn(_) => TypeTag::TreeFn,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Func(_) | Value::NativeFn(_) | Value::TreeFn(_) => true,
        }
    }

    // Booleans participate in arithmetic as true=1, false=0; a numeric
    // string coerces via its parsed value.
    fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            Value::Str(s) => parse_int(s),
            _ => None,
        }
    }

    // The canonical printed form used both by `print` and by string
    // concatenation coercion.
    pub fn display_string(&self) -> String {
        match self {
            Value::Nil => "nil".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => (**s).clone(),
            Value::Func(c) => match &c.function.name {
                Some(name) => format!("<fn {}>", name),
                None => "<fn>".to_string(),
            },
            Value::NativeFn(n) => format!("<fn {}>", n.name),
            Value::TreeFn(c) => format!("<fn {}>", c.declaration.name),
        }
    }

    pub fn add(&self, other: &Value) -> Result<Value, Error> {
        // Concatenation only when the left operand is a Str; the other
        // operand coerces to its printed form. When the left operand is
        // not a Str, a Str right operand coerces to its parsed integer
        // instead, so `(42 + "0") / "23" * true` does arithmetic throughout.
        if matches!(self, Value::Str(_)) {
            return Ok(Value::Str(Rc::new(
                self.display_string() + &other.display_string(),
            )));
        }
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => Ok(Value::Int(a + b)),
            _ => Err(type_mismatch(self, other)),
        }
    }

    fn int_binop(
        &self,
        other: &Value,
        op: impl Fn(i64, i64) -> Result<i64, Error>,
    ) -> Result<Value, Error> {
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => Ok(Value::Int(op(a, b)?)),
            _ => Err(type_mismatch(self, other)),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, Error> {
        self.int_binop(other, |a, b| Ok(a - b))
    }

    pub fn mul(&self, other: &Value) -> Result<Value, Error> {
        self.int_binop(other, |a, b| Ok(a * b))
    }

    pub fn div(&self, other: &Value) -> Result<Value, Error> {
        self.int_binop(other, |a, b| {
            if b == 0 { Err(Error::divide_by_zero()) } else { Ok(a / b) }
        })
    }

    // Truncates toward zero (Rust's `/` on i64 already does); modulo
    // follows the sign of the dividend, again matching Rust's `%`.
    pub fn modulo(&self, other: &Value) -> Result<Value, Error> {
        self.int_binop(other, |a, b| {
            if b == 0 { Err(Error::divide_by_zero()) } else { Ok(a % b) }
        })
    }

    pub fn negate(&self) -> Result<Value, Error> {
        match self.as_int() {
            Some(i) => Ok(Value::Int(-i)),
            None => Err(expected(TypeTag::Int | TypeTag::Bool | TypeTag::Str, self)),
        }
    }

    pub fn not(&self) -> Value {
        Value::Bool(!self.is_truthy())
    }

    fn cmp_binop(&self, other: &Value, op: impl Fn(i64, i64) -> bool) -> Result<Value, Error> {
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => Ok(Value::Bool(op(a, b))),
            _ => Err(type_mismatch(self, other)),
        }
    }

    pub fn less(&self, other: &Value) -> Result<Value, Error> {
        self.cmp_binop(other, |a, b| a < b)
    }

    pub fn greater(&self, other: &Value) -> Result<Value, Error> {
        self.cmp_binop(other, |a, b| a > b)
    }

    // `<=` and `>=` are lowered by the compiler to `not(a>b)`/`not(a<b)`
    // so no separate opcode or Value method is needed for them.

    // Cross-variant equality is false, except the Int/Str numeric
    // coercion described above.
    pub fn values_equal(&self, other: &Value) -> Value {
        let eq = match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Int(_), Value::Str(_)) | (Value::Str(_), Value::Int(_)) => {
                matches!((self.as_int(), other.as_int()), (Some(a), Some(b)) if a == b)
            }
            (Value::Func(a), Value::Func(b)) => Rc::ptr_eq(a, b),
            (Value::NativeFn(a), Value::NativeFn(b)) => Rc::ptr_eq(a, b),
            _ => false,
        };
        Value::Bool(eq)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_string())
    }
}
