// Error taxonomy. Three kinds -- LexError, ParseError, RuntimeError --
// each with its own `thiserror::Error` impl, joined into one `Error` for
// callers that just want a single fallible return type.

use thiserror::Error;

use crate::value::{TypeSet, TypeTag};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("[line {line}] unterminated string")]
    UnterminatedString { line: u32 },

    #[error("[line {line}] unexpected character '{character}'")]
    UnexpectedCharacter { line: u32, character: String },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("[line {line}] {message}")]
    UnexpectedToken { line: u32, message: String },

    #[error("[line {line}] invalid assignment target")]
    InvalidAssignmentTarget { line: u32 },

    #[error("[line {line}] too many constants in one chunk")]
    TooManyConstants { line: u32 },

    #[error("[line {line}] too many local variables in one function")]
    TooManyLocals { line: u32 },

    #[error("[line {line}] too many closure variables in one function")]
    TooManyUpvalues { line: u32 },

    #[error("[line {line}] floating-point literals are not supported")]
    FloatLiteralNotSupported { line: u32 },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("division by zero")]
    DivideByZero,

    #[error("type error: expected {expect:?}, got {got:?}")]
    TypeError { expect: TypeSet, got: TypeTag },

    #[error("type mismatch between {0:?} and {1:?}")]
    TypeMismatch(TypeTag, TypeTag),

    #[error("undefined variable '{0}'")]
    UndefinedGlobal(String),

    #[error("value of type {0:?} is not callable")]
    NotCallable(TypeTag),

    #[error("expected {expected} arguments but got {got}")]
    ArityMismatch { expected: u8, got: u8 },

    #[error("stack overflow")]
    StackOverflow,

    #[error("stack underflow")]
    StackUnderflow,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl Error {
    pub fn type_error(expect: TypeSet, got: TypeTag) -> Error {
        RuntimeError::TypeError { expect, got }.into()
    }

    pub fn type_mismatch(a: TypeTag, b: TypeTag) -> Error {
        RuntimeError::TypeMismatch(a, b).into()
    }

    pub fn divide_by_zero() -> Error {
        RuntimeError::DivideByZero.into()
    }
}
