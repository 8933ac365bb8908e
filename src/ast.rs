// AST node types for the tree-walking Interpreter path. Built from the
// same token stream as the bytecode Compiler but shaped as a tree rather
// than flattened into a Chunk.

use std::collections::HashMap;
use std::rc::Rc;

use crate::token::TokenKind;

// Abstract over the memory-management strategy for tree nodes.
pub type Node<T> = Rc<T>;
pub type Seq<T> = Vec<T>;
// Generic in `T` so `Env<T>` can back both the runtime `Value` scope
// chain and anything else built on the same lexical-scoping machinery.
pub type AList<T> = Vec<(String, Node<T>)>;
pub type Map<T> = HashMap<String, Node<T>>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TypeTag {
    Int,
    Str,
    Bool,
    Funref,
}

impl TypeTag {
    pub fn from_keyword(kind: TokenKind) -> TypeTag {
        match kind {
            TokenKind::IntKw => TypeTag::Int,
            TokenKind::StrKw => TypeTag::Str,
            TokenKind::BoolKw => TypeTag::Bool,
            TokenKind::FunrefKw => TypeTag::Funref,
            other => unreachable!("{:?} is not a type keyword", other),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Nil,
    Int(i64),
    Bool(bool),
    Str(String),
    Id(String),
    Unary(TokenKind, Node<Expr>),
    Binary(TokenKind, Node<Expr>, Node<Expr>),
    Logical(TokenKind, Node<Expr>, Node<Expr>),
    Assign(String, Node<Expr>),
    Call(Node<Expr>, Seq<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Print(Expr),
    VarDecl(TypeTag, String, Option<Expr>),
    Block(Seq<Stmt>),
    If(Expr, Node<Stmt>, Option<Node<Stmt>>),
    While(Expr, Node<Stmt>),
    Return(Option<Expr>),
    FunDecl(Node<FunctionDecl>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Seq<(TypeTag, String)>,
    pub body: Seq<Stmt>,
}

// The query-style surface: `[Name](type arg)* { expr-or-statements }`.
// Parsed into an AST but never bound against live data --
// `Interpreter::evaluate_query` runs the body with every declared
// parameter bound to `Nil`.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryHeader {
    pub name: String,
    pub params: Seq<(TypeTag, String)>,
    pub body: QueryBody,
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryBody {
    Expr(Expr),
    Statements(Seq<Stmt>),
}
