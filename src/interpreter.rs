// Tree-walking evaluator for the AST built by `parser`.
//
// This is the test harness's surface, not the primary execution path --
// the bytecode VM in `vm` is what guest programs actually run on. It
// shares `Value` and its coercion/arithmetic rules with the bytecode
// path verbatim, but walks `ast::Expr`/`ast::Stmt` directly instead of
// compiling them, and resolves names through a parent-linked `Env`
// chain instead of stack slots.

use std::rc::Rc;

use log::trace;

use crate::ast::{Expr, FunctionDecl, QueryBody, QueryHeader, Stmt};
use crate::env::Env;
use crate::error::{Error, RuntimeError};
use crate::parser;
use crate::token::TokenKind;
use crate::value::{TreeClosure, Value};

// What a statement handed back up to its caller: either "kept going" or
// "a `return` fired with this value", which unwinds through every
// enclosing block/if/while until the call boundary catches it.
enum Signal {
    Normal,
    Return(Value),
}

pub struct Interpreter {
    globals: Rc<Env<Value>>,
    output: String,
}

impl Default for Interpreter {
    fn default() -> Interpreter {
        Interpreter::new()
    }
}

impl Interpreter {
    pub fn new() -> Interpreter {
        Interpreter { globals: Rc::new(Env::root()), output: String::new() }
    }

    pub fn reset(&mut self) {
        self.globals = Rc::new(Env::root());
        self.output.clear();
    }

    // `GetOutput()` trims one trailing newline, same externally-visible
    // rule as the bytecode VM.
    pub fn get_output(&self) -> String {
        match self.output.strip_suffix('\n') {
            Some(trimmed) => trimmed.to_string(),
            None => self.output.clone(),
        }
    }

    // Evaluate a bare expression against a fresh root environment, for
    // callers that just want a single value rather than running
    // statements against a persistent VM.
    pub fn evaluate_source(&mut self, source: &str) -> Result<Value, Error> {
        let expr = parser::parse_expression(source)?;
        let globals = self.globals.clone();
        self.evaluate(&globals, &expr)
    }

    // Parse and run a whole program's statements against this
    // Interpreter's (persistent) global environment.
    pub fn execute_source(&mut self, source: &str) -> Result<(), Error> {
        let statements = parser::parse_program(source)?;
        self.execute(&statements)
    }

    pub fn execute(&mut self, statements: &[Stmt]) -> Result<(), Error> {
        let globals = self.globals.clone();
        match self.execute_block(statements, &globals)? {
            Signal::Normal | Signal::Return(_) => Ok(()),
        }
    }

    // The query header is lexed and parsed but never bound
    // against live data. Every declared parameter is bound to `Nil`,
    // which is enough to walk the body structurally without a
    // specified data-binding semantics.
    pub fn evaluate_query(&mut self, header: &QueryHeader) -> Result<Value, Error> {
        let env = Rc::new(Env::chain(&self.globals));
        for (_type_tag, name) in &header.params {
            env.define(name, &Rc::new(Value::Nil));
        }
        match &header.body {
            QueryBody::Expr(expr) => self.evaluate(&env, expr),
            QueryBody::Statements(statements) => match self.execute_block(statements, &env)? {
                Signal::Return(value) => Ok(value),
                Signal::Normal => Ok(Value::Nil),
            },
        }
    }

    fn execute_block(&mut self, statements: &[Stmt], env: &Rc<Env<Value>>) -> Result<Signal, Error> {
        for stmt in statements {
            match self.execute_stmt(stmt, env)? {
                Signal::Normal => {}
                returned @ Signal::Return(_) => return Ok(returned),
            }
        }
        Ok(Signal::Normal)
    }

    fn execute_stmt(&mut self, stmt: &Stmt, env: &Rc<Env<Value>>) -> Result<Signal, Error> {
        trace!("interpreter: executing {:?}", stmt);
        match stmt {
            Stmt::Expr(expr) => {
                self.evaluate(env, expr)?;
                Ok(Signal::Normal)
            }
            Stmt::Print(expr) => {
                let value = self.evaluate(env, expr)?;
                self.output.push_str(&value.display_string());
                self.output.push('\n');
                Ok(Signal::Normal)
            }
            Stmt::VarDecl(_type_tag, name, init) => {
                let value = match init {
                    Some(expr) => self.evaluate(env, expr)?,
                    None => Value::Nil,
                };
                env.define(name, &Rc::new(value));
                Ok(Signal::Normal)
            }
            Stmt::Block(statements) => {
                let child = Rc::new(Env::chain(env));
                self.execute_block(statements, &child)
            }
            Stmt::If(cond, then_branch, else_branch) => {
                if self.evaluate(env, cond)?.is_truthy() {
                    self.execute_stmt(then_branch, env)
                } else if let Some(else_branch) = else_branch {
                    self.execute_stmt(else_branch, env)
                } else {
                    Ok(Signal::Normal)
                }
            }
            Stmt::While(cond, body) => {
                while self.evaluate(env, cond)?.is_truthy() {
                    match self.execute_stmt(body, env)? {
                        Signal::Normal => {}
                        returned @ Signal::Return(_) => return Ok(returned),
                    }
                }
                Ok(Signal::Normal)
            }
            Stmt::Return(expr) => {
                let value = match expr {
                    Some(expr) => self.evaluate(env, expr)?,
                    None => Value::Nil,
                };
                Ok(Signal::Return(value))
            }
            Stmt::FunDecl(decl) => {
                // Captures `env` by reference, not value (mirrored
                // here): mutating a variable that another closure also
                // captured is visible through this one too.
                let closure = TreeClosure { declaration: decl.clone(), closed_over: env.clone() };
                env.define(&decl.name, &Rc::new(Value::TreeFn(Rc::new(closure))));
                Ok(Signal::Normal)
            }
        }
    }

    pub fn evaluate(&mut self, env: &Rc<Env<Value>>, expr: &Expr) -> Result<Value, Error> {
        match expr {
            Expr::Nil => Ok(Value::Nil),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Str(s) => Ok(Value::Str(Rc::new(s.clone()))),
            Expr::Id(name) => match env.get(name) {
                Some(value) => Ok((*value).clone()),
                None => Err(RuntimeError::UndefinedGlobal(name.clone()).into()),
            },
            Expr::Unary(op, operand) => {
                let value = self.evaluate(env, operand)?;
                match op {
                    TokenKind::Minus => value.negate(),
                    TokenKind::Not => Ok(value.not()),
                    other => unreachable!("{:?} is not a unary operator", other),
                }
            }
            Expr::Binary(op, left, right) => {
                let l = self.evaluate(env, left)?;
                let r = self.evaluate(env, right)?;
                self.binary(*op, &l, &r)
            }
            Expr::Logical(op, left, right) => {
                let l = self.evaluate(env, left)?;
                match op {
                    TokenKind::And if !l.is_truthy() => Ok(l),
                    TokenKind::Or if l.is_truthy() => Ok(l),
                    TokenKind::And | TokenKind::Or => self.evaluate(env, right),
                    other => unreachable!("{:?} is not a logical operator", other),
                }
            }
            Expr::Assign(name, value_expr) => {
                let value = self.evaluate(env, value_expr)?;
                if env.assign(name, &Rc::new(value.clone())) {
                    Ok(value)
                } else {
                    Err(RuntimeError::UndefinedGlobal(name.clone()).into())
                }
            }
            Expr::Call(callee, args) => {
                let callee_value = self.evaluate(env, callee)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.evaluate(env, arg)?);
                }
                self.call(callee_value, values)
            }
        }
    }

    fn binary(&mut self, op: TokenKind, l: &Value, r: &Value) -> Result<Value, Error> {
        use TokenKind::*;
        match op {
            Plus => l.add(r),
            Minus => l.sub(r),
            Multiply => l.mul(r),
            Divide => l.div(r),
            Modulo => l.modulo(r),
            IsEqual => Ok(l.values_equal(r)),
            NotEqual => Ok(Value::Bool(!l.values_equal(r).is_truthy())),
            GreaterThan => l.greater(r),
            LessThan => l.less(r),
            // Mirrors the bytecode Compiler's lowering of `<=`/`>=`
            // lowered to `not(a>b)` and `not(a<b)`.
            LessThanEqual => Ok(l.greater(r)?.not()),
            GreaterThanEqual => Ok(l.less(r)?.not()),
            other => unreachable!("{:?} is not a binary operator", other),
        }
    }

    fn call(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, Error> {
        let closure = match callee {
            Value::TreeFn(closure) => closure,
            other => return Err(RuntimeError::NotCallable(other.type_tag()).into()),
        };
        let decl: &FunctionDecl = &closure.declaration;
        if decl.params.len() != args.len() {
            return Err(RuntimeError::ArityMismatch {
                expected: decl.params.len() as u8,
                got: args.len() as u8,
            }
            .into());
        }

        let call_env = Rc::new(Env::chain(&closure.closed_over));
        for ((_type_tag, name), value) in decl.params.iter().zip(args) {
            call_env.define(name, &Rc::new(value));
        }

        match self.execute_block(&decl.body, &call_env)? {
            Signal::Return(value) => Ok(value),
            Signal::Normal => Ok(Value::Nil),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_arithmetic_with_precedence() {
        let mut interp = Interpreter::new();
        assert_eq!(interp.evaluate_source("1 + 2 * 3").unwrap().display_string(), "7");
    }

    #[test]
    fn evaluates_parenthesized_arithmetic() {
        let mut interp = Interpreter::new();
        assert_eq!(interp.evaluate_source("(42 + 1) / (2 * 3)").unwrap().display_string(), "7");
    }

    #[test]
    fn string_concatenation_coerces_operands() {
        let mut interp = Interpreter::new();
        assert_eq!(interp.evaluate_source("\"id\" + \"42\"").unwrap().display_string(), "id42");
    }

    #[test]
    fn int_str_coercion_through_mixed_arithmetic() {
        let mut interp = Interpreter::new();
        assert_eq!(interp.evaluate_source("(42 + \"0\") / \"23\" * true").unwrap().display_string(), "1");
    }

    #[test]
    fn executes_recursive_function_declarations() {
        let mut interp = Interpreter::new();
        interp
            .execute_source(
                "fun fib(int i) { if (i <= 1) return i; return fib(i - 2) + fib(i - 1); } print fib(10);",
            )
            .unwrap();
        assert_eq!(interp.get_output(), "55");
    }

    #[test]
    fn closures_capture_enclosing_scope_by_reference() {
        let mut interp = Interpreter::new();
        interp
            .execute_source(
                "fun counter() { int count = 0; fun increment() { count = count + 1; return count; } return increment; } \
                 funref inc = counter(); print inc(); print inc(); print inc();",
            )
            .unwrap();
        assert_eq!(interp.get_output(), "1\n2\n3");
    }

    #[test]
    fn for_loop_accumulates() {
        let mut interp = Interpreter::new();
        interp
            .execute_source("int sum = 0; for (int i = 0; i < 5; i = i + 1) { sum = sum + i; } print sum;")
            .unwrap();
        assert_eq!(interp.get_output(), "10");
    }

    #[test]
    fn query_header_evaluates_with_params_bound_to_nil() {
        let mut interp = Interpreter::new();
        let header = parser::parse_query_header("[By Composer](str composer){ composer }").unwrap();
        assert_eq!(interp.evaluate_query(&header).unwrap().display_string(), "nil");
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        let mut interp = Interpreter::new();
        let err = interp.evaluate_source("missing").unwrap_err();
        assert!(matches!(err, Error::Runtime(RuntimeError::UndefinedGlobal(_))));
    }
}
