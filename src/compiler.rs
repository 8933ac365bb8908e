// Pratt expression parser + recursive-descent statement parser, emitting
// bytecode directly into a Chunk in one pass -- no intermediate AST for
// this path.

use std::rc::Rc;

use log::{debug, trace};

use crate::chunk::{Chunk, CompiledFunction, OpCode, UpvalueDesc};
use crate::error::{Error, ParseError};
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};
use crate::value::Value;

#[derive(Copy, Clone, Debug, PartialEq, PartialOrd, Eq, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // . (
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler, bool) -> Result<(), ()>;

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    let (prefix, infix, precedence): (Option<ParseFn>, Option<ParseFn>, Precedence) = match kind {
        OpenParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        Plus => (None, Some(Compiler::binary), Precedence::Term),
        Divide => (None, Some(Compiler::binary), Precedence::Factor),
        Multiply => (None, Some(Compiler::binary), Precedence::Factor),
        Modulo => (None, Some(Compiler::binary), Precedence::Factor),
        Not => (Some(Compiler::unary), None, Precedence::None),
        NotEqual => (None, Some(Compiler::binary), Precedence::Equality),
        IsEqual => (None, Some(Compiler::binary), Precedence::Equality),
        GreaterThan => (None, Some(Compiler::binary), Precedence::Comparison),
        GreaterThanEqual => (None, Some(Compiler::binary), Precedence::Comparison),
        LessThan => (None, Some(Compiler::binary), Precedence::Comparison),
        LessThanEqual => (None, Some(Compiler::binary), Precedence::Comparison),
        Identifier => (Some(Compiler::variable), None, Precedence::None),
        String => (Some(Compiler::string), None, Precedence::None),
        Number => (Some(Compiler::number), None, Precedence::None),
        And => (None, Some(Compiler::and), Precedence::And),
        Or => (None, Some(Compiler::or), Precedence::Or),
        True | False => (Some(Compiler::literal), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule { prefix, infix, precedence }
}

#[derive(Clone)]
struct Local {
    name: String,
    // None while the variable's own initializer is being compiled, so a
    // reference to the name in that expression resolves to an enclosing
    // scope or global instead of the half-initialized local.
    depth: Option<u32>,
    is_captured: bool,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
}

struct FunctionCompiler {
    chunk: Chunk,
    arity: u8,
    name: Option<Rc<str>>,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: u32,
    function_type: FunctionType,
}

impl FunctionCompiler {
    fn new(function_type: FunctionType, name: Option<Rc<str>>) -> FunctionCompiler {
        // Slot 0 is reserved for the callee itself (the running closure),
        // never addressable by guest identifiers.
        let locals = vec![Local { name: String::new(), depth: Some(0), is_captured: false }];
        FunctionCompiler {
            chunk: Chunk::new(),
            arity: 0,
            name,
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
            function_type,
        }
    }
}

pub struct Compiler {
    tokens: Vec<Token>,
    current: usize,
    compilers: Vec<FunctionCompiler>,
    errors: Vec<ParseError>,
    panic_mode: bool,
}

// Compile `source` into a top-level CompiledFunction ready to be wrapped
// in a Closure and run by the VirtualMachine. Returns the first error
// encountered; a full panic-mode pass still runs internally so every
// subsequent statement-boundary error is discovered, even though only
// the first is surfaced through this `Result`.
pub fn compile(source: &str) -> Result<Rc<CompiledFunction>, Error> {
    let (tokens, all_valid) = Lexer::new(source).tokenize();
    if !all_valid {
        return Err(first_lex_error(&tokens));
    }

    let mut compiler = Compiler {
        tokens,
        current: 0,
        compilers: vec![FunctionCompiler::new(FunctionType::Script, None)],
        errors: Vec::new(),
        panic_mode: false,
    };

    while !compiler.check(TokenKind::Eof) {
        if compiler.declaration().is_err() {
            compiler.synchronize();
        }
    }

    let top = compiler.compilers.pop().unwrap();
    let function = Rc::new(CompiledFunction {
        arity: top.arity,
        name: top.name,
        chunk: top.chunk,
        upvalues: top.upvalues,
        num_locals: top.locals.len(),
    });

    debug!("compiled top-level chunk: {} bytes", function.chunk.len());

    match compiler.errors.into_iter().next() {
        Some(err) => Err(err.into()),
        None => Ok(function),
    }
}

fn first_lex_error(tokens: &[Token]) -> Error {
    let bad = tokens
        .iter()
        .find(|t| t.kind == TokenKind::Invalid)
        .expect("all_valid was false but no Invalid token found");
    if bad.lexeme.starts_with('\'') || bad.lexeme.starts_with('"') {
        crate::error::LexError::UnterminatedString { line: bad.line }.into()
    } else {
        crate::error::LexError::UnexpectedCharacter { line: bad.line, character: bad.lexeme.clone() }
            .into()
    }
}

impl Compiler {
    fn current_fn(&mut self) -> &mut FunctionCompiler {
        self.compilers.last_mut().unwrap()
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.current_fn().chunk
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    fn line(&self) -> u32 {
        self.previous().line
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) -> Token {
        if !self.check(TokenKind::Eof) {
            self.current += 1;
        }
        self.previous().clone()
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error_at(&mut self, line: u32, message: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(ParseError::UnexpectedToken { line, message: message.into() });
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<(), ()> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            let line = self.peek().line;
            self.error_at(line, message);
            Err(())
        }
    }

    // Advance to the next statement boundary after an error, so the rest
    // of the program can still be checked in the same pass.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            if matches!(self.peek_kind(), Fun | IntKw | StrKw | BoolKw | FunrefKw | If | While | For | Return | Print)
            {
                return;
            }
            self.advance();
        }
    }

    fn emit(&mut self, op: OpCode) {
        let line = self.line();
        self.chunk().write_op(op, line);
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.line();
        self.chunk().write_u8(byte, line);
    }

    fn emit_constant(&mut self, value: Value) -> Result<(), ()> {
        let line = self.line();
        match self.chunk().add_constant(value, line) {
            Ok(index) => {
                self.emit(OpCode::Constant);
                self.emit_u8(index);
                Ok(())
            }
            Err(e) => {
                self.error_at(line, e.to_string());
                Err(())
            }
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op);
        let line = self.line();
        self.chunk().write_u16(0xffff, line)
    }

    fn patch_jump(&mut self, offset: usize) -> Result<(), ()> {
        let line = self.line();
        let target = self.chunk().len();
        let distance = target - (offset + 2);
        if distance > u16::MAX as usize {
            self.error_at(line, "jump distance too large");
            return Err(());
        }
        self.chunk().patch_u16(offset, distance as u16);
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize) -> Result<(), ()> {
        self.emit(OpCode::Loop);
        let line = self.line();
        let distance = self.chunk().len() + 2 - loop_start;
        if distance > u16::MAX as usize {
            self.error_at(line, "loop body too large");
            return Err(());
        }
        self.chunk().write_u16(distance as u16, line);
        Ok(())
    }

    // ---- declarations ----

    fn declaration(&mut self) -> Result<(), ()> {
        if self.matches(TokenKind::Fun) {
            self.fun_declaration()
        } else if self.peek_kind().is_type_keyword() {
            let type_kind = self.advance().kind;
            self.var_declaration(type_kind)
        } else {
            self.statement()
        }
    }

    fn fun_declaration(&mut self) -> Result<(), ()> {
        let line = self.peek().line;
        self.consume(TokenKind::Identifier, "expected function name")?;
        let name: Rc<str> = Rc::from(self.previous().lexeme.as_str());
        let global = self.declare_or_global(name.to_string())?;
        self.mark_initialized();
        self.function(FunctionType::Function, Some(name))?;
        self.define_variable(global, line);
        Ok(())
    }

    // Pushes a fresh FunctionCompiler, compiles the parameter list and
    // body into it, then always pops it back off -- even on error -- so
    // the compiler stack stays balanced for the caller's own error
    // recovery (synchronize() only unwinds token position, not this
    // stack).
    fn function(&mut self, function_type: FunctionType, name: Option<Rc<str>>) -> Result<(), ()> {
        self.compilers.push(FunctionCompiler::new(function_type, name));
        self.begin_scope();
        let body_result = self.function_body();
        let finished = self.compilers.pop().unwrap();
        body_result?;

        let function = Rc::new(CompiledFunction {
            arity: finished.arity,
            name: finished.name,
            chunk: finished.chunk,
            upvalues: finished.upvalues.clone(),
            num_locals: finished.locals.len(),
        });
        self.emit_constant(Value::Func(Rc::new(crate::value::Closure {
            function,
            upvalues: Vec::new(),
        })))?;
        // Patch the just-emitted Constant into a Closure instruction and
        // append the upvalue descriptor pairs the VM reads at runtime.
        let chunk_len = self.chunk().len();
        self.chunk_set_u8_at(chunk_len - 2, OpCode::Closure as u8);
        for desc in &finished.upvalues {
            self.emit_u8(desc.is_local as u8);
            self.emit_u8(desc.index);
        }
        Ok(())
    }

    fn function_body(&mut self) -> Result<(), ()> {
        self.consume(TokenKind::OpenParen, "expected '(' after function name")?;
        if !self.check(TokenKind::CloseParen) {
            loop {
                if self.current_fn().arity == 255 {
                    let line = self.peek().line;
                    self.error_at(line, "too many parameters");
                } else {
                    self.current_fn().arity += 1;
                }
                if !self.peek_kind().is_type_keyword() {
                    let line = self.peek().line;
                    self.error_at(line, "expected parameter type");
                    return Err(());
                }
                self.advance();
                self.consume(TokenKind::Identifier, "expected parameter name")?;
                let param = self.previous().lexeme.clone();
                self.add_local(param)?;
                self.mark_initialized();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::CloseParen, "expected ')' after parameters")?;
        self.consume(TokenKind::OpenBrace, "expected '{' before function body")?;
        self.block()?;

        // Implicit `return nil;` if the body falls off the end.
        let line = self.line();
        self.emit(OpCode::Nil);
        self.chunk().write_op(OpCode::Return, line);
        Ok(())
    }

    fn chunk_set_u8_at(&mut self, offset: usize, byte: u8) {
        self.chunk().patch_u8(offset, byte);
    }

    fn var_declaration(&mut self, _type_kind: TokenKind) -> Result<(), ()> {
        let line = self.peek().line;
        self.consume(TokenKind::Identifier, "expected variable name")?;
        let name = self.previous().lexeme.clone();
        let global = self.declare_or_global(name)?;

        if self.matches(TokenKind::Assign) {
            self.expression()?;
        } else {
            self.emit(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after variable declaration")?;
        self.define_variable(global, line);
        Ok(())
    }

    // Declares a local (if scope_depth > 0) or returns the constant-pool
    // index of the global's name (if scope_depth == 0).
    fn declare_or_global(&mut self, name: String) -> Result<u8, ()> {
        if self.current_fn().scope_depth > 0 {
            self.add_local(name)?;
            return Ok(0);
        }
        let line = self.line();
        match self.chunk().add_constant(Value::Str(Rc::new(name)), line) {
            Ok(index) => Ok(index),
            Err(e) => {
                self.error_at(line, e.to_string());
                Err(())
            }
        }
    }

    fn add_local(&mut self, name: String) -> Result<(), ()> {
        if self.current_fn().locals.len() >= 256 {
            let line = self.line();
            if !self.panic_mode {
                self.panic_mode = true;
                self.errors.push(ParseError::TooManyLocals { line });
            }
            return Err(());
        }
        self.current_fn().locals.push(Local { name, depth: None, is_captured: false });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        let f = self.current_fn();
        if f.scope_depth == 0 {
            return;
        }
        let depth = f.scope_depth;
        if let Some(local) = f.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8, line: u32) {
        if self.current_fn().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.chunk().write_op(OpCode::DefineGlobal, line);
        self.chunk().write_u8(global, line);
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<(), ()> {
        if self.matches(TokenKind::Print) {
            self.print_statement()
        } else if self.matches(TokenKind::OpenBrace) {
            self.begin_scope();
            self.block()?;
            self.end_scope();
            Ok(())
        } else if self.matches(TokenKind::If) {
            self.if_statement()
        } else if self.matches(TokenKind::While) {
            self.while_statement()
        } else if self.matches(TokenKind::For) {
            self.for_statement()
        } else if self.matches(TokenKind::Return) {
            self.return_statement()
        } else {
            self.expression_statement()
        }
    }

    fn print_statement(&mut self) -> Result<(), ()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "expected ';' after print statement")?;
        self.emit(OpCode::Print);
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<(), ()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "expected ';' after expression")?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn block(&mut self) -> Result<(), ()> {
        while !self.check(TokenKind::CloseBrace) && !self.check(TokenKind::Eof) {
            if self.declaration().is_err() {
                self.synchronize();
            }
        }
        self.consume(TokenKind::CloseBrace, "expected '}' after block")
    }

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_fn().scope_depth -= 1;
        let depth = self.current_fn().scope_depth;
        loop {
            let should_pop = self
                .current_fn()
                .locals
                .last()
                .map_or(false, |local| local.depth.map_or(false, |d| d > depth));
            if !should_pop {
                break;
            }
            let is_captured = self.current_fn().locals.last().unwrap().is_captured;
            let op = if is_captured { OpCode::CloseUpvalue } else { OpCode::Pop };
            self.emit(op);
            self.current_fn().locals.pop();
        }
    }

    fn if_statement(&mut self) -> Result<(), ()> {
        self.consume(TokenKind::OpenParen, "expected '(' after 'if'")?;
        self.expression()?;
        self.consume(TokenKind::CloseParen, "expected ')' after condition")?;

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.statement()?;

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump)?;
        self.emit(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement()?;
        }
        self.patch_jump(else_jump)?;
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), ()> {
        let loop_start = self.chunk().len();
        self.consume(TokenKind::OpenParen, "expected '(' after 'while'")?;
        self.expression()?;
        self.consume(TokenKind::CloseParen, "expected ')' after condition")?;

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.statement()?;
        self.emit_loop(loop_start)?;

        self.patch_jump(exit_jump)?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn for_statement(&mut self) -> Result<(), ()> {
        self.begin_scope();
        self.consume(TokenKind::OpenParen, "expected '(' after 'for'")?;

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.peek_kind().is_type_keyword() {
            let type_kind = self.advance().kind;
            self.var_declaration(type_kind)?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition")?;
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit(OpCode::Pop);
        }

        if !self.check(TokenKind::CloseParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk().len();
            self.expression()?;
            self.emit(OpCode::Pop);
            self.consume(TokenKind::CloseParen, "expected ')' after for clauses")?;

            self.emit_loop(loop_start)?;
            loop_start = increment_start;
            self.patch_jump(body_jump)?;
        } else {
            self.advance(); // consume ')'
        }

        self.statement()?;
        self.emit_loop(loop_start)?;

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump)?;
            self.emit(OpCode::Pop);
        }
        self.end_scope();
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), ()> {
        if self.current_fn().function_type == FunctionType::Script {
            let line = self.line();
            self.error_at(line, "cannot return from top-level code");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit(OpCode::Nil);
            self.emit(OpCode::Return);
        } else {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "expected ';' after return value")?;
            self.emit(OpCode::Return);
        }
        Ok(())
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<(), ()> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<(), ()> {
        trace!("parse_precedence({:?}) at {:?}", precedence, self.peek().kind);
        self.advance();
        let prefix = rule(self.previous().kind).prefix;
        let prefix = match prefix {
            Some(f) => f,
            None => {
                let line = self.previous().line;
                self.error_at(line, "expected expression");
                return Err(());
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign)?;

        while precedence <= rule(self.peek_kind()).precedence {
            self.advance();
            let infix = rule(self.previous().kind).infix.unwrap();
            infix(self, can_assign)?;
        }

        if can_assign && self.matches(TokenKind::Assign) {
            let line = self.previous().line;
            if !self.panic_mode {
                self.panic_mode = true;
                self.errors.push(ParseError::InvalidAssignmentTarget { line });
            }
            return Err(());
        }
        Ok(())
    }

    fn grouping(&mut self, _can_assign: bool) -> Result<(), ()> {
        self.expression()?;
        self.consume(TokenKind::CloseParen, "expected ')' after expression")
    }

    fn unary(&mut self, _can_assign: bool) -> Result<(), ()> {
        let op = self.previous().kind;
        self.parse_precedence(Precedence::Unary)?;
        match op {
            TokenKind::Minus => self.emit(OpCode::Negate),
            TokenKind::Not => self.emit(OpCode::Not),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn binary(&mut self, _can_assign: bool) -> Result<(), ()> {
        let op = self.previous().kind;
        let next_precedence = rule(op).precedence.next();
        self.parse_precedence(next_precedence)?;
        match op {
            TokenKind::Plus => self.emit(OpCode::Add),
            TokenKind::Minus => self.emit(OpCode::Subtract),
            TokenKind::Multiply => self.emit(OpCode::Multiply),
            TokenKind::Divide => self.emit(OpCode::Divide),
            TokenKind::Modulo => self.emit(OpCode::Modulo),
            TokenKind::IsEqual => self.emit(OpCode::Equal),
            TokenKind::NotEqual => self.emit(OpCode::NotEqual),
            TokenKind::GreaterThan => self.emit(OpCode::Greater),
            TokenKind::LessThan => self.emit(OpCode::Less),
            // `<=` lowers to `not(a>b)`, `>=` to `not(a<b)`.
            TokenKind::LessThanEqual => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            TokenKind::GreaterThanEqual => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn and(&mut self, _can_assign: bool) -> Result<(), ()> {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump)
    }

    fn or(&mut self, _can_assign: bool) -> Result<(), ()> {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump)?;
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump)
    }

    fn literal(&mut self, _can_assign: bool) -> Result<(), ()> {
        match self.previous().kind {
            TokenKind::True => self.emit(OpCode::True),
            TokenKind::False => self.emit(OpCode::False),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn number(&mut self, _can_assign: bool) -> Result<(), ()> {
        let lexeme = self.previous().lexeme.clone();
        let line = self.previous().line;
        if lexeme.contains('.') {
            // Floating-point literals are rejected at parse time.
            if !self.panic_mode {
                self.panic_mode = true;
                self.errors.push(ParseError::FloatLiteralNotSupported { line });
            }
            return Err(());
        }
        match lexeme.parse::<i64>() {
            Ok(value) => self.emit_constant(Value::Int(value)),
            Err(_) => {
                self.error_at(line, "invalid integer literal");
                Err(())
            }
        }
    }

    fn string(&mut self, _can_assign: bool) -> Result<(), ()> {
        let lexeme = self.previous().lexeme.clone();
        self.emit_constant(Value::Str(Rc::new(lexeme)))
    }

    fn variable(&mut self, can_assign: bool) -> Result<(), ()> {
        let name = self.previous().lexeme.clone();
        self.named_variable(name, can_assign)
    }

    fn named_variable(&mut self, name: String, can_assign: bool) -> Result<(), ()> {
        let compiler_index = self.compilers.len() - 1;
        let (get_op, set_op, slot) = if let Some(slot) = self.resolve_local(compiler_index, &name)? {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(compiler_index, &name)? {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let line = self.line();
            let slot = match self.chunk().add_constant(Value::Str(Rc::new(name)), line) {
                Ok(index) => index,
                Err(e) => {
                    self.error_at(line, e.to_string());
                    return Err(());
                }
            };
            (OpCode::GetGlobal, OpCode::SetGlobal, slot)
        };

        if can_assign && self.matches(TokenKind::Assign) {
            self.expression()?;
            self.emit(set_op);
        } else {
            self.emit(get_op);
        }
        self.emit_u8(slot);
        Ok(())
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &str) -> Result<Option<u8>, ()> {
        let found = self.compilers[compiler_index]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, local)| (slot as u8, local.depth));

        match found {
            Some((_, None)) => {
                let line = self.line();
                self.error_at(line, "cannot read local variable in its own initializer");
                Err(())
            }
            Some((slot, Some(_))) => Ok(Some(slot)),
            None => Ok(None),
        }
    }

    // Walks the compiler chain outward, adding an upvalue descriptor to
    // every intermediate function: is_local at the first hop, then a
    // chain of upvalue-of-upvalue hops.
    fn resolve_upvalue(&mut self, compiler_index: usize, name: &str) -> Result<Option<u8>, ()> {
        if compiler_index == 0 {
            return Ok(None);
        }
        let enclosing = compiler_index - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name)? {
            self.compilers[enclosing].locals[local_slot as usize].is_captured = true;
            return self.add_upvalue(compiler_index, true, local_slot).map(Some);
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(enclosing, name)? {
            return self.add_upvalue(compiler_index, false, upvalue_slot).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, compiler_index: usize, is_local: bool, index: u8) -> Result<u8, ()> {
        for (i, existing) in self.compilers[compiler_index].upvalues.iter().enumerate() {
            if existing.is_local == is_local && existing.index == index {
                return Ok(i as u8);
            }
        }
        if self.compilers[compiler_index].upvalues.len() >= 256 {
            let line = self.line();
            if !self.panic_mode {
                self.panic_mode = true;
                self.errors.push(ParseError::TooManyUpvalues { line });
            }
            return Err(());
        }
        self.compilers[compiler_index].upvalues.push(UpvalueDesc { is_local, index });
        Ok((self.compilers[compiler_index].upvalues.len() - 1) as u8)
    }

    fn call(&mut self, _can_assign: bool) -> Result<(), ()> {
        let argc = self.argument_list()?;
        self.emit(OpCode::Call);
        self.emit_u8(argc);
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8, ()> {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::CloseParen) {
            loop {
                self.expression()?;
                if argc == 255 {
                    let line = self.line();
                    self.error_at(line, "too many arguments");
                } else {
                    argc += 1;
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::CloseParen, "expected ')' after arguments")?;
        Ok(argc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OpCode;

    fn compiled(src: &str) -> Rc<CompiledFunction> {
        compile(src).unwrap()
    }

    #[test]
    fn compiles_simple_arithmetic() {
        let f = compiled("print 1 + 2;");
        // Constant, Constant, Add, Print, Nil, Return
        assert_eq!(f.chunk.read_u8(0), OpCode::Constant as u8);
    }

    #[test]
    fn rejects_floating_point_literals() {
        let err = compile("print 42.42;").unwrap_err();
        match err {
            Error::Parse(ParseError::FloatLiteralNotSupported { .. }) => {}
            other => panic!("expected FloatLiteralNotSupported, got {:?}", other),
        }
    }

    #[test]
    fn rejects_return_at_top_level() {
        assert!(compile("return 1;").is_err());
    }

    #[test]
    fn reports_unterminated_string_as_lex_error() {
        let err = compile("print 'oops;").unwrap_err();
        assert!(matches!(err, Error::Lex(_)));
    }

    #[test]
    fn deterministic_compilation() {
        let src = "fun f(int x) { return x + 1; } print f(41);";
        let a = compile(src).unwrap();
        let b = compile(src).unwrap();
        assert_eq!(a.chunk.len(), b.chunk.len());
    }
}
